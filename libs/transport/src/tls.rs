//! DNS-over-TLS client socket: the TCP adapter's framing beneath a rustls
//! session.
//!
//! The readiness probe drives the TCP connect and the TLS handshake,
//! reporting `InProgress` until both complete. Certificates are not
//! verified: this tool measures servers it was pointed at, it does not
//! authenticate them.

use std::io::{self, Read as _, Write as _};
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::ClientConnection;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use socket2::Type;

use crate::poll::{PollOutcome, wait_readable, wait_writable};
use crate::{Readiness, SendOutcome, frame, is_in_progress, new_socket};

const READ_CHUNK: usize = 4096;

pub struct TlsSocket {
    stream: std::net::TcpStream,
    state: Mutex<TlsState>,
}

struct TlsState {
    conn: ClientConnection,
    tcp_connected: bool,
    /// Deframed plaintext responses, not yet handed to the caller.
    recv_buf: Vec<u8>,
}

impl TlsSocket {
    pub(crate) fn open(
        server: SocketAddr,
        local: Option<SocketAddr>,
        bufsize: Option<usize>,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> io::Result<Self> {
        let socket = new_socket(server, local, bufsize, Type::STREAM)?;
        socket.set_tcp_nodelay(true)?;

        let tcp_connected = match socket.connect(&server.into()) {
            Ok(()) => true,
            Err(e) if is_in_progress(&e) => false,
            Err(e) => return Err(e),
        };

        let mut conn = ClientConnection::new(config, server_name).map_err(io::Error::other)?;
        // Queries are tiny; let rustls buffer whatever the sender produces
        // while the handshake is still running.
        conn.set_buffer_limit(None);

        Ok(Self {
            stream: socket.into(),
            state: Mutex::new(TlsState {
                conn,
                tcp_connected,
                recv_buf: Vec::new(),
            }),
        })
    }

    pub(crate) fn send(&self, payload: &[u8]) -> io::Result<SendOutcome> {
        let mut state = self.state.lock();
        let framed = frame::encode(payload);

        state.conn.writer().write_all(&framed)?;

        if !state.tcp_connected || state.conn.is_handshaking() {
            return Ok(SendOutcome::InProgress);
        }

        if self.flush_tls(&mut state)? {
            Ok(SendOutcome::Sent(payload.len()))
        } else {
            Ok(SendOutcome::InProgress)
        }
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        loop {
            if let Some(n) = frame::extract(&mut state.recv_buf, buf) {
                return Ok(n);
            }

            // Drain decrypted plaintext first.
            let mut chunk = [0u8; READ_CHUNK];
            match state.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed TLS stream",
                    ));
                }
                Ok(n) => {
                    state.recv_buf.extend_from_slice(&chunk[..n]);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            // Pull more TLS records off the socket.
            match state.conn.read_tls(&mut (&self.stream)) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed connection",
                    ));
                }
                Ok(_) => {
                    state
                        .conn
                        .process_new_packets()
                        .map_err(io::Error::other)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn readiness(
        &self,
        wake: BorrowedFd<'_>,
        timeout: Duration,
    ) -> io::Result<Readiness> {
        let mut state = self.state.lock();

        if !state.tcp_connected {
            match wait_writable(self.stream.as_fd(), wake, Some(timeout))? {
                PollOutcome::Ready => {
                    if let Some(e) = self.stream.take_error()? {
                        return Err(e);
                    }
                    state.tcp_connected = true;
                }
                PollOutcome::TimedOut => return Ok(Readiness::InProgress),
                PollOutcome::Canceled => return Ok(Readiness::TimedOut),
            }
        }

        if state.conn.is_handshaking() {
            match self.drive_handshake(&mut state, wake, timeout)? {
                Readiness::Ready => {}
                pending => return Ok(pending),
            }
        }

        if !self.flush_tls(&mut state)? {
            return Ok(Readiness::InProgress);
        }

        Ok(Readiness::Ready)
    }

    /// One bounded attempt to make handshake progress.
    fn drive_handshake(
        &self,
        state: &mut TlsState,
        wake: BorrowedFd<'_>,
        timeout: Duration,
    ) -> io::Result<Readiness> {
        loop {
            let mut io = &self.stream;
            match state.conn.complete_io(&mut io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let outcome = if state.conn.wants_write() {
                        wait_writable(self.stream.as_fd(), wake, Some(timeout))?
                    } else {
                        wait_readable(self.stream.as_fd(), wake, Some(timeout))?
                    };
                    match outcome {
                        PollOutcome::Ready => continue,
                        PollOutcome::TimedOut => return Ok(Readiness::InProgress),
                        PollOutcome::Canceled => return Ok(Readiness::TimedOut),
                    }
                }
                Err(e) => return Err(e),
            }

            if !state.conn.is_handshaking() {
                return Ok(Readiness::Ready);
            }
        }
    }

    /// Writes buffered TLS records out. Returns `true` when nothing is left.
    fn flush_tls(&self, state: &mut TlsState) -> io::Result<bool> {
        while state.conn.wants_write() {
            match state.conn.write_tls(&mut (&self.stream)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub(crate) fn has_buffered_frame(&self) -> bool {
        frame::has_complete(&self.state.lock().recv_buf)
    }
}

impl AsFd for TlsSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// Accept-everything certificate verifier.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub(crate) fn client_config() -> io::Result<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
        .with_no_client_auth();

    Ok(Arc::new(config))
}
