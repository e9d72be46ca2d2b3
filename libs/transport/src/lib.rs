//! Transport adapters for the load generator.
//!
//! Each client socket is a [`QuerySocket`]: a non-blocking UDP, TCP or
//! TLS-over-TCP connection to the target server. The measurement loops use a
//! uniform interface: [`QuerySocket::send`] transmits one encoded message,
//! [`QuerySocket::recv`] yields one whole response or `WouldBlock`, and
//! [`QuerySocket::readiness`] reports whether the socket can take another
//! message right now. Readiness probes accept a wake descriptor so a global
//! shutdown can abort them early.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use socket2::{Domain, Protocol, Socket, Type};

mod frame;
pub mod poll;
mod tcp;
mod tls;
mod udp;

pub use tcp::TcpSocket;
pub use tls::TlsSocket;
pub use udp::UdpSocket;

/// Transport selection from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Udp,
    Tcp,
    Tls,
}

impl Mode {
    pub fn default_port(self) -> u16 {
        match self {
            Mode::Udp | Mode::Tcp => 53,
            Mode::Tls => 853,
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Mode::Udp),
            "tcp" => Ok(Mode::Tcp),
            "tls" => Ok(Mode::Tls),
            other => Err(format!("unknown transport mode `{other}`")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Udp => f.write_str("udp"),
            Mode::Tcp => f.write_str("tcp"),
            Mode::Tls => f.write_str("tls"),
        }
    }
}

/// Whether a socket can take another message right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not ready within the probe timeout; try another socket.
    TimedOut,
    /// A connect, handshake or buffered write is still pending. The socket
    /// must be drained before the sender exits.
    InProgress,
}

/// Result of handing one message to a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The whole message left the adapter; `usize` is the message length.
    Sent(usize),
    /// A stream transport buffered some or all of the message. The query
    /// stays outstanding; the readiness probe completes the write.
    InProgress,
    /// A datagram transport truncated the message.
    Partial { sent: usize, expected: usize },
}

/// Opens the per-worker client sockets.
///
/// The factory owns everything that is identical across sockets: target
/// address, TLS client configuration and the local bind template. Socket `k`
/// (numbered globally across workers) binds `local_port + k` when a local
/// port was requested, so every client gets a distinct source port even with
/// an explicit `-x`.
pub struct SocketFactory {
    mode: Mode,
    server: SocketAddr,
    local: Option<SocketAddr>,
    bufsize: Option<usize>,
    tls: Option<TlsSetup>,
}

struct TlsSetup {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

impl SocketFactory {
    pub fn new(
        mode: Mode,
        server: SocketAddr,
        server_name: &str,
        local: Option<SocketAddr>,
        bufsize: Option<usize>,
    ) -> io::Result<Self> {
        let tls = match mode {
            Mode::Tls => Some(TlsSetup {
                config: tls::client_config()?,
                server_name: ServerName::try_from(server_name.to_string())
                    .map_err(io::Error::other)?,
            }),
            Mode::Udp | Mode::Tcp => None,
        };

        Ok(Self {
            mode,
            server,
            local,
            bufsize,
            tls,
        })
    }

    pub fn open(&self, index: usize) -> io::Result<QuerySocket> {
        let local = self.local.map(|mut addr| {
            if addr.port() != 0 {
                addr.set_port(addr.port().wrapping_add(index as u16));
            }
            addr
        });

        let socket = match self.mode {
            Mode::Udp => {
                QuerySocket::Udp(UdpSocket::open(self.server, local, self.bufsize)?)
            }
            Mode::Tcp => {
                QuerySocket::Tcp(TcpSocket::open(self.server, local, self.bufsize)?)
            }
            Mode::Tls => {
                let setup = self
                    .tls
                    .as_ref()
                    .ok_or_else(|| io::Error::other("TLS configuration missing"))?;
                QuerySocket::Tls(TlsSocket::open(
                    self.server,
                    local,
                    self.bufsize,
                    setup.config.clone(),
                    setup.server_name.clone(),
                )?)
            }
        };

        Ok(socket)
    }
}

/// One client socket, usable concurrently from the sender and receiver
/// threads of a worker.
pub enum QuerySocket {
    Udp(UdpSocket),
    Tcp(TcpSocket),
    Tls(TlsSocket),
}

impl QuerySocket {
    /// Transmits one encoded message.
    pub fn send(&self, payload: &[u8]) -> io::Result<SendOutcome> {
        match self {
            QuerySocket::Udp(s) => s.send(payload),
            QuerySocket::Tcp(s) => s.send(payload),
            QuerySocket::Tls(s) => s.send(payload),
        }
    }

    /// Receives one whole response into `buf`, or fails with `WouldBlock`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            QuerySocket::Udp(s) => s.recv(buf),
            QuerySocket::Tcp(s) => s.recv(buf),
            QuerySocket::Tls(s) => s.recv(buf),
        }
    }

    /// Probes whether the socket can take another message, waiting up to
    /// `timeout`. A byte on `wake` aborts the probe.
    pub fn readiness(&self, wake: BorrowedFd<'_>, timeout: Duration) -> io::Result<Readiness> {
        match self {
            QuerySocket::Udp(s) => s.readiness(),
            QuerySocket::Tcp(s) => s.readiness(wake, timeout),
            QuerySocket::Tls(s) => s.readiness(wake, timeout),
        }
    }

    /// A complete response is already buffered inside the adapter, so a
    /// readability wait on the file descriptor would sleep through it.
    pub fn has_buffered_frame(&self) -> bool {
        match self {
            QuerySocket::Udp(_) => false,
            QuerySocket::Tcp(s) => s.has_buffered_frame(),
            QuerySocket::Tls(s) => s.has_buffered_frame(),
        }
    }
}

impl AsFd for QuerySocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            QuerySocket::Udp(s) => s.as_fd(),
            QuerySocket::Tcp(s) => s.as_fd(),
            QuerySocket::Tls(s) => s.as_fd(),
        }
    }
}

/// Shared socket construction: non-blocking, buffer sizes, local bind.
fn new_socket(
    server: SocketAddr,
    local: Option<SocketAddr>,
    bufsize: Option<usize>,
    kind: Type,
) -> io::Result<Socket> {
    let domain = Domain::for_address(server);
    let protocol = match kind {
        t if t == Type::DGRAM => Protocol::UDP,
        _ => Protocol::TCP,
    };
    let socket = Socket::new(domain, kind, Some(protocol))?;
    socket.set_nonblocking(true)?;

    if let Some(bufsize) = bufsize {
        socket.set_recv_buffer_size(bufsize)?;
        socket.set_send_buffer_size(bufsize)?;
    }

    if let Some(local) = local {
        socket.bind(&local.into())?;
    }

    tracing::trace!(server = %server, ?local, "Created socket");

    Ok(socket)
}

pub(crate) fn is_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(nix::errno::Errno::EINPROGRESS as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes() {
        assert_eq!("udp".parse::<Mode>(), Ok(Mode::Udp));
        assert_eq!("tcp".parse::<Mode>(), Ok(Mode::Tcp));
        assert_eq!("tls".parse::<Mode>(), Ok(Mode::Tls));
        assert!("doh".parse::<Mode>().is_err());
    }

    #[test]
    fn default_ports_follow_transport() {
        assert_eq!(Mode::Udp.default_port(), 53);
        assert_eq!(Mode::Tcp.default_port(), 53);
        assert_eq!(Mode::Tls.default_port(), 853);
    }
}
