//! Non-blocking DNS-over-TCP client socket.
//!
//! Connects in the background: the first readiness probes report
//! `InProgress` until the connect completes. Writes that do not fit in the
//! kernel buffer are queued inside the adapter and drained by later probes,
//! so a query handed to [`TcpSocket::send`] either fully leaves the adapter
//! or stays pending; it is never half-written from the caller's view.

use std::io::{self, Read as _, Write as _};
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::Type;

use crate::poll::{PollOutcome, wait_writable};
use crate::{Readiness, SendOutcome, frame, is_in_progress, new_socket};

const READ_CHUNK: usize = 4096;

pub struct TcpSocket {
    stream: std::net::TcpStream,
    state: Mutex<StreamState>,
}

struct StreamState {
    connected: bool,
    /// Framed bytes accepted by `send` but not yet written to the kernel.
    pending_send: Vec<u8>,
    /// Raw bytes read from the kernel, not yet split into frames.
    recv_buf: Vec<u8>,
}

impl TcpSocket {
    pub(crate) fn open(
        server: SocketAddr,
        local: Option<SocketAddr>,
        bufsize: Option<usize>,
    ) -> io::Result<Self> {
        let socket = new_socket(server, local, bufsize, Type::STREAM)?;
        socket.set_tcp_nodelay(true)?;

        let connected = match socket.connect(&server.into()) {
            Ok(()) => true,
            Err(e) if is_in_progress(&e) => false,
            Err(e) => return Err(e),
        };

        Ok(Self {
            stream: socket.into(),
            state: Mutex::new(StreamState {
                connected,
                pending_send: Vec::new(),
                recv_buf: Vec::new(),
            }),
        })
    }

    pub(crate) fn send(&self, payload: &[u8]) -> io::Result<SendOutcome> {
        let mut state = self.state.lock();
        let framed = frame::encode(payload);

        if !state.connected || !state.pending_send.is_empty() {
            state.pending_send.extend_from_slice(&framed);
            return Ok(SendOutcome::InProgress);
        }

        let mut written = 0;
        while written < framed.len() {
            match (&self.stream).write(&framed[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "server closed connection",
                    ));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    state.pending_send.extend_from_slice(&framed[written..]);
                    return Ok(SendOutcome::InProgress);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(SendOutcome::Sent(payload.len()))
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        loop {
            if let Some(n) = frame::extract(&mut state.recv_buf, buf) {
                return Ok(n);
            }

            let mut chunk = [0u8; READ_CHUNK];
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed connection",
                    ));
                }
                Ok(n) => state.recv_buf.extend_from_slice(&chunk[..n]),
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

        if !state.connected {
            match wait_writable(self.stream.as_fd(), wake, Some(timeout))? {
                PollOutcome::Ready => {
                    if let Some(e) = self.stream.take_error()? {
                        return Err(e);
                    }
                    state.connected = true;
                }
                PollOutcome::TimedOut => return Ok(Readiness::InProgress),
                PollOutcome::Canceled => return Ok(Readiness::TimedOut),
            }
        }

        if !state.pending_send.is_empty() {
            self.flush_pending(&mut state)?;
            if !state.pending_send.is_empty() {
                return Ok(Readiness::InProgress);
            }
        }

        Ok(Readiness::Ready)
    }

    fn flush_pending(&self, state: &mut StreamState) -> io::Result<()> {
        while !state.pending_send.is_empty() {
            match (&self.stream).write(&state.pending_send) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "server closed connection",
                    ));
                }
                Ok(n) => {
                    state.pending_send.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn has_buffered_frame(&self) -> bool {
        frame::has_complete(&self.state.lock().recv_buf)
    }
}

impl AsFd for TcpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;

    /// Accepts one connection and echoes every frame back unchanged.
    fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        addr
    }

    fn wait_ready(socket: &TcpSocket, wake: &std::net::UdpSocket) -> Readiness {
        for _ in 0..100 {
            let readiness = socket
                .readiness(wake.as_fd(), Duration::from_millis(100))
                .expect("readiness");
            if readiness == Readiness::Ready {
                return readiness;
            }
        }
        panic!("socket never became ready");
    }

    #[test]
    fn frames_round_trip_through_an_echo_server() {
        let addr = echo_server();
        let wake = std::net::UdpSocket::bind("127.0.0.1:0").expect("wake");

        let socket = TcpSocket::open(addr, None, None).expect("open");
        wait_ready(&socket, &wake);

        assert_eq!(socket.send(b"query-1").expect("send"), SendOutcome::Sent(7));

        let mut buf = [0u8; 64];
        let n = loop {
            match socket.recv(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    crate::poll::wait_readable(
                        socket.as_fd(),
                        wake.as_fd(),
                        Some(Duration::from_secs(2)),
                    )
                    .expect("poll");
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"query-1");
    }

    #[test]
    fn recv_before_any_response_would_block() {
        let addr = echo_server();
        let wake = std::net::UdpSocket::bind("127.0.0.1:0").expect("wake");

        let socket = TcpSocket::open(addr, None, None).expect("open");
        wait_ready(&socket, &wake);

        let mut buf = [0u8; 64];
        let err = socket.recv(&mut buf).expect_err("nothing sent yet");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(!socket.has_buffered_frame());
    }
}
