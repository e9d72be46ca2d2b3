//! Connected, non-blocking UDP client socket.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};

use socket2::Type;

use crate::{Readiness, SendOutcome, new_socket};

pub struct UdpSocket {
    socket: std::net::UdpSocket,
}

impl UdpSocket {
    pub(crate) fn open(
        server: SocketAddr,
        local: Option<SocketAddr>,
        bufsize: Option<usize>,
    ) -> io::Result<Self> {
        let socket = new_socket(server, local, bufsize, Type::DGRAM)?;
        // Connecting filters responses down to the target server and lets
        // send/recv skip the address argument.
        socket.connect(&server.into())?;

        Ok(Self {
            socket: socket.into(),
        })
    }

    pub(crate) fn send(&self, payload: &[u8]) -> io::Result<SendOutcome> {
        let sent = self.socket.send(payload)?;
        if sent == payload.len() {
            Ok(SendOutcome::Sent(sent))
        } else {
            Ok(SendOutcome::Partial {
                sent,
                expected: payload.len(),
            })
        }
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    /// A datagram socket accepts a message whenever the send buffer has
    /// room; treat it as always ready and let `send` report pressure.
    pub(crate) fn readiness(&self) -> io::Result<Readiness> {
        Ok(Readiness::Ready)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}
