//! Thin `poll(2)` wrappers for readiness waits.
//!
//! Every wait takes a wake descriptor (the read end of the shutdown pipe).
//! The wake byte is never consumed, only observed, so one write unblocks
//! every waiter for the rest of the run.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
    /// The wake descriptor became readable.
    Canceled,
}

/// Waits until `fd` is readable.
pub fn wait_readable(
    fd: BorrowedFd<'_>,
    wake: BorrowedFd<'_>,
    timeout: Option<Duration>,
) -> io::Result<PollOutcome> {
    wait(fd, PollFlags::POLLIN, wake, timeout)
}

/// Waits until `fd` is writable (used for in-progress stream connects).
pub fn wait_writable(
    fd: BorrowedFd<'_>,
    wake: BorrowedFd<'_>,
    timeout: Option<Duration>,
) -> io::Result<PollOutcome> {
    wait(fd, PollFlags::POLLOUT, wake, timeout)
}

fn wait(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    wake: BorrowedFd<'_>,
    timeout: Option<Duration>,
) -> io::Result<PollOutcome> {
    let mut fds = [PollFd::new(fd, events), PollFd::new(wake, PollFlags::POLLIN)];

    let n = poll_retrying(&mut fds, timeout)?;
    if n == 0 {
        return Ok(PollOutcome::TimedOut);
    }
    if fds[1].any().unwrap_or(false) {
        return Ok(PollOutcome::Canceled);
    }
    Ok(PollOutcome::Ready)
}

/// Waits until any of `fds` is readable.
pub fn wait_any_readable<'a, I, F>(
    fds: I,
    wake: BorrowedFd<'a>,
    timeout: Option<Duration>,
) -> io::Result<PollOutcome>
where
    I: IntoIterator<Item = &'a F>,
    F: AsFd + 'a,
{
    let mut poll_fds = fds
        .into_iter()
        .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLIN))
        .collect::<Vec<_>>();
    let watched = poll_fds.len();
    poll_fds.push(PollFd::new(wake, PollFlags::POLLIN));

    let n = poll_retrying(&mut poll_fds, timeout)?;
    if n == 0 {
        return Ok(PollOutcome::TimedOut);
    }
    if poll_fds[watched].any().unwrap_or(false) {
        return Ok(PollOutcome::Canceled);
    }
    Ok(PollOutcome::Ready)
}

fn poll_retrying(fds: &mut [PollFd<'_>], timeout: Option<Duration>) -> io::Result<i32> {
    let timeout = as_poll_timeout(timeout);
    loop {
        match poll(fds, timeout) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn as_poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let millis = d.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Instant;

    #[test]
    fn times_out_on_idle_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let wake = UdpSocket::bind("127.0.0.1:0").expect("bind");

        let started = Instant::now();
        let outcome = wait_readable(
            socket.as_fd(),
            wake.as_fd(),
            Some(Duration::from_millis(20)),
        )
        .expect("poll");

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn reports_readable_data() {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let wake = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let sender = UdpSocket::bind("127.0.0.1:0").expect("bind");
        sender
            .send_to(b"ping", socket.local_addr().expect("addr"))
            .expect("send");

        let outcome = wait_readable(socket.as_fd(), wake.as_fd(), Some(Duration::from_secs(2)))
            .expect("poll");

        assert_eq!(outcome, PollOutcome::Ready);
    }

    #[test]
    fn wake_descriptor_cancels_the_wait() {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let wake = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let sender = UdpSocket::bind("127.0.0.1:0").expect("bind");
        sender
            .send_to(b"x", wake.local_addr().expect("addr"))
            .expect("send");

        let outcome = wait_readable(socket.as_fd(), wake.as_fd(), Some(Duration::from_secs(2)))
            .expect("poll");

        assert_eq!(outcome, PollOutcome::Canceled);
    }
}
