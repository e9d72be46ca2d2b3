//! End-to-end engine runs against loopback UDP servers.

use std::io::Write as _;
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;

use dns_loadgen::config::Config;
use dns_loadgen::coordinator;
use dns_loadgen::stats::StopReason;

/// Replies to every query with the same bytes, QR bit set (RCODE NOERROR).
fn spawn_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind echo server");
    let addr = socket.local_addr().expect("server addr");

    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf) {
            if n >= 3 {
                buf[2] |= 0x80;
            }
            let _ = socket.send_to(&buf[..n], peer);
        }
    });

    addr
}

/// Swallows every query without answering.
fn spawn_sink_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind sink server");
    let addr = socket.local_addr().expect("server addr");

    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while socket.recv_from(&mut buf).is_ok() {}
    });

    addr
}

fn write_datafile(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create datafile");
    file.write_all(contents.as_bytes()).expect("write datafile");
    file.flush().expect("flush datafile");
    file
}

fn config_for(server: SocketAddr, datafile: &Path) -> Config {
    Config {
        server_addr: server,
        server_name: server.ip().to_string(),
        datafile: Some(datafile.to_path_buf()),
        ..Config::default()
    }
}

#[test]
fn echoed_queries_all_complete() {
    let server = spawn_echo_server();
    let datafile = write_datafile("example.com A\nexample.net AAAA\nexample.org NS\n");

    let report = coordinator::run(Config {
        maxruns: 5,
        max_outstanding: 10,
        ..config_for(server, datafile.path())
    })
    .expect("run");

    let stats = &report.stats;
    assert_eq!(stats.num_sent, 15);
    assert_eq!(stats.num_completed, 15);
    assert_eq!(stats.num_timed_out, 0);
    assert_eq!(stats.num_interrupted, 0);
    assert_eq!(stats.rcode_counts[0], 15);
    assert_eq!(stats.rcode_counts.iter().sum::<u64>(), stats.num_completed);
    assert_eq!(report.reason, StopReason::EndOfFile);

    // Every latency was recorded individually, inside the aggregate bounds.
    let recorded: Vec<u64> = report.latency_details.iter().flatten().copied().collect();
    assert_eq!(recorded.len(), 15);
    for latency in recorded {
        assert!(latency > 0);
        assert!(latency >= stats.latency_min);
        assert!(latency <= stats.latency_max);
    }
}

#[test]
fn unanswered_queries_time_out() {
    let server = spawn_sink_server();
    let datafile = write_datafile("example.com A\nexample.net A\nexample.org A\n");

    let report = coordinator::run(Config {
        timeout_us: 150_000,
        ..config_for(server, datafile.path())
    })
    .expect("run");

    let stats = &report.stats;
    assert_eq!(stats.num_sent, 3);
    assert_eq!(stats.num_completed, 0);
    assert_eq!(stats.num_timed_out, 3);
    assert_eq!(
        stats.num_sent,
        stats.num_completed + stats.num_timed_out + stats.num_interrupted
    );
    assert_eq!(report.reason, StopReason::EndOfFile);
    assert!(report.latency_details.iter().all(|d| d.is_empty()));
}

#[test]
fn qps_cap_bounds_the_send_rate() {
    let server = spawn_echo_server();
    let datafile = write_datafile("example.com A\nexample.net A\nexample.org A\n");

    let report = coordinator::run(Config {
        maxruns: 0,
        timelimit_us: 500_000,
        max_qps: 50,
        ..config_for(server, datafile.path())
    })
    .expect("run");

    let stats = &report.stats;
    assert_eq!(report.reason, StopReason::TimeLimit);
    // The limiter never lets the send count run ahead of qps * elapsed;
    // the generous ceiling absorbs join slack on slow machines.
    assert!(stats.num_sent >= 5, "sent only {}", stats.num_sent);
    assert!(stats.num_sent <= 50, "sent {}", stats.num_sent);
    assert_eq!(
        stats.num_sent,
        stats.num_completed + stats.num_timed_out + stats.num_interrupted
    );
}

/// Echoes every other response with a clobbered message id.
fn spawn_scrambling_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind scrambling server");
    let addr = socket.local_addr().expect("server addr");

    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut scramble = false;
        while let Ok((n, peer)) = socket.recv_from(&mut buf) {
            if n >= 3 {
                buf[2] |= 0x80;
            }
            if scramble && n >= 2 {
                buf[0] ^= 0xFF;
                buf[1] ^= 0xFF;
            }
            scramble = !scramble;
            let _ = socket.send_to(&buf[..n], peer);
        }
    });

    addr
}

#[test]
fn responses_with_unknown_ids_are_discarded_without_leaking_slots() {
    let server = spawn_scrambling_server();
    let datafile = write_datafile("a.example A\nb.example A\nc.example A\nd.example A\n");

    let report = coordinator::run(Config {
        timeout_us: 200_000,
        ..config_for(server, datafile.path())
    })
    .expect("run");

    let stats = &report.stats;
    assert_eq!(stats.num_sent, 4);
    assert_eq!(stats.num_completed, 2);
    assert_eq!(stats.num_timed_out, 2);
    assert_eq!(
        stats.num_sent,
        stats.num_completed + stats.num_timed_out + stats.num_interrupted
    );
}

#[test]
fn two_workers_split_the_run() {
    let server = spawn_echo_server();
    let datafile = write_datafile("example.com A\nexample.net A\n");

    let report = coordinator::run(Config {
        threads: 2,
        clients: 2,
        maxruns: 10,
        ..config_for(server, datafile.path())
    })
    .expect("run");

    let stats = &report.stats;
    assert_eq!(stats.num_sent, 20);
    assert_eq!(stats.num_completed, 20);
    assert_eq!(report.latency_details.len(), 2);
    assert_eq!(
        report
            .latency_details
            .iter()
            .map(|d| d.len() as u64)
            .sum::<u64>(),
        20
    );
}
