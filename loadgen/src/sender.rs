//! The per-worker sender loop.
//!
//! Paces transmissions against the per-thread QPS quota and in-flight cap,
//! acquires a slot (whose index becomes the DNS message id), picks a ready
//! socket round-robin, encodes the next input record and sends it.

use std::os::fd::{AsFd as _, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use datafile::ReadError;
use dns_encoder::RequestEncoder;
use transport::{Readiness, SendOutcome};

use crate::clock::MICROS_PER_SEC;
use crate::coordinator::{RunContext, TIMEOUT_CHECK_TIME};
use crate::worker::WorkerShared;

#[derive(Debug, Default)]
pub(crate) struct SenderReport {
    pub num_sent: u64,
    pub total_request_size: u64,
}

pub(crate) fn run(
    ctx: &RunContext,
    shared: &WorkerShared,
    encoder: RequestEncoder,
    done_pipe: Arc<OwnedFd>,
) -> Result<SenderReport> {
    ctx.start_gate.wait();

    let mut report = SenderReport::default();
    let result = send_loop(ctx, shared, &encoder, &mut report);
    if result.is_err() {
        // A sender-fatal error takes the whole run down.
        ctx.set_interrupted();
    }

    shared.done_sending.store(true, Ordering::Release);
    if let Err(e) = nix::unistd::write(&*done_pipe, b"x") {
        tracing::warn!("failed to signal sender completion: {e}");
    }

    result.map(|()| report)
}

fn send_loop(
    ctx: &RunContext,
    shared: &WorkerShared,
    encoder: &RequestEncoder,
    report: &mut SenderReport,
) -> Result<()> {
    let config = &ctx.config;
    let times = ctx.times();
    let nsocks = shared.socks.len();
    let mut current_sock = 0usize;
    let mut any_in_progress = false;
    let mut now = ctx.clock.now();

    while !ctx.is_interrupted() && now < times.stop_us {
        // Soften the cold start: while still filling the in-flight window,
        // pause briefly on every other query.
        if report.num_sent < shared.max_outstanding as u64 && report.num_sent % 2 == 1 {
            if shared.num_completed.load(Ordering::Relaxed) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                std::thread::yield_now();
            }
            now = ctx.clock.now();
        }

        // Rate limiting: the send count may not run ahead of the wall clock.
        if shared.max_qps > 0 {
            let run_time = now - times.start_us;
            let required = (MICROS_PER_SEC * report.num_sent) / u64::from(shared.max_qps);
            if required > run_time {
                std::thread::sleep(Duration::from_micros(required - run_time));
                now = ctx.clock.now();
                continue;
            }
        }

        let mut table = shared.table.lock();

        if table.outstanding_len() >= shared.max_outstanding {
            match times.deadline {
                Some(deadline) => {
                    let _ = shared.cond.wait_until(&mut table, deadline);
                }
                None => shared.cond.wait(&mut table),
            }
            drop(table);
            now = ctx.clock.now();
            continue;
        }

        let Some(qid) = table.acquire() else {
            drop(table);
            now = ctx.clock.now();
            continue;
        };

        // Round-robin over the sockets, giving stream transports up to two
        // laps to finish connecting or flush a pending write.
        let mut chosen = None;
        for _ in 0..2 * nsocks {
            let idx = current_sock % nsocks;
            current_sock = current_sock.wrapping_add(1);
            match shared.socks[idx].readiness(ctx.thread_wake.as_fd(), TIMEOUT_CHECK_TIME) {
                Ok(Readiness::Ready) => {
                    chosen = Some(idx);
                    break;
                }
                Ok(Readiness::InProgress) => any_in_progress = true,
                Ok(Readiness::TimedOut) => {
                    if config.verbose {
                        tracing::warn!("socket {idx} not ready");
                    }
                }
                Err(e) => tracing::warn!("socket {idx} readiness probe failed: {e}"),
            }
        }

        let Some(sock_index) = chosen else {
            table.release_front(qid);
            drop(table);
            now = ctx.clock.now();
            continue;
        };
        table.slot_mut(qid).sock = sock_index;
        drop(table);

        let record = match ctx.input.next(config.updates) {
            Ok(record) => record,
            Err(ReadError::EndOfData) => {
                shared.table.lock().release_front(qid);
                break;
            }
            Err(ReadError::InvalidFile) => {
                shared.table.lock().release_front(qid);
                return Err(anyhow!("input file contains no data"));
            }
            Err(ReadError::Io(e)) => {
                shared.table.lock().release_front(qid);
                return Err(e).context("reading input data");
            }
        };

        let message = match encoder.encode(&record, qid) {
            Ok(message) => message,
            Err(e) => {
                if config.verbose {
                    tracing::warn!("failed to encode `{record}`: {e}");
                }
                shared.table.lock().release_front(qid);
                now = ctx.clock.now();
                continue;
            }
        };

        now = ctx.clock.now();
        {
            let mut table = shared.table.lock();
            let slot = table.slot_mut(qid);
            slot.sent_at = now;
            if config.verbose {
                slot.desc = Some(record.clone());
            }
        }

        match shared.socks[sock_index].send(&message) {
            Ok(SendOutcome::Sent(len)) => {
                report.num_sent += 1;
                report.total_request_size += len as u64;
            }
            Ok(SendOutcome::InProgress) => {
                // A reply is still possible once the write completes, so the
                // query stays outstanding.
                if config.verbose {
                    tracing::warn!("network congested, packet sending in progress");
                }
                any_in_progress = true;
                report.num_sent += 1;
                report.total_request_size += message.len() as u64;
            }
            Ok(SendOutcome::Partial { sent, expected }) => {
                tracing::warn!("failed to send full packet: only sent {sent} of {expected}");
                shared.table.lock().release_front(qid);
            }
            Err(e) => {
                tracing::warn!("failed to send packet: {e}");
                shared.table.lock().release_front(qid);
            }
        }
    }

    // Drain sockets with writes still in flight so nothing is torn down
    // under a half-written query.
    while any_in_progress {
        any_in_progress = false;
        for sock in &shared.socks {
            if matches!(
                sock.readiness(ctx.thread_wake.as_fd(), TIMEOUT_CHECK_TIME),
                Ok(Readiness::InProgress)
            ) {
                any_in_progress = true;
            }
        }
    }

    Ok(())
}
