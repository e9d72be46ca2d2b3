//! The per-worker receiver loop.
//!
//! Pulls responses off the socket set in small batches, correlates them with
//! outstanding slots by message id, measures latency and reclaims the slots.
//! Also the only place timeouts are detected: the tail of the outstanding
//! list is the oldest in-flight query, so one sweep from the tail finds
//! everything past the deadline.

use std::io;
use std::os::fd::AsFd as _;
use std::sync::atomic::Ordering;

use anyhow::{Context as _, Result};
use dns_encoder::{MAX_EDNS_PACKET, RCODE_LABELS};
use transport::poll;

use crate::clock::format_micros;
use crate::coordinator::{RunContext, TIMEOUT_CHECK_TIME};
use crate::slots::UNSENT;
use crate::stats::Stats;
use crate::worker::WorkerShared;

/// How many responses to gather before taking the lock once for all of them.
const RECV_BATCH_SIZE: usize = 16;

/// Upper bound on individually recorded latencies per thread; the summary
/// statistics keep counting past it.
const MAX_LATENCY_DETAIL: usize = 100_000_000;

pub(crate) struct ReceiverReport {
    pub stats: Stats,
    pub latency_detail: Vec<u64>,
}

struct Received {
    sock: usize,
    qid: u16,
    rcode: u8,
    size: usize,
    when: u64,
    sent: u64,
    desc: Option<String>,
    unexpected: bool,
    short: bool,
}

pub(crate) fn run(ctx: &RunContext, shared: &WorkerShared) -> Result<ReceiverReport> {
    ctx.start_gate.wait();

    let config = &ctx.config;
    let nsocks = shared.socks.len();
    let mut stats = Stats::default();
    let mut latency_detail = Vec::new();
    let mut buf = [0u8; MAX_EDNS_PACKET];
    let mut batch: Vec<Received> = Vec::with_capacity(RECV_BATCH_SIZE);
    let mut exhausted = vec![false; nsocks];
    let mut last_socket = 0usize;

    while !ctx.is_interrupted() {
        let now = ctx.clock.now();
        sweep_timeouts(ctx, shared, &mut stats, now);

        // Done once the sender has stopped and every reply arrived or
        // timed out.
        if shared.done_sending.load(Ordering::Acquire)
            && shared.table.lock().outstanding_len() == 0
        {
            break;
        }

        // Gather a batch without holding the lock.
        batch.clear();
        exhausted.fill(false);
        let mut saved_err: Option<io::Error> = None;
        'batch: while batch.len() < RECV_BATCH_SIZE {
            let mut received = false;
            for step in 0..nsocks {
                let idx = (step + last_socket) % nsocks;
                if exhausted[idx] {
                    continue;
                }
                match shared.socks[idx].recv(&mut buf) {
                    Ok(n) => {
                        batch.push(parse_response(ctx, idx, &buf, n));
                        last_socket = idx + 1;
                        received = true;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        exhausted[idx] = true;
                        saved_err = Some(e);
                    }
                    Err(e) => {
                        saved_err = Some(e);
                        break 'batch;
                    }
                }
            }
            if !received {
                break;
            }
        }

        // Correlate under the lock, then let the sender move again.
        {
            let mut table = shared.table.lock();
            for response in batch.iter_mut() {
                if response.short {
                    continue;
                }
                let qid = response.qid;
                if !table.is_outstanding(qid)
                    || table.slot(qid).sent_at == UNSENT
                    || table.slot(qid).sock != response.sock
                {
                    response.unexpected = true;
                    continue;
                }
                response.sent = table.slot(qid).sent_at;
                response.desc = table.slot_mut(qid).desc.take();
                table.release_back(qid);
            }
            shared.cond.notify_one();
        }

        // Everything else happens unlocked.
        for response in &batch {
            if response.short {
                tracing::warn!("received short response");
                continue;
            }
            if response.unexpected {
                tracing::warn!(
                    "received a response with an unexpected (maybe timed out) id: {}",
                    response.qid
                );
                continue;
            }

            let latency = response.when.saturating_sub(response.sent).max(1);
            if latency_detail.len() < MAX_LATENCY_DETAIL {
                latency_detail.push(latency);
            }
            if let Some(desc) = &response.desc {
                println!(
                    "> {} {} {}",
                    RCODE_LABELS[response.rcode as usize],
                    desc,
                    format_micros(latency)
                );
            }

            stats.record_latency(latency);
            stats.total_response_size += response.size as u64;
            stats.rcode_counts[response.rcode as usize] += 1;
            shared.num_completed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(last) = batch.last() {
            shared.last_recv.store(last.when, Ordering::Relaxed);
        }

        // A short batch means the sockets ran dry or broke.
        if batch.len() < RECV_BATCH_SIZE {
            match saved_err {
                Some(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Some(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_for_traffic(ctx, shared)?;
                }
                Some(e) => {
                    // Receive failures are fatal for the whole run.
                    ctx.set_interrupted();
                    shared.cond.notify_all();
                    return Err(e).context("failed to receive packet");
                }
                None => {}
            }
        }
    }

    Ok(ReceiverReport {
        stats,
        latency_detail,
    })
}

fn parse_response(ctx: &RunContext, sock: usize, buf: &[u8], len: usize) -> Received {
    let short = len < 4;
    Received {
        sock,
        qid: if short { 0 } else { u16::from_be_bytes([buf[0], buf[1]]) },
        rcode: if short { 0 } else { buf[3] & 0x0F },
        size: len,
        when: ctx.clock.now(),
        sent: 0,
        desc: None,
        unexpected: false,
        short,
    }
}

/// Moves every expired query from the outstanding tail back to the free
/// list. Slots still in the acquired-but-unsent state stop the sweep; they
/// carry the timestamp sentinel, which can never be past the deadline.
fn sweep_timeouts(ctx: &RunContext, shared: &WorkerShared, stats: &mut Stats, now: u64) {
    let timeout = ctx.config.timeout_us;
    let mut expired: Vec<(u16, Option<String>)> = Vec::new();

    {
        let mut table = shared.table.lock();
        while let Some(id) = table.oldest_outstanding() {
            let sent_at = table.slot(id).sent_at;
            if sent_at > now || now - sent_at < timeout {
                break;
            }
            let desc = table.slot_mut(id).desc.take();
            table.release_back(id);
            stats.num_timed_out += 1;
            expired.push((id, desc));
        }
        if !expired.is_empty() {
            shared.cond.notify_one();
        }
    }

    for (id, desc) in expired {
        match desc {
            Some(desc) => println!("> T {desc}"),
            None => println!(
                "[Timeout] {} timed out: msg id {id}",
                if ctx.config.updates { "Update" } else { "Query" }
            ),
        }
    }
}

/// Blocks until any socket (or the shutdown pipe) has something for us,
/// bounded by the timeout-check interval. Skipped entirely when a stream
/// adapter already holds a decoded response.
fn wait_for_traffic(ctx: &RunContext, shared: &WorkerShared) -> Result<()> {
    if shared.socks.iter().any(|s| s.has_buffered_frame()) {
        return Ok(());
    }

    poll::wait_any_readable(
        shared.socks.iter(),
        ctx.thread_wake.as_fd(),
        Some(TIMEOUT_CHECK_TIME),
    )
    .context("waiting for socket readability")?;

    Ok(())
}
