//! One worker: a slot table, a socket set and a sender/receiver thread pair.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use anyhow::{Context as _, Result, anyhow};
use dns_encoder::RequestEncoder;
use parking_lot::{Condvar, Mutex};
use transport::{QuerySocket, SocketFactory};

use crate::config::{MAX_SOCKETS, per_thread};
use crate::coordinator::RunContext;
use crate::receiver;
use crate::sender;
use crate::slots::{NUM_SLOTS, SlotTable, UNSENT};
use crate::stats::Stats;

/// State shared between a worker's sender and receiver.
pub(crate) struct WorkerShared {
    /// The slot table and everything inside it (timestamps, descs, links).
    pub table: Mutex<SlotTable>,
    /// Wakes the sender when slots come back or the run stops.
    pub cond: Condvar,
    pub socks: Vec<QuerySocket>,

    /// Live completion count, read by the sender's warmup check and the
    /// interval-stats reporter.
    pub num_completed: AtomicU64,
    pub done_sending: AtomicBool,
    /// Arrival time of the most recent response, to extend the measured run
    /// time past the coordinator's wake-up.
    pub last_recv: AtomicU64,

    pub max_outstanding: usize,
    pub max_qps: u32,
}

pub(crate) struct Worker {
    pub shared: Arc<WorkerShared>,
    sender: JoinHandle<Result<sender::SenderReport>>,
    receiver: JoinHandle<Result<receiver::ReceiverReport>>,
}

pub(crate) struct WorkerReport {
    pub stats: Stats,
    pub latency_detail: Vec<u64>,
    pub last_recv: u64,
}

impl Worker {
    /// Opens this worker's sockets and starts its thread pair. The threads
    /// block on the start gate until the coordinator opens it.
    pub fn spawn(
        ctx: &Arc<RunContext>,
        offset: u32,
        socket_offset: usize,
        factory: &SocketFactory,
        done_pipe: Arc<OwnedFd>,
    ) -> Result<Self> {
        let config = &ctx.config;

        let max_outstanding =
            per_thread(config.max_outstanding, config.threads, offset).min(NUM_SLOTS as u32);
        let max_qps = per_thread(config.max_qps, config.threads, offset);
        let nsocks = per_thread(config.clients, config.threads, offset).min(MAX_SOCKETS as u32);

        let socks = (0..nsocks as usize)
            .map(|i| factory.open(socket_offset + i))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("opening sockets for worker {offset}"))?;

        let shared = Arc::new(WorkerShared {
            table: Mutex::new(SlotTable::new()),
            cond: Condvar::new(),
            socks,
            num_completed: AtomicU64::new(0),
            done_sending: AtomicBool::new(false),
            last_recv: AtomicU64::new(0),
            max_outstanding: max_outstanding as usize,
            max_qps,
        });

        let encoder = RequestEncoder::new(config.updates)
            .with_edns(config.edns)
            .with_dnssec(config.dnssec)
            .with_tsig(config.tsig.clone())
            .with_edns_option(config.edns_option.clone());

        let receiver = std::thread::Builder::new()
            .name(format!("receiver-{offset}"))
            .spawn({
                let ctx = ctx.clone();
                let shared = shared.clone();
                move || receiver::run(&ctx, &shared)
            })
            .context("spawning receiver thread")?;

        let sender = std::thread::Builder::new()
            .name(format!("sender-{offset}"))
            .spawn({
                let ctx = ctx.clone();
                let shared = shared.clone();
                move || sender::run(&ctx, &shared, encoder, done_pipe)
            })
            .context("spawning sender thread")?;

        Ok(Self {
            shared,
            sender,
            receiver,
        })
    }

    /// Nudges a sender blocked on the in-flight cap.
    pub fn stop(&self) {
        self.shared.cond.notify_all();
    }

    pub fn join(self) -> Result<WorkerReport> {
        let sender_report = self
            .sender
            .join()
            .map_err(|_| anyhow!("sender thread panicked"))??;
        let receiver_report = self
            .receiver
            .join()
            .map_err(|_| anyhow!("receiver thread panicked"))??;

        let mut stats = receiver_report.stats;
        stats.num_sent = sender_report.num_sent;
        stats.total_request_size = sender_report.total_request_size;

        Ok(WorkerReport {
            stats,
            latency_detail: receiver_report.latency_detail,
            last_recv: self.shared.last_recv.load(Ordering::Relaxed),
        })
    }
}

/// Flushes whatever is still outstanding after an interrupt: every slot with
/// a real send timestamp counts as interrupted; acquired-but-unsent slots
/// just go back to the free list.
pub(crate) fn cancel_queries(shared: &WorkerShared) -> (u64, Vec<String>) {
    let mut table = shared.table.lock();
    let mut interrupted = 0u64;
    let mut descs = Vec::new();

    while let Some(id) = table.oldest_outstanding() {
        let unsent = table.slot(id).sent_at == UNSENT;
        let desc = table.slot_mut(id).desc.take();
        table.release_back(id);
        if unsent {
            continue;
        }
        interrupted += 1;
        if let Some(desc) = desc {
            descs.push(desc);
        }
    }

    (interrupted, descs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_table() -> WorkerShared {
        WorkerShared {
            table: Mutex::new(SlotTable::new()),
            cond: Condvar::new(),
            socks: Vec::new(),
            num_completed: AtomicU64::new(0),
            done_sending: AtomicBool::new(false),
            last_recv: AtomicU64::new(0),
            max_outstanding: 100,
            max_qps: 0,
        }
    }

    #[test]
    fn cancel_counts_only_sent_queries() {
        let shared = shared_with_table();
        {
            let mut table = shared.table.lock();
            for sent_at in [Some(10), Some(20), None] {
                let id = table.acquire().expect("free slot");
                if let Some(at) = sent_at {
                    table.slot_mut(id).sent_at = at;
                }
            }
        }

        let (interrupted, descs) = cancel_queries(&shared);

        assert_eq!(interrupted, 2);
        assert!(descs.is_empty());
        assert_eq!(shared.table.lock().outstanding_len(), 0);
        assert_eq!(shared.table.lock().unused_len(), NUM_SLOTS);
    }

    #[test]
    fn cancel_collects_descriptions() {
        let shared = shared_with_table();
        {
            let mut table = shared.table.lock();
            let id = table.acquire().expect("free slot");
            let slot = table.slot_mut(id);
            slot.sent_at = 42;
            slot.desc = Some("example.com A".to_string());
        }

        let (interrupted, descs) = cancel_queries(&shared);

        assert_eq!(interrupted, 1);
        assert_eq!(descs, vec!["example.com A".to_string()]);
    }
}
