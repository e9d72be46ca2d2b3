//! Run orchestration: spawns the worker thread pairs, owns the stop
//! conditions (time limit, input exhaustion, SIGINT), joins everything and
//! aggregates the per-thread results.

use std::os::fd::{AsFd as _, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use datafile::Datafile;
use parking_lot::{Condvar, Mutex};
use transport::SocketFactory;
use transport::poll::{self, PollOutcome};

use crate::clock::Clock;
use crate::config::Config;
use crate::stats::{self, RunReport, Stats, StopReason};
use crate::worker::{self, Worker, WorkerShared};

/// Ceiling on every bounded readiness or readability wait. A global
/// shutdown is never delayed by more than this.
pub(crate) const TIMEOUT_CHECK_TIME: Duration = Duration::from_millis(100);

/// Run timing, fixed once just before the start gate opens.
pub(crate) struct Times {
    pub start_us: u64,
    /// `u64::MAX` without a time limit.
    pub stop_us: u64,
    /// Condvar-deadline form of `stop_us`; `None` without a time limit.
    pub deadline: Option<Instant>,
}

/// Holds every worker thread until the coordinator releases the run.
pub(crate) struct StartGate {
    started: Mutex<bool>,
    cond: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            started: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut started = self.started.lock();
        while !*started {
            self.cond.wait(&mut started);
        }
    }

    fn open(&self) {
        *self.started.lock() = true;
        self.cond.notify_all();
    }
}

/// Everything a worker thread needs a handle on.
pub(crate) struct RunContext {
    pub config: Config,
    pub clock: Clock,
    times: OnceLock<Times>,
    interrupted: AtomicBool,
    pub start_gate: StartGate,
    /// Read end of the shutdown pipe; polled (never drained) by every
    /// bounded wait, so one byte unblocks all of them for good.
    pub thread_wake: OwnedFd,
    pub input: Datafile,
}

impl RunContext {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    /// Only valid once the start gate has opened.
    pub fn times(&self) -> &Times {
        self.times
            .get()
            .expect("times are set before the start gate opens")
    }
}

/// Executes one complete run and returns the aggregated result. The caller
/// prints the statistics block.
pub fn run(config: Config) -> Result<RunReport> {
    let mut input = Datafile::open(config.datafile.as_deref()).context("opening input file")?;
    input.set_max_runs(config.maxruns);

    let (thread_rd, thread_wr) = nix::unistd::pipe().context("creating shutdown pipe")?;
    let (main_rd, main_wr) = nix::unistd::pipe().context("creating completion pipe")?;
    let (intr_rd, intr_wr) = nix::unistd::pipe().context("creating interrupt pipe")?;

    stats::print_initial_status(&config);

    let factory = SocketFactory::new(
        config.mode,
        config.server_addr,
        &config.server_name,
        config.local_addr,
        config.bufsize,
    )
    .context("preparing socket factory")?;

    let ctx = Arc::new(RunContext {
        clock: Clock::new(),
        times: OnceLock::new(),
        interrupted: AtomicBool::new(false),
        start_gate: StartGate::new(),
        thread_wake: thread_rd,
        input,
        config,
    });
    let config = &ctx.config;

    // Workers open their sockets and block on the start gate.
    let main_wr = Arc::new(main_wr);
    let mut workers = Vec::with_capacity(config.threads as usize);
    let mut socket_offset = 0usize;
    for offset in 0..config.threads {
        let worker = Worker::spawn(&ctx, offset, socket_offset, &factory, main_wr.clone())?;
        socket_offset += worker.shared.socks.len();
        workers.push(worker);
    }
    let shareds: Vec<Arc<WorkerShared>> = workers.iter().map(|w| w.shared.clone()).collect();

    let interval_thread = if config.stats_interval_us > 0 {
        let ctx = ctx.clone();
        let shareds = shareds.clone();
        Some(
            std::thread::Builder::new()
                .name("interval-stats".to_string())
                .spawn(move || stats::interval_reporter(&ctx, &shareds))
                .context("spawning interval-stats thread")?,
        )
    } else {
        None
    };

    let start_us = ctx.clock.now();
    let (stop_us, deadline) = if config.timelimit_us > 0 {
        let stop = start_us + config.timelimit_us;
        (stop, ctx.clock.instant_at(stop))
    } else {
        (u64::MAX, None)
    };
    let _ = ctx.times.set(Times {
        start_us,
        stop_us,
        deadline,
    });

    if config.handle_sigint {
        ctrlc::set_handler(move || {
            let _ = nix::unistd::write(&intr_wr, b"x");
        })
        .context("installing SIGINT handler")?;
    }

    ctx.start_gate.open();

    // Sleep until the first sender finishes, the deadline passes or SIGINT
    // lands on the interrupt pipe.
    let wait_limit = if config.timelimit_us > 0 {
        Some(Duration::from_micros(config.timelimit_us))
    } else {
        None
    };
    match poll::wait_readable(main_rd.as_fd(), intr_rd.as_fd(), wait_limit)
        .context("waiting for test completion")?
    {
        PollOutcome::Canceled => ctx.set_interrupted(),
        PollOutcome::Ready | PollOutcome::TimedOut => {}
    }

    let mut end_us = ctx.clock.now();

    // Kick every bounded wait and blocked sender, then collect the threads.
    if let Err(e) = nix::unistd::write(&thread_wr, b"x") {
        tracing::warn!("failed to signal shutdown: {e}");
    }
    for worker in &workers {
        worker.stop();
    }

    let mut reports = Vec::with_capacity(workers.len());
    let mut failure = None;
    for worker in workers {
        match worker.join() {
            Ok(report) => reports.push(report),
            Err(e) => failure = failure.or(Some(e)),
        }
    }
    if let Some(thread) = interval_thread
        && thread.join().is_err()
    {
        tracing::warn!("interval-stats thread panicked");
    }
    if let Some(e) = failure {
        return Err(e);
    }

    let mut total = Stats::default();
    for report in &reports {
        total.merge(&report.stats);
        end_us = end_us.max(report.last_recv);
    }

    if ctx.is_interrupted() {
        for shared in &shareds {
            let (interrupted, descs) = worker::cancel_queries(shared);
            total.num_interrupted += interrupted;
            for desc in descs {
                println!("> I {desc}");
            }
        }
    }

    let reason = if ctx.is_interrupted() {
        StopReason::Interrupted
    } else if config.maxruns > 0 && ctx.input.runs_completed() >= config.maxruns {
        StopReason::EndOfFile
    } else {
        StopReason::TimeLimit
    };
    stats::print_final_status(reason);

    Ok(RunReport {
        stats: total,
        run_time_us: end_us.saturating_sub(start_us),
        latency_details: reports.into_iter().map(|r| r.latency_detail).collect(),
        reason,
        threads: config.threads,
        updates: config.updates,
    })
}
