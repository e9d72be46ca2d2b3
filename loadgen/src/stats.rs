//! Counters, aggregation and the fixed-format report.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dns_encoder::RCODE_LABELS;

use crate::clock::{MICROS_PER_SEC, format_micros};
use crate::config::Config;
use crate::coordinator::RunContext;
use crate::worker::WorkerShared;

/// Per-worker (and, after summing, per-run) counters.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub rcode_counts: [u64; 16],

    pub num_sent: u64,
    pub num_interrupted: u64,
    pub num_timed_out: u64,
    pub num_completed: u64,

    pub total_request_size: u64,
    pub total_response_size: u64,

    /// Latency aggregates in microseconds. `min`/`max` are meaningful only
    /// when `num_completed > 0`.
    pub latency_sum: u64,
    pub latency_sum_squares: u128,
    pub latency_min: u64,
    pub latency_max: u64,
}

impl Stats {
    /// Folds one completed query into the aggregates.
    pub fn record_latency(&mut self, latency: u64) {
        self.num_completed += 1;
        self.latency_sum += latency;
        self.latency_sum_squares += u128::from(latency) * u128::from(latency);
        if self.num_completed == 1 || latency < self.latency_min {
            self.latency_min = latency;
        }
        if latency > self.latency_max {
            self.latency_max = latency;
        }
    }

    /// Element-wise sum; commutative and associative, so per-thread stats
    /// can merge in any order.
    pub fn merge(&mut self, other: &Stats) {
        // Latency extremes only count for threads that completed something.
        if other.num_completed > 0 {
            if self.num_completed == 0 || other.latency_min < self.latency_min {
                self.latency_min = other.latency_min;
            }
            if other.latency_max > self.latency_max {
                self.latency_max = other.latency_max;
            }
        }

        for (mine, theirs) in self.rcode_counts.iter_mut().zip(other.rcode_counts.iter()) {
            *mine += theirs;
        }
        self.num_sent += other.num_sent;
        self.num_interrupted += other.num_interrupted;
        self.num_timed_out += other.num_timed_out;
        self.num_completed += other.num_completed;
        self.total_request_size += other.total_request_size;
        self.total_response_size += other.total_response_size;
        self.latency_sum += other.latency_sum;
        self.latency_sum_squares += other.latency_sum_squares;
    }

    /// Sample standard deviation of the latencies, `None` below two samples.
    pub fn latency_stddev(&self) -> Option<f64> {
        if self.num_completed < 2 {
            return None;
        }
        let n = self.num_completed as f64;
        let sum = self.latency_sum as f64;
        let sum_squares = self.latency_sum_squares as f64;
        Some(((sum_squares - sum * sum / n) / (n - 1.0)).sqrt())
    }
}

/// Why the run stopped. Interruption wins over input exhaustion, which wins
/// over the wall-clock limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    EndOfFile,
    TimeLimit,
}

impl StopReason {
    fn describe(self) -> &'static str {
        match self {
            StopReason::Interrupted => "interruption",
            StopReason::EndOfFile => "end of file",
            StopReason::TimeLimit => "time limit",
        }
    }
}

/// Everything the final report needs, returned by [`crate::coordinator::run`].
#[derive(Debug)]
pub struct RunReport {
    pub stats: Stats,
    pub run_time_us: u64,
    /// Per-thread latencies in receipt order.
    pub latency_details: Vec<Vec<u64>>,
    pub reason: StopReason,
    pub threads: u32,
    pub updates: bool,
}

impl RunReport {
    /// `"Queries"` or `"Updates"`, as the report spells it.
    fn units(&self) -> &'static str {
        if self.updates { "Updates" } else { "Queries" }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn ratio(num: u64, den: u64) -> u64 {
    if den == 0 { 0 } else { num / den }
}

pub fn print_initial_status(config: &Config) {
    println!("[Status] Command line: {}", config.command_line);
    println!(
        "[Status] Sending {} (to {})",
        if config.updates { "updates" } else { "queries" },
        config.server_addr.ip()
    );
    println!(
        "[Status] Started at: {}",
        chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
    );

    let mut stopping = String::from("[Status] Stopping after ");
    if config.timelimit_us > 0 {
        stopping.push_str(&format!("{} seconds", format_micros(config.timelimit_us)));
    }
    if config.timelimit_us > 0 && config.maxruns > 0 {
        stopping.push_str(" or ");
    }
    if config.maxruns > 0 {
        stopping.push_str(&format!(
            "{} run{} through file",
            config.maxruns,
            if config.maxruns == 1 { "" } else { "s" }
        ));
    }
    println!("{stopping}");
}

pub fn print_final_status(reason: StopReason) {
    println!("[Status] Testing complete ({})", reason.describe());
    println!();
}

pub fn print_statistics(report: &RunReport) {
    let stats = &report.stats;
    let units = report.units();

    println!("Statistics:");
    println!();

    println!("  {} sent:         {}", units, stats.num_sent);
    println!(
        "  {} completed:    {} ({:.2}%)",
        units,
        stats.num_completed,
        percent(stats.num_completed, stats.num_sent)
    );
    println!(
        "  {} lost:         {} ({:.2}%)",
        units,
        stats.num_timed_out,
        percent(stats.num_timed_out, stats.num_sent)
    );
    if stats.num_interrupted > 0 {
        println!(
            "  {} interrupted:  {} ({:.2}%)",
            units,
            stats.num_interrupted,
            percent(stats.num_interrupted, stats.num_sent)
        );
    }
    println!();

    let codes = stats
        .rcode_counts
        .iter()
        .enumerate()
        .filter(|&(_, &count)| count > 0)
        .map(|(rcode, &count)| {
            format!(
                "{} {} ({:.2}%)",
                RCODE_LABELS[rcode],
                count,
                percent(count, stats.num_completed)
            )
        })
        .collect::<Vec<_>>();
    println!("  Response codes:       {}", codes.join(", "));

    println!(
        "  Average packet size:  request {}, response {}",
        ratio(stats.total_request_size, stats.num_sent),
        ratio(stats.total_response_size, stats.num_completed)
    );
    println!("  Run time (s):         {}", format_micros(report.run_time_us));
    println!(
        "  {} per second:   {:.6}",
        units,
        if report.run_time_us == 0 {
            0.0
        } else {
            stats.num_completed as f64 / (report.run_time_us as f64 / MICROS_PER_SEC as f64)
        }
    );
    println!();

    let latency_avg = ratio(stats.latency_sum, stats.num_completed);
    println!(
        "  Average Latency (s):  {} (min {}, max {})",
        format_micros(latency_avg),
        format_micros(if stats.num_completed == 0 { 0 } else { stats.latency_min }),
        format_micros(stats.latency_max)
    );
    if let Some(stddev) = stats.latency_stddev() {
        println!("  Latency StdDev (s):   {:.6}", stddev / MICROS_PER_SEC as f64);
    }

    println!("  Latency details(thread={}):", report.threads);
    let mut pos = 0u64;
    for (thread, latencies) in report.latency_details.iter().enumerate() {
        for latency in latencies {
            pos += 1;
            println!(
                "thread={}, pos={}, latency={} us",
                thread + 1,
                pos,
                latency
            );
        }
    }
    println!();
}

/// The optional interval-stats thread: prints the aggregate completion rate
/// every configured period until the shutdown pipe becomes readable.
pub(crate) fn interval_reporter(ctx: &RunContext, workers: &[Arc<WorkerShared>]) {
    use std::os::fd::AsFd as _;
    use transport::poll::{PollOutcome, wait_readable};

    let interval = Duration::from_micros(ctx.config.stats_interval_us);
    let wake = ctx.thread_wake.as_fd();

    ctx.start_gate.wait();
    let mut last_time = ctx.times().start_us;
    let mut last_completed = 0u64;

    loop {
        match wait_readable(wake, wake, Some(interval)) {
            Ok(PollOutcome::TimedOut) => {}
            Ok(_) => break,
            Err(e) => {
                tracing::warn!("interval stats wait failed: {e}");
                break;
            }
        }

        let now = ctx.clock.now();
        let completed = workers
            .iter()
            .map(|w| w.num_completed.load(Ordering::Relaxed))
            .sum::<u64>();

        let interval_time = now.saturating_sub(last_time);
        let qps = if interval_time == 0 {
            0.0
        } else {
            (completed - last_completed) as f64 / (interval_time as f64 / MICROS_PER_SEC as f64)
        };
        println!("{}: {:.6}", format_micros(now), qps);

        last_time = now;
        last_completed = completed;
    }
}
