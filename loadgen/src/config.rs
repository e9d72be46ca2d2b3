//! Command line surface and the resolved run configuration.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs as _};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use dns_encoder::{EdnsOption, TsigKey};
use transport::Mode;

use crate::clock::MICROS_PER_SEC;

/// Most clients a single worker thread will drive.
pub const MAX_SOCKETS: usize = 256;

pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_MAX_OUTSTANDING: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
    Any,
}

impl Family {
    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Inet => addr.is_ipv4(),
            Family::Inet6 => addr.is_ipv6(),
            Family::Any => true,
        }
    }
}

impl FromStr for Family {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inet" => Ok(Family::Inet),
            "inet6" => Ok(Family::Inet6),
            "any" => Ok(Family::Any),
            other => Err(format!("unknown address family `{other}`")),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "dns-loadgen",
    version,
    about = "DNS server load generator and latency measurement tool"
)]
pub struct Cli {
    /// Address family of the DNS transport: inet, inet6 or any.
    #[arg(short = 'f', value_name = "family", default_value = "any")]
    pub family: Family,

    /// Transport mode: udp, tcp or tls.
    #[arg(short = 'm', value_name = "mode", default_value = "udp")]
    pub mode: Mode,

    /// The server to send to.
    #[arg(short = 's', value_name = "host", default_value = "127.0.0.1")]
    pub server: String,

    /// The port on which to query the server (53 for udp/tcp, 853 for tls).
    #[arg(short = 'p', value_name = "port")]
    pub port: Option<u16>,

    /// The local address from which to send.
    #[arg(short = 'a', value_name = "host")]
    pub local_addr: Option<String>,

    /// The local port from which to send.
    #[arg(short = 'x', value_name = "port", default_value_t = 0)]
    pub local_port: u16,

    /// The input data file (`-` or absent means stdin).
    #[arg(short = 'd', value_name = "file")]
    pub datafile: Option<PathBuf>,

    /// The number of clients to act as.
    #[arg(short = 'c', value_name = "clients", default_value_t = 1)]
    pub clients: u32,

    /// The number of threads to run.
    #[arg(short = 'T', value_name = "threads", default_value_t = 1)]
    pub threads: u32,

    /// Run through the input at most this many times.
    #[arg(short = 'n', value_name = "maxruns")]
    pub maxruns: Option<u32>,

    /// Run for at most this many seconds.
    #[arg(short = 'l', value_name = "limit")]
    pub timelimit: Option<f64>,

    /// Socket send/receive buffer size in kilobytes.
    #[arg(short = 'b', value_name = "size")]
    pub bufsize: Option<u32>,

    /// The timeout for query completion in seconds.
    #[arg(short = 't', value_name = "timeout", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: f64,

    /// Enable EDNS 0.
    #[arg(short = 'e')]
    pub edns: bool,

    /// Send an EDNS option (code:value, value in hex; implies -e).
    #[arg(short = 'E', value_name = "code:value")]
    pub edns_option: Option<String>,

    /// Set the DNSSEC OK bit (implies EDNS).
    #[arg(short = 'D')]
    pub dnssec: bool,

    /// The TSIG algorithm, name and secret.
    #[arg(short = 'y', value_name = "[alg:]name:secret")]
    pub tsig: Option<String>,

    /// The maximum number of queries outstanding.
    #[arg(short = 'q', value_name = "num", default_value_t = DEFAULT_MAX_OUTSTANDING)]
    pub max_outstanding: u32,

    /// Limit the number of queries per second.
    #[arg(short = 'Q', value_name = "max_qps")]
    pub max_qps: Option<u32>,

    /// Print queries-per-second statistics every N seconds.
    #[arg(short = 'S', value_name = "interval")]
    pub stats_interval: Option<f64>,

    /// Send dynamic updates instead of queries.
    #[arg(short = 'u')]
    pub updates: bool,

    /// Report each query and additional information to stdout.
    #[arg(short = 'v')]
    pub verbose: bool,
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Command line echoed into the status preamble.
    pub command_line: String,
    pub family: Family,
    pub mode: Mode,
    pub server_addr: SocketAddr,
    /// Hostname as given, for the TLS SNI extension.
    pub server_name: String,
    pub local_addr: Option<SocketAddr>,
    pub datafile: Option<PathBuf>,
    pub clients: u32,
    pub threads: u32,
    /// Replay passes; `0` means unlimited.
    pub maxruns: u32,
    /// Wall-clock limit in microseconds; `0` means none.
    pub timelimit_us: u64,
    pub bufsize: Option<usize>,
    pub timeout_us: u64,
    pub edns: bool,
    pub dnssec: bool,
    pub tsig: Option<Arc<TsigKey>>,
    pub edns_option: Option<EdnsOption>,
    pub max_outstanding: u32,
    /// Global QPS cap; `0` means unlimited.
    pub max_qps: u32,
    /// Interval-stats period in microseconds; `0` disables the reporter.
    pub stats_interval_us: u64,
    pub updates: bool,
    pub verbose: bool,
    /// Whether to install the SIGINT hook (off under tests).
    pub handle_sigint: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_line: String::new(),
            family: Family::Any,
            mode: Mode::Udp,
            server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
            server_name: "127.0.0.1".to_string(),
            local_addr: None,
            datafile: None,
            clients: 1,
            threads: 1,
            maxruns: 1,
            timelimit_us: 0,
            bufsize: None,
            timeout_us: (DEFAULT_TIMEOUT_SECS * MICROS_PER_SEC as f64) as u64,
            edns: false,
            dnssec: false,
            tsig: None,
            edns_option: None,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            max_qps: 0,
            stats_interval_us: 0,
            updates: false,
            verbose: false,
            handle_sigint: false,
        }
    }
}

impl Config {
    pub fn resolve(cli: Cli) -> Result<Self> {
        if cli.clients == 0 {
            bail!("the number of clients must be at least 1");
        }
        if cli.threads == 0 {
            bail!("the number of threads must be at least 1");
        }
        if cli.max_outstanding == 0 {
            bail!("the outstanding-query limit must be at least 1");
        }

        let port = cli.port.unwrap_or_else(|| cli.mode.default_port());
        let server_addr = resolve_server(&cli.server, port, cli.family)?;
        let local_addr = resolve_local(&cli, &server_addr)?;

        let timelimit_us = seconds_to_micros(cli.timelimit);
        // With neither a replay bound nor a time limit one pass is implied;
        // this also covers an explicit `-n 0`.
        let mut maxruns = cli.maxruns.unwrap_or(0);
        if maxruns == 0 && timelimit_us == 0 {
            maxruns = 1;
        }

        let tsig = cli
            .tsig
            .as_deref()
            .map(TsigKey::parse)
            .transpose()
            .context("parsing TSIG key")?
            .map(Arc::new);
        let edns_option = cli
            .edns_option
            .as_deref()
            .map(EdnsOption::parse)
            .transpose()
            .context("parsing EDNS option")?;

        let max_qps = cli.max_qps.unwrap_or(0);
        let mut threads = cli.threads;
        // Threads beyond the QPS cap would each get a zero quota and run
        // unlimited instead; shed them.
        if max_qps > 0 && threads > max_qps {
            threads = max_qps;
        }
        // No point running more threads than client sockets either.
        if threads > cli.clients {
            threads = cli.clients;
        }

        Ok(Self {
            command_line: command_line(),
            family: cli.family,
            mode: cli.mode,
            server_addr,
            server_name: cli.server,
            local_addr,
            datafile: cli.datafile,
            clients: cli.clients,
            threads,
            maxruns,
            timelimit_us,
            bufsize: cli.bufsize.map(|kb| kb as usize * 1024),
            timeout_us: seconds_to_micros(Some(cli.timeout)),
            edns: cli.edns || cli.dnssec || edns_option.is_some(),
            dnssec: cli.dnssec,
            tsig,
            edns_option,
            max_outstanding: cli.max_outstanding,
            max_qps,
            stats_interval_us: seconds_to_micros(cli.stats_interval),
            updates: cli.updates,
            verbose: cli.verbose,
            handle_sigint: true,
        })
    }

}

fn command_line() -> String {
    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_default();
    let program = std::path::Path::new(&argv0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(argv0);

    std::iter::once(program).chain(args).collect::<Vec<_>>().join(" ")
}

fn seconds_to_micros(seconds: Option<f64>) -> u64 {
    match seconds {
        Some(s) if s > 0.0 => (s * MICROS_PER_SEC as f64) as u64,
        _ => 0,
    }
}

fn resolve_server(host: &str, port: u16, family: Family) -> Result<SocketAddr> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving server address `{host}`"))?
        .collect::<Vec<_>>();

    addrs
        .iter()
        .find(|addr| family.matches(addr))
        .copied()
        .with_context(|| format!("`{host}` has no address in the requested family"))
}

fn resolve_local(cli: &Cli, server: &SocketAddr) -> Result<Option<SocketAddr>> {
    let ip = match &cli.local_addr {
        Some(host) => Some(
            (host.as_str(), 0)
                .to_socket_addrs()
                .with_context(|| format!("resolving local address `{host}`"))?
                .map(|addr| addr.ip())
                .find(|ip| ip.is_ipv4() == server.is_ipv4())
                .with_context(|| {
                    format!("`{host}` has no address in the server's family")
                })?,
        ),
        None if cli.local_port != 0 => Some(match server {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }),
        None => None,
    };

    Ok(ip.map(|ip| SocketAddr::new(ip, cli.local_port)))
}

/// Splits a global quota across worker threads: every thread gets the floor
/// share and the first `total % nthreads` threads absorb the remainder.
pub fn per_thread(total: u32, nthreads: u32, offset: u32) -> u32 {
    let value = total / nthreads;
    let assigned = value * nthreads;
    if assigned < total && offset < total - assigned {
        value + 1
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_splits_evenly() {
        assert_eq!(per_thread(100, 4, 0), 25);
        assert_eq!(per_thread(100, 4, 3), 25);
    }

    #[test]
    fn quota_remainder_goes_to_the_first_threads() {
        assert_eq!(per_thread(10, 3, 0), 4);
        assert_eq!(per_thread(10, 3, 1), 3);
        assert_eq!(per_thread(10, 3, 2), 3);
    }

    #[test]
    fn quota_sums_to_the_total() {
        for total in [1u32, 7, 100, 65_536, 100_000] {
            for nthreads in [1u32, 2, 3, 8, 31] {
                let sum: u32 = (0..nthreads).map(|k| per_thread(total, nthreads, k)).sum();
                assert_eq!(sum, total, "total={total} nthreads={nthreads}");
            }
        }
    }

    #[test]
    fn zero_quota_stays_zero() {
        assert_eq!(per_thread(0, 4, 0), 0);
    }

    #[test]
    fn explicit_zero_maxruns_without_time_limit_still_runs_once() {
        use clap::Parser as _;

        let cli = Cli::parse_from(["dns-loadgen", "-n", "0"]);
        let config = Config::resolve(cli).expect("resolve");

        assert_eq!(config.maxruns, 1);
        assert_eq!(config.timelimit_us, 0);
    }

    #[test]
    fn zero_maxruns_with_time_limit_replays_unbounded() {
        use clap::Parser as _;

        let cli = Cli::parse_from(["dns-loadgen", "-n", "0", "-l", "2.5"]);
        let config = Config::resolve(cli).expect("resolve");

        assert_eq!(config.maxruns, 0);
        assert_eq!(config.timelimit_us, 2_500_000);
    }

    #[test]
    fn family_filters_addresses() {
        let v4: SocketAddr = "127.0.0.1:53".parse().expect("addr");
        let v6: SocketAddr = "[::1]:53".parse().expect("addr");

        assert!(Family::Inet.matches(&v4));
        assert!(!Family::Inet.matches(&v6));
        assert!(Family::Inet6.matches(&v6));
        assert!(Family::Any.matches(&v4));
        assert!(Family::Any.matches(&v6));
    }
}
