#![expect(
    clippy::print_stdout,
    reason = "the banner and report are the tool's stdout contract"
)]

use anyhow::Result;
use clap::Parser as _;
use dns_loadgen::config::{Cli, Config};
use dns_loadgen::{coordinator, stats};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::resolve(Cli::parse())?;

    println!("DNS Load Generation Tool");
    println!("Version {}", env!("CARGO_PKG_VERSION"));
    println!();

    let report = coordinator::run(config)?;
    stats::print_statistics(&report);

    Ok(())
}
