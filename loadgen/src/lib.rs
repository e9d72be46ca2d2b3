//! Core engine of the DNS load generator.
//!
//! A run is a set of worker thread pairs (sender + receiver) hammering one
//! target server through per-worker socket sets, coordinated by
//! [`coordinator::run`]. Each worker owns a 65,536-entry slot table indexed
//! by DNS message id; the sender paces transmissions against per-thread
//! quotas while the receiver correlates responses, measures latency and
//! sweeps timeouts.

#![expect(
    clippy::print_stdout,
    reason = "status blocks, the report and per-query traces are the tool's stdout contract"
)]

pub(crate) mod clock;
pub mod config;
pub mod coordinator;
mod receiver;
mod sender;
pub(crate) mod slots;
pub mod stats;
mod worker;
