//! Concurrent load harness for RESP key-value stores.
//!
//! A run populates `key-0..key-N` plus one wide hash (`large-hash`), then
//! drives random `GET` traffic from pooled connections while optional slow
//! consumers drain `HGETALL large-hash` over raw sockets at a throttled rate,
//! forcing the store to buffer the reply. Throughput is sampled once per
//! interval from a shared counter.

pub mod client;
pub mod config;
pub mod datagen;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod populate;
pub mod readers;
pub mod runner;
pub mod slow_consumer;

pub use config::{RunArgs, RunConfig};
pub use error::PressureError;
pub use runner::{run, run_with_shutdown, RunSummary};
