//! Load-generating client side.
//!
//! - `worker`: one simulated client on one connection
//! - `harness`: runs a batch of workers and hands their records to the sink
//! - `probe`: per-worker process metrics

pub mod harness;
pub mod probe;
pub mod worker;

pub use harness::{BatchConfig, Harness};
pub use worker::{Pacing, WorkerOptions};
