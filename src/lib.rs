//! Latency race harness for polling vs subscription observation of EVM
//! state after a test transaction.
//!
//! The binary in `main.rs` wires these modules to live endpoints; the
//! library keeps them testable with in-memory fakes.

pub mod bench;
pub mod chain;
pub mod config;
pub mod harness;
pub mod observers;
pub mod report;
pub mod ws;
