//! Durable write-ahead message relay.
//!
//! This library provides a persistent FIFO queue backed by a pluggable
//! key-value store, and a single-consumer stream dispatcher that drains the
//! queue through a chain of handlers until each payload is delivered.
//! Producers fire-and-forget; delivery survives remote outages, network
//! partitions, and process restarts.

pub mod processor;
pub mod queue;
pub mod server;
pub mod storage;
pub mod stream;
