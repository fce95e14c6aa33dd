//! Metric sinks for flushed training statistics.
//!
//! Provides:
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` for tracing-backed stdout logging
//! - `JsonlLogger` for one JSON object per emission
//! - `CompositeLogger` for multi-backend logging

mod console;
mod jsonl;
mod logger;

pub use console::ConsoleLogger;
pub use jsonl::JsonlLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger};
