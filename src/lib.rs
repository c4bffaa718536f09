//! taskwheel: a distributed task scheduler.
//!
//! Two cooperating roles coordinate through a shared key-value store that
//! acts as durable queue and result registry: a **broker** admits one-shot
//! or delayed tasks (local executables or outbound HTTP calls) and decides
//! when they become claimable, and a **worker** claims them, executes them
//! under a hard timeout, and records results. Deferred work waits in-memory
//! on a hierarchical timer wheel with 10 ms tick resolution; failed attempts
//! are retried along a per-task back-off schedule with at-most-one dispatch
//! per enqueue.

pub mod broker;
pub mod config;
pub mod counters;
pub mod kvs;
pub mod metrics;
pub mod types;
pub mod web;
pub mod wheel;
pub mod worker;

pub use broker::Broker;
pub use config::{BrokerConfig, WorkerConfig};
pub use kvs::{Kvs, MemoryKvs, RedisKvs};
pub use types::{ResultReply, SchedulerError, SchedulerResult, TaskDescriptor, TaskKind, TaskReport};
pub use wheel::TimerWheel;
pub use worker::Worker;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize process logging from a configured level and optional file path.
///
/// An empty `log_path` logs to stderr; otherwise lines are appended to the
/// file without ANSI colors.
pub fn init_tracing(log_level: &str, log_path: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if log_path.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Arc::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}
