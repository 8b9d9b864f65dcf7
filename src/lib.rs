//! Scatter-gather cursor establishment for a sharded query router.
//!
//! A query that spans several shards needs one open cursor per shard before
//! results can be merged. This crate opens those cursors concurrently and
//! hands back either the full set or a single error:
//!
//! - open-cursor commands go to every shard at once
//! - replies are consumed in arrival order
//! - shard failures are classified as retriable or fatal
//! - after a fatal failure, replies still in flight are drained and every
//!   cursor opened for the abandoned query is closed
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use shard_cursors::config::EstablishConfig;
//! use shard_cursors::executor::{ShardHosts, StaticShardTargeter, TaskExecutor, TcpCommandRunner};
//! use shard_cursors::network::OpenCursorCommand;
//! use shard_cursors::query::CursorEstablisher;
//! use shard_cursors::types::{HostAndPort, Namespace, RemoteTarget};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let targeter = StaticShardTargeter::new();
//!     targeter.register_shard("shard1", ShardHosts::primary("10.0.0.1:27018".parse()?));
//!     targeter.register_shard("shard2", ShardHosts::primary(HostAndPort::new("10.0.0.2", 27018)));
//!
//!     let executor = Arc::new(TaskExecutor::with_defaults(Arc::new(TcpCommandRunner::new())));
//!     let establisher =
//!         CursorEstablisher::new(executor, Arc::new(targeter), EstablishConfig::default());
//!
//!     let nss = Namespace::parse("test.users")?;
//!     let command = OpenCursorCommand::new(&nss, Bytes::new()).encode()?;
//!     let targets = vec![
//!         RemoteTarget::new("shard1", command.clone()),
//!         RemoteTarget::new("shard2", command),
//!     ];
//!
//!     // Shards that are temporarily unreachable may be left out.
//!     let cursors = establisher.establish(&nss, targets, true).await?;
//!     for cursor in &cursors {
//!         println!("{} -> cursor {} on {}", cursor.shard_id, cursor.cursor_id, cursor.host);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Query Router                  │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │            CursorEstablisher                │
//! │  • establish(nss, targets, partial)         │
//! │  • Collecting → Draining → Cleanup          │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │ Request │   │  Async   │   │   Cursor    │
//! │ Builder │   │ Requests │   │   Cleanup   │
//! └─────────┘   └──────────┘   └─────────────┘
//!                     │               │
//!                     ▼               ▼
//!               ┌───────────────────────────┐
//!               │       TaskExecutor        │
//!               └───────────────────────────┘
//! ```
//!
//! # Failure Model
//!
//! - **Retriable errors** (unreachable hosts, timeouts, elections) are retried
//!   per shard and, with partial results allowed, the shard is left out
//! - **Everything else** fails the whole call with the first such error
//! - **Cleanup** is best-effort; a close command that cannot be sent is
//!   logged and counted, and the cursor is left to the shard's idle timeout

pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod network;
pub mod query;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{EstablishConfig, ExecutorConfig, ReadPreference, RetryPolicy};
pub use error::{Error, ErrorCode, Result, RETRIABLE_ERROR_CODES};
pub use types::{CursorId, EstablishedCursor, HostAndPort, Namespace, RemoteTarget, ShardId};

// Re-export dispatch types
pub use executor::{
    AsyncRequestsSender, CommandScheduler, RemoteCommandRequest, RemoteCommandResponse,
    RemoteCommandRunner, ShardHosts, ShardTargeter, StaticShardTargeter, TaskExecutor,
    TcpCommandRunner,
};

// Re-export query types
pub use query::{build_requests, CleanupReport, CursorCleanup, CursorEstablisher};

// Re-export metrics types
pub use metrics::{EstablishMetrics, MetricsSnapshot};
