//! Testing utilities for cursor establishment.
//!
//! - [`MockShardCluster`]: scripted shards behind a [`RemoteCommandRunner`]
//! - [`RejectingScheduler`]: a cleanup scheduler that refuses every command
//! - [`TestHarness`]: wires a mock cluster to an executor and establisher
//!
//! # Example
//!
//! ```rust,no_run
//! use shard_cursors::error::ErrorCode;
//! use shard_cursors::testing::{HostScript, TestHarness};
//!
//! # async fn run() {
//! let harness = TestHarness::new();
//! harness.cluster.add_shard("shard1", HostScript::cursor(11));
//! harness.cluster.add_shard(
//!     "shard2",
//!     HostScript::transport_error(ErrorCode::NetworkTimeout, "timed out"),
//! );
//!
//! let cursors = harness
//!     .establisher()
//!     .establish(&harness.namespace, harness.targets(&["shard1", "shard2"]), true)
//!     .await
//!     .unwrap();
//! assert_eq!(cursors.len(), 1);
//! # }
//! ```
//!
//! [`RemoteCommandRunner`]: crate::executor::RemoteCommandRunner

mod mock_cluster;


pub use mock_cluster::{
    HostScript, MockShardCluster, ReceivedCommand, ShardBehavior, MOCK_PORT,
};

use crate::config::{EstablishConfig, ExecutorConfig};
use crate::error::{Error, ErrorCode, Result};
use crate::executor::{CommandScheduler, RemoteCommandRequest, TaskExecutor};
use crate::network::rpc::OpenCursorCommand;
use crate::query::CursorEstablisher;
use crate::types::{Namespace, RemoteTarget};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Refuses every fire-and-forget submission.
#[derive(Debug, Default)]
pub struct RejectingScheduler {
    attempts: AtomicUsize,
}

impl RejectingScheduler {
    /// Create a new rejecting scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submissions refused so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

impl CommandScheduler for RejectingScheduler {
    fn fire_and_forget(&self, request: RemoteCommandRequest) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        Err(Error::transport(
            ErrorCode::ShutdownInProgress,
            format!("refusing command for {}", request.target),
        ))
    }
}

/// A mock cluster wired to a real executor.
#[derive(Debug)]
pub struct TestHarness {
    /// Scripted shards.
    pub cluster: Arc<MockShardCluster>,

    /// Executor running commands against `cluster`.
    pub executor: Arc<TaskExecutor>,

    /// Namespace used by [`targets`](Self::targets).
    pub namespace: Namespace,

    /// Config handed to establishers.
    pub config: EstablishConfig,
}

impl TestHarness {
    /// Create a harness with default executor and establish settings.
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::default(), EstablishConfig::default())
    }

    /// Create a harness with custom settings.
    pub fn with_config(executor_config: ExecutorConfig, config: EstablishConfig) -> Self {
        let cluster = Arc::new(MockShardCluster::new());
        let executor = Arc::new(TaskExecutor::new(cluster.clone(), executor_config));
        Self {
            cluster,
            executor,
            namespace: Namespace::new("test", "users").expect("test namespace is valid"),
            config,
        }
    }

    /// An establisher over the shards added so far.
    pub fn establisher(&self) -> CursorEstablisher {
        CursorEstablisher::new(
            self.executor.clone(),
            Arc::new(self.cluster.targeter()),
            self.config.clone(),
        )
    }

    /// One open-cursor target per shard, in the given order.
    pub fn targets(&self, shards: &[&str]) -> Vec<RemoteTarget> {
        shards
            .iter()
            .map(|shard| {
                let command = OpenCursorCommand::new(&self.namespace, Bytes::new())
                    .encode()
                    .expect("open-cursor command encodes");
                RemoteTarget::new(*shard, command)
            })
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
