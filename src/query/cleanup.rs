//! Best-effort closing of cursors left behind by a failed establish call.
//!
//! When establishment fails part-way, some shards may already hold open
//! cursors for the abandoned query. Each of them gets one close-cursor
//! command, sent to the host that owns it, and nothing waits for the
//! outcome. A cursor whose close command is lost stays open until the
//! shard's idle-cursor timeout reclaims it.

use crate::error::Error;
use crate::executor::{CommandScheduler, RemoteCommandRequest};
use crate::metrics::EstablishMetrics;
use crate::network::rpc::KillCursorsCommand;
use crate::types::{CursorId, EstablishedCursor, HostAndPort, ShardId};
use std::sync::Arc;

/// A close command that could not be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupFailure {
    /// Shard that owns the cursor.
    pub shard_id: ShardId,
    /// Host the close command was addressed to.
    pub host: HostAndPort,
    /// Cursor left open.
    pub cursor_id: CursorId,
    /// Why submission failed.
    pub error: Error,
}

/// What a cleanup pass managed to submit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Close commands handed to the scheduler.
    pub scheduled: usize,
    /// Close commands that were never submitted.
    pub failed: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Whether every close command was submitted.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of close commands that were never submitted.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// Sends fire-and-forget close-cursor commands.
#[derive(Debug, Clone)]
pub struct CursorCleanup {
    /// Where close commands are submitted.
    scheduler: Arc<dyn CommandScheduler>,

    /// Cleanup counters.
    metrics: Arc<EstablishMetrics>,
}

impl CursorCleanup {
    /// Create a cleanup dispatcher.
    pub fn new(scheduler: Arc<dyn CommandScheduler>, metrics: Arc<EstablishMetrics>) -> Self {
        Self { scheduler, metrics }
    }

    /// Submit one close command per cursor and return without waiting.
    ///
    /// Never fails: submission errors are logged, counted and returned in
    /// the report for inspection only.
    pub fn dispatch(&self, cursors: &[EstablishedCursor]) -> CleanupReport {
        let mut report = CleanupReport::default();

        for cursor in cursors {
            match self.submit(cursor) {
                Ok(()) => {
                    report.scheduled += 1;
                    self.metrics.cleanup_scheduled.inc();
                    tracing::debug!(
                        shard_id = %cursor.shard_id,
                        host = %cursor.host,
                        cursor_id = cursor.cursor_id,
                        "Scheduled killCursors"
                    );
                }
                Err(error) => {
                    self.metrics.cleanup_submission_failures.inc();
                    tracing::warn!(
                        shard_id = %cursor.shard_id,
                        host = %cursor.host,
                        cursor_id = cursor.cursor_id,
                        %error,
                        "Failed to schedule killCursors, cursor left to idle timeout"
                    );
                    report.failed.push(CleanupFailure {
                        shard_id: cursor.shard_id.clone(),
                        host: cursor.host.clone(),
                        cursor_id: cursor.cursor_id,
                        error,
                    });
                }
            }
        }

        report
    }

    fn submit(&self, cursor: &EstablishedCursor) -> crate::error::Result<()> {
        let command = KillCursorsCommand::new(&cursor.namespace, vec![cursor.cursor_id])
            .encode()
            .map_err(|e| Error::CleanupSubmission(e.to_string()))?;

        let request =
            RemoteCommandRequest::new(cursor.host.clone(), cursor.namespace.db(), command);

        self.scheduler
            .fire_and_forget(request)
            .map_err(|e| Error::CleanupSubmission(e.to_string()))
    }
}
