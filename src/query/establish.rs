//! Scatter-gather cursor establishment.
//!
//! One establish call sends an open-cursor command to every target shard at
//! once, then consumes completions in the order they arrive:
//!
//! ```text
//!             ┌────────────┐  all completions parsed   ┌──────┐
//!   start ──▶ │ Collecting │ ─────────────────────────▶ │ Done │
//!             └────────────┘                            └──────┘
//!                   │ fatal completion
//!                   ▼
//!             ┌────────────┐  sender done  ┌─────────┐  close dispatched  ┌────────┐
//!             │  Draining  │ ────────────▶ │ Cleanup │ ─────────────────▶ │ Failed │
//!             └────────────┘               └─────────┘                    └────────┘
//! ```
//!
//! The first fatal completion is captured and is the only error the caller
//! ever sees. Responses still in flight at that point are drained so that
//! every cursor opened for the abandoned query can be closed.

use super::cleanup::CursorCleanup;
use super::requests::build_requests;
use crate::config::EstablishConfig;
use crate::error::{Error, Result};
use crate::executor::{
    AsyncRequestsSender, CommandScheduler, ResponseEnvelope, ShardTargeter, TaskExecutor,
};
use crate::metrics::EstablishMetrics;
use crate::network::rpc::CursorResponse;
use crate::types::{EstablishedCursor, Namespace, RemoteTarget, ShardId};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::Instrument;
use uuid::Uuid;

/// Where an establish call is in its lifecycle.
#[derive(Debug)]
enum EstablishState {
    /// Consuming completions; everything so far is usable.
    Collecting,

    /// A fatal error was captured; consuming the rest only to find cursors.
    Draining { error: Error },

    /// Every completion is in; close what was opened.
    Cleanup { error: Error },

    /// All targets accounted for.
    Done,

    /// Cleanup dispatched; return the captured error.
    Failed { error: Error },
}

/// What a single completion means for the call.
#[derive(Debug)]
enum Completion {
    /// The shard opened a cursor.
    Established(EstablishedCursor),

    /// The shard failed but may be left out of a partial result.
    Skipped { shard_id: ShardId, error: Error },

    /// The shard failed and the whole call must fail.
    Fatal { shard_id: ShardId, error: Error },
}

/// In-progress state of one establish call.
///
/// Owns the cursors opened so far. If the call is dropped before it
/// finishes, those cursors are closed, and replies still in flight are
/// drained on a background task so that late cursors are closed too.
#[derive(Debug)]
struct Establishment {
    cursors: Vec<EstablishedCursor>,
    sender: AsyncRequestsSender,
    cleanup: CursorCleanup,
    finished: bool,
}

impl Establishment {
    /// Hand over the gathered cursors; nothing is closed on drop afterwards.
    fn finish(&mut self) -> Vec<EstablishedCursor> {
        self.finished = true;
        std::mem::take(&mut self.cursors)
    }
}

impl Drop for Establishment {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        self.sender.stop_retrying();
        let cursors = std::mem::take(&mut self.cursors);
        tracing::debug!(
            cursors = cursors.len(),
            in_flight = self.sender.remaining(),
            "Establish call abandoned, closing opened cursors"
        );
        self.cleanup.dispatch(&cursors);

        if self.sender.done() {
            return;
        }

        let mut sender = self.sender.detach();
        let cleanup = self.cleanup.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let mut late = Vec::new();
                    while !sender.done() {
                        match sender.next().await {
                            Ok(envelope) => {
                                if let Some(cursor) = CursorEstablisher::drain(envelope) {
                                    late.push(cursor);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    cleanup.dispatch(&late);
                });
            }
            Err(_) => tracing::warn!(
                in_flight = sender.remaining(),
                "No runtime to drain abandoned requests, late cursors left to idle timeout"
            ),
        }
    }
}

/// Opens cursors on many shards for one query.
#[derive(Debug)]
pub struct CursorEstablisher {
    /// Runs the per-shard commands.
    executor: Arc<TaskExecutor>,

    /// Resolves shard ids to hosts.
    targeter: Arc<dyn ShardTargeter>,

    /// Targeting and retry behaviour.
    config: EstablishConfig,

    /// Call and per-shard outcomes.
    metrics: Arc<EstablishMetrics>,

    /// Closes cursors left behind by failed calls.
    cleanup: CursorCleanup,
}

impl CursorEstablisher {
    /// Create an establisher. Cleanup commands go through the same executor.
    pub fn new(
        executor: Arc<TaskExecutor>,
        targeter: Arc<dyn ShardTargeter>,
        config: EstablishConfig,
    ) -> Self {
        let metrics = Arc::new(EstablishMetrics::new());
        let cleanup = CursorCleanup::new(executor.clone(), metrics.clone());
        Self {
            executor,
            targeter,
            config,
            metrics,
            cleanup,
        }
    }

    /// Share a metrics instance with other components.
    pub fn with_metrics(mut self, metrics: Arc<EstablishMetrics>) -> Self {
        self.cleanup = CursorCleanup::new(self.executor.clone(), metrics.clone());
        self.metrics = metrics;
        self
    }

    /// Send close-cursor commands through a different scheduler.
    pub fn with_cleanup_scheduler(mut self, scheduler: Arc<dyn CommandScheduler>) -> Self {
        self.cleanup = CursorCleanup::new(scheduler, self.metrics.clone());
        self
    }

    /// Get the metrics.
    pub fn metrics(&self) -> &Arc<EstablishMetrics> {
        &self.metrics
    }

    /// Get the configuration.
    pub fn config(&self) -> &EstablishConfig {
        &self.config
    }

    /// Open a cursor on every target shard.
    ///
    /// On success the result holds one cursor per target, or with
    /// `allow_partial_results` one per target that did not fail with a
    /// retriable error. Cursors come back in completion order.
    ///
    /// On failure every cursor opened for this call, including ones whose
    /// replies arrived after the failure, is sent exactly one close command
    /// and the first fatal error is returned. Problems closing cursors are
    /// never reported here.
    pub async fn establish(
        &self,
        nss: &Namespace,
        targets: Vec<RemoteTarget>,
        allow_partial_results: bool,
    ) -> Result<Vec<EstablishedCursor>> {
        let operation_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "establish",
            %operation_id,
            namespace = %nss,
            targets = targets.len(),
            allow_partial_results
        );

        async move {
            self.metrics.record_start();
            let start = Instant::now();

            let result = self.run(nss, targets, allow_partial_results).await;

            match &result {
                Ok(cursors) => {
                    self.metrics.record_success(cursors.len(), start.elapsed());
                    tracing::debug!(cursors = cursors.len(), "Cursors established");
                }
                Err(error) => {
                    self.metrics.record_failure(start.elapsed());
                    tracing::info!(%error, "Cursor establishment failed");
                }
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        nss: &Namespace,
        targets: Vec<RemoteTarget>,
        allow_partial_results: bool,
    ) -> Result<Vec<EstablishedCursor>> {
        let requests = build_requests(targets)?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut op = Establishment {
            cursors: Vec::with_capacity(requests.len()),
            sender: AsyncRequestsSender::new(
                self.executor.clone(),
                self.targeter.clone(),
                nss.db(),
                requests,
                self.config.clone(),
            ),
            cleanup: self.cleanup.clone(),
            finished: false,
        };

        let mut state = EstablishState::Collecting;
        loop {
            state = match state {
                EstablishState::Collecting => {
                    if op.sender.done() {
                        EstablishState::Done
                    } else {
                        match op.sender.next().await {
                            Ok(envelope) => {
                                match self.complete(envelope, allow_partial_results) {
                                    Completion::Established(cursor) => {
                                        tracing::debug!(
                                            shard_id = %cursor.shard_id,
                                            host = %cursor.host,
                                            cursor_id = cursor.cursor_id,
                                            "Cursor established"
                                        );
                                        op.cursors.push(cursor);
                                        EstablishState::Collecting
                                    }
                                    Completion::Skipped { shard_id, error } => {
                                        self.metrics.record_skipped(error.code());
                                        tracing::debug!(
                                            %shard_id,
                                            %error,
                                            "Leaving shard out of partial results"
                                        );
                                        EstablishState::Collecting
                                    }
                                    Completion::Fatal { shard_id, error } => {
                                        self.record_fatal(Some(&shard_id), &error);
                                        op.sender.stop_retrying();
                                        EstablishState::Draining { error }
                                    }
                                }
                            }
                            Err(error) => {
                                self.record_fatal(None, &error);
                                op.sender.stop_retrying();
                                EstablishState::Draining { error }
                            }
                        }
                    }
                }

                EstablishState::Draining { error } => {
                    if op.sender.done() {
                        EstablishState::Cleanup { error }
                    } else {
                        match op.sender.next().await {
                            Ok(envelope) => {
                                if let Some(cursor) = Self::drain(envelope) {
                                    op.cursors.push(cursor);
                                }
                                EstablishState::Draining { error }
                            }
                            Err(drain_error) => {
                                tracing::debug!(error = %drain_error, "Drain ended early");
                                EstablishState::Cleanup { error }
                            }
                        }
                    }
                }

                EstablishState::Cleanup { error } => {
                    let report = self.cleanup.dispatch(&op.finish());
                    if !report.is_success() {
                        tracing::warn!(
                            scheduled = report.scheduled,
                            failed = report.failed_count(),
                            "Some cursors could not be scheduled for cleanup"
                        );
                    } else if report.scheduled > 0 {
                        tracing::debug!(scheduled = report.scheduled, "Cleanup dispatched");
                    }
                    EstablishState::Failed { error }
                }

                EstablishState::Done => return Ok(op.finish()),

                EstablishState::Failed { error } => return Err(error),
            };
        }
    }

    /// Log and count the error that fails the call.
    fn record_fatal(&self, shard_id: Option<&ShardId>, error: &Error) {
        self.metrics.record_shard_error(error.code());
        match shard_id {
            Some(shard_id) => tracing::debug!(
                %shard_id,
                %error,
                "Fatal shard error, draining outstanding responses"
            ),
            None => tracing::debug!(%error, "Request engine failed, draining"),
        }
    }

    /// Classify a completion received while collecting.
    fn complete(&self, envelope: ResponseEnvelope, allow_partial_results: bool) -> Completion {
        let shard_id = envelope.shard_id.clone();
        match Self::parse(envelope) {
            Ok(cursor) => Completion::Established(cursor),
            Err(error) if allow_partial_results && error.is_retriable() => {
                Completion::Skipped { shard_id, error }
            }
            Err(error) => Completion::Fatal { shard_id, error },
        }
    }

    /// Keep a cursor that opened after the call already failed.
    fn drain(envelope: ResponseEnvelope) -> Option<EstablishedCursor> {
        let shard_id = envelope.shard_id.clone();
        match Self::parse(envelope) {
            Ok(cursor) => Some(cursor),
            Err(error) => {
                tracing::debug!(%shard_id, %error, "Ignoring error while draining");
                None
            }
        }
    }

    fn parse(envelope: ResponseEnvelope) -> Result<EstablishedCursor> {
        let response = envelope.outcome?;
        let host = envelope.source_host.ok_or_else(|| {
            Error::Internal(format!(
                "reply from shard {} has no source host",
                envelope.shard_id
            ))
        })?;
        let parsed = CursorResponse::parse_from_bytes(&response.data)?;

        Ok(EstablishedCursor {
            shard_id: envelope.shard_id,
            host,
            cursor_id: parsed.cursor_id,
            namespace: parsed.namespace,
            first_batch: parsed.first_batch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::executor::{RemoteCommandResponse, RequestHandle};
    use crate::network::rpc::CommandReply;
    use crate::types::HostAndPort;
    use bytes::Bytes;
    use std::time::Duration;

    fn envelope(outcome: Result<RemoteCommandResponse>, host: Option<u16>) -> ResponseEnvelope {
        ResponseEnvelope {
            handle: RequestHandle(0),
            shard_id: ShardId::new("shard1"),
            source_host: host.map(|port| HostAndPort::new("localhost", port)),
            outcome,
        }
    }

    fn reply(body: CommandReply) -> Result<RemoteCommandResponse> {
        Ok(RemoteCommandResponse {
            data: body.encode().unwrap(),
            elapsed: Duration::ZERO,
        })
    }

    #[test]
    fn test_parse_cursor_reply() {
        let nss = Namespace::parse("test.users").unwrap();
        let data = vec![Bytes::from_static(b"doc")];
        let cursor = CursorEstablisher::parse(envelope(
            reply(CommandReply::cursor(42, &nss, data.clone())),
            Some(27018),
        ))
        .unwrap();

        assert_eq!(cursor.shard_id, ShardId::new("shard1"));
        assert_eq!(cursor.host, HostAndPort::new("localhost", 27018));
        assert_eq!(cursor.cursor_id, 42);
        assert_eq!(cursor.namespace, nss);
        assert_eq!(cursor.first_batch, data);
    }

    #[test]
    fn test_parse_requires_source_host() {
        let nss = Namespace::parse("test.users").unwrap();
        let err = CursorEstablisher::parse(envelope(
            reply(CommandReply::cursor(42, &nss, Vec::new())),
            None,
        ))
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_parse_error_reply() {
        let err = CursorEstablisher::parse(envelope(
            reply(CommandReply::error(ErrorCode::NamespaceNotFound, "no such ns")),
            Some(27018),
        ))
        .unwrap_err();
        assert_eq!(err, Error::remote(ErrorCode::NamespaceNotFound, "no such ns"));
    }

    #[test]
    fn test_drain_drops_failures() {
        let failed = envelope(
            Err(Error::transport(ErrorCode::NetworkTimeout, "timed out")),
            None,
        );
        assert!(CursorEstablisher::drain(failed).is_none());
    }

    #[test]
    fn test_engine_error_is_counted() {
        let establisher = crate::testing::TestHarness::new().establisher();
        let error = Error::Internal("2 requests ended without a response".to_string());

        establisher.record_fatal(None, &error);
        establisher.record_fatal(Some(&ShardId::new("shard1")), &error);

        assert_eq!(establisher.metrics().errors.get(["InternalError"]), 2);
    }
}
