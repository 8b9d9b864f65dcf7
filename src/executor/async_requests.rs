//! Scatter a batch of per-shard commands and gather completions as they arrive.

use super::{RemoteCommandRequest, RemoteCommandResponse, ShardTargeter, TaskExecutor};
use crate::config::EstablishConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::network::rpc::{decode_reply, CommandReply};
use crate::types::{HostAndPort, ShardId};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Correlates a completion with the request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub usize);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A per-shard command ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// Correlation handle.
    pub handle: RequestHandle,

    /// Shard to send the command to.
    pub shard_id: ShardId,

    /// Encoded command.
    pub command: Bytes,
}

/// Completion of one pending request.
#[derive(Debug)]
pub struct ResponseEnvelope {
    /// Handle of the request this completes.
    pub handle: RequestHandle,

    /// Shard the request targeted.
    pub shard_id: ShardId,

    /// Host that answered; only set when a reply was received.
    pub source_host: Option<HostAndPort>,

    /// Raw reply or the failure that prevented one.
    pub outcome: Result<RemoteCommandResponse>,
}

impl ResponseEnvelope {
    fn failed(request: &PendingRequest, error: Error) -> Self {
        Self {
            handle: request.handle,
            shard_id: request.shard_id.clone(),
            source_host: None,
            outcome: Err(error),
        }
    }
}

/// State shared by the driver tasks of one sender.
#[derive(Debug)]
struct RequestContext {
    executor: Arc<TaskExecutor>,
    targeter: Arc<dyn ShardTargeter>,
    db_name: String,
    config: EstablishConfig,
    stop_retrying: Arc<AtomicBool>,
}

impl RequestContext {
    fn is_stopped(&self) -> bool {
        self.stop_retrying.load(Ordering::Acquire)
    }

    /// One attempt: target a host and run the command there.
    async fn attempt(
        &self,
        request: &PendingRequest,
    ) -> Result<(HostAndPort, RemoteCommandResponse)> {
        let host = self
            .targeter
            .find_host(&request.shard_id, self.config.read_preference)?;

        let remote =
            RemoteCommandRequest::new(host.clone(), &self.db_name, request.command.clone());
        let handle = self.executor.schedule_remote_command(remote)?;

        match handle.await {
            Ok(Ok(response)) => Ok((host, response)),
            Ok(Err(e)) => Err(e),
            Err(join) => Err(Error::Internal(format!(
                "remote command task for {} failed: {}",
                host, join
            ))),
        }
    }

    fn may_retry(&self, err: &Error, attempts: u32) -> bool {
        err.is_retriable() && self.config.allows_retry(attempts) && !self.is_stopped()
    }

    /// Run a request to completion, retrying while policy and the stop flag allow.
    ///
    /// Transport failures and shard replies carrying a retriable error code
    /// are both retried. Once retries run out a shard's error reply is
    /// delivered as received.
    async fn drive(&self, request: PendingRequest) -> ResponseEnvelope {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.attempt(&request).await {
                Ok((host, response)) => match retriable_reply(&response) {
                    Some(err) if self.may_retry(&err, attempts) => err,
                    _ => {
                        return ResponseEnvelope {
                            handle: request.handle,
                            shard_id: request.shard_id,
                            source_host: Some(host),
                            outcome: Ok(response),
                        };
                    }
                },
                Err(e) => e,
            };

            if self.may_retry(&err, attempts) {
                tracing::debug!(
                    shard_id = %request.shard_id,
                    attempt = attempts,
                    error = %err,
                    "Retrying remote command"
                );
                tokio::time::sleep(self.config.retry_backoff).await;
                if !self.is_stopped() {
                    continue;
                }
            }

            return ResponseEnvelope::failed(&request, err);
        }
    }
}

/// The error carried by a shard reply, if its code is retriable.
fn retriable_reply(response: &RemoteCommandResponse) -> Option<Error> {
    match decode_reply(&response.data) {
        Ok(CommandReply::Error(reply)) => {
            let code = ErrorCode::from_raw(reply.code);
            code.is_retriable().then(|| Error::remote(code, reply.errmsg))
        }
        _ => None,
    }
}

/// Sends one command per shard concurrently and yields completions in
/// arrival order.
///
/// Every submitted request produces exactly one [`ResponseEnvelope`].
#[derive(Debug)]
pub struct AsyncRequestsSender {
    /// Completions not yet returned by [`next`](Self::next).
    remaining: usize,

    /// Completion stream.
    responses: mpsc::UnboundedReceiver<ResponseEnvelope>,

    /// Shared with driver tasks; once set no new attempt starts.
    stop_retrying: Arc<AtomicBool>,
}

impl AsyncRequestsSender {
    /// Submit all requests. Each one starts immediately on its own task.
    pub fn new(
        executor: Arc<TaskExecutor>,
        targeter: Arc<dyn ShardTargeter>,
        db_name: impl Into<String>,
        requests: Vec<PendingRequest>,
        config: EstablishConfig,
    ) -> Self {
        let (tx, responses) = mpsc::unbounded_channel();
        let stop_retrying = Arc::new(AtomicBool::new(false));
        let remaining = requests.len();

        let ctx = Arc::new(RequestContext {
            executor,
            targeter,
            db_name: db_name.into(),
            config,
            stop_retrying: Arc::clone(&stop_retrying),
        });

        match Handle::try_current() {
            Ok(runtime) => {
                for request in requests {
                    let tx = tx.clone();
                    let ctx = Arc::clone(&ctx);
                    runtime.spawn(async move {
                        let envelope = ctx.drive(request).await;
                        // The receiver may be gone if the caller stopped listening.
                        let _ = tx.send(envelope);
                    });
                }
            }
            Err(_) => {
                for request in &requests {
                    let _ = tx.send(ResponseEnvelope::failed(
                        request,
                        Error::transport(
                            ErrorCode::ShutdownInProgress,
                            "no async runtime available to run remote commands",
                        ),
                    ));
                }
            }
        }

        Self {
            remaining,
            responses,
            stop_retrying,
        }
    }

    /// Whether every completion has been returned.
    pub fn done(&self) -> bool {
        self.remaining == 0
    }

    /// Completions still outstanding.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Wait for the next completion, in arrival order.
    pub async fn next(&mut self) -> Result<ResponseEnvelope> {
        if self.remaining == 0 {
            return Err(Error::Internal("no outstanding requests".to_string()));
        }

        match self.responses.recv().await {
            Some(envelope) => {
                self.remaining -= 1;
                Ok(envelope)
            }
            None => {
                let lost = self.remaining;
                self.remaining = 0;
                Err(Error::Internal(format!(
                    "{} requests ended without a response",
                    lost
                )))
            }
        }
    }

    /// Stop scheduling new attempts. Attempts already running still complete
    /// and are still delivered by [`next`](Self::next).
    pub fn stop_retrying(&self) {
        self.stop_retrying.store(true, Ordering::Release);
    }

    /// Whether [`stop_retrying`](Self::stop_retrying) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop_retrying.load(Ordering::Acquire)
    }

    /// Move the outstanding completions into a new sender, leaving this one
    /// done. Both share the stop flag.
    pub fn detach(&mut self) -> Self {
        let (_, closed) = mpsc::unbounded_channel();
        Self {
            remaining: std::mem::take(&mut self.remaining),
            responses: std::mem::replace(&mut self.responses, closed),
            stop_retrying: Arc::clone(&self.stop_retrying),
        }
    }
}

impl Drop for AsyncRequestsSender {
    fn drop(&mut self) {
        self.stop_retrying();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RemoteCommandRunner, ShardHosts, StaticShardTargeter};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Replies after a per-port delay; ports listed in `failing` fail with
    /// HostUnreachable every time.
    #[derive(Debug, Default)]
    struct ScriptedRunner {
        delays: HashMap<u16, Duration>,
        failing: Vec<u16>,
        calls: Mutex<Vec<u16>>,
    }

    #[async_trait::async_trait]
    impl RemoteCommandRunner for ScriptedRunner {
        async fn run_command(
            &self,
            request: &RemoteCommandRequest,
        ) -> Result<RemoteCommandResponse> {
            let port = request.target.port();
            self.calls.lock().push(port);
            if let Some(delay) = self.delays.get(&port) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing.contains(&port) {
                return Err(Error::transport(ErrorCode::HostUnreachable, "refused"));
            }
            Ok(RemoteCommandResponse {
                data: request.command.clone(),
                elapsed: Duration::ZERO,
            })
        }
    }

    fn setup(
        runner: ScriptedRunner,
        shards: &[(&str, u16)],
    ) -> (Arc<TaskExecutor>, Arc<StaticShardTargeter>, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let executor = Arc::new(TaskExecutor::with_defaults(runner.clone()));
        let targeter = Arc::new(StaticShardTargeter::new());
        for (shard, port) in shards {
            targeter.register_shard(
                *shard,
                ShardHosts::primary(HostAndPort::new("localhost", *port)),
            );
        }
        (executor, targeter, runner)
    }

    fn pending(idx: usize, shard: &str) -> PendingRequest {
        PendingRequest {
            handle: RequestHandle(idx),
            shard_id: ShardId::new(shard),
            command: Bytes::from(shard.to_string()),
        }
    }

    #[tokio::test]
    async fn test_completion_order() {
        let runner = ScriptedRunner {
            delays: HashMap::from([
                (1, Duration::from_millis(150)),
                (2, Duration::from_millis(10)),
            ]),
            ..Default::default()
        };
        let (executor, targeter, _) = setup(runner, &[("a", 1), ("b", 2)]);

        let mut sender = AsyncRequestsSender::new(
            executor,
            targeter,
            "test",
            vec![pending(0, "a"), pending(1, "b")],
            EstablishConfig::default(),
        );
        assert_eq!(sender.remaining(), 2);

        let first = sender.next().await.unwrap();
        assert_eq!(first.shard_id, ShardId::new("b"));
        assert_eq!(first.handle, RequestHandle(1));
        assert_eq!(first.source_host, Some(HostAndPort::new("localhost", 2)));

        let second = sender.next().await.unwrap();
        assert_eq!(second.shard_id, ShardId::new("a"));
        assert!(sender.done());
        assert!(sender.next().await.is_err());
    }

    #[tokio::test]
    async fn test_retries_until_attempts_exhausted() {
        let runner = ScriptedRunner {
            failing: vec![1],
            ..Default::default()
        };
        let (executor, targeter, runner) = setup(runner, &[("a", 1)]);
        let config = EstablishConfig::new()
            .with_max_attempts(3)
            .with_retry_backoff(Duration::from_millis(1));

        let mut sender =
            AsyncRequestsSender::new(executor, targeter, "test", vec![pending(0, "a")], config);
        let envelope = sender.next().await.unwrap();

        assert!(envelope.source_host.is_none());
        assert_eq!(envelope.outcome.unwrap_err().code(), ErrorCode::HostUnreachable);
        assert_eq!(runner.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_stop_retrying_prevents_new_attempts() {
        let runner = ScriptedRunner {
            failing: vec![1],
            ..Default::default()
        };
        let (executor, targeter, runner) = setup(runner, &[("a", 1)]);
        let config = EstablishConfig::new()
            .with_max_attempts(10)
            .with_retry_backoff(Duration::from_millis(50));

        let mut sender =
            AsyncRequestsSender::new(executor, targeter, "test", vec![pending(0, "a")], config);
        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.stop_retrying();
        assert!(sender.is_stopped());

        let envelope = sender.next().await.unwrap();
        assert!(envelope.outcome.is_err());
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_shard_is_not_retried() {
        let (executor, targeter, runner) = setup(ScriptedRunner::default(), &[]);

        let mut sender = AsyncRequestsSender::new(
            executor,
            targeter,
            "test",
            vec![pending(0, "ghost")],
            EstablishConfig::default(),
        );
        let envelope = sender.next().await.unwrap();

        assert_eq!(
            envelope.outcome.unwrap_err(),
            Error::ShardNotFound(ShardId::new("ghost"))
        );
        assert!(runner.calls.lock().is_empty());
    }

    fn error_reply(idx: usize, shard: &str, code: ErrorCode) -> PendingRequest {
        // The scripted runner echoes the command back as the reply.
        PendingRequest {
            command: CommandReply::error(code, "shard said no").encode().unwrap(),
            ..pending(idx, shard)
        }
    }

    #[tokio::test]
    async fn test_retriable_error_reply_is_retried() {
        let (executor, targeter, runner) = setup(ScriptedRunner::default(), &[("a", 1)]);
        let config = EstablishConfig::new()
            .with_max_attempts(3)
            .with_retry_backoff(Duration::from_millis(1));

        let mut sender = AsyncRequestsSender::new(
            executor,
            targeter,
            "test",
            vec![error_reply(0, "a", ErrorCode::NotWritablePrimary)],
            config,
        );
        let envelope = sender.next().await.unwrap();

        // Retries exhausted: the last reply is delivered untouched.
        assert_eq!(envelope.source_host, Some(HostAndPort::new("localhost", 1)));
        let reply = decode_reply(&envelope.outcome.unwrap().data).unwrap();
        assert_eq!(reply, CommandReply::error(ErrorCode::NotWritablePrimary, "shard said no"));
        assert_eq!(runner.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_error_reply_is_delivered_once() {
        let (executor, targeter, runner) = setup(ScriptedRunner::default(), &[("a", 1)]);

        let mut sender = AsyncRequestsSender::new(
            executor,
            targeter,
            "test",
            vec![error_reply(0, "a", ErrorCode::Unauthorized)],
            EstablishConfig::default(),
        );
        let envelope = sender.next().await.unwrap();

        assert!(envelope.outcome.is_ok());
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_detach_moves_outstanding_completions() {
        let runner = ScriptedRunner {
            delays: HashMap::from([(2, Duration::from_millis(20))]),
            ..Default::default()
        };
        let (executor, targeter, _) = setup(runner, &[("a", 1), ("b", 2)]);

        let mut sender = AsyncRequestsSender::new(
            executor,
            targeter,
            "test",
            vec![pending(0, "a"), pending(1, "b")],
            EstablishConfig::default(),
        );
        let first = sender.next().await.unwrap();
        assert_eq!(first.shard_id, ShardId::new("a"));

        let mut detached = sender.detach();
        assert!(sender.done());
        assert_eq!(detached.remaining(), 1);

        drop(sender);
        assert!(detached.is_stopped());

        let second = detached.next().await.unwrap();
        assert_eq!(second.shard_id, ShardId::new("b"));
        assert!(detached.done());
    }
}
