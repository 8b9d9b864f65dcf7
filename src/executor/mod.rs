//! Concurrent remote command dispatch.
//!
//! This module is the engine the establishment protocol runs on:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   AsyncRequestsSender                        │
//! │  - one driver task per shard                                 │
//! │  - host targeting via ShardTargeter                          │
//! │  - retries retriable failures until stop_retrying()          │
//! │  - completions delivered in arrival order                    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TaskExecutor                           │
//! │  - in-flight limit (backpressure)                            │
//! │  - per-request deadline                                      │
//! │  - fire-and-forget submissions                               │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │           RemoteCommandRunner (e.g. TcpCommandRunner)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod async_requests;
mod targeter;
mod tcp;

pub use async_requests::{AsyncRequestsSender, PendingRequest, RequestHandle, ResponseEnvelope};
pub use targeter::{ShardHosts, ShardTargeter, StaticShardTargeter};
pub use tcp::{read_frame, write_frame, TcpCommandRunner};

use crate::config::ExecutorConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::types::HostAndPort;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A command addressed to one host.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommandRequest {
    /// Host to run the command on.
    pub target: HostAndPort,

    /// Database the command is addressed to.
    pub db_name: String,

    /// Encoded command.
    pub command: Bytes,

    /// Deadline for this command; the executor default applies if unset.
    pub timeout: Option<Duration>,
}

impl RemoteCommandRequest {
    /// Create a new request.
    pub fn new(target: HostAndPort, db_name: impl Into<String>, command: Bytes) -> Self {
        Self {
            target,
            db_name: db_name.into(),
            command,
            timeout: None,
        }
    }

    /// Set a deadline for this request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Raw reply to a remote command.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommandResponse {
    /// Encoded reply.
    pub data: Bytes,

    /// Round-trip time.
    pub elapsed: Duration,
}

/// Runs a single command against a single host.
///
/// One call is one network round trip; retries and deadlines are layered on
/// top by the executor.
#[async_trait::async_trait]
pub trait RemoteCommandRunner: Send + Sync + std::fmt::Debug {
    /// Send the command and wait for the raw reply.
    async fn run_command(&self, request: &RemoteCommandRequest) -> Result<RemoteCommandResponse>;
}

/// Accepts commands whose outcome nobody waits for.
pub trait CommandScheduler: Send + Sync + std::fmt::Debug {
    /// Submit a command and return without waiting for it.
    ///
    /// An error means the command was not submitted at all.
    fn fire_and_forget(&self, request: RemoteCommandRequest) -> Result<()>;
}

/// Releases an in-flight slot when the command finishes.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Schedules remote commands on the tokio runtime.
#[derive(Debug)]
pub struct TaskExecutor {
    /// Transport used for every command.
    runner: Arc<dyn RemoteCommandRunner>,

    /// Configuration.
    config: ExecutorConfig,

    /// Commands currently running.
    in_flight: Arc<AtomicUsize>,

    /// Set once the executor stops accepting work.
    shut_down: AtomicBool,
}

impl TaskExecutor {
    /// Create a new executor.
    pub fn new(runner: Arc<dyn RemoteCommandRunner>, config: ExecutorConfig) -> Self {
        Self {
            runner,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create with default config.
    pub fn with_defaults(runner: Arc<dyn RemoteCommandRunner>) -> Self {
        Self::new(runner, ExecutorConfig::default())
    }

    /// Get the configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Number of commands currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stop accepting new commands. Running commands are not interrupted.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::info!(in_flight = self.in_flight(), "Task executor shutting down");
        }
    }

    /// Whether the executor has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Schedule a command and return a handle resolving to its outcome.
    ///
    /// Fails without scheduling anything if the executor is shut down, no
    /// tokio runtime is available, or the in-flight limit is reached.
    pub fn schedule_remote_command(
        &self,
        request: RemoteCommandRequest,
    ) -> Result<JoinHandle<Result<RemoteCommandResponse>>> {
        if self.is_shut_down() {
            return Err(Error::transport(
                ErrorCode::ShutdownInProgress,
                "task executor is shut down",
            ));
        }

        let runtime = Handle::try_current().map_err(|_| {
            Error::transport(
                ErrorCode::ShutdownInProgress,
                "no async runtime available to run remote commands",
            )
        })?;

        // Backpressure check
        let pending = self.in_flight.fetch_add(1, Ordering::AcqRel);
        if pending >= self.config.max_in_flight {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ExecutorBusy { pending });
        }
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        let runner = Arc::clone(&self.runner);
        let deadline = request.timeout.unwrap_or(self.config.request_timeout);

        Ok(runtime.spawn(async move {
            let _guard = guard;
            match tokio::time::timeout(deadline, runner.run_command(&request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::transport(
                    ErrorCode::NetworkTimeout,
                    format!(
                        "command to {} timed out after {:?}",
                        request.target, deadline
                    ),
                )),
            }
        }))
    }
}

impl CommandScheduler for TaskExecutor {
    fn fire_and_forget(&self, request: RemoteCommandRequest) -> Result<()> {
        let target = request.target.clone();
        // Dropping the handle detaches the task; its outcome is never read.
        let _ = self.schedule_remote_command(request)?;
        tracing::trace!(%target, "Scheduled fire-and-forget command");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers every command with its own payload after an optional delay.
    #[derive(Debug)]
    struct EchoRunner {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RemoteCommandRunner for EchoRunner {
        async fn run_command(
            &self,
            request: &RemoteCommandRequest,
        ) -> Result<RemoteCommandResponse> {
            tokio::time::sleep(self.delay).await;
            Ok(RemoteCommandResponse {
                data: request.command.clone(),
                elapsed: self.delay,
            })
        }
    }

    fn request() -> RemoteCommandRequest {
        RemoteCommandRequest::new(
            HostAndPort::new("localhost", 27018),
            "test",
            Bytes::from_static(b"ping"),
        )
    }

    #[tokio::test]
    async fn test_schedule_and_await() {
        let executor = TaskExecutor::with_defaults(Arc::new(EchoRunner {
            delay: Duration::ZERO,
        }));

        let handle = executor.schedule_remote_command(request()).unwrap();
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.data, Bytes::from_static(b"ping"));
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_request_deadline() {
        let executor = TaskExecutor::with_defaults(Arc::new(EchoRunner {
            delay: Duration::from_secs(5),
        }));

        let handle = executor
            .schedule_remote_command(request().with_timeout(Duration::from_millis(20)))
            .unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NetworkTimeout);
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_backpressure() {
        let executor = TaskExecutor::new(
            Arc::new(EchoRunner {
                delay: Duration::from_millis(200),
            }),
            ExecutorConfig::new().with_max_in_flight(1),
        );

        let first = executor.schedule_remote_command(request()).unwrap();
        let err = executor.schedule_remote_command(request()).unwrap_err();
        assert_eq!(err, Error::ExecutorBusy { pending: 1 });

        first.await.unwrap().unwrap();
        assert_eq!(executor.in_flight(), 0);
        assert!(executor.schedule_remote_command(request()).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_work() {
        let executor = TaskExecutor::with_defaults(Arc::new(EchoRunner {
            delay: Duration::ZERO,
        }));
        executor.shutdown();

        assert!(executor.is_shut_down());
        let err = executor.fire_and_forget(request()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShutdownInProgress);
    }

    #[test]
    fn test_no_runtime_is_reported() {
        let executor = TaskExecutor::with_defaults(Arc::new(EchoRunner {
            delay: Duration::ZERO,
        }));

        let err = executor.fire_and_forget(request()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShutdownInProgress);
        assert_eq!(executor.in_flight(), 0);
    }
}
