//! An in-process shard cluster with scripted replies.
//!
//! Each shard gets one primary host whose answer to open-cursor commands is
//! fixed by a [`HostScript`]. Close-cursor commands are always acknowledged.
//! Every command that reaches a host is recorded so tests can check what was
//! sent where.

use crate::error::{Error, ErrorCode, Result};
use crate::executor::{
    RemoteCommandRequest, RemoteCommandResponse, RemoteCommandRunner, ShardHosts,
    StaticShardTargeter,
};
use crate::network::rpc::{
    decode_command, Command, CommandReply, KillCursorsCommand, KillCursorsReply,
};
use crate::types::{CursorId, HostAndPort, Namespace, ShardId};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Port every mock host listens on.
pub const MOCK_PORT: u16 = 27018;

/// Bytes that do not decode as any reply.
const GARBAGE_REPLY: &[u8] = &[0xff, 0xff, 0xff, 0xff, 0x00];

/// How a host answers open-cursor commands.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardBehavior {
    /// Open a cursor with this id.
    Cursor {
        cursor_id: CursorId,
        first_batch: Vec<Bytes>,
    },

    /// Answer with an error reply.
    ErrorReply { code: ErrorCode, message: String },

    /// Fail without replying.
    TransportError { code: ErrorCode, message: String },

    /// Answer with bytes that are not a reply.
    Garbage,
}

/// Scripted behaviour of one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostScript {
    /// Final answer.
    pub behavior: ShardBehavior,

    /// Delay before every answer.
    pub delay: Duration,

    /// Attempts answered with `HostUnreachable` before `behavior` applies.
    pub transient_failures: u32,
}

impl HostScript {
    fn with_behavior(behavior: ShardBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            transient_failures: 0,
        }
    }

    /// Open a cursor with an empty first batch.
    pub fn cursor(cursor_id: CursorId) -> Self {
        Self::with_behavior(ShardBehavior::Cursor {
            cursor_id,
            first_batch: Vec::new(),
        })
    }

    /// Reply with an error.
    pub fn error_reply(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::with_behavior(ShardBehavior::ErrorReply {
            code,
            message: message.into(),
        })
    }

    /// Fail at the transport level.
    pub fn transport_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::with_behavior(ShardBehavior::TransportError {
            code,
            message: message.into(),
        })
    }

    /// Reply with undecodable bytes.
    pub fn garbage() -> Self {
        Self::with_behavior(ShardBehavior::Garbage)
    }

    /// Set the first batch of a cursor reply.
    pub fn with_first_batch(mut self, docs: Vec<Bytes>) -> Self {
        if let ShardBehavior::Cursor { first_batch, .. } = &mut self.behavior {
            *first_batch = docs;
        }
        self
    }

    /// Delay every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `count` attempts with `HostUnreachable`.
    pub fn with_transient_failures(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }
}

/// A command as received by a mock host.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCommand {
    /// Host that received it.
    pub host: HostAndPort,

    /// Database it was addressed to.
    pub db_name: String,

    /// Decoded command.
    pub command: Command,

    /// When it arrived.
    pub at: Instant,
}

#[derive(Debug)]
struct MockHost {
    script: HostScript,
    open_attempts: AtomicU32,
}

/// Scripted shards behind a [`RemoteCommandRunner`].
#[derive(Debug, Default)]
pub struct MockShardCluster {
    /// Hosts by address.
    hosts: DashMap<HostAndPort, MockHost>,

    /// Shards in registration order.
    shards: RwLock<Vec<(ShardId, HostAndPort)>>,

    /// Every command received, in arrival order.
    received: Mutex<Vec<ReceivedCommand>>,
}

impl MockShardCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard with a single primary host, returning that host.
    pub fn add_shard(&self, shard_id: impl Into<ShardId>, script: HostScript) -> HostAndPort {
        let shard_id = shard_id.into();
        let host = HostAndPort::new(format!("{}.mock", shard_id), MOCK_PORT);

        self.hosts.insert(
            host.clone(),
            MockHost {
                script,
                open_attempts: AtomicU32::new(0),
            },
        );

        let mut shards = self.shards.write();
        shards.retain(|(id, _)| *id != shard_id);
        shards.push((shard_id, host.clone()));

        host
    }

    /// Host of a registered shard.
    pub fn host_of(&self, shard_id: &str) -> Option<HostAndPort> {
        self.shards
            .read()
            .iter()
            .find(|(id, _)| id.as_str() == shard_id)
            .map(|(_, host)| host.clone())
    }

    /// A targeter that knows every shard added so far.
    pub fn targeter(&self) -> StaticShardTargeter {
        let targeter = StaticShardTargeter::new();
        for (shard_id, host) in self.shards.read().iter() {
            targeter.register_shard(shard_id.clone(), ShardHosts::primary(host.clone()));
        }
        targeter
    }

    /// Open-cursor attempts received by a host.
    pub fn open_attempts(&self, host: &HostAndPort) -> u32 {
        self.hosts
            .get(host)
            .map(|h| h.open_attempts.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Every command received so far.
    pub fn received(&self) -> Vec<ReceivedCommand> {
        self.received.lock().clone()
    }

    /// Close-cursor commands received so far, with the host they reached.
    pub fn kill_cursors(&self) -> Vec<(HostAndPort, String, KillCursorsCommand)> {
        self.received
            .lock()
            .iter()
            .filter_map(|rc| match &rc.command {
                Command::KillCursors(cmd) => {
                    Some((rc.host.clone(), rc.db_name.clone(), cmd.clone()))
                }
                Command::OpenCursor(_) => None,
            })
            .collect()
    }

    /// Wait until at least `count` close-cursor commands arrived.
    ///
    /// Close commands are fire-and-forget, so they may land after the
    /// establish call has returned.
    pub async fn wait_for_kill_cursors(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.kill_cursors().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, request: &RemoteCommandRequest, command: Command) {
        self.received.lock().push(ReceivedCommand {
            host: request.target.clone(),
            db_name: request.db_name.clone(),
            command,
            at: Instant::now(),
        });
    }

    fn unreachable(host: &HostAndPort) -> Error {
        Error::transport(
            ErrorCode::HostUnreachable,
            format!("connection refused by {}", host),
        )
    }
}

#[async_trait::async_trait]
impl RemoteCommandRunner for MockShardCluster {
    async fn run_command(&self, request: &RemoteCommandRequest) -> Result<RemoteCommandResponse> {
        let start = Instant::now();
        let command = decode_command(&request.command)?;
        self.record(request, command.clone());

        let (script, attempt) = match self.hosts.get(&request.target) {
            Some(host) => {
                let attempt = match command {
                    Command::OpenCursor(_) => host.open_attempts.fetch_add(1, Ordering::AcqRel),
                    Command::KillCursors(_) => 0,
                };
                (host.script.clone(), attempt)
            }
            None => return Err(Self::unreachable(&request.target)),
        };

        tokio::time::sleep(script.delay).await;

        let reply = match command {
            Command::KillCursors(cmd) => CommandReply::KillCursors(KillCursorsReply {
                cursors_killed: cmd.cursor_ids,
                cursors_not_found: Vec::new(),
            }),
            Command::OpenCursor(_) if attempt < script.transient_failures => {
                return Err(Self::unreachable(&request.target));
            }
            Command::OpenCursor(cmd) => match script.behavior {
                ShardBehavior::Cursor {
                    cursor_id,
                    first_batch,
                } => {
                    let nss = Namespace::parse(&cmd.namespace)?;
                    CommandReply::cursor(cursor_id, &nss, first_batch)
                }
                ShardBehavior::ErrorReply { code, message } => CommandReply::error(code, message),
                ShardBehavior::TransportError { code, message } => {
                    return Err(Error::transport(code, message));
                }
                ShardBehavior::Garbage => {
                    return Ok(RemoteCommandResponse {
                        data: Bytes::from_static(GARBAGE_REPLY),
                        elapsed: start.elapsed(),
                    });
                }
            },
        };

        Ok(RemoteCommandResponse {
            data: reply.encode()?,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{decode_reply, OpenCursorCommand};

    fn open(host: HostAndPort) -> RemoteCommandRequest {
        let nss = Namespace::parse("test.users").unwrap();
        RemoteCommandRequest::new(
            host,
            "test",
            OpenCursorCommand::new(&nss, Bytes::new()).encode().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_scripted_cursor() {
        let cluster = MockShardCluster::new();
        let host = cluster.add_shard("shard1", HostScript::cursor(7));

        let response = cluster.run_command(&open(host.clone())).await.unwrap();
        match decode_reply(&response.data).unwrap() {
            CommandReply::Cursor(reply) => {
                assert_eq!(reply.cursor_id, 7);
                assert_eq!(reply.namespace, "test.users");
            }
            other => panic!("Wrong reply type: {:?}", other),
        }
        assert_eq!(cluster.open_attempts(&host), 1);
        assert_eq!(cluster.received().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures() {
        let cluster = MockShardCluster::new();
        let host = cluster.add_shard("shard1", HostScript::cursor(7).with_transient_failures(2));

        for _ in 0..2 {
            let err = cluster.run_command(&open(host.clone())).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::HostUnreachable);
        }
        assert!(cluster.run_command(&open(host.clone())).await.is_ok());
        assert_eq!(cluster.open_attempts(&host), 3);
    }

    #[tokio::test]
    async fn test_unknown_host_is_unreachable() {
        let cluster = MockShardCluster::new();
        let err = cluster
            .run_command(&open(HostAndPort::new("nowhere", 1)))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[test]
    fn test_targeter_knows_shards() {
        let cluster = MockShardCluster::new();
        cluster.add_shard("shard1", HostScript::cursor(1));
        cluster.add_shard("shard2", HostScript::garbage());

        assert_eq!(cluster.targeter().shard_count(), 2);
        assert_eq!(
            cluster.host_of("shard2"),
            Some(HostAndPort::new("shard2.mock", MOCK_PORT))
        );
    }
}
