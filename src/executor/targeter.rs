//! Resolution of shards to hosts.

use crate::config::ReadPreference;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{HostAndPort, ShardId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks the host a shard's command is sent to.
pub trait ShardTargeter: Send + Sync + std::fmt::Debug {
    /// Find a host of `shard_id` that satisfies the read preference.
    ///
    /// An unknown shard is [`Error::ShardNotFound`]; a known shard with no
    /// eligible host is a retriable `HostUnreachable` transport error.
    fn find_host(&self, shard_id: &ShardId, read_preference: ReadPreference)
        -> Result<HostAndPort>;
}

/// Replica set members of one shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardHosts {
    /// Current primary, if one is known.
    pub primary: Option<HostAndPort>,

    /// Secondaries.
    pub secondaries: Vec<HostAndPort>,
}

impl ShardHosts {
    /// A shard with only a primary.
    pub fn primary(host: HostAndPort) -> Self {
        Self {
            primary: Some(host),
            secondaries: Vec::new(),
        }
    }

    /// A shard with no known primary.
    pub fn without_primary() -> Self {
        Self::default()
    }

    /// Add a secondary.
    pub fn with_secondary(mut self, host: HostAndPort) -> Self {
        self.secondaries.push(host);
        self
    }
}

/// Targeter backed by a fixed, manually maintained shard map.
#[derive(Debug, Default)]
pub struct StaticShardTargeter {
    /// Hosts per shard.
    shards: DashMap<ShardId, ShardHosts>,

    /// Round-robin position for secondary selection.
    next_member: AtomicUsize,
}

impl StaticShardTargeter {
    /// Create an empty targeter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a shard's hosts.
    pub fn register_shard(&self, shard_id: impl Into<ShardId>, hosts: ShardHosts) {
        self.shards.insert(shard_id.into(), hosts);
    }

    /// Remove a shard.
    pub fn unregister_shard(&self, shard_id: &ShardId) {
        self.shards.remove(shard_id);
    }

    /// Number of registered shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn pick(&self, members: &[&HostAndPort]) -> Option<HostAndPort> {
        if members.is_empty() {
            return None;
        }
        let idx = self.next_member.fetch_add(1, Ordering::Relaxed) % members.len();
        Some(members[idx].clone())
    }
}

impl ShardTargeter for StaticShardTargeter {
    fn find_host(
        &self,
        shard_id: &ShardId,
        read_preference: ReadPreference,
    ) -> Result<HostAndPort> {
        let hosts = self
            .shards
            .get(shard_id)
            .ok_or_else(|| Error::ShardNotFound(shard_id.clone()))?;

        let primary = hosts.primary.as_ref();
        let secondaries: Vec<&HostAndPort> = hosts.secondaries.iter().collect();

        let host = match read_preference {
            ReadPreference::Primary => primary.cloned(),
            ReadPreference::PrimaryPreferred => {
                primary.cloned().or_else(|| self.pick(&secondaries))
            }
            ReadPreference::Secondary => self.pick(&secondaries),
            ReadPreference::SecondaryPreferred => {
                self.pick(&secondaries).or_else(|| primary.cloned())
            }
            ReadPreference::Nearest => {
                let all: Vec<&HostAndPort> = primary.into_iter().chain(secondaries).collect();
                self.pick(&all)
            }
        };

        host.ok_or_else(|| {
            Error::transport(
                ErrorCode::HostUnreachable,
                format!(
                    "no host of shard {} satisfies read preference {:?}",
                    shard_id, read_preference
                ),
            )
        })
    }
}
