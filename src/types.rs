//! Core types used throughout cursor establishment.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server-side cursor identifier. Zero means the cursor is already exhausted.
pub type CursorId = i64;

/// Identifier of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a new shard identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ShardId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Network address of a shard host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    /// Create a new host and port pair.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidHost(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidHost(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// A `db.collection` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Create a namespace from its parts.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let coll = coll.into();
        if db.is_empty() || db.contains('.') || coll.is_empty() {
            return Err(Error::InvalidNamespace(format!("{}.{}", db, coll)));
        }
        Ok(Self { db, coll })
    }

    /// Parse a `db.collection` string. The collection part may contain dots.
    pub fn parse(ns: &str) -> Result<Self> {
        let (db, coll) = ns
            .split_once('.')
            .ok_or_else(|| Error::InvalidNamespace(ns.to_string()))?;
        Self::new(db, coll)
    }

    /// Database name; commands for this namespace are addressed to it.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Collection name.
    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// A shard to open a cursor on, with its encoded open-cursor command.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTarget {
    /// Shard to query.
    pub shard_id: ShardId,
    /// Encoded open-cursor command.
    pub command: Bytes,
}

impl RemoteTarget {
    /// Create a new target.
    pub fn new(shard_id: impl Into<ShardId>, command: impl Into<Bytes>) -> Self {
        Self {
            shard_id: shard_id.into(),
            command: command.into(),
        }
    }
}

/// A cursor successfully opened on a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct EstablishedCursor {
    /// Shard that owns the cursor.
    pub shard_id: ShardId,
    /// Host that answered and holds the cursor.
    pub host: HostAndPort,
    /// Server-side cursor id.
    pub cursor_id: CursorId,
    /// Namespace reported by the shard.
    pub namespace: Namespace,
    /// Encoded documents of the first batch.
    pub first_batch: Vec<Bytes>,
}

impl EstablishedCursor {
    /// Whether the shard already exhausted this cursor.
    pub fn is_exhausted(&self) -> bool {
        self.cursor_id == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_and_port_parse() {
        let host: HostAndPort = "shard1.example.net:27018".parse().unwrap();
        assert_eq!(host.host(), "shard1.example.net");
        assert_eq!(host.port(), 27018);
        assert_eq!(host.to_string(), "shard1.example.net:27018");

        assert!("no-port".parse::<HostAndPort>().is_err());
        assert!(":27017".parse::<HostAndPort>().is_err());
        assert!("host:notaport".parse::<HostAndPort>().is_err());
    }

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("test.system.views").unwrap();
        assert_eq!(ns.db(), "test");
        assert_eq!(ns.coll(), "system.views");
        assert_eq!(ns.to_string(), "test.system.views");

        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".users").is_err());
        assert!(Namespace::parse("test.").is_err());
    }

    #[test]
    fn test_shard_id() {
        let id = ShardId::from("shard0001");
        assert_eq!(id.as_str(), "shard0001");
        assert_eq!(id, ShardId::new(String::from("shard0001")));
    }
}
