//! Command and reply shapes exchanged with shards, and their codec.
//!
//! The establishment core treats commands as opaque bytes. This module is the
//! encoding collaborator: it builds the open-cursor and close-cursor commands
//! and turns a shard's raw reply into a [`CursorResponse`].

use crate::error::{Error, ErrorCode, Result};
use crate::types::{CursorId, Namespace};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A command sent to a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Open a cursor on a namespace.
    OpenCursor(OpenCursorCommand),

    /// Close cursors on the host that owns them.
    KillCursors(KillCursorsCommand),
}

/// Open-cursor command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCursorCommand {
    /// Target namespace, `db.collection`.
    pub namespace: String,

    /// Encoded query filter.
    pub filter: Bytes,

    /// Size of the first batch, if limited.
    pub batch_size: Option<u32>,
}

impl OpenCursorCommand {
    /// Create an open-cursor command.
    pub fn new(namespace: &Namespace, filter: impl Into<Bytes>) -> Self {
        Self {
            namespace: namespace.to_string(),
            filter: filter.into(),
            batch_size: None,
        }
    }

    /// Limit the first batch.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Encode as a command payload.
    pub fn encode(self) -> Result<Bytes> {
        encode_command(&Command::OpenCursor(self))
    }
}

/// Close-cursor command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillCursorsCommand {
    /// Namespace the cursors belong to.
    pub namespace: String,

    /// Cursors to close.
    pub cursor_ids: Vec<CursorId>,
}

impl KillCursorsCommand {
    /// Create a close-cursor command.
    pub fn new(namespace: &Namespace, cursor_ids: Vec<CursorId>) -> Self {
        Self {
            namespace: namespace.to_string(),
            cursor_ids,
        }
    }

    /// Encode as a command payload.
    pub fn encode(self) -> Result<Bytes> {
        encode_command(&Command::KillCursors(self))
    }
}

/// A shard's reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandReply {
    /// Cursor metadata and first batch.
    Cursor(CursorReply),

    /// Outcome of a close-cursor command.
    KillCursors(KillCursorsReply),

    /// The command failed on the shard.
    Error(ErrorReply),
}

/// Cursor part of an open-cursor reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorReply {
    /// Cursor id, zero if exhausted.
    pub cursor_id: CursorId,

    /// Namespace the cursor iterates, `db.collection`.
    pub namespace: String,

    /// Encoded documents of the first batch.
    pub first_batch: Vec<Bytes>,
}

/// Reply to a close-cursor command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KillCursorsReply {
    /// Cursors that were closed.
    pub cursors_killed: Vec<CursorId>,

    /// Cursors the host did not know.
    pub cursors_not_found: Vec<CursorId>,
}

/// Error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Numeric error code.
    pub code: i32,

    /// Human-readable message.
    pub errmsg: String,
}

impl CommandReply {
    /// Build a cursor reply.
    pub fn cursor(cursor_id: CursorId, namespace: &Namespace, first_batch: Vec<Bytes>) -> Self {
        CommandReply::Cursor(CursorReply {
            cursor_id,
            namespace: namespace.to_string(),
            first_batch,
        })
    }

    /// Build an error reply.
    pub fn error(code: ErrorCode, errmsg: impl Into<String>) -> Self {
        CommandReply::Error(ErrorReply {
            code: code.raw(),
            errmsg: errmsg.into(),
        })
    }

    /// Encode the reply.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }
}

/// Parsed cursor metadata from an open-cursor reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorResponse {
    /// Cursor id, zero if exhausted.
    pub cursor_id: CursorId,

    /// Namespace the cursor iterates.
    pub namespace: Namespace,

    /// Encoded documents of the first batch.
    pub first_batch: Vec<Bytes>,
}

impl CursorResponse {
    /// Parse a raw reply into cursor metadata.
    ///
    /// An error reply becomes [`Error::Remote`] carrying the shard's code.
    /// Anything else that is not a valid cursor reply becomes
    /// [`Error::MalformedResponse`].
    pub fn parse_from_bytes(data: &[u8]) -> Result<Self> {
        let reply: CommandReply = bincode::deserialize(data).map_err(|e| {
            Error::malformed(ErrorCode::FailedToParse, format!("undecodable reply: {}", e))
        })?;

        match reply {
            CommandReply::Cursor(cursor) => {
                if cursor.cursor_id < 0 {
                    return Err(Error::malformed(
                        ErrorCode::FailedToParse,
                        format!("negative cursor id {}", cursor.cursor_id),
                    ));
                }
                let namespace = Namespace::parse(&cursor.namespace).map_err(|_| {
                    Error::malformed(
                        ErrorCode::BadValue,
                        format!("invalid cursor namespace '{}'", cursor.namespace),
                    )
                })?;
                Ok(Self {
                    cursor_id: cursor.cursor_id,
                    namespace,
                    first_batch: cursor.first_batch,
                })
            }
            CommandReply::Error(err) => {
                let code = match err.code {
                    0 => ErrorCode::UnknownError,
                    raw => ErrorCode::from_raw(raw),
                };
                Err(Error::remote(code, err.errmsg))
            }
            CommandReply::KillCursors(_) => Err(Error::malformed(
                ErrorCode::FailedToParse,
                "expected a cursor reply, got a killCursors reply",
            )),
        }
    }
}

/// Encode a command to bytes.
pub fn encode_command(command: &Command) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(command)?))
}

/// Decode a command from bytes.
pub fn decode_command(data: &[u8]) -> Result<Command> {
    Ok(bincode::deserialize(data)?)
}

/// Decode a reply from bytes.
pub fn decode_reply(data: &[u8]) -> Result<CommandReply> {
    Ok(bincode::deserialize(data)?)
}

/// Frame a payload with a length prefix for TCP transmission.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Serialization(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let len = payload.len() as u32;

    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);

    Ok(framed)
}
