//! Wire shapes and codec for shard commands.

pub mod rpc;

pub use rpc::{
    Command, CommandReply, CursorReply, CursorResponse, ErrorReply, KillCursorsCommand,
    KillCursorsReply, OpenCursorCommand,
};
