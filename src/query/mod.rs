//! Router-side query plumbing.
//!
//! - [`build_requests`]: validates targets and assigns request handles
//! - [`CursorEstablisher`]: opens cursors on many shards at once
//! - [`CursorCleanup`]: closes cursors abandoned by a failed establish call

mod cleanup;
mod establish;
mod requests;

pub use cleanup::{CleanupFailure, CleanupReport, CursorCleanup};
pub use establish::CursorEstablisher;
pub use requests::build_requests;
