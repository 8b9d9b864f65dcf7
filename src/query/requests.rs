//! Turns establish targets into dispatch-ready requests.

use crate::error::{Error, Result};
use crate::executor::{PendingRequest, RequestHandle};
use crate::types::RemoteTarget;
use std::collections::HashSet;

/// Map targets to pending requests, keeping input order. Handles are the
/// targets' positions.
///
/// Each shard may be targeted once per call; a repeated shard id is rejected
/// before anything is sent.
pub fn build_requests(targets: Vec<RemoteTarget>) -> Result<Vec<PendingRequest>> {
    {
        let mut seen = HashSet::with_capacity(targets.len());
        for target in &targets {
            if !seen.insert(&target.shard_id) {
                return Err(Error::DuplicateShard(target.shard_id.clone()));
            }
        }
    }

    Ok(targets
        .into_iter()
        .enumerate()
        .map(|(idx, target)| PendingRequest {
            handle: RequestHandle(idx),
            shard_id: target.shard_id,
            command: target.command,
        })
        .collect())
}
