//! Stateless peer load-balancing helpers.
//!
//! These are pure functions over a chain's current peer set and batch map;
//! `SyncingChain` owns the data, these just pick.

use crate::batch::BatchInfo;
use crate::block::Block;
use crate::types::{ChainTarget, PeerId};
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// Number of requests currently in flight against `peer` across every batch
/// in `batches`.
fn active_downloads<B: Block>(
    peer: &PeerId,
    batches: &std::collections::BTreeMap<crate::types::Epoch, BatchInfo<B>>,
) -> usize {
    batches.values().map(|b| b.active_request_for(peer)).sum()
}

/// The best peer to retry `batch` against: excludes peers that have already
/// failed this batch, then prefers the peer with the fewest active
/// downloads, breaking ties deterministically by peer id.
pub fn best_peer_to_retry<B: Block>(
    peerset: &HashMap<PeerId, ChainTarget>,
    batches: &std::collections::BTreeMap<crate::types::Epoch, BatchInfo<B>>,
    batch: &BatchInfo<B>,
) -> Option<PeerId> {
    let failed: std::collections::HashSet<&PeerId> = batch.failed_peers().collect();

    peerset
        .keys()
        .filter(|p| !failed.contains(p))
        .min_by_key(|p| (active_downloads(p, batches), (*p).clone()))
        .cloned()
}

/// All peers with zero active downloads, in uniformly random order so that
/// several new batches created in the same pass spread across peers.
pub fn idle_peers<B: Block>(
    peerset: &HashMap<PeerId, ChainTarget>,
    batches: &std::collections::BTreeMap<crate::types::Epoch, BatchInfo<B>>,
) -> Vec<PeerId> {
    let mut idle: Vec<PeerId> = peerset
        .keys()
        .filter(|p| active_downloads(p, batches) == 0)
        .cloned()
        .collect();
    idle.shuffle(&mut rand::thread_rng());
    idle
}
