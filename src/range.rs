//! `RangeSync`: the facade a caller drives.
//!
//! Owns every `SyncingChain` via `ChainCollection`, the set of peers parked
//! behind an in-progress finalized sync (`awaiting_head_peers`), and a
//! cooldown cache of target roots that have already failed once
//! (`failed_chains`). Every public method takes the caller's current local
//! `SyncInfo` directly, since range_sync has no access to chain state or a
//! clock of its own — the caller is expected to
//! have it on hand from whatever triggered the call.

use crate::block::Block;
use crate::chain::{BatchId, BatchProcessResult, ChainId};
use crate::chain_collection::{ChainCollection, SyncChainStatus};
use crate::config::RangeSyncConfig;
use crate::error::{DownloadError, RemoveChain};
use crate::network_context::{RangeNetworkContext, RequestId};
use crate::sync_type::RangeSyncType;
use crate::types::{ChainTarget, Hash256, PeerAction, PeerId, SyncInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// For how long a target root that failed to sync is kept out of retry.
const FAILED_CHAINS_EXPIRY: Duration = Duration::from_secs(30);

/// A lazily-pruned TTL set. The usual choice for this kind of cache,
/// `delay_map::HashSetDelay`, is a `Stream` driven by polling it inside an
/// event loop; `RangeSync` has no event loop of its own; it only ever runs
/// in response to a caller's method call. So expiry here is checked on
/// every access instead of on a timer tick.
struct FailedChains {
    expiry: HashMap<Hash256, Instant>,
    ttl: Duration,
}

impl FailedChains {
    fn new(ttl: Duration) -> Self {
        FailedChains {
            expiry: HashMap::new(),
            ttl,
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        self.expiry.retain(|_, expires_at| *expires_at > now);
    }

    fn contains(&mut self, root: &Hash256) -> bool {
        self.prune();
        self.expiry.contains_key(root)
    }

    fn insert(&mut self, root: Hash256) {
        self.expiry.insert(root, Instant::now() + self.ttl);
    }
}

pub struct RangeSync<B: Block> {
    /// Peers that reported a head-sync-worthy status while a finalized sync
    /// was already underway; re-evaluated once that finalized sync ends.
    awaiting_head_peers: fnv::FnvHashMap<PeerId, SyncInfo>,
    chains: ChainCollection<B>,
    failed_chains: FailedChains,
    config: RangeSyncConfig,
    log: slog::Logger,
}

impl<B: Block> RangeSync<B> {
    pub fn new(config: RangeSyncConfig, log: slog::Logger) -> Self {
        RangeSync {
            awaiting_head_peers: fnv::FnvHashMap::default(),
            chains: ChainCollection::new(config, log.clone()),
            failed_chains: FailedChains::new(FAILED_CHAINS_EXPIRY),
            config,
            log,
        }
    }

    /// `None` when nothing is actively syncing.
    pub fn state(&self) -> Option<SyncChainStatus> {
        self.chains.overall_state()
    }

    pub fn is_syncing(&self) -> bool {
        self.state().is_some()
    }

    /// A peer connected or re-statused. Classifies it, attaches it to (or
    /// spins up) the right chain, and re-runs chain selection.
    pub fn add_peer<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_info: SyncInfo,
        peer_id: PeerId,
        remote_info: SyncInfo,
        remote_finalized_root_known_locally: bool,
    ) {
        let Some(sync_type) =
            RangeSyncType::new(&local_info, &remote_info, remote_finalized_root_known_locally)
        else {
            return;
        };

        match sync_type {
            RangeSyncType::Finalized => {
                if self.failed_chains.contains(&remote_info.finalized_root) {
                    slog::debug!(self.log, "Disconnecting peer that belongs to a previously failed chain";
                        "failed_root" => %remote_info.finalized_root, "peer_id" => %peer_id);
                    network.report_peer(peer_id, PeerAction::Fatal, "PreviouslyFailedChain");
                    return;
                }

                slog::debug!(self.log, "Finalization sync peer joined"; "peer_id" => %peer_id);
                self.awaiting_head_peers.remove(&peer_id);

                // Sync two epochs plus a slot past the peer's claimed
                // finalized slot, so our own chain finalizes it locally too.
                let target_head_slot = remote_info
                    .finalized_epoch
                    .start_slot(self.config.slots_per_epoch)
                    + (2 * self.config.slots_per_epoch)
                    + 1;
                let target = ChainTarget {
                    slot: target_head_slot,
                    root: remote_info.finalized_root,
                };
                self.chains.add_peer_or_create_chain(
                    local_info.finalized_epoch,
                    target,
                    peer_id,
                    RangeSyncType::Finalized,
                );

                self.update(network, &local_info);
            }
            RangeSyncType::Head => {
                if self.chains.is_finalizing_sync() {
                    slog::trace!(self.log, "Waiting for finalized sync to complete";
                        "peer_id" => %peer_id, "awaiting_head_peers" => self.awaiting_head_peers.len());
                    self.awaiting_head_peers.insert(peer_id, remote_info);
                    return;
                }

                self.remove_peer_inner(network, &local_info, &peer_id);
                self.awaiting_head_peers.remove(&peer_id);
                self.start_head_sync(peer_id, &local_info, &remote_info);

                self.update(network, &local_info);
            }
        }
    }

    fn start_head_sync(&mut self, peer_id: PeerId, local_info: &SyncInfo, remote_info: &SyncInfo) -> ChainId {
        let remote_finalized_slot = remote_info
            .finalized_epoch
            .start_slot(self.config.slots_per_epoch);
        let start_epoch = std::cmp::min(local_info.head_slot, remote_finalized_slot)
            .epoch(self.config.slots_per_epoch);
        let target = ChainTarget {
            slot: remote_info.head_slot,
            root: remote_info.head_root,
        };
        self.chains
            .add_peer_or_create_chain(start_epoch, target, peer_id, RangeSyncType::Head)
    }

    /// A `beacon_blocks_by_range` response arrived.
    pub fn blocks_by_range_response<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_info: SyncInfo,
        chain_id: ChainId,
        batch_id: BatchId,
        request_id: RequestId,
        blocks: Vec<B>,
    ) {
        let Some(chain) = self.chains.chain_mut(chain_id) else {
            slog::trace!(self.log, "BlocksByRange response for a removed chain"; "chain" => %chain_id);
            return;
        };
        if let Some(reason) = chain.on_block_response(network, batch_id, request_id, blocks) {
            self.on_chain_removed(network, &local_info, chain_id, reason);
        }
    }

    /// The external processor finished (or failed) a chain segment.
    pub fn handle_block_process_result<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_info: SyncInfo,
        chain_id: ChainId,
        batch_id: BatchId,
        result: BatchProcessResult,
    ) {
        let Some(chain) = self.chains.chain_mut(chain_id) else {
            slog::trace!(self.log, "Batch process result for a removed chain"; "chain" => %chain_id);
            return;
        };
        if let Some(reason) = chain.on_batch_process_result(network, batch_id, result) {
            self.on_chain_removed(network, &local_info, chain_id, reason);
        }
    }

    /// A download RPC failed outright (timeout, disconnect, malformed data).
    pub fn inject_error<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_info: SyncInfo,
        chain_id: ChainId,
        batch_id: BatchId,
        request_id: RequestId,
        error: DownloadError,
    ) {
        let Some(chain) = self.chains.chain_mut(chain_id) else {
            slog::trace!(self.log, "RPC error for a removed chain"; "chain" => %chain_id);
            return;
        };
        if let Some(reason) = chain.inject_error(network, batch_id, request_id, error) {
            self.on_chain_removed(network, &local_info, chain_id, reason);
        }
    }

    /// A peer disconnected. Removes it from every chain and pool it's part of.
    pub fn peer_disconnect<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_info: SyncInfo,
        peer_id: &PeerId,
    ) {
        self.awaiting_head_peers.remove(peer_id);
        self.remove_peer_inner(network, &local_info, peer_id);
        self.update(network, &local_info);
    }

    fn remove_peer_inner<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_info: &SyncInfo,
        peer_id: &PeerId,
    ) {
        let removed: Vec<(ChainId, RemoveChain)> = self
            .chains
            .all_chains_mut()
            .filter_map(|chain| chain.remove_peer(network, peer_id).map(|reason| (chain.id(), reason)))
            .collect();

        for (chain_id, reason) in removed {
            self.on_chain_removed(network, local_info, chain_id, reason);
        }
    }

    fn on_chain_removed<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_info: &SyncInfo,
        chain_id: ChainId,
        reason: RemoveChain,
    ) {
        if let Some(chain) = self.chains.remove(chain_id) {
            if reason.is_critical() {
                slog::crit!(self.log, "Chain removed"; "chain" => %chain, "reason" => %reason);
            } else {
                slog::debug!(self.log, "Chain removed"; "chain" => %chain, "reason" => %reason);
            }

            if let RemoveChain::ChainFailed { blacklist, .. } = &reason {
                if *blacklist {
                    if let Some(target) = chain.target() {
                        slog::warn!(self.log, "Chain failed, target root blacklisted for a cooldown period";
                            "root" => %target.root, "seconds" => FAILED_CHAINS_EXPIRY.as_secs());
                        self.failed_chains.insert(target.root);
                    }
                }
            }
        }

        self.update(network, local_info);
    }

    /// Re-runs chain selection: picks the furthest finalized chain (if any
    /// are pending), promotes parked head peers once finalized sync ends,
    /// starts as many head chains as `parallel_head_chains` allows, and
    /// drops any chain that reached its target.
    fn update<N: RangeNetworkContext<B>>(&mut self, network: &mut N, local_info: &SyncInfo) {
        let stopped = self
            .chains
            .update_finalized_chains(network, local_info.finalized_epoch);
        for (chain_id, _reason) in stopped {
            slog::debug!(self.log, "Stopped an outranked finalized chain"; "chain" => %chain_id);
        }

        if self.chains.is_finalizing_sync() {
            if !self.awaiting_head_peers.is_empty() {
                slog::trace!(self.log, "Waiting for finalized sync to complete";
                    "awaiting_head_peers" => self.awaiting_head_peers.len());
            }
        } else {
            self.promote_awaiting_head_peers(local_info);
        }

        let stopped = self
            .chains
            .update_head_chains(network, local_info.finalized_epoch);
        for (chain_id, _reason) in stopped {
            slog::debug!(self.log, "Stopped an outranked head chain"; "chain" => %chain_id);
        }

        for chain_id in self.chains.purge_synced() {
            slog::debug!(self.log, "Chain completed"; "chain" => %chain_id);
        }
    }

    fn promote_awaiting_head_peers(&mut self, local_info: &SyncInfo) {
        if self.awaiting_head_peers.is_empty() {
            return;
        }
        let waiting: Vec<(PeerId, SyncInfo)> = self.awaiting_head_peers.drain().collect();
        for (peer_id, remote_info) in waiting {
            self.start_head_sync(peer_id, local_info, &remote_info);
        }
    }

    /// Kickstarts or resumes sync after being idle.
    pub fn resume<N: RangeNetworkContext<B>>(&mut self, network: &mut N, local_info: SyncInfo) {
        self.update(network, &local_info);
    }
}
