//! Chain selection policy across every in-flight `SyncingChain`.
//!
//! `RangeSync` owns one `ChainCollection`. It decides which finalized chain
//! (at most one can run at a time) and which head chains (up to
//! `parallel_head_chains`) are actively syncing, and emits start/stop
//! instructions for the caller to apply.

use crate::block::Block;
use crate::chain::{ChainId, ChainSyncingState, SyncingChain};
use crate::config::RangeSyncConfig;
use crate::error::RemoveChain;
use crate::network_context::RangeNetworkContext;
use crate::sync_type::RangeSyncType;
use crate::types::Epoch;
use itertools::Itertools;
use std::collections::HashMap;

/// A chain's syncing state, surfaced for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncChainStatus {
    Finalized,
    Head,
}

/// Chains are bucketed by `SyncingChain::sync_type`, since the selection
/// policy differs entirely between the two.
pub struct ChainCollection<B: Block> {
    config: RangeSyncConfig,
    finalized_chains: HashMap<ChainId, SyncingChain<B>>,
    head_chains: HashMap<ChainId, SyncingChain<B>>,
    log: slog::Logger,
}

impl<B: Block> ChainCollection<B> {
    pub fn new(config: RangeSyncConfig, log: slog::Logger) -> Self {
        ChainCollection {
            config,
            finalized_chains: HashMap::new(),
            head_chains: HashMap::new(),
            log,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finalized_chains.is_empty() && self.head_chains.is_empty()
    }

    pub fn status_of(&self, id: ChainId) -> Option<SyncChainStatus> {
        if self.finalized_chains.contains_key(&id) {
            Some(SyncChainStatus::Finalized)
        } else if self.head_chains.contains_key(&id) {
            Some(SyncChainStatus::Head)
        } else {
            None
        }
    }

    pub fn chain_mut(&mut self, id: ChainId) -> Option<&mut SyncingChain<B>> {
        self.finalized_chains
            .get_mut(&id)
            .or_else(|| self.head_chains.get_mut(&id))
    }

    fn table_mut(&mut self, sync_type: RangeSyncType) -> &mut HashMap<ChainId, SyncingChain<B>> {
        match sync_type {
            RangeSyncType::Finalized => &mut self.finalized_chains,
            RangeSyncType::Head => &mut self.head_chains,
        }
    }

    /// Inserts a freshly constructed chain (caller already populated its
    /// peer pool) and returns its id.
    pub fn insert(&mut self, chain: SyncingChain<B>) -> ChainId {
        let id = chain.id();
        self.table_mut(chain.sync_type()).insert(id, chain);
        id
    }

    pub fn remove(&mut self, id: ChainId) -> Option<SyncingChain<B>> {
        self.finalized_chains
            .remove(&id)
            .or_else(|| self.head_chains.remove(&id))
    }

    pub fn is_finalizing_sync(&self) -> bool {
        !self.finalized_chains.is_empty()
    }

    /// `None` while nothing is actively syncing; otherwise whichever of the
    /// two pools currently has a `Syncing` chain (finalized takes priority,
    /// matching the policy that head chains stay parked during finalized
    /// sync).
    pub fn overall_state(&self) -> Option<SyncChainStatus> {
        if self
            .finalized_chains
            .values()
            .any(|c| c.status() == ChainSyncingState::Syncing)
        {
            Some(SyncChainStatus::Finalized)
        } else if self
            .head_chains
            .values()
            .any(|c| c.status() == ChainSyncingState::Syncing)
        {
            Some(SyncChainStatus::Head)
        } else {
            None
        }
    }

    /// Adds `peer_id` to an existing chain of `sync_type` targeting
    /// `target_root`, or spins up a fresh one starting at `start_epoch` if
    /// none exists yet.
    pub fn add_peer_or_create_chain(
        &mut self,
        start_epoch: Epoch,
        target: crate::types::ChainTarget,
        peer_id: crate::types::PeerId,
        sync_type: RangeSyncType,
    ) -> ChainId {
        let table = self.table_mut(sync_type);
        let existing = table
            .values_mut()
            .find(|c| c.target().map(|t| t.root) == Some(target.root));

        if let Some(chain) = existing {
            chain.add_peer(peer_id, target);
            return chain.id();
        }

        let mut chain = SyncingChain::new(start_epoch, sync_type, self.config, self.log.clone());
        chain.add_peer(peer_id, target);
        let id = chain.id();
        table.insert(id, chain);
        id
    }

    /// Applies the "the finalized chain with the largest peer pool runs;
    /// ties prefer whichever chain is already syncing; and thrash is
    /// prevented by requiring both a strictly larger pool and the running
    /// chain to have validated more than some minimum before losing it to a
    /// newcomer" policy, dispatching `start_syncing`/chain teardown through
    /// `network`. Returns the ids of any chains that were removed as a
    /// result (stopped losers are merely left `Stopped`, not removed).
    pub fn update_finalized_chains<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_finalized_epoch: Epoch,
    ) -> Vec<(ChainId, RemoveChain)> {
        let mut ended = Vec::new();

        let currently_syncing = self
            .finalized_chains
            .values()
            .find(|c| c.status() == ChainSyncingState::Syncing)
            .map(|c| c.id());

        let top = self
            .finalized_chains
            .values()
            .max_by_key(|c| (c.peer_count(), Some(c.id()) == currently_syncing))
            .map(|c| c.id());

        let Some(top_id) = top else {
            return ended;
        };

        let switch_target = match currently_syncing {
            None => Some(top_id),
            Some(running_id) if running_id == top_id => None,
            Some(running_id) => {
                let running_peer_count =
                    self.finalized_chains.get(&running_id).map(|c| c.peer_count()).unwrap_or(0);
                let running_validated = self
                    .finalized_chains
                    .get(&running_id)
                    .map(|c| c.validated_epochs())
                    .unwrap_or(0);
                let top_peer_count =
                    self.finalized_chains.get(&top_id).map(|c| c.peer_count()).unwrap_or(0);
                if top_peer_count > running_peer_count
                    && running_validated > self.config.min_finalized_chain_validated_epochs
                {
                    Some(top_id)
                } else {
                    None
                }
            }
        };

        if let Some(target_id) = switch_target {
            let stale: Vec<ChainId> = self
                .finalized_chains
                .keys()
                .copied()
                .filter(|id| *id != target_id)
                .collect();
            for id in stale {
                if let Some(chain) = self.finalized_chains.get_mut(&id) {
                    if chain.status() == ChainSyncingState::Syncing {
                        slog::debug!(self.log, "Stopping outranked finalized chain"; "chain" => %chain);
                    }
                }
                self.finalized_chains.remove(&id);
                ended.push((id, RemoveChain::Stopped));
            }
            if let Some(chain) = self.finalized_chains.get_mut(&target_id) {
                if let Err(_e) = chain.start_syncing(network, local_finalized_epoch) {
                    slog::crit!(self.log, "Tried to resume an ended finalized chain");
                }
            }
        }

        ended
    }

    /// Keeps the top `parallel_head_chains` head chains running, ranked by
    /// peer pool size (ties preferring whichever is already syncing), and
    /// stops any others that fall out of that window — e.g. a newcomer with
    /// more peers preempting the smallest currently-syncing chain once the
    /// pool is full. Returns the ids of chains stopped as a result (`Stopped`
    /// chains are removed from the collection, not merely paused).
    pub fn update_head_chains<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_finalized_epoch: Epoch,
    ) -> Vec<(ChainId, RemoveChain)> {
        let mut ended = Vec::new();

        if self.is_finalizing_sync() {
            // Finalized sync takes priority; head chains stay parked.
            return ended;
        }

        let ids: Vec<ChainId> = self
            .head_chains
            .values()
            .sorted_by_key(|c| {
                (
                    std::cmp::Reverse(c.peer_count()),
                    c.status() != ChainSyncingState::Syncing,
                )
            })
            .map(|c| c.id())
            .collect();

        let split = ids.len().min(self.config.parallel_head_chains);
        let (keep, stop) = ids.split_at(split);

        for id in stop {
            if let Some(chain) = self.head_chains.get_mut(id) {
                if chain.status() == ChainSyncingState::Syncing {
                    slog::debug!(self.log, "Stopping outranked head chain"; "chain" => %chain);
                }
            }
            self.head_chains.remove(id);
            ended.push((*id, RemoveChain::Stopped));
        }

        for id in keep {
            let Some(chain) = self.head_chains.get_mut(id) else {
                continue;
            };
            if chain.status() == ChainSyncingState::Syncing {
                continue;
            }
            if chain.start_syncing(network, local_finalized_epoch).is_err() {
                slog::crit!(self.log, "Tried to resume an ended head chain");
            }
        }

        ended
    }

    /// Purges chains that finished syncing (naturally reached their target)
    /// and returns their ids for the caller to log.
    pub fn purge_synced(&mut self) -> Vec<ChainId> {
        let mut done = Vec::new();
        self.finalized_chains.retain(|id, c| {
            let keep = c.status() != ChainSyncingState::Synced;
            if !keep {
                done.push(*id);
            }
            keep
        });
        self.head_chains.retain(|id, c| {
            let keep = c.status() != ChainSyncingState::Synced;
            if !keep {
                done.push(*id);
            }
            keep
        });
        done
    }

    pub fn finalized_chains(&self) -> impl Iterator<Item = &SyncingChain<B>> {
        self.finalized_chains.values()
    }

    pub fn head_chains(&self) -> impl Iterator<Item = &SyncingChain<B>> {
        self.head_chains.values()
    }

    pub fn all_chains_mut(&mut self) -> impl Iterator<Item = &mut SyncingChain<B>> {
        self.finalized_chains.values_mut().chain(self.head_chains.values_mut())
    }
}
