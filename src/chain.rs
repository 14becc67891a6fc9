//! `SyncingChain`: one target-root chain.
//!
//! Owns an ordered batch map, dispatches downloads to peers, serializes
//! processing, advances the validated-epoch boundary, and penalizes bad
//! peers. The downloader is a synchronous, idempotent "scan and dispatch"
//! function called from every hook that might make progress possible
//! (`add_peer`, a download completing, a new batch being created); the
//! processor is the same shape, single-flight by construction since
//! `chain_ordering::get_next_batch_to_process` only ever yields a batch once
//! nothing is already `Processing`.

use crate::batch::{Attempt, BatchError, BatchInfo, BatchState};
use crate::block::Block;
use crate::chain_ordering::{self, InvalidBatchOrder};
use crate::config::RangeSyncConfig;
use crate::error::{BatchOutcomeError, DownloadError, RemoveChain, StartAfterEndedError};
use crate::network_context::{ChainProcessId, RangeNetworkContext, RequestId};
use crate::peer_balancer;
use crate::sync_type::RangeSyncType;
use crate::types::{ChainTarget, Epoch, PeerAction, PeerId};
use derivative::Derivative;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A batch is keyed by the epoch it starts at.
pub type BatchId = Epoch;

/// Identifies one `SyncingChain` for routing responses back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(u64);

impl ChainId {
    pub fn random() -> Self {
        ChainId(rand::random())
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// The outcome of handing a chain segment to the external processor.
/// `Success.sent_blocks` records whether the batch contained any blocks at
/// all — advancing the chain on an empty success would be wrong, since
/// nothing was actually validated.
#[derive(Debug, Clone)]
pub enum BatchProcessResult {
    Success { sent_blocks: bool },
    Failed(crate::error::ChainSegmentFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSyncingState {
    Stopped,
    Syncing,
    Synced,
    Error,
}

impl fmt::Display for ChainSyncingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct SyncingChain<B: Block> {
    id: ChainId,
    sync_type: RangeSyncType,
    config: RangeSyncConfig,
    /// Greatest epoch known validated. Everything before this is finalized/accepted.
    start_epoch: Epoch,
    /// Cached `chain_ordering::to_be_processed_start_epoch`, for introspection.
    processor_target: Epoch,
    /// Cached `chain_ordering::to_be_downloaded_start_epoch`, for introspection.
    downloader_target: Epoch,
    batches: BTreeMap<Epoch, BatchInfo<B>>,
    /// `batch_id -> request id` of its currently in-flight download, used to
    /// reject stale/duplicate responses.
    in_flight: HashMap<Epoch, RequestId>,
    peers: HashMap<PeerId, ChainTarget>,
    target: Option<ChainTarget>,
    state: ChainSyncingState,
    validated_epochs: u64,
    #[derivative(Debug = "ignore")]
    log: slog::Logger,
}

impl<B: Block> SyncingChain<B> {
    pub fn new(
        start_epoch: Epoch,
        sync_type: RangeSyncType,
        config: RangeSyncConfig,
        log: slog::Logger,
    ) -> Self {
        SyncingChain {
            id: ChainId::random(),
            sync_type,
            config,
            start_epoch,
            processor_target: start_epoch,
            downloader_target: start_epoch,
            batches: BTreeMap::new(),
            in_flight: HashMap::new(),
            peers: HashMap::new(),
            target: None,
            state: ChainSyncingState::Stopped,
            validated_epochs: 0,
            log,
        }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn sync_type(&self) -> RangeSyncType {
        self.sync_type
    }

    pub fn status(&self) -> ChainSyncingState {
        self.state
    }

    pub fn start_epoch(&self) -> Epoch {
        self.start_epoch
    }

    pub fn target(&self) -> Option<ChainTarget> {
        self.target
    }

    pub fn validated_epochs(&self) -> u64 {
        self.validated_epochs
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    pub fn batches(&self) -> &BTreeMap<Epoch, BatchInfo<B>> {
        &self.batches
    }

    pub fn processor_target(&self) -> Epoch {
        self.processor_target
    }

    pub fn downloader_target(&self) -> Epoch {
        self.downloader_target
    }

    /// Re-checks the universal batch-ordering invariant. Exposed for tests;
    /// `trigger_processor` calls the same check inline.
    pub fn check_invariants(&self) -> Result<(), InvalidBatchOrder> {
        chain_ordering::validate_batches_status(&self.batches)
    }

    fn batch_config(&self) -> crate::batch::BatchConfig {
        self.config.batch_config()
    }

    fn fail(&mut self, reason: RemoveChain) -> Option<RemoveChain> {
        self.state = ChainSyncingState::Error;
        Some(reason)
    }

    fn recompute_target(&mut self) {
        let mut counts: HashMap<ChainTarget, usize> = HashMap::new();
        for target in self.peers.values() {
            *counts.entry(*target).or_insert(0) += 1;
        }
        self.target = counts
            .into_iter()
            .max_by(|(t1, c1), (t2, c2)| c1.cmp(c2).then_with(|| t1.root.cmp(&t2.root)))
            .map(|(t, _)| t);
    }

    fn refresh_targets(&mut self) {
        self.processor_target = chain_ordering::to_be_processed_start_epoch(
            &self.batches,
            self.start_epoch,
            self.config.epochs_per_batch,
        );
        self.downloader_target = chain_ordering::to_be_downloaded_start_epoch(
            &self.batches,
            self.start_epoch,
            self.config.epochs_per_batch,
        );
    }

    /// Adds `peer_id` to this chain's peer pool at `target`, recomputing the
    /// chain's selected target. Idempotent: adding the same peer at the same
    /// target twice leaves the peer set unchanged.
    pub fn add_peer(&mut self, peer_id: PeerId, target: ChainTarget) {
        self.peers.insert(peer_id, target);
        self.recompute_target();
    }

    /// Removes `peer_id` from the pool. Any batch it was downloading is
    /// failed. Returns `Some(RemoveChain)` if the chain should now be torn
    /// down (peer pool empty, or the failed download exhausted its retries).
    pub fn remove_peer<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        peer_id: &PeerId,
    ) -> Option<RemoveChain> {
        if self.peers.remove(peer_id).is_none() {
            return None;
        }
        self.recompute_target();

        let affected: Vec<Epoch> = self
            .batches
            .iter()
            .filter(|(_, b)| matches!(b.state(), BatchState::Downloading { peer } if peer == peer_id))
            .map(|(e, _)| *e)
            .collect();

        for epoch in affected {
            self.in_flight.remove(&epoch);
            let Some(batch) = self.batches.get_mut(&epoch) else {
                continue;
            };
            match batch.downloading_error() {
                Ok(()) => {}
                Err(BatchError::Outcome(BatchOutcomeError::MaxDownloadAttemptsReached)) => {
                    return self.fail(RemoveChain::ChainFailed {
                        reason: BatchOutcomeError::MaxDownloadAttemptsReached,
                        blacklist: self.sync_type == RangeSyncType::Finalized,
                    });
                }
                Err(BatchError::WrongState(e)) => {
                    return self.fail(RemoveChain::WrongChainState(e.to_string()));
                }
            }
        }

        if self.peers.is_empty() {
            return Some(RemoveChain::EmptyPeerPool);
        }

        self.trigger_downloader(network);
        None
    }

    /// Ignites the chain. No-op if already `Syncing`; fails if the chain has
    /// already ended.
    pub fn start_syncing<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        local_finalized_epoch: Epoch,
    ) -> Result<(), StartAfterEndedError> {
        match self.state {
            ChainSyncingState::Syncing => return Ok(()),
            ChainSyncingState::Synced | ChainSyncingState::Error => {
                return Err(StartAfterEndedError)
            }
            ChainSyncingState::Stopped => {}
        }

        let delta = local_finalized_epoch.saturating_sub(self.start_epoch).as_u64();
        let aligned =
            self.start_epoch + (delta / self.config.epochs_per_batch) * self.config.epochs_per_batch;
        self.start_epoch = aligned;
        self.processor_target = aligned;
        self.downloader_target = aligned;
        self.state = ChainSyncingState::Syncing;

        self.trigger_downloader(network);
        // `target` is always strictly ahead of a freshly aligned `start_epoch`
        // (both `add_peer` target formulas add a positive offset), so this
        // can't come back `Synced` on the very first call.
        self.trigger_processor(network);
        Ok(())
    }

    fn dispatch_download<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        epoch: Epoch,
        peer: PeerId,
    ) {
        let request = match self.batches.get(&epoch) {
            Some(b) => b.request(),
            None => return,
        };
        if let Some(batch) = self.batches.get_mut(&epoch) {
            if let Err(e) = batch.start_downloading(peer.clone()) {
                slog::crit!(self.log, "Failed to start downloading batch";
                    "batch" => %epoch, "error" => %e);
                return;
            }
        }
        let request_id = network.send_range_request(peer, request, self.id, epoch);
        self.in_flight.insert(epoch, request_id);
    }

    fn retry_awaiting_download_batches<N: RangeNetworkContext<B>>(&mut self, network: &mut N) {
        let epochs: Vec<Epoch> = self
            .batches
            .iter()
            .filter(|(_, b)| matches!(b.state(), BatchState::AwaitingDownload))
            .map(|(e, _)| *e)
            .collect();

        for epoch in epochs {
            let peer = match self.batches.get(&epoch) {
                Some(batch) => peer_balancer::best_peer_to_retry(&self.peers, &self.batches, batch),
                None => None,
            };
            if let Some(peer) = peer {
                self.dispatch_download(network, epoch, peer);
            }
        }
    }

    /// Creates a new batch at the next download epoch, or returns `None` if
    /// the buffer is full, the batch would overrun `target`, or a batch
    /// already exists there.
    fn include_next_batch(&mut self) -> Option<Epoch> {
        let in_buffer = self
            .batches
            .values()
            .filter(|b| matches!(b.state(), BatchState::Downloading { .. } | BatchState::AwaitingProcessing { .. }))
            .count();
        if in_buffer > self.config.batch_buffer_size {
            return None;
        }

        let target = self.target?;
        let start_epoch = chain_ordering::to_be_downloaded_start_epoch(
            &self.batches,
            self.start_epoch,
            self.config.epochs_per_batch,
        );
        let start_slot =
            start_epoch.start_slot(self.config.slots_per_epoch) + self.batch_config().batch_slot_offset;
        if start_slot > target.slot {
            return None;
        }
        if self.batches.contains_key(&start_epoch) {
            slog::crit!(self.log, "Attempted to re-create an existing batch";
                "start_epoch" => %start_epoch);
            return None;
        }

        self.batches
            .insert(start_epoch, BatchInfo::new(start_epoch, self.batch_config()));
        Some(start_epoch)
    }

    fn fill_idle_peers<N: RangeNetworkContext<B>>(&mut self, network: &mut N) {
        let idle = peer_balancer::idle_peers(&self.peers, &self.batches);
        for peer in idle {
            match self.include_next_batch() {
                Some(epoch) => self.dispatch_download(network, epoch, peer),
                None => break,
            }
        }
    }

    /// Idempotent scan-and-dispatch: retries failed batches, then fills idle
    /// peers with new batches. Safe to call from any hook.
    pub fn trigger_downloader<N: RangeNetworkContext<B>>(&mut self, network: &mut N) {
        if self.state != ChainSyncingState::Syncing {
            return;
        }
        self.retry_awaiting_download_batches(network);
        self.fill_idle_peers(network);
        self.refresh_targets();
    }

    /// A `beacon_blocks_by_range` response arrived. `None` if the response
    /// doesn't match an in-flight request (stale, or for a removed batch).
    pub fn on_block_response<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        batch_id: BatchId,
        request_id: RequestId,
        blocks: Vec<B>,
    ) -> Option<RemoveChain> {
        if self.in_flight.get(&batch_id) != Some(&request_id) {
            return None;
        }
        self.in_flight.remove(&batch_id);

        let batch = self.batches.get_mut(&batch_id)?;
        match batch.downloading_success(blocks) {
            Ok(()) => {
                if let Some(removed) = self.trigger_processor(network) {
                    return Some(removed);
                }
                self.trigger_downloader(network);
                None
            }
            Err(e) => self.fail(RemoveChain::WrongChainState(e.to_string())),
        }
    }

    /// An RPC error (timeout, disconnect, malformed response) occurred for
    /// an in-flight download.
    pub fn inject_error<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        batch_id: BatchId,
        request_id: RequestId,
        error: DownloadError,
    ) -> Option<RemoveChain> {
        if self.in_flight.get(&batch_id) != Some(&request_id) {
            return None;
        }
        self.in_flight.remove(&batch_id);
        slog::debug!(self.log, "Batch download failed"; "batch" => %batch_id, "error" => %error);

        let batch = self.batches.get_mut(&batch_id)?;
        match batch.downloading_error() {
            Ok(()) => {
                self.trigger_downloader(network);
                None
            }
            Err(BatchError::Outcome(BatchOutcomeError::MaxDownloadAttemptsReached)) => {
                self.fail(RemoveChain::ChainFailed {
                    reason: BatchOutcomeError::MaxDownloadAttemptsReached,
                    blacklist: self.sync_type == RangeSyncType::Finalized,
                })
            }
            Err(BatchError::WrongState(e)) => self.fail(RemoveChain::WrongChainState(e.to_string())),
        }
    }

    /// Single-flight processor scan: validates ordering, checks for
    /// completion, and starts processing the next ready batch if any.
    pub fn trigger_processor<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
    ) -> Option<RemoveChain> {
        if self.state != ChainSyncingState::Syncing {
            return None;
        }

        if let Err(e) = chain_ordering::validate_batches_status(&self.batches) {
            return self.fail(RemoveChain::WrongChainState(e.to_string()));
        }

        let processed_epoch = chain_ordering::to_be_processed_start_epoch(
            &self.batches,
            self.start_epoch,
            self.config.epochs_per_batch,
        );
        if let Some(target) = self.target {
            if processed_epoch.start_slot(self.config.slots_per_epoch) >= target.slot {
                self.state = ChainSyncingState::Synced;
                return Some(RemoveChain::Synced);
            }
        }

        let epoch = chain_ordering::get_next_batch_to_process(&self.batches)?;
        let batch = self.batches.get_mut(&epoch).expect("epoch exists");
        let result = match batch.start_processing() {
            Ok(blocks) => {
                network.send_chain_segment(
                    ChainProcessId {
                        chain_id: self.id,
                        batch_id: epoch,
                    },
                    blocks,
                );
                None
            }
            Err(e) => self.fail(RemoveChain::WrongChainState(e.to_string())),
        };
        self.refresh_targets();
        result
    }

    fn report_all_peers<N: RangeNetworkContext<B>>(
        &self,
        network: &mut N,
        action: PeerAction,
        reason: &'static str,
    ) {
        for peer in self.peers.keys().cloned().collect::<Vec<_>>() {
            network.report_peer(peer, action, reason);
        }
    }

    /// The external processor finished (or failed) the chain segment for
    /// `batch_id`.
    pub fn on_batch_process_result<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        batch_id: BatchId,
        result: BatchProcessResult,
    ) -> Option<RemoveChain> {
        let batch = self.batches.get_mut(&batch_id)?;

        match result {
            BatchProcessResult::Success { sent_blocks } => {
                if let Err(e) = batch.processing_success() {
                    return self.fail(RemoveChain::WrongChainState(e.to_string()));
                }
                if sent_blocks {
                    if let Some(removed) = self.advance_chain(network, batch_id) {
                        return Some(removed);
                    }
                }
                if let Some(removed) = self.trigger_processor(network) {
                    return Some(removed);
                }
                self.trigger_downloader(network);
                None
            }
            BatchProcessResult::Failed(failure) => {
                let outcome = batch.processing_error();

                if failure.imported_blocks > 0 {
                    if let Some(removed) = self.advance_chain(network, batch_id) {
                        return Some(removed);
                    }
                }
                if let Some(removed) = self.invalidate_prefix(network, batch_id) {
                    return Some(removed);
                }

                match outcome {
                    Ok(()) => {
                        self.trigger_downloader(network);
                        None
                    }
                    Err(BatchError::Outcome(BatchOutcomeError::MaxProcessingAttemptsReached)) => {
                        self.report_all_peers(
                            network,
                            PeerAction::LowToleranceError,
                            "SyncChainMaxProcessingAttempts",
                        );
                        self.fail(RemoveChain::ChainFailed {
                            reason: BatchOutcomeError::MaxProcessingAttemptsReached,
                            blacklist: self.sync_type == RangeSyncType::Finalized,
                        })
                    }
                    Err(BatchError::WrongState(e)) => {
                        self.fail(RemoveChain::WrongChainState(e.to_string()))
                    }
                }
            }
        }
    }

    /// Marks every `AwaitingValidation` batch before `before_epoch` back to
    /// `AwaitingDownload`, forcing a redownload of the whole suspicious
    /// prefix.
    fn invalidate_prefix<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        before_epoch: Epoch,
    ) -> Option<RemoveChain> {
        let epochs: Vec<Epoch> = self
            .batches
            .range(..before_epoch)
            .map(|(e, _)| *e)
            .collect();

        for epoch in epochs {
            let Some(batch) = self.batches.get_mut(&epoch) else {
                continue;
            };
            if !matches!(batch.state(), BatchState::AwaitingValidation { .. }) {
                continue;
            }
            match batch.validation_error() {
                Ok(()) => {}
                Err(BatchError::Outcome(BatchOutcomeError::MaxProcessingAttemptsReached)) => {
                    self.report_all_peers(
                        network,
                        PeerAction::LowToleranceError,
                        "SyncChainMaxProcessingAttempts",
                    );
                    return self.fail(RemoveChain::ChainFailed {
                        reason: BatchOutcomeError::MaxProcessingAttemptsReached,
                        blacklist: self.sync_type == RangeSyncType::Finalized,
                    });
                }
                Err(BatchError::WrongState(e)) => {
                    return self.fail(RemoveChain::WrongChainState(e.to_string()));
                }
            }
        }
        None
    }

    /// Moves `start_epoch` forward, dropping and validating every batch
    /// before `new_start_epoch` and scoring peers whose failed attempts
    /// disagreed with the winning one.
    fn advance_chain<N: RangeNetworkContext<B>>(
        &mut self,
        network: &mut N,
        new_start_epoch: Epoch,
    ) -> Option<RemoveChain> {
        if new_start_epoch <= self.start_epoch {
            return None;
        }

        let epochs: Vec<Epoch> = self.batches.range(..new_start_epoch).map(|(e, _)| *e).collect();
        for epoch in epochs {
            let mut batch = self.batches.remove(&epoch).expect("just collected key");
            if matches!(batch.state(), BatchState::AwaitingValidation { .. }) {
                match batch.validation_success() {
                    Ok(winning) => self.score_failed_attempts(network, &batch, &winning),
                    Err(e) => return self.fail(RemoveChain::WrongChainState(e.to_string())),
                }
            }
            self.validated_epochs += self.config.epochs_per_batch;
        }
        self.start_epoch = new_start_epoch;
        self.refresh_targets();
        None
    }

    fn score_failed_attempts<N: RangeNetworkContext<B>>(
        &self,
        network: &mut N,
        batch: &BatchInfo<B>,
        winning: &Attempt,
    ) {
        for failed in batch.failed_processing_attempts() {
            if failed.hash == winning.hash {
                continue;
            }
            if failed.peer == winning.peer {
                network.report_peer(
                    failed.peer.clone(),
                    PeerAction::MidToleranceError,
                    "SyncChainInvalidBatchSelf",
                );
            } else {
                network.report_peer(
                    failed.peer.clone(),
                    PeerAction::LowToleranceError,
                    "SyncChainInvalidBatchOther",
                );
            }
        }
    }
}

impl<B: Block> fmt::Display for SyncingChain<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain(id: {}, type: {}, start_epoch: {}, peers: {}, status: {})",
            self.id,
            self.sync_type,
            self.start_epoch,
            self.peers.len(),
            self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BlocksByRangeRequest;
    use crate::types::{Hash256, Slot};
    use std::collections::HashMap as StdHashMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestBlock {
        slot: Slot,
        root: Hash256,
        parent_root: Hash256,
    }

    impl Block for TestBlock {
        fn slot(&self) -> Slot {
            self.slot
        }
        fn canonical_root(&self) -> Hash256 {
            self.root
        }
        fn parent_root(&self) -> Hash256 {
            self.parent_root
        }
    }

    fn blocks_for(request: BlocksByRangeRequest, tag: u8) -> Vec<TestBlock> {
        (0..request.count)
            .map(|i| TestBlock {
                slot: request.start_slot + i,
                root: Hash256::repeat_byte(tag),
                parent_root: Hash256::repeat_byte(tag),
            })
            .collect()
    }

    #[derive(Default)]
    struct FakeNetwork {
        next_id: RequestId,
        requests: StdHashMap<RequestId, (PeerId, BlocksByRangeRequest, ChainId, BatchId)>,
        segments: Vec<(ChainProcessId, usize)>,
        reports: Vec<(PeerId, PeerAction, &'static str)>,
    }

    impl RangeNetworkContext<TestBlock> for FakeNetwork {
        fn send_range_request(
            &mut self,
            peer_id: PeerId,
            request: BlocksByRangeRequest,
            chain_id: ChainId,
            batch_id: BatchId,
        ) -> RequestId {
            self.next_id += 1;
            self.requests
                .insert(self.next_id, (peer_id, request, chain_id, batch_id));
            self.next_id
        }

        fn send_chain_segment(&mut self, process_id: ChainProcessId, blocks: Vec<TestBlock>) {
            self.segments.push((process_id, blocks.len()));
        }

        fn report_peer(&mut self, peer_id: PeerId, action: PeerAction, reason: &'static str) {
            self.reports.push((peer_id, action, reason));
        }
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_chain() -> SyncingChain<TestBlock> {
        SyncingChain::new(
            Epoch::new(0),
            RangeSyncType::Finalized,
            RangeSyncConfig::default(),
            test_logger(),
        )
    }

    fn target(slot: u64) -> ChainTarget {
        ChainTarget {
            slot: Slot::new(slot),
            root: Hash256::repeat_byte(9),
        }
    }

    #[test]
    fn start_syncing_dispatches_a_download_per_idle_peer() {
        let mut network = FakeNetwork::default();
        let mut chain = test_chain();
        chain.add_peer(PeerId::from("a"), target(1_000));
        chain.add_peer(PeerId::from("b"), target(1_000));

        chain.start_syncing(&mut network, Epoch::new(0)).unwrap();

        assert_eq!(network.requests.len(), 2);
        assert_eq!(chain.status(), ChainSyncingState::Syncing);
    }

    #[test]
    fn full_batch_roundtrip_advances_start_epoch() {
        let mut network = FakeNetwork::default();
        let mut chain = test_chain();
        chain.add_peer(PeerId::from("a"), target(1_000));
        chain.start_syncing(&mut network, Epoch::new(0)).unwrap();

        // Batch 0 downloads and processes; it lands in AwaitingValidation but
        // does not itself advance start_epoch yet — only a *later* batch's
        // success validates it (advance_chain only drops batches strictly
        // before the one that just succeeded).
        let (request_id, (_peer, request, _chain_id, batch_id)) = network
            .requests
            .iter()
            .map(|(id, v)| (*id, v.clone()))
            .min_by_key(|(_, (_, _, _, bid))| *bid)
            .unwrap();
        assert_eq!(batch_id, Epoch::new(0));
        chain.on_block_response(&mut network, batch_id, request_id, blocks_for(request, 1));

        assert_eq!(network.segments.len(), 1);
        let (process_id_0, len) = network.segments[0].clone();
        assert!(len > 0);
        chain.on_batch_process_result(
            &mut network,
            process_id_0.batch_id,
            BatchProcessResult::Success { sent_blocks: true },
        );
        assert_eq!(chain.start_epoch(), Epoch::new(0));

        // The now-idle peer was handed batch 2 while batch 0 was processing.
        // Downloading and processing it validates batch 0 too.
        let (request_id_2, (_peer, request_2, _chain_id, batch_id_2)) = network
            .requests
            .iter()
            .map(|(id, v)| (*id, v.clone()))
            .find(|(_, (_, _, _, bid))| *bid == Epoch::new(2))
            .unwrap();
        chain.on_block_response(&mut network, batch_id_2, request_id_2, blocks_for(request_2, 2));

        let (process_id_2, _) = network
            .segments
            .iter()
            .find(|(pid, _)| pid.batch_id == Epoch::new(2))
            .cloned()
            .unwrap();
        chain.on_batch_process_result(
            &mut network,
            process_id_2.batch_id,
            BatchProcessResult::Success { sent_blocks: true },
        );

        assert_eq!(chain.start_epoch(), Epoch::new(2));
        assert_eq!(chain.validated_epochs(), 2);
    }

    #[test]
    fn empty_peer_pool_after_removal_tears_down_chain() {
        let mut network = FakeNetwork::default();
        let mut chain = test_chain();
        chain.add_peer(PeerId::from("a"), target(1_000));
        chain.start_syncing(&mut network, Epoch::new(0)).unwrap();

        let removed = chain.remove_peer(&mut network, &PeerId::from("a"));
        assert_eq!(removed, Some(RemoveChain::EmptyPeerPool));
    }

    #[test]
    fn failed_processing_batch_returns_to_download_and_retries_immediately() {
        let mut network = FakeNetwork::default();
        let mut chain = test_chain();
        chain.add_peer(PeerId::from("a"), target(1_000));
        chain.add_peer(PeerId::from("b"), target(1_000));
        chain.start_syncing(&mut network, Epoch::new(0)).unwrap();

        let (request_id, (_peer, request, _chain_id, batch_id)) = network
            .requests
            .iter()
            .map(|(id, v)| (*id, v.clone()))
            .min_by_key(|(_, (_, _, _, bid))| *bid)
            .unwrap();
        chain.on_block_response(&mut network, batch_id, request_id, blocks_for(request, 1));
        assert_eq!(network.segments.len(), 1);
        let process_id = network.segments[0].0;

        chain.on_batch_process_result(
            &mut network,
            process_id.batch_id,
            BatchProcessResult::Failed(crate::error::ChainSegmentFailure {
                imported_blocks: 0,
                message: "bad block".into(),
            }),
        );

        // Invalidated back to AwaitingDownload and immediately retried.
        assert!(chain
            .batches()
            .get(&batch_id)
            .map(|b| matches!(b.state(), BatchState::Downloading { .. }))
            .unwrap_or(false));
    }

    fn request_for(
        network: &FakeNetwork,
        batch_id: BatchId,
    ) -> (RequestId, BlocksByRangeRequest) {
        network
            .requests
            .iter()
            .filter(|(_, (_, _, _, bid))| *bid == batch_id)
            .max_by_key(|(id, _)| **id)
            .map(|(id, (_, request, _, _))| (*id, *request))
            .unwrap()
    }

    fn process_id_for(network: &FakeNetwork, batch_id: BatchId) -> ChainProcessId {
        network
            .segments
            .iter()
            .map(|(pid, _)| *pid)
            .filter(|pid| pid.batch_id == batch_id)
            .last()
            .unwrap()
    }

    // A batch in the middle of the chain (epoch 2) fails processing, is
    // redownloaded from a different peer and succeeds, and once a later
    // batch validates it the original peer is reported for the bad batch it
    // handed over.
    #[test]
    fn invalid_middle_batch_reports_the_original_peer() {
        let mut network = FakeNetwork::default();
        let mut chain = test_chain();
        chain.add_peer(PeerId::from("zz"), target(150));
        chain.start_syncing(&mut network, Epoch::new(0)).unwrap();

        // zz downloads and processes batch 0, then (being the only peer)
        // immediately picks up batch 2, then batch 4.
        let (req0, blocks0) = request_for(&network, Epoch::new(0));
        chain.on_block_response(&mut network, Epoch::new(0), req0, blocks_for(blocks0, 1));
        let pid0 = process_id_for(&network, Epoch::new(0));
        chain.on_batch_process_result(
            &mut network,
            pid0.batch_id,
            BatchProcessResult::Success { sent_blocks: true },
        );

        let (req2, blocks2) = request_for(&network, Epoch::new(2));
        chain.on_block_response(&mut network, Epoch::new(2), req2, blocks_for(blocks2, 2));

        let (req4, blocks4) = request_for(&network, Epoch::new(4));
        chain.on_block_response(&mut network, Epoch::new(4), req4, blocks_for(blocks4, 4));

        // A second peer joins with nothing in flight, so it wins any retry.
        chain.add_peer(PeerId::from("aa"), target(150));

        // Batch 2's processing comes back bad, having imported some blocks
        // before hitting the invalid one.
        let process_result = chain.on_batch_process_result(
            &mut network,
            Epoch::new(2),
            BatchProcessResult::Failed(crate::error::ChainSegmentFailure {
                imported_blocks: 3,
                message: "bad block".into(),
            }),
        );
        assert!(process_result.is_none());
        assert_eq!(chain.start_epoch(), Epoch::new(2));

        // Redownloaded — from aa, since zz is still busy with batch 4.
        let (req2b, peer2b, blocks2b) = network
            .requests
            .iter()
            .filter(|(_, (_, _, _, bid))| *bid == Epoch::new(2))
            .max_by_key(|(id, _)| **id)
            .map(|(id, (peer, req, _, _))| (*id, peer.clone(), *req))
            .unwrap();
        assert_eq!(peer2b, PeerId::from("aa"));
        chain.on_block_response(&mut network, Epoch::new(2), req2b, blocks_for(blocks2b, 3));

        let pid2b = process_id_for(&network, Epoch::new(2));
        chain.on_batch_process_result(
            &mut network,
            pid2b.batch_id,
            BatchProcessResult::Success { sent_blocks: true },
        );

        // Batch 4 finally succeeds too, validating batch 2 and scoring zz's
        // earlier, now-overridden attempt.
        let pid4 = process_id_for(&network, Epoch::new(4));
        chain.on_batch_process_result(
            &mut network,
            pid4.batch_id,
            BatchProcessResult::Success { sent_blocks: true },
        );

        assert!(network.reports.contains(&(
            PeerId::from("zz"),
            PeerAction::LowToleranceError,
            "SyncChainInvalidBatchOther"
        )));
        assert_eq!(chain.start_epoch(), Epoch::new(4));
    }

    // A single peer's batch fails processing once, then on retry (being the
    // only peer available) corrects itself. Once validated, it is still
    // reported for the earlier bad attempt — but with the lighter, same-peer
    // reason.
    #[test]
    fn self_corrected_batch_reports_the_same_peer() {
        let mut network = FakeNetwork::default();
        let mut chain = SyncingChain::new(
            Epoch::new(2),
            RangeSyncType::Finalized,
            RangeSyncConfig::default(),
            test_logger(),
        );
        chain.add_peer(PeerId::from("solo"), target(150));
        chain.start_syncing(&mut network, Epoch::new(2)).unwrap();

        let (req_a, blocks_a) = request_for(&network, Epoch::new(2));
        chain.on_block_response(&mut network, Epoch::new(2), req_a, blocks_for(blocks_a, 1));
        let pid_a = process_id_for(&network, Epoch::new(2));
        chain.on_batch_process_result(
            &mut network,
            pid_a.batch_id,
            BatchProcessResult::Failed(crate::error::ChainSegmentFailure {
                imported_blocks: 0,
                message: "bad block".into(),
            }),
        );

        // Retried, necessarily against the same (only) peer.
        let (req_b, blocks_b) = request_for(&network, Epoch::new(2));
        assert_ne!(req_a, req_b);
        chain.on_block_response(&mut network, Epoch::new(2), req_b, blocks_for(blocks_b, 2));
        let pid_b = process_id_for(&network, Epoch::new(2));
        chain.on_batch_process_result(
            &mut network,
            pid_b.batch_id,
            BatchProcessResult::Success { sent_blocks: true },
        );
        assert_eq!(chain.start_epoch(), Epoch::new(2));

        // Batch 4 validates batch 2.
        let (req4, blocks4) = request_for(&network, Epoch::new(4));
        chain.on_block_response(&mut network, Epoch::new(4), req4, blocks_for(blocks4, 3));
        let pid4 = process_id_for(&network, Epoch::new(4));
        chain.on_batch_process_result(
            &mut network,
            pid4.batch_id,
            BatchProcessResult::Success { sent_blocks: true },
        );

        assert!(network.reports.contains(&(
            PeerId::from("solo"),
            PeerAction::MidToleranceError,
            "SyncChainInvalidBatchSelf"
        )));
        assert_eq!(chain.start_epoch(), Epoch::new(4));
    }

    // A batch keeps failing processing until it exhausts its retry budget:
    // the chain fails outright and every peer in its pool is penalized,
    // regardless of which one actually downloaded the bad batch.
    #[test]
    fn exhausted_processing_attempts_fails_the_chain_and_reports_every_peer() {
        let config = RangeSyncConfig {
            max_processing_attempts: 2,
            ..RangeSyncConfig::default()
        };
        let mut network = FakeNetwork::default();
        let mut chain = SyncingChain::new(Epoch::new(0), RangeSyncType::Finalized, config, test_logger());
        chain.add_peer(PeerId::from("a"), target(150));
        chain.add_peer(PeerId::from("b"), target(150));
        chain.start_syncing(&mut network, Epoch::new(0)).unwrap();

        let (req0, blocks0) = request_for(&network, Epoch::new(0));
        chain.on_block_response(&mut network, Epoch::new(0), req0, blocks_for(blocks0, 1));
        let pid0 = process_id_for(&network, Epoch::new(0));
        chain.on_batch_process_result(
            &mut network,
            pid0.batch_id,
            BatchProcessResult::Failed(crate::error::ChainSegmentFailure {
                imported_blocks: 0,
                message: "bad block".into(),
            }),
        );

        let (req0b, blocks0b) = request_for(&network, Epoch::new(0));
        chain.on_block_response(&mut network, Epoch::new(0), req0b, blocks_for(blocks0b, 2));
        let pid0b = process_id_for(&network, Epoch::new(0));
        let removed = chain.on_batch_process_result(
            &mut network,
            pid0b.batch_id,
            BatchProcessResult::Failed(crate::error::ChainSegmentFailure {
                imported_blocks: 0,
                message: "bad block".into(),
            }),
        );

        assert_eq!(
            removed,
            Some(RemoveChain::ChainFailed {
                reason: BatchOutcomeError::MaxProcessingAttemptsReached,
                blacklist: true,
            })
        );
        assert_eq!(chain.status(), ChainSyncingState::Error);

        let max_attempt_reports: Vec<_> = network
            .reports
            .iter()
            .filter(|(_, action, reason)| {
                *action == PeerAction::LowToleranceError && *reason == "SyncChainMaxProcessingAttempts"
            })
            .map(|(peer, _, _)| peer.clone())
            .collect();
        assert_eq!(max_attempt_reports.len(), 2);
        assert!(max_attempt_reports.contains(&PeerId::from("a")));
        assert!(max_attempt_reports.contains(&PeerId::from("b")));
    }
}
