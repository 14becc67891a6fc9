//! Outward interfaces to the external collaborators range_sync needs:
//! the `beacon_blocks_by_range` transport, the block processor, and peer
//! scoring. range_sync never talks to a socket or a state-transition
//! function directly — it only ever calls through this trait.
//!
//! Dispatch is fire-and-forget: `send_range_request`/`send_chain_segment`
//! hand a unit of work to the caller's transport/processor and return
//! immediately;
//! the result arrives later through `SyncingChain::on_block_response` /
//! `on_batch_process_result`, keyed by the `RequestId`/`ChainProcessId` that
//! was handed out at dispatch time.

use crate::batch::BlocksByRangeRequest;
use crate::chain::{BatchId, ChainId};
use crate::types::PeerAction;
use crate::types::PeerId;

/// Identifies one dispatched `beacon_blocks_by_range` request, so a later
/// `DownloadError` can be matched back to the batch that issued it.
pub type RequestId = u64;

/// Identifies one dispatched chain-segment processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainProcessId {
    pub chain_id: ChainId,
    pub batch_id: BatchId,
}

/// The narrow surface `SyncingChain`/`RangeSync` use to reach the outside
/// world. Implemented by the caller; a recording fake implementation lives
/// under `tests/` for scenario testing.
pub trait RangeNetworkContext<B> {
    /// Dispatch a `beacon_blocks_by_range` request to `peer`. Returns the id
    /// the caller must echo back in the eventual response/error.
    fn send_range_request(
        &mut self,
        peer_id: PeerId,
        request: BlocksByRangeRequest,
        chain_id: ChainId,
        batch_id: BatchId,
    ) -> RequestId;

    /// Hand an ordered chain segment to the external block processor. The
    /// result is delivered later via `on_batch_process_result`.
    fn send_chain_segment(&mut self, process_id: ChainProcessId, blocks: Vec<B>);

    /// Fire-and-forget peer score report.
    fn report_peer(&mut self, peer_id: PeerId, action: PeerAction, reason: &'static str);
}
