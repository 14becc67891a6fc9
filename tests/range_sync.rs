//! End-to-end scenarios driving `RangeSync` through its public facade,
//! using a small recording fake for `RangeNetworkContext`.

use range_sync::{
    BatchId, BatchProcessResult, Block, BlocksByRangeRequest, ChainId, ChainProcessId, Epoch,
    Hash256, PeerAction, PeerId, RangeNetworkContext, RangeSync, RangeSyncConfig, RequestId, Slot,
    SyncChainStatus, SyncInfo,
};
use std::collections::HashMap;

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
struct TestNetworkContext {
    next_id: RequestId,
    requests: HashMap<RequestId, (PeerId, BlocksByRangeRequest, ChainId, BatchId)>,
    segments: Vec<(ChainProcessId, Vec<TestBlock>)>,
    reports: Vec<(PeerId, PeerAction, &'static str)>,
}

impl RangeNetworkContext<TestBlock> for TestNetworkContext {
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
        self.segments.push((process_id, blocks));
    }

    fn report_peer(&mut self, peer_id: PeerId, action: PeerAction, reason: &'static str) {
        self.reports.push((peer_id, action, reason));
    }
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn local_info() -> SyncInfo {
    SyncInfo {
        head_slot: Slot::new(0),
        head_root: Hash256::repeat_byte(0xaa),
        finalized_epoch: Epoch::new(0),
        finalized_root: Hash256::repeat_byte(0xbb),
    }
}

fn remote_finalized(finalized_epoch: u64, finalized_root: Hash256) -> SyncInfo {
    SyncInfo {
        head_slot: Slot::new(finalized_epoch * 32 + 200),
        head_root: Hash256::repeat_byte(0xcc),
        finalized_epoch: Epoch::new(finalized_epoch),
        finalized_root,
    }
}

/// Narrowed to the two batches this target actually needs: a single
/// well-behaved peer downloads and processes every batch correctly, the
/// chain reaches `Synced` and is purged, and nobody gets reported.
#[test]
fn clean_sync_reaches_synced_with_no_peer_reports() {
    let mut network = TestNetworkContext::default();
    let mut range: RangeSync<TestBlock> =
        RangeSync::new(RangeSyncConfig::default(), test_logger());

    let target_root = Hash256::repeat_byte(42);
    let remote = remote_finalized(1, target_root);
    range.add_peer(&mut network, local_info(), PeerId::from("a"), remote, false);
    assert_eq!(range.state(), Some(SyncChainStatus::Finalized));

    // Batch 0 is the only thing dispatched so far (single peer).
    let (req0, (_, request0, chain_id, batch0)) = network
        .requests
        .iter()
        .map(|(id, v)| (*id, v.clone()))
        .next()
        .unwrap();
    assert_eq!(batch0, Epoch::new(0));

    range.blocks_by_range_response(
        &mut network,
        local_info(),
        chain_id,
        batch0,
        req0,
        blocks_for(request0, 1),
    );
    // Batch 0 started processing, and the now-idle peer picked up batch 2.
    assert_eq!(network.segments.len(), 1);
    let (process_id_0, _) = network.segments[0].clone();

    range.handle_block_process_result(
        &mut network,
        local_info(),
        process_id_0.chain_id,
        process_id_0.batch_id,
        BatchProcessResult::Success { sent_blocks: true },
    );
    // One batch's success doesn't reach the target slot on its own yet.
    assert_eq!(range.state(), Some(SyncChainStatus::Finalized));

    let (req2, (_, request2, _, batch2)) = network
        .requests
        .iter()
        .map(|(id, v)| (*id, v.clone()))
        .find(|(_, (_, _, _, b))| *b == Epoch::new(2))
        .unwrap();
    range.blocks_by_range_response(
        &mut network,
        local_info(),
        chain_id,
        batch2,
        req2,
        blocks_for(request2, 2),
    );
    let (process_id_2, _) = network
        .segments
        .iter()
        .find(|(pid, _)| pid.batch_id == Epoch::new(2))
        .cloned()
        .unwrap();

    range.handle_block_process_result(
        &mut network,
        local_info(),
        process_id_2.chain_id,
        process_id_2.batch_id,
        BatchProcessResult::Success { sent_blocks: true },
    );

    assert_eq!(range.state(), None);
    assert!(network.reports.is_empty());
}

/// A lone peer disconnecting mid-sync empties the chain's peer pool, which
/// tears the chain down without ever reaching `Synced`.
#[test]
fn sole_peer_disconnect_tears_down_the_chain() {
    let mut network = TestNetworkContext::default();
    let mut range: RangeSync<TestBlock> =
        RangeSync::new(RangeSyncConfig::default(), test_logger());

    let remote = remote_finalized(1, Hash256::repeat_byte(9));
    let peer_id = PeerId::from("solo");
    range.add_peer(&mut network, local_info(), peer_id.clone(), remote, false);
    assert_eq!(range.state(), Some(SyncChainStatus::Finalized));

    range.peer_disconnect(&mut network, local_info(), &peer_id);

    assert_eq!(range.state(), None);
}
