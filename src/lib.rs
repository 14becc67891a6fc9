//! Long-range (batch) syncing core for a beacon-chain client.
//!
//! Drives block download and processing for peers whose reported head is far
//! enough ahead of ours that we resort to sequential, batched backfill
//! instead of the gossip-driven single-block path. The crate is deliberately
//! narrow: it owns peer bookkeeping, batch state machines, and chain
//! selection policy, and never touches a socket, the fork choice store, or
//! a state-transition function directly — those are reached only through
//! `RangeNetworkContext` and the `Block` trait, both supplied by the caller.

mod batch;
mod block;
mod chain;
mod chain_collection;
mod chain_ordering;
mod config;
mod error;
mod network_context;
mod peer_balancer;
mod range;
mod sync_type;
mod types;

pub use batch::{
    Attempt, BatchConfig, BatchError, BatchInfo, BatchState, BlocksByRangeRequest, hash_of_blocks,
};
pub use block::Block;
pub use chain::{BatchId, BatchProcessResult, ChainId, ChainSyncingState, SyncingChain};
pub use chain_collection::{ChainCollection, SyncChainStatus};
pub use chain_ordering::InvalidBatchOrder;
pub use config::RangeSyncConfig;
pub use error::{
    BatchOutcomeError, ChainSegmentFailure, DownloadError, RemoveChain, StartAfterEndedError,
    WrongBatchState,
};
pub use network_context::{ChainProcessId, RangeNetworkContext, RequestId};
pub use range::RangeSync;
pub use sync_type::RangeSyncType;
pub use types::{ChainTarget, Epoch, Hash256, PeerAction, PeerId, Slot, SyncInfo};
