//! Tunable configuration. All recognized options live on a single `Copy`
//! struct threaded through `RangeSync` -> `ChainCollection` ->
//! `SyncingChain` -> `BatchInfo`, rather than read from the environment.

use crate::batch::BatchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSyncConfig {
    /// Slots in one epoch, needed to convert epochs to slots; fixed per
    /// network (e.g. 32 on mainnet).
    pub slots_per_epoch: u64,
    /// Batch width in epochs. MUST be >= 1.
    pub epochs_per_batch: u64,
    /// Max concurrent non-processing downloads (`Downloading` | `AwaitingProcessing`).
    pub batch_buffer_size: usize,
    /// Peer-error retries per batch before the chain fails.
    pub max_download_attempts: usize,
    /// Processor-error retries per batch before the chain fails.
    pub max_processing_attempts: usize,
    /// Concurrent head-sync chains allowed to run.
    pub parallel_head_chains: usize,
    /// Thrash guard: a currently-syncing finalized chain is only preempted
    /// once it has validated strictly more than this many epochs.
    pub min_finalized_chain_validated_epochs: u64,
}

impl Default for RangeSyncConfig {
    fn default() -> Self {
        RangeSyncConfig {
            slots_per_epoch: 32,
            epochs_per_batch: 2,
            batch_buffer_size: 5,
            max_download_attempts: 5,
            max_processing_attempts: 3,
            parallel_head_chains: 2,
            min_finalized_chain_validated_epochs: 10,
        }
    }
}

impl RangeSyncConfig {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            slots_per_epoch: self.slots_per_epoch,
            epochs_per_batch: self.epochs_per_batch,
            batch_slot_offset: 1,
            max_download_attempts: self.max_download_attempts,
            max_processing_attempts: self.max_processing_attempts,
        }
    }
}
