//! The `Batch`: a unit of work covering `epochs_per_batch` consecutive
//! epochs.
//!
//! A batch is a passive value type. All mutation happens through its
//! state-machine methods, each of which validates the current discriminant
//! and moves the owned payload — there is no cyclic reference back to the
//! owning chain.

use crate::block::Block;
use crate::error::{BatchOutcomeError, WrongBatchState};
use crate::types::{Epoch, Hash256, PeerId, Slot};
use std::fmt;
use std::mem;

/// Tunables for batch sizing and retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub slots_per_epoch: u64,
    pub epochs_per_batch: u64,
    pub batch_slot_offset: u64,
    pub max_download_attempts: usize,
    pub max_processing_attempts: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            slots_per_epoch: 32,
            epochs_per_batch: 2,
            batch_slot_offset: 1,
            max_download_attempts: 5,
            max_processing_attempts: 3,
        }
    }
}

/// The `beacon_blocks_by_range` request a batch resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlocksByRangeRequest {
    pub start_slot: Slot,
    pub count: u64,
    pub step: u64,
}

/// A `(peer, hash-of-blocks)` witness of one download that reached processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub peer: PeerId,
    pub hash: Hash256,
}

/// Either a transition was attempted from the wrong state, or a retry cap
/// was exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    WrongState(WrongBatchState),
    Outcome(BatchOutcomeError),
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::WrongState(e) => write!(f, "{e}"),
            BatchError::Outcome(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BatchError {}

impl From<WrongBatchState> for BatchError {
    fn from(e: WrongBatchState) -> Self {
        BatchError::WrongState(e)
    }
}

impl From<BatchOutcomeError> for BatchError {
    fn from(e: BatchOutcomeError) -> Self {
        BatchError::Outcome(e)
    }
}

#[derive(Debug, Clone)]
pub enum BatchState<B> {
    AwaitingDownload,
    Downloading { peer: PeerId },
    AwaitingProcessing { peer: PeerId, blocks: Vec<B> },
    Processing { attempt: Attempt },
    AwaitingValidation { attempt: Attempt },
    /// Only ever observed transiently while a transition method is mutating
    /// `self.state` in place; never visible to a caller.
    Poisoned,
}

impl<B> BatchState<B> {
    fn tag(&self) -> &'static str {
        match self {
            BatchState::AwaitingDownload => "AwaitingDownload",
            BatchState::Downloading { .. } => "Downloading",
            BatchState::AwaitingProcessing { .. } => "AwaitingProcessing",
            BatchState::Processing { .. } => "Processing",
            BatchState::AwaitingValidation { .. } => "AwaitingValidation",
            BatchState::Poisoned => "Poisoned",
        }
    }
}

/// Domain-separated hash over the ordered sequence of block hash-tree-roots.
/// Two peers returning the same ordered `blocks` produce the same hash.
pub fn hash_of_blocks<B: Block>(blocks: &[B]) -> Hash256 {
    let mut buf = Vec::with_capacity(b"range_sync.batch_attempt".len() + 32 * blocks.len());
    buf.extend_from_slice(b"range_sync.batch_attempt");
    for block in blocks {
        buf.extend_from_slice(block.canonical_root().as_slice());
    }
    alloy_primitives::keccak256(&buf)
}

/// A unit of work covering `config.epochs_per_batch` consecutive epochs.
#[derive(Debug, Clone)]
pub struct BatchInfo<B> {
    start_epoch: Epoch,
    config: BatchConfig,
    state: BatchState<B>,
    failed_download_attempts: Vec<PeerId>,
    failed_processing_attempts: Vec<Attempt>,
}

impl<B: Block> BatchInfo<B> {
    pub fn new(start_epoch: Epoch, config: BatchConfig) -> Self {
        BatchInfo {
            start_epoch,
            config,
            state: BatchState::AwaitingDownload,
            failed_download_attempts: Vec::new(),
            failed_processing_attempts: Vec::new(),
        }
    }

    pub fn start_epoch(&self) -> Epoch {
        self.start_epoch
    }

    pub fn state(&self) -> &BatchState<B> {
        &self.state
    }

    pub fn failed_processing_attempts(&self) -> &[Attempt] {
        &self.failed_processing_attempts
    }

    /// Peers this batch should not be retried against.
    pub fn failed_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.failed_download_attempts.iter()
    }

    /// The number of currently-active (`Downloading`) requests this batch
    /// represents against `peer` — always 0 or 1, but exposed for the
    /// peer-balancer's "fewest active downloads" comparisons.
    pub fn active_request_for(&self, peer: &PeerId) -> usize {
        match &self.state {
            BatchState::Downloading { peer: p } if p == peer => 1,
            _ => 0,
        }
    }

    /// `request = { startSlot, count, step: 1 }`. The first slot of the
    /// epoch is assumed already held by the previous batch
    /// (`BATCH_SLOT_OFFSET`).
    pub fn request(&self) -> BlocksByRangeRequest {
        BlocksByRangeRequest {
            start_slot: self.start_epoch.start_slot(self.config.slots_per_epoch)
                + self.config.batch_slot_offset,
            count: self.config.epochs_per_batch * self.config.slots_per_epoch,
            step: 1,
        }
    }

    fn wrong_state(op: &'static str) -> BatchError {
        BatchError::WrongState(WrongBatchState(op))
    }

    pub fn start_downloading(&mut self, peer: PeerId) -> Result<(), BatchError> {
        match mem::replace(&mut self.state, BatchState::Poisoned) {
            BatchState::AwaitingDownload => {
                self.state = BatchState::Downloading { peer };
                Ok(())
            }
            other => {
                self.state = other;
                Err(Self::wrong_state("start_downloading"))
            }
        }
    }

    pub fn downloading_success(&mut self, blocks: Vec<B>) -> Result<(), BatchError> {
        match mem::replace(&mut self.state, BatchState::Poisoned) {
            BatchState::Downloading { peer } => {
                self.state = BatchState::AwaitingProcessing { peer, blocks };
                Ok(())
            }
            other => {
                self.state = other;
                Err(Self::wrong_state("downloading_success"))
            }
        }
    }

    /// Append the failed peer and fall back to `AwaitingDownload`. Returns
    /// `Err(MaxDownloadAttemptsReached)` once the retry budget is spent —
    /// the batch still lands in `AwaitingDownload`, but the caller
    /// (`SyncingChain`) is expected to end the chain instead of retrying it.
    pub fn downloading_error(&mut self) -> Result<(), BatchError> {
        match mem::replace(&mut self.state, BatchState::Poisoned) {
            BatchState::Downloading { peer } => {
                self.failed_download_attempts.push(peer);
                self.state = BatchState::AwaitingDownload;
                if self.failed_download_attempts.len() >= self.config.max_download_attempts {
                    Err(BatchError::Outcome(BatchOutcomeError::MaxDownloadAttemptsReached))
                } else {
                    Ok(())
                }
            }
            other => {
                self.state = other;
                Err(Self::wrong_state("downloading_error"))
            }
        }
    }

    pub fn start_processing(&mut self) -> Result<Vec<B>, BatchError> {
        match mem::replace(&mut self.state, BatchState::Poisoned) {
            BatchState::AwaitingProcessing { peer, blocks } => {
                let hash = hash_of_blocks(&blocks);
                self.state = BatchState::Processing {
                    attempt: Attempt { peer, hash },
                };
                Ok(blocks)
            }
            other => {
                self.state = other;
                Err(Self::wrong_state("start_processing"))
            }
        }
    }

    pub fn processing_success(&mut self) -> Result<(), BatchError> {
        match mem::replace(&mut self.state, BatchState::Poisoned) {
            BatchState::Processing { attempt } => {
                self.state = BatchState::AwaitingValidation { attempt };
                Ok(())
            }
            other => {
                self.state = other;
                Err(Self::wrong_state("processing_success"))
            }
        }
    }

    pub fn processing_error(&mut self) -> Result<(), BatchError> {
        match mem::replace(&mut self.state, BatchState::Poisoned) {
            BatchState::Processing { attempt } => {
                self.failed_processing_attempts.push(attempt);
                self.state = BatchState::AwaitingDownload;
                if self.failed_processing_attempts.len() >= self.config.max_processing_attempts {
                    Err(BatchError::Outcome(BatchOutcomeError::MaxProcessingAttemptsReached))
                } else {
                    Ok(())
                }
            }
            other => {
                self.state = other;
                Err(Self::wrong_state("processing_error"))
            }
        }
    }

    pub fn validation_error(&mut self) -> Result<(), BatchError> {
        match mem::replace(&mut self.state, BatchState::Poisoned) {
            BatchState::AwaitingValidation { attempt } => {
                self.failed_processing_attempts.push(attempt);
                self.state = BatchState::AwaitingDownload;
                if self.failed_processing_attempts.len() >= self.config.max_processing_attempts {
                    Err(BatchError::Outcome(BatchOutcomeError::MaxProcessingAttemptsReached))
                } else {
                    Ok(())
                }
            }
            other => {
                self.state = other;
                Err(Self::wrong_state("validation_error"))
            }
        }
    }

    /// Finalizes the batch, returning the winning attempt for peer-scoring.
    /// The caller is expected to drop this batch from the owning chain's map.
    pub fn validation_success(&mut self) -> Result<Attempt, BatchError> {
        match mem::replace(&mut self.state, BatchState::Poisoned) {
            BatchState::AwaitingValidation { attempt } => {
                self.state = BatchState::Poisoned;
                Ok(attempt)
            }
            other => {
                self.state = other;
                Err(Self::wrong_state("validation_success"))
            }
        }
    }
}

impl<B> fmt::Display for BatchInfo<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch(start_epoch: {}, state: {})",
            self.start_epoch,
            self.state.tag()
        )
    }
}
