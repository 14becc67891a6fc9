//! Pure functions over a chain's batch set.
//!
//! None of these touch the network or peer set; `SyncingChain` calls them to
//! decide what to do next.

use crate::batch::BatchInfo;
use crate::block::Block;
use crate::types::Epoch;
use std::collections::BTreeMap;
use std::fmt;

pub type Batches<B> = BTreeMap<Epoch, BatchInfo<B>>;

/// `validate_batches_status` caught an illegal pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidBatchOrder(pub String);

impl fmt::Display for InvalidBatchOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid batch order: {}", self.0)
    }
}

impl std::error::Error for InvalidBatchOrder {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Seen only `AwaitingValidation` batches so far.
    Validating,
    /// Seen the (at most one) `Processing` batch.
    Processing,
    /// Seen a pre-processing batch (`AwaitingDownload` | `Downloading` | `AwaitingProcessing`).
    PreProcessing,
}

/// Walks batches in ascending `start_epoch` order and rejects any ordering
/// that doesn't match:
/// `AwaitingValidation* Processing? (AwaitingDownload|Downloading|AwaitingProcessing)*`
pub fn validate_batches_status<B: Block>(batches: &Batches<B>) -> Result<(), InvalidBatchOrder> {
    let mut phase = Phase::Validating;
    for batch in batches.values() {
        use crate::batch::BatchState::*;
        match batch.state() {
            AwaitingValidation { .. } => {
                if phase != Phase::Validating {
                    return Err(InvalidBatchOrder(format!(
                        "batch {} is AwaitingValidation after {:?}",
                        batch.start_epoch(),
                        phase
                    )));
                }
            }
            Processing { .. } => {
                if phase == Phase::PreProcessing {
                    return Err(InvalidBatchOrder(format!(
                        "batch {} is Processing after a pre-processing batch",
                        batch.start_epoch()
                    )));
                }
                if phase == Phase::Processing {
                    return Err(InvalidBatchOrder(format!(
                        "more than one batch Processing at batch {}",
                        batch.start_epoch()
                    )));
                }
                phase = Phase::Processing;
            }
            AwaitingDownload | Downloading { .. } | AwaitingProcessing { .. } => {
                phase = Phase::PreProcessing;
            }
            Poisoned => {
                return Err(InvalidBatchOrder(format!(
                    "batch {} observed in a transient poisoned state",
                    batch.start_epoch()
                )));
            }
        }
    }
    Ok(())
}

/// The first batch (in ascending `start_epoch` order) ready to be fed to the
/// processor, skipping a leading run of `AwaitingValidation` batches.
/// Returns `None` if the first non-`AwaitingValidation` batch is not yet
/// `AwaitingProcessing` (i.e. it's `AwaitingDownload`, `Downloading`, or
/// already `Processing`).
pub fn get_next_batch_to_process<B: Block>(batches: &Batches<B>) -> Option<Epoch> {
    use crate::batch::BatchState::*;
    for (epoch, batch) in batches.iter() {
        match batch.state() {
            AwaitingValidation { .. } => continue,
            AwaitingProcessing { .. } => return Some(*epoch),
            _ => return None,
        }
    }
    None
}

/// `max(startEpoch)` among `AwaitingValidation` batches, plus
/// `epochs_per_batch`, or `anchor` if there are none.
pub fn to_be_processed_start_epoch<B: Block>(
    batches: &Batches<B>,
    anchor: Epoch,
    epochs_per_batch: u64,
) -> Epoch {
    use crate::batch::BatchState::AwaitingValidation;
    batches
        .iter()
        .filter(|(_, b)| matches!(b.state(), AwaitingValidation { .. }))
        .map(|(epoch, _)| *epoch)
        .max()
        .map(|epoch| epoch + epochs_per_batch)
        .unwrap_or(anchor)
}

/// `lastBatch.startEpoch + epochs_per_batch`, or `anchor` if `batches` is empty.
pub fn to_be_downloaded_start_epoch<B: Block>(
    batches: &Batches<B>,
    anchor: Epoch,
    epochs_per_batch: u64,
) -> Epoch {
    batches
        .keys()
        .next_back()
        .map(|epoch| *epoch + epochs_per_batch)
        .unwrap_or(anchor)
}
