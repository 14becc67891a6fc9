//! Error taxonomy.
//!
//! Transient, per-batch download/process errors are absorbed locally by
//! `Batch`/`SyncingChain` and never reach these top-level types; only
//! fatal, chain-ending conditions are represented here.

use std::fmt;

/// A `Batch` state-machine transition was invoked from a state that doesn't
/// support it. Always a bug in the calling code (`SyncingChain`), never
/// caused by remote input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongBatchState(pub &'static str);

impl fmt::Display for WrongBatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wrong batch state for operation: {}", self.0)
    }
}

impl std::error::Error for WrongBatchState {}

/// A batch exhausted its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcomeError {
    /// The batch failed to download `max_download_attempts` times.
    MaxDownloadAttemptsReached,
    /// The batch failed to process (or validate) `max_processing_attempts` times.
    MaxProcessingAttemptsReached,
}

impl fmt::Display for BatchOutcomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcomeError::MaxDownloadAttemptsReached => {
                write!(f, "batch exceeded maximum download attempts")
            }
            BatchOutcomeError::MaxProcessingAttemptsReached => {
                write!(f, "batch exceeded maximum processing attempts")
            }
        }
    }
}

impl std::error::Error for BatchOutcomeError {}

/// Why a `SyncingChain` was torn down. Reported up to `RangeSync`, which logs
/// it and decides whether to blacklist the chain's target root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveChain {
    /// The chain reached its target and is considered synced.
    Synced,
    /// An internal invariant was violated (`ChainOrdering::validate_batches_status`
    /// failed, or a batch method was called out of state).
    WrongChainState(String),
    /// A batch exceeded `max_download_attempts` or `max_processing_attempts`.
    ChainFailed {
        reason: BatchOutcomeError,
        /// Whether the chain's target root should be blacklisted for a cooldown
        /// period (only applies to finalized chains, see DESIGN.md).
        blacklist: bool,
    },
    /// The chain's peer pool emptied out.
    EmptyPeerPool,
    /// `RangeSync` decided, via chain selection, to stop (not remove) a head
    /// chain. Used internally; never surfaced through `onEnd`.
    Stopped,
}

impl RemoveChain {
    /// Whether this reason warrants a `crit!`-level log instead of `debug!`.
    pub fn is_critical(&self) -> bool {
        matches!(self, RemoveChain::WrongChainState(_))
    }
}

impl fmt::Display for RemoveChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoveChain::Synced => write!(f, "chain synced"),
            RemoveChain::WrongChainState(msg) => write!(f, "invalid chain state: {msg}"),
            RemoveChain::ChainFailed { reason, .. } => write!(f, "chain failed: {reason}"),
            RemoveChain::EmptyPeerPool => write!(f, "peer pool empty"),
            RemoveChain::Stopped => write!(f, "chain stopped"),
        }
    }
}

impl std::error::Error for RemoveChain {}

/// Caller tried to `start_syncing` a chain that already ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartAfterEndedError;

impl fmt::Display for StartAfterEndedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tried to start syncing a chain that already ended")
    }
}

impl std::error::Error for StartAfterEndedError {}

/// A generic, opaque download failure (timeout, malformed response, peer
/// disconnect mid-stream, ...). range_sync does not distinguish sub-kinds,
/// since all of them are handled the same way (`Batch::downloading_error`).
#[derive(Debug, Clone)]
pub struct DownloadError(pub String);

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "download error: {}", self.0)
    }
}

impl std::error::Error for DownloadError {}

/// The result of handing a chain segment to the external processor that
/// failed partway through. Carries the count of blocks that were
/// successfully imported before the failure, which
/// `SyncingChain::on_batch_process_result` uses to decide whether to
/// advance the chain despite the failure.
#[derive(Debug, Clone)]
pub struct ChainSegmentFailure {
    pub imported_blocks: usize,
    pub message: String,
}

impl fmt::Display for ChainSegmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain segment import failed after {} blocks: {}",
            self.imported_blocks, self.message
        )
    }
}

impl std::error::Error for ChainSegmentFailure {}
