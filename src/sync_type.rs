//! Peer classification into the kind of range sync they're useful for.

use crate::types::SyncInfo;
use std::fmt;

/// What kind of range sync a peer is useful for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeSyncType {
    /// The peer's finalized epoch is ahead of ours and we don't know its
    /// finalized root — sync up to that finalized checkpoint.
    Finalized,
    /// The peer's finalized root is known locally and its head is ahead of
    /// ours — a short-range sync to its head.
    Head,
}

impl RangeSyncType {
    /// Classifies a peer given our local status, its reported status, and
    /// whether we already know its claimed finalized root (a fork-choice /
    /// block-store lookup that is this crate's caller's responsibility).
    /// Returns `None` when the peer is irrelevant to range sync.
    pub fn new(
        local: &SyncInfo,
        remote: &SyncInfo,
        remote_finalized_root_known_locally: bool,
    ) -> Option<RangeSyncType> {
        if remote.finalized_epoch <= local.finalized_epoch && remote.head_slot <= local.head_slot {
            return None;
        }

        if remote.finalized_epoch > local.finalized_epoch && !remote_finalized_root_known_locally {
            return Some(RangeSyncType::Finalized);
        }

        if remote_finalized_root_known_locally && remote.head_slot > local.head_slot {
            return Some(RangeSyncType::Head);
        }

        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeSyncType::Finalized => "Finalized",
            RangeSyncType::Head => "Head",
        }
    }
}

impl fmt::Display for RangeSyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
