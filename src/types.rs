//! Small consensus-time and identity types.
//!
//! The real lighthouse workspace keeps these in the internal `types` and
//! `lighthouse_network` crates. Those are not published to crates.io, so
//! range_sync defines narrow equivalents here, following the same
//! newtype-over-integer idiom `types::Slot`/`types::Epoch` use.

use std::fmt;
use std::ops::{Add, Sub};

pub use alloy_primitives::B256 as Hash256;

/// A slot number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(u64);

/// An epoch number. One epoch spans `slots_per_epoch` consecutive slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Slot {
    pub const fn new(slot: u64) -> Self {
        Slot(slot)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The epoch containing this slot.
    pub fn epoch(self, slots_per_epoch: u64) -> Epoch {
        Epoch::new(self.0 / slots_per_epoch)
    }
}

impl Epoch {
    pub const fn new(epoch: u64) -> Self {
        Epoch(epoch)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The first slot of this epoch.
    pub fn start_slot(self, slots_per_epoch: u64) -> Slot {
        Slot::new(self.0 * slots_per_epoch)
    }

    /// Saturating distance `self - other`, zero if `other > self`.
    pub fn saturating_sub(self, other: Epoch) -> Epoch {
        Epoch::new(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for Slot {
    type Output = Slot;
    fn add(self, rhs: u64) -> Slot {
        Slot::new(self.0 + rhs)
    }
}

impl Sub<u64> for Slot {
    type Output = Slot;
    fn sub(self, rhs: u64) -> Slot {
        Slot::new(self.0 - rhs)
    }
}

impl Add<u64> for Epoch {
    type Output = Epoch;
    fn add(self, rhs: u64) -> Epoch {
        Epoch::new(self.0 + rhs)
    }
}

impl Sub<u64> for Epoch {
    type Output = Epoch;
    fn sub(self, rhs: u64) -> Epoch {
        Epoch::new(self.0 - rhs)
    }
}

impl From<u64> for Slot {
    fn from(v: u64) -> Self {
        Slot::new(v)
    }
}

impl From<u64> for Epoch {
    fn from(v: u64) -> Self {
        Epoch::new(v)
    }
}

/// Opaque identifier for a connected peer. Stands in for `lighthouse_network::PeerId`
/// (a libp2p multihash), which is not reachable from this crate's narrow interfaces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(std::sync::Arc<str>);

impl PeerId {
    pub fn new(id: impl Into<std::sync::Arc<str>>) -> Self {
        PeerId(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId::new(s)
    }
}

/// The head a peer (or a chain) is aiming for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainTarget {
    pub slot: Slot,
    pub root: Hash256,
}

impl fmt::Display for ChainTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(slot: {}, root: {})", self.slot, self.root)
    }
}

/// A peer's (or our own) view of the chain, as reported in a status handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncInfo {
    pub head_slot: Slot,
    pub head_root: Hash256,
    pub finalized_epoch: Epoch,
    pub finalized_root: Hash256,
}

/// How strongly to penalize a peer for misbehavior (§6 `reportPeer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    HighToleranceError,
    MidToleranceError,
    LowToleranceError,
    Fatal,
}
