//! The block type range_sync is generic over. Block-by-block verification,
//! state transition, and SSZ encoding are all external collaborator
//! concerns; range_sync only ever needs a slot, a root, and the parent link
//! it's chained from.

use crate::types::{Hash256, Slot};

/// Anything `RangeSync` can download, hash and hand to a processor.
pub trait Block: Clone + std::fmt::Debug {
    fn slot(&self) -> Slot;
    fn canonical_root(&self) -> Hash256;
    fn parent_root(&self) -> Hash256;
}
