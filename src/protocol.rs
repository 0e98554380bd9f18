//! The protocol descriptor: everything the replication core needs to know
//! about a concrete protocol, bound once as a set of associated types.
//!
//! The core never looks inside reads, writes, responses or chunks; it only
//! routes them, keyed on the regions they report.

use std::fmt::Debug;

use crate::region::Region;

/// An operation that reports the region it touches.
pub trait Op<R>: Clone + Debug + Send + Sync + 'static {
    fn region(&self) -> R;
}

/// One unit of backfill data.
///
/// Chunks are totally ordered; delivering them in ascending order lets the
/// receiver apply them monotonically.
pub trait Chunk<R>: Clone + Debug + Ord + Send + Sync + 'static {
    fn region(&self) -> R;
}

/// Capability set a protocol supplies to the core.
pub trait Protocol: Send + Sync + 'static {
    type Region: Region;
    type Read: Op<Self::Region>;
    type Write: Op<Self::Region>;
    type ReadResponse: Clone + Debug + Send + Sync + 'static;
    type WriteResponse: Clone + Debug + Send + Sync + 'static;
    type BackfillChunk: Chunk<Self::Region>;
}
