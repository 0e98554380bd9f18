//! The region algebra every sharding and replication decision is keyed on.
//!
//! A region is a protocol-defined, decidable subset of the keyspace. The
//! protocol supplies the concrete representation; the core only needs the
//! set-like operations below. Regions carry a total order (`Ord`) that is used
//! for deterministic iteration, not for containment.

use std::fmt::Debug;

/// Errors produced by the region algebra.
///
/// Both variants indicate misuse by the caller. Inside the core they are
/// treated as fatal: the region-map invariants guarantee they cannot occur on
/// the maintained data, so hitting one means a precondition was violated.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegionError {
    /// The set that would result from the operation cannot be expressed as a
    /// region of this protocol.
    #[error("the resulting set cannot be expressed as a region")]
    BadRegion,
    /// The inputs to `join` were not pairwise disjoint.
    #[error("regions passed to join must be pairwise disjoint")]
    BadJoin,
}

/// Set-like operations over a protocol's region type.
pub trait Region: Clone + Eq + Ord + Debug + Send + Sync + 'static {
    /// The empty region.
    fn empty() -> Self;

    /// Whether this region contains no keys.
    fn is_empty(&self) -> bool;

    /// The intersection of two regions. Always expressible.
    fn intersection(&self, other: &Self) -> Self;

    /// Whether `self` contains every key of `inner`.
    fn is_superset(&self, inner: &Self) -> bool;

    /// The union of pairwise-disjoint regions.
    ///
    /// Fails with [`RegionError::BadJoin`] if any two inputs overlap, and with
    /// [`RegionError::BadRegion`] if the union is not expressible.
    fn join(parts: impl IntoIterator<Item = Self>) -> Result<Self, RegionError>;

    /// `self` minus the union of `others`, expressed as disjoint subregions.
    fn subtract_many(&self, others: &[Self]) -> Vec<Self>;

    /// Whether two regions share any key.
    fn overlaps(&self, other: &Self) -> bool {
        !self.intersection(other).is_empty()
    }
}
