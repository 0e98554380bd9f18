//! Piecewise-constant functions from a region domain to values.
//!
//! A [`RegionMap`] is an unordered list of `(region, value)` pairs whose
//! regions are pairwise disjoint. Its domain is the join of all pair regions.
//! Every store-view keeps its metainfo as a `RegionMap` of opaque blobs whose
//! domain equals the view's region.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::region::Region;

/// Region-keyed metadata, maintained atomically with the data it annotates.
pub type Metainfo<R> = RegionMap<R, Bytes>;

/// A piecewise-constant function from a region to values.
///
/// Invariant: all pair regions are pairwise disjoint. Constructors uphold it;
/// [`RegionMap::update`] preserves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionMap<R, V> {
    pairs: Vec<(R, V)>,
}

impl<R: Region, V> Default for RegionMap<R, V> {
    fn default() -> Self {
        RegionMap { pairs: Vec::new() }
    }
}

impl<R: Region, V> RegionMap<R, V> {
    /// The map that is `v` everywhere on `r`.
    pub fn new(r: R, v: V) -> Self {
        if r.is_empty() {
            return Self::default();
        }
        RegionMap { pairs: vec![(r, v)] }
    }

    /// Builds a map from pairwise-disjoint pairs. Disjointness is checked in
    /// debug builds.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (R, V)>) -> Self {
        let pairs: Vec<(R, V)> = pairs
            .into_iter()
            .filter(|(r, _)| !r.is_empty())
            .collect();
        debug_assert!(
            pairs
                .iter()
                .enumerate()
                .all(|(i, (r, _))| pairs[i + 1..].iter().all(|(s, _)| !r.overlaps(s))),
            "region map pairs must be pairwise disjoint"
        );
        RegionMap { pairs }
    }

    /// The join of all pair regions.
    pub fn domain(&self) -> R {
        R::join(self.pairs.iter().map(|(r, _)| r.clone()))
            .expect("region map pairs are pairwise disjoint")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&R, &V)> {
        self.pairs.iter().map(|(r, v)| (r, v))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Applies `f` to every value, keeping the region structure.
    pub fn transform<W>(&self, f: impl Fn(&V) -> W) -> RegionMap<R, W> {
        RegionMap {
            pairs: self.pairs.iter().map(|(r, v)| (r.clone(), f(v))).collect(),
        }
    }
}

impl<R: Region, V: Clone> RegionMap<R, V> {
    /// Restricts the map to `region`: the result's domain is
    /// `region ∩ self.domain()`.
    pub fn mask(&self, region: &R) -> Self {
        let pairs = self
            .pairs
            .iter()
            .filter_map(|(r, v)| {
                let ixn = r.intersection(region);
                if ixn.is_empty() {
                    None
                } else {
                    Some((ixn, v.clone()))
                }
            })
            .collect();
        RegionMap { pairs }
    }

    /// Overwrites the slices covered by `new_values`, leaving the domain
    /// unchanged.
    ///
    /// The caller must guarantee `self.domain() ⊇ new_values.domain()`;
    /// violating that is fatal.
    pub fn update(&mut self, new_values: RegionMap<R, V>) {
        assert!(
            self.domain().is_superset(&new_values.domain()),
            "update cannot expand the domain of a region map"
        );
        let overlay: Vec<R> = new_values.pairs.iter().map(|(r, _)| r.clone()).collect();
        let mut updated: Vec<(R, V)> = Vec::with_capacity(self.pairs.len() + overlay.len());
        for (old_r, old_v) in &self.pairs {
            for kept in old_r.subtract_many(&overlay) {
                if !kept.is_empty() {
                    updated.push((kept, old_v.clone()));
                }
            }
        }
        updated.extend(new_values.pairs);
        self.pairs = updated;
    }

    /// Shorthand for `update` with a single pair.
    pub fn set(&mut self, r: R, v: V) {
        self.update(RegionMap::new(r, v));
    }
}

/// Pointwise equality over the domain. Insensitive to pair order and to how
/// the pieces are fragmented.
impl<R: Region, V: Clone + PartialEq> PartialEq for RegionMap<R, V> {
    fn eq(&self, other: &Self) -> bool {
        if self.domain() != other.domain() {
            return false;
        }
        self.pairs.iter().all(|(r, v)| {
            other
                .mask(r)
                .pairs
                .iter()
                .all(|(_, other_v)| other_v == v)
        })
    }
}

impl<R: Region, V: Clone + Eq> Eq for RegionMap<R, V> {}
