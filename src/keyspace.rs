//! Reference protocol binding over a flat byte keyspace.
//!
//! Regions are normalized sets of half-open key ranges, which keeps the whole
//! algebra exact: `join` is total on disjoint inputs, and subtraction and
//! intersection never leave the representable set. `BadRegion` is reserved for
//! protocols whose regions are less forgiving.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::{Chunk, Op, Protocol};
use crate::region::{Region, RegionError};
use crate::timestamps::StateTimestamp;

/// A key in the flat byte keyspace.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Bytes);

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Key(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The immediate successor in byte order: `k` followed by a zero byte.
    pub fn successor(&self) -> Key {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        bytes.extend_from_slice(&self.0);
        bytes.push(0);
        Key(bytes.into())
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self.0.escape_ascii())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key(b.into())
    }
}

/// A half-open key range `[start, end)`; `end == None` means unbounded.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Key,
    end: Option<Key>,
}

impl std::fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.end {
            Some(end) => write!(f, "[{:?}, {:?})", self.start, end),
            None => write!(f, "[{:?}, ..)", self.start),
        }
    }
}

impl KeyRange {
    pub fn new(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        KeyRange {
            start: start.into(),
            end: Some(end.into()),
        }
    }

    pub fn unbounded_from(start: impl Into<Key>) -> Self {
        KeyRange {
            start: start.into(),
            end: None,
        }
    }

    /// The whole keyspace.
    pub fn universe() -> Self {
        KeyRange::unbounded_from(Key::new(Bytes::new()))
    }

    /// The range containing exactly `key`.
    pub fn point(key: &Key) -> Self {
        KeyRange {
            start: key.clone(),
            end: Some(key.successor()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.end {
            Some(end) => *end <= self.start,
            None => false,
        }
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        *key >= self.start
            && match &self.end {
                Some(end) => key < end,
                None => true,
            }
    }

    fn contains_range(&self, inner: &KeyRange) -> bool {
        if inner.is_empty() {
            return true;
        }
        self.start <= inner.start
            && match (&self.end, &inner.end) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(outer_end), Some(inner_end)) => inner_end <= outer_end,
            }
    }

    fn intersect(&self, other: &KeyRange) -> KeyRange {
        let start = self.start.clone().max(other.start.clone());
        let end = match (&self.end, &other.end) {
            (None, None) => None,
            (Some(e), None) | (None, Some(e)) => Some(e.clone()),
            (Some(a), Some(b)) => Some(a.clone().min(b.clone())),
        };
        KeyRange { start, end }
    }

    fn overlaps(&self, other: &KeyRange) -> bool {
        !self.intersect(other).is_empty()
    }

    fn subtract(&self, other: &KeyRange) -> Vec<KeyRange> {
        if !self.overlaps(other) {
            return vec![self.clone()];
        }
        let mut out = Vec::new();
        if self.start < other.start {
            out.push(KeyRange {
                start: self.start.clone(),
                end: Some(other.start.clone()),
            });
        }
        if let Some(other_end) = &other.end {
            let tail = KeyRange {
                start: other_end.clone().max(self.start.clone()),
                end: self.end.clone(),
            };
            if !tail.is_empty() {
                out.push(tail);
            }
        }
        out
    }
}

/// A region of the keyspace: a set of key ranges in canonical form (nonempty,
/// sorted by start, pairwise disjoint, adjacent runs merged). Canonical form
/// makes derived equality semantic equality.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct KeyRegion {
    ranges: Vec<KeyRange>,
}

impl std::fmt::Debug for KeyRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(&self.ranges).finish()
    }
}

impl From<KeyRange> for KeyRegion {
    fn from(range: KeyRange) -> Self {
        KeyRegion::from_ranges([range])
    }
}

impl KeyRegion {
    /// Builds a region as the union of arbitrary (possibly overlapping)
    /// ranges.
    pub fn from_ranges(ranges: impl IntoIterator<Item = KeyRange>) -> Self {
        KeyRegion {
            ranges: normalize(ranges.into_iter().collect()),
        }
    }

    pub fn universe() -> Self {
        KeyRange::universe().into()
    }

    pub fn point(key: &Key) -> Self {
        KeyRange::point(key).into()
    }

    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.ranges.iter().any(|r| r.contains_key(key))
    }
}

fn normalize(mut ranges: Vec<KeyRange>) -> Vec<KeyRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by(|a, b| {
        a.start.cmp(&b.start).then_with(|| match (&a.end, &b.end) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => x.cmp(y),
        })
    });
    let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        if let Some(last) = out.last_mut() {
            let touches = match &last.end {
                None => true,
                Some(end) => r.start <= *end,
            };
            if touches {
                last.end = match (last.end.take(), r.end) {
                    (None, _) | (_, None) => None,
                    (Some(a), Some(b)) => Some(a.max(b)),
                };
                continue;
            }
        }
        out.push(r);
    }
    out
}

impl Region for KeyRegion {
    fn empty() -> Self {
        KeyRegion::default()
    }

    fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn intersection(&self, other: &Self) -> Self {
        let mut pieces = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                let ixn = a.intersect(b);
                if !ixn.is_empty() {
                    pieces.push(ixn);
                }
            }
        }
        KeyRegion::from_ranges(pieces)
    }

    fn is_superset(&self, inner: &Self) -> bool {
        inner
            .ranges
            .iter()
            .all(|i| self.ranges.iter().any(|o| o.contains_range(i)))
    }

    fn join(parts: impl IntoIterator<Item = Self>) -> Result<Self, RegionError> {
        let parts: Vec<KeyRegion> = parts.into_iter().collect();
        for (i, a) in parts.iter().enumerate() {
            for b in &parts[i + 1..] {
                if a.overlaps(b) {
                    return Err(RegionError::BadJoin);
                }
            }
        }
        Ok(KeyRegion::from_ranges(
            parts.into_iter().flat_map(|p| p.ranges),
        ))
    }

    fn subtract_many(&self, others: &[Self]) -> Vec<Self> {
        let mut remaining = self.ranges.clone();
        for other in others {
            for sub in &other.ranges {
                remaining = remaining.iter().flat_map(|r| r.subtract(sub)).collect();
            }
        }
        // One region per leftover run, so callers see the fragmentation.
        normalize(remaining)
            .into_iter()
            .map(KeyRegion::from)
            .collect()
    }
}

/// The reference key-value protocol. Never instantiated; it only carries the
/// type bindings.
#[derive(Debug, Clone, Copy)]
pub struct KvProtocol;

impl Protocol for KvProtocol {
    type Region = KeyRegion;
    type Read = KvRead;
    type Write = KvWrite;
    type ReadResponse = KvReadResponse;
    type WriteResponse = KvWriteResponse;
    type BackfillChunk = KvChunk;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvRead {
    Get { key: Key },
}

impl Op<KeyRegion> for KvRead {
    fn region(&self) -> KeyRegion {
        match self {
            KvRead::Get { key } => KeyRegion::point(key),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvWrite {
    Set { key: Key, value: Bytes },
    Delete { key: Key },
}

impl KvWrite {
    pub fn key(&self) -> &Key {
        match self {
            KvWrite::Set { key, .. } => key,
            KvWrite::Delete { key } => key,
        }
    }
}

impl Op<KeyRegion> for KvWrite {
    fn region(&self) -> KeyRegion {
        KeyRegion::point(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvReadResponse {
    pub value: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvWriteResponse {
    pub previous: Option<Bytes>,
}

/// One key's state at one timestamp. Ordered by `(timestamp, key)`, which is
/// an order the receiver can apply monotonically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KvChunk {
    pub timestamp: StateTimestamp,
    pub key: Key,
    pub value: Option<Bytes>,
}

impl Chunk<KeyRegion> for KvChunk {
    fn region(&self) -> KeyRegion {
        KeyRegion::point(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::region_map::RegionMap;

    fn region(ranges: &[(&str, &str)]) -> KeyRegion {
        KeyRegion::from_ranges(ranges.iter().map(|(a, b)| KeyRange::new(*a, *b)))
    }

    #[test]
    fn join_of_disjoint_parts() {
        let joined =
            KeyRegion::join([region(&[("a", "c")]), region(&[("p", "q")])]).unwrap();
        assert_eq!(joined, region(&[("a", "c"), ("p", "q")]));
    }

    #[test]
    fn join_merges_adjacent_runs() {
        let joined = KeyRegion::join([region(&[("a", "c")]), region(&[("c", "f")])]).unwrap();
        assert_eq!(joined, region(&[("a", "f")]));
    }

    #[test]
    fn overlapping_join_is_bad() {
        let err = KeyRegion::join([region(&[("a", "f")]), region(&[("c", "k")])]).unwrap_err();
        assert_eq!(err, RegionError::BadJoin);
    }

    #[test]
    fn subtract_cuts_holes() {
        let base = region(&[("a", "z")]);
        let pieces = base.subtract_many(&[region(&[("c", "f")]), region(&[("p", "q")])]);
        assert_eq!(pieces.len(), 3);
        let rejoined = KeyRegion::join(pieces).unwrap();
        assert_eq!(rejoined, region(&[("a", "c"), ("f", "p"), ("q", "z")]));
    }

    #[test]
    fn superset_and_containment() {
        let outer = region(&[("a", "m"), ("p", "z")]);
        assert!(outer.is_superset(&region(&[("b", "d"), ("q", "r")])));
        assert!(!outer.is_superset(&region(&[("m", "p")])));
        assert!(outer.is_superset(&KeyRegion::empty()));
        assert!(outer.contains_key(&Key::from("b")));
        assert!(!outer.contains_key(&Key::from("n")));
    }

    #[test]
    fn unbounded_ranges() {
        let tail = KeyRegion::from(KeyRange::unbounded_from("m"));
        assert!(KeyRegion::universe().is_superset(&tail));
        assert!(tail.contains_key(&Key::from("zzzz")));
        let cut = KeyRegion::universe().subtract_many(&[tail.clone()]);
        assert_eq!(KeyRegion::join(cut.into_iter().chain([tail])).unwrap(),
            KeyRegion::universe());
    }

    fn arb_region() -> impl Strategy<Value = KeyRegion> {
        prop::collection::vec((0u8..32, 0u8..32), 0..6).prop_map(|pairs| {
            KeyRegion::from_ranges(pairs.into_iter().map(|(a, b)| {
                let (lo, hi) = (a.min(b), a.max(b));
                KeyRange::new(vec![lo], vec![hi])
            }))
        })
    }

    proptest! {
        #[test]
        fn partition_law(a in arb_region(), b in arb_region()) {
            // a == (a \ b) ∪ (a ∩ b), and the parts are disjoint.
            let diff = a.subtract_many(&[b.clone()]);
            let ixn = a.intersection(&b);
            let rejoined = KeyRegion::join(diff.into_iter().chain([ixn])).unwrap();
            prop_assert_eq!(rejoined, a);
        }

        #[test]
        fn intersection_commutes(a in arb_region(), b in arb_region()) {
            prop_assert_eq!(a.intersection(&b), b.intersection(&a));
        }

        #[test]
        fn subtraction_leaves_no_overlap(a in arb_region(), b in arb_region()) {
            for piece in a.subtract_many(&[b.clone()]) {
                prop_assert!(!piece.overlaps(&b));
                prop_assert!(a.is_superset(&piece));
            }
        }

        #[test]
        fn region_map_update_laws(
            a in arb_region(),
            b in arb_region(),
            v0 in 0u32..100,
            v1 in 0u32..100,
        ) {
            prop_assume!(!a.is_empty());
            let overlay_domain = a.intersection(&b);
            let mut m = RegionMap::new(a.clone(), v0);
            let n = RegionMap::new(overlay_domain.clone(), v1);
            m.update(n.clone());
            // Domain preserved, overlay overridden.
            prop_assert_eq!(m.domain(), a);
            if !overlay_domain.is_empty() {
                prop_assert_eq!(m.mask(&overlay_domain), n);
            }
        }
    }
}
