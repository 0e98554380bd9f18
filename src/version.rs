//! The concrete coin inside the opaque metainfo blobs.
//!
//! The store-view contract treats metainfo values as opaque bytes. The
//! replication stack gives them one concrete meaning: which branch last wrote
//! a region, and at which state timestamp.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::BranchId;
use crate::region::Region;
use crate::region_map::{Metainfo, RegionMap};
use crate::timestamps::StateTimestamp;

/// A decoded external value did not match the expected shape.
#[derive(Debug, thiserror::Error)]
#[error("schema mismatch: {0}")]
pub struct SchemaMismatch(pub String);

/// Which branch last wrote a region, and at which timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
}

impl Version {
    pub fn new(branch: BranchId, timestamp: StateTimestamp) -> Self {
        Version { branch, timestamp }
    }

    /// Encodes to the opaque metainfo blob representation.
    pub fn to_blob(&self) -> Bytes {
        postcard::to_stdvec(self)
            .expect("version stamps always serialize")
            .into()
    }

    /// Decodes a metainfo blob.
    pub fn from_blob(blob: &[u8]) -> Result<Self, SchemaMismatch> {
        postcard::from_bytes(blob).map_err(|e| SchemaMismatch(format!("version blob: {e}")))
    }

    /// The metainfo that stamps this version over all of `region`.
    pub fn stamp<R: Region>(&self, region: R) -> Metainfo<R> {
        Metainfo::new(region, self.to_blob())
    }
}

/// Decodes every blob of a metainfo map into a version stamp.
pub fn decode_metainfo<R: Region>(
    metainfo: &Metainfo<R>,
) -> Result<RegionMap<R, Version>, SchemaMismatch> {
    let mut pairs = Vec::with_capacity(metainfo.len());
    for (r, blob) in metainfo.iter() {
        pairs.push((r.clone(), Version::from_blob(blob)?));
    }
    Ok(RegionMap::from_pairs(pairs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let v = Version::new(BranchId::random(), StateTimestamp::ZERO.next().target());
        let blob = v.to_blob();
        assert_eq!(Version::from_blob(&blob).unwrap(), v);
    }

    #[test]
    fn garbage_blob_is_a_schema_mismatch() {
        assert!(Version::from_blob(&[0xff; 40]).is_err());
    }
}
