//! Restriction of a store-view to a subregion.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fifo::{Interrupted, ReadToken, WriteToken};
use crate::protocol::{Op, Protocol};
use crate::region::Region;
use crate::region_map::{Metainfo, RegionMap};
use crate::store::{ShouldBackfill, StoreView};
use crate::timestamps::{StateTimestamp, TransitionTimestamp};

/// A view of `r ⊆ parent.region()`. Everything delegates to the parent with
/// the preconditions re-enforced against `r`; tokens come from the parent's
/// source, so a subview shares the parent's FIFO discipline.
#[derive(Debug, Clone)]
pub struct StoreSubview<P: Protocol, S> {
    parent: Arc<S>,
    region: P::Region,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol, S: StoreView<P>> StoreSubview<P, S> {
    pub fn new(parent: Arc<S>, region: P::Region) -> Self {
        assert!(
            parent.region().is_superset(&region),
            "subview region must be contained in the parent's"
        );
        StoreSubview {
            parent,
            region,
            _protocol: PhantomData,
        }
    }
}

#[async_trait]
impl<P: Protocol, S: StoreView<P>> StoreView<P> for StoreSubview<P, S> {
    fn region(&self) -> P::Region {
        self.region.clone()
    }

    fn new_read_token(&self) -> ReadToken {
        self.parent.new_read_token()
    }

    fn new_write_token(&self) -> WriteToken {
        self.parent.new_write_token()
    }

    fn timestamp(&self) -> StateTimestamp {
        self.parent.timestamp()
    }

    fn is_coherent(&self) -> bool {
        self.parent.is_coherent()
    }

    fn is_backfilling(&self) -> bool {
        self.parent.is_backfilling()
    }

    async fn get_metainfo(
        &self,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<Metainfo<P::Region>, Interrupted> {
        let metainfo = self.parent.get_metainfo(token, cancel).await?;
        Ok(metainfo.mask(&self.region))
    }

    async fn set_metainfo(
        &self,
        new_metainfo: Metainfo<P::Region>,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        assert!(self.region.is_superset(&new_metainfo.domain()));
        self.parent.set_metainfo(new_metainfo, token, cancel).await
    }

    async fn read(
        &self,
        expected_metainfo: &Metainfo<P::Region>,
        read: P::Read,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<P::ReadResponse, Interrupted> {
        assert!(self.region.is_superset(&expected_metainfo.domain()));
        assert!(expected_metainfo.domain().is_superset(&read.region()));
        self.parent.read(expected_metainfo, read, token, cancel).await
    }

    async fn write(
        &self,
        expected_metainfo: &Metainfo<P::Region>,
        new_metainfo: &Metainfo<P::Region>,
        write: P::Write,
        timestamp: TransitionTimestamp,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<P::WriteResponse, Interrupted> {
        assert!(self.region.is_superset(&expected_metainfo.domain()));
        assert!(self.region.is_superset(&new_metainfo.domain()));
        self.parent
            .write(expected_metainfo, new_metainfo, write, timestamp, token, cancel)
            .await
    }

    async fn send_backfill(
        &self,
        start_point: RegionMap<P::Region, StateTimestamp>,
        should_backfill: ShouldBackfill<P::Region>,
        chunks: mpsc::Sender<P::BackfillChunk>,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<bool, Interrupted> {
        assert!(self.region.is_superset(&start_point.domain()));
        self.parent
            .send_backfill(start_point, should_backfill, chunks, token, cancel)
            .await
    }

    async fn receive_backfill(
        &self,
        chunk: P::BackfillChunk,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        self.parent.receive_backfill(chunk, token, cancel).await
    }

    async fn reset_data(
        &self,
        subregion: P::Region,
        new_metainfo: Metainfo<P::Region>,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        assert!(self.region.is_superset(&subregion));
        assert!(self.region.is_superset(&new_metainfo.domain()));
        self.parent.reset_data(subregion, new_metainfo, token, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::ids::BranchId;
    use crate::keyspace::{KeyRange, KeyRegion, KvRead, KvWrite};
    use crate::store::memory::MemStore;
    use crate::version::Version;

    #[tokio::test]
    async fn masks_metainfo_and_shares_tokens() {
        let cancel = CancellationToken::new();
        let region = KeyRegion::universe();
        let version = Version::new(BranchId::random(), StateTimestamp::ZERO);
        let parent = Arc::new(MemStore::new(region.clone(), version.stamp(region)));

        let sub_region = KeyRegion::from(KeyRange::new("a", "m"));
        let subview = StoreSubview::new(parent.clone(), sub_region.clone());
        assert_eq!(subview.region(), sub_region);

        let metainfo = subview
            .get_metainfo(subview.new_read_token(), &cancel)
            .await
            .unwrap();
        assert_eq!(metainfo.domain(), sub_region);

        // A write through the subview lands in the parent.
        let expected = version.stamp(sub_region.clone());
        let transition = StateTimestamp::ZERO.next();
        let new = Version::new(version.branch, transition.target()).stamp(sub_region.clone());
        subview
            .write(
                &expected,
                &new,
                KvWrite::Set {
                    key: "b".into(),
                    value: Bytes::from_static(b"1"),
                },
                transition,
                subview.new_write_token(),
                &cancel,
            )
            .await
            .unwrap();

        let seen = parent
            .read(
                &new,
                KvRead::Get { key: "b".into() },
                parent.new_read_token(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(seen.value.as_deref(), Some(b"1".as_slice()));
    }

    #[test]
    #[should_panic(expected = "contained in the parent")]
    fn rejects_an_escaping_region() {
        let region = KeyRegion::from(KeyRange::new("a", "m"));
        let version = Version::new(BranchId::random(), StateTimestamp::ZERO);
        let parent = Arc::new(MemStore::new(region.clone(), version.stamp(region)));
        let _ = StoreSubview::new(parent, KeyRegion::universe());
    }
}
