//! In-memory store for the reference KV protocol.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fifo::{FifoSink, FifoSource, Interrupted, ReadToken, WriteToken};
use crate::keyspace::{Key, KeyRegion, KvChunk, KvProtocol, KvRead, KvReadResponse, KvWrite, KvWriteResponse};
use crate::protocol::Op;
use crate::region::Region;
use crate::region_map::{Metainfo, RegionMap};
use crate::store::{ShouldBackfill, StoreView};
use crate::timestamps::{StateTimestamp, TransitionTimestamp};

/// An in-memory key-value store over one region of the keyspace.
///
/// Keys map to `(value, state timestamp)`; deletions leave tombstones so a
/// backfill can replay them. The metainfo lives next to the data and is
/// mutated only under a held write token.
#[derive(Debug, Clone)]
pub struct MemStore {
    region: KeyRegion,
    source: Arc<FifoSource>,
    sink: FifoSink,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<Key, (Bytes, StateTimestamp)>,
    tombstones: BTreeMap<Key, StateTimestamp>,
    metainfo: Metainfo<KeyRegion>,
    timestamp: StateTimestamp,
    backfilling: bool,
}

impl MemStore {
    /// Creates an empty store. The metainfo must cover exactly `region`.
    pub fn new(region: KeyRegion, metainfo: Metainfo<KeyRegion>) -> Self {
        assert_eq!(
            metainfo.domain(),
            region,
            "initial metainfo must cover the store's region"
        );
        MemStore {
            region,
            source: Arc::new(FifoSource::default()),
            sink: FifoSink::new(),
            inner: Arc::new(Mutex::new(Inner {
                entries: BTreeMap::new(),
                tombstones: BTreeMap::new(),
                metainfo,
                timestamp: StateTimestamp::ZERO,
                backfilling: false,
            })),
        }
    }

    fn check_expected(&self, expected: &Metainfo<KeyRegion>, region: &KeyRegion) {
        if cfg!(debug_assertions) {
            let current = self.inner.lock().metainfo.mask(region);
            debug_assert!(
                current == expected.mask(region),
                "expected metainfo diverged from the store's: {current:?} vs {expected:?}"
            );
        }
    }
}

#[async_trait]
impl StoreView<KvProtocol> for MemStore {
    fn region(&self) -> KeyRegion {
        self.region.clone()
    }

    fn new_read_token(&self) -> ReadToken {
        self.source.read_token()
    }

    fn new_write_token(&self) -> WriteToken {
        self.source.write_token()
    }

    fn timestamp(&self) -> StateTimestamp {
        self.inner.lock().timestamp
    }

    fn is_coherent(&self) -> bool {
        let inner = self.inner.lock();
        let mut blobs = inner.metainfo.iter().map(|(_, blob)| blob);
        match blobs.next() {
            Some(first) => blobs.all(|b| b == first),
            None => true,
        }
    }

    fn is_backfilling(&self) -> bool {
        self.inner.lock().backfilling
    }

    async fn get_metainfo(
        &self,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<Metainfo<KeyRegion>, Interrupted> {
        let _guard = self.sink.enter_read(token, cancel).await?;
        let metainfo = self.inner.lock().metainfo.clone();
        debug_assert_eq!(metainfo.domain(), self.region);
        Ok(metainfo)
    }

    async fn set_metainfo(
        &self,
        new_metainfo: Metainfo<KeyRegion>,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        assert!(self.region.is_superset(&new_metainfo.domain()));
        let _guard = self.sink.enter_write(token, cancel).await?;
        let mut inner = self.inner.lock();
        inner.metainfo.update(new_metainfo);
        // Installing consistent metainfo is what completes a catch-up.
        inner.backfilling = false;
        Ok(())
    }

    async fn read(
        &self,
        expected_metainfo: &Metainfo<KeyRegion>,
        read: KvRead,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<KvReadResponse, Interrupted> {
        assert!(self.region.is_superset(&expected_metainfo.domain()));
        assert!(expected_metainfo.domain().is_superset(&read.region()));
        let _guard = self.sink.enter_read(token, cancel).await?;
        self.check_expected(expected_metainfo, &read.region());
        let inner = self.inner.lock();
        let KvRead::Get { key } = read;
        let value = inner.entries.get(&key).map(|(v, _)| v.clone());
        Ok(KvReadResponse { value })
    }

    async fn write(
        &self,
        expected_metainfo: &Metainfo<KeyRegion>,
        new_metainfo: &Metainfo<KeyRegion>,
        write: KvWrite,
        timestamp: TransitionTimestamp,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<KvWriteResponse, Interrupted> {
        assert!(self.region.is_superset(&expected_metainfo.domain()));
        assert_eq!(new_metainfo.domain(), expected_metainfo.domain());
        assert!(expected_metainfo.domain().is_superset(&write.region()));
        let _guard = self.sink.enter_write(token, cancel).await?;
        self.check_expected(expected_metainfo, &write.region());
        let mut inner = self.inner.lock();
        let target = timestamp.target();
        let previous = match write {
            KvWrite::Set { key, value } => {
                inner.tombstones.remove(&key);
                inner.entries.insert(key, (value, target)).map(|(v, _)| v)
            }
            KvWrite::Delete { key } => {
                let previous = inner.entries.remove(&key).map(|(v, _)| v);
                inner.tombstones.insert(key, target);
                previous
            }
        };
        inner.metainfo.update(new_metainfo.clone());
        inner.timestamp = inner.timestamp.max(target);
        Ok(KvWriteResponse { previous })
    }

    async fn send_backfill(
        &self,
        start_point: RegionMap<KeyRegion, StateTimestamp>,
        should_backfill: ShouldBackfill<KeyRegion>,
        chunks: mpsc::Sender<KvChunk>,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<bool, Interrupted> {
        assert!(self.region.is_superset(&start_point.domain()));
        let _guard = self.sink.enter_read(token, cancel).await?;

        let pending: Vec<KvChunk> = {
            let inner = self.inner.lock();
            if !should_backfill(&inner.metainfo) {
                return Ok(false);
            }
            let newer_than = |key: &Key, ts: StateTimestamp| {
                start_point
                    .iter()
                    .find(|(r, _)| r.contains_key(key))
                    .is_some_and(|(_, since)| ts > *since)
            };
            let live = inner.entries.iter().filter_map(|(key, (value, ts))| {
                newer_than(key, *ts).then(|| KvChunk {
                    timestamp: *ts,
                    key: key.clone(),
                    value: Some(value.clone()),
                })
            });
            let deleted = inner.tombstones.iter().filter_map(|(key, ts)| {
                newer_than(key, *ts).then(|| KvChunk {
                    timestamp: *ts,
                    key: key.clone(),
                    value: None,
                })
            });
            let mut pending: Vec<KvChunk> = live.chain(deleted).collect();
            pending.sort();
            pending
        };

        for chunk in pending {
            tokio::select! {
                sent = chunks.send(chunk) => {
                    if sent.is_err() {
                        // Receiver went away; the backfill is moot.
                        return Ok(true);
                    }
                }
                _ = cancel.cancelled() => return Err(Interrupted),
            }
        }
        Ok(true)
    }

    async fn receive_backfill(
        &self,
        chunk: KvChunk,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        let _guard = self.sink.enter_write(token, cancel).await?;
        let mut inner = self.inner.lock();
        inner.backfilling = true;
        match chunk.value {
            Some(value) => {
                inner.tombstones.remove(&chunk.key);
                inner.entries.insert(chunk.key, (value, chunk.timestamp));
            }
            None => {
                inner.entries.remove(&chunk.key);
                inner.tombstones.insert(chunk.key, chunk.timestamp);
            }
        }
        inner.timestamp = inner.timestamp.max(chunk.timestamp);
        Ok(())
    }

    async fn reset_data(
        &self,
        subregion: KeyRegion,
        new_metainfo: Metainfo<KeyRegion>,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        assert!(self.region.is_superset(&subregion));
        assert!(self.region.is_superset(&new_metainfo.domain()));
        let _guard = self.sink.enter_write(token, cancel).await?;
        let mut inner = self.inner.lock();
        inner.entries.retain(|key, _| !subregion.contains_key(key));
        inner.tombstones.retain(|key, _| !subregion.contains_key(key));
        inner.metainfo.update(new_metainfo);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BranchId;
    use crate::version::Version;

    fn test_store() -> (MemStore, Version) {
        let region = KeyRegion::universe();
        let version = Version::new(BranchId::random(), StateTimestamp::ZERO);
        let store = MemStore::new(region.clone(), version.stamp(region));
        (store, version)
    }

    fn set(key: &str, value: &str) -> KvWrite {
        KvWrite::Set {
            key: key.into(),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    async fn apply(store: &MemStore, version: &mut Version, write: KvWrite) -> KvWriteResponse {
        let expected = version.stamp(store.region());
        let transition = version.timestamp.next();
        version.timestamp = transition.target();
        let new = version.stamp(store.region());
        let token = store.new_write_token();
        store
            .write(&expected, &new, write, transition, token, &CancellationToken::new())
            .await
            .unwrap()
    }

    async fn get(store: &MemStore, version: &Version, key: &str) -> Option<Bytes> {
        let expected = version.stamp(store.region());
        let token = store.new_read_token();
        store
            .read(
                &expected,
                KvRead::Get { key: key.into() },
                token,
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .value
    }

    #[tokio::test]
    async fn metainfo_round_trip() {
        let (store, version) = test_store();
        let cancel = CancellationToken::new();
        let stamped = Version::new(version.branch, StateTimestamp::ZERO.next().target())
            .stamp(store.region());
        store
            .set_metainfo(stamped.clone(), store.new_write_token(), &cancel)
            .await
            .unwrap();
        let read_back = store
            .get_metainfo(store.new_read_token(), &cancel)
            .await
            .unwrap();
        assert_eq!(read_back, stamped);
        assert_eq!(read_back.domain(), store.region());
    }

    #[tokio::test]
    async fn write_then_read() {
        let (store, mut version) = test_store();
        let response = apply(&store, &mut version, set("a", "x")).await;
        assert_eq!(response.previous, None);
        let response = apply(&store, &mut version, set("a", "y")).await;
        assert_eq!(response.previous.as_deref(), Some(b"x".as_slice()));
        assert_eq!(get(&store, &version, "a").await.as_deref(), Some(b"y".as_slice()));
        assert_eq!(get(&store, &version, "b").await, None);
        assert_eq!(store.timestamp(), version.timestamp);
        assert!(store.is_coherent());
    }

    #[tokio::test]
    async fn backfill_reproduces_a_quiescent_source() {
        let (source_store, mut version) = test_store();
        apply(&source_store, &mut version, set("a", "1")).await;
        apply(&source_store, &mut version, set("b", "2")).await;
        apply(&source_store, &mut version, KvWrite::Delete { key: "a".into() }).await;

        let sink_region = KeyRegion::universe();
        let sink_store = MemStore::new(
            sink_region.clone(),
            Version::new(version.branch, StateTimestamp::ZERO).stamp(sink_region),
        );

        let cancel = CancellationToken::new();
        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
        let start_point = RegionMap::new(source_store.region(), StateTimestamp::ZERO);
        let sent = source_store
            .send_backfill(
                start_point,
                Box::new(|_| true),
                chunk_tx,
                source_store.new_read_token(),
                &cancel,
            )
            .await
            .unwrap();
        assert!(sent);

        let mut last = None;
        while let Some(chunk) = chunk_rx.recv().await {
            // Chunks arrive in an order the receiver can apply monotonically.
            assert!(last.as_ref() <= Some(&chunk));
            last = Some(chunk.clone());
            sink_store
                .receive_backfill(chunk, sink_store.new_write_token(), &cancel)
                .await
                .unwrap();
        }
        assert!(sink_store.is_backfilling());
        sink_store
            .set_metainfo(
                version.stamp(sink_store.region()),
                sink_store.new_write_token(),
                &cancel,
            )
            .await
            .unwrap();
        assert!(!sink_store.is_backfilling());

        assert_eq!(get(&sink_store, &version, "a").await, None);
        assert_eq!(
            get(&sink_store, &version, "b").await.as_deref(),
            Some(b"2".as_slice())
        );
        assert_eq!(sink_store.timestamp(), source_store.timestamp());
    }

    #[tokio::test]
    async fn declined_backfill_sends_nothing() {
        let (store, mut version) = test_store();
        apply(&store, &mut version, set("a", "1")).await;
        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
        let sent = store
            .send_backfill(
                RegionMap::new(store.region(), StateTimestamp::ZERO),
                Box::new(|_| false),
                chunk_tx,
                store.new_read_token(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!sent);
        assert!(chunk_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reset_data_clears_a_subregion() {
        let (store, mut version) = test_store();
        apply(&store, &mut version, set("a", "1")).await;
        apply(&store, &mut version, set("m", "2")).await;
        let subregion = KeyRegion::from(crate::keyspace::KeyRange::new("a", "c"));
        store
            .reset_data(
                subregion.clone(),
                version.stamp(subregion),
                store.new_write_token(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(get(&store, &version, "a").await, None);
        assert_eq!(get(&store, &version, "m").await.as_deref(), Some(b"2".as_slice()));
    }

    #[tokio::test]
    async fn cancellation_preserves_the_metainfo_invariant() {
        let (store, mut version) = test_store();
        apply(&store, &mut version, set("a", "1")).await;

        // Hold a write guard, then cancel an operation stuck behind it.
        let blocker = store.new_write_token();
        let cancel = CancellationToken::new();
        let guard = store
            .sink
            .enter_write(blocker, &cancel)
            .await
            .unwrap();

        let stuck_token = store.new_write_token();
        let stuck_cancel = CancellationToken::new();
        let stuck = {
            let store = store.clone();
            let expected = version.stamp(store.region());
            let transition = version.timestamp.next();
            let new = Version::new(version.branch, transition.target()).stamp(store.region());
            let stuck_cancel = stuck_cancel.clone();
            tokio::spawn(async move {
                store
                    .write(&expected, &new, set("b", "2"), transition, stuck_token, &stuck_cancel)
                    .await
            })
        };
        tokio::task::yield_now().await;
        stuck_cancel.cancel();
        assert_eq!(stuck.await.unwrap().unwrap_err(), Interrupted);
        drop(guard);

        let metainfo = store
            .get_metainfo(store.new_read_token(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(metainfo.domain(), store.region());
        assert_eq!(get(&store, &version, "b").await, None);
    }
}
