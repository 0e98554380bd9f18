//! Bulk catch-up between mirrors.
//!
//! Every mirror serves its store's history through a [`Backfiller`]; a new or
//! lagging mirror calls [`backfillee`] against one of them. Chunks and the
//! completion notice travel over a single mailbox, so the receiver sees them
//! in the order the source produced them and can apply monotonically.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

use crate::fabric::{Addr, Mailbox, Node};
use crate::fifo::Interrupted;
use crate::metadata::ReadView;
use crate::protocol::Protocol;
use crate::region_map::{Metainfo, RegionMap};
use crate::resource::{ResourceAccess, ResourceLost, ResourceMetadata};
use crate::store::StoreView;
use crate::timestamps::StateTimestamp;
use crate::version::{decode_metainfo, SchemaMismatch};

/// A request for the changes since `start_point`, streamed to `reply`.
#[derive(Debug)]
pub struct BackfillRequest<P: Protocol> {
    pub start_point: RegionMap<P::Region, StateTimestamp>,
    pub reply: Addr<BackfillMessage<P>>,
}

/// The stream a backfiller produces.
#[derive(Debug, Clone)]
pub enum BackfillMessage<P: Protocol> {
    Chunk(P::BackfillChunk),
    /// Every chunk has been sent; the receiver's region now matches this
    /// metainfo.
    Complete { metainfo: Metainfo<P::Region> },
    /// The source refused to serve the request.
    Declined,
}

/// The backfiller's advertised mailbox address.
#[derive(Debug)]
pub struct BackfillerMetadata<P: Protocol> {
    pub backfill: Addr<BackfillRequest<P>>,
}

impl<P: Protocol> Clone for BackfillerMetadata<P> {
    fn clone(&self) -> Self {
        BackfillerMetadata {
            backfill: self.backfill.clone(),
        }
    }
}

/// Serves a store's history to catching-up mirrors.
#[derive(Debug)]
pub struct Backfiller<P: Protocol> {
    metadata: BackfillerMetadata<P>,
    _actor: AbortOnDropHandle<()>,
}

impl<P: Protocol> Backfiller<P> {
    pub fn new<S: StoreView<P>>(node: &Node, store: Arc<S>) -> Self {
        let (backfill, mailbox) = node.mailbox();
        let handle = tokio::spawn(run_backfiller(node.clone(), store, mailbox));
        Backfiller {
            metadata: BackfillerMetadata { backfill },
            _actor: AbortOnDropHandle::new(handle),
        }
    }

    pub fn metadata(&self) -> BackfillerMetadata<P> {
        self.metadata.clone()
    }
}

async fn run_backfiller<P: Protocol, S: StoreView<P>>(
    node: Node,
    store: Arc<S>,
    mut mailbox: Mailbox<BackfillRequest<P>>,
) {
    while let Some(request) = mailbox.recv().await {
        trace!("serving backfill request");
        if let Err(Interrupted) = serve(&node, &store, request).await {
            warn!("backfill interrupted on the serving side");
        }
    }
    debug!("backfiller closed");
}

async fn serve<P: Protocol, S: StoreView<P>>(
    node: &Node,
    store: &Arc<S>,
    request: BackfillRequest<P>,
) -> Result<(), Interrupted> {
    let cancel = CancellationToken::new();
    let token = store.new_read_token();

    // The metainfo snapshot taken by `should_backfill` is the one the
    // receiver installs at the end.
    let snapshot: Arc<Mutex<Option<Metainfo<P::Region>>>> = Arc::new(Mutex::new(None));
    let should_backfill = {
        let snapshot = snapshot.clone();
        Box::new(move |metainfo: &Metainfo<P::Region>| {
            *snapshot.lock() = Some(metainfo.clone());
            true
        })
    };

    let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
    let forwarder = {
        let node = node.clone();
        let reply = request.reply.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                node.send(&reply, BackfillMessage::Chunk(chunk));
            }
        })
    };

    let sent = store
        .send_backfill(request.start_point, should_backfill, chunk_tx, token, &cancel)
        .await?;
    let _ = forwarder.await;

    let done = if sent {
        let metainfo = snapshot
            .lock()
            .take()
            .expect("should_backfill is called exactly once before chunks flow");
        BackfillMessage::Complete { metainfo }
    } else {
        BackfillMessage::Declined
    };
    node.send(&request.reply, done);
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error(transparent)]
    SourceLost(#[from] ResourceLost),
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),
    /// The source refused the request.
    #[error("backfill source declined")]
    Declined,
}

/// Catches `store` up from the backfiller advertised in `backfiller`.
///
/// The start point is recovered from the store's own metainfo versions. If
/// this is interrupted mid-stream the store stays marked backfilling and only
/// another full backfill makes it consistent again.
pub async fn backfillee<P: Protocol, S: StoreView<P>>(
    node: &Node,
    store: Arc<S>,
    backfiller: ReadView<ResourceMetadata<BackfillerMetadata<P>>>,
    cancel: &CancellationToken,
) -> Result<(), BackfillError> {
    let access = ResourceAccess::new(node, backfiller)?;
    let metadata = access.access()?;

    let metainfo = store.get_metainfo(store.new_read_token(), cancel).await?;
    let versions = decode_metainfo(&metainfo)?;
    let start_point = versions.transform(|v| v.timestamp);

    let (reply, mut mailbox) = node.mailbox();
    node.send(&metadata.backfill, BackfillRequest { start_point, reply });

    loop {
        let message = tokio::select! {
            message = mailbox.recv() => message,
            reason = access.wait_failed() => return Err(ResourceLost(reason).into()),
            _ = cancel.cancelled() => return Err(Interrupted.into()),
        };
        match message {
            Some(BackfillMessage::Chunk(chunk)) => {
                store
                    .receive_backfill(chunk, store.new_write_token(), cancel)
                    .await?;
            }
            Some(BackfillMessage::Complete { metainfo }) => {
                let masked = metainfo.mask(&store.region());
                store
                    .set_metainfo(masked, store.new_write_token(), cancel)
                    .await?;
                debug!("backfill complete");
                return Ok(());
            }
            Some(BackfillMessage::Declined) => return Err(BackfillError::Declined),
            None => return Err(ResourceLost("backfill stream ended early".into()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::fabric::Fabric;
    use crate::ids::BranchId;
    use crate::keyspace::{KeyRegion, KvProtocol, KvRead, KvWrite};
    use crate::metadata::ReadWriteView;
    use crate::resource::ResourceAdvertisement;
    use crate::store::memory::MemStore;
    use crate::version::Version;

    async fn seed(store: &MemStore, version: &mut Version, key: &str, value: &str) {
        let expected = version.stamp(store.region());
        let transition = version.timestamp.next();
        version.timestamp = transition.target();
        let new = version.stamp(store.region());
        store
            .write(
                &expected,
                &new,
                KvWrite::Set {
                    key: key.into(),
                    value: Bytes::copy_from_slice(value.as_bytes()),
                },
                transition,
                store.new_write_token(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backfillee_catches_up_from_a_backfiller() {
        let fabric = Fabric::new();
        let source_node = fabric.node();
        let sink_node = fabric.node();
        let cancel = CancellationToken::new();

        let region = KeyRegion::universe();
        let branch = BranchId::random();
        let mut version = Version::new(branch, StateTimestamp::ZERO);
        let source = Arc::new(MemStore::new(region.clone(), version.stamp(region.clone())));
        seed(&source, &mut version, "a", "1").await;
        seed(&source, &mut version, "b", "2").await;

        let backfiller = Backfiller::<KvProtocol>::new(&source_node, source.clone());
        let view = ReadWriteView::root(ResourceMetadata::default());
        let _ad = ResourceAdvertisement::new(&source_node, view.clone(), backfiller.metadata());

        let sink = Arc::new(MemStore::new(
            region.clone(),
            Version::new(branch, StateTimestamp::ZERO).stamp(region),
        ));
        backfillee(&sink_node, sink.clone(), view.read_only(), &cancel)
            .await
            .unwrap();

        assert!(!sink.is_backfilling());
        assert_eq!(sink.timestamp(), source.timestamp());
        let metainfo = sink
            .get_metainfo(sink.new_read_token(), &cancel)
            .await
            .unwrap();
        assert_eq!(metainfo, version.stamp(sink.region()));
        let seen = sink
            .read(
                &metainfo,
                KvRead::Get { key: "b".into() },
                sink.new_read_token(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(seen.value.as_deref(), Some(b"2".as_slice()));
    }

    #[tokio::test]
    async fn dead_source_surfaces_as_lost() {
        let fabric = Fabric::new();
        let source_node = fabric.node();
        let sink_node = fabric.node();

        let region = KeyRegion::universe();
        let version = Version::new(BranchId::random(), StateTimestamp::ZERO);
        let source = Arc::new(MemStore::new(region.clone(), version.stamp(region.clone())));
        let backfiller = Backfiller::<KvProtocol>::new(&source_node, source);
        let view = ReadWriteView::root(ResourceMetadata::default());
        let _ad = ResourceAdvertisement::new(&source_node, view.clone(), backfiller.metadata());

        let sink = Arc::new(MemStore::new(region.clone(), version.stamp(region)));
        source_node.kill();
        let err = backfillee(&sink_node, sink, view.read_only(), &CancellationToken::new()).await;
        assert!(matches!(err, Err(BackfillError::SourceLost(_))));
    }
}
