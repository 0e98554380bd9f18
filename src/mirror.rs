//! A mirror: one replica of a branch's region, serving the mailboxes it
//! registered with the branch's dispatcher.
//!
//! A mirror wraps a store-view. Its listeners enter the mirror's FIFO sink
//! with the dispatcher-minted token before touching the store, which is what
//! serializes reads against writes in the dispatcher's issued order. Every
//! applied write stamps `(branch, timestamp)` metainfo over the store's whole
//! region.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

use crate::backfill::{Backfiller, BackfillerMetadata};
use crate::dispatcher::{
    DispatcherMetadata, MirrorData, ReadMessage, WriteMessage, WriteReadMessage,
};
use crate::fabric::{Mailbox, Node};
use crate::fifo::{FifoSink, Interrupted, ReadToken, WriteToken};
use crate::ids::{BranchId, MirrorId};
use crate::metadata::ReadWriteView;
use crate::protocol::{Op, Protocol};
use crate::region::Region;
use crate::region_map::Metainfo;
use crate::registrant::Registrant;
use crate::resource::{ResourceAdvertisement, ResourceLost};
use crate::store::StoreView;
use crate::timestamps::{StateTimestamp, TransitionTimestamp};
use crate::version::{decode_metainfo, SchemaMismatch, Version};

/// Why a mirror could not start.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error(transparent)]
    ResourceLost(#[from] ResourceLost),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),
}

/// A replica registered with a branch's dispatcher.
///
/// Dropping the mirror deregisters it (exactly one delete) and stops its
/// listeners.
#[derive(Debug)]
pub struct Mirror<P: Protocol, S: StoreView<P>> {
    id: MirrorId,
    store: Arc<S>,
    registrant: Registrant<MirrorData<P>>,
    _backfiller: Backfiller<P>,
    _backfiller_ad: ResourceAdvertisement<BackfillerMetadata<P>>,
    _listeners: Vec<AbortOnDropHandle<()>>,
    _stop: DropGuard,
}

impl<P: Protocol, S: StoreView<P>> Mirror<P, S> {
    /// Starts a mirror that serves writes, writereads and reads.
    pub async fn new(
        node: &Node,
        store: Arc<S>,
        dispatcher: ReadWriteView<DispatcherMetadata<P>>,
        cancel: &CancellationToken,
    ) -> Result<Self, MirrorError> {
        Self::start(node, store, dispatcher, cancel, true).await
    }

    /// Starts a mirror that is still catching up: it registers write-only so
    /// the dispatcher keeps it current without routing reads to it.
    pub async fn new_backfilling(
        node: &Node,
        store: Arc<S>,
        dispatcher: ReadWriteView<DispatcherMetadata<P>>,
        cancel: &CancellationToken,
    ) -> Result<Self, MirrorError> {
        Self::start(node, store, dispatcher, cancel, false).await
    }

    async fn start(
        node: &Node,
        store: Arc<S>,
        dispatcher: ReadWriteView<DispatcherMetadata<P>>,
        cancel: &CancellationToken,
        readable: bool,
    ) -> Result<Self, MirrorError> {
        let id = MirrorId::random();

        // The branch is the dispatcher's; the store's metainfo tells us how
        // far along that history this replica is.
        let branch = dispatcher
            .snapshot()
            .branch
            .ok_or_else(|| ResourceLost("branch dispatcher is not published".into()))?;
        let metainfo = store.get_metainfo(store.new_read_token(), cancel).await?;
        let timestamp = recover_timestamp(&metainfo)?;
        debug!(
            mirror = %id.fmt_short(),
            branch = %branch.fmt_short(),
            %timestamp,
            "starting mirror"
        );

        // A coherent store joining the branch is re-stamped to it; the master
        // forks a fresh branch from whatever history the store carried. A
        // backfilling store is left alone, its catch-up installs the stamp.
        if !store.is_backfilling() {
            store
                .set_metainfo(
                    Version::new(branch, timestamp).stamp(store.region()),
                    store.new_write_token(),
                    cancel,
                )
                .await?;
        }

        let stop = CancellationToken::new();
        let shared = Arc::new(Shared {
            node: node.clone(),
            store: store.clone(),
            sink: FifoSink::new(),
            branch,
            current: Mutex::new(timestamp),
            stop: stop.clone(),
            _protocol: PhantomData,
        });

        let (write_addr, write_mailbox) = node.mailbox();
        let (writeread_addr, writeread_mailbox) = node.mailbox();
        let (read_addr, read_mailbox) = node.mailbox();
        let listeners = vec![
            AbortOnDropHandle::new(tokio::spawn(run_writes(shared.clone(), write_mailbox))),
            AbortOnDropHandle::new(tokio::spawn(run_writereads(
                shared.clone(),
                writeread_mailbox,
            ))),
            AbortOnDropHandle::new(tokio::spawn(run_reads(shared.clone(), read_mailbox))),
        ];

        // Publish this mirror's backfiller under the dispatcher's mirror map.
        let backfiller = Backfiller::new(node, store.clone());
        let backfiller_ad = ResourceAdvertisement::new(
            node,
            dispatcher
                .field(|d: &mut DispatcherMetadata<P>| &mut d.mirrors)
                .member(id),
            backfiller.metadata(),
        );

        let data = MirrorData {
            mirror_id: id,
            write: write_addr,
            writeread: readable.then(|| writeread_addr),
            read: readable.then(|| read_addr),
        };
        let registrar = dispatcher
            .read_only()
            .field(|d: &DispatcherMetadata<P>| d.registrar.clone());
        let registrant = Registrant::new(node, registrar, data)?;

        Ok(Mirror {
            id,
            store,
            registrant,
            _backfiller: backfiller,
            _backfiller_ad: backfiller_ad,
            _listeners: listeners,
            _stop: stop.drop_guard(),
        })
    }

    pub fn mirror_id(&self) -> MirrorId {
        self.id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Resolves with a reason once the registration fails (registrar torn
    /// down or its peer lost).
    pub async fn wait_failed(&self) -> String {
        self.registrant.wait_failed().await
    }
}

fn recover_timestamp<R: Region>(metainfo: &Metainfo<R>) -> Result<StateTimestamp, SchemaMismatch> {
    let versions = decode_metainfo(metainfo)?;
    versions
        .iter()
        .map(|(_, version)| version.timestamp)
        .max()
        .ok_or_else(|| SchemaMismatch("store has no metainfo".into()))
}

struct Shared<P: Protocol, S> {
    node: Node,
    store: Arc<S>,
    sink: FifoSink,
    branch: BranchId,
    current: Mutex<StateTimestamp>,
    stop: CancellationToken,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol, S: StoreView<P>> Shared<P, S> {
    /// Applies one write under the dispatcher's token and returns the
    /// response.
    async fn apply_write(
        &self,
        write: P::Write,
        timestamp: TransitionTimestamp,
        token: WriteToken,
    ) -> Result<P::WriteResponse, Interrupted> {
        let _order = self.sink.enter_write(token, &self.stop).await?;
        let expected = {
            let current = *self.current.lock();
            Version::new(self.branch, current).stamp(self.store.region())
        };
        let new = Version::new(self.branch, timestamp.target()).stamp(self.store.region());
        let store_token = self.store.new_write_token();
        let response = self
            .store
            .write(&expected, &new, write, timestamp, store_token, &self.stop)
            .await?;
        *self.current.lock() = timestamp.target();
        Ok(response)
    }

    async fn apply_read(
        &self,
        read: P::Read,
        token: ReadToken,
    ) -> Result<P::ReadResponse, Interrupted> {
        let _order = self.sink.enter_read(token, &self.stop).await?;
        let expected = {
            let current = *self.current.lock();
            Version::new(self.branch, current).stamp(read.region())
        };
        let store_token = self.store.new_read_token();
        self.store
            .read(&expected, read, store_token, &self.stop)
            .await
    }
}

async fn run_writes<P: Protocol, S: StoreView<P>>(
    shared: Arc<Shared<P, S>>,
    mut mailbox: Mailbox<WriteMessage<P>>,
) {
    while let Some(msg) = mailbox.recv().await {
        match shared.apply_write(msg.write, msg.timestamp, msg.token).await {
            Ok(_) => shared.node.send(&msg.ack, ()),
            Err(Interrupted) => {
                warn!("mirror write interrupted, stopping listener");
                break;
            }
        }
    }
    trace!("mirror write listener closed");
}

async fn run_writereads<P: Protocol, S: StoreView<P>>(
    shared: Arc<Shared<P, S>>,
    mut mailbox: Mailbox<WriteReadMessage<P>>,
) {
    while let Some(msg) = mailbox.recv().await {
        match shared.apply_write(msg.write, msg.timestamp, msg.token).await {
            Ok(response) => shared.node.send(&msg.reply, response),
            Err(Interrupted) => {
                warn!("mirror writeread interrupted, stopping listener");
                break;
            }
        }
    }
    trace!("mirror writeread listener closed");
}

async fn run_reads<P: Protocol, S: StoreView<P>>(
    shared: Arc<Shared<P, S>>,
    mut mailbox: Mailbox<ReadMessage<P>>,
) {
    while let Some(msg) = mailbox.recv().await {
        match shared.apply_read(msg.read, msg.token).await {
            Ok(response) => shared.node.send(&msg.reply, response),
            Err(Interrupted) => {
                warn!("mirror read interrupted, stopping listener");
                break;
            }
        }
    }
    trace!("mirror read listener closed");
}
