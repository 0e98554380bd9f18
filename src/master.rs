//! The per-branch coordinator.
//!
//! A master owns a fresh branch of history. It builds the mirror dispatcher
//! under `namespace.dispatchers[branch]`, wraps the initial store as the
//! branch's first mirror, and serves two client mailboxes whose replies are a
//! sum of response or human-readable failure string.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace};

use crate::dispatcher::{DispatcherMetadata, MirrorDispatcher};
use crate::fabric::{Addr, Mailbox, Node};
use crate::fifo::{Interrupted, OrderToken};
use crate::ids::BranchId;
use crate::metadata::ReadWriteView;
use crate::mirror::{Mirror, MirrorError};
use crate::protocol::Protocol;
use crate::resource::{ResourceAdvertisement, ResourceMetadata};
use crate::store::StoreView;

/// Everything a namespace publishes about its replication topology.
#[derive(Debug)]
pub struct NamespaceMetadata<P: Protocol> {
    pub master: ResourceMetadata<MasterMetadata<P>>,
    pub dispatchers: BTreeMap<BranchId, DispatcherMetadata<P>>,
}

impl<P: Protocol> Default for NamespaceMetadata<P> {
    fn default() -> Self {
        NamespaceMetadata {
            master: Default::default(),
            dispatchers: Default::default(),
        }
    }
}

impl<P: Protocol> Clone for NamespaceMetadata<P> {
    fn clone(&self) -> Self {
        NamespaceMetadata {
            master: self.master.clone(),
            dispatchers: self.dispatchers.clone(),
        }
    }
}

/// The master's advertised mailbox addresses.
#[derive(Debug)]
pub struct MasterMetadata<P: Protocol> {
    pub read: Addr<MasterReadMessage<P>>,
    pub write: Addr<MasterWriteMessage<P>>,
}

impl<P: Protocol> Clone for MasterMetadata<P> {
    fn clone(&self) -> Self {
        MasterMetadata {
            read: self.read.clone(),
            write: self.write.clone(),
        }
    }
}

/// A client read. The reply is the response or a failure string.
#[derive(Debug)]
pub struct MasterReadMessage<P: Protocol> {
    pub read: P::Read,
    pub order: OrderToken,
    pub reply: Addr<Result<P::ReadResponse, String>>,
}

/// A client write. The reply is the response or a failure string.
#[derive(Debug)]
pub struct MasterWriteMessage<P: Protocol> {
    pub write: P::Write,
    pub order: OrderToken,
    pub reply: Addr<Result<P::WriteResponse, String>>,
}

/// Why a master could not start.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

/// The branch coordinator. Refuses new operations once torn down.
#[derive(Debug)]
pub struct Master<P: Protocol> {
    branch: BranchId,
    metadata: MasterMetadata<P>,
    dispatcher: Arc<MirrorDispatcher<P>>,
    listeners: Vec<AbortOnDropHandle<()>>,
    stop: CancellationToken,
    // Destroyed before anything else so clients stop sending first.
    _advertisement: ResourceAdvertisement<MasterMetadata<P>>,
    _stop_guard: DropGuard,
}

impl<P: Protocol> Master<P> {
    /// Starts a master over `initial_store` and returns it together with the
    /// branch's first mirror.
    ///
    /// The initial store must be coherent and not backfilling.
    pub async fn new<S: StoreView<P>>(
        node: &Node,
        initial_store: Arc<S>,
        namespace: ReadWriteView<NamespaceMetadata<P>>,
        cancel: &CancellationToken,
    ) -> Result<(Self, Mirror<P, S>), MasterError> {
        assert!(
            !initial_store.is_backfilling(),
            "the initial store must not be backfilling"
        );
        assert!(
            initial_store.is_coherent(),
            "the initial store must be coherent"
        );
        if cancel.is_cancelled() {
            return Err(Interrupted.into());
        }

        let branch = BranchId::random();
        debug!(branch = %branch.fmt_short(), "starting master");

        let dispatcher_view = namespace
            .field(|n: &mut NamespaceMetadata<P>| &mut n.dispatchers)
            .member(branch);
        let dispatcher = Arc::new(MirrorDispatcher::new(
            node,
            branch,
            dispatcher_view.clone(),
            initial_store.timestamp(),
        ));

        let initial_mirror = Mirror::new(node, initial_store, dispatcher_view, cancel).await?;

        let stop = CancellationToken::new();
        let (read_addr, read_mailbox) = node.mailbox();
        let (write_addr, write_mailbox) = node.mailbox();
        let listeners = vec![
            AbortOnDropHandle::new(tokio::spawn(run_reads(
                node.clone(),
                dispatcher.clone(),
                read_mailbox,
                stop.clone(),
            ))),
            AbortOnDropHandle::new(tokio::spawn(run_writes(
                node.clone(),
                dispatcher.clone(),
                write_mailbox,
                stop.clone(),
            ))),
        ];

        let metadata = MasterMetadata {
            read: read_addr,
            write: write_addr,
        };
        let advertisement = ResourceAdvertisement::new(
            node,
            namespace.field(|n: &mut NamespaceMetadata<P>| &mut n.master),
            metadata.clone(),
        );

        let master = Master {
            branch,
            metadata,
            dispatcher,
            listeners,
            stop: stop.clone(),
            _advertisement: advertisement,
            _stop_guard: stop.drop_guard(),
        };
        Ok((master, initial_mirror))
    }

    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// The mailbox addresses clients talk to.
    pub fn metadata(&self) -> MasterMetadata<P> {
        self.metadata.clone()
    }

    /// Stops accepting operations, drains in-flight ones, then tears down
    /// the dispatcher.
    pub async fn shutdown(self) {
        let Master {
            branch,
            dispatcher,
            mut listeners,
            stop,
            _advertisement,
            ..
        } = self;
        // Clients stop sending once the advertisement is gone.
        drop(_advertisement);
        stop.cancel();
        for listener in listeners.drain(..) {
            let _ = listener.await;
        }
        if let Ok(dispatcher) = Arc::try_unwrap(dispatcher) {
            dispatcher.shutdown().await;
        }
        debug!(branch = %branch.fmt_short(), "master closed");
    }
}

async fn run_reads<P: Protocol>(
    node: Node,
    dispatcher: Arc<MirrorDispatcher<P>>,
    mut mailbox: Mailbox<MasterReadMessage<P>>,
    stop: CancellationToken,
) {
    let mut ops = JoinSet::new();
    loop {
        tokio::select! {
            msg = mailbox.recv() => match msg {
                Some(msg) => {
                    let node = node.clone();
                    let dispatcher = dispatcher.clone();
                    ops.spawn(async move {
                        let result = dispatcher.read(msg.read, msg.order).await;
                        trace!(ok = result.is_ok(), "read dispatched");
                        node.send(&msg.reply, result.map_err(|e| e.to_string()));
                    });
                }
                None => break,
            },
            _ = stop.cancelled() => break,
            Some(_) = ops.join_next(), if !ops.is_empty() => {}
        }
    }
    while ops.join_next().await.is_some() {}
}

async fn run_writes<P: Protocol>(
    node: Node,
    dispatcher: Arc<MirrorDispatcher<P>>,
    mut mailbox: Mailbox<MasterWriteMessage<P>>,
    stop: CancellationToken,
) {
    let mut ops = JoinSet::new();
    loop {
        tokio::select! {
            msg = mailbox.recv() => match msg {
                Some(msg) => {
                    let node = node.clone();
                    let dispatcher = dispatcher.clone();
                    ops.spawn(async move {
                        let result = dispatcher.write(msg.write, msg.order).await;
                        trace!(ok = result.is_ok(), "write dispatched");
                        node.send(&msg.reply, result.map_err(|e| e.to_string()));
                    });
                }
                None => break,
            },
            _ = stop.cancelled() => break,
            Some(_) = ops.join_next(), if !ops.is_empty() => {}
        }
    }
    while ops.join_next().await.is_some() {}
}
