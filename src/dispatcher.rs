//! The mirror dispatcher: owns a branch's mirror set and routes every read
//! and write through it.
//!
//! The dispatcher is an actor. Registrations arrive as events from its
//! registrar, operations arrive from the master's mailboxes, and both mutate
//! or consult the mirror table only on the actor task. Every registered
//! mirror gets its own [`FifoSource`]; because the actor mints tokens and
//! sends in timestamp order over one FIFO address per mirror, every mirror
//! observes the dispatcher's issued order, and the mirror's sink serializes
//! its reads against its writes with the same tokens.

use std::collections::HashMap;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

use crate::backfill::BackfillerMetadata;
use crate::fabric::{Addr, LivenessSignal, Node};
use crate::fifo::{FifoSource, OrderCheckpoint, OrderToken, ReadToken, WriteToken};
use crate::ids::{BranchId, MirrorId, RegistrationId};
use crate::metadata::ReadWriteView;
use crate::protocol::Protocol;
use crate::registrar::{Registrar, RegistrarEvent, RegistrarMetadata};
use crate::resource::{ResourceAdvertisement, ResourceMetadata};
use crate::timestamps::{StateTimestamp, TransitionTimestamp};

/// Routing failures surfaced to the caller. The core never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// A participating mirror's liveness signal pulsed before it answered.
    #[error("lost contact with a mirror during the operation")]
    MirrorLost,
    /// No registered mirror can play the role the operation needs.
    #[error("insufficient mirrors for the operation")]
    InsufficientMirrors,
}

/// A write fanned out to a mirror's write mailbox. Acked when applied.
#[derive(Debug)]
pub struct WriteMessage<P: Protocol> {
    pub write: P::Write,
    pub timestamp: TransitionTimestamp,
    pub token: WriteToken,
    pub ack: Addr<()>,
}

/// A write sent to a writeread-capable mirror; the reply doubles as the ack.
#[derive(Debug)]
pub struct WriteReadMessage<P: Protocol> {
    pub write: P::Write,
    pub timestamp: TransitionTimestamp,
    pub token: WriteToken,
    pub reply: Addr<P::WriteResponse>,
}

/// A read dispatched to a single mirror.
#[derive(Debug)]
pub struct ReadMessage<P: Protocol> {
    pub read: P::Read,
    pub token: ReadToken,
    pub reply: Addr<P::ReadResponse>,
}

/// What a mirror publishes when it registers: the mailboxes it can serve.
/// Mirrors that cannot serve reads yet (still backfilling) publish only the
/// write mailbox.
#[derive(Debug)]
pub struct MirrorData<P: Protocol> {
    pub mirror_id: MirrorId,
    pub write: Addr<WriteMessage<P>>,
    pub writeread: Option<Addr<WriteReadMessage<P>>>,
    pub read: Option<Addr<ReadMessage<P>>>,
}

impl<P: Protocol> Clone for MirrorData<P> {
    fn clone(&self) -> Self {
        MirrorData {
            mirror_id: self.mirror_id,
            write: self.write.clone(),
            writeread: self.writeread.clone(),
            read: self.read.clone(),
        }
    }
}

/// What the dispatcher publishes under `namespace.dispatchers[branch_id]`.
#[derive(Debug)]
pub struct DispatcherMetadata<P: Protocol> {
    /// The branch this dispatcher owns. `None` until the dispatcher is up.
    pub branch: Option<BranchId>,
    /// Backfillers of the branch's mirrors, published by the mirrors.
    pub mirrors: std::collections::BTreeMap<MirrorId, ResourceMetadata<BackfillerMetadata<P>>>,
    /// How mirrors register with this dispatcher.
    pub registrar: ResourceMetadata<RegistrarMetadata<MirrorData<P>>>,
}

impl<P: Protocol> Default for DispatcherMetadata<P> {
    fn default() -> Self {
        DispatcherMetadata {
            branch: None,
            mirrors: Default::default(),
            registrar: Default::default(),
        }
    }
}

impl<P: Protocol> Clone for DispatcherMetadata<P> {
    fn clone(&self) -> Self {
        DispatcherMetadata {
            branch: self.branch,
            mirrors: self.mirrors.clone(),
            registrar: self.registrar.clone(),
        }
    }
}

/// Per-branch fan-out of reads and writes over the registered mirror set.
#[derive(Debug)]
pub struct MirrorDispatcher<P: Protocol> {
    branch: BranchId,
    to_actor: Option<mpsc::UnboundedSender<Action<P>>>,
    actor: AbortOnDropHandle<()>,
    // Dropped after the actor: mirrors should see the registrar destroyed
    // only once no operation is in flight.
    _registrar: Registrar<MirrorData<P>>,
    _advertisement: ResourceAdvertisement<RegistrarMetadata<MirrorData<P>>>,
}

#[derive(derive_more::Display)]
enum Action<P: Protocol> {
    #[display(fmt = "read")]
    Read {
        read: P::Read,
        order: OrderToken,
        reply: oneshot::Sender<Result<P::ReadResponse, DispatchError>>,
    },
    #[display(fmt = "write")]
    Write {
        write: P::Write,
        order: OrderToken,
        reply: oneshot::Sender<Result<P::WriteResponse, DispatchError>>,
    },
}

impl<P: Protocol> MirrorDispatcher<P> {
    /// Builds the dispatcher at the branch's current timestamp and publishes
    /// its registrar under `metadata`.
    pub fn new(
        node: &Node,
        branch: BranchId,
        metadata: ReadWriteView<DispatcherMetadata<P>>,
        initial_timestamp: StateTimestamp,
    ) -> Self {
        metadata.update(|d| d.branch = Some(branch));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registrar = Registrar::new(node, events_tx);
        let advertisement = ResourceAdvertisement::new(
            node,
            metadata.field(|d: &mut DispatcherMetadata<P>| &mut d.registrar),
            registrar.metadata(),
        );

        let (to_actor, actions) = mpsc::unbounded_channel();
        let actor = Actor {
            node: node.clone(),
            branch,
            timestamp: initial_timestamp,
            mirrors: HashMap::new(),
            checkpoint: OrderCheckpoint::new(),
        };
        let handle = tokio::spawn(actor.run(actions, events_rx));

        MirrorDispatcher {
            branch,
            to_actor: Some(to_actor),
            actor: AbortOnDropHandle::new(handle),
            _registrar: registrar,
            _advertisement: advertisement,
        }
    }

    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Dispatches a read to one read-capable mirror.
    pub async fn read(
        &self,
        read: P::Read,
        order: OrderToken,
    ) -> Result<P::ReadResponse, DispatchError> {
        let (reply, response) = oneshot::channel();
        self.send_action(Action::Read { read, order, reply })?;
        response.await.map_err(|_| DispatchError::MirrorLost)?
    }

    /// Fans a write out to every registered mirror and returns the first
    /// writeread reply. Acks keep draining in the background.
    pub async fn write(
        &self,
        write: P::Write,
        order: OrderToken,
    ) -> Result<P::WriteResponse, DispatchError> {
        let (reply, response) = oneshot::channel();
        self.send_action(Action::Write { write, order, reply })?;
        response.await.map_err(|_| DispatchError::MirrorLost)?
    }

    fn send_action(&self, action: Action<P>) -> Result<(), DispatchError> {
        self.to_actor
            .as_ref()
            .expect("present until shutdown")
            .send(action)
            .map_err(|_| DispatchError::MirrorLost)
    }

    /// Stops accepting operations and waits for in-flight ones to finish.
    pub async fn shutdown(mut self) {
        self.to_actor = None;
        let _ = (&mut self.actor).await;
    }
}

struct MirrorEntry<P: Protocol> {
    data: MirrorData<P>,
    fifo: FifoSource,
    liveness: LivenessSignal,
    // Pulsed on clean deregistration, so drains do not wait on a mirror that
    // unregistered with operations still unacked.
    gone: CancellationToken,
}

struct Actor<P: Protocol> {
    node: Node,
    branch: BranchId,
    timestamp: StateTimestamp,
    mirrors: HashMap<RegistrationId, MirrorEntry<P>>,
    checkpoint: OrderCheckpoint,
}

impl<P: Protocol> Actor<P> {
    async fn run(
        mut self,
        mut actions: mpsc::UnboundedReceiver<Action<P>>,
        mut events: mpsc::UnboundedReceiver<RegistrarEvent<MirrorData<P>>>,
    ) {
        let mut in_flight = FuturesUnordered::new();
        let mut events_open = true;
        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => {
                        trace!(%action, "dispatcher action");
                        if let Some(task) = self.on_action(action) {
                            in_flight.push(task);
                        }
                    }
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_event(event),
                    None => events_open = false,
                },
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            }
        }
        // Drain in-flight operations before tearing down.
        while in_flight.next().await.is_some() {}
        debug!(branch = %self.branch.fmt_short(), "mirror dispatcher closed");
    }

    fn on_event(&mut self, event: RegistrarEvent<MirrorData<P>>) {
        match event {
            RegistrarEvent::Created { id, peer, value } => {
                debug!(
                    branch = %self.branch.fmt_short(),
                    mirror = %value.mirror_id.fmt_short(),
                    peer = %peer.fmt_short(),
                    "mirror registered"
                );
                let entry = MirrorEntry {
                    liveness: self.node.liveness(peer),
                    data: value,
                    fifo: FifoSource::default(),
                    gone: CancellationToken::new(),
                };
                self.mirrors.insert(id, entry);
            }
            RegistrarEvent::Deleted { id } => {
                if let Some(entry) = self.mirrors.remove(&id) {
                    entry.gone.cancel();
                    debug!(
                        branch = %self.branch.fmt_short(),
                        mirror = %entry.data.mirror_id.fmt_short(),
                        "mirror deregistered"
                    );
                }
            }
        }
    }

    fn on_action(
        &mut self,
        action: Action<P>,
    ) -> Option<futures::future::BoxFuture<'static, ()>> {
        match action {
            Action::Read { read, order, reply } => self.on_read(read, order, reply),
            Action::Write { write, order, reply } => self.on_write(write, order, reply),
        }
    }

    fn on_read(
        &mut self,
        read: P::Read,
        order: OrderToken,
        reply: oneshot::Sender<Result<P::ReadResponse, DispatchError>>,
    ) -> Option<futures::future::BoxFuture<'static, ()>> {
        self.checkpoint.check(&order);
        let readable: Vec<&MirrorEntry<P>> = self
            .mirrors
            .values()
            .filter(|m| m.data.read.is_some() && !m.liveness.is_lost())
            .collect();
        let Some(entry) = readable.choose(&mut rand::thread_rng()) else {
            let _ = reply.send(Err(DispatchError::InsufficientMirrors));
            return None;
        };

        let token = entry.fifo.read_token();
        let (reply_addr, mut reply_mailbox) = self.node.mailbox();
        let read_addr = entry.data.read.clone().expect("filtered on read capability");
        self.node.send(
            &read_addr,
            ReadMessage {
                read,
                token,
                reply: reply_addr,
            },
        );

        let liveness = entry.liveness.clone();
        let gone = entry.gone.clone();
        Some(Box::pin(async move {
            let outcome = tokio::select! {
                response = reply_mailbox.recv() => response.ok_or(DispatchError::MirrorLost),
                _ = liveness.lost() => Err(DispatchError::MirrorLost),
                _ = gone.cancelled() => Err(DispatchError::MirrorLost),
            };
            let _ = reply.send(outcome);
        }))
    }

    fn on_write(
        &mut self,
        write: P::Write,
        order: OrderToken,
        reply: oneshot::Sender<Result<P::WriteResponse, DispatchError>>,
    ) -> Option<futures::future::BoxFuture<'static, ()>> {
        self.checkpoint.check(&order);
        let live: Vec<&MirrorEntry<P>> = self
            .mirrors
            .values()
            .filter(|m| !m.liveness.is_lost())
            .collect();
        if !live.iter().any(|m| m.data.writeread.is_some()) {
            let _ = reply.send(Err(DispatchError::InsufficientMirrors));
            return None;
        }

        let timestamp = self.timestamp.next();
        self.timestamp = timestamp.target();
        trace!(branch = %self.branch.fmt_short(), %timestamp, "dispatching write");

        // Send inside the actor, one token per mirror, so every mirror sees
        // the issued timestamp order on its FIFO address.
        let mut responders = Vec::new();
        let mut ackers = Vec::new();
        for entry in live {
            let token = entry.fifo.write_token();
            match &entry.data.writeread {
                Some(writeread_addr) => {
                    let (reply_addr, reply_mailbox) = self.node.mailbox();
                    self.node.send(
                        writeread_addr,
                        WriteReadMessage {
                            write: write.clone(),
                            timestamp,
                            token,
                            reply: reply_addr,
                        },
                    );
                    responders.push((reply_mailbox, entry.liveness.clone(), entry.gone.clone()));
                }
                None => {
                    let (ack_addr, ack_mailbox) = self.node.mailbox();
                    self.node.send(
                        &entry.data.write,
                        WriteMessage {
                            write: write.clone(),
                            timestamp,
                            token,
                            ack: ack_addr,
                        },
                    );
                    ackers.push((ack_mailbox, entry.liveness.clone(), entry.gone.clone()));
                }
            }
        }

        Some(Box::pin(async move {
            let mut responders: FuturesUnordered<_> = responders
                .into_iter()
                .map(|(mut mailbox, liveness, gone)| async move {
                    tokio::select! {
                        response = mailbox.recv() => response,
                        _ = liveness.lost() => None,
                        _ = gone.cancelled() => None,
                    }
                })
                .collect();

            // The first writeread reply goes back to the caller.
            let mut first = None;
            while let Some(outcome) = responders.next().await {
                if let Some(response) = outcome {
                    first = Some(response);
                    break;
                }
            }
            match first {
                Some(response) => {
                    let _ = reply.send(Ok(response));
                }
                None => {
                    warn!("every writeread mirror was lost mid-write");
                    let _ = reply.send(Err(DispatchError::MirrorLost));
                }
            }

            // Keep draining until every mirror has acked or been lost.
            while responders.next().await.is_some() {}
            for (mut ack, liveness, gone) in ackers {
                tokio::select! {
                    _ = ack.recv() => {}
                    _ = liveness.lost() => {}
                    _ = gone.cancelled() => {}
                }
            }
            trace!("write fully acked");
        }))
    }
}
