//! The registrar half of the registration protocol.
//!
//! A registrar owns two mailboxes, *create* and *delete*, advertised through
//! its metadata. Registrations live in an actor-owned table; every change is
//! emitted as a [`RegistrarEvent`] so the consumer (the mirror dispatcher)
//! applies mirror-set updates on its own task instead of through callbacks.
//! The registrar watches each registrant's peer and synthesizes a delete when
//! the peer is lost, so a registration never outlives its owner.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

use crate::fabric::{Addr, Mailbox, Node};
use crate::ids::{PeerId, RegistrationId};

/// What a registrant sends to the create mailbox.
#[derive(Debug, Clone)]
pub struct CreateMessage<T> {
    pub id: RegistrationId,
    pub peer: PeerId,
    pub value: T,
}

/// The registrar's advertised mailbox addresses.
#[derive(Debug, Clone)]
pub struct RegistrarMetadata<T> {
    pub create: Addr<CreateMessage<T>>,
    pub delete: Addr<RegistrationId>,
}

/// A change to the registration table.
#[derive(Debug, Clone)]
pub enum RegistrarEvent<T> {
    Created {
        id: RegistrationId,
        peer: PeerId,
        value: T,
    },
    Deleted {
        id: RegistrationId,
    },
}

/// Accepts registrations and reports table changes over a channel.
#[derive(Debug)]
pub struct Registrar<T> {
    metadata: RegistrarMetadata<T>,
    _actor: AbortOnDropHandle<()>,
}

impl<T: Clone + Send + Sync + 'static> Registrar<T> {
    pub fn new(node: &Node, events: mpsc::UnboundedSender<RegistrarEvent<T>>) -> Self {
        let (create, create_mailbox) = node.mailbox();
        let (delete, delete_mailbox) = node.mailbox();
        let actor = Actor {
            node: node.clone(),
            delete: delete.clone(),
            events,
            active: HashMap::new(),
        };
        let handle = tokio::spawn(actor.run(create_mailbox, delete_mailbox));
        Registrar {
            metadata: RegistrarMetadata { create, delete },
            _actor: AbortOnDropHandle::new(handle),
        }
    }

    /// The addresses to advertise to registrants.
    pub fn metadata(&self) -> RegistrarMetadata<T> {
        self.metadata.clone()
    }
}

struct Actor<T> {
    node: Node,
    delete: Addr<RegistrationId>,
    events: mpsc::UnboundedSender<RegistrarEvent<T>>,
    // Registration id -> the watcher that converts peer loss into a delete.
    active: HashMap<RegistrationId, AbortOnDropHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> Actor<T> {
    async fn run(
        mut self,
        mut create_mailbox: Mailbox<CreateMessage<T>>,
        mut delete_mailbox: Mailbox<RegistrationId>,
    ) {
        loop {
            tokio::select! {
                msg = create_mailbox.recv() => match msg {
                    Some(msg) => self.on_create(msg),
                    None => break,
                },
                id = delete_mailbox.recv() => match id {
                    Some(id) => self.on_delete(id),
                    None => break,
                },
            }
        }
        debug!("registrar actor closed");
    }

    fn on_create(&mut self, msg: CreateMessage<T>) {
        if self.active.contains_key(&msg.id) {
            warn!(id = %msg.id.fmt_short(), "duplicate create for a live registration, dropping");
            return;
        }
        trace!(id = %msg.id.fmt_short(), peer = %msg.peer.fmt_short(), "registration created");
        let watcher = {
            let node = self.node.clone();
            let delete = self.delete.clone();
            let liveness = self.node.liveness(msg.peer);
            let id = msg.id;
            tokio::spawn(async move {
                liveness.lost().await;
                node.send(&delete, id);
            })
        };
        self.active.insert(msg.id, AbortOnDropHandle::new(watcher));
        let _ = self.events.send(RegistrarEvent::Created {
            id: msg.id,
            peer: msg.peer,
            value: msg.value,
        });
    }

    fn on_delete(&mut self, id: RegistrationId) {
        // Unknown ids are fine: retransmits and peer-loss races both end here.
        match self.active.remove(&id) {
            Some(_watcher) => {
                trace!(id = %id.fmt_short(), "registration deleted");
                let _ = self.events.send(RegistrarEvent::Deleted { id });
            }
            None => trace!(id = %id.fmt_short(), "delete for unknown registration, ignoring"),
        }
    }
}
