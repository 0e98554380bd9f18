//! The in-process cluster mailbox fabric.
//!
//! Provides what the replication core consumes from a transport: typed
//! mailboxes with per-address FIFO delivery, send-and-forget at-most-once
//! semantics, a liveness signal per peer and a unique local identity. Sends
//! between a dead peer and anyone are dropped silently, which is exactly the
//! failure shape a severed connection has.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::ids::PeerId;

/// A set of interconnected peers.
#[derive(Debug, Clone, Default)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

#[derive(Debug, Default)]
struct FabricInner {
    peers: Mutex<HashMap<PeerId, CancellationToken>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the fabric as a new peer.
    pub fn node(&self) -> Node {
        let id = PeerId::random();
        self.inner
            .peers
            .lock()
            .insert(id, CancellationToken::new());
        Node {
            id,
            fabric: self.inner.clone(),
        }
    }
}

/// One peer's handle on the fabric.
#[derive(Debug, Clone)]
pub struct Node {
    id: PeerId,
    fabric: Arc<FabricInner>,
}

impl Node {
    pub fn identity(&self) -> PeerId {
        self.id
    }

    /// Creates a typed mailbox owned by this peer.
    pub fn mailbox<T: Send + 'static>(&self) -> (Addr<T>, Mailbox<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Addr { peer: self.id, tx }, Mailbox { rx })
    }

    /// Send-and-forget, at most once. Dropped silently unless both this peer
    /// and the destination are alive.
    pub fn send<T: Send + 'static>(&self, addr: &Addr<T>, msg: T) {
        let peers = self.fabric.peers.lock();
        let alive = |id: &PeerId| peers.get(id).is_some_and(|t| !t.is_cancelled());
        if !alive(&self.id) || !alive(&addr.peer) {
            trace!(from = %self.id.fmt_short(), to = %addr.peer.fmt_short(), "dropping send to/from dead peer");
            return;
        }
        drop(peers);
        let _ = addr.tx.send(msg);
    }

    /// A signal that pulses when `peer` is no longer reachable.
    pub fn liveness(&self, peer: PeerId) -> LivenessSignal {
        let peers = self.fabric.peers.lock();
        match peers.get(&peer) {
            Some(token) => LivenessSignal {
                token: token.clone(),
            },
            // Unknown peers are gone peers.
            None => {
                let token = CancellationToken::new();
                token.cancel();
                LivenessSignal { token }
            }
        }
    }

    /// Severs this peer from the fabric. Every liveness signal for it pulses;
    /// all of its future sends and the sends towards it are dropped.
    pub fn kill(&self) {
        if let Some(token) = self.fabric.peers.lock().get(&self.id) {
            token.cancel();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.fabric
            .peers
            .lock()
            .get(&self.id)
            .is_some_and(|t| !t.is_cancelled())
    }
}

/// The address of a typed mailbox. Cheap to clone and to ship in messages.
pub struct Addr<T> {
    peer: PeerId,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Addr<T> {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl<T> Clone for Addr<T> {
    fn clone(&self) -> Self {
        Addr {
            peer: self.peer,
            tx: self.tx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Addr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Addr({})", self.peer.fmt_short())
    }
}

/// The receiving half of a mailbox.
#[derive(Debug)]
pub struct Mailbox<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Mailbox<T> {
    /// Receives the next message; `None` once every address is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Pulses when a peer becomes unreachable.
#[derive(Debug, Clone)]
pub struct LivenessSignal {
    token: CancellationToken,
}

impl LivenessSignal {
    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the peer is lost.
    pub async fn lost(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_is_fifo_per_address() {
        let fabric = Fabric::new();
        let a = fabric.node();
        let b = fabric.node();
        let (addr, mut mailbox) = b.mailbox::<u32>();
        for i in 0..100 {
            a.send(&addr, i);
        }
        for i in 0..100 {
            assert_eq!(mailbox.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn sends_to_dead_peers_are_dropped() {
        let fabric = Fabric::new();
        let a = fabric.node();
        let b = fabric.node();
        let (addr, mut mailbox) = b.mailbox::<u32>();
        let watch = a.liveness(b.identity());
        assert!(!watch.is_lost());

        b.kill();
        watch.lost().await;
        a.send(&addr, 1);
        drop(addr);
        assert!(mailbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn dead_senders_cannot_send() {
        let fabric = Fabric::new();
        let a = fabric.node();
        let b = fabric.node();
        let (addr, mut mailbox) = b.mailbox::<u32>();
        a.send(&addr, 1);
        a.kill();
        a.send(&addr, 2);
        drop(addr);
        assert_eq!(mailbox.recv().await, Some(1));
        assert!(mailbox.recv().await.is_none());
    }
}
