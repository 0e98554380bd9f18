//! Advertised resources: a component publishes its mailbox addresses in the
//! metadata tree while it is alive; consumers access them and learn, through
//! one signal, when the component is torn down or its peer is gone.

use tokio::select;

use crate::fabric::{LivenessSignal, Node};
use crate::ids::PeerId;
use crate::metadata::{ReadView, ReadWriteView};

/// A referenced resource (registrar, master, backfiller, peer) was torn down.
#[derive(Debug, Clone, thiserror::Error)]
#[error("resource lost: {0}")]
pub struct ResourceLost(pub String);

/// The lifecycle of an advertised resource, as seen through metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResourceMetadata<T> {
    /// Nothing has been advertised here yet.
    #[default]
    Unregistered,
    /// The resource is up on `peer`.
    Alive { peer: PeerId, value: T },
    /// The resource was torn down and will not come back.
    Destroyed,
}

/// Publishes a resource as `Alive` for as long as it is held; marks it
/// `Destroyed` on drop.
#[derive(Debug)]
pub struct ResourceAdvertisement<T: Clone + Send + Sync + 'static> {
    view: ReadWriteView<ResourceMetadata<T>>,
}

impl<T: Clone + Send + Sync + 'static> ResourceAdvertisement<T> {
    pub fn new(node: &Node, view: ReadWriteView<ResourceMetadata<T>>, value: T) -> Self {
        let peer = node.identity();
        view.update(move |m| {
            *m = ResourceMetadata::Alive { peer, value };
        });
        ResourceAdvertisement { view }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for ResourceAdvertisement<T> {
    fn drop(&mut self) {
        self.view.update(|m| *m = ResourceMetadata::Destroyed);
    }
}

/// Access to somebody else's advertised resource.
#[derive(Debug, Clone)]
pub struct ResourceAccess<T> {
    view: ReadView<ResourceMetadata<T>>,
    liveness: LivenessSignal,
}

impl<T: Clone + Send + Sync + 'static> ResourceAccess<T> {
    /// Fails with [`ResourceLost`] if the resource is not currently alive.
    pub fn new(node: &Node, view: ReadView<ResourceMetadata<T>>) -> Result<Self, ResourceLost> {
        let peer = match view.snapshot() {
            ResourceMetadata::Alive { peer, .. } => peer,
            ResourceMetadata::Unregistered => {
                return Err(ResourceLost("resource was never registered".into()))
            }
            ResourceMetadata::Destroyed => {
                return Err(ResourceLost("resource was destroyed".into()))
            }
        };
        let liveness = node.liveness(peer);
        let access = ResourceAccess { view, liveness };
        access.check()?;
        Ok(access)
    }

    /// The resource's current value, if it is still alive.
    pub fn access(&self) -> Result<T, ResourceLost> {
        if self.liveness.is_lost() {
            return Err(ResourceLost("lost contact with the resource's peer".into()));
        }
        match self.view.snapshot() {
            ResourceMetadata::Alive { value, .. } => Ok(value),
            ResourceMetadata::Unregistered => {
                Err(ResourceLost("resource was never registered".into()))
            }
            ResourceMetadata::Destroyed => Err(ResourceLost("resource was destroyed".into())),
        }
    }

    /// Re-verifies that the resource is still alive.
    pub fn check(&self) -> Result<(), ResourceLost> {
        if self.liveness.is_lost() {
            return Err(ResourceLost("lost contact with the resource's peer".into()));
        }
        match self.view.snapshot() {
            ResourceMetadata::Alive { .. } => Ok(()),
            ResourceMetadata::Unregistered => {
                Err(ResourceLost("resource was never registered".into()))
            }
            ResourceMetadata::Destroyed => Err(ResourceLost("resource was destroyed".into())),
        }
    }

    /// Resolves with a human-readable reason once the resource fails.
    pub async fn wait_failed(&self) -> String {
        let mut view = self.view.clone();
        loop {
            if let Err(ResourceLost(reason)) = self.check() {
                return reason;
            }
            select! {
                _ = view.changed() => {}
                _ = self.liveness.lost() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;

    #[tokio::test]
    async fn advertisement_lifecycle() {
        let fabric = Fabric::new();
        let server = fabric.node();
        let client = fabric.node();
        let root = ReadWriteView::root(ResourceMetadata::<u32>::default());

        assert!(ResourceAccess::<u32>::new(&client, root.read_only()).is_err());

        let ad = ResourceAdvertisement::new(&server, root.clone(), 42);
        let access = ResourceAccess::new(&client, root.read_only()).unwrap();
        assert_eq!(access.access().unwrap(), 42);

        drop(ad);
        assert!(access.access().is_err());
        assert_eq!(access.wait_failed().await, "resource was destroyed");
    }

    #[tokio::test]
    async fn peer_death_fails_access() {
        let fabric = Fabric::new();
        let server = fabric.node();
        let client = fabric.node();
        let root = ReadWriteView::root(ResourceMetadata::<u32>::default());
        let _ad = ResourceAdvertisement::new(&server, root.clone(), 1);

        let access = ResourceAccess::new(&client, root.read_only()).unwrap();
        server.kill();
        assert!(access.access().is_err());
        assert!(access.wait_failed().await.contains("lost contact"));
    }
}
