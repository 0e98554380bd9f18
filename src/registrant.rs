//! The registrant half of the registration protocol.

use tracing::trace;

use crate::fabric::{Addr, Node};
use crate::ids::RegistrationId;
use crate::metadata::ReadView;
use crate::registrar::{CreateMessage, RegistrarMetadata};
use crate::resource::{ResourceAccess, ResourceLost, ResourceMetadata};

/// A live registration with a registrar.
///
/// Dropping the registrant sends exactly one delete for its id. The delete
/// guard is armed *before* the create message is sent, so a registrant that
/// dies mid-construction, after the create went out, still deregisters when
/// it unwinds.
#[derive(Debug)]
pub struct Registrant<T> {
    id: RegistrationId,
    access: ResourceAccess<RegistrarMetadata<T>>,
    _deregisterer: Deregisterer,
}

impl<T: Clone + Send + Sync + 'static> Registrant<T> {
    /// Registers with the registrar advertised in `registrar`.
    ///
    /// Fails with [`ResourceLost`] if the registrar is gone before or during
    /// construction.
    pub fn new(
        node: &Node,
        registrar: ReadView<ResourceMetadata<RegistrarMetadata<T>>>,
        initial_value: T,
    ) -> Result<Self, ResourceLost> {
        let access = ResourceAccess::new(node, registrar)?;
        let metadata = access.access()?;
        let id = RegistrationId::random();

        // Arm deregistration first; everything past this point unwinds into
        // a delete send.
        let deregisterer = Deregisterer {
            node: node.clone(),
            delete: metadata.delete.clone(),
            id,
        };

        node.send(
            &metadata.create,
            CreateMessage {
                id,
                peer: node.identity(),
                value: initial_value,
            },
        );
        trace!(id = %id.fmt_short(), "registration sent");

        // The registrar may have died while we were registering.
        access.check()?;

        Ok(Registrant {
            id,
            access,
            _deregisterer: deregisterer,
        })
    }

    pub fn registration_id(&self) -> RegistrationId {
        self.id
    }

    /// Resolves with a human-readable reason once the registrar fails.
    pub async fn wait_failed(&self) -> String {
        self.access.wait_failed().await
    }
}

#[derive(Debug)]
struct Deregisterer {
    node: Node,
    delete: Addr<RegistrationId>,
    id: RegistrationId,
}

impl Drop for Deregisterer {
    fn drop(&mut self) {
        self.node.send(&self.delete, self.id);
    }
}
