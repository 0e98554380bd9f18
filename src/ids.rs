//! Random 128-bit identifiers used across the replication core.

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name([u8; 16]);

        impl $name {
            /// Mints a fresh random id.
            pub fn random() -> Self {
                $name(rand::random())
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                $name(bytes)
            }

            /// First four bytes as hex, for log lines.
            pub fn fmt_short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.fmt_short())
            }
        }
    };
}

id_type!(
    /// Names a fork of history owned by one master.
    BranchId
);
id_type!(
    /// Identifies a mirror for the lifetime of its process.
    MirrorId
);
id_type!(
    /// Identifies a single registration of a mirror with a registrar.
    RegistrationId
);
id_type!(
    /// Identifies one origin of ordered operations.
    OrderSourceId
);
id_type!(
    /// The local identity of one peer on the cluster fabric.
    PeerId
);
