//! Protocol-agnostic replication core for a region-sharded key-value store.
//!
//! The keyspace is partitioned into regions. Each region is replicated by a
//! set of mirrors coordinated by a per-region [`Master`](master::Master): the
//! master owns a branch of history, fans every write out to all registered
//! mirrors, routes each read to one of them, and keeps the caller's
//! origin-level ordering intact while all replicas of a key observe writes in
//! one total order.
//!
//! The protocol itself is pluggable: bind the [`protocol::Protocol`]
//! descriptor once per protocol and the rest of the crate routes its reads,
//! writes and backfill chunks without ever looking inside them. A reference
//! binding over a flat byte keyspace lives in [`keyspace`], with an
//! in-memory engine in [`store::memory`].
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backfill;
pub mod dispatcher;
pub mod fabric;
pub mod fifo;
pub mod ids;
pub mod keyspace;
pub mod master;
pub mod metadata;
pub mod mirror;
pub mod protocol;
pub mod region;
pub mod region_map;
pub mod registrant;
pub mod registrar;
pub mod resource;
pub mod store;
pub mod timestamps;
pub mod version;

pub use fifo::Interrupted;
pub use ids::{BranchId, MirrorId, OrderSourceId, PeerId, RegistrationId};
pub use region::{Region, RegionError};
pub use region_map::{Metainfo, RegionMap};
pub use timestamps::{StateTimestamp, TransitionTimestamp};
