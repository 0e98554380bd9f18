//! The store-view contract: the discipline under which reads, writes,
//! backfills and resets mutate a region of a store together with its
//! metainfo.
//!
//! Every view covers a fixed region and maintains one invariant at rest:
//! `get_metainfo().domain() == region()`. Operations are serialized by tokens
//! from the view's FIFO source, suspend cooperatively, and observe the
//! cancellation signal at every suspension point. A cancelled operation fails
//! with [`Interrupted`]; whatever it already committed stays committed and the
//! metainfo invariant holds either way.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fifo::{Interrupted, ReadToken, WriteToken};
use crate::protocol::Protocol;
use crate::region_map::{Metainfo, RegionMap};
use crate::timestamps::{StateTimestamp, TransitionTimestamp};

pub mod memory;
mod subview;

pub use self::subview::StoreSubview;

/// Decides, from the source's metainfo, whether a backfill should proceed.
/// Called exactly once per [`StoreView::send_backfill`].
pub type ShouldBackfill<R> = Box<dyn FnOnce(&Metainfo<R>) -> bool + Send>;

/// A view over one region of a store.
///
/// Precondition violations are programmer errors and fatal. The
/// `expected_metainfo` arguments are additionally checked against the store's
/// actual metainfo in debug builds.
#[async_trait]
pub trait StoreView<P: Protocol>: Send + Sync + 'static {
    /// The region this view covers. Fixed at construction.
    fn region(&self) -> P::Region;

    /// Issues a read token from the view's FIFO source.
    fn new_read_token(&self) -> ReadToken;

    /// Issues a write token from the view's FIFO source.
    fn new_write_token(&self) -> WriteToken;

    /// The state timestamp the store has reached.
    fn timestamp(&self) -> StateTimestamp;

    /// Whether the metainfo is one uniform stamp over the whole region.
    fn is_coherent(&self) -> bool;

    /// Whether a backfill is in flight (or was torn off mid-way). Set by
    /// [`Self::receive_backfill`], cleared by the [`Self::set_metainfo`] that
    /// completes the catch-up.
    fn is_backfilling(&self) -> bool;

    /// Postcondition: the result's domain equals `region()`.
    async fn get_metainfo(
        &self,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<Metainfo<P::Region>, Interrupted>;

    /// Precondition: `region() ⊇ new_metainfo.domain()`.
    /// Postcondition: `get_metainfo() == new_metainfo` over its domain.
    async fn set_metainfo(
        &self,
        new_metainfo: Metainfo<P::Region>,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted>;

    /// Preconditions: `region() ⊇ expected_metainfo.domain()` and
    /// `expected_metainfo.domain() ⊇ read.region()`.
    async fn read(
        &self,
        expected_metainfo: &Metainfo<P::Region>,
        read: P::Read,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<P::ReadResponse, Interrupted>;

    /// Preconditions: `region() ⊇ expected_metainfo.domain()`,
    /// `new_metainfo.domain() == expected_metainfo.domain()` and
    /// `expected_metainfo.domain() ⊇ write.region()`. Data and metainfo are
    /// updated atomically under the write token.
    async fn write(
        &self,
        expected_metainfo: &Metainfo<P::Region>,
        new_metainfo: &Metainfo<P::Region>,
        write: P::Write,
        timestamp: TransitionTimestamp,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<P::WriteResponse, Interrupted>;

    /// Expresses the changes since `start_point` as an ordered stream of
    /// chunks on `chunks`. Calls `should_backfill` exactly once with the
    /// current metainfo; if it declines, no chunks are sent and `false` is
    /// returned.
    async fn send_backfill(
        &self,
        start_point: RegionMap<P::Region, StateTimestamp>,
        should_backfill: ShouldBackfill<P::Region>,
        chunks: mpsc::Sender<P::BackfillChunk>,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<bool, Interrupted>;

    /// Applies one backfill chunk. If this is interrupted the store's data is
    /// undefined; only a further full backfill makes it valid again.
    async fn receive_backfill(
        &self,
        chunk: P::BackfillChunk,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted>;

    /// Deletes every key in `subregion` and installs `new_metainfo` over its
    /// domain. Preconditions: `region() ⊇ subregion` and
    /// `region() ⊇ new_metainfo.domain()`.
    async fn reset_data(
        &self,
        subregion: P::Region,
        new_metainfo: Metainfo<P::Region>,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted>;
}
