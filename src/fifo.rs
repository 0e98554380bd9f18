//! Per-origin FIFO ordering of reads and writes.
//!
//! Two cooperating halves, split the way the original architecture splits
//! them:
//!
//! - The *enforcer* ([`FifoSource`] / [`FifoSink`]): tokens minted from one
//!   source are admitted at the sink strictly in issue order. Reads may
//!   overlap each other; a write holds the sink exclusively. Store-views and
//!   mirrors use the enforcer to serialize operations.
//! - The *checker* ([`OrderSource`] / [`OrderCheckpoint`]): lightweight wire
//!   tokens that travel with client operations and are verified monotone per
//!   origin in debug builds. The checker observes ordering, it never blocks.
//!
//! Admission returns a guard; dropping the guard releases the token, so
//! release happens on every exit path and releasing an unheld token is
//! unrepresentable.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ids::OrderSourceId;

/// The cancellation signal pulsed; the operation observed it at a suspension
/// point. Committed state is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Mints enforcer tokens. One source per origin.
#[derive(Debug, Default)]
pub struct FifoSource {
    state: Mutex<SourceState>,
}

#[derive(Debug, Default)]
struct SourceState {
    reads: u64,
    writes: u64,
}

impl FifoSource {
    pub fn read_token(&self) -> ReadToken {
        let mut state = self.state.lock();
        state.reads += 1;
        ReadToken {
            writes_before: state.writes,
        }
    }

    pub fn write_token(&self) -> WriteToken {
        let mut state = self.state.lock();
        let token = WriteToken {
            index: state.writes,
            reads_before: state.reads,
        };
        state.writes += 1;
        token
    }
}

/// Ticket for a read. Admitted once every earlier write has released.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadToken {
    writes_before: u64,
}

/// Ticket for a write. Admitted once every earlier token has released; holds
/// the sink exclusively while active.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WriteToken {
    index: u64,
    reads_before: u64,
}

#[derive(Debug, Clone, Default)]
struct SinkState {
    reads_done: u64,
    writes_done: u64,
    // Write tokens whose operation was cancelled before admission. The done
    // counter steps over them so later tokens are not stalled forever.
    abandoned_writes: BTreeSet<u64>,
}

impl SinkState {
    fn settle(&mut self) {
        while self.abandoned_writes.remove(&self.writes_done) {
            self.writes_done += 1;
        }
    }
}

/// Admits tokens from one [`FifoSource`] in issue order.
#[derive(Debug, Clone)]
pub struct FifoSink {
    state: watch::Sender<SinkState>,
}

impl Default for FifoSink {
    fn default() -> Self {
        FifoSink {
            state: watch::channel(SinkState::default()).0,
        }
    }
}

impl FifoSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends until the read token is admitted. Fails with [`Interrupted`]
    /// if `cancel` pulses first; the token is then counted as released, so
    /// cancellation never stalls tokens issued after it.
    pub async fn enter_read(
        &self,
        token: ReadToken,
        cancel: &CancellationToken,
    ) -> Result<ReadGuard, Interrupted> {
        let mut rx = self.state.subscribe();
        tokio::select! {
            res = rx.wait_for(|s| s.writes_done >= token.writes_before) => {
                res.expect("sink sender is held by this sink");
                Ok(ReadGuard { sink: self.clone() })
            }
            _ = cancel.cancelled() => {
                self.state.send_modify(|s| s.reads_done += 1);
                Err(Interrupted)
            }
        }
    }

    /// Suspends until the write token is admitted. Fails with [`Interrupted`]
    /// if `cancel` pulses first; the token is then counted as released, so
    /// cancellation never stalls tokens issued after it.
    pub async fn enter_write(
        &self,
        token: WriteToken,
        cancel: &CancellationToken,
    ) -> Result<WriteGuard, Interrupted> {
        let mut rx = self.state.subscribe();
        tokio::select! {
            res = rx.wait_for(|s| {
                s.writes_done == token.index && s.reads_done >= token.reads_before
            }) => {
                res.expect("sink sender is held by this sink");
                Ok(WriteGuard { sink: self.clone() })
            }
            _ = cancel.cancelled() => {
                self.state.send_modify(|s| {
                    s.abandoned_writes.insert(token.index);
                    s.settle();
                });
                Err(Interrupted)
            }
        }
    }
}

/// Holds a read slot at the sink; released on drop.
#[derive(Debug)]
pub struct ReadGuard {
    sink: FifoSink,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.sink.state.send_modify(|s| s.reads_done += 1);
    }
}

/// Holds exclusive occupancy of the sink; released on drop.
#[derive(Debug)]
pub struct WriteGuard {
    sink: FifoSink,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.sink.state.send_modify(|s| {
            s.writes_done += 1;
            s.settle();
        });
    }
}

/// Mints wire-level order tokens for one origin.
#[derive(Debug)]
pub struct OrderSource {
    id: OrderSourceId,
    counter: AtomicU64,
}

impl Default for OrderSource {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderSource {
    pub fn new() -> Self {
        OrderSource {
            id: OrderSourceId::random(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn read_token(&self) -> OrderToken {
        self.token(OpKind::Read)
    }

    pub fn write_token(&self) -> OrderToken {
        self.token(OpKind::Write)
    }

    fn token(&self, kind: OpKind) -> OrderToken {
        OrderToken {
            source: self.id,
            seq: self.counter.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }
}

/// Whether a token was minted for a read or a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Read,
    Write,
}

/// A monotone per-origin stamp carried with client operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderToken {
    source: OrderSourceId,
    seq: u64,
    kind: OpKind,
}

impl OrderToken {
    pub fn kind(&self) -> OpKind {
        self.kind
    }
}

/// Verifies that tokens from each origin arrive in issue order.
#[derive(Debug, Default)]
pub struct OrderCheckpoint {
    last_seen: Mutex<HashMap<OrderSourceId, u64>>,
}

impl OrderCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the token. In debug builds, going backwards within an origin
    /// is fatal; release builds only observe.
    pub fn check(&self, token: &OrderToken) {
        let mut last_seen = self.last_seen.lock();
        match last_seen.get(&token.source) {
            Some(&last) => {
                debug_assert!(
                    token.seq > last,
                    "order token went backwards: {} after {last}",
                    token.seq
                );
                if token.seq > last {
                    last_seen.insert(token.source, token.seq);
                }
            }
            None => {
                last_seen.insert(token.source, token.seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn reads_overlap() {
        let source = FifoSource::default();
        let sink = FifoSink::new();
        let cancel = CancellationToken::new();
        let t1 = source.read_token();
        let t2 = source.read_token();
        let g1 = sink.enter_read(t1, &cancel).await.unwrap();
        let g2 = sink.enter_read(t2, &cancel).await.unwrap();
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn write_waits_for_earlier_reads_and_blocks_later_ones() {
        let source = FifoSource::default();
        let sink = FifoSink::new();
        let cancel = CancellationToken::new();

        let r1 = source.read_token();
        let w = source.write_token();
        let r2 = source.read_token();

        let g1 = sink.enter_read(r1, &cancel).await.unwrap();

        let write_sink = sink.clone();
        let write_task = tokio::spawn(async move {
            write_sink
                .enter_write(w, &CancellationToken::new())
                .await
                .unwrap()
        });
        settle().await;
        assert!(!write_task.is_finished(), "write admitted before r1 released");

        let read_sink = sink.clone();
        let read_task = tokio::spawn(async move {
            read_sink
                .enter_read(r2, &CancellationToken::new())
                .await
                .unwrap()
        });
        settle().await;
        assert!(!read_task.is_finished(), "r2 admitted past a pending write");

        drop(g1);
        let write_guard = write_task.await.unwrap();
        settle().await;
        assert!(!read_task.is_finished(), "r2 admitted while a write is active");

        drop(write_guard);
        read_task.await.unwrap();
    }

    #[tokio::test]
    async fn writes_admit_in_issue_order() {
        let source = FifoSource::default();
        let sink = FifoSink::new();
        let w1 = source.write_token();
        let w2 = source.write_token();

        let later_sink = sink.clone();
        let later = tokio::spawn(async move {
            later_sink
                .enter_write(w2, &CancellationToken::new())
                .await
                .unwrap()
        });
        settle().await;
        assert!(!later.is_finished(), "w2 admitted before w1");

        let g1 = sink
            .enter_write(w1, &CancellationToken::new())
            .await
            .unwrap();
        drop(g1);
        later.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_token() {
        let source = FifoSource::default();
        let sink = FifoSink::new();
        let cancel = CancellationToken::new();

        let w1 = source.write_token();
        let w2 = source.write_token();
        let _g = sink
            .enter_write(w1, &CancellationToken::new())
            .await
            .unwrap();

        let blocked_sink = sink.clone();
        let blocked_cancel = cancel.clone();
        let blocked = tokio::spawn(async move {
            blocked_sink.enter_write(w2, &blocked_cancel).await
        });
        settle().await;
        cancel.cancel();
        assert_eq!(blocked.await.unwrap().unwrap_err(), Interrupted);

        // The cancelled token counts as released: later tokens are not stalled.
        drop(_g);
        let w3 = source.write_token();
        sink.enter_write(w3, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[test]
    fn checkpoint_tracks_per_source_order() {
        let a = OrderSource::new();
        let b = OrderSource::new();
        let checkpoint = OrderCheckpoint::new();
        let a1 = a.read_token();
        let a2 = a.write_token();
        let b1 = b.write_token();
        checkpoint.check(&a1);
        checkpoint.check(&b1);
        checkpoint.check(&a2);
        assert_eq!(a2.kind(), OpKind::Write);
    }
}
