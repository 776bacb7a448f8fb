//! Segment (ledger) abstraction
//!
//! A `Ledger` is the manager's handle on one backend segment. Every backend
//! call is bounded by the operation timeout and its error mapped into the
//! `LogError` taxonomy. The ledger also tracks slot reservations so that
//! concurrent appenders never push a segment past its rollover threshold.

use super::completion::{with_timeout, Completion};
use super::config::RolloverPolicy;
use super::error::LogError;
use super::position::Position;
use super::segment_store::{SegmentHandle, SegmentStats, SegmentStore, SegmentStoreError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    /// Committed plus in-flight appends
    reserved_entries: u64,
    reserved_bytes: u64,
    committed_entries: u64,
    committed_bytes: u64,
    sealed: bool,
    /// An append timed out and may still land; only a seal settles the count
    uncertain: bool,
}

pub struct Ledger<S: SegmentStore> {
    store: Arc<S>,
    handle: SegmentHandle,
    timeout: Duration,
    counters: Mutex<Counters>,
}

impl<S: SegmentStore> std::fmt::Debug for Ledger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("handle", &self.handle)
            .field("counters", &*self.counters.lock())
            .finish()
    }
}

impl<S: SegmentStore> Ledger<S> {
    fn with_stats(store: Arc<S>, handle: SegmentHandle, timeout: Duration, stats: SegmentStats) -> Self {
        Ledger {
            store,
            handle,
            timeout,
            counters: Mutex::new(Counters {
                reserved_entries: stats.entry_count,
                reserved_bytes: stats.size_bytes,
                committed_entries: stats.entry_count,
                committed_bytes: stats.size_bytes,
                sealed: stats.sealed,
                uncertain: false,
            }),
        }
    }

    /// Create a fresh segment in the backend
    pub async fn create(store: Arc<S>, stream: &str, segment_id: u64, timeout: Duration) -> Completion<Self> {
        let handle = with_timeout(
            "segment.create",
            timeout,
            store.create_segment(stream, segment_id),
        )
        .await?;
        Ok(Self::with_stats(store, handle, timeout, SegmentStats::default()))
    }

    /// Like `create`, but `None` when the id is already taken
    pub async fn try_create(
        store: Arc<S>,
        stream: &str,
        segment_id: u64,
        timeout: Duration,
    ) -> Completion<Option<Self>> {
        let created = with_timeout("segment.create", timeout, async {
            match store.create_segment(stream, segment_id).await {
                Ok(handle) => Ok(Some(handle)),
                Err(SegmentStoreError::AlreadyExists(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(created.map(|handle| Self::with_stats(store, handle, timeout, SegmentStats::default())))
    }

    /// Open an existing segment, loading its counts from the backend
    pub async fn open(store: Arc<S>, stream: &str, segment_id: u64, timeout: Duration) -> Completion<Self> {
        let handle = with_timeout("segment.open", timeout, store.open_segment(stream, segment_id)).await?;
        let stats = with_timeout("segment.stats", timeout, store.segment_stats(&handle)).await?;
        Ok(Self::with_stats(store, handle, timeout, stats))
    }

    pub fn segment_id(&self) -> u64 {
        self.handle.segment_id
    }

    pub fn handle(&self) -> &SegmentHandle {
        &self.handle
    }

    /// Acknowledged appends (including those found on open)
    pub fn entry_count(&self) -> u64 {
        self.counters.lock().committed_entries
    }

    pub fn size_bytes(&self) -> u64 {
        self.counters.lock().committed_bytes
    }

    pub fn is_sealed(&self) -> bool {
        self.counters.lock().sealed
    }

    /// Whether a timed-out append may have landed behind the local counts
    pub fn is_uncertain(&self) -> bool {
        self.counters.lock().uncertain
    }

    /// Whether the segment has reached `policy`, counting in-flight appends
    pub fn reached_threshold(&self, policy: &RolloverPolicy) -> bool {
        let c = self.counters.lock();
        policy.should_roll(c.reserved_entries, c.reserved_bytes)
    }

    /// Claim room for one append of `len` bytes
    ///
    /// Fails once the segment is sealed, holds an append of unknown outcome,
    /// or the policy says it must roll.
    pub fn try_reserve(&self, policy: &RolloverPolicy, len: u64) -> bool {
        let mut c = self.counters.lock();
        if c.sealed || c.uncertain || policy.should_roll(c.reserved_entries, c.reserved_bytes) {
            return false;
        }
        c.reserved_entries += 1;
        c.reserved_bytes += len;
        true
    }

    /// Return a reservation whose append failed
    pub fn release(&self, len: u64) {
        let mut c = self.counters.lock();
        c.reserved_entries = c.reserved_entries.saturating_sub(1);
        c.reserved_bytes = c.reserved_bytes.saturating_sub(len);
    }

    /// Append under a reservation taken with `try_reserve`
    ///
    /// On failure the reservation is released, except on timeout: the write
    /// may still land, so the slot stays taken and the ledger refuses further
    /// reservations until the segment is rolled over.
    pub async fn append(&self, payload: &[u8]) -> Completion<u64> {
        let len = payload.len() as u64;
        match with_timeout(
            "segment.append",
            self.timeout,
            self.store.append(&self.handle, payload),
        )
        .await
        {
            Ok(index) => {
                let mut c = self.counters.lock();
                c.committed_entries += 1;
                c.committed_bytes += len;
                Ok(index)
            }
            Err(e @ LogError::OperationTimeout { .. }) => {
                self.counters.lock().uncertain = true;
                Err(e)
            }
            Err(e) => {
                self.release(len);
                if matches!(e, LogError::SegmentSealed { .. }) {
                    self.counters.lock().sealed = true;
                }
                Err(e)
            }
        }
    }

    pub async fn read_range(&self, start: u64, max_count: usize) -> Completion<Vec<Bytes>> {
        read_segment(&*self.store, &self.handle, start, max_count, self.timeout).await
    }

    /// Seal the segment; sealing an already-sealed segment succeeds
    pub async fn seal(&self) -> Completion<()> {
        match with_timeout("segment.seal", self.timeout, self.store.seal(&self.handle)).await {
            Ok(()) | Err(LogError::SegmentSealed { .. }) => {
                self.counters.lock().sealed = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Backend's authoritative counts
    pub async fn stats(&self) -> Completion<SegmentStats> {
        with_timeout(
            "segment.stats",
            self.timeout,
            self.store.segment_stats(&self.handle),
        )
        .await
    }

    /// Replace local counts with the backend's view
    pub fn reconcile(&self, stats: SegmentStats) {
        let mut c = self.counters.lock();
        c.reserved_entries = stats.entry_count;
        c.reserved_bytes = stats.size_bytes;
        c.committed_entries = stats.entry_count;
        c.committed_bytes = stats.size_bytes;
        c.sealed = stats.sealed;
        c.uncertain = c.uncertain && !stats.sealed;
    }

    pub async fn close(&self) -> Completion<()> {
        with_timeout("segment.close", self.timeout, self.store.close(&self.handle)).await
    }
}

/// Range read against any segment, active or sealed
///
/// A missing segment surfaces as `PositionNotFound` at the requested start.
pub async fn read_segment<S: SegmentStore + ?Sized>(
    store: &S,
    handle: &SegmentHandle,
    start: u64,
    max_count: usize,
    timeout: Duration,
) -> Completion<Vec<Bytes>> {
    match with_timeout(
        "segment.read",
        timeout,
        store.read_range(handle, start, max_count),
    )
    .await
    {
        Err(LogError::NotFound(_)) => Err(LogError::PositionNotFound(Position::new(
            handle.segment_id,
            start,
        ))),
        other => other,
    }
}
