//! Stream Manager
//!
//! Owns the segment chain of one named stream: the single active segment,
//! rollover, appends, cross-segment reads and cursor creation.
//!
//! # State machine
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> Closed
//!                        |                    ^
//!                        +--------------------+  (init failure)
//! ```
//!
//! # Concurrency
//!
//! Appends to the active segment take only a read lock on the active handle
//! plus a per-segment slot reservation. Rollover is the only structural
//! mutation and runs under `rollover_lock`, one at a time. The new chain is
//! persisted with CAS before the new segment becomes active, so rollover
//! happens-before any append that lands in the new segment.

use super::completion::{spawn_completion, with_timeout, Completion};
use super::config::{CursorStart, LogConfig};
use super::cursor::{Cursor, CursorStore};
use super::error::LogError;
use super::ledger::{read_segment, Ledger};
use super::metadata::{MetadataStore, SegmentInfo, StreamMetadata};
use super::metadata_backend::{MetadataBackend, Version};
use super::position::{Entry, Position};
use super::segment_store::{SegmentHandle, SegmentStore};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ManagerState::Uninitialized => "uninitialized",
            ManagerState::Initializing => "initializing",
            ManagerState::Ready => "ready",
            ManagerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Last persisted chain and the version it was written at
struct Cached {
    meta: StreamMetadata,
    version: Version,
}

struct Inner<S: SegmentStore, B: MetadataBackend> {
    name: String,
    config: LogConfig,
    segments: Arc<S>,
    metadata: MetadataStore<B>,
    cursor_store: Arc<dyn CursorStore>,
    state: RwLock<ManagerState>,
    cached: RwLock<Cached>,
    active: RwLock<Option<Arc<Ledger<S>>>>,
    rollover_lock: tokio::sync::Mutex<()>,
}

/// Handle on one stream; clones share the same manager
pub struct StreamManager<S: SegmentStore, B: MetadataBackend> {
    inner: Arc<Inner<S, B>>,
}

impl<S: SegmentStore, B: MetadataBackend> Clone for StreamManager<S, B> {
    fn clone(&self) -> Self {
        StreamManager {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SegmentStore, B: MetadataBackend> std::fmt::Debug for StreamManager<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Stream names become a single key and path segment in the backends
pub(crate) fn validate_stream_name(name: &str) -> Completion<()> {
    if name.is_empty() {
        return Err(LogError::InvalidConfig("stream name must not be empty".to_string()));
    }
    if name.contains('/') {
        return Err(LogError::InvalidConfig(format!(
            "stream name {:?} must not contain '/'",
            name
        )));
    }
    Ok(())
}

impl<S: SegmentStore, B: MetadataBackend> StreamManager<S, B> {
    pub fn new(
        name: impl Into<String>,
        config: LogConfig,
        segments: Arc<S>,
        metadata: MetadataStore<B>,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Self {
        let name = name.into();
        StreamManager {
            inner: Arc::new(Inner {
                cached: RwLock::new(Cached {
                    meta: StreamMetadata::new(name.clone()),
                    version: Version::NEW,
                }),
                name,
                config,
                segments,
                metadata,
                cursor_store,
                state: RwLock::new(ManagerState::Uninitialized),
                active: RwLock::new(None),
                rollover_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.read()
    }

    pub fn config(&self) -> &LogConfig {
        &self.inner.config
    }

    pub(crate) fn cursor_store(&self) -> &Arc<dyn CursorStore> {
        &self.inner.cursor_store
    }

    fn ensure_ready(&self) -> Completion<()> {
        match self.state() {
            ManagerState::Ready => Ok(()),
            ManagerState::Closed => Err(LogError::ManagerClosed(self.inner.name.clone())),
            ManagerState::Uninitialized | ManagerState::Initializing => {
                Err(LogError::Unsupported("stream is not initialized"))
            }
        }
    }

    fn active_ledger(&self) -> Completion<Arc<Ledger<S>>> {
        self.inner
            .active
            .read()
            .clone()
            .ok_or_else(|| LogError::ManagerClosed(self.inner.name.clone()))
    }

    // ------------------------------------------------------------------
    // init
    // ------------------------------------------------------------------

    /// Load or create the stream's metadata and open its active segment
    ///
    /// Calling `init` on a `Ready` manager is a no-op.
    pub async fn init(&self) -> Completion<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                ManagerState::Uninitialized => *state = ManagerState::Initializing,
                ManagerState::Ready => return Ok(()),
                ManagerState::Initializing => {
                    return Err(LogError::Unsupported("init already in progress"))
                }
                ManagerState::Closed => {
                    return Err(LogError::ManagerClosed(self.inner.name.clone()))
                }
            }
        }

        let result = match validate_stream_name(&self.inner.name) {
            Ok(()) => self.init_with_retries().await,
            Err(e) => Err(e),
        };

        let mut state = self.inner.state.write();
        match result {
            Ok(ledger) if *state == ManagerState::Initializing => {
                let segment_id = ledger.segment_id();
                *self.inner.active.write() = Some(ledger);
                *state = ManagerState::Ready;
                info!(stream = %self.inner.name, active_segment = segment_id, "stream ready");
                Ok(())
            }
            Ok(_) => {
                // Closed while initializing; the ledger is dropped unused
                Err(LogError::ManagerClosed(self.inner.name.clone()))
            }
            Err(e) => {
                *state = ManagerState::Closed;
                error!(stream = %self.inner.name, error = %e, "stream initialization failed");
                Err(LogError::InitializationFailed {
                    stream: self.inner.name.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn init_with_retries(&self) -> Completion<Arc<Ledger<S>>> {
        let max = self.inner.config.retry.max_cas_retries;
        let mut attempt = 0;
        loop {
            match self.init_once().await {
                Err(LogError::VersionConflict { .. }) if attempt + 1 < max => {
                    attempt += 1;
                    warn!(stream = %self.inner.name, attempt, "metadata changed during init, retrying");
                }
                other => return other,
            }
        }
    }

    async fn init_once(&self) -> Completion<Arc<Ledger<S>>> {
        let name = self.inner.name.as_str();
        let timeout = self.inner.config.operation_timeout;
        let (mut meta, mut version) = self.inner.metadata.get_or_create(name).await?;

        if let Some(info) = meta.active_segment().cloned() {
            let ledger = Ledger::open(self.inner.segments.clone(), name, info.segment_id, timeout).await?;
            let stats = ledger.stats().await?;
            if !stats.sealed {
                meta.set_counts(info.segment_id, stats.entry_count, stats.size_bytes);
                ledger.reconcile(stats);
                debug!(
                    stream = name,
                    segment_id = info.segment_id,
                    entries = stats.entry_count,
                    "reopened active segment"
                );
                *self.inner.cached.write() = Cached { meta, version };
                return Ok(Arc::new(ledger));
            }

            // Sealed in the backend but not in metadata: a rollover stopped
            // between seal and persist. Finish it.
            warn!(
                stream = name,
                segment_id = info.segment_id,
                "active segment already sealed, completing interrupted rollover"
            );
            meta.seal_segment(info.segment_id, stats.entry_count, stats.size_bytes);
            if let Err(e) = ledger.close().await {
                warn!(stream = name, error = %e, "failed to close sealed segment handle");
            }
        }

        let ledger = self.create_next_segment(&meta).await?;
        meta.push_segment(SegmentInfo::new(ledger.segment_id()));
        version = self.inner.metadata.update(name, &meta, version).await?;
        info!(stream = name, segment_id = ledger.segment_id(), "opened new segment");
        *self.inner.cached.write() = Cached { meta, version };
        Ok(Arc::new(ledger))
    }

    /// Create the segment after the chain's tail
    ///
    /// An existing, empty, unsealed segment at that id is an orphan from a
    /// rollover whose metadata write failed, and is adopted. Anything else at
    /// that id is skipped.
    async fn create_next_segment(&self, meta: &StreamMetadata) -> Completion<Ledger<S>> {
        let name = self.inner.name.as_str();
        let timeout = self.inner.config.operation_timeout;
        let mut segment_id = meta.peek_next_segment_id();

        for _ in 0..self.inner.config.retry.max_cas_retries {
            let created =
                Ledger::try_create(self.inner.segments.clone(), name, segment_id, timeout).await?;
            if let Some(ledger) = created {
                return Ok(ledger);
            }
            let ledger = Ledger::open(self.inner.segments.clone(), name, segment_id, timeout).await?;
            if ledger.entry_count() == 0 && !ledger.is_sealed() {
                info!(stream = name, segment_id, "adopting orphaned segment");
                return Ok(ledger);
            }
            warn!(stream = name, segment_id, "segment id occupied, skipping");
            segment_id += 1;
        }
        Err(LogError::Corruption(format!(
            "stream {}: no free segment id at or after {}",
            name,
            meta.peek_next_segment_id()
        )))
    }

    pub fn async_init<C>(&self, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<()>) + Send + 'static,
    {
        let this = self.clone();
        spawn_completion("stream.init", async move { this.init().await }, callback)
    }

    // ------------------------------------------------------------------
    // append
    // ------------------------------------------------------------------

    /// Append one payload, rolling the segment over first if it is full
    pub async fn add_entry(&self, payload: impl Into<Bytes>) -> Completion<Position> {
        self.ensure_ready()?;
        let payload: Bytes = payload.into();
        let max_sealed_retries = self.inner.config.retry.max_sealed_retries;
        let mut sealed_retries = 0;

        loop {
            let ledger = self.reserve_slot(payload.len() as u64).await?;
            match ledger.append(&payload).await {
                Ok(index) => return Ok(Position::new(ledger.segment_id(), index)),
                Err(LogError::SegmentSealed { segment_id }) if sealed_retries < max_sealed_retries => {
                    sealed_retries += 1;
                    debug!(
                        stream = %self.inner.name,
                        segment_id,
                        attempt = sealed_retries,
                        "append raced a rollover, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reserve a slot in the active segment, rolling over when it is full
    async fn reserve_slot(&self, len: u64) -> Completion<Arc<Ledger<S>>> {
        let policy = self.inner.config.rollover;
        let max_rollovers = self.inner.config.retry.max_sealed_retries + 1;
        let mut last_segment = None;

        for _ in 0..max_rollovers {
            let ledger = self.active_ledger()?;
            if ledger.try_reserve(&policy, len) {
                return Ok(ledger);
            }
            last_segment = Some(ledger.segment_id());
            if ledger.is_uncertain() {
                // Sealing fences the timed-out write and settles the count
                debug!(
                    stream = %self.inner.name,
                    segment_id = ledger.segment_id(),
                    "active segment has an append of unknown outcome, rolling over"
                );
            }
            self.roll_over(ledger.segment_id()).await?;
        }

        // Other appenders kept filling each new segment first
        Err(LogError::SegmentSealed {
            segment_id: last_segment.unwrap_or_default(),
        })
    }

    /// Seal `full_segment` and make a new segment active
    ///
    /// No-op if another task already rolled `full_segment` over.
    async fn roll_over(&self, full_segment: u64) -> Completion<()> {
        let _guard = self.inner.rollover_lock.lock().await;
        self.ensure_ready()?;
        let old = self.active_ledger()?;
        if old.segment_id() != full_segment {
            return Ok(());
        }

        let name = self.inner.name.as_str();
        old.seal().await?;
        let stats = old.stats().await?;

        let base = self.inner.cached.read().meta.clone();
        let new_ledger = self.create_next_segment(&base).await?;
        let new_id = new_ledger.segment_id();

        let (meta, version) = self
            .persist_rollover(full_segment, stats.entry_count, stats.size_bytes, new_id)
            .await?;

        *self.inner.cached.write() = Cached { meta, version };
        *self.inner.active.write() = Some(Arc::new(new_ledger));
        info!(
            stream = name,
            sealed_segment = full_segment,
            sealed_entries = stats.entry_count,
            new_segment = new_id,
            "rolled over"
        );

        if let Err(e) = old.close().await {
            warn!(stream = name, segment_id = full_segment, error = %e, "failed to close sealed segment handle");
        }
        Ok(())
    }

    /// CAS the rolled-over chain, re-reading on conflict
    async fn persist_rollover(
        &self,
        sealed_id: u64,
        entry_count: u64,
        size_bytes: u64,
        new_id: u64,
    ) -> Completion<(StreamMetadata, Version)> {
        let name = self.inner.name.as_str();
        let (mut meta, mut version) = {
            let cached = self.inner.cached.read();
            (cached.meta.clone(), cached.version)
        };

        let mut last_conflict = None;
        for attempt in 0..self.inner.config.retry.max_cas_retries {
            if meta.segment(new_id).is_some() {
                // An earlier write whose reply was lost already landed
                return Ok((meta, version));
            }
            if meta.active_segment().map(|s| s.segment_id) != Some(sealed_id) {
                return Err(LogError::Corruption(format!(
                    "stream {}: stored chain no longer ends at active segment {}",
                    name, sealed_id
                )));
            }
            meta.seal_segment(sealed_id, entry_count, size_bytes);
            meta.push_segment(SegmentInfo::new(new_id));

            match self.inner.metadata.update(name, &meta, version).await {
                Ok(new_version) => return Ok((meta, new_version)),
                Err(conflict @ LogError::VersionConflict { .. }) => {
                    warn!(stream = name, attempt, "metadata version conflict during rollover");
                    last_conflict = Some(conflict);
                    (meta, version) = self.inner.metadata.get(name).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or_else(|| {
            LogError::InvalidConfig("retry.max_cas_retries must be at least 1".to_string())
        }))
    }

    pub fn async_add_entry<C>(&self, payload: impl Into<Bytes>, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<Position>) + Send + 'static,
    {
        let this = self.clone();
        let payload: Bytes = payload.into();
        spawn_completion(
            "stream.add_entry",
            async move { this.add_entry(payload).await },
            callback,
        )
    }

    // ------------------------------------------------------------------
    // read
    // ------------------------------------------------------------------

    /// Segments from `segment_id` onwards, refreshing from the store once if
    /// the id is not in the cached chain
    async fn resolve(&self, from: Position) -> Completion<Vec<SegmentInfo>> {
        {
            let cached = self.inner.cached.read();
            if cached.meta.segment(from.segment_id).is_some() {
                return Ok(self.with_live_counts(cached.meta.segments_from(from.segment_id)));
            }
        }

        let (fresh, _) = self.inner.metadata.get(&self.inner.name).await?;
        if fresh.segment(from.segment_id).is_none() {
            return Err(LogError::PositionNotFound(from));
        }
        Ok(self.with_live_counts(fresh.segments_from(from.segment_id)))
    }

    /// Overlay the active ledger's committed counts onto a chain slice
    fn with_live_counts(&self, segments: &[SegmentInfo]) -> Vec<SegmentInfo> {
        let mut segments = segments.to_vec();
        if let Some(ledger) = self.inner.active.read().as_ref() {
            if let Some(info) = segments
                .iter_mut()
                .find(|s| s.segment_id == ledger.segment_id() && !s.sealed)
            {
                info.entry_count = ledger.entry_count();
                info.size_bytes = ledger.size_bytes();
            }
        }
        segments
    }

    /// Read up to `max_count` entries starting at `from`, across segments
    ///
    /// Returns fewer (possibly zero) entries at the tail. Fails as a whole if
    /// any segment read fails.
    pub async fn read_entries(&self, max_count: usize, from: Position) -> Completion<Vec<Entry>> {
        self.ensure_ready()?;
        let chain = self.resolve(from).await?;
        let timeout = self.inner.config.operation_timeout;
        let mut entries = Vec::new();

        for info in &chain {
            if entries.len() >= max_count {
                break;
            }
            let start = if info.segment_id == from.segment_id {
                from.entry_index
            } else {
                0
            };
            if info.sealed && start >= info.entry_count {
                continue;
            }

            let handle = SegmentHandle::new(self.inner.name.clone(), info.segment_id);
            let remaining = max_count - entries.len();
            let records = read_segment(&*self.inner.segments, &handle, start, remaining, timeout).await?;
            entries.extend(records.into_iter().enumerate().map(|(i, payload)| {
                Entry::new(Position::new(info.segment_id, start + i as u64), payload)
            }));

            if !info.sealed {
                break;
            }
        }

        debug_assert!(entries.windows(2).all(|w| w[0].position < w[1].position));
        Ok(entries)
    }

    pub fn async_read_entries<C>(&self, max_count: usize, from: Position, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<Vec<Entry>>) + Send + 'static,
    {
        let this = self.clone();
        spawn_completion(
            "stream.read_entries",
            async move { this.read_entries(max_count, from).await },
            callback,
        )
    }

    // ------------------------------------------------------------------
    // cursors
    // ------------------------------------------------------------------

    /// First position of the chain
    pub fn first_position(&self) -> Position {
        self.inner
            .cached
            .read()
            .meta
            .segments
            .first()
            .map(|s| Position::first_of(s.segment_id))
            .unwrap_or(Position::EARLIEST)
    }

    /// Position the next append to the active segment would take
    pub fn tail_position(&self) -> Position {
        match self.inner.active.read().as_ref() {
            Some(ledger) => Position::new(ledger.segment_id(), ledger.entry_count()),
            None => self
                .inner
                .cached
                .read()
                .meta
                .last_position()
                .map(|p| p.next())
                .unwrap_or(Position::EARLIEST),
        }
    }

    /// Open a named cursor, resuming from stored state when present
    pub async fn open_cursor(&self, cursor_name: &str) -> Completion<Cursor<S, B>> {
        self.ensure_ready()?;
        let stored = self
            .inner
            .cursor_store
            .load(&self.inner.name, cursor_name)
            .await?;

        let position = match stored {
            Some(state) => state.position,
            None => match self.inner.config.cursor.start {
                CursorStart::Earliest => self.first_position(),
                CursorStart::Latest => self.tail_position(),
            },
        };
        debug!(stream = %self.inner.name, cursor = cursor_name, %position, "cursor opened");
        Ok(Cursor::new(cursor_name, self.clone(), position))
    }

    pub fn async_open_cursor<C>(&self, cursor_name: &str, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<Cursor<S, B>>) + Send + 'static,
    {
        let this = self.clone();
        let cursor_name = cursor_name.to_string();
        spawn_completion(
            "stream.open_cursor",
            async move { this.open_cursor(&cursor_name).await },
            callback,
        )
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    /// Chain snapshot with live counts for the active segment
    pub fn metadata(&self) -> StreamMetadata {
        let meta = self.inner.cached.read().meta.clone();
        StreamMetadata {
            segments: self.with_live_counts(&meta.segments),
            ..meta
        }
    }

    /// Version of the last persisted chain
    pub fn metadata_version(&self) -> Version {
        self.inner.cached.read().version
    }

    /// Position of the newest acknowledged entry
    pub fn last_position(&self) -> Option<Position> {
        self.metadata().last_position()
    }

    pub fn entry_count(&self) -> u64 {
        self.metadata().total_entries()
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    /// Transition to `Closed` and release the active segment handle
    ///
    /// Idempotent. Waits for an in-flight rollover to finish.
    pub async fn close(&self) -> Completion<()> {
        {
            let mut state = self.inner.state.write();
            if *state == ManagerState::Closed {
                return Ok(());
            }
            *state = ManagerState::Closed;
        }

        let _guard = self.inner.rollover_lock.lock().await;
        let ledger = self.inner.active.write().take();
        info!(stream = %self.inner.name, "stream closed");
        match ledger {
            Some(ledger) => ledger.close().await,
            None => Ok(()),
        }
    }

    pub fn async_close<C>(&self, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<()>) + Send + 'static,
    {
        let this = self.clone();
        spawn_completion("stream.close", async move { this.close().await }, callback)
    }

    /// Close the stream and remove its segments, metadata and cursor states
    pub async fn delete(&self) -> Completion<()> {
        let name = self.inner.name.as_str();
        let timeout = self.inner.config.operation_timeout;
        self.close().await?;

        let (meta, version) = match self.inner.metadata.get(name).await {
            Ok(found) => found,
            Err(LogError::NotFound(_)) => (StreamMetadata::new(name), Version::NEW),
            Err(e) => return Err(e),
        };

        let mut ids: Vec<u64> = meta.segments.iter().map(|s| s.segment_id).collect();
        let stored = with_timeout(
            "segment.list",
            timeout,
            self.inner.segments.list_segments(name),
        )
        .await?;
        ids.extend(stored);
        ids.sort_unstable();
        ids.dedup();

        for id in &ids {
            with_timeout(
                "segment.delete",
                timeout,
                self.inner.segments.delete(name, *id),
            )
            .await?;
        }

        self.inner.cursor_store.remove_stream(name).await?;
        if version != Version::NEW {
            self.inner.metadata.remove(name, version).await?;
        }
        info!(stream = name, segments = ids.len(), "stream deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::RolloverPolicy;
    use crate::storage::cursor::InMemoryCursorStore;
    use crate::storage::metadata_backend::InMemoryMetadataBackend;
    use crate::storage::segment_store::InMemorySegmentStore;
    use std::time::Duration;

    type TestManager = StreamManager<InMemorySegmentStore, InMemoryMetadataBackend>;

    struct Env {
        segments: Arc<InMemorySegmentStore>,
        backend: Arc<InMemoryMetadataBackend>,
    }

    impl Env {
        fn new() -> Self {
            Env {
                segments: Arc::new(InMemorySegmentStore::new()),
                backend: Arc::new(InMemoryMetadataBackend::new()),
            }
        }

        fn manager(&self, name: &str, config: LogConfig) -> TestManager {
            let metadata = MetadataStore::new(
                self.backend.clone(),
                config.metadata_prefix.clone(),
                Duration::from_secs(1),
            );
            StreamManager::new(
                name,
                config,
                self.segments.clone(),
                metadata,
                Arc::new(InMemoryCursorStore::new()),
            )
        }
    }

    fn entries_config(max: u64) -> LogConfig {
        LogConfig::test().with_rollover(RolloverPolicy::entries(max))
    }

    #[tokio::test]
    async fn test_operations_before_init_rejected() {
        let env = Env::new();
        let manager = env.manager("s1", entries_config(2));
        assert_eq!(manager.state(), ManagerState::Uninitialized);
        assert!(matches!(
            manager.add_entry("x").await,
            Err(LogError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_init_creates_first_segment() {
        let env = Env::new();
        let manager = env.manager("s1", entries_config(2));
        manager.init().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Ready);

        let meta = manager.metadata();
        assert_eq!(meta.segments.len(), 1);
        assert_eq!(meta.segments[0].segment_id, 0);
        assert!(!meta.segments[0].sealed);
        // Second init is a no-op
        manager.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollover_seals_and_persists() {
        let env = Env::new();
        let manager = env.manager("s1", entries_config(2));
        manager.init().await.unwrap();

        let a = manager.add_entry("A").await.unwrap();
        let b = manager.add_entry("B").await.unwrap();
        let c = manager.add_entry("C").await.unwrap();
        assert_eq!(a, Position::new(0, 0));
        assert_eq!(b, Position::new(0, 1));
        assert_eq!(c, Position::new(1, 0));

        // Persisted record has the sealed segment's final count
        let store = MetadataStore::new(env.backend.clone(), "test", Duration::from_secs(1));
        let (persisted, version) = store.get("s1").await.unwrap();
        assert_eq!(version, manager.metadata_version());
        assert_eq!(persisted.segments.len(), 2);
        assert!(persisted.segments[0].sealed);
        assert_eq!(persisted.segments[0].entry_count, 2);
        assert!(!persisted.segments[1].sealed);
    }

    #[tokio::test]
    async fn test_reopen_after_restart_resumes_active_segment() {
        let env = Env::new();
        {
            let manager = env.manager("s1", entries_config(3));
            manager.init().await.unwrap();
            for p in ["a", "b", "c", "d"] {
                manager.add_entry(p).await.unwrap();
            }
            manager.close().await.unwrap();
        }

        let manager = env.manager("s1", entries_config(3));
        manager.init().await.unwrap();
        let meta = manager.metadata();
        assert_eq!(meta.segments.len(), 2);
        assert_eq!(meta.segments[1].entry_count, 1);

        let pos = manager.add_entry("e").await.unwrap();
        assert_eq!(pos, Position::new(1, 1));
        let all = manager.read_entries(10, Position::EARLIEST).await.unwrap();
        let payloads: Vec<_> = all.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_init_completes_interrupted_rollover() {
        let env = Env::new();
        {
            let manager = env.manager("s1", entries_config(10));
            manager.init().await.unwrap();
            manager.add_entry("a").await.unwrap();
        }
        // Segment sealed in the backend, metadata never updated
        env.segments
            .seal(&SegmentHandle::new("s1", 0))
            .await
            .unwrap();

        let manager = env.manager("s1", entries_config(10));
        manager.init().await.unwrap();
        let meta = manager.metadata();
        assert_eq!(meta.segments.len(), 2);
        assert!(meta.segments[0].sealed);
        assert_eq!(meta.segments[0].entry_count, 1);
        assert_eq!(manager.add_entry("b").await.unwrap(), Position::new(1, 0));
    }

    #[tokio::test]
    async fn test_init_failure_closes_manager() {
        let env = Env::new();
        env.backend.set_available(false);
        let manager = env.manager("s1", entries_config(2));

        let err = manager.init().await.unwrap_err();
        assert!(matches!(err, LogError::InitializationFailed { .. }));
        assert!(matches!(err.root_cause(), LogError::BackendUnavailable(_)));
        assert_eq!(manager.state(), ManagerState::Closed);
        assert!(matches!(
            manager.add_entry("x").await,
            Err(LogError::ManagerClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_rollover_fails_when_metadata_unavailable() {
        let env = Env::new();
        let manager = env.manager("s1", entries_config(1));
        manager.init().await.unwrap();
        manager.add_entry("a").await.unwrap();

        env.backend.set_available(false);
        assert!(matches!(
            manager.add_entry("b").await,
            Err(LogError::BackendUnavailable(_))
        ));

        // Backend back: the orphaned segment 1 is adopted, nothing lost
        env.backend.set_available(true);
        assert_eq!(manager.add_entry("b").await.unwrap(), Position::new(1, 0));
        let all = manager.read_entries(10, Position::EARLIEST).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_unique_positions() {
        let env = Env::new();
        let manager = env.manager("s1", entries_config(5));
        manager.init().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..40 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                m.add_entry(format!("p{}", i)).await
            }));
        }
        let mut positions = Vec::new();
        for h in handles {
            positions.push(h.await.unwrap().unwrap());
        }
        positions.sort();
        positions.dedup();
        assert_eq!(positions.len(), 40);

        let meta = manager.metadata();
        assert!(meta.check_invariants().is_ok());
        assert!(meta.segments.iter().all(|s| s.entry_count <= 5));
        assert_eq!(meta.total_entries(), 40);
    }

    #[tokio::test]
    async fn test_read_refreshes_unknown_segment_once() {
        let env = Env::new();
        let manager = env.manager("s1", entries_config(2));
        manager.init().await.unwrap();
        assert_eq!(
            manager.read_entries(1, Position::new(7, 0)).await,
            Err(LogError::PositionNotFound(Position::new(7, 0)))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let env = Env::new();
        let manager = env.manager("s1", entries_config(2));
        manager.init().await.unwrap();
        manager.close().await.unwrap();
        manager.close().await.unwrap();
        assert!(matches!(
            manager.read_entries(1, Position::EARLIEST).await,
            Err(LogError::ManagerClosed(_))
        ));
        assert!(matches!(manager.init().await, Err(LogError::ManagerClosed(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let env = Env::new();
        let manager = env.manager("s1", entries_config(1));
        manager.init().await.unwrap();
        for p in ["a", "b", "c"] {
            manager.add_entry(p).await.unwrap();
        }
        assert_eq!(env.segments.segment_count(), 3);

        manager.delete().await.unwrap();
        assert_eq!(env.segments.segment_count(), 0);
        assert!(env.backend.is_empty());
        assert_eq!(manager.state(), ManagerState::Closed);
    }
}
