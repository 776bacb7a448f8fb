//! Named read cursors
//!
//! A cursor is a single-reader, independently positioned view over one
//! stream. Reads go through the manager's segment resolution; the cursor only
//! owns its position. On success it advances past the last returned entry; on
//! failure the position is unchanged, so a retry redelivers (at-least-once).
//!
//! Whether positions survive a restart is decided by the `CursorStore`:
//! `InMemoryCursorStore` (default) forgets them, `MetadataCursorStore` keeps
//! them in the metadata backend under `{prefix}/cursors/{stream}/{cursor}`.

use super::completion::{spawn_completion, with_timeout, Completion};
use super::error::LogError;
use super::manager::StreamManager;
use super::metadata_backend::{MetadataBackend, Version};
use super::position::{Entry, Position};
use super::segment_store::{SegmentStore, StoreFuture};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub cursor_name: String,
    pub stream_name: String,
    pub position: Position,
}

/// Persistence policy for cursor positions
pub trait CursorStore: Send + Sync + 'static {
    fn load<'a>(
        &'a self,
        stream: &'a str,
        cursor: &'a str,
    ) -> StoreFuture<'a, Completion<Option<CursorState>>>;

    fn save<'a>(&'a self, state: &'a CursorState) -> StoreFuture<'a, Completion<()>>;

    /// Forget every cursor of `stream`
    fn remove_stream<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, Completion<()>>;
}

/// Process-local cursor positions
#[derive(Debug, Clone, Default)]
pub struct InMemoryCursorStore {
    states: Arc<RwLock<HashMap<(String, String), CursorState>>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for InMemoryCursorStore {
    fn load<'a>(
        &'a self,
        stream: &'a str,
        cursor: &'a str,
    ) -> StoreFuture<'a, Completion<Option<CursorState>>> {
        Box::pin(async move {
            Ok(self
                .states
                .read()
                .get(&(stream.to_string(), cursor.to_string()))
                .cloned())
        })
    }

    fn save<'a>(&'a self, state: &'a CursorState) -> StoreFuture<'a, Completion<()>> {
        Box::pin(async move {
            self.states.write().insert(
                (state.stream_name.clone(), state.cursor_name.clone()),
                state.clone(),
            );
            Ok(())
        })
    }

    fn remove_stream<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, Completion<()>> {
        Box::pin(async move {
            self.states.write().retain(|(s, _), _| s != stream);
            Ok(())
        })
    }
}

/// Cursor positions stored as JSON in the metadata backend
pub struct MetadataCursorStore<B: MetadataBackend> {
    backend: Arc<B>,
    prefix: String,
    timeout: Duration,
}

impl<B: MetadataBackend> MetadataCursorStore<B> {
    pub fn new(backend: Arc<B>, prefix: impl Into<String>, timeout: Duration) -> Self {
        MetadataCursorStore {
            backend,
            prefix: prefix.into(),
            timeout,
        }
    }

    fn stream_prefix(&self, stream: &str) -> String {
        format!("{}/cursors/{}/", self.prefix, stream)
    }

    fn key(&self, stream: &str, cursor: &str) -> String {
        format!("{}{}", self.stream_prefix(stream), cursor)
    }

    async fn current_version(&self, key: &str) -> Completion<Version> {
        match with_timeout("cursor.read", self.timeout, self.backend.read(key)).await {
            Ok((_, version)) => Ok(version),
            Err(LogError::NotFound(_)) => Ok(Version::NEW),
            Err(e) => Err(e),
        }
    }
}

/// Attempts for one cursor save; conflicts only arise from a stale handle
const CURSOR_SAVE_ATTEMPTS: u32 = 3;

impl<B: MetadataBackend> CursorStore for MetadataCursorStore<B> {
    fn load<'a>(
        &'a self,
        stream: &'a str,
        cursor: &'a str,
    ) -> StoreFuture<'a, Completion<Option<CursorState>>> {
        Box::pin(async move {
            let key = self.key(stream, cursor);
            match with_timeout("cursor.read", self.timeout, self.backend.read(&key)).await {
                Ok((bytes, _)) => Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(LogError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn save<'a>(&'a self, state: &'a CursorState) -> StoreFuture<'a, Completion<()>> {
        Box::pin(async move {
            let key = self.key(&state.stream_name, &state.cursor_name);
            let bytes = serde_json::to_vec(state)?;
            let mut attempt = 0;
            loop {
                let version = self.current_version(&key).await?;
                match with_timeout(
                    "cursor.write",
                    self.timeout,
                    self.backend.write(&key, &bytes, version),
                )
                .await
                {
                    Ok(_) => return Ok(()),
                    Err(LogError::VersionConflict { .. }) if attempt + 1 < CURSOR_SAVE_ATTEMPTS => {
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn remove_stream<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, Completion<()>> {
        Box::pin(async move {
            let prefix = self.stream_prefix(stream);
            let keys = with_timeout("cursor.list", self.timeout, self.backend.list(&prefix)).await?;
            for key in keys {
                let version = self.current_version(&key).await?;
                if version == Version::NEW {
                    continue;
                }
                match with_timeout("cursor.delete", self.timeout, self.backend.delete(&key, version))
                    .await
                {
                    Ok(()) | Err(LogError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }
}

struct CursorInner<S: SegmentStore, B: MetadataBackend> {
    name: String,
    manager: StreamManager<S, B>,
    position: Mutex<Position>,
    busy: AtomicBool,
    closed: AtomicBool,
}

/// Clears the busy flag when a read finishes or its future is dropped
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Named sequential reader; clones share position
pub struct Cursor<S: SegmentStore, B: MetadataBackend> {
    inner: Arc<CursorInner<S, B>>,
}

impl<S: SegmentStore, B: MetadataBackend> Clone for Cursor<S, B> {
    fn clone(&self) -> Self {
        Cursor {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SegmentStore, B: MetadataBackend> std::fmt::Debug for Cursor<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("name", &self.inner.name)
            .field("stream", &self.inner.manager.name())
            .field("position", &self.position())
            .finish()
    }
}

impl<S: SegmentStore, B: MetadataBackend> Cursor<S, B> {
    pub(crate) fn new(name: &str, manager: StreamManager<S, B>, position: Position) -> Self {
        Cursor {
            inner: Arc::new(CursorInner {
                name: name.to_string(),
                manager,
                position: Mutex::new(position),
                busy: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stream_name(&self) -> &str {
        self.inner.manager.name()
    }

    /// Position of the next entry this cursor will return
    pub fn position(&self) -> Position {
        *self.inner.position.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn state(&self) -> CursorState {
        CursorState {
            cursor_name: self.inner.name.clone(),
            stream_name: self.stream_name().to_string(),
            position: self.position(),
        }
    }

    fn begin(&self) -> Completion<BusyGuard<'_>> {
        if self.is_closed() {
            return Err(LogError::ManagerClosed(format!(
                "{}/{}",
                self.stream_name(),
                self.inner.name
            )));
        }
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LogError::CursorBusy(self.inner.name.clone()));
        }
        Ok(BusyGuard(&self.inner.busy))
    }

    async fn persist_if_configured(&self) {
        if !self.inner.manager.config().cursor.persist_on_advance {
            return;
        }
        let state = self.state();
        if let Err(e) = self.inner.manager.cursor_store().save(&state).await {
            tracing::warn!(
                stream = %state.stream_name,
                cursor = %state.cursor_name,
                position = %state.position,
                error = %e,
                "failed to persist cursor position"
            );
        }
    }

    /// Read up to `max_count` entries from the current position
    ///
    /// An empty batch means the tail was reached. Overlapping calls on the
    /// same cursor fail with `CursorBusy`.
    ///
    /// With `persist_on_advance` the new position is saved after each
    /// advance on a best-effort basis: a failed save is logged and the read
    /// still succeeds. Only `close` guarantees the stored position.
    pub async fn read_entries(&self, max_count: usize) -> Completion<Vec<Entry>> {
        let _busy = self.begin()?;
        let from = self.position();
        let entries = self.inner.manager.read_entries(max_count, from).await?;

        if let Some(last) = entries.last() {
            *self.inner.position.lock() = last.position.next();
            self.persist_if_configured().await;
        }
        Ok(entries)
    }

    pub fn async_read_entries<C>(&self, max_count: usize, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<Vec<Entry>>) + Send + 'static,
    {
        let this = self.clone();
        spawn_completion(
            "cursor.read_entries",
            async move { this.read_entries(max_count).await },
            callback,
        )
    }

    /// Move the cursor; the next read starts at `position`
    pub async fn seek(&self, position: Position) -> Completion<()> {
        let _busy = self.begin()?;
        *self.inner.position.lock() = position;
        self.persist_if_configured().await;
        Ok(())
    }

    /// Store the final position and reject further reads
    ///
    /// Idempotent; the position is stored whatever the persistence policy.
    /// If the save fails the cursor stays open so `close` can be retried.
    pub async fn close(&self) -> Completion<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let state = self.state();
        if let Err(e) = self.inner.manager.cursor_store().save(&state).await {
            self.inner.closed.store(false, Ordering::Release);
            return Err(e);
        }
        tracing::debug!(stream = %state.stream_name, cursor = %state.cursor_name, position = %state.position, "cursor closed");
        Ok(())
    }

    pub fn async_close<C>(&self, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<()>) + Send + 'static,
    {
        let this = self.clone();
        spawn_completion("cursor.close", async move { this.close().await }, callback)
    }
}
