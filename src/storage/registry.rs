//! Stream registry
//!
//! One `StreamManager` per stream name per process. `open` is serialized so a
//! name is never initialized twice concurrently; lookups after that only take
//! the map's read lock.

use super::completion::{spawn_completion, Completion};
use super::config::LogConfig;
use super::cursor::{CursorStore, InMemoryCursorStore, MetadataCursorStore};
use super::error::LogError;
use super::manager::{validate_stream_name, ManagerState, StreamManager};
use super::metadata::MetadataStore;
use super::metadata_backend::MetadataBackend;
use super::segment_store::SegmentStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct StreamRegistry<S: SegmentStore, B: MetadataBackend> {
    config: LogConfig,
    segments: Arc<S>,
    metadata: MetadataStore<B>,
    cursor_store: Arc<dyn CursorStore>,
    streams: Arc<RwLock<HashMap<String, StreamManager<S, B>>>>,
    open_lock: Arc<tokio::sync::Mutex<()>>,
    closed: Arc<AtomicBool>,
}

impl<S: SegmentStore, B: MetadataBackend> Clone for StreamRegistry<S, B> {
    fn clone(&self) -> Self {
        StreamRegistry {
            config: self.config.clone(),
            segments: self.segments.clone(),
            metadata: self.metadata.clone(),
            cursor_store: self.cursor_store.clone(),
            streams: self.streams.clone(),
            open_lock: self.open_lock.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<S: SegmentStore, B: MetadataBackend> StreamRegistry<S, B> {
    /// Registry with process-local cursor positions
    pub fn new(config: LogConfig, segments: Arc<S>, backend: Arc<B>) -> Self {
        let metadata = MetadataStore::new(
            backend,
            config.metadata_prefix.clone(),
            config.operation_timeout,
        );
        StreamRegistry {
            config,
            segments,
            metadata,
            cursor_store: Arc::new(InMemoryCursorStore::new()),
            streams: Arc::new(RwLock::new(HashMap::new())),
            open_lock: Arc::new(tokio::sync::Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the cursor store used by streams opened from now on
    pub fn with_cursor_store(mut self, cursor_store: Arc<dyn CursorStore>) -> Self {
        self.cursor_store = cursor_store;
        self
    }

    /// Keep cursor positions in the metadata backend
    pub fn with_durable_cursors(self) -> Self {
        let store = MetadataCursorStore::new(
            self.metadata.backend().clone(),
            self.config.metadata_prefix.clone(),
            self.config.operation_timeout,
        );
        self.with_cursor_store(Arc::new(store))
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn metadata_store(&self) -> &MetadataStore<B> {
        &self.metadata
    }

    fn new_manager(&self, name: &str) -> StreamManager<S, B> {
        StreamManager::new(
            name,
            self.config.clone(),
            self.segments.clone(),
            self.metadata.clone(),
            self.cursor_store.clone(),
        )
    }

    /// Initialized manager for `name`, creating the stream if needed
    ///
    /// A manager that closed since it was handed out is replaced.
    pub async fn open(&self, name: &str) -> Completion<StreamManager<S, B>> {
        validate_stream_name(name)?;
        let _guard = self.open_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::ManagerClosed("registry".to_string()));
        }
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let manager = self.new_manager(name);
        manager.init().await?;
        self.streams.write().insert(name.to_string(), manager.clone());
        Ok(manager)
    }

    pub fn async_open<C>(&self, name: &str, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<StreamManager<S, B>>) + Send + 'static,
    {
        let this = self.clone();
        let name = name.to_string();
        spawn_completion("registry.open", async move { this.open(&name).await }, callback)
    }

    /// Open manager for `name`, if any
    pub fn get(&self, name: &str) -> Option<StreamManager<S, B>> {
        self.streams
            .read()
            .get(name)
            .filter(|m| m.state() == ManagerState::Ready)
            .cloned()
    }

    /// Names of streams open in this registry, sorted
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .read()
            .iter()
            .filter(|(_, m)| m.state() == ManagerState::Ready)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of every stream with stored metadata, open or not
    pub async fn persisted_streams(&self) -> Completion<Vec<String>> {
        self.metadata.list_streams().await
    }

    /// Close and forget `name`; `false` if it was not open
    pub async fn close_stream(&self, name: &str) -> Completion<bool> {
        let removed = self.streams.write().remove(name);
        match removed {
            Some(manager) => {
                manager.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete `name` and all its data, whether or not it is open here
    pub async fn delete_stream(&self, name: &str) -> Completion<()> {
        validate_stream_name(name)?;
        let _guard = self.open_lock.lock().await;
        let manager = self
            .streams
            .write()
            .remove(name)
            .unwrap_or_else(|| self.new_manager(name));
        manager.delete().await
    }

    /// Close every open stream and refuse further opens
    ///
    /// All streams are closed even if some fail; the first error is returned.
    pub async fn close_all(&self) -> Completion<()> {
        self.closed.store(true, Ordering::Release);
        let _guard = self.open_lock.lock().await;
        let managers: Vec<_> = self.streams.write().drain().collect();

        let mut first_error = None;
        for (name, manager) in managers {
            if let Err(e) = manager.close().await {
                warn!(stream = %name, error = %e, "failed to close stream");
                first_error.get_or_insert(e);
            }
        }
        info!("stream registry closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::RolloverPolicy;
    use crate::storage::metadata_backend::InMemoryMetadataBackend;
    use crate::storage::position::Position;
    use crate::storage::segment_store::InMemorySegmentStore;

    type TestRegistry = StreamRegistry<InMemorySegmentStore, InMemoryMetadataBackend>;

    fn registry() -> (TestRegistry, Arc<InMemorySegmentStore>, Arc<InMemoryMetadataBackend>) {
        let segments = Arc::new(InMemorySegmentStore::new());
        let backend = Arc::new(InMemoryMetadataBackend::new());
        let config = LogConfig::test().with_rollover(RolloverPolicy::entries(2));
        (
            StreamRegistry::new(config, segments.clone(), backend.clone()),
            segments,
            backend,
        )
    }

    #[tokio::test]
    async fn test_open_returns_shared_manager() {
        let (registry, _, _) = registry();
        let a = registry.open("orders").await.unwrap();
        let b = registry.open("orders").await.unwrap();
        a.add_entry("x").await.unwrap();
        assert_eq!(b.entry_count(), 1);
        assert_eq!(registry.stream_names(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_manager_is_replaced_on_open() {
        let (registry, _, _) = registry();
        let first = registry.open("orders").await.unwrap();
        first.add_entry("x").await.unwrap();
        first.close().await.unwrap();
        assert!(registry.get("orders").is_none());

        let second = registry.open("orders").await.unwrap();
        assert_eq!(second.add_entry("y").await.unwrap(), Position::new(0, 1));
    }

    #[tokio::test]
    async fn test_close_all_refuses_new_opens() {
        let (registry, _, _) = registry();
        let m = registry.open("a").await.unwrap();
        registry.open("b").await.unwrap();

        registry.close_all().await.unwrap();
        assert_eq!(m.state(), ManagerState::Closed);
        assert!(registry.stream_names().is_empty());
        assert!(matches!(
            registry.open("c").await,
            Err(LogError::ManagerClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_stream_not_open_here() {
        let (registry, segments, backend) = registry();
        {
            let m = registry.open("a").await.unwrap();
            for p in ["1", "2", "3"] {
                m.add_entry(p).await.unwrap();
            }
        }
        registry.close_stream("a").await.unwrap();
        assert_eq!(registry.persisted_streams().await.unwrap(), vec!["a".to_string()]);

        registry.delete_stream("a").await.unwrap();
        assert_eq!(segments.segment_count(), 0);
        assert!(backend.is_empty());
        assert!(registry.persisted_streams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_durable_cursors_survive_reopen() {
        let (registry, segments, backend) = registry();
        let registry = registry.with_durable_cursors();
        let m = registry.open("a").await.unwrap();
        for p in ["1", "2", "3"] {
            m.add_entry(p).await.unwrap();
        }
        let cursor = m.open_cursor("c").await.unwrap();
        assert_eq!(cursor.read_entries(2).await.unwrap().len(), 2);
        cursor.close().await.unwrap();
        registry.close_all().await.unwrap();

        let config = LogConfig::test().with_rollover(RolloverPolicy::entries(2));
        let registry = StreamRegistry::new(config, segments, backend).with_durable_cursors();
        let m = registry.open("a").await.unwrap();
        let cursor = m.open_cursor("c").await.unwrap();
        assert_eq!(cursor.position(), Position::new(0, 2));
        let rest = cursor.read_entries(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, "3");
    }

    #[tokio::test]
    async fn test_callback_open_and_cursor() {
        use crate::storage::completion::completion_channel;

        let (registry, _, _) = registry();
        let (tx, rx) = completion_channel("registry.open");
        registry.async_open("a", tx.into_callback());
        let m = rx.wait().await.unwrap();
        m.add_entry("1").await.unwrap();

        let (tx, rx) = completion_channel("manager.open_cursor");
        m.async_open_cursor("c", tx.into_callback());
        let cursor = rx.wait().await.unwrap();
        assert_eq!(cursor.read_entries(5).await.unwrap()[0].payload, "1");
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (registry, _, _) = registry();
        assert!(matches!(registry.open("").await, Err(LogError::InvalidConfig(_))));
        assert!(matches!(registry.open("a/b").await, Err(LogError::InvalidConfig(_))));
        assert!(matches!(
            registry.delete_stream("a/b").await,
            Err(LogError::InvalidConfig(_))
        ));
        assert!(registry.stream_names().is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_cursors_of_other_streams() {
        let (registry, _, _) = registry();
        let registry = registry.with_durable_cursors();
        for name in ["a", "ab"] {
            let m = registry.open(name).await.unwrap();
            m.add_entry("1").await.unwrap();
            let cursor = m.open_cursor("c").await.unwrap();
            cursor.read_entries(1).await.unwrap();
            cursor.close().await.unwrap();
        }

        registry.delete_stream("a").await.unwrap();
        let m = registry.get("ab").unwrap();
        let cursor = m.open_cursor("c").await.unwrap();
        assert_eq!(cursor.position(), Position::new(0, 1));
    }
}
