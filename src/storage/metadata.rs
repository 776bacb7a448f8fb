//! Stream metadata and its versioned persistence
//!
//! One `StreamMetadata` record per stream lives in the metadata backend under
//! `{prefix}/streams/{name}`, serialized as JSON. Updates are compare-and-swap
//! on the backend `Version`; the store never retries a conflict itself.

use super::completion::{spawn_completion, with_timeout, Completion};
use super::error::LogError;
use super::metadata_backend::{MetadataBackend, Version};
use super::position::Position;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One segment in a stream's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment_id: u64,
    pub entry_count: u64,
    pub size_bytes: u64,
    pub created_at_ms: u64,
    /// false: this is (or was) the active writable segment
    pub sealed: bool,
}

impl SegmentInfo {
    pub fn new(segment_id: u64) -> Self {
        SegmentInfo {
            segment_id,
            entry_count: 0,
            size_bytes: 0,
            created_at_ms: now_ms(),
            sealed: false,
        }
    }
}

/// Ordered segment chain of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub stream_name: String,
    pub segments: Vec<SegmentInfo>,
    /// Never reused, even for segments abandoned by a failed rollover
    pub next_segment_id: u64,
}

impl StreamMetadata {
    pub fn new(stream_name: impl Into<String>) -> Self {
        StreamMetadata {
            stream_name: stream_name.into(),
            segments: Vec::new(),
            next_segment_id: 0,
        }
    }

    /// The unsealed tail segment, if any
    pub fn active_segment(&self) -> Option<&SegmentInfo> {
        self.segments.last().filter(|s| !s.sealed)
    }

    pub fn segment(&self, segment_id: u64) -> Option<&SegmentInfo> {
        self.segments
            .binary_search_by_key(&segment_id, |s| s.segment_id)
            .ok()
            .map(|i| &self.segments[i])
    }

    fn segment_mut(&mut self, segment_id: u64) -> Option<&mut SegmentInfo> {
        self.segments
            .binary_search_by_key(&segment_id, |s| s.segment_id)
            .ok()
            .map(|i| &mut self.segments[i])
    }

    /// Segments with id >= `segment_id`, in order
    pub fn segments_from(&self, segment_id: u64) -> &[SegmentInfo] {
        let start = self.segments.partition_point(|s| s.segment_id < segment_id);
        &self.segments[start..]
    }

    /// Id the next created segment will use
    pub fn peek_next_segment_id(&self) -> u64 {
        self.next_segment_id
    }

    /// Append a new unsealed segment at the tail
    pub fn push_segment(&mut self, info: SegmentInfo) {
        self.next_segment_id = self.next_segment_id.max(info.segment_id + 1);
        self.segments.push(info);

        #[cfg(debug_assertions)]
        self.verify_invariants();
    }

    /// Mark a segment sealed with its final counts; false if unknown
    pub fn seal_segment(&mut self, segment_id: u64, entry_count: u64, size_bytes: u64) -> bool {
        match self.segment_mut(segment_id) {
            Some(seg) => {
                seg.sealed = true;
                seg.entry_count = entry_count;
                seg.size_bytes = size_bytes;
                true
            }
            None => false,
        }
    }

    /// Overwrite a segment's counts with the backend's view
    pub fn set_counts(&mut self, segment_id: u64, entry_count: u64, size_bytes: u64) -> bool {
        match self.segment_mut(segment_id) {
            Some(seg) => {
                seg.entry_count = entry_count;
                seg.size_bytes = size_bytes;
                true
            }
            None => false,
        }
    }

    pub fn total_entries(&self) -> u64 {
        self.segments.iter().map(|s| s.entry_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    /// Position of the newest entry recorded in the chain
    pub fn last_position(&self) -> Option<Position> {
        self.segments
            .iter()
            .rev()
            .find(|s| s.entry_count > 0)
            .map(|s| Position::new(s.segment_id, s.entry_count - 1))
    }

    /// Structural check applied to every decoded record
    pub fn check_invariants(&self) -> Result<(), String> {
        if !self
            .segments
            .windows(2)
            .all(|w| w[0].segment_id < w[1].segment_id)
        {
            return Err(format!(
                "stream {}: segment ids not strictly increasing",
                self.stream_name
            ));
        }
        if let Some(last) = self.segments.last() {
            if self.next_segment_id <= last.segment_id {
                return Err(format!(
                    "stream {}: next_segment_id {} <= max segment id {}",
                    self.stream_name, self.next_segment_id, last.segment_id
                ));
            }
        }
        let unsealed: Vec<u64> = self
            .segments
            .iter()
            .filter(|s| !s.sealed)
            .map(|s| s.segment_id)
            .collect();
        match unsealed.as_slice() {
            [] => {}
            [id] if self.active_segment().map(|s| s.segment_id) == Some(*id) => {}
            _ => {
                return Err(format!(
                    "stream {}: unsealed segments {:?} (at most one, and only the last)",
                    self.stream_name, unsealed
                ))
            }
        }
        Ok(())
    }

    /// TigerStyle: Verify all invariants hold
    ///
    /// # Invariants
    /// - Segment ids strictly increasing
    /// - next_segment_id > every segment id
    /// - At most one unsealed segment, and it is the last
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        let result = self.check_invariants();
        debug_assert!(result.is_ok(), "Invariant violated: {:?}", result);
    }
}

/// CRUD of per-stream metadata with optimistic versioning
pub struct MetadataStore<B: MetadataBackend> {
    backend: Arc<B>,
    prefix: String,
    timeout: Duration,
}

impl<B: MetadataBackend> Clone for MetadataStore<B> {
    fn clone(&self) -> Self {
        MetadataStore {
            backend: self.backend.clone(),
            prefix: self.prefix.clone(),
            timeout: self.timeout,
        }
    }
}

impl<B: MetadataBackend> MetadataStore<B> {
    pub fn new(backend: Arc<B>, prefix: impl Into<String>, timeout: Duration) -> Self {
        MetadataStore {
            backend,
            prefix: prefix.into(),
            timeout,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn key(&self, stream_name: &str) -> String {
        format!("{}/streams/{}", self.prefix, stream_name)
    }

    fn decode(&self, stream_name: &str, bytes: &[u8]) -> Completion<StreamMetadata> {
        let meta: StreamMetadata = serde_json::from_slice(bytes)?;
        if meta.stream_name != stream_name {
            return Err(LogError::Corruption(format!(
                "record for {} names stream {}",
                stream_name, meta.stream_name
            )));
        }
        meta.check_invariants().map_err(LogError::Corruption)?;
        Ok(meta)
    }

    pub async fn get(&self, stream_name: &str) -> Completion<(StreamMetadata, Version)> {
        let key = self.key(stream_name);
        let (bytes, version) =
            with_timeout("metadata.get", self.timeout, self.backend.read(&key)).await?;
        Ok((self.decode(stream_name, &bytes)?, version))
    }

    /// Read the record, creating an empty one if absent
    pub async fn get_or_create(&self, stream_name: &str) -> Completion<(StreamMetadata, Version)> {
        match self.get(stream_name).await {
            Err(LogError::NotFound(_)) => {}
            other => return other,
        }

        let meta = StreamMetadata::new(stream_name);
        match self.update(stream_name, &meta, Version::NEW).await {
            Ok(version) => {
                tracing::info!(stream = stream_name, %version, "created stream metadata");
                Ok((meta, version))
            }
            // Created concurrently; take theirs
            Err(LogError::VersionConflict { .. }) => self.get(stream_name).await,
            Err(e) => Err(e),
        }
    }

    /// CAS write; `Version::NEW` creates
    pub async fn update(
        &self,
        stream_name: &str,
        meta: &StreamMetadata,
        expected: Version,
    ) -> Completion<Version> {
        debug_assert_eq!(meta.stream_name, stream_name);
        let key = self.key(stream_name);
        let bytes = serde_json::to_vec(meta)?;
        let version = with_timeout(
            "metadata.update",
            self.timeout,
            self.backend.write(&key, &bytes, expected),
        )
        .await?;
        tracing::debug!(stream = stream_name, %expected, %version, "metadata updated");
        Ok(version)
    }

    pub async fn remove(&self, stream_name: &str, expected: Version) -> Completion<()> {
        let key = self.key(stream_name);
        with_timeout(
            "metadata.remove",
            self.timeout,
            self.backend.delete(&key, expected),
        )
        .await
    }

    /// Names of every stream with a stored record
    pub async fn list_streams(&self) -> Completion<Vec<String>> {
        let prefix = format!("{}/streams/", self.prefix);
        let keys = with_timeout("metadata.list", self.timeout, self.backend.list(&prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub fn async_get<C>(&self, stream_name: &str, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<(StreamMetadata, Version)>) + Send + 'static,
    {
        let store = self.clone();
        let name = stream_name.to_string();
        spawn_completion("metadata.get", async move { store.get(&name).await }, callback)
    }

    pub fn async_update<C>(
        &self,
        stream_name: &str,
        meta: StreamMetadata,
        expected: Version,
        callback: C,
    ) -> JoinHandle<()>
    where
        C: FnOnce(Completion<Version>) + Send + 'static,
    {
        let store = self.clone();
        let name = stream_name.to_string();
        spawn_completion(
            "metadata.update",
            async move { store.update(&name, &meta, expected).await },
            callback,
        )
    }

    pub fn async_remove<C>(&self, stream_name: &str, expected: Version, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(Completion<()>) + Send + 'static,
    {
        let store = self.clone();
        let name = stream_name.to_string();
        spawn_completion(
            "metadata.remove",
            async move { store.remove(&name, expected).await },
            callback,
        )
    }

    /// Synchronous `get` for bootstrap code running outside any runtime
    pub fn get_blocking(&self, stream_name: &str) -> Completion<(StreamMetadata, Version)> {
        block_on_fresh_runtime(self.get(stream_name))
    }

    /// Synchronous `update` for bootstrap code running outside any runtime
    pub fn update_blocking(
        &self,
        stream_name: &str,
        meta: &StreamMetadata,
        expected: Version,
    ) -> Completion<Version> {
        block_on_fresh_runtime(self.update(stream_name, meta, expected))
    }
}

/// Drive `fut` on a throwaway current-thread runtime
///
/// Refuses to run inside a runtime, where blocking would stall its workers.
fn block_on_fresh_runtime<T>(fut: impl std::future::Future<Output = Completion<T>>) -> Completion<T> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(LogError::Unsupported(
            "blocking metadata call from inside an async runtime",
        ));
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| LogError::BackendUnavailable(format!("runtime: {}", e)))?;
    runtime.block_on(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::completion::completion_channel;
    use crate::storage::metadata_backend::InMemoryMetadataBackend;

    fn store() -> MetadataStore<InMemoryMetadataBackend> {
        MetadataStore::new(
            Arc::new(InMemoryMetadataBackend::new()),
            "test",
            Duration::from_secs(1),
        )
    }

    fn sample(name: &str) -> StreamMetadata {
        let mut meta = StreamMetadata::new(name);
        meta.push_segment(SegmentInfo::new(0));
        meta
    }

    #[test]
    fn test_chain_helpers() {
        let mut meta = StreamMetadata::new("s1");
        assert!(meta.active_segment().is_none());
        assert_eq!(meta.last_position(), None);

        meta.push_segment(SegmentInfo::new(0));
        meta.set_counts(0, 2, 10);
        assert!(meta.seal_segment(0, 2, 10));
        meta.push_segment(SegmentInfo::new(1));
        meta.set_counts(1, 1, 5);

        assert_eq!(meta.active_segment().map(|s| s.segment_id), Some(1));
        assert_eq!(meta.total_entries(), 3);
        assert_eq!(meta.last_position(), Some(Position::new(1, 0)));
        assert_eq!(meta.peek_next_segment_id(), 2);
        assert_eq!(meta.segments_from(1).len(), 1);
        assert!(meta.segment(7).is_none());
        assert!(meta.check_invariants().is_ok());
    }

    #[test]
    fn test_check_invariants_rejects_two_unsealed() {
        let meta = StreamMetadata {
            stream_name: "s1".into(),
            segments: vec![SegmentInfo::new(0), SegmentInfo::new(1)],
            next_segment_id: 2,
        };
        assert!(meta.check_invariants().is_err());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        assert!(matches!(store().get("nope").await, Err(LogError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let store = store();
        let (meta, v0) = store.get_or_create("s1").await.unwrap();
        assert!(meta.segments.is_empty());

        let v1 = store.update("s1", &sample("s1"), v0).await.unwrap();
        let (read, version) = store.get("s1").await.unwrap();
        assert_eq!(read, sample("s1"));
        assert_eq!(version, v1);

        // get_or_create on an existing record returns it
        let (again, v_again) = store.get_or_create("s1").await.unwrap();
        assert_eq!(again, read);
        assert_eq!(v_again, v1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_same_stale_version() {
        let store = store();
        let (_, v0) = store.get_or_create("s1").await.unwrap();

        let a = sample("s1");
        let mut b = sample("s1");
        b.seal_segment(0, 0, 0);
        b.push_segment(SegmentInfo::new(5));

        let (ra, rb) = tokio::join!(store.update("s1", &a, v0), store.update("s1", &b, v0));
        let successes = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let failure = if ra.is_err() { ra } else { rb };
        assert!(matches!(failure, Err(LogError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn test_remove() {
        let store = store();
        assert!(matches!(
            store.remove("s1", Version(1)).await,
            Err(LogError::NotFound(_))
        ));
        let (_, v) = store.get_or_create("s1").await.unwrap();
        store.remove("s1", v).await.unwrap();
        assert!(matches!(store.get("s1").await, Err(LogError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_backend_unavailable() {
        let backend = Arc::new(InMemoryMetadataBackend::new());
        let store = MetadataStore::new(backend.clone(), "test", Duration::from_secs(1));
        backend.set_available(false);
        assert!(matches!(
            store.get_or_create("s1").await,
            Err(LogError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_callback_forms() {
        let store = store();
        let (_, v0) = store.get_or_create("s1").await.unwrap();

        let (tx, rx) = completion_channel("update");
        store.async_update("s1", sample("s1"), v0, tx.into_callback());
        let v1 = rx.wait().await.unwrap();

        let (tx, rx) = completion_channel("get");
        store.async_get("s1", tx.into_callback());
        assert_eq!(rx.wait().await.unwrap().1, v1);

        let (tx, rx) = completion_channel("remove");
        store.async_remove("s1", v0, tx.into_callback());
        assert!(matches!(rx.wait().await, Err(LogError::VersionConflict { .. })));

        assert_eq!(store.list_streams().await.unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_blocking_wrappers_outside_runtime() {
        let store = store();
        let meta = StreamMetadata::new("boot");
        let version = store.update_blocking("boot", &meta, Version::NEW).unwrap();
        let (read, read_version) = store.get_blocking("boot").unwrap();
        assert_eq!(read, meta);
        assert_eq!(read_version, version);
    }

    #[tokio::test]
    async fn test_blocking_wrapper_refused_inside_runtime() {
        assert!(matches!(
            store().get_blocking("s1"),
            Err(LogError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_rejected() {
        let backend = Arc::new(InMemoryMetadataBackend::new());
        let store = MetadataStore::new(backend.clone(), "test", Duration::from_secs(1));
        backend
            .write("test/streams/s1", b"not json", Version::NEW)
            .await
            .unwrap();
        assert!(matches!(store.get("s1").await, Err(LogError::Serialization(_))));
    }
}
