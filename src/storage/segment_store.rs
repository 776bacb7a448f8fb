//! Segment (ledger) backend abstraction
//!
//! A segment is a durable, append-only sequence of byte records identified by
//! `(stream, segment_id)`. Once sealed it is immutable. The core depends only
//! on the operations of [`SegmentStore`] and its three failure kinds (I/O,
//! not-found, already-sealed).
//!
//! Implementations:
//! - `InMemorySegmentStore`: unit tests and DST
//! - `LocalFsSegmentStore`: one CRC-framed file per segment, for development
//! - `SimulatedSegmentStore` (in `simulated.rs`): fault-injecting wrapper

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by backend traits
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type SegmentResult<T> = Result<T, SegmentStoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentStoreError {
    /// Generic I/O failure; retryable by the caller
    Io(String),
    /// No segment with this id
    NotFound(u64),
    /// Write against a sealed segment
    AlreadySealed(u64),
    /// Create of an id that already exists
    AlreadyExists(u64),
    /// Stored frame failed its checksum
    Corruption(String),
}

impl std::fmt::Display for SegmentStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentStoreError::Io(msg) => write!(f, "I/O error: {}", msg),
            SegmentStoreError::NotFound(id) => write!(f, "Segment {} not found", id),
            SegmentStoreError::AlreadySealed(id) => write!(f, "Segment {} already sealed", id),
            SegmentStoreError::AlreadyExists(id) => write!(f, "Segment {} already exists", id),
            SegmentStoreError::Corruption(msg) => write!(f, "Corruption: {}", msg),
        }
    }
}

impl std::error::Error for SegmentStoreError {}

impl From<IoError> for SegmentStoreError {
    fn from(e: IoError) -> Self {
        SegmentStoreError::Io(e.to_string())
    }
}

/// Open handle on one segment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentHandle {
    pub stream: String,
    pub segment_id: u64,
}

impl SegmentHandle {
    pub fn new(stream: impl Into<String>, segment_id: u64) -> Self {
        SegmentHandle {
            stream: stream.into(),
            segment_id,
        }
    }
}

/// Backend's authoritative view of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentStats {
    pub entry_count: u64,
    /// Sum of payload lengths
    pub size_bytes: u64,
    pub sealed: bool,
}

/// Segment storage backend
///
/// Entry indices are assigned by the backend, atomically per segment, starting
/// at 0. Concurrent appends to one segment get distinct indices.
pub trait SegmentStore: Send + Sync + 'static {
    /// Create a new, empty, unsealed segment
    fn create_segment<'a>(
        &'a self,
        stream: &'a str,
        segment_id: u64,
    ) -> StoreFuture<'a, SegmentResult<SegmentHandle>>;

    /// Open an existing segment (sealed or not)
    fn open_segment<'a>(
        &'a self,
        stream: &'a str,
        segment_id: u64,
    ) -> StoreFuture<'a, SegmentResult<SegmentHandle>>;

    /// Append one record, returning its entry index
    fn append<'a>(
        &'a self,
        handle: &'a SegmentHandle,
        payload: &'a [u8],
    ) -> StoreFuture<'a, SegmentResult<u64>>;

    /// Read up to `max_count` records starting at `start`
    ///
    /// Returns fewer (possibly zero) records at the end of the segment.
    fn read_range<'a>(
        &'a self,
        handle: &'a SegmentHandle,
        start: u64,
        max_count: usize,
    ) -> StoreFuture<'a, SegmentResult<Vec<Bytes>>>;

    /// Make the segment immutable
    fn seal<'a>(&'a self, handle: &'a SegmentHandle) -> StoreFuture<'a, SegmentResult<()>>;

    /// Release the handle; the segment's data is unaffected
    fn close<'a>(&'a self, handle: &'a SegmentHandle) -> StoreFuture<'a, SegmentResult<()>>;

    /// Remove a segment's data; deleting a missing segment succeeds
    fn delete<'a>(&'a self, stream: &'a str, segment_id: u64) -> StoreFuture<'a, SegmentResult<()>>;

    fn segment_stats<'a>(
        &'a self,
        handle: &'a SegmentHandle,
    ) -> StoreFuture<'a, SegmentResult<SegmentStats>>;

    /// Ids of every segment stored for `stream`, ascending
    fn list_segments<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, SegmentResult<Vec<u64>>>;
}

// ============================================================================
// InMemorySegmentStore - For tests and DST
// ============================================================================

#[derive(Debug, Default)]
struct MemSegment {
    entries: Vec<Bytes>,
    size_bytes: u64,
    sealed: bool,
}

/// In-memory segment store; clones share state
#[derive(Debug, Clone, Default)]
pub struct InMemorySegmentStore {
    segments: Arc<RwLock<HashMap<(String, u64), MemSegment>>>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored segments across all streams (for testing)
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }
}

fn key_of(handle: &SegmentHandle) -> (String, u64) {
    (handle.stream.clone(), handle.segment_id)
}

impl SegmentStore for InMemorySegmentStore {
    fn create_segment<'a>(
        &'a self,
        stream: &'a str,
        segment_id: u64,
    ) -> StoreFuture<'a, SegmentResult<SegmentHandle>> {
        Box::pin(async move {
            let mut segments = self.segments.write();
            let key = (stream.to_string(), segment_id);
            if segments.contains_key(&key) {
                return Err(SegmentStoreError::AlreadyExists(segment_id));
            }
            segments.insert(key, MemSegment::default());
            Ok(SegmentHandle::new(stream, segment_id))
        })
    }

    fn open_segment<'a>(
        &'a self,
        stream: &'a str,
        segment_id: u64,
    ) -> StoreFuture<'a, SegmentResult<SegmentHandle>> {
        Box::pin(async move {
            if self
                .segments
                .read()
                .contains_key(&(stream.to_string(), segment_id))
            {
                Ok(SegmentHandle::new(stream, segment_id))
            } else {
                Err(SegmentStoreError::NotFound(segment_id))
            }
        })
    }

    fn append<'a>(
        &'a self,
        handle: &'a SegmentHandle,
        payload: &'a [u8],
    ) -> StoreFuture<'a, SegmentResult<u64>> {
        Box::pin(async move {
            let mut segments = self.segments.write();
            let seg = segments
                .get_mut(&key_of(handle))
                .ok_or(SegmentStoreError::NotFound(handle.segment_id))?;
            if seg.sealed {
                return Err(SegmentStoreError::AlreadySealed(handle.segment_id));
            }
            let index = seg.entries.len() as u64;
            seg.entries.push(Bytes::copy_from_slice(payload));
            seg.size_bytes += payload.len() as u64;
            Ok(index)
        })
    }

    fn read_range<'a>(
        &'a self,
        handle: &'a SegmentHandle,
        start: u64,
        max_count: usize,
    ) -> StoreFuture<'a, SegmentResult<Vec<Bytes>>> {
        Box::pin(async move {
            let segments = self.segments.read();
            let seg = segments
                .get(&key_of(handle))
                .ok_or(SegmentStoreError::NotFound(handle.segment_id))?;
            let start = (start as usize).min(seg.entries.len());
            let end = start.saturating_add(max_count).min(seg.entries.len());
            Ok(seg.entries[start..end].to_vec())
        })
    }

    fn seal<'a>(&'a self, handle: &'a SegmentHandle) -> StoreFuture<'a, SegmentResult<()>> {
        Box::pin(async move {
            let mut segments = self.segments.write();
            let seg = segments
                .get_mut(&key_of(handle))
                .ok_or(SegmentStoreError::NotFound(handle.segment_id))?;
            if seg.sealed {
                return Err(SegmentStoreError::AlreadySealed(handle.segment_id));
            }
            seg.sealed = true;
            Ok(())
        })
    }

    fn close<'a>(&'a self, _handle: &'a SegmentHandle) -> StoreFuture<'a, SegmentResult<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn delete<'a>(&'a self, stream: &'a str, segment_id: u64) -> StoreFuture<'a, SegmentResult<()>> {
        Box::pin(async move {
            self.segments
                .write()
                .remove(&(stream.to_string(), segment_id));
            Ok(())
        })
    }

    fn segment_stats<'a>(
        &'a self,
        handle: &'a SegmentHandle,
    ) -> StoreFuture<'a, SegmentResult<SegmentStats>> {
        Box::pin(async move {
            let segments = self.segments.read();
            let seg = segments
                .get(&key_of(handle))
                .ok_or(SegmentStoreError::NotFound(handle.segment_id))?;
            Ok(SegmentStats {
                entry_count: seg.entries.len() as u64,
                size_bytes: seg.size_bytes,
                sealed: seg.sealed,
            })
        })
    }

    fn list_segments<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, SegmentResult<Vec<u64>>> {
        Box::pin(async move {
            let mut ids: Vec<u64> = self
                .segments
                .read()
                .keys()
                .filter(|(s, _)| s == stream)
                .map(|(_, id)| *id)
                .collect();
            ids.sort_unstable();
            Ok(ids)
        })
    }
}

// ============================================================================
// LocalFsSegmentStore - For development
// ============================================================================

/// Frame header: payload length (u32 LE) then CRC32 of the payload (u32 LE)
const FRAME_HEADER_LEN: usize = 8;

/// Parsed layout of one segment file
#[derive(Debug, Clone, Default)]
struct FsSegment {
    /// Byte offset of each frame's header
    offsets: Vec<u64>,
    size_bytes: u64,
    file_len: u64,
    sealed: bool,
}

/// One file per segment under `{base}/{stream}/`
///
/// Each record is a CRC-checked frame. A sealed segment has a `.sealed`
/// marker file next to it. A torn trailing frame left by a crash is truncated
/// on open; a checksum mismatch anywhere else is reported as corruption.
#[derive(Debug, Clone)]
pub struct LocalFsSegmentStore {
    base_path: PathBuf,
    state: Arc<tokio::sync::Mutex<HashMap<(String, u64), FsSegment>>>,
}

impl LocalFsSegmentStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsSegmentStore {
            base_path,
            state: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn stream_dir(&self, stream: &str) -> SegmentResult<PathBuf> {
        if stream.is_empty()
            || stream.contains(|c| c == '/' || c == '\\')
            || stream == "."
            || stream == ".."
        {
            return Err(SegmentStoreError::Io(format!(
                "stream name {:?} is not a valid directory name",
                stream
            )));
        }
        Ok(self.base_path.join(stream))
    }

    fn data_path(&self, stream: &str, segment_id: u64) -> SegmentResult<PathBuf> {
        Ok(self.stream_dir(stream)?.join(format!("{:020}.seg", segment_id)))
    }

    fn sealed_path(&self, stream: &str, segment_id: u64) -> SegmentResult<PathBuf> {
        Ok(self.stream_dir(stream)?.join(format!("{:020}.sealed", segment_id)))
    }

    /// Scan a segment file into its frame layout, truncating a torn tail
    async fn load(&self, stream: &str, segment_id: u64) -> SegmentResult<FsSegment> {
        let path = self.data_path(stream, segment_id)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SegmentStoreError::NotFound(segment_id))
            }
            Err(e) => return Err(e.into()),
        };

        let mut seg = FsSegment::default();
        let mut offset = 0usize;
        while offset < data.len() {
            if data.len() - offset < FRAME_HEADER_LEN {
                break;
            }
            let len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            let crc = u32::from_le_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]);
            let body_start = offset + FRAME_HEADER_LEN;
            if data.len() - body_start < len {
                break;
            }
            let body = &data[body_start..body_start + len];
            if crc32fast::hash(body) != crc {
                return Err(SegmentStoreError::Corruption(format!(
                    "segment {} frame at offset {} failed checksum",
                    segment_id, offset
                )));
            }
            seg.offsets.push(offset as u64);
            seg.size_bytes += len as u64;
            offset = body_start + len;
        }

        if offset < data.len() {
            tracing::warn!(
                stream,
                segment_id,
                torn_bytes = data.len() - offset,
                "truncating torn trailing frame"
            );
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(offset as u64).await?;
            file.sync_all().await?;
        }
        seg.file_len = offset as u64;
        seg.sealed = tokio::fs::try_exists(self.sealed_path(stream, segment_id)?).await?;
        Ok(seg)
    }

    /// Cached layout, loading from disk on first use
    async fn cached<'s>(
        &self,
        state: &'s mut HashMap<(String, u64), FsSegment>,
        handle: &SegmentHandle,
    ) -> SegmentResult<&'s mut FsSegment> {
        let key = key_of(handle);
        if !state.contains_key(&key) {
            let seg = self.load(&handle.stream, handle.segment_id).await?;
            state.insert(key.clone(), seg);
        }
        state
            .get_mut(&key)
            .ok_or(SegmentStoreError::NotFound(handle.segment_id))
    }

    async fn with_segment<T>(
        &self,
        stream: &str,
        segment_id: u64,
        f: impl FnOnce(&mut FsSegment) -> T,
    ) -> SegmentResult<T> {
        let mut state = self.state.lock().await;
        let handle = SegmentHandle::new(stream, segment_id);
        Ok(f(self.cached(&mut state, &handle).await?))
    }
}

/// Truncate bytes past the last indexed frame
///
/// They come from an append that failed or was abandoned after writing; the
/// caller never got an index for them.
async fn discard_unindexed(
    file: &tokio::fs::File,
    handle: &SegmentHandle,
    indexed_len: u64,
) -> SegmentResult<()> {
    let on_disk = file.metadata().await?.len();
    if on_disk < indexed_len {
        return Err(SegmentStoreError::Corruption(format!(
            "segment {} is {} bytes, {} indexed",
            handle.segment_id, on_disk, indexed_len
        )));
    }
    if on_disk > indexed_len {
        tracing::warn!(
            stream = %handle.stream,
            segment_id = handle.segment_id,
            unindexed_bytes = on_disk - indexed_len,
            "discarding bytes of an unacknowledged append"
        );
        file.set_len(indexed_len).await?;
    }
    Ok(())
}

impl SegmentStore for LocalFsSegmentStore {
    fn create_segment<'a>(
        &'a self,
        stream: &'a str,
        segment_id: u64,
    ) -> StoreFuture<'a, SegmentResult<SegmentHandle>> {
        Box::pin(async move {
            let dir = self.stream_dir(stream)?;
            tokio::fs::create_dir_all(&dir).await?;
            let path = self.data_path(stream, segment_id)?;
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file.sync_all().await?,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(SegmentStoreError::AlreadyExists(segment_id))
                }
                Err(e) => return Err(e.into()),
            }
            self.state
                .lock()
                .await
                .insert((stream.to_string(), segment_id), FsSegment::default());
            Ok(SegmentHandle::new(stream, segment_id))
        })
    }

    fn open_segment<'a>(
        &'a self,
        stream: &'a str,
        segment_id: u64,
    ) -> StoreFuture<'a, SegmentResult<SegmentHandle>> {
        Box::pin(async move {
            self.with_segment(stream, segment_id, |_| ()).await?;
            Ok(SegmentHandle::new(stream, segment_id))
        })
    }

    fn append<'a>(
        &'a self,
        handle: &'a SegmentHandle,
        payload: &'a [u8],
    ) -> StoreFuture<'a, SegmentResult<u64>> {
        Box::pin(async move {
            use tokio::io::{AsyncSeekExt, AsyncWriteExt};

            let len = u32::try_from(payload.len()).map_err(|_| {
                SegmentStoreError::Io(format!("payload of {} bytes too large", payload.len()))
            })?;
            let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
            frame.extend_from_slice(&len.to_le_bytes());
            frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
            frame.extend_from_slice(payload);

            // Held across the write so indices match file order
            let mut state = self.state.lock().await;
            let seg = self.cached(&mut state, handle).await?;
            if seg.sealed {
                return Err(SegmentStoreError::AlreadySealed(handle.segment_id));
            }

            let path = self.data_path(&handle.stream, handle.segment_id)?;
            let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            discard_unindexed(&file, handle, seg.file_len).await?;
            file.seek(SeekFrom::Start(seg.file_len)).await?;

            let written = async {
                file.write_all(&frame).await?;
                file.sync_data().await
            }
            .await;
            if let Err(e) = written {
                // Drop the partial frame now; the next append or seal retries
                // the trim if this fails too
                if let Err(trim) = file.set_len(seg.file_len).await {
                    tracing::warn!(
                        stream = %handle.stream,
                        segment_id = handle.segment_id,
                        error = %trim,
                        "failed to trim partial frame"
                    );
                }
                return Err(e.into());
            }

            let index = seg.offsets.len() as u64;
            seg.offsets.push(seg.file_len);
            seg.file_len += frame.len() as u64;
            seg.size_bytes += payload.len() as u64;
            Ok(index)
        })
    }

    fn read_range<'a>(
        &'a self,
        handle: &'a SegmentHandle,
        start: u64,
        max_count: usize,
    ) -> StoreFuture<'a, SegmentResult<Vec<Bytes>>> {
        Box::pin(async move {
            let (offsets, file_len) = self
                .with_segment(&handle.stream, handle.segment_id, |seg| {
                    let start = (start as usize).min(seg.offsets.len());
                    let end = start.saturating_add(max_count).min(seg.offsets.len());
                    (seg.offsets[start..end].to_vec(), seg.file_len)
                })
                .await?;
            if offsets.is_empty() {
                return Ok(Vec::new());
            }

            let path = self.data_path(&handle.stream, handle.segment_id)?;
            let data = Bytes::from(tokio::fs::read(&path).await?);
            if (data.len() as u64) < file_len {
                return Err(SegmentStoreError::Corruption(format!(
                    "segment {} shorter than its indexed length",
                    handle.segment_id
                )));
            }

            let mut out = Vec::with_capacity(offsets.len());
            for offset in offsets {
                let offset = offset as usize;
                let header = &data[offset..offset + FRAME_HEADER_LEN];
                let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
                let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
                let body = data.slice(offset + FRAME_HEADER_LEN..offset + FRAME_HEADER_LEN + len);
                if crc32fast::hash(&body) != crc {
                    return Err(SegmentStoreError::Corruption(format!(
                        "segment {} frame at offset {} failed checksum",
                        handle.segment_id, offset
                    )));
                }
                out.push(body);
            }
            Ok(out)
        })
    }

    fn seal<'a>(&'a self, handle: &'a SegmentHandle) -> StoreFuture<'a, SegmentResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let seg = self.cached(&mut state, handle).await?;
            if seg.sealed {
                return Err(SegmentStoreError::AlreadySealed(handle.segment_id));
            }
            // A sealed file must hold exactly the indexed frames
            let path = self.data_path(&handle.stream, handle.segment_id)?;
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            discard_unindexed(&file, handle, seg.file_len).await?;
            file.sync_all().await?;

            let marker = self.sealed_path(&handle.stream, handle.segment_id)?;
            tokio::fs::write(&marker, b"").await?;
            seg.sealed = true;
            Ok(())
        })
    }

    fn close<'a>(&'a self, handle: &'a SegmentHandle) -> StoreFuture<'a, SegmentResult<()>> {
        Box::pin(async move {
            self.state.lock().await.remove(&key_of(handle));
            Ok(())
        })
    }

    fn delete<'a>(&'a self, stream: &'a str, segment_id: u64) -> StoreFuture<'a, SegmentResult<()>> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .remove(&(stream.to_string(), segment_id));
            for path in [
                self.data_path(stream, segment_id)?,
                self.sealed_path(stream, segment_id)?,
            ] {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
    }

    fn segment_stats<'a>(
        &'a self,
        handle: &'a SegmentHandle,
    ) -> StoreFuture<'a, SegmentResult<SegmentStats>> {
        Box::pin(async move {
            self.with_segment(&handle.stream, handle.segment_id, |seg| SegmentStats {
                entry_count: seg.offsets.len() as u64,
                size_bytes: seg.size_bytes,
                sealed: seg.sealed,
            })
            .await
        })
    }

    fn list_segments<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, SegmentResult<Vec<u64>>> {
        Box::pin(async move {
            let dir = self.stream_dir(stream)?;
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut ids = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(id) = name.strip_suffix(".seg").and_then(|s| s.parse().ok()) {
                    ids.push(id);
                }
            }
            ids.sort_unstable();
            Ok(ids)
        })
    }
}
