//! Metadata coordination backend
//!
//! A versioned key-value store with compare-and-swap writes, modeled on a
//! consistent configuration service. Every successful write mints a new
//! `Version`; writes and deletes must present the current one.
//!
//! Implementations:
//! - `InMemoryMetadataBackend`: tests and DST, with a connectivity switch
//! - `LocalFsMetadataBackend`: one file per key, temp-write + rename
//! - `SimulatedMetadataBackend` (in `simulated.rs`): fault-injecting wrapper

use super::segment_store::StoreFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque optimistic-concurrency token
///
/// Versions minted by one backend are unique, so a token from before a
/// delete never matches a record created after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// Expected version for a create: the key must not exist
    pub const NEW: Version = Version(0);
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Version::NEW {
            write!(f, "<none>")
        } else {
            write!(f, "v{}", self.0)
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    NotFound(String),
    /// `actual` is `Version::NEW` when the key does not exist
    VersionConflict {
        key: String,
        expected: Version,
        actual: Version,
    },
    /// Connectivity or session loss
    Unavailable(String),
    Io(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotFound(key) => write!(f, "Key not found: {}", key),
            BackendError::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "Version conflict on {}: expected {}, got {}",
                key, expected, actual
            ),
            BackendError::Unavailable(msg) => write!(f, "Backend unavailable: {}", msg),
            BackendError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

pub trait MetadataBackend: Send + Sync + 'static {
    fn read<'a>(&'a self, key: &'a str) -> StoreFuture<'a, BackendResult<(Vec<u8>, Version)>>;

    /// Write if the current version equals `expected` (`Version::NEW` = absent)
    fn write<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        expected: Version,
    ) -> StoreFuture<'a, BackendResult<Version>>;

    /// Delete if the current version equals `expected`
    fn delete<'a>(&'a self, key: &'a str, expected: Version) -> StoreFuture<'a, BackendResult<()>>;

    /// Keys starting with `prefix`, sorted
    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, BackendResult<Vec<String>>>;
}

fn check_version(key: &str, current: Option<Version>, expected: Version) -> BackendResult<()> {
    let actual = current.unwrap_or(Version::NEW);
    if actual == expected {
        Ok(())
    } else {
        Err(BackendError::VersionConflict {
            key: key.to_string(),
            expected,
            actual,
        })
    }
}

// ============================================================================
// InMemoryMetadataBackend - For tests and DST
// ============================================================================

/// In-memory versioned KV; clones share state
#[derive(Debug, Clone)]
pub struct InMemoryMetadataBackend {
    records: Arc<RwLock<HashMap<String, (Vec<u8>, Version)>>>,
    next_version: Arc<AtomicU64>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryMetadataBackend {
    fn default() -> Self {
        InMemoryMetadataBackend {
            records: Arc::new(RwLock::new(HashMap::new())),
            next_version: Arc::new(AtomicU64::new(1)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InMemoryMetadataBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (false) or regaining (true) the backend session
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn ensure_available(&self) -> BackendResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("session lost".to_string()))
        }
    }
}

impl MetadataBackend for InMemoryMetadataBackend {
    fn read<'a>(&'a self, key: &'a str) -> StoreFuture<'a, BackendResult<(Vec<u8>, Version)>> {
        Box::pin(async move {
            self.ensure_available()?;
            self.records
                .read()
                .get(key)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(key.to_string()))
        })
    }

    fn write<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        expected: Version,
    ) -> StoreFuture<'a, BackendResult<Version>> {
        Box::pin(async move {
            self.ensure_available()?;
            let mut records = self.records.write();
            check_version(key, records.get(key).map(|(_, v)| *v), expected)?;
            let version = Version(self.next_version.fetch_add(1, Ordering::SeqCst));
            records.insert(key.to_string(), (data.to_vec(), version));
            Ok(version)
        })
    }

    fn delete<'a>(&'a self, key: &'a str, expected: Version) -> StoreFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            self.ensure_available()?;
            let mut records = self.records.write();
            let current = match records.get(key) {
                Some((_, v)) => *v,
                None => return Err(BackendError::NotFound(key.to_string())),
            };
            check_version(key, Some(current), expected)?;
            records.remove(key);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, BackendResult<Vec<String>>> {
        Box::pin(async move {
            self.ensure_available()?;
            let mut keys: Vec<String> = self
                .records
                .read()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }
}

// ============================================================================
// LocalFsMetadataBackend - For development
// ============================================================================

const RECORD_SUFFIX: &str = ".meta";

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u64,
    data: Vec<u8>,
}

/// One bincode envelope file per key under `base_path`
///
/// Key segments separated by `/` become directories. Writes go to a temp
/// file that is renamed over the record, so a crash never leaves a partial
/// record. CAS is serialized by an in-process lock, which matches the
/// single-writer-per-stream deployment assumption.
#[derive(Debug, Clone)]
pub struct LocalFsMetadataBackend {
    base_path: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
    next_version: Arc<AtomicU64>,
}

impl LocalFsMetadataBackend {
    pub fn new(base_path: PathBuf) -> Self {
        // Seeded from the clock so versions keep increasing across restarts
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1);
        LocalFsMetadataBackend {
            base_path,
            lock: Arc::new(tokio::sync::Mutex::new(())),
            next_version: Arc::new(AtomicU64::new(seed.max(1))),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, key: &str) -> BackendResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(BackendError::Io(format!("invalid key {:?}", key)));
        }
        Ok(self.base_path.join(format!("{}{}", key, RECORD_SUFFIX)))
    }

    async fn load(&self, key: &str) -> BackendResult<Option<Envelope>> {
        let path = self.record_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| BackendError::Io(format!("corrupt record {}: {}", key, e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn mint(&self, current: Option<Version>) -> Version {
        let floor = current.map(|v| v.0 + 1).unwrap_or(1);
        let next = self.next_version.fetch_add(1, Ordering::SeqCst);
        let version = next.max(floor);
        self.next_version.fetch_max(version + 1, Ordering::SeqCst);
        Version(version)
    }
}

impl MetadataBackend for LocalFsMetadataBackend {
    fn read<'a>(&'a self, key: &'a str) -> StoreFuture<'a, BackendResult<(Vec<u8>, Version)>> {
        Box::pin(async move {
            match self.load(key).await? {
                Some(env) => Ok((env.data, Version(env.version))),
                None => Err(BackendError::NotFound(key.to_string())),
            }
        })
    }

    fn write<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        expected: Version,
    ) -> StoreFuture<'a, BackendResult<Version>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let current = self.load(key).await?.map(|env| Version(env.version));
            check_version(key, current, expected)?;

            let version = self.mint(current);
            let bytes = bincode::serialize(&Envelope {
                version: version.0,
                data: data.to_vec(),
            })
            .map_err(|e| BackendError::Io(e.to_string()))?;

            let path = self.record_path(key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let temp = path.with_extension("meta.tmp");
            tokio::fs::write(&temp, &bytes).await?;
            tokio::fs::rename(&temp, &path).await?;
            Ok(version)
        })
    }

    fn delete<'a>(&'a self, key: &'a str, expected: Version) -> StoreFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let current = match self.load(key).await? {
                Some(env) => Version(env.version),
                None => return Err(BackendError::NotFound(key.to_string())),
            };
            check_version(key, Some(current), expected)?;
            tokio::fs::remove_file(self.record_path(key)?).await?;
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, BackendResult<Vec<String>>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let mut pending = vec![self.base_path.clone()];
            while let Some(dir) = pending.pop() {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if entry.file_type().await?.is_dir() {
                        pending.push(path);
                        continue;
                    }
                    let Ok(relative) = path.strip_prefix(&self.base_path) else {
                        continue;
                    };
                    let relative = relative.to_string_lossy().replace('\\', "/");
                    if let Some(key) = relative.strip_suffix(RECORD_SUFFIX) {
                        if key.starts_with(prefix) {
                            keys.push(key.to_string());
                        }
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}
