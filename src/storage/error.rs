//! Error taxonomy for the stream log
//!
//! Every failure outcome of the core is a `LogError`. Backend-specific errors
//! (`SegmentStoreError`, `BackendError`) are converted at the boundary.

use super::metadata_backend::{BackendError, Version};
use super::position::Position;
use super::segment_store::SegmentStoreError;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum LogError {
    /// Lost a CAS race on a metadata record; re-read and retry
    VersionConflict {
        key: String,
        expected: Version,
        actual: Version,
    },
    /// Metadata or segment reference does not exist
    NotFound(String),
    /// Transient I/O or connectivity failure
    BackendUnavailable(String),
    /// Bounded completion window exceeded
    OperationTimeout {
        operation: &'static str,
        timeout: Duration,
    },
    /// Append targeted a segment that was sealed by a rollover
    SegmentSealed { segment_id: u64 },
    /// Read position references an unknown or deleted segment
    PositionNotFound(Position),
    /// Stream could not reach `Ready`
    InitializationFailed {
        stream: String,
        source: Box<LogError>,
    },
    /// Operation issued after shutdown
    ManagerClosed(String),
    /// Overlapping read on one cursor
    CursorBusy(String),
    /// Stored bytes failed validation
    Corruption(String),
    /// Metadata record could not be encoded or decoded
    Serialization(String),
    InvalidConfig(String),
    /// Operation not valid in the calling context
    Unsupported(&'static str),
}

impl LogError {
    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LogError::BackendUnavailable(_)
                | LogError::OperationTimeout { .. }
                | LogError::VersionConflict { .. }
                | LogError::SegmentSealed { .. }
        )
    }

    /// Innermost cause, unwrapping `InitializationFailed`
    pub fn root_cause(&self) -> &LogError {
        match self {
            LogError::InitializationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "Version conflict on {}: expected {}, got {}",
                key, expected, actual
            ),
            LogError::NotFound(what) => write!(f, "Not found: {}", what),
            LogError::BackendUnavailable(msg) => write!(f, "Backend unavailable: {}", msg),
            LogError::OperationTimeout { operation, timeout } => {
                write!(f, "Operation {} timed out after {:?}", operation, timeout)
            }
            LogError::SegmentSealed { segment_id } => {
                write!(f, "Segment {} is sealed", segment_id)
            }
            LogError::PositionNotFound(pos) => write!(f, "Position not found: {}", pos),
            LogError::InitializationFailed { stream, source } => {
                write!(f, "Stream {} failed to initialize: {}", stream, source)
            }
            LogError::ManagerClosed(name) => write!(f, "Stream {} is closed", name),
            LogError::CursorBusy(name) => write!(f, "Cursor {} has a read in flight", name),
            LogError::Corruption(msg) => write!(f, "Corruption: {}", msg),
            LogError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            LogError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            LogError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::InitializationFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        LogError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for LogError {
    fn from(e: toml::de::Error) -> Self {
        LogError::InvalidConfig(e.to_string())
    }
}

impl From<SegmentStoreError> for LogError {
    fn from(e: SegmentStoreError) -> Self {
        match e {
            SegmentStoreError::Io(msg) => LogError::BackendUnavailable(msg),
            SegmentStoreError::NotFound(id) => LogError::NotFound(format!("segment {}", id)),
            SegmentStoreError::AlreadySealed(id) => LogError::SegmentSealed { segment_id: id },
            SegmentStoreError::AlreadyExists(id) => {
                LogError::Corruption(format!("segment {} already exists", id))
            }
            SegmentStoreError::Corruption(msg) => LogError::Corruption(msg),
        }
    }
}

impl From<BackendError> for LogError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(key) => LogError::NotFound(key),
            BackendError::VersionConflict {
                key,
                expected,
                actual,
            } => LogError::VersionConflict {
                key,
                expected,
                actual,
            },
            BackendError::Unavailable(msg) | BackendError::Io(msg) => {
                LogError::BackendUnavailable(msg)
            }
        }
    }
}
