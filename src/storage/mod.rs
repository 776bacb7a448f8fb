//! Segmented Stream Log
//!
//! Per-stream, append-only log stored as a chain of segments in a segment
//! backend, with the chain persisted in a versioned metadata backend.
//!
//! ## Architecture
//!
//! ```text
//! add_entry ──> StreamManager ──> Ledger (active) ──> SegmentStore
//!                    │  rollover: seal, create next, CAS chain
//!                    └──> MetadataStore ──> MetadataBackend
//!
//! Cursor ──> StreamManager::read_entries ──> segments in id order
//! ```
//!
//! ## Key Features
//!
//! - **Single active segment**: at most one unsealed segment per stream
//! - **Rollover before append**: the new chain is persisted before the first
//!   append lands in the new segment
//! - **Optimistic concurrency**: metadata writes are compare-and-swap on a
//!   backend-minted version
//! - **Named cursors**: independent, at-least-once sequential readers

pub mod completion;
pub mod config;
pub mod cursor;
pub mod dst;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod metadata;
pub mod metadata_backend;
pub mod position;
pub mod registry;
pub mod segment_store;
pub mod simulated;

pub use completion::{
    completion_channel, spawn_completion, with_timeout, Callback, Completion, CompletionGuard,
    CompletionReceiver, CompletionSender,
};
pub use config::{CursorConfig, CursorStart, LogConfig, RetryConfig, RolloverPolicy};
pub use cursor::{Cursor, CursorState, CursorStore, InMemoryCursorStore, MetadataCursorStore};
pub use dst::{
    run_dst_batch, summarize_batch, OperationOutcome, StreamDSTConfig, StreamDSTHarness,
    StreamDSTResult, StreamOperation, StreamWorkload,
};
pub use error::LogError;
pub use ledger::Ledger;
pub use manager::{ManagerState, StreamManager};
pub use metadata::{MetadataStore, SegmentInfo, StreamMetadata};
pub use metadata_backend::{
    BackendError, InMemoryMetadataBackend, LocalFsMetadataBackend, MetadataBackend, Version,
};
pub use position::{Entry, Position};
pub use registry::StreamRegistry;
pub use segment_store::{
    InMemorySegmentStore, LocalFsSegmentStore, SegmentHandle, SegmentStats, SegmentStore,
    SegmentStoreError, StoreFuture,
};
pub use simulated::{
    SimulatedFaultConfig, SimulatedMetadataBackend, SimulatedSegmentStore, SimulatedStats,
};
