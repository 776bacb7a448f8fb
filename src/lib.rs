pub mod io;
pub mod buggify;
pub mod observability;
pub mod storage;

#[cfg(test)]
mod stateright;

pub use storage::{
    Cursor, Entry, LogConfig, LogError, ManagerState, MetadataStore, Position, RolloverPolicy,
    StreamManager, StreamMetadata, StreamRegistry,
};
