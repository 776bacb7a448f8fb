//! Named fault sites
//!
//! Ids are `"{backend}.{fault}"` strings so stats summaries group by backend.

/// Segment (ledger) backend faults
pub mod segment {
    pub const CREATE_FAIL: &str = "segment.create_fail";
    pub const OPEN_FAIL: &str = "segment.open_fail";
    pub const APPEND_FAIL: &str = "segment.append_fail";
    pub const READ_FAIL: &str = "segment.read_fail";
    pub const SEAL_FAIL: &str = "segment.seal_fail";
    /// Call hangs past the caller's operation timeout
    pub const HANG: &str = "segment.hang";
}

/// Metadata coordination backend faults
pub mod metadata {
    pub const READ_FAIL: &str = "metadata.read_fail";
    pub const WRITE_FAIL: &str = "metadata.write_fail";
    pub const DELETE_FAIL: &str = "metadata.delete_fail";
    /// Connectivity/session loss: every call in the window fails
    pub const SESSION_LOSS: &str = "metadata.session_loss";
    pub const HANG: &str = "metadata.hang";
}

pub const ALL_FAULTS: &[&str] = &[
    segment::CREATE_FAIL,
    segment::OPEN_FAIL,
    segment::APPEND_FAIL,
    segment::READ_FAIL,
    segment::SEAL_FAIL,
    segment::HANG,
    metadata::READ_FAIL,
    metadata::WRITE_FAIL,
    metadata::DELETE_FAIL,
    metadata::SESSION_LOSS,
    metadata::HANG,
];
