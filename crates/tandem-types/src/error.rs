//! Unified error types for the sync engine.
//!
//! Absence is not an error: store reads return `Ok(None)` for missing
//! documents, and the merge reconciler resolves structural conflicts by
//! renaming instead of failing. The variants here cover what actually
//! propagates to callers.

use thiserror::Error;

/// Errors from the metadata journal.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A write carried a stale revision token.
    #[error("revision conflict on {id}: expected {expected:?}, found {found:?}")]
    RevConflict {
        id: String,
        expected: Option<String>,
        found: Option<String>,
    },

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),

    /// A persisted record failed to deserialize.
    #[error("corrupt document record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors from the merge reconciler.
#[derive(Error, Debug)]
pub enum MergeError {
    /// A file update landed on a folder; the operation is logged and
    /// skipped, there is no rename that fixes it.
    #[error("cannot resolve file/folder mismatch at {path}")]
    CannotResolve { path: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the checksum queue.
#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker stopped before the job completed.
    #[error("checksum worker stopped before completing")]
    Canceled,
}

/// Errors from the local watcher. Non-fatal backend errors are logged
/// and swallowed at the watcher boundary; only watch exhaustion
/// propagates.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Kernel watch exhaustion (ENOSPC-class); the watcher must shut down.
    #[error("watcher resources exhausted: {0}")]
    Fatal(String),
}
