//! Shared types for the tandem sync engine.
//!
//! This crate holds the document metadata model, path/id normalization,
//! conflict path derivation, and the unified error types shared between
//! the engine and its producers.

pub mod document;
pub mod error;
pub mod path;

pub use document::{DocKind, Document, FileAttrs, RemoteRef, SideName, Sides};
pub use error::{ChecksumError, MergeError, StoreError, WatcherError};
pub use path::{conflict_path, doc_id, normalize_separators, parent, CONFLICT_BASENAME_MAX};
