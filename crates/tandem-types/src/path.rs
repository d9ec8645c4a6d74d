//! Path normalization and document id derivation.
//!
//! A document's `id` is a pure function of its `path`. This module is the
//! only place where platform filename semantics enter the engine: HFS+/APFS
//! store names in NFD, and Windows filesystems are case-insensitive but
//! case-preserving, so two paths that collide on disk must collide on `id`.

use chrono::{DateTime, Utc};
use unicode_normalization::UnicodeNormalization;

/// Maximum basename length (in characters) kept when deriving a conflict path.
pub const CONFLICT_BASENAME_MAX: usize = 180;

/// Normalize a path to forward slashes with no trailing separator.
///
/// Document paths always use forward slashes, so relative paths must be
/// normalized for consistency across platforms.
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/").trim_end_matches('/').to_string()
}

/// Derive the document id for a path.
///
/// Separators are normalized first, then the platform rule is applied.
pub fn doc_id(path: &str) -> String {
    let normalized = normalize_separators(path);
    #[cfg(target_os = "macos")]
    {
        id_unicode_nfd(&normalized)
    }
    #[cfg(windows)]
    {
        id_case_insensitive(&normalized)
    }
    #[cfg(not(any(target_os = "macos", windows)))]
    {
        normalized
    }
}

/// Id rule for filesystems that store names in NFD (HFS+, APFS).
pub fn id_unicode_nfd(path: &str) -> String {
    path.nfd().collect()
}

/// Id rule for case-insensitive, case-preserving filesystems (NTFS).
pub fn id_case_insensitive(path: &str) -> String {
    path.to_uppercase()
}

/// Parent of a normalized path, or `None` at the top level.
pub fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir)
}

/// Derive the conflict path for a document path.
///
/// The basename is truncated to [`CONFLICT_BASENAME_MAX`] characters, then
/// `-conflict-<timestamp>` is inserted before the extension. The timestamp
/// is RFC 3339 with colons replaced so the result is a valid filename on
/// every supported platform.
pub fn conflict_path(path: &str, now: DateTime<Utc>) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{}", ext)),
        _ => (name, String::new()),
    };

    let stem: String = stem.chars().take(CONFLICT_BASENAME_MAX).collect();
    let stamp = now.format("%Y-%m-%dT%H_%M_%S%.3fZ");

    match dir {
        Some(dir) => format!("{}/{}-conflict-{}{}", dir, stem, stamp, ext),
        None => format!("{}-conflict-{}{}", stem, stamp, ext),
    }
}
