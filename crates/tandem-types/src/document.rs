//! The document metadata model.
//!
//! One `Document` describes one file or folder as seen by the sync engine.
//! Every mutation flows through the merge reconciler; producers build fresh
//! documents from observations and never write to the journal directly.
//!
//! Side bookkeeping: `sides` maps each side (local, remote) to a short
//! revision counter. A side whose counter equals the maximum has observed
//! the latest version of the document; a lagging counter means the opposite
//! side still has work to propagate.

use crate::path::doc_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two sides kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideName {
    /// The local filesystem.
    Local,
    /// The remote document store.
    Remote,
}

impl SideName {
    /// The opposite side.
    pub fn other(self) -> Self {
        match self {
            SideName::Local => SideName::Remote,
            SideName::Remote => SideName::Local,
        }
    }
}

impl fmt::Display for SideName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideName::Local => write!(f, "local"),
            SideName::Remote => write!(f, "remote"),
        }
    }
}

/// Per-side short revision counters.
///
/// A present entry means that side has observed some version of the
/// document; the side with the highest counter saw the latest one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<u32>,
}

impl Sides {
    pub fn get(&self, side: SideName) -> Option<u32> {
        match side {
            SideName::Local => self.local,
            SideName::Remote => self.remote,
        }
    }

    pub fn set(&mut self, side: SideName, short_rev: u32) {
        match side {
            SideName::Local => self.local = Some(short_rev),
            SideName::Remote => self.remote = Some(short_rev),
        }
    }

    pub fn clear(&mut self, side: SideName) {
        match side {
            SideName::Local => self.local = None,
            SideName::Remote => self.remote = None,
        }
    }

    /// The highest short rev on any side, or 0 when empty.
    pub fn max(&self) -> u32 {
        self.local.unwrap_or(0).max(self.remote.unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.remote.is_none()
    }

    /// Whether `side` has observed the latest version.
    pub fn is_up_to_date(&self, side: SideName) -> bool {
        let max = self.max();
        max > 0 && self.get(side) == Some(max)
    }
}

/// File-only attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttrs {
    /// Base64 MD5 digest of the file content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub executable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// What kind of filesystem object a document describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "doc_type", rename_all = "lowercase")]
pub enum DocKind {
    File(FileAttrs),
    Folder,
}

/// Descriptor of the document's twin on the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub id: String,
    pub rev: String,
}

/// Metadata for one synced file or folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Normalized form of `path`; primary key in the journal.
    pub id: String,
    /// Human-facing relative path, forward slashes.
    pub path: String,
    #[serde(flatten)]
    pub kind: DocKind,
    /// Revision token assigned by the store on each write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub sides: Sides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteRef>,
    /// Tombstone marker; the journal keeps deleted documents until both
    /// sides have observed the deletion.
    #[serde(default)]
    pub deleted: bool,
    /// On a tombstone, the id of the move destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_to: Option<String>,
    /// Logically in trash but not yet purged.
    #[serde(default)]
    pub trashed: bool,
    /// Transient retry counter for the synchronizer.
    #[serde(default)]
    pub errors: u32,
}

impl Document {
    /// Build a file document from a path and attributes.
    pub fn new_file(path: &str, attrs: FileAttrs, now: DateTime<Utc>) -> Self {
        Self {
            id: doc_id(path),
            path: path.to_string(),
            kind: DocKind::File(attrs),
            rev: None,
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            sides: Sides::default(),
            remote: None,
            deleted: false,
            move_to: None,
            trashed: false,
            errors: 0,
        }
    }

    /// Build a folder document from a path.
    pub fn new_folder(path: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: doc_id(path),
            path: path.to_string(),
            kind: DocKind::Folder,
            rev: None,
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            sides: Sides::default(),
            remote: None,
            deleted: false,
            move_to: None,
            trashed: false,
            errors: 0,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, DocKind::File(_))
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, DocKind::Folder)
    }

    pub fn file_attrs(&self) -> Option<&FileAttrs> {
        match &self.kind {
            DocKind::File(attrs) => Some(attrs),
            DocKind::Folder => None,
        }
    }

    pub fn file_attrs_mut(&mut self) -> Option<&mut FileAttrs> {
        match &mut self.kind {
            DocKind::File(attrs) => Some(attrs),
            DocKind::Folder => None,
        }
    }

    pub fn checksum(&self) -> Option<&str> {
        self.file_attrs().and_then(|a| a.checksum.as_deref())
    }

    /// Record that `side` produced this version.
    ///
    /// The counters are inherited from the journal entry being replaced
    /// (when there is one) and the producing side is advanced past every
    /// other counter.
    pub fn mark_side(&mut self, side: SideName, existing: Option<&Document>) {
        let base = existing.map(|e| e.sides).unwrap_or_default();
        let next = base.max() + 1;
        self.sides = base;
        self.sides.set(side, next);
    }

    /// Whether `side` has observed the latest version of this document.
    pub fn is_up_to_date(&self, side: SideName) -> bool {
        self.sides.is_up_to_date(side)
    }

    /// Whether both documents are files with the same content hash.
    pub fn same_binary(&self, other: &Document) -> bool {
        match (self.checksum(), other.checksum()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Carry metadata forward from the journal entry this document
    /// replaces: creation date, tags, the remote twin, and any file
    /// attributes the producer could not observe.
    pub fn carry_over_from(&mut self, existing: &Document) {
        self.created_at = existing.created_at;
        if self.tags.is_empty() {
            self.tags = existing.tags.clone();
        }
        if self.remote.is_none() {
            self.remote = existing.remote.clone();
        }
        if let (Some(attrs), Some(prev)) = (self.file_attrs_mut(), existing.file_attrs()) {
            if attrs.checksum.is_none() {
                attrs.checksum = prev.checksum.clone();
            }
            if attrs.size.is_none() {
                attrs.size = prev.size;
            }
            if attrs.mime.is_none() {
                attrs.mime = prev.mime.clone();
            }
            if attrs.class.is_none() {
                attrs.class = prev.class.clone();
            }
        }
    }

    /// Whether writing this document over `other` would change anything
    /// the synchronizer cares about. Revision, side counters, retry
    /// counter, and timestamps are excluded from the comparison.
    pub fn same_ignoring_rev(&self, other: &Document) -> bool {
        self.path == other.path
            && self.kind == other.kind
            && self.tags == other.tags
            && self.remote == other.remote
            && self.deleted == other.deleted
            && self.trashed == other.trashed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, checksum: &str) -> Document {
        Document::new_file(
            path,
            FileAttrs {
                checksum: Some(checksum.to_string()),
                size: Some(42),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_mark_side_fresh_document() {
        let mut doc = file("a.txt", "aaa");
        doc.mark_side(SideName::Local, None);
        assert_eq!(doc.sides.local, Some(1));
        assert_eq!(doc.sides.remote, None);
        assert!(doc.is_up_to_date(SideName::Local));
    }

    #[test]
    fn test_mark_side_advances_past_other_side() {
        let mut existing = file("a.txt", "aaa");
        existing.sides = Sides {
            local: Some(1),
            remote: Some(2),
        };

        let mut doc = file("a.txt", "bbb");
        doc.mark_side(SideName::Local, Some(&existing));

        assert_eq!(doc.sides.local, Some(3));
        assert_eq!(doc.sides.remote, Some(2));
        assert!(doc.is_up_to_date(SideName::Local));
        assert!(!doc.is_up_to_date(SideName::Remote));
    }

    #[test]
    fn test_same_binary() {
        let a = file("a.txt", "digest");
        let b = file("b.txt", "digest");
        let c = file("c.txt", "other");
        assert!(a.same_binary(&b));
        assert!(!a.same_binary(&c));

        let folder = Document::new_folder("d", Utc::now());
        assert!(!a.same_binary(&folder));
    }

    #[test]
    fn test_carry_over_fills_missing_fields() {
        let mut existing = file("a.txt", "digest");
        existing.tags = vec!["work".to_string()];
        existing.remote = Some(RemoteRef {
            id: "r1".to_string(),
            rev: "1-abc".to_string(),
        });
        existing.file_attrs_mut().unwrap().mime = Some("text/plain".to_string());

        let mut doc = file("a.txt", "digest");
        doc.carry_over_from(&existing);

        assert_eq!(doc.tags, vec!["work".to_string()]);
        assert_eq!(doc.remote.as_ref().unwrap().id, "r1");
        assert_eq!(
            doc.file_attrs().unwrap().mime.as_deref(),
            Some("text/plain")
        );
        assert_eq!(doc.created_at, existing.created_at);
    }

    #[test]
    fn test_same_ignoring_rev() {
        let existing = file("a.txt", "digest");
        let mut doc = existing.clone();
        doc.rev = Some("3-fff".to_string());
        doc.sides = Sides {
            local: Some(3),
            remote: Some(2),
        };
        assert!(doc.same_ignoring_rev(&existing));

        doc.trashed = true;
        assert!(!doc.same_ignoring_rev(&existing));
    }

    #[test]
    fn test_serde_round_trip_keeps_kind_tag() {
        let doc = file("a.txt", "digest");
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"doc_type\":\"file\""));

        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);

        let folder = Document::new_folder("d", Utc::now());
        let json = serde_json::to_string(&folder).unwrap();
        assert!(json.contains("\"doc_type\":\"folder\""));
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, folder);
    }
}
