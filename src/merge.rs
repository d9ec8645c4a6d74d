//! The merge reconciler.
//!
//! Every semantic operation from either side lands here. The reconciler
//! reads the current journal entry, decides what the operation means
//! against it (plain write, metadata merge, move, deletion, or conflict),
//! and commits the outcome. It is the only writer of the metadata journal.
//!
//! Conflicts are never surfaced as errors. When two different documents
//! contend for one id, the loser is renamed with a `-conflict-` suffix:
//! either the incoming document before it is written, or the existing
//! journal entry via an atomic in-journal move attributed to the side
//! that already has it.

use crate::prep::Operation;
use crate::store::MetadataStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tandem_types::{
    conflict_path, doc_id, parent, DocKind, Document, MergeError, SideName,
};
use tracing::{debug, info};

/// The reconciler; owns all writes to the metadata journal.
pub struct Merge {
    store: Arc<MetadataStore>,
}

impl Merge {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    /// Apply one queued operation.
    pub async fn apply(&self, op: Operation) -> Result<(), MergeError> {
        match op {
            Operation::AddFile { side, doc } => self.add_file(side, doc).await,
            Operation::UpdateFile { side, doc } => self.update_file(side, doc).await,
            Operation::PutFolder { side, doc } => self.put_folder(side, doc).await,
            Operation::MoveFile { side, doc, was } => self.move_file(side, doc, was).await,
            Operation::MoveFolder { side, doc, was } => self.move_folder(side, doc, was).await,
            Operation::DeleteFile { side, doc } => self.delete_file(side, doc).await,
            Operation::DeleteFolder { side, doc } => self.delete_folder(side, doc).await,
            Operation::DeleteDoc { side, doc } => self.delete_doc(side, doc).await,
            Operation::TrashFile { side, was, doc } => self.trash_file(side, was, doc).await,
            Operation::TrashFolder { side, was, doc } => self.trash_folder(side, was, doc).await,
            Operation::RestoreFile { side, was, doc } => self.restore_file(side, was, doc).await,
            Operation::RestoreFolder { side, was, doc } => {
                self.restore_folder(side, was, doc).await
            }
        }
    }

    /// A file appeared on `side`.
    pub async fn add_file(&self, side: SideName, mut doc: Document) -> Result<(), MergeError> {
        let existing = self.store.get(&doc.id).await?;
        doc.mark_side(side, existing.as_ref());

        let entry = match existing {
            None => return self.create(side, doc, None).await,
            Some(entry) if entry.deleted => return self.create(side, doc, Some(entry)).await,
            Some(entry) => entry,
        };

        match entry.kind {
            DocKind::Folder => {
                // A folder holds this id; the new file moves aside
                self.rename_incoming(&mut doc);
                self.create(side, doc, None).await
            }
            DocKind::File(_) if doc.same_binary(&entry) => {
                doc.carry_over_from(&entry);
                if doc.same_ignoring_rev(&entry) {
                    debug!("Already up to date: {}", doc.path);
                    return Ok(());
                }
                doc.rev = entry.rev.clone();
                self.store.put(doc).await?;
                Ok(())
            }
            DocKind::File(_) => {
                if side == SideName::Local && entry.sides.local.is_some() {
                    // Local already knew this path: the engine was likely
                    // stopped across an update, not a genuine collision
                    self.resolve_initial_add(doc, entry).await
                } else {
                    self.rename_incoming(&mut doc);
                    self.create(side, doc, None).await
                }
            }
        }
    }

    /// An initial-scan add landed on a path local had already observed.
    /// Work out which side actually changed while the engine was stopped.
    async fn resolve_initial_add(
        &self,
        mut doc: Document,
        existing: Document,
    ) -> Result<(), MergeError> {
        if existing.sides.remote.is_none() {
            // Never reached the remote: a plain local update
            return self.update_marked(SideName::Local, doc, Some(existing)).await;
        }
        if existing.sides.local == existing.sides.remote {
            // Both sides agreed on the last version: a plain local update
            return self.update_marked(SideName::Local, doc, Some(existing)).await;
        }

        let observed = match existing.sides.local {
            Some(short_rev) => self.store.previous_rev(&existing.id, short_rev).await?,
            None => None,
        };
        if let Some(prev) = observed {
            if prev.checksum() == doc.checksum() {
                // Disk still holds what local last saw; only the remote moved
                debug!("No local change for {}", doc.path);
                return Ok(());
            }
        }

        // Both sides diverged while stopped: the unsynced remote version
        // moves aside, the disk content wins the id
        self.relocate_existing(SideName::Remote, existing).await?;
        let tombstone = self.store.get(&doc.id).await?;
        doc.rev = tombstone.and_then(|t| t.rev);
        self.store.put(doc).await?;
        Ok(())
    }

    /// A file changed on `side`.
    pub async fn update_file(&self, side: SideName, mut doc: Document) -> Result<(), MergeError> {
        let existing = self.store.get(&doc.id).await?;
        doc.mark_side(side, existing.as_ref());
        self.update_marked(side, doc, existing).await
    }

    /// Update body, once `doc.sides` has been stamped.
    async fn update_marked(
        &self,
        side: SideName,
        mut doc: Document,
        existing: Option<Document>,
    ) -> Result<(), MergeError> {
        let entry = match existing {
            None => return self.create(side, doc, None).await,
            Some(entry) if entry.deleted => return self.create(side, doc, Some(entry)).await,
            Some(entry) if entry.is_folder() => {
                return Err(MergeError::CannotResolve { path: doc.path })
            }
            Some(entry) => entry,
        };

        if doc.same_binary(&entry) {
            doc.carry_over_from(&entry);
            if doc.same_ignoring_rev(&entry) {
                debug!("Already up to date: {}", doc.path);
                return Ok(());
            }
            doc.rev = entry.rev.clone();
            self.store.put(doc).await?;
            return Ok(());
        }

        if !entry.is_up_to_date(side) {
            // The other side wrote this file meanwhile; its version moves
            // aside and the new content takes the id
            self.relocate_existing(side.other(), entry).await?;
            let tombstone = self.store.get(&doc.id).await?;
            doc.rev = tombstone.and_then(|t| t.rev);
            self.store.put(doc).await?;
            return Ok(());
        }

        doc.carry_over_from(&entry);
        doc.rev = entry.rev.clone();
        self.store.put(doc).await?;
        Ok(())
    }

    /// A folder appeared or changed on `side`.
    pub async fn put_folder(&self, side: SideName, mut doc: Document) -> Result<(), MergeError> {
        let existing = self.store.get(&doc.id).await?;
        doc.mark_side(side, existing.as_ref());

        let entry = match existing {
            None => return self.create(side, doc, None).await,
            Some(entry) if entry.deleted => return self.create(side, doc, Some(entry)).await,
            Some(entry) if entry.is_file() => {
                // A file holds this id; the new folder moves aside
                self.rename_incoming(&mut doc);
                return self.create(side, doc, None).await;
            }
            Some(entry) => entry,
        };

        doc.carry_over_from(&entry);
        if doc.same_ignoring_rev(&entry) {
            debug!("Already up to date: {}", doc.path);
            return Ok(());
        }
        doc.rev = entry.rev.clone();
        self.store.put(doc).await?;
        Ok(())
    }

    /// A file moved on `side`. Committed as one atomic batch: tombstone
    /// of the source carrying `move_to`, plus the document at the
    /// destination.
    pub async fn move_file(
        &self,
        side: SideName,
        mut doc: Document,
        was: Document,
    ) -> Result<(), MergeError> {
        let source = match self.store.get(&was.id).await? {
            Some(source) if !source.deleted && source.sides.get(side).is_some() => source,
            // Unknown source: degrade to a plain add
            _ => return self.add_file(side, doc).await,
        };

        doc.mark_side(side, Some(&source));
        doc.carry_over_from(&source);
        doc.rev = None;

        match self.store.get(&doc.id).await? {
            Some(occupant) if !occupant.deleted => {
                // Destination taken: the move lands on a conflict path
                self.rename_incoming(&mut doc);
            }
            occupant => {
                doc.rev = occupant.and_then(|t| t.rev);
            }
        }

        let mut tombstone = source.clone();
        tombstone.mark_side(side, Some(&source));
        tombstone.deleted = true;
        tombstone.move_to = Some(doc.id.clone());

        self.ensure_parent_exists(side, &doc.path).await?;
        info!("Moving {} -> {}", source.path, doc.path);
        self.store.bulk_put(vec![tombstone, doc]).await?;
        Ok(())
    }

    /// A folder moved on `side`; the whole subtree is rewritten under the
    /// new prefix and committed as one atomic batch.
    pub async fn move_folder(
        &self,
        side: SideName,
        mut doc: Document,
        was: Document,
    ) -> Result<(), MergeError> {
        let source = match self.store.get(&was.id).await? {
            Some(source) if !source.deleted && source.sides.get(side).is_some() => source,
            _ => return self.put_folder(side, doc).await,
        };

        doc.mark_side(side, Some(&source));
        doc.carry_over_from(&source);
        doc.rev = None;

        match self.store.get(&doc.id).await? {
            Some(occupant) if !occupant.deleted => {
                self.rename_incoming(&mut doc);
            }
            occupant => {
                doc.rev = occupant.and_then(|t| t.rev);
            }
        }

        let mut tombstone = source.clone();
        tombstone.mark_side(side, Some(&source));
        tombstone.deleted = true;
        tombstone.move_to = Some(doc.id.clone());

        self.ensure_parent_exists(side, &doc.path).await?;
        info!("Moving folder {} -> {}", source.path, doc.path);

        // Children first, parent last; one transaction for the subtree
        let mut batch = Vec::new();
        for child in self.store.by_recursive_path(&source.id).await? {
            if child.deleted {
                continue;
            }
            let new_id = format!("{}{}", doc.id, &child.id[source.id.len()..]);
            let new_path = format!("{}{}", doc.path, &child.path[source.path.len()..]);

            let mut child_tombstone = child.clone();
            child_tombstone.mark_side(side, Some(&child));
            child_tombstone.deleted = true;
            child_tombstone.move_to = Some(new_id.clone());

            let mut moved = child.clone();
            moved.mark_side(side, Some(&child));
            moved.id = new_id;
            moved.path = new_path;
            moved.rev = match self.store.get(&moved.id).await? {
                Some(occupant) if occupant.deleted => occupant.rev,
                _ => None,
            };

            batch.push(child_tombstone);
            batch.push(moved);
        }
        batch.push(tombstone);
        batch.push(doc);

        self.store.bulk_put(batch).await?;
        Ok(())
    }

    /// A file disappeared on `side`.
    pub async fn delete_file(&self, side: SideName, doc: Document) -> Result<(), MergeError> {
        let existing = match self.store.get(&doc.id).await? {
            Some(existing) if !existing.deleted => existing,
            _ => return Ok(()),
        };
        if existing.sides.get(side).is_none() {
            // Stale event: this side no longer owns that path
            debug!("Ignoring deletion of {} (unknown on {})", doc.path, side);
            return Ok(());
        }

        let mut tombstone = existing.clone();
        tombstone.mark_side(side, Some(&existing));
        tombstone.deleted = true;
        self.store.put(tombstone).await?;
        Ok(())
    }

    /// A folder disappeared on `side`; tombstone the subtree, preserving
    /// documents the other side changed in the meantime.
    pub async fn delete_folder(&self, side: SideName, doc: Document) -> Result<(), MergeError> {
        let folder = match self.store.get(&doc.id).await? {
            Some(folder) if !folder.deleted => folder,
            _ => return Ok(()),
        };
        if folder.sides.get(side).is_none() {
            debug!("Ignoring deletion of {} (unknown on {})", doc.path, side);
            return Ok(());
        }
        self.delete_folder_recursively(side, folder).await
    }

    async fn delete_folder_recursively(
        &self,
        side: SideName,
        folder: Document,
    ) -> Result<(), MergeError> {
        let mut descendants = self.store.by_recursive_path(&folder.id).await?;
        descendants.retain(|d| !d.deleted);

        let mut preserved: HashSet<String> = HashSet::new();
        let mut batch = Vec::new();

        // Reverse id order: children are decided before their parents
        for child in descendants.iter().rev() {
            let keep_parent = |preserved: &mut HashSet<String>| {
                if let Some(p) = parent(&child.id) {
                    preserved.insert(p.to_string());
                }
            };

            if preserved.contains(&child.id) {
                keep_parent(&mut preserved);
                continue;
            }
            if child.sides.get(side).is_none() {
                // This side never had the document; not ours to delete
                keep_parent(&mut preserved);
                continue;
            }
            if !child.is_up_to_date(side) {
                // The other side changed it since we last saw it: keep
                // the document, sever its association with the other side
                let mut kept = child.clone();
                kept.remote = None;
                kept.sides.clear(SideName::Remote);
                info!("Preserving {} (changed on {})", child.path, side.other());
                batch.push(kept);
                keep_parent(&mut preserved);
                continue;
            }

            let mut tombstone = child.clone();
            tombstone.mark_side(side, Some(child));
            tombstone.deleted = true;
            batch.push(tombstone);
        }

        if !preserved.contains(&folder.id) {
            let mut tombstone = folder.clone();
            tombstone.mark_side(side, Some(&folder));
            tombstone.deleted = true;
            batch.push(tombstone);
        }

        if !batch.is_empty() {
            self.store.bulk_put(batch).await?;
        }
        Ok(())
    }

    /// Delete dispatching on the document kind.
    pub async fn delete_doc(&self, side: SideName, doc: Document) -> Result<(), MergeError> {
        match doc.kind {
            DocKind::File(_) => self.delete_file(side, doc).await,
            DocKind::Folder => self.delete_folder(side, doc).await,
        }
    }

    /// A file went to the trash on `side`: tombstone the original and
    /// keep a trashed clone until it is purged.
    pub async fn trash_file(
        &self,
        side: SideName,
        was: Document,
        mut doc: Document,
    ) -> Result<(), MergeError> {
        let existing = match self.store.get(&was.id).await? {
            Some(existing) if !existing.deleted => existing,
            _ => return Ok(()),
        };
        if existing.sides.get(side).is_none() {
            return Ok(());
        }

        if doc.id == existing.id {
            // Trashed in place: a single write flips the flag
            let mut trashed = existing.clone();
            trashed.mark_side(side, Some(&existing));
            trashed.trashed = true;
            trashed.errors = 0;
            self.store.put(trashed).await?;
            return Ok(());
        }

        let mut tombstone = existing.clone();
        tombstone.mark_side(side, Some(&existing));
        tombstone.deleted = true;
        tombstone.errors = 0;
        tombstone.move_to = Some(doc.id.clone());

        doc.mark_side(side, Some(&existing));
        doc.carry_over_from(&existing);
        doc.trashed = true;
        doc.errors = 0;
        doc.rev = self.store.get(&doc.id).await?.and_then(|d| d.rev);

        self.store.bulk_put(vec![tombstone, doc]).await?;
        Ok(())
    }

    /// A folder went to the trash on `side`. Aborted entirely when a file
    /// below it changed on the other side: the folder merely loses this
    /// side's marker and stays live.
    pub async fn trash_folder(
        &self,
        side: SideName,
        was: Document,
        mut doc: Document,
    ) -> Result<(), MergeError> {
        let folder = match self.store.get(&was.id).await? {
            Some(folder) if !folder.deleted => folder,
            _ => return Ok(()),
        };
        if folder.sides.get(side).is_none() {
            return Ok(());
        }

        let mut descendants = self.store.by_recursive_path(&folder.id).await?;
        descendants.retain(|d| !d.deleted);

        if descendants
            .iter()
            .any(|d| d.is_file() && !d.is_up_to_date(side))
        {
            info!(
                "Aborting trash of {}: a file below changed on {}",
                folder.path,
                side.other()
            );
            let mut kept = folder.clone();
            kept.sides.clear(side);
            kept.errors = 0;
            if !kept.sides.is_empty() {
                self.store.put(kept).await?;
            }
            return Ok(());
        }

        let mut batch = Vec::new();
        for child in descendants.iter().rev() {
            if child.sides.get(side).is_none() {
                continue;
            }
            let mut tombstone = child.clone();
            tombstone.mark_side(side, Some(child));
            tombstone.deleted = true;
            tombstone.errors = 0;
            batch.push(tombstone);
        }

        if doc.id == folder.id {
            let mut trashed = folder.clone();
            trashed.mark_side(side, Some(&folder));
            trashed.trashed = true;
            trashed.errors = 0;
            batch.push(trashed);
        } else {
            let mut tombstone = folder.clone();
            tombstone.mark_side(side, Some(&folder));
            tombstone.deleted = true;
            tombstone.errors = 0;
            tombstone.move_to = Some(doc.id.clone());

            doc.mark_side(side, Some(&folder));
            doc.carry_over_from(&folder);
            doc.trashed = true;
            doc.errors = 0;
            doc.rev = self.store.get(&doc.id).await?.and_then(|d| d.rev);

            batch.push(tombstone);
            batch.push(doc);
        }

        self.store.bulk_put(batch).await?;
        Ok(())
    }

    /// A file came back from the trash on `side`.
    pub async fn restore_file(
        &self,
        side: SideName,
        was: Document,
        doc: Document,
    ) -> Result<(), MergeError> {
        if let Err(e) = self.delete_file(side, was).await {
            debug!("Ignoring deletion failure during restore: {}", e);
        }
        self.update_file(side, doc).await
    }

    /// A folder came back from the trash on `side`.
    pub async fn restore_folder(
        &self,
        side: SideName,
        was: Document,
        doc: Document,
    ) -> Result<(), MergeError> {
        if let Err(e) = self.delete_folder(side, was).await {
            debug!("Ignoring deletion failure during restore: {}", e);
        }
        self.put_folder(side, doc).await
    }

    /// Write a document at a previously free id (or over a tombstone),
    /// synthesizing missing ancestor folders first.
    async fn create(
        &self,
        side: SideName,
        mut doc: Document,
        tombstone: Option<Document>,
    ) -> Result<(), MergeError> {
        self.ensure_parent_exists(side, &doc.path).await?;
        doc.rev = tombstone.and_then(|t| t.rev);
        self.store.put(doc).await?;
        Ok(())
    }

    /// Give the incoming (losing) document a conflict path and id.
    fn rename_incoming(&self, doc: &mut Document) {
        let dst = conflict_path(&doc.path, Utc::now());
        info!("Conflict at {}: renamed to {}", doc.path, dst);
        doc.id = doc_id(&dst);
        doc.path = dst;
        doc.rev = None;
    }

    /// Relocate the existing (losing) document to a conflict path as an
    /// atomic in-journal move attributed to `side` — the side that
    /// already has it and will perform the physical rename.
    async fn relocate_existing(
        &self,
        side: SideName,
        existing: Document,
    ) -> Result<(), MergeError> {
        let dst_path = conflict_path(&existing.path, Utc::now());
        let dst_id = doc_id(&dst_path);
        info!(
            "Conflict at {}: existing version renamed to {} on {}",
            existing.path, dst_path, side
        );

        let mut tombstone = existing.clone();
        tombstone.mark_side(side, Some(&existing));
        tombstone.deleted = true;
        tombstone.move_to = Some(dst_id.clone());

        let mut moved = existing.clone();
        moved.mark_side(side, Some(&existing));
        moved.rev = None;
        moved.id = dst_id;
        moved.path = dst_path;

        self.store.bulk_put(vec![tombstone, moved]).await?;
        Ok(())
    }

    /// Walk up the dirname chain and synthesize any missing ancestor
    /// folder, so out-of-order events (child before parent) still land.
    async fn ensure_parent_exists(&self, side: SideName, path: &str) -> Result<(), MergeError> {
        let Some(parent_path) = parent(path) else {
            return Ok(());
        };
        let parent_id = doc_id(parent_path);
        let existing = self.store.get(&parent_id).await?;
        if let Some(entry) = &existing {
            if !entry.deleted {
                return Ok(());
            }
        }

        Box::pin(self.ensure_parent_exists(side, parent_path)).await?;

        let mut folder = Document::new_folder(parent_path, Utc::now());
        folder.mark_side(side, existing.as_ref());
        folder.rev = existing.and_then(|e| e.rev);
        info!("Synthesizing missing parent folder {}", parent_path);
        self.store.put(folder).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_types::FileAttrs;
    use tempfile::NamedTempFile;

    fn harness() -> (Merge, Arc<MetadataStore>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(MetadataStore::new(file.path()).unwrap());
        (Merge::new(store.clone()), store, file)
    }

    fn file_doc(path: &str, checksum: &str) -> Document {
        Document::new_file(
            path,
            FileAttrs {
                checksum: Some(checksum.to_string()),
                size: Some(1),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    /// A file document as the remote feed would build it, twin included.
    fn remote_file_doc(path: &str, checksum: &str) -> Document {
        let mut doc = file_doc(path, checksum);
        doc.remote = Some(tandem_types::RemoteRef {
            id: format!("r-{}", path),
            rev: format!("1-{}", checksum),
        });
        doc
    }

    fn remote_folder_doc(path: &str) -> Document {
        let mut doc = Document::new_folder(path, Utc::now());
        doc.remote = Some(tandem_types::RemoteRef {
            id: format!("r-{}", path),
            rev: "1-dir".to_string(),
        });
        doc
    }

    #[tokio::test]
    async fn test_add_file_creates_missing_parents() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Local, file_doc("a/b/c.txt", "ccc"))
            .await
            .unwrap();

        let stored = store.get("a/b/c.txt").await.unwrap().unwrap();
        assert_eq!(stored.sides.local, Some(1));

        for folder in ["a", "a/b"] {
            let doc = store.get(folder).await.unwrap().unwrap();
            assert!(doc.is_folder(), "missing synthesized folder {}", folder);
            assert_eq!(doc.sides.local, Some(1));
        }
    }

    #[tokio::test]
    async fn test_add_same_binary_is_noop() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Local, file_doc("a.txt", "digest"))
            .await
            .unwrap();
        let first = store.get("a.txt").await.unwrap().unwrap();

        merge
            .add_file(SideName::Local, file_doc("a.txt", "digest"))
            .await
            .unwrap();
        let second = store.get("a.txt").await.unwrap().unwrap();

        assert_eq!(first.rev, second.rev);
    }

    #[tokio::test]
    async fn test_add_file_over_folder_renames_incoming() {
        let (merge, store, _f) = harness();

        merge
            .put_folder(SideName::Local, Document::new_folder("shared", Utc::now()))
            .await
            .unwrap();
        merge
            .add_file(SideName::Remote, file_doc("shared", "abc"))
            .await
            .unwrap();

        // Folder keeps the id, file landed on a conflict path
        assert!(store.get("shared").await.unwrap().unwrap().is_folder());
        let all = store.by_recursive_path("").await.unwrap();
        let conflicted: Vec<_> = all
            .iter()
            .filter(|d| d.path.contains("-conflict-") && d.is_file())
            .collect();
        assert_eq!(conflicted.len(), 1);
        assert_eq!(conflicted[0].checksum(), Some("abc"));
    }

    #[tokio::test]
    async fn test_update_on_folder_cannot_resolve() {
        let (merge, _store, _f) = harness();

        merge
            .put_folder(SideName::Local, Document::new_folder("dir", Utc::now()))
            .await
            .unwrap();
        let result = merge.update_file(SideName::Local, file_doc("dir", "x")).await;
        assert!(matches!(result, Err(MergeError::CannotResolve { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_update_relocates_existing() {
        let (merge, store, _f) = harness();

        // v1 on both sides
        merge
            .add_file(SideName::Local, file_doc("note", "v1"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Remote, remote_file_doc("note", "v1"))
            .await
            .unwrap();

        // Remote writes v2, then local writes v3 without seeing it
        merge
            .update_file(SideName::Remote, remote_file_doc("note", "v2"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Local, file_doc("note", "v3"))
            .await
            .unwrap();

        let live = store.get("note").await.unwrap().unwrap();
        assert_eq!(live.checksum(), Some("v3"));
        assert!(!live.deleted);

        let all = store.by_recursive_path("").await.unwrap();
        let conflict: Vec<_> = all
            .iter()
            .filter(|d| d.path.contains("-conflict-") && !d.deleted)
            .collect();
        assert_eq!(conflict.len(), 1);
        assert_eq!(conflict[0].checksum(), Some("v2"));
    }

    #[tokio::test]
    async fn test_move_file_atomic_pair() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Local, file_doc("a.txt", "X"))
            .await
            .unwrap();

        let was = store.get("a.txt").await.unwrap().unwrap();
        let doc = file_doc("b.txt", "X");
        merge.move_file(SideName::Local, doc, was).await.unwrap();

        let tombstone = store.get("a.txt").await.unwrap().unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.move_to.as_deref(), Some(doc_id("b.txt")).as_deref());

        let moved = store.get("b.txt").await.unwrap().unwrap();
        assert!(!moved.deleted);
        assert_eq!(moved.checksum(), Some("X"));
    }

    #[tokio::test]
    async fn test_move_file_round_trip_restores_original() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Local, file_doc("a.txt", "X"))
            .await
            .unwrap();

        let was = store.get("a.txt").await.unwrap().unwrap();
        merge
            .move_file(SideName::Local, file_doc("b.txt", "X"), was)
            .await
            .unwrap();

        let was = store.get("b.txt").await.unwrap().unwrap();
        merge
            .move_file(SideName::Local, file_doc("a.txt", "X"), was)
            .await
            .unwrap();

        let back = store.get("a.txt").await.unwrap().unwrap();
        assert!(!back.deleted);
        assert_eq!(back.id, doc_id("a.txt"));
        assert_eq!(back.checksum(), Some("X"));
    }

    #[tokio::test]
    async fn test_move_file_unknown_source_degrades_to_add() {
        let (merge, store, _f) = harness();

        let was = file_doc("never-seen.txt", "X");
        merge
            .move_file(SideName::Local, file_doc("b.txt", "X"), was)
            .await
            .unwrap();

        assert!(store.get("never-seen.txt").await.unwrap().is_none());
        assert!(store.get("b.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_move_file_occupied_destination_conflicts() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Local, file_doc("a.txt", "A"))
            .await
            .unwrap();
        merge
            .add_file(SideName::Local, file_doc("b.txt", "B"))
            .await
            .unwrap();

        let was = store.get("a.txt").await.unwrap().unwrap();
        merge
            .move_file(SideName::Local, file_doc("b.txt", "A"), was)
            .await
            .unwrap();

        // b.txt keeps its content; the move landed on a conflict path
        assert_eq!(
            store.get("b.txt").await.unwrap().unwrap().checksum(),
            Some("B")
        );
        let tombstone = store.get("a.txt").await.unwrap().unwrap();
        assert!(tombstone.deleted);
        let conflict_id = tombstone.move_to.unwrap();
        let moved = store.get(&conflict_id).await.unwrap().unwrap();
        assert!(moved.path.contains("-conflict-"));
        assert_eq!(moved.checksum(), Some("A"));
    }

    #[tokio::test]
    async fn test_move_folder_rewrites_subtree_atomically() {
        let (merge, store, _f) = harness();

        merge
            .put_folder(SideName::Local, Document::new_folder("dir", Utc::now()))
            .await
            .unwrap();
        merge
            .add_file(SideName::Local, file_doc("dir/a", "A"))
            .await
            .unwrap();
        merge
            .add_file(SideName::Local, file_doc("dir/b", "B"))
            .await
            .unwrap();

        let was = store.get("dir").await.unwrap().unwrap();
        merge
            .move_folder(SideName::Local, Document::new_folder("dir2", Utc::now()), was)
            .await
            .unwrap();

        // Three tombstones with move_to, three live docs at rewritten ids
        for (old, new) in [("dir", "dir2"), ("dir/a", "dir2/a"), ("dir/b", "dir2/b")] {
            let tombstone = store.get(old).await.unwrap().unwrap();
            assert!(tombstone.deleted, "{} should be tombstoned", old);
            assert_eq!(tombstone.move_to.as_deref(), Some(doc_id(new)).as_deref());

            let moved = store.get(new).await.unwrap().unwrap();
            assert!(!moved.deleted, "{} should be live", new);
            assert_eq!(moved.path, new);
        }

        let live_children = store
            .by_recursive_path("dir2")
            .await
            .unwrap()
            .into_iter()
            .filter(|d| !d.deleted)
            .count();
        assert_eq!(live_children, 2);
    }

    #[tokio::test]
    async fn test_delete_file_tombstones() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Local, file_doc("a.txt", "X"))
            .await
            .unwrap();
        merge
            .delete_file(SideName::Local, file_doc("a.txt", "X"))
            .await
            .unwrap();

        let tombstone = store.get("a.txt").await.unwrap().unwrap();
        assert!(tombstone.deleted);
        assert!(tombstone.move_to.is_none());
    }

    #[tokio::test]
    async fn test_delete_file_absent_and_stale_are_noops() {
        let (merge, store, _f) = harness();

        // Absent
        merge
            .delete_file(SideName::Local, file_doc("ghost", "X"))
            .await
            .unwrap();
        assert!(store.get("ghost").await.unwrap().is_none());

        // Known only to the remote: a local deletion event is stale
        merge
            .add_file(SideName::Remote, file_doc("remote-only", "X"))
            .await
            .unwrap();
        merge
            .delete_file(SideName::Local, file_doc("remote-only", "X"))
            .await
            .unwrap();
        assert!(!store.get("remote-only").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_delete_folder_preserves_docs_changed_on_other_side() {
        let (merge, store, _f) = harness();

        merge
            .put_folder(SideName::Local, Document::new_folder("dir", Utc::now()))
            .await
            .unwrap();
        merge
            .add_file(SideName::Local, file_doc("dir/a", "A1"))
            .await
            .unwrap();
        merge
            .add_file(SideName::Local, file_doc("dir/b", "B"))
            .await
            .unwrap();

        // Remote catches up on dir/a, then updates it again
        merge
            .update_file(SideName::Remote, remote_file_doc("dir/a", "A1"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Remote, remote_file_doc("dir/a", "A2"))
            .await
            .unwrap();

        merge
            .delete_folder(SideName::Local, Document::new_folder("dir", Utc::now()))
            .await
            .unwrap();

        // dir/a survives dissociated; dir/b and dir are tombstoned... but
        // dir itself is preserved because a live child remains below it
        let kept = store.get("dir/a").await.unwrap().unwrap();
        assert!(!kept.deleted);
        assert!(kept.remote.is_none());
        assert_eq!(kept.sides.remote, None);

        assert!(store.get("dir/b").await.unwrap().unwrap().deleted);
        assert!(!store.get("dir").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_trash_folder_aborts_when_other_side_updated_child() {
        let (merge, store, _f) = harness();

        merge
            .put_folder(SideName::Local, Document::new_folder("dir", Utc::now()))
            .await
            .unwrap();
        merge
            .add_file(SideName::Local, file_doc("dir/a", "A1"))
            .await
            .unwrap();
        merge
            .add_file(SideName::Local, file_doc("dir/b", "B"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Remote, remote_file_doc("dir/a", "A1"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Remote, remote_file_doc("dir/b", "B"))
            .await
            .unwrap();
        merge
            .put_folder(SideName::Remote, remote_folder_doc("dir"))
            .await
            .unwrap();

        // Remote updates dir/a after both sides agreed
        merge
            .update_file(SideName::Remote, remote_file_doc("dir/a", "A2"))
            .await
            .unwrap();

        let was = store.get("dir").await.unwrap().unwrap();
        let trash = Document::new_folder("dir", Utc::now());
        merge
            .trash_folder(SideName::Local, was, trash)
            .await
            .unwrap();

        // Trash aborted: folder lost the local marker, children stay live
        let folder = store.get("dir").await.unwrap().unwrap();
        assert!(!folder.deleted);
        assert!(!folder.trashed);
        assert_eq!(folder.sides.local, None);
        assert!(!store.get("dir/a").await.unwrap().unwrap().deleted);
        assert!(!store.get("dir/b").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_trash_file_in_place() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Local, file_doc("junk.txt", "X"))
            .await
            .unwrap();

        let was = store.get("junk.txt").await.unwrap().unwrap();
        merge
            .trash_file(SideName::Local, was, file_doc("junk.txt", "X"))
            .await
            .unwrap();

        let doc = store.get("junk.txt").await.unwrap().unwrap();
        assert!(doc.trashed);
        assert!(!doc.deleted);
    }

    #[tokio::test]
    async fn test_restore_file_revives_document() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Remote, file_doc("doc.txt", "X"))
            .await
            .unwrap();
        let was = store.get("doc.txt").await.unwrap().unwrap();
        merge
            .trash_file(SideName::Remote, was, file_doc("doc.txt", "X"))
            .await
            .unwrap();

        let was = store.get("doc.txt").await.unwrap().unwrap();
        merge
            .restore_file(SideName::Remote, was, file_doc("doc.txt", "X"))
            .await
            .unwrap();

        let doc = store.get("doc.txt").await.unwrap().unwrap();
        assert!(!doc.deleted);
        assert!(!doc.trashed);
    }

    #[tokio::test]
    async fn test_initial_add_remote_only_change_is_noop() {
        let (merge, store, _f) = harness();

        // v1 seen by both sides, then remote writes v2
        merge
            .add_file(SideName::Local, file_doc("note", "v1"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Remote, remote_file_doc("note", "v1"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Remote, remote_file_doc("note", "v2"))
            .await
            .unwrap();
        let before = store.get("note").await.unwrap().unwrap();

        // Engine restarts; the scan re-reports the unchanged local v1
        merge
            .add_file(SideName::Local, file_doc("note", "v1"))
            .await
            .unwrap();

        let after = store.get("note").await.unwrap().unwrap();
        assert_eq!(after.rev, before.rev, "no write should have happened");
        assert_eq!(after.checksum(), Some("v2"));
    }

    #[tokio::test]
    async fn test_initial_add_divergence_conflicts_remote_version() {
        let (merge, store, _f) = harness();

        merge
            .add_file(SideName::Local, file_doc("note", "v1"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Remote, remote_file_doc("note", "v1"))
            .await
            .unwrap();
        merge
            .update_file(SideName::Remote, remote_file_doc("note", "v2"))
            .await
            .unwrap();

        // Engine restarts; meanwhile the disk content changed too
        merge
            .add_file(SideName::Local, file_doc("note", "v3"))
            .await
            .unwrap();

        let live = store.get("note").await.unwrap().unwrap();
        assert_eq!(live.checksum(), Some("v3"));

        let all = store.by_recursive_path("").await.unwrap();
        let conflict: Vec<_> = all
            .iter()
            .filter(|d| d.path.contains("-conflict-") && !d.deleted)
            .collect();
        assert_eq!(conflict.len(), 1);
        assert_eq!(conflict[0].checksum(), Some("v2"));
    }
}
