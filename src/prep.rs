//! Normalization and dispatch of semantic operations.
//!
//! Both change producers (the local watcher and the remote feed) hand
//! their operations to [`Prep`], which normalizes paths, derives ids, and
//! pushes the operation onto one bounded channel. A single consumer task
//! ([`merge_loop`]) drains that channel and applies operations serially,
//! which is what makes the reconciler's get/compute/put sequences
//! linearizable.

use crate::merge::Merge;
use tandem_types::{doc_id, normalize_separators, Document, MergeError, SideName};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// A semantic change operation headed for the reconciler.
#[derive(Debug)]
pub enum Operation {
    AddFile { side: SideName, doc: Document },
    UpdateFile { side: SideName, doc: Document },
    PutFolder { side: SideName, doc: Document },
    MoveFile { side: SideName, doc: Document, was: Document },
    MoveFolder { side: SideName, doc: Document, was: Document },
    DeleteFile { side: SideName, doc: Document },
    DeleteFolder { side: SideName, doc: Document },
    DeleteDoc { side: SideName, doc: Document },
    TrashFile { side: SideName, was: Document, doc: Document },
    TrashFolder { side: SideName, was: Document, doc: Document },
    RestoreFile { side: SideName, was: Document, doc: Document },
    RestoreFolder { side: SideName, was: Document, doc: Document },
}

impl Operation {
    /// Operation name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddFile { .. } => "add_file",
            Operation::UpdateFile { .. } => "update_file",
            Operation::PutFolder { .. } => "put_folder",
            Operation::MoveFile { .. } => "move_file",
            Operation::MoveFolder { .. } => "move_folder",
            Operation::DeleteFile { .. } => "delete_file",
            Operation::DeleteFolder { .. } => "delete_folder",
            Operation::DeleteDoc { .. } => "delete_doc",
            Operation::TrashFile { .. } => "trash_file",
            Operation::TrashFolder { .. } => "trash_folder",
            Operation::RestoreFile { .. } => "restore_file",
            Operation::RestoreFolder { .. } => "restore_folder",
        }
    }

    /// Path of the primary document, for logging.
    pub fn path(&self) -> &str {
        match self {
            Operation::AddFile { doc, .. }
            | Operation::UpdateFile { doc, .. }
            | Operation::PutFolder { doc, .. }
            | Operation::MoveFile { doc, .. }
            | Operation::MoveFolder { doc, .. }
            | Operation::DeleteFile { doc, .. }
            | Operation::DeleteFolder { doc, .. }
            | Operation::DeleteDoc { doc, .. }
            | Operation::TrashFile { doc, .. }
            | Operation::TrashFolder { doc, .. }
            | Operation::RestoreFile { doc, .. }
            | Operation::RestoreFolder { doc, .. } => &doc.path,
        }
    }
}

/// Fix separators and re-derive the id for a producer-built document.
fn normalize(doc: &mut Document) {
    doc.path = normalize_separators(&doc.path);
    doc.id = doc_id(&doc.path);
}

/// Front door for change producers.
#[derive(Clone)]
pub struct Prep {
    tx: mpsc::Sender<Operation>,
}

impl Prep {
    /// Create a prep queue with the given capacity. The caller feeds the
    /// returned receiver to [`merge_loop`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Operation>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn dispatch(&self, op: Operation) {
        if self.tx.send(op).await.is_err() {
            // Reconciler has shut down; producers log and carry on
            warn!("Dropping operation: merge queue is closed");
        }
    }

    pub async fn add_file(&self, side: SideName, mut doc: Document) {
        normalize(&mut doc);
        self.dispatch(Operation::AddFile { side, doc }).await;
    }

    pub async fn update_file(&self, side: SideName, mut doc: Document) {
        normalize(&mut doc);
        self.dispatch(Operation::UpdateFile { side, doc }).await;
    }

    pub async fn put_folder(&self, side: SideName, mut doc: Document) {
        normalize(&mut doc);
        self.dispatch(Operation::PutFolder { side, doc }).await;
    }

    pub async fn move_file(&self, side: SideName, mut doc: Document, mut was: Document) {
        normalize(&mut doc);
        normalize(&mut was);
        self.dispatch(Operation::MoveFile { side, doc, was }).await;
    }

    pub async fn move_folder(&self, side: SideName, mut doc: Document, mut was: Document) {
        normalize(&mut doc);
        normalize(&mut was);
        self.dispatch(Operation::MoveFolder { side, doc, was }).await;
    }

    pub async fn delete_file(&self, side: SideName, mut doc: Document) {
        normalize(&mut doc);
        self.dispatch(Operation::DeleteFile { side, doc }).await;
    }

    pub async fn delete_folder(&self, side: SideName, mut doc: Document) {
        normalize(&mut doc);
        self.dispatch(Operation::DeleteFolder { side, doc }).await;
    }

    /// Delete dispatching on the document kind; used by the initial-scan
    /// sweep and by the remote feed for tombstones of unknown kind.
    pub async fn delete_doc(&self, side: SideName, mut doc: Document) {
        normalize(&mut doc);
        self.dispatch(Operation::DeleteDoc { side, doc }).await;
    }

    pub async fn trash_file(&self, side: SideName, mut was: Document, mut doc: Document) {
        normalize(&mut was);
        normalize(&mut doc);
        self.dispatch(Operation::TrashFile { side, was, doc }).await;
    }

    pub async fn trash_folder(&self, side: SideName, mut was: Document, mut doc: Document) {
        normalize(&mut was);
        normalize(&mut doc);
        self.dispatch(Operation::TrashFolder { side, was, doc })
            .await;
    }

    pub async fn restore_file(&self, side: SideName, mut was: Document, mut doc: Document) {
        normalize(&mut was);
        normalize(&mut doc);
        self.dispatch(Operation::RestoreFile { side, was, doc })
            .await;
    }

    pub async fn restore_folder(&self, side: SideName, mut was: Document, mut doc: Document) {
        normalize(&mut was);
        normalize(&mut doc);
        self.dispatch(Operation::RestoreFolder { side, was, doc })
            .await;
    }
}

/// Drain the prep queue, applying operations serially.
///
/// Absence and conflicts never surface as errors; a file-vs-folder
/// mismatch is logged and skipped; store failures are logged and the
/// loop continues with the next operation.
pub async fn merge_loop(mut rx: mpsc::Receiver<Operation>, merge: Merge) {
    while let Some(op) = rx.recv().await {
        let name = op.name();
        let path = op.path().to_string();
        match merge.apply(op).await {
            Ok(()) => {}
            Err(MergeError::CannotResolve { path }) => {
                warn!("Skipping {}: file/folder mismatch at {}", name, path);
            }
            Err(e) => {
                error!("{} failed for {}: {}", name, path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tandem_types::FileAttrs;

    #[tokio::test]
    async fn test_prep_normalizes_paths_and_ids() {
        let (prep, mut rx) = Prep::new(8);

        let doc = Document::new_file("dir\\sub\\a.txt", FileAttrs::default(), Utc::now());
        prep.add_file(SideName::Local, doc).await;

        match rx.recv().await.unwrap() {
            Operation::AddFile { doc, .. } => {
                assert_eq!(doc.path, "dir/sub/a.txt");
                assert_eq!(doc.id, doc_id("dir/sub/a.txt"));
            }
            other => panic!("unexpected operation: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_operations_keep_emission_order() {
        let (prep, mut rx) = Prep::new(8);
        let now = Utc::now();

        prep.add_file(
            SideName::Local,
            Document::new_file("a", FileAttrs::default(), now),
        )
        .await;
        prep.update_file(
            SideName::Local,
            Document::new_file("a", FileAttrs::default(), now),
        )
        .await;
        prep.delete_file(
            SideName::Local,
            Document::new_file("a", FileAttrs::default(), now),
        )
        .await;

        let names: Vec<&str> = vec![
            rx.recv().await.unwrap().name(),
            rx.recv().await.unwrap().name(),
            rx.recv().await.unwrap().name(),
        ];
        assert_eq!(names, vec!["add_file", "update_file", "delete_file"]);
    }
}
