//! The local watcher: raw filesystem events in, semantic operations out.
//!
//! Raw watchers report unlinks and adds, never moves. This layer infers
//! them: a deleted path is held *pending* for a short window, and when a
//! newly hashed file matches the content of a pending deletion, the pair
//! collapses into one move operation. Folder deletions are likewise held
//! until every child below them has been dispatched, because the raw
//! stream reports parent and children in no reliable order.
//!
//! All timing runs through one explicit deadline scheduler in the event
//! loop; there are no nested timers.

pub mod events;

use crate::checksum::ChecksumQueue;
use crate::config::SyncConfig;
use crate::prep::Prep;
use crate::store::MetadataStore;
use chrono::Utc;
use events::{FsEvent, Stats};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tandem_types::{ChecksumError, Document, FileAttrs, SideName, WatcherError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long a file deletion is held for move inference (ms).
pub const DELETE_DEBOUNCE_MS: u64 = 1250;

/// Re-check cadence while checksums are still in flight (ms).
pub const HASH_WAIT_RETRY_MS: u64 = 100;

/// Re-check cadence for a pending folder deletion (ms).
pub const DIR_DELETE_CHECK_MS: u64 = 350;

/// Grace period for outstanding checksums at shutdown (ms).
pub const STOP_GRACE_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    DeleteFile,
    DeleteFolder,
}

/// A deletion awaiting confirmation.
#[derive(Debug)]
struct Pending {
    kind: PendingKind,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
enum HashedFor {
    Add,
    Change,
}

/// A checksum completion re-entering the event loop.
struct Hashed {
    path: String,
    stats: Stats,
    purpose: HashedFor,
    result: Result<String, ChecksumError>,
}

/// Converts raw filesystem events into semantic operations.
pub struct LocalWatcher {
    config: SyncConfig,
    store: Arc<MetadataStore>,
    checksums: ChecksumQueue,
    prep: Prep,
    events: mpsc::Receiver<FsEvent>,
    hashed_tx: mpsc::UnboundedSender<Hashed>,
    hashed_rx: mpsc::UnboundedReceiver<Hashed>,
    /// Paths seen during the initial scan; `None` once `Ready` handled.
    scan_paths: Option<HashSet<String>>,
    /// Deletions held for move inference / child sequencing.
    pending: HashMap<String, Pending>,
    /// Checksums enqueued whose results this loop has not yet consumed.
    hashes_in_flight: usize,
}

impl LocalWatcher {
    pub fn new(
        config: SyncConfig,
        store: Arc<MetadataStore>,
        checksums: ChecksumQueue,
        prep: Prep,
        events: mpsc::Receiver<FsEvent>,
    ) -> Self {
        let (hashed_tx, hashed_rx) = mpsc::unbounded_channel();
        Self {
            config,
            store,
            checksums,
            prep,
            events,
            hashed_tx,
            hashed_rx,
            scan_paths: Some(HashSet::new()),
            pending: HashMap::new(),
            hashes_in_flight: 0,
        }
    }

    /// Drive the watcher until the raw stream ends or a fatal error.
    ///
    /// On exit, every pending deletion is flushed and outstanding
    /// checksums get a bounded grace period; nothing is emitted after it.
    pub async fn run(mut self) -> Result<(), WatcherError> {
        info!("Local watcher started for {}", self.config.sync_path.display());
        let result = loop {
            let next_deadline = self.next_deadline();
            tokio::select! {
                biased;
                Some(hashed) = self.hashed_rx.recv(), if self.hashes_in_flight > 0 => {
                    self.on_hashed(hashed).await;
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.on_event(event).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.on_deadline().await;
                }
            }
        };
        self.shutdown().await;
        result
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    async fn on_event(&mut self, event: FsEvent) -> Result<(), WatcherError> {
        match event {
            FsEvent::AddFile { path, stats } => self.on_add_file(path, stats),
            FsEvent::AddDir { path, stats } => self.on_add_dir(path, stats).await,
            FsEvent::Change { path, stats } => self.on_change(path, stats),
            FsEvent::UnlinkFile { path } => self.on_unlink_file(path),
            FsEvent::UnlinkDir { path } => self.on_unlink_folder(path),
            FsEvent::Ready => self.on_ready().await,
            FsEvent::Fatal(msg) => {
                error!("Stopping local watcher: {}", msg);
                return Err(WatcherError::Fatal(msg));
            }
        }
        Ok(())
    }

    fn on_add_file(&mut self, path: String, stats: Stats) {
        if let Some(paths) = &mut self.scan_paths {
            paths.insert(path.clone());
        }
        if self.pending.remove(&path).is_some() {
            debug!("Cancelled pending deletion of {} (re-added)", path);
        }
        self.enqueue_hash(path, stats, HashedFor::Add);
    }

    async fn on_add_dir(&mut self, path: String, stats: Stats) {
        if let Some(paths) = &mut self.scan_paths {
            paths.insert(path.clone());
        }
        if self.pending.remove(&path).is_some() {
            debug!("Cancelled pending deletion of {} (re-added)", path);
        }
        let doc = folder_doc(&path, &stats);
        self.prep.put_folder(SideName::Local, doc).await;
    }

    fn on_change(&mut self, path: String, stats: Stats) {
        self.enqueue_hash(path, stats, HashedFor::Change);
    }

    fn on_unlink_file(&mut self, path: String) {
        debug!("File gone: {} (holding for move inference)", path);
        self.pending.insert(
            path,
            Pending {
                kind: PendingKind::DeleteFile,
                deadline: Instant::now() + Duration::from_millis(DELETE_DEBOUNCE_MS),
            },
        );
    }

    fn on_unlink_folder(&mut self, path: String) {
        debug!("Folder gone: {} (waiting for children)", path);
        self.pending.insert(
            path,
            Pending {
                kind: PendingKind::DeleteFolder,
                deadline: Instant::now() + Duration::from_millis(DIR_DELETE_CHECK_MS),
            },
        );
    }

    /// Initial scan finished: every journal document whose path was not
    /// seen on disk disappeared while the engine was stopped. Swept in
    /// reverse id order so children go before their parents.
    async fn on_ready(&mut self) {
        let Some(paths) = self.scan_paths.take() else {
            return;
        };
        info!("Initial scan complete, {} path(s) on disk", paths.len());

        let docs = match self.store.by_recursive_path("").await {
            Ok(docs) => docs,
            Err(e) => {
                warn!("Cannot sweep for offline deletions: {}", e);
                return;
            }
        };
        for doc in docs.into_iter().rev() {
            if doc.deleted {
                continue;
            }
            if !paths.contains(&doc.path) {
                info!("Gone since last run: {}", doc.path);
                self.prep.delete_doc(SideName::Local, doc).await;
            }
        }
    }

    fn enqueue_hash(&mut self, path: String, stats: Stats, purpose: HashedFor) {
        let absolute = self.config.sync_path.join(&path);
        let receiver = self.checksums.enqueue(absolute);
        self.hashes_in_flight += 1;

        let tx = self.hashed_tx.clone();
        tokio::spawn(async move {
            let result = match receiver.await {
                Ok(result) => result,
                Err(_) => Err(ChecksumError::Canceled),
            };
            let _ = tx.send(Hashed {
                path,
                stats,
                purpose,
                result,
            });
        });
    }

    async fn on_hashed(&mut self, hashed: Hashed) {
        self.hashes_in_flight -= 1;

        let digest = match hashed.result {
            Ok(digest) => digest,
            Err(e) => {
                // Uncategorizable file: no operation, just release the slot
                warn!("Dropping event for {}: {}", hashed.path, e);
                return;
            }
        };
        let doc = file_doc(&hashed.path, &hashed.stats, &digest);

        match hashed.purpose {
            HashedFor::Change => {
                self.prep.update_file(SideName::Local, doc).await;
            }
            HashedFor::Add => {
                if self.pending.is_empty() {
                    self.prep.add_file(SideName::Local, doc).await;
                    return;
                }
                match self.find_move_source(&digest).await {
                    Some(was) => {
                        self.pending.remove(&was.path);
                        info!("Move detected: {} -> {}", was.path, doc.path);
                        self.prep.move_file(SideName::Local, doc, was).await;
                    }
                    None => {
                        self.prep.add_file(SideName::Local, doc).await;
                    }
                }
            }
        }
    }

    /// A checksum-index hit counts as a move source only when that
    /// document's path has a deletion pending right now; anything else is
    /// a stale index entry.
    async fn find_move_source(&self, digest: &str) -> Option<Document> {
        let candidates = match self.store.by_checksum(digest).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Checksum lookup failed: {}", e);
                return None;
            }
        };
        candidates.into_iter().find(|doc| {
            doc.is_file()
                && !doc.deleted
                && self
                    .pending
                    .get(&doc.path)
                    .map(|p| p.kind == PendingKind::DeleteFile)
                    .unwrap_or(false)
        })
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            let kind = match self.pending.get(&path) {
                Some(pending) => pending.kind,
                None => continue,
            };
            match kind {
                PendingKind::DeleteFile => {
                    if self.hashes_in_flight > 0 {
                        // A digest still in flight may claim this as a move
                        if let Some(pending) = self.pending.get_mut(&path) {
                            pending.deadline = now + Duration::from_millis(HASH_WAIT_RETRY_MS);
                        }
                        continue;
                    }
                    self.pending.remove(&path);
                    debug!("Deletion confirmed: {}", path);
                    let doc = Document::new_file(&path, FileAttrs::default(), Utc::now());
                    self.prep.delete_file(SideName::Local, doc).await;
                }
                PendingKind::DeleteFolder => {
                    let prefix = format!("{}/", path);
                    let children_pending = self
                        .pending
                        .keys()
                        .any(|other| other != &path && other.starts_with(&prefix));
                    if children_pending {
                        if let Some(pending) = self.pending.get_mut(&path) {
                            pending.deadline = now + Duration::from_millis(DIR_DELETE_CHECK_MS);
                        }
                        continue;
                    }
                    self.pending.remove(&path);
                    debug!("Folder deletion confirmed: {}", path);
                    let doc = Document::new_folder(&path, Utc::now());
                    self.prep.delete_folder(SideName::Local, doc).await;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        // Flush every pending deletion, children before parents
        let mut held: Vec<(String, PendingKind)> = self
            .pending
            .drain()
            .map(|(path, pending)| (path, pending.kind))
            .collect();
        held.sort_by(|a, b| b.0.cmp(&a.0));
        for (path, kind) in held {
            debug!("Flushing pending deletion of {}", path);
            match kind {
                PendingKind::DeleteFile => {
                    let doc = Document::new_file(&path, FileAttrs::default(), Utc::now());
                    self.prep.delete_file(SideName::Local, doc).await;
                }
                PendingKind::DeleteFolder => {
                    let doc = Document::new_folder(&path, Utc::now());
                    self.prep.delete_folder(SideName::Local, doc).await;
                }
            }
        }

        // Let outstanding checksums drain, within the grace period
        let deadline = Instant::now() + Duration::from_millis(STOP_GRACE_MS);
        while self.hashes_in_flight > 0 {
            if Instant::now() >= deadline {
                break;
            }
            let remaining = deadline - Instant::now();
            match tokio::time::timeout(remaining, self.hashed_rx.recv()).await {
                Ok(Some(hashed)) => self.on_hashed(hashed).await,
                _ => break,
            }
        }
        if self.hashes_in_flight > 0 {
            warn!(
                "Abandoning {} outstanding checksum(s) at shutdown",
                self.hashes_in_flight
            );
        }
        info!("Local watcher stopped");
    }
}

/// Build a file document from an observation and its digest.
fn file_doc(path: &str, stats: &Stats, digest: &str) -> Document {
    let (mime, class) = events::mime_and_class(path);
    let mut doc = Document::new_file(
        path,
        FileAttrs {
            checksum: Some(digest.to_string()),
            size: Some(stats.size),
            executable: stats.executable,
            mime,
            class,
        },
        stats.mtime.unwrap_or_else(Utc::now),
    );
    if let Some(birthtime) = stats.birthtime {
        doc.created_at = birthtime;
    }
    doc
}

/// Build a folder document from an observation.
fn folder_doc(path: &str, stats: &Stats) -> Document {
    let mut doc = Document::new_folder(path, stats.mtime.unwrap_or_else(Utc::now));
    if let Some(birthtime) = stats.birthtime {
        doc.created_at = birthtime;
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_doc_carries_stats() {
        let stats = Stats {
            size: 10,
            executable: true,
            ..Default::default()
        };
        let doc = file_doc("bin/tool.sh", &stats, "digest");
        let attrs = doc.file_attrs().unwrap();
        assert_eq!(attrs.checksum.as_deref(), Some("digest"));
        assert_eq!(attrs.size, Some(10));
        assert!(attrs.executable);
        assert_eq!(doc.id, tandem_types::doc_id("bin/tool.sh"));
    }

    #[test]
    fn test_folder_doc_kind() {
        let doc = folder_doc("dir", &Stats::default());
        assert!(doc.is_folder());
    }
}
