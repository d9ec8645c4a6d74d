//! Raw filesystem event production.
//!
//! Bridges the `notify` backend into the engine's event vocabulary: an
//! initial recursive scan (ending with [`FsEvent::Ready`]), then live
//! translation of create/modify/remove/rename notifications. File content
//! events are held back until the file stops changing, so a half-written
//! document is never hashed.

use crate::config::{AwaitWriteFinish, SyncConfig};
use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tandem_types::normalize_separators;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Upper bound on how long to wait for a file write to stabilize (ms).
pub const STABILITY_MAX_WAIT_MS: u64 = 30_000;

/// Filesystem attributes captured alongside an event.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub mode: Option<u32>,
    pub size: u64,
    pub executable: bool,
    pub birthtime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
}

impl Stats {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(meta.permissions().mode())
        };
        #[cfg(not(unix))]
        let mode: Option<u32> = None;

        Self {
            mode,
            size: meta.len(),
            executable: mode.map(|m| m & 0o111 != 0).unwrap_or(false),
            birthtime: meta.created().ok().map(DateTime::from),
            ctime: meta.modified().ok().map(DateTime::from),
            mtime: meta.modified().ok().map(DateTime::from),
        }
    }
}

/// One raw watcher event, with paths relative to the sync root.
#[derive(Debug)]
pub enum FsEvent {
    AddFile { path: String, stats: Stats },
    AddDir { path: String, stats: Stats },
    Change { path: String, stats: Stats },
    UnlinkFile { path: String },
    UnlinkDir { path: String },
    /// Initial scan finished.
    Ready,
    /// Watch resources exhausted; the watcher must shut down.
    Fatal(String),
}

/// Guess a MIME type and coarse class from a path's extension.
pub fn mime_and_class(path: &str) -> (Option<String>, Option<String>) {
    let name = path.rsplit('/').next().unwrap_or(path);
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => return (None, None),
    };
    let mime = match ext.as_str() {
        "txt" | "md" | "rst" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "odt" => "application/vnd.oasis.opendocument.text",
        _ => return (None, None),
    };
    let class = mime.split('/').next().map(|c| c.to_string());
    (Some(mime.to_string()), class)
}

/// Poll a file until its size and mtime stop changing for the configured
/// threshold. Returns the last observed metadata, bounded by
/// [`STABILITY_MAX_WAIT_MS`].
pub async fn wait_for_file_stability(
    path: &Path,
    opts: &AwaitWriteFinish,
) -> std::io::Result<std::fs::Metadata> {
    let poll = Duration::from_millis(opts.poll_interval_ms);
    let threshold = Duration::from_millis(opts.stability_threshold_ms);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(STABILITY_MAX_WAIT_MS);

    let mut last = std::fs::metadata(path)?;
    let mut stable_since = tokio::time::Instant::now();

    loop {
        tokio::time::sleep(poll).await;
        let meta = std::fs::metadata(path)?;
        let changed =
            meta.len() != last.len() || meta.modified().ok() != last.modified().ok();
        if changed {
            stable_since = tokio::time::Instant::now();
            last = meta;
        } else if stable_since.elapsed() >= threshold {
            return Ok(meta);
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Giving up on stability of {}", path.display());
            return Ok(last);
        }
    }
}

/// Whether a notify error means the kernel ran out of watch resources.
fn is_fatal(error: &notify::Error) -> bool {
    match &error.kind {
        notify::ErrorKind::MaxFilesWatch => true,
        notify::ErrorKind::Io(io) => io.raw_os_error() == Some(28), // ENOSPC
        _ => false,
    }
}

/// Produce raw events for one sync root: scan, `Ready`, then live watch.
///
/// Symlinks, the control directory, and ignored patterns are skipped.
/// Non-fatal backend errors are logged; watch exhaustion emits
/// [`FsEvent::Fatal`] and ends the task. The task also ends when the
/// receiver is dropped.
pub async fn fs_events_task(config: SyncConfig, tx: mpsc::Sender<FsEvent>) {
    let root = config.sync_path.clone();

    // Known directories, for classifying removals after the entry is gone
    let mut dirs: HashSet<String> = HashSet::new();

    // Start watching before the scan so nothing slips between the two
    let (notify_tx, mut notify_rx) = mpsc::channel::<Result<Event, notify::Error>>(100);
    let mut watcher = match RecommendedWatcher::new(
        move |res| {
            let _ = notify_tx.blocking_send(res);
        },
        Config::default().with_poll_interval(Duration::from_millis(config.poll_interval_ms)),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("Failed to create watcher: {}", e);
            let _ = tx.send(FsEvent::Fatal(e.to_string())).await;
            return;
        }
    };
    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        error!("Failed to watch {}: {}", root.display(), e);
        let _ = tx.send(FsEvent::Fatal(e.to_string())).await;
        return;
    }
    info!("Watching {}", root.display());

    // Initial scan
    let mut scanned = Vec::new();
    if let Err(e) = scan_dir(&root, "", &config, &mut scanned) {
        warn!("Initial scan error under {}: {}", root.display(), e);
    }
    for (path, is_dir, stats) in scanned {
        let event = if is_dir {
            dirs.insert(path.clone());
            FsEvent::AddDir { path, stats }
        } else {
            FsEvent::AddFile { path, stats }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
    if tx.send(FsEvent::Ready).await.is_err() {
        return;
    }

    // Live translation
    while let Some(res) = notify_rx.recv().await {
        match res {
            Ok(event) => {
                if handle_notify_event(&config, &mut dirs, event, &tx).await.is_err() {
                    return;
                }
            }
            Err(e) if is_fatal(&e) => {
                error!("Watcher out of resources: {}", e);
                let _ = tx.send(FsEvent::Fatal(e.to_string())).await;
                return;
            }
            Err(e) => {
                warn!("Watcher error: {}", e);
            }
        }
    }
}

/// Recursive scan, entries sorted per directory, symlinks skipped.
fn scan_dir(
    root: &Path,
    relative: &str,
    config: &SyncConfig,
    out: &mut Vec<(String, bool, Stats)>,
) -> std::io::Result<()> {
    let dir = root.join(relative);
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let rel = if relative.is_empty() {
            name
        } else {
            format!("{}/{}", relative, name)
        };
        if config.is_ignored(&rel) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("Cannot stat {}: {}", rel, e);
                continue;
            }
        };
        if entry
            .file_type()
            .map(|t| t.is_symlink())
            .unwrap_or(false)
        {
            debug!("Skipping symlink {}", rel);
            continue;
        }
        let stats = Stats::from_metadata(&meta);
        if meta.is_dir() {
            out.push((rel.clone(), true, stats));
            scan_dir(root, &rel, config, out)?;
        } else {
            out.push((rel, false, stats));
        }
    }
    Ok(())
}

/// Relative, normalized form of an event path, or `None` when outside the
/// root or ignored.
fn relative_path(config: &SyncConfig, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(&config.sync_path).ok()?;
    let rel = normalize_separators(&rel.to_string_lossy());
    if rel.is_empty() || config.is_ignored(&rel) {
        return None;
    }
    Some(rel)
}

async fn handle_notify_event(
    config: &SyncConfig,
    dirs: &mut HashSet<String>,
    event: Event,
    tx: &mpsc::Sender<FsEvent>,
) -> Result<(), ()> {
    // Rename events carry (from, to) pairs when the platform can tell
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if event.paths.len() == 2 {
            if let Some(rel) = relative_path(config, &event.paths[0]) {
                send_unlink(dirs, rel, tx).await?;
            }
            if let Some(rel) = relative_path(config, &event.paths[1]) {
                send_add(config, dirs, rel, &event.paths[1], tx).await?;
            }
            return Ok(());
        }
    }

    for path in &event.paths {
        let Some(rel) = relative_path(config, path) else {
            continue;
        };

        match &event.kind {
            EventKind::Create(_) => send_add(config, dirs, rel, path, tx).await?,
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => send_unlink(dirs, rel, tx).await?,
                RenameMode::To => send_add(config, dirs, rel, path, tx).await?,
                _ => {
                    // Direction unknown: decide from the filesystem
                    if path.exists() {
                        send_add(config, dirs, rel, path, tx).await?;
                    } else {
                        send_unlink(dirs, rel, tx).await?;
                    }
                }
            },
            EventKind::Modify(_) => {
                // Content or metadata changed; directories are noise here
                match std::fs::symlink_metadata(path) {
                    Ok(m) if m.is_file() => {}
                    _ => continue,
                }
                let meta = match wait_for_file_stability(path, &config.await_write_finish).await {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("File vanished while stabilizing {}: {}", rel, e);
                        continue;
                    }
                };
                let stats = Stats::from_metadata(&meta);
                tx.send(FsEvent::Change { path: rel, stats })
                    .await
                    .map_err(|_| ())?;
            }
            EventKind::Remove(_) => send_unlink(dirs, rel, tx).await?,
            _ => {}
        }
    }
    Ok(())
}

async fn send_add(
    config: &SyncConfig,
    dirs: &mut HashSet<String>,
    rel: String,
    path: &Path,
    tx: &mpsc::Sender<FsEvent>,
) -> Result<(), ()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) => {
            debug!("Path vanished before stat {}: {}", rel, e);
            return Ok(());
        }
    };
    if meta.file_type().is_symlink() {
        debug!("Skipping symlink {}", rel);
        return Ok(());
    }

    if meta.is_dir() {
        dirs.insert(rel.clone());
        let stats = Stats::from_metadata(&meta);
        tx.send(FsEvent::AddDir { path: rel, stats })
            .await
            .map_err(|_| ())
    } else {
        let meta = match wait_for_file_stability(path, &config.await_write_finish).await {
            Ok(m) => m,
            Err(e) => {
                debug!("File vanished while stabilizing {}: {}", rel, e);
                return Ok(());
            }
        };
        let stats = Stats::from_metadata(&meta);
        tx.send(FsEvent::AddFile { path: rel, stats })
            .await
            .map_err(|_| ())
    }
}

async fn send_unlink(
    dirs: &mut HashSet<String>,
    rel: String,
    tx: &mpsc::Sender<FsEvent>,
) -> Result<(), ()> {
    let event = if dirs.remove(&rel) {
        FsEvent::UnlinkDir { path: rel }
    } else {
        FsEvent::UnlinkFile { path: rel }
    };
    tx.send(event).await.map_err(|_| ())
}
