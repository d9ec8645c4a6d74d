//! Bidirectional sync engine core.
//!
//! Keeps a local directory tree and a remote document store consistent
//! through a persistent metadata journal. Raw filesystem events flow
//! through the local watcher into semantic operations; a symmetric remote
//! feed produces the same operations with `side = remote`; both are
//! serialized through [`prep::Prep`] into the [`merge::Merge`] reconciler,
//! the journal's only writer. A downstream synchronizer (not part of this
//! crate) reads the journal and performs the side effects.

pub mod checksum;
pub mod config;
pub mod merge;
pub mod prep;
pub mod store;
pub mod watcher;

pub use checksum::ChecksumQueue;
pub use config::SyncConfig;
pub use merge::Merge;
pub use prep::{merge_loop, Operation, Prep};
pub use store::MetadataStore;
pub use tandem_types as types;
pub use watcher::LocalWatcher;

use fs2::FileExt;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::{error, info};

/// Lock file name inside the control directory.
const SYNC_LOCK_FILENAME: &str = "lock";

/// Acquire an exclusive lock for a sync root to prevent a second engine
/// instance on the same tree. The returned handle must be kept alive for
/// the duration of the run.
pub fn acquire_sync_lock(sync_path: &Path) -> io::Result<File> {
    let control_dir = sync_path.join(config::CONTROL_DIR);
    std::fs::create_dir_all(&control_dir)?;
    let lock_path = control_dir.join(SYNC_LOCK_FILENAME);
    let lock_file = File::create(&lock_path)?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => {
            info!("Acquired sync lock for {}", sync_path.display());
            Ok(lock_file)
        }
        Err(e) => {
            error!(
                "Another engine is already running for {}: {}",
                sync_path.display(),
                e
            );
            Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("sync already running for {}", sync_path.display()),
            ))
        }
    }
}
