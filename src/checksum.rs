//! Serialized content hashing for local files.
//!
//! Hash jobs run strictly one at a time, in enqueue order: concurrent
//! whole-file reads thrash spinning disks, and sequential reads are
//! measurably faster. The outstanding-job counter is shared with the
//! local watcher, which delays delete finalization while hashes are in
//! flight so a re-appearing file can still claim a pending deletion as
//! a move.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_types::ChecksumError;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct HashJob {
    path: PathBuf,
    reply: oneshot::Sender<Result<String, ChecksumError>>,
}

/// Single-worker FIFO queue computing base64 MD5 digests of local files.
#[derive(Clone)]
pub struct ChecksumQueue {
    tx: mpsc::UnboundedSender<HashJob>,
    in_flight: Arc<AtomicUsize>,
}

impl ChecksumQueue {
    /// Start the worker task and return a handle to the queue.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        tokio::spawn(worker(rx, in_flight.clone()));
        Self { tx, in_flight }
    }

    /// Enqueue a file for hashing.
    ///
    /// The returned receiver resolves with the base64 MD5 digest, or with
    /// the hashing error. The in-flight counter is incremented before this
    /// returns and released once the digest (or error) is delivered.
    pub fn enqueue(&self, path: PathBuf) -> oneshot::Receiver<Result<String, ChecksumError>> {
        let (reply, rx) = oneshot::channel();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(HashJob { path, reply }).is_err() {
            // Worker is gone (shutdown); release the slot we just took.
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        rx
    }

    /// Number of jobs enqueued but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

async fn worker(mut rx: mpsc::UnboundedReceiver<HashJob>, in_flight: Arc<AtomicUsize>) {
    while let Some(job) = rx.recv().await {
        let result = hash_file(&job.path).await;
        if let Err(e) = &result {
            warn!("Checksum failed for {}: {}", job.path.display(), e);
        } else {
            debug!("Checksummed {}", job.path.display());
        }
        // Release the slot before replying so a caller that observes the
        // digest never sees its own job still counted as in flight.
        in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = job.reply.send(result);
    }
}

/// Compute the base64 MD5 digest of a file, reading in 8 KiB chunks.
pub async fn hash_file(path: &Path) -> Result<String, ChecksumError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(BASE64.encode(hasher.finalize()))
}

/// Compute the base64 MD5 digest of in-memory content.
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    BASE64.encode(hasher.finalize())
}
