//! The metadata journal.
//!
//! A redb-backed, multi-version store of document metadata keyed by
//! normalized path id. Every write archives the replaced revision, so the
//! merge reconciler can look back at what a side last observed. The one
//! essential contract is atomicity of [`MetadataStore::bulk_put`]: moves
//! and recursive deletes commit a tombstone and its replacement as a
//! single redb write transaction.

use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use std::path::Path;
use std::sync::Arc;
use tandem_types::{Document, StoreError};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

// Table definitions
const DOCS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("docs");
const REVS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("revs");
const CHECKSUMS_TABLE: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("checksums");

/// Separator between id and revision token in the history table key.
/// NUL cannot appear in a path, so prefix scans stay unambiguous.
const REV_KEY_SEP: char = '\0';

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Numeric prefix of a revision token ("3-9f2c..." -> 3).
fn rev_number(rev: &str) -> u32 {
    rev.split('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Next revision token after `prev`.
fn next_rev(prev: Option<&str>) -> String {
    let n = prev.map(rev_number).unwrap_or(0) + 1;
    format!("{}-{}", n, Uuid::new_v4().simple())
}

/// Persistent journal of document metadata.
pub struct MetadataStore {
    db: Arc<RwLock<Database>>,
}

impl MetadataStore {
    /// Create or open a journal at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(db_err)?;
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Get a document by id. Absence is not an error.
    pub async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let db = self.db.read().await;
        let read_txn = db.begin_read().map_err(db_err)?;

        // Table missing means nothing was ever written
        let table = match read_txn.open_table(DOCS_TABLE) {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };

        match table.get(id).map_err(db_err)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    /// Write one document, enforcing the revision precondition.
    ///
    /// Returns the stored document carrying its new revision token.
    pub async fn put(&self, doc: Document) -> Result<Document, StoreError> {
        let mut docs = self.bulk_put(vec![doc]).await?;
        docs.pop()
            .ok_or_else(|| StoreError::Database("write returned no document".to_string()))
    }

    /// Atomic multi-document write; all or nothing.
    ///
    /// Every document's `rev` must match the current journal entry (or be
    /// `None` for a fresh id), otherwise the whole batch fails with
    /// [`StoreError::RevConflict`] and nothing is written.
    pub async fn bulk_put(&self, docs: Vec<Document>) -> Result<Vec<Document>, StoreError> {
        let db = self.db.write().await;
        let write_txn = db.begin_write().map_err(db_err)?;

        let mut stored = Vec::with_capacity(docs.len());
        {
            let mut table = write_txn.open_table(DOCS_TABLE).map_err(db_err)?;
            let mut revs = write_txn.open_table(REVS_TABLE).map_err(db_err)?;
            let mut checksums = write_txn
                .open_multimap_table(CHECKSUMS_TABLE)
                .map_err(db_err)?;

            for mut doc in docs {
                let current: Option<Document> = match table.get(doc.id.as_str()).map_err(db_err)? {
                    Some(value) => Some(serde_json::from_str(value.value())?),
                    None => None,
                };

                let current_rev = current.as_ref().and_then(|d| d.rev.clone());
                if doc.rev != current_rev {
                    return Err(StoreError::RevConflict {
                        id: doc.id.clone(),
                        expected: doc.rev.clone(),
                        found: current_rev,
                    });
                }

                // Archive the replaced revision and unindex its checksum
                if let Some(prev) = &current {
                    if let Some(prev_rev) = &prev.rev {
                        let key = format!("{}{}{}", prev.id, REV_KEY_SEP, prev_rev);
                        let json = serde_json::to_string(prev)?;
                        revs.insert(key.as_str(), json.as_str()).map_err(db_err)?;
                    }
                    if !prev.deleted {
                        if let Some(sum) = prev.checksum() {
                            checksums.remove(sum, prev.id.as_str()).map_err(db_err)?;
                        }
                    }
                }

                doc.rev = Some(next_rev(current_rev.as_deref()));

                if !doc.deleted {
                    if let Some(sum) = doc.checksum() {
                        checksums.insert(sum, doc.id.as_str()).map_err(db_err)?;
                    }
                }

                let json = serde_json::to_string(&doc)?;
                table
                    .insert(doc.id.as_str(), json.as_str())
                    .map_err(db_err)?;
                stored.push(doc);
            }
        }

        write_txn.commit().map_err(db_err)?;
        debug!("Committed {} document(s)", stored.len());
        Ok(stored)
    }

    /// All documents whose id starts with `prefix + "/"`, at any depth,
    /// ordered by id ascending. An empty prefix returns the whole journal.
    pub async fn by_recursive_path(&self, prefix: &str) -> Result<Vec<Document>, StoreError> {
        let db = self.db.read().await;
        let read_txn = db.begin_read().map_err(db_err)?;

        let table = match read_txn.open_table(DOCS_TABLE) {
            Ok(t) => t,
            Err(_) => return Ok(Vec::new()),
        };

        let mut docs = Vec::new();
        if prefix.is_empty() {
            for entry in table.iter().map_err(db_err)? {
                let (_, value) = entry.map_err(db_err)?;
                docs.push(serde_json::from_str(value.value())?);
            }
        } else {
            // '/' is 0x2F; '0' is the next byte, so this range covers
            // exactly the keys starting with `prefix + "/"`.
            let start = format!("{}/", prefix);
            let end = format!("{}0", prefix);
            let range = table.range(start.as_str()..end.as_str()).map_err(db_err)?;
            for entry in range {
                let (_, value) = entry.map_err(db_err)?;
                docs.push(serde_json::from_str(value.value())?);
            }
        }
        Ok(docs)
    }

    /// Live documents whose content hash equals `checksum`.
    pub async fn by_checksum(&self, checksum: &str) -> Result<Vec<Document>, StoreError> {
        let db = self.db.read().await;
        let read_txn = db.begin_read().map_err(db_err)?;

        let index = match read_txn.open_multimap_table(CHECKSUMS_TABLE) {
            Ok(t) => t,
            Err(_) => return Ok(Vec::new()),
        };
        let table = match read_txn.open_table(DOCS_TABLE) {
            Ok(t) => t,
            Err(_) => return Ok(Vec::new()),
        };

        let mut docs = Vec::new();
        for id in index.get(checksum).map_err(db_err)? {
            let id = id.map_err(db_err)?;
            if let Some(value) = table.get(id.value()).map_err(db_err)? {
                docs.push(serde_json::from_str(value.value())?);
            }
        }
        Ok(docs)
    }

    /// The revision of `id` (current one included) written when a side
    /// recorded the given short rev.
    ///
    /// Side counters advance in lockstep with revision numbers at a given
    /// id, so the revision numbered `short_rev` is the version that side
    /// last observed.
    pub async fn previous_rev(
        &self,
        id: &str,
        short_rev: u32,
    ) -> Result<Option<Document>, StoreError> {
        let db = self.db.read().await;
        let read_txn = db.begin_read().map_err(db_err)?;

        let mut revisions: Vec<Document> = Vec::new();

        if let Ok(table) = read_txn.open_table(DOCS_TABLE) {
            if let Some(value) = table.get(id).map_err(db_err)? {
                revisions.push(serde_json::from_str(value.value())?);
            }
        }

        if let Ok(revs) = read_txn.open_table(REVS_TABLE) {
            let start = format!("{}{}", id, REV_KEY_SEP);
            let end = format!("{}{}", id, '\u{1}');
            for entry in revs.range(start.as_str()..end.as_str()).map_err(db_err)? {
                let (_, value) = entry.map_err(db_err)?;
                revisions.push(serde_json::from_str(value.value())?);
            }
        }

        Ok(revisions
            .into_iter()
            .find(|d| d.rev.as_deref().map(rev_number) == Some(short_rev)))
    }
}
