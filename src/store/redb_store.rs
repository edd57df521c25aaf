use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::backend::{Batch, Mutation, StorageBackend, StorageError, VersionedRecord};

/// Key: record key. Value: 8-byte big-endian version followed by the record bytes.
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Durable backend on a single redb file.
///
/// redb serialises write transactions, so checking every expectation and
/// applying the puts inside one write transaction makes a batch atomic.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

fn backend_err(e: impl Into<redb::Error>) -> StorageError {
    StorageError::Backend(e.into().to_string())
}

fn split_version(raw: &[u8]) -> Result<(u64, &[u8]), StorageError> {
    if raw.len() < 8 {
        return Err(StorageError::Backend("corrupt record header".to_string()));
    }
    let (head, body) = raw.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(head);
    Ok((u64::from_be_bytes(buf), body))
}

fn encode(version: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(data);
    out
}

impl RedbBackend {
    /// Opens or creates the database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Backend(format!("{}: {e}", parent.display())))?;
            }
        }

        let db = Database::create(&path).map_err(backend_err)?;
        let txn = db.begin_write().map_err(backend_err)?;
        {
            txn.open_table(RECORDS).map_err(backend_err)?;
        }
        txn.commit().map_err(backend_err)?;

        tracing::info!(path = %path.display(), "Opened redb store");
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::Backend(format!("store worker failed: {e}")))?
    }
}

fn commit_batch(db: &Database, batch: Batch) -> Result<(), StorageError> {
    let txn = db.begin_write().map_err(backend_err)?;
    let mut conflict = None;
    {
        let mut table = txn.open_table(RECORDS).map_err(backend_err)?;

        for m in &batch.mutations {
            let current = match table.get(m.key()).map_err(backend_err)? {
                Some(guard) => Some(split_version(guard.value())?.0),
                None => None,
            };
            if !m.expect().holds(current) {
                conflict = Some(m.key().to_string());
                break;
            }
        }

        if conflict.is_none() {
            for m in &batch.mutations {
                match m {
                    Mutation::Put { key, data, .. } => {
                        let next = match table.get(key.as_str()).map_err(backend_err)? {
                            Some(guard) => split_version(guard.value())?.0 + 1,
                            None => 1,
                        };
                        let raw = encode(next, data);
                        table
                            .insert(key.as_str(), raw.as_slice())
                            .map_err(backend_err)?;
                    }
                    Mutation::Delete { key, .. } => {
                        table.remove(key.as_str()).map_err(backend_err)?;
                    }
                    Mutation::Check { .. } => {}
                }
            }
        }
    }

    if let Some(key) = conflict {
        txn.abort().map_err(backend_err)?;
        return Err(StorageError::Conflict { key });
    }
    txn.commit().map_err(backend_err)?;
    Ok(())
}

#[async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StorageError> {
        let key = key.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend_err)?;
            let table = txn.open_table(RECORDS).map_err(backend_err)?;
            let record = match table.get(key.as_str()).map_err(backend_err)? {
                Some(guard) => {
                    let (version, data) = split_version(guard.value())?;
                    Some(VersionedRecord {
                        key: key.clone(),
                        data: data.to_vec(),
                        version,
                    })
                }
                None => None,
            };
            Ok(record)
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<VersionedRecord>, StorageError> {
        let prefix = prefix.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend_err)?;
            let table = txn.open_table(RECORDS).map_err(backend_err)?;
            let mut out = Vec::new();
            for item in table.range(prefix.as_str()..).map_err(backend_err)? {
                let (key, value) = item.map_err(backend_err)?;
                let key = key.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                let (version, data) = split_version(value.value())?;
                out.push(VersionedRecord {
                    key: key.to_string(),
                    data: data.to_vec(),
                    version,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn scan_range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<VersionedRecord>, StorageError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let (start, end) = (start.to_string(), end.to_string());
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend_err)?;
            let table = txn.open_table(RECORDS).map_err(backend_err)?;
            let mut out = Vec::new();
            for item in table
                .range(start.as_str()..end.as_str())
                .map_err(backend_err)?
            {
                let (key, value) = item.map_err(backend_err)?;
                let (version, data) = split_version(value.value())?;
                out.push(VersionedRecord {
                    key: key.value().to_string(),
                    data: data.to_vec(),
                    version,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn commit(&self, batch: Batch) -> Result<(), StorageError> {
        self.blocking(move |db| commit_batch(db, batch)).await
    }
}
