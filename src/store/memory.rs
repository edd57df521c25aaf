use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{Batch, Mutation, StorageBackend, StorageError, VersionedRecord};

/// Process-local backend. One mutex over an ordered map, so a batch commit is
/// trivially atomic and prefix scans come back in key order.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, (Vec<u8>, u64)>>,
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a backend error until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Backend("memory backend is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StorageError> {
        self.ensure_online()?;
        let data = self.data.lock();
        Ok(data.get(key).map(|(bytes, version)| VersionedRecord {
            key: key.to_string(),
            data: bytes.clone(),
            version: *version,
        }))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<VersionedRecord>, StorageError> {
        self.ensure_online()?;
        let data = self.data.lock();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (bytes, version))| VersionedRecord {
                key: k.clone(),
                data: bytes.clone(),
                version: *version,
            })
            .collect())
    }

    async fn scan_range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<VersionedRecord>, StorageError> {
        self.ensure_online()?;
        if start >= end {
            return Ok(Vec::new());
        }
        let data = self.data.lock();
        Ok(data
            .range(start.to_string()..end.to_string())
            .map(|(k, (bytes, version))| VersionedRecord {
                key: k.clone(),
                data: bytes.clone(),
                version: *version,
            })
            .collect())
    }

    async fn commit(&self, batch: Batch) -> Result<(), StorageError> {
        self.ensure_online()?;
        let mut data = self.data.lock();

        for m in &batch.mutations {
            let current = data.get(m.key()).map(|(_, v)| *v);
            if !m.expect().holds(current) {
                return Err(StorageError::Conflict {
                    key: m.key().to_string(),
                });
            }
        }

        for m in batch.mutations {
            match m {
                Mutation::Put {
                    key, data: bytes, ..
                } => {
                    let next = data.get(&key).map(|(_, v)| v + 1).unwrap_or(1);
                    data.insert(key, (bytes, next));
                }
                Mutation::Delete { key, .. } => {
                    data.remove(&key);
                }
                Mutation::Check { .. } => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::Expect;

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        let mut batch = Batch::new();
        batch.put("a", b"1".to_vec(), Expect::Absent);
        backend.commit(batch).await.unwrap();

        let mut batch = Batch::new();
        batch
            .put("b", b"2".to_vec(), Expect::Absent)
            .put("a", b"x".to_vec(), Expect::Version(7));
        let err = backend.commit(batch).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { key } if key == "a"));
        assert!(backend.get("b").await.unwrap().is_none());

        let a = backend.get("a").await.unwrap().unwrap();
        assert_eq!(a.version, 1);
        assert_eq!(a.data, b"1");
    }

    #[tokio::test]
    async fn scan_is_prefix_bounded_and_ordered() {
        let backend = MemoryBackend::new();
        let mut batch = Batch::new();
        batch
            .put("jobs/2", vec![], Expect::Any)
            .put("jobs/1", vec![], Expect::Any)
            .put("jobsx/1", vec![], Expect::Any)
            .put("job", vec![], Expect::Any);
        backend.commit(batch).await.unwrap();

        let keys: Vec<String> = backend
            .scan_prefix("jobs/")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["jobs/1", "jobs/2"]);
    }

    #[tokio::test]
    async fn offline_backend_errors() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert!(matches!(
            backend.get("x").await,
            Err(StorageError::Backend(_))
        ));
        backend.set_offline(false);
        assert!(backend.get("x").await.unwrap().is_none());
    }
}
