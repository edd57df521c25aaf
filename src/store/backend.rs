//! Raw key-value backend contract.
//!
//! Backends know nothing about jobs or tasks. They store opaque bytes under
//! string keys, version every record, and apply batches of conditional writes
//! atomically. Domain rules live in [`Store`](super::Store).

use async_trait::async_trait;
use thiserror::Error;

/// A stored value with its per-key version. Versions start at 1 and grow by
/// one on every write to that key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub key: String,
    pub data: Vec<u8>,
    pub version: u64,
}

/// Precondition attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Key must not exist.
    Absent,
    /// Key must exist at exactly this version.
    Version(u64),
    /// No precondition.
    Any,
}

impl Expect {
    pub fn holds(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (Expect::Any, _) => true,
            (Expect::Absent, None) => true,
            (Expect::Version(want), Some(have)) => *want == have,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mutation {
    Put {
        key: String,
        data: Vec<u8>,
        expect: Expect,
    },
    Delete { key: String, expect: Expect },
    /// Guard only: the batch fails unless the expectation holds, nothing is written.
    Check { key: String, expect: Expect },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Check { key, .. } => key,
        }
    }

    pub fn expect(&self) -> Expect {
        match self {
            Mutation::Put { expect, .. }
            | Mutation::Delete { expect, .. }
            | Mutation::Check { expect, .. } => *expect,
        }
    }
}

/// All-or-nothing group of mutations.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub mutations: Vec<Mutation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, data: Vec<u8>, expect: Expect) -> &mut Self {
        self.mutations.push(Mutation::Put {
            key: key.into(),
            data,
            expect,
        });
        self
    }

    /// Removes `key`; a missing key satisfies `Expect::Any`.
    pub fn delete(&mut self, key: impl Into<String>, expect: Expect) -> &mut Self {
        self.mutations.push(Mutation::Delete {
            key: key.into(),
            expect,
        });
        self
    }

    pub fn check(&mut self, key: impl Into<String>, expect: Expect) -> &mut Self {
        self.mutations.push(Mutation::Check {
            key: key.into(),
            expect,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// An expectation in the batch did not hold; nothing was written.
    #[error("conditional write failed on {key}")]
    Conflict { key: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StorageError>;

    /// All records whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<VersionedRecord>, StorageError>;

    /// Records with `start <= key < end`, in key order.
    async fn scan_range(&self, start: &str, end: &str)
        -> Result<Vec<VersionedRecord>, StorageError>;

    /// Applies every mutation iff every expectation holds at commit time.
    ///
    /// On [`StorageError::Conflict`] the store is unchanged.
    async fn commit(&self, batch: Batch) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expectations() {
        assert!(Expect::Absent.holds(None));
        assert!(!Expect::Absent.holds(Some(1)));
        assert!(Expect::Version(3).holds(Some(3)));
        assert!(!Expect::Version(3).holds(Some(4)));
        assert!(!Expect::Version(1).holds(None));
        assert!(Expect::Any.holds(None));
        assert!(Expect::Any.holds(Some(9)));
    }
}
