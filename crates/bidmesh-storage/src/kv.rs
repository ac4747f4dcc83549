//! String-keyed key-value stores

use crate::db::Database;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Durable mapping from string keys to byte values.
///
/// Object safe so nodes can hold an `Arc<dyn KeyValueStore>` and swap the
/// RocksDB backend for [`MemoryStore`] in tests.
pub trait KeyValueStore: Send + Sync {
    /// Get the value stored under `key`
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Remove `key`; removing a missing key is not an error
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// All keys currently stored, in ascending order
    fn keys(&self) -> StorageResult<Vec<String>>;
}

/// JSON helpers for any [`KeyValueStore`]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Get and decode a JSON value
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Deserialization(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    /// Encode and store a JSON value
    fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StorageError::Serialization(format!("{}: {}", key, e)))?;
        self.set(key, &bytes)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// One RocksDB column family viewed as a [`KeyValueStore`]
#[derive(Clone)]
pub struct ColumnStore {
    db: Database,
    cf_name: &'static str,
}

impl ColumnStore {
    /// Create a view over `cf_name` of an opened database
    pub fn new(db: Database, cf_name: &'static str) -> Self {
        Self { db, cf_name }
    }

    /// Column family backing this store
    pub fn column(&self) -> &'static str {
        self.cf_name
    }
}

impl KeyValueStore for ColumnStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.db.get(self.cf_name, key.as_bytes())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.db.put(self.cf_name, key.as_bytes(), value)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.db.delete(self.cf_name, key.as_bytes())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        self.db
            .keys(self.cf_name)?
            .into_iter()
            .map(|k| {
                String::from_utf8(k)
                    .map_err(|e| StorageError::Deserialization(format!("non-utf8 key: {}", e)))
            })
            .collect()
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}
