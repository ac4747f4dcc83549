//! RocksDB wrapper

use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options};
use std::path::Path;
use std::sync::Arc;

/// Column family names
pub mod cf {
    /// Node metadata (identity seeds)
    pub const META: &str = "meta";
    /// Directory peer registry
    pub const REGISTRY: &str = "registry";
    /// Open auction records, keyed by item
    pub const AUCTIONS: &str = "auctions";
}

/// All column family names
pub const ALL_CFS: &[&str] = &[cf::META, cf::REGISTRY, cf::AUCTIONS];

type RocksDB = DBWithThreadMode<MultiThreaded>;

/// Database configuration
#[derive(Clone, Debug)]
pub struct DbConfig {
    /// Create database if missing
    pub create_if_missing: bool,
    /// Maximum number of open files
    pub max_open_files: i32,
    /// Write buffer size
    pub write_buffer_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_open_files: 128,
            write_buffer_size: 8 * 1024 * 1024, // 8MB
        }
    }
}

/// RocksDB wrapper with column family support
pub struct Database {
    db: Arc<RwLock<Option<RocksDB>>>,
    path: String,
}

impl Database {
    /// Create a new database instance (not yet opened)
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            db: Arc::new(RwLock::new(None)),
            path: path.as_ref().to_string_lossy().to_string(),
        }
    }

    /// Open the database with default config
    pub fn open(&self) -> StorageResult<()> {
        self.open_with_config(DbConfig::default())
    }

    /// Open the database with custom config
    pub fn open_with_config(&self, config: DbConfig) -> StorageResult<()> {
        let mut db_guard = self.db.write();
        if db_guard.is_some() {
            return Err(StorageError::AlreadyOpen);
        }

        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = RocksDB::open_cf_descriptors(&opts, &self.path, cf_descriptors)?;
        tracing::debug!(path = %self.path, "database opened");
        *db_guard = Some(db);
        Ok(())
    }

    /// Close the database
    pub fn close(&self) {
        let mut db_guard = self.db.write();
        *db_guard = None;
    }

    /// Check if database is open
    pub fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    /// Get a value from a column family
    pub fn get(&self, cf_name: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;
        Ok(db.get_cf(&cf, key)?)
    }

    /// Put a value to a column family
    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;
        db.put_cf(&cf, key, value)?;
        Ok(())
    }

    /// Delete a value from a column family
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> StorageResult<()> {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;
        db.delete_cf(&cf, key)?;
        Ok(())
    }

    /// List all keys of a column family, in key order
    pub fn keys(&self, cf_name: &str) -> StorageResult<Vec<Vec<u8>>> {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;
        let mut keys = Vec::new();
        for entry in db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (key, _) = entry?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Get column family handle
    fn get_cf<'a>(&self, db: &'a RocksDB, name: &str) -> StorageResult<Arc<BoundColumnFamily<'a>>> {
        db.cf_handle(name)
            .ok_or_else(|| StorageError::InvalidColumnFamily(name.to_string()))
    }

    /// Get database path
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            path: self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("db"));
        db.open().unwrap();
        (dir, db)
    }

    #[test]
    fn test_open_close() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("db"));

        assert!(!db.is_open());
        db.open().unwrap();
        assert!(db.is_open());
        db.close();
        assert!(!db.is_open());
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, db) = open_temp();

        db.put(cf::AUCTIONS, b"widget", b"{}").unwrap();
        assert_eq!(db.get(cf::AUCTIONS, b"widget").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(db.get(cf::AUCTIONS, b"missing").unwrap(), None);

        db.delete(cf::AUCTIONS, b"widget").unwrap();
        assert!(db.get(cf::AUCTIONS, b"widget").unwrap().is_none());

        // Deleting a key that doesn't exist should not error
        db.delete(cf::AUCTIONS, b"widget").unwrap();
    }

    #[test]
    fn test_not_open_error() {
        let db = Database::new("/tmp/bidmesh_not_opened");
        assert!(matches!(db.get(cf::META, b"key"), Err(StorageError::NotOpen)));
        assert!(matches!(db.put(cf::META, b"key", b"v"), Err(StorageError::NotOpen)));
        assert!(matches!(db.delete(cf::META, b"key"), Err(StorageError::NotOpen)));
    }

    #[test]
    fn test_already_open_error() {
        let (_dir, db) = open_temp();
        assert!(matches!(db.open(), Err(StorageError::AlreadyOpen)));
    }

    #[test]
    fn test_unknown_column_family() {
        let (_dir, db) = open_temp();
        let result = db.get("accounts", b"key");
        assert!(matches!(result, Err(StorageError::InvalidColumnFamily(_))));
    }

    #[test]
    fn test_reopen_database() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("db"));

        db.open().unwrap();
        db.put(cf::META, b"node-seed", &[7u8; 32]).unwrap();
        db.close();

        db.open().unwrap();
        assert_eq!(db.get(cf::META, b"node-seed").unwrap(), Some(vec![7u8; 32]));
    }

    #[test]
    fn test_column_family_isolation() {
        let (_dir, db) = open_temp();

        db.put(cf::META, b"same_key", b"meta").unwrap();
        db.put(cf::AUCTIONS, b"same_key", b"auction").unwrap();

        db.delete(cf::META, b"same_key").unwrap();
        assert!(db.get(cf::META, b"same_key").unwrap().is_none());
        assert_eq!(db.get(cf::AUCTIONS, b"same_key").unwrap(), Some(b"auction".to_vec()));
    }

    #[test]
    fn test_keys_in_order() {
        let (_dir, db) = open_temp();

        db.put(cf::AUCTIONS, b"vase", b"1").unwrap();
        db.put(cf::AUCTIONS, b"lamp", b"2").unwrap();
        db.put(cf::REGISTRY, b"other", b"3").unwrap();

        let keys = db.keys(cf::AUCTIONS).unwrap();
        assert_eq!(keys, vec![b"lamp".to_vec(), b"vase".to_vec()]);
    }

    #[test]
    fn test_database_clone_shares_handle() {
        let (_dir, db) = open_temp();
        let db_clone = db.clone();

        db.put(cf::REGISTRY, b"public-keys", b"[]").unwrap();
        assert_eq!(db_clone.get(cf::REGISTRY, b"public-keys").unwrap(), Some(b"[]".to_vec()));
    }

    #[test]
    fn test_db_config_default() {
        let config = DbConfig::default();
        assert!(config.create_if_missing);
        assert_eq!(config.max_open_files, 128);
    }
}
