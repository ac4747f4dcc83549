//! Storage handles owned by one process

use crate::error::NodeResult;
use bidmesh_storage::{cf, ColumnStore, Database, KeyValueStore, MemoryStore};
use std::path::Path;
use std::sync::Arc;

/// The column families a directory or node works with
#[derive(Clone)]
pub struct Stores {
    /// Identity seed
    pub meta: Arc<dyn KeyValueStore>,
    /// Directory registry
    pub registry: Arc<dyn KeyValueStore>,
    /// Open auctions by item
    pub auctions: Arc<dyn KeyValueStore>,
}

impl Stores {
    /// Open (creating if needed) the database under `datadir`
    pub fn open(datadir: &Path) -> NodeResult<Self> {
        std::fs::create_dir_all(datadir)?;

        let db = Database::new(datadir.join("db"));
        db.open()?;
        tracing::info!("Opened database at {}", db.path());

        Ok(Self {
            meta: Arc::new(ColumnStore::new(db.clone(), cf::META)),
            registry: Arc::new(ColumnStore::new(db.clone(), cf::REGISTRY)),
            auctions: Arc::new(ColumnStore::new(db, cf::AUCTIONS)),
        })
    }

    /// Throwaway in-memory stores
    pub fn in_memory() -> Self {
        Self {
            meta: Arc::new(MemoryStore::new()),
            registry: Arc::new(MemoryStore::new()),
            auctions: Arc::new(MemoryStore::new()),
        }
    }

    /// On-disk stores when `datadir` is set, in-memory otherwise
    pub fn for_datadir(datadir: Option<&Path>) -> NodeResult<Self> {
        match datadir {
            Some(path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }
}
