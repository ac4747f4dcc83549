//! # bidmesh-storage
//!
//! Durable local storage for bidmesh nodes.
//!
//! This crate provides:
//! - RocksDB backend with column families per concern
//! - A string-keyed [`KeyValueStore`] view over one column family
//! - An in-memory store for tests and ephemeral nodes
//! - JSON helpers for structured records

#![warn(missing_docs)]
#![warn(clippy::all)]

mod db;
mod error;
mod kv;

pub use db::{cf, Database, DbConfig, ALL_CFS};
pub use error::{StorageError, StorageResult};
pub use kv::{ColumnStore, KeyValueStore, KeyValueStoreExt, MemoryStore};
