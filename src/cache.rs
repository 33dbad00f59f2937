//! Path-keyed reuse of loaded unified tables within one run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::ingest::read_table;
use crate::record::UnifiedTable;

/// Tables are never invalidated automatically; call [`TableCache::evict`] or
/// [`TableCache::clear`] when a file changes on disk.
#[derive(Debug, Default)]
pub struct TableCache {
    tables: HashMap<PathBuf, Arc<UnifiedTable>>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached table for `path`, reading it on first use.
    pub fn load(&mut self, path: &Path) -> Result<Arc<UnifiedTable>> {
        if let Some(table) = self.tables.get(path) {
            debug!("cache hit: {}", path.display());
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(read_table(path)?);
        self.tables.insert(path.to_path_buf(), Arc::clone(&table));
        Ok(table)
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, table: UnifiedTable) -> Arc<UnifiedTable> {
        let table = Arc::new(table);
        self.tables.insert(path.into(), Arc::clone(&table));
        table
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.tables.contains_key(path)
    }

    pub fn evict(&mut self, path: &Path) -> bool {
        self.tables.remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
