use crate::cache::Cache;
use crate::comparator::Comparator;
use crate::env::{table_file_name, Storage};
use crate::options::{Options, ReadOptions};
use crate::sstable::reader::{BlockCache, Table, TableIterator};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Maps table file numbers to open readers, bounded by `max_open_files`.
/// Shared by the read path and compaction.
pub struct TableCache {
    storage: Arc<dyn Storage>,
    db_path: PathBuf,
    options: Options,
    cmp: Arc<dyn Comparator>,
    tables: Cache<u64, Arc<Table>>,
    block_cache: Option<Arc<BlockCache>>,
}

impl TableCache {
    pub fn new(
        storage: Arc<dyn Storage>,
        db_path: PathBuf,
        options: Options,
        cmp: Arc<dyn Comparator>,
    ) -> TableCache {
        let block_cache = if options.block_cache_capacity > 0 {
            Some(Arc::new(Cache::new(options.block_cache_capacity)))
        } else {
            None
        };
        let capacity = options.max_open_files.max(1);
        TableCache {
            storage,
            db_path,
            options,
            cmp,
            tables: Cache::new(capacity),
            block_cache,
        }
    }

    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.get(&file_number) {
            return Ok(table);
        }
        let path = table_file_name(&self.db_path, file_number);
        let file = self.storage.open_random_access(&path)?;
        let table = Arc::new(Table::open(
            self.options.clone(),
            self.cmp.clone(),
            file,
            file_size,
            file_number,
            self.block_cache.clone(),
        )?);
        self.tables.insert(file_number, table.clone());
        Ok(table)
    }

    pub fn get(
        &self,
        ro: &ReadOptions,
        file_number: u64,
        file_size: u64,
        ikey: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        table.get(ro, ikey)
    }

    pub fn iter(
        &self,
        ro: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<TableIterator> {
        let table = self.find_table(file_number, file_size)?;
        Ok(table.iter(ro.clone()))
    }

    /// Drops the cached reader and any cached blocks for a deleted file.
    pub fn evict(&self, file_number: u64) {
        self.tables.erase(&file_number);
        if let Some(cache) = &self.block_cache {
            cache.erase_matching(|&(file, _)| file == file_number);
        }
    }
}
