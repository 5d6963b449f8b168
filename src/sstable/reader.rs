use crate::byteutils::decode_fixed32;
use crate::cache::Cache;
use crate::comparator::Comparator;
use crate::env::RandomAccessFile;
use crate::error::Error;
use crate::format;
use crate::iterator::InternalIterator;
use crate::journal::unmask_crc;
use crate::options::{CompressionType, Options, ReadOptions};
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::filter_block::FilterBlockReader;
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::BLOCK_TRAILER_SIZE;
use crate::Result;
use std::sync::Arc;

/// Cache of uncompressed blocks, keyed by (table file number, block
/// offset) so a deleted table's entries can be purged together.
pub type BlockCache = Cache<(u64, u64), Arc<Block>>;

/// An open table file: parsed footer, resident index and filter blocks,
/// and on-demand data blocks.
pub struct Table {
    cmp: Arc<dyn Comparator>,
    file: Arc<dyn RandomAccessFile>,
    file_number: u64,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
    metaindex_handle: BlockHandle,
    block_cache: Option<Arc<BlockCache>>,
}

/// Reads a block payload, verifies its trailer and decompresses it.
fn read_block_contents(
    file: &dyn RandomAccessFile,
    handle: BlockHandle,
    verify_checksums: bool,
) -> Result<Vec<u8>> {
    let mut raw = vec![0u8; handle.size as usize + BLOCK_TRAILER_SIZE];
    file.read_at(handle.offset, &mut raw)?;

    let payload_len = handle.size as usize;
    let block_type = raw[payload_len];
    if verify_checksums {
        let stored = unmask_crc(decode_fixed32(&raw[payload_len + 1..]));
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw[..payload_len + 1]);
        if stored != hasher.finalize() {
            return Err(Error::corruption("block checksum mismatch"));
        }
    }

    match CompressionType::from_u8(block_type) {
        Some(CompressionType::None) => {
            raw.truncate(payload_len);
            Ok(raw)
        }
        Some(CompressionType::Snappy) => snap::raw::Decoder::new()
            .decompress_vec(&raw[..payload_len])
            .map_err(|e| Error::Corruption(format!("snappy decompression: {}", e))),
        None => Err(Error::corruption(format!(
            "unknown block compression: {}",
            block_type
        ))),
    }
}

impl Table {
    pub fn open(
        options: Options,
        cmp: Arc<dyn Comparator>,
        file: Arc<dyn RandomAccessFile>,
        file_size: u64,
        file_number: u64,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Table> {
        if file_size < crate::sstable::footer::FOOTER_SIZE as u64 {
            return Err(Error::corruption("file too short to be a table"));
        }
        let mut footer_bytes = vec![0u8; crate::sstable::footer::FOOTER_SIZE];
        file.read_at(
            file_size - crate::sstable::footer::FOOTER_SIZE as u64,
            &mut footer_bytes,
        )?;
        let footer = Footer::decode(&footer_bytes)?;

        let index_contents = read_block_contents(file.as_ref(), footer.index_handle, true)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let mut filter = None;
        if let Some(policy) = &options.filter_policy {
            let metaindex_contents =
                read_block_contents(file.as_ref(), footer.metaindex_handle, true)?;
            let metaindex = Arc::new(Block::new(metaindex_contents)?);
            let mut iter = metaindex.iter(Arc::new(crate::comparator::BytewiseComparator));
            let key = format!("filter.{}", policy.name());
            iter.seek(key.as_bytes());
            if iter.valid() && iter.key() == key.as_bytes() {
                let (handle, _) = BlockHandle::decode_from(iter.value())?;
                let data = read_block_contents(file.as_ref(), handle, true)?;
                filter = Some(FilterBlockReader::new(policy.clone(), data));
            }
        }

        Ok(Table {
            cmp,
            file,
            file_number,
            index_block,
            filter,
            metaindex_handle: footer.metaindex_handle,
            block_cache,
        })
    }

    fn block(&self, handle: BlockHandle, ro: &ReadOptions) -> Result<Arc<Block>> {
        let cache_key = (self.file_number, handle.offset);
        if let Some(cache) = &self.block_cache {
            if let Some(block) = cache.get(&cache_key) {
                return Ok(block);
            }
        }
        let contents = read_block_contents(self.file.as_ref(), handle, ro.verify_checksums)?;
        let block = Arc::new(Block::new(contents)?);
        if ro.fill_cache {
            if let Some(cache) = &self.block_cache {
                cache.insert(cache_key, block.clone());
            }
        }
        Ok(block)
    }

    /// Point lookup: returns the first entry at or after `ikey` in the
    /// candidate data block, or `None` when the filter or index excludes
    /// the key. The caller inspects the returned internal key.
    pub fn get(&self, ro: &ReadOptions, ikey: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index_block.iter(self.cmp.clone());
        index_iter.seek(ikey);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }
        let (handle, _) = BlockHandle::decode_from(index_iter.value())?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, format::user_key(ikey)) {
                return Ok(None);
            }
        }

        let block = self.block(handle, ro)?;
        let mut iter = block.iter(self.cmp.clone());
        iter.seek(ikey);
        if iter.valid() {
            return Ok(Some((iter.key().to_vec(), iter.value().to_vec())));
        }
        iter.status()?;
        Ok(None)
    }

    /// Byte offset within the file where `ikey`'s data would live; used by
    /// range-size estimation.
    pub fn approximate_offset_of(&self, ikey: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.cmp.clone());
        index_iter.seek(ikey);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        // Past the last key: everything before the metaindex is data.
        self.metaindex_handle.offset
    }

    pub fn iter(self: &Arc<Table>, ro: ReadOptions) -> TableIterator {
        TableIterator {
            table: self.clone(),
            ro,
            index_iter: self.index_block.iter(self.cmp.clone()),
            data_iter: None,
            data_block_offset: None,
            error: None,
        }
    }
}

/// Two-level cursor: the index block positions a data-block cursor.
pub struct TableIterator {
    table: Arc<Table>,
    ro: ReadOptions,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    /// Offset of the currently loaded data block, to avoid reloading it
    /// when the index entry has not moved.
    data_block_offset: Option<u64>,
    error: Option<Error>,
}

impl TableIterator {
    fn load_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            self.data_block_offset = None;
            return;
        }
        let handle = match BlockHandle::decode_from(self.index_iter.value()) {
            Ok((handle, _)) => handle,
            Err(e) => {
                self.error.get_or_insert(e);
                self.data_iter = None;
                self.data_block_offset = None;
                return;
            }
        };
        if self.data_block_offset == Some(handle.offset) {
            return;
        }
        match self.table.block(handle, &self.ro) {
            Ok(block) => {
                self.data_iter = Some(block.iter(self.table.cmp.clone()));
                self.data_block_offset = Some(handle.offset);
            }
            Err(e) => {
                self.error.get_or_insert(e);
                self.data_iter = None;
                self.data_block_offset = None;
            }
        }
    }

    fn data_valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |d| d.valid())
    }

    fn skip_forward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.load_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.load_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_last();
            }
        }
    }
}

impl InternalIterator for TableIterator {
    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.data_block_offset = None;
        self.load_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.data_block_offset = None;
        self.load_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.load_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = &mut self.data_iter {
            data.next();
        }
        self.skip_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = &mut self.data_iter {
            data.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("key on invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("value on invalid iterator")
            .value()
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.to_background());
        }
        self.index_iter.status()?;
        if let Some(data) = &self.data_iter {
            data.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::env::{MemStorage, Storage};
    use crate::filter::BloomFilterPolicy;
    use crate::format::{pack_internal_key, ValueKind};
    use crate::sstable::TableBuilder;
    use std::path::Path;

    fn icmp() -> Arc<dyn Comparator> {
        Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn build_table(
        options: &Options,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> (MemStorage, u64) {
        let storage = MemStorage::new();
        let path = Path::new("/table.sst");
        let mut builder =
            TableBuilder::new(options.clone(), icmp(), storage.create(path).unwrap());
        for (k, v) in entries {
            builder.add(k, v).unwrap();
        }
        builder.finish(false).unwrap();
        let size = storage.file_size(path).unwrap();
        assert_eq!(size, builder.file_size());
        (storage, size)
    }

    fn open_table(storage: &MemStorage, size: u64, options: &Options) -> Arc<Table> {
        let file = storage
            .open_random_access(Path::new("/table.sst"))
            .unwrap();
        Arc::new(Table::open(options.clone(), icmp(), file, size, 1, None).unwrap())
    }

    fn sample_entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    pack_internal_key(
                        format!("key{:05}", i).as_bytes(),
                        i as u64 + 1,
                        ValueKind::Value,
                    ),
                    format!("value{}", i).into_bytes(),
                )
            })
            .collect()
    }

    fn test_options() -> Options {
        Options {
            // Small blocks force multi-block tables in tests.
            block_size: 256,
            ..Options::default()
        }
    }

    #[test]
    fn test_build_and_scan() {
        let options = test_options();
        let entries = sample_entries(500);
        let (storage, size) = build_table(&options, &entries);
        let table = open_table(&storage, size, &options);

        let mut iter = table.iter(ReadOptions::default());
        iter.seek_to_first();
        for (k, v) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
            iter.next();
        }
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_scan_backward() {
        let options = test_options();
        let entries = sample_entries(200);
        let (storage, size) = build_table(&options, &entries);
        let table = open_table(&storage, size, &options);

        let mut iter = table.iter(ReadOptions::default());
        iter.seek_to_last();
        for (k, _) in entries.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_point_get() {
        let options = test_options();
        let entries = sample_entries(300);
        let (storage, size) = build_table(&options, &entries);
        let table = open_table(&storage, size, &options);

        let ro = ReadOptions::default();
        let probe = pack_internal_key(b"key00123", u64::MAX >> 8, ValueKind::Seek);
        let (found_key, found_value) = table.get(&ro, &probe).unwrap().unwrap();
        assert_eq!(format::user_key(&found_key), b"key00123");
        assert_eq!(found_value, b"value123");

        let probe = pack_internal_key(b"key99999", u64::MAX >> 8, ValueKind::Seek);
        assert!(table.get(&ro, &probe).unwrap().is_none());
    }

    #[test]
    fn test_get_with_filter() {
        let mut options = test_options();
        options.filter_policy = Some(Arc::new(BloomFilterPolicy::default()));
        let entries = sample_entries(300);
        let (storage, size) = build_table(&options, &entries);
        let table = open_table(&storage, size, &options);

        let ro = ReadOptions::default();
        let probe = pack_internal_key(b"key00042", u64::MAX >> 8, ValueKind::Seek);
        let (found_key, _) = table.get(&ro, &probe).unwrap().unwrap();
        assert_eq!(format::user_key(&found_key), b"key00042");

        // A filtered-out key short-circuits without touching a data block.
        let probe = pack_internal_key(b"no-such-key", u64::MAX >> 8, ValueKind::Seek);
        assert!(table.get(&ro, &probe).unwrap().is_none());
    }

    #[test]
    fn test_uncompressed_table() {
        let mut options = test_options();
        options.compression = CompressionType::None;
        let entries = sample_entries(100);
        let (storage, size) = build_table(&options, &entries);
        let table = open_table(&storage, size, &options);

        let mut iter = table.iter(ReadOptions {
            verify_checksums: true,
            ..ReadOptions::default()
        });
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn test_approximate_offsets_monotonic() {
        let options = test_options();
        let entries = sample_entries(400);
        let (storage, size) = build_table(&options, &entries);
        let table = open_table(&storage, size, &options);

        let early = table.approximate_offset_of(&entries[10].0);
        let late = table.approximate_offset_of(&entries[390].0);
        assert!(early <= late);
        assert!(late <= size);
        // Past the end: close to the data size.
        let beyond =
            table.approximate_offset_of(&pack_internal_key(b"zzzz", 1, ValueKind::Seek));
        assert!(beyond >= late);
    }

    #[test]
    fn test_block_cache_reuse() {
        let options = test_options();
        let entries = sample_entries(300);
        let (storage, size) = build_table(&options, &entries);
        let file = storage
            .open_random_access(Path::new("/table.sst"))
            .unwrap();
        let cache: Arc<BlockCache> = Arc::new(Cache::new(64));
        let table = Arc::new(
            Table::open(options.clone(), icmp(), file, size, 9, Some(cache.clone())).unwrap(),
        );

        let ro = ReadOptions::default();
        let probe = pack_internal_key(b"key00007", u64::MAX >> 8, ValueKind::Seek);
        table.get(&ro, &probe).unwrap().unwrap();
        assert!(!cache.is_empty());
        // Second read hits the cache.
        table.get(&ro, &probe).unwrap().unwrap();
    }
}
