use crate::byteutils::put_fixed32;
use crate::comparator::Comparator;
use crate::env::WritableFile;
use crate::error::Error;
use crate::format;
use crate::journal::mask_crc;
use crate::options::{CompressionType, Options};
use crate::sstable::block::BlockBuilder;
use crate::sstable::filter_block::FilterBlockBuilder;
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::BLOCK_TRAILER_SIZE;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

/// Streams sorted internal-key/value pairs into a table file.
pub struct TableBuilder {
    options: Options,
    cmp: Arc<dyn Comparator>,
    file: Box<dyn WritableFile>,
    offset: u64,
    num_entries: u64,
    last_key: Vec<u8>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    /// The index entry for a finished data block is deferred until the next
    /// key arrives, so the separator can be shortened against it.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    filter_block: Option<FilterBlockBuilder>,
    finished: bool,
}

impl TableBuilder {
    pub fn new(options: Options, cmp: Arc<dyn Comparator>, file: Box<dyn WritableFile>) -> TableBuilder {
        let filter_block = options
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(policy.clone()));
        let restart_interval = options.block_restart_interval;
        TableBuilder {
            options,
            cmp,
            file,
            offset: 0,
            num_entries: 0,
            last_key: Vec::new(),
            data_block: BlockBuilder::new(restart_interval),
            // Index keys are far apart; restarts on every entry keep index
            // seeks cheap.
            index_block: BlockBuilder::new(1),
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            filter_block,
            finished: false,
        }
    }

    /// Adds an entry; keys must arrive in ascending internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.finished);
        debug_assert!(
            self.num_entries == 0 || self.cmp.compare(&self.last_key, key) == Ordering::Less,
            "keys added out of order"
        );

        if self.pending_index_entry {
            let separator = self.cmp.separator(&self.last_key, key);
            self.index_block
                .add(&separator, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }

        if let Some(filter) = &mut self.filter_block {
            filter.add_key(format::user_key(key));
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);
        self.pending_handle = self.write_block_from_builder(true)?;
        self.pending_index_entry = true;
        self.file.flush()?;
        if let Some(filter) = &mut self.filter_block {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    fn write_block_from_builder(&mut self, data: bool) -> Result<BlockHandle> {
        let contents = if data {
            self.data_block.finish().to_vec()
        } else {
            self.index_block.finish().to_vec()
        };
        if data {
            self.data_block.reset();
        }
        let compression = self.options.compression;
        self.write_raw_block(&contents, compression)
    }

    fn write_raw_block(
        &mut self,
        contents: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let (payload, block_type) = match compression {
            CompressionType::None => (contents.to_vec(), CompressionType::None),
            CompressionType::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(contents)
                    .map_err(|e| Error::Corruption(format!("snappy compression: {}", e)))?;
                // Keep the raw bytes unless compression actually pays for
                // the decompression cost.
                if compressed.len() < contents.len() - contents.len() / 8 {
                    (compressed, CompressionType::Snappy)
                } else {
                    (contents.to_vec(), CompressionType::None)
                }
            }
        };

        let handle = BlockHandle::new(self.offset, payload.len() as u64);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        hasher.update(&[block_type as u8]);
        let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
        trailer.push(block_type as u8);
        put_fixed32(&mut trailer, mask_crc(hasher.finalize()));

        self.file.append(&payload)?;
        self.file.append(&trailer)?;
        self.offset += (payload.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }

    /// Writes the filter, metaindex, index blocks and the footer. When
    /// `sync` is set the file is durably flushed before returning.
    pub fn finish(&mut self, sync: bool) -> Result<()> {
        debug_assert!(!self.finished);
        self.flush_data_block()?;
        self.finished = true;

        // Filter block is stored uncompressed so probes stay cheap.
        let mut filter_handle = None;
        if self.filter_block.is_some() {
            let contents = {
                let filter = self.filter_block.as_mut().unwrap();
                filter.finish().to_vec()
            };
            filter_handle = Some(self.write_raw_block(&contents, CompressionType::None)?);
        }

        let mut metaindex = BlockBuilder::new(self.options.block_restart_interval);
        if let (Some(handle), Some(policy)) = (filter_handle, &self.options.filter_policy) {
            let key = format!("filter.{}", policy.name());
            metaindex.add(key.as_bytes(), &handle.encoded());
        }
        let metaindex_contents = metaindex.finish().to_vec();
        let compression = self.options.compression;
        let metaindex_handle = self.write_raw_block(&metaindex_contents, compression)?;

        if self.pending_index_entry {
            let successor = self.cmp.successor(&self.last_key);
            self.index_block
                .add(&successor, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }
        let index_handle = self.write_block_from_builder(false)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        self.file.append(&footer.encode())?;
        self.offset += crate::sstable::footer::FOOTER_SIZE as u64;

        if sync {
            self.file.sync()?;
        } else {
            self.file.flush()?;
        }
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far; after `finish` this is the final file size.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }
}
