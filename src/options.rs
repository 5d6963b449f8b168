use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;
use std::sync::Arc;

pub const NUM_LEVELS: usize = 7;

/// Level-0 compaction starts once this many tables have accumulated.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Soft limit on level-0 tables; each batch sleeps once past this point.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Hard limit on level-0 tables; writes block until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Deepest level a flushed memtable may be placed at when its range does
/// not overlap anything shallower. Avoids repeated L0->L1 merges for
/// non-overlapping workloads without pushing data so deep that space is
/// wasted under overwrite-heavy loads.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn from_u8(byte: u8) -> Option<CompressionType> {
        match byte {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Options {
    /// Create the database files if the directory holds no CURRENT file.
    pub create_if_missing: bool,

    /// Fail `open` if the database already exists.
    pub error_if_exists: bool,

    /// Bytes buffered in the active memtable before it is frozen and
    /// flushed to a level-0 table.
    pub write_buffer_size: usize,

    /// Upper bound on concurrently open table readers (table cache size).
    pub max_open_files: usize,

    /// Target size of a table produced by compaction; outputs are cut when
    /// they reach it.
    pub max_file_size: u64,

    /// Uncompressed size at which a data block is cut.
    pub block_size: usize,

    /// Keys between restart points inside a block.
    pub block_restart_interval: usize,

    /// Number of cached uncompressed blocks.
    pub block_cache_capacity: usize,

    pub compression: CompressionType,

    pub comparator: Arc<dyn Comparator>,

    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            create_if_missing: true,
            error_if_exists: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            max_file_size: 2 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            block_cache_capacity: 1024,
            compression: CompressionType::Snappy,
            comparator: Arc::new(BytewiseComparator),
            filter_policy: None,
        }
    }
}

impl Options {
    /// Compactions at level L+1 stop growing an output table once its key
    /// range overlaps this many bytes of level L+2, keeping any later merge
    /// of that table cheap.
    pub(crate) fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size
    }

    /// Cap on total input bytes when widening the lower level of a
    /// compaction, so a single merge stays bounded.
    pub(crate) fn expanded_compaction_byte_limit(&self) -> u64 {
        25 * self.max_file_size
    }

    /// Size-triggered compaction target for a level >= 1, in bytes.
    pub(crate) fn max_bytes_for_level(&self, level: usize) -> f64 {
        debug_assert!(level >= 1);
        let mut result = 10.0 * 1024.0 * 1024.0;
        for _ in 1..level {
            result *= 10.0;
        }
        result
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Force the journal to durable storage before the write returns.
    pub sync: bool,
}

#[derive(Clone)]
pub struct ReadOptions {
    /// Verify block checksums on every read.
    pub verify_checksums: bool,

    /// Whether blocks read for this request should populate the block cache.
    /// Off for bulk scans that would churn it.
    pub fill_cache: bool,

    /// Read as of this sequence instead of the current one.
    pub snapshot: Option<crate::format::SequenceNumber>,
}

impl Default for ReadOptions {
    fn default() -> ReadOptions {
        ReadOptions {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}
