//! An embedded ordered key-value store built on a log-structured
//! merge-tree: an in-memory write buffer ahead of a write-ahead journal,
//! flushed into immutable sorted tables organized in levels and merged by
//! a background compaction worker. Supports point lookups, ordered
//! iteration in both directions, atomic write batches and point-in-time
//! snapshots.

mod batch;
mod byteutils;
mod cache;
mod compact;
pub mod comparator;
mod db;
pub mod env;
mod error;
pub mod filter;
mod format;
mod iterator;
mod journal;
mod memtable;
pub mod options;
mod snapshot;
mod sstable;
mod version;

mod hash;

pub type Result<T> = std::result::Result<T, Error>;

pub use batch::WriteBatch;
pub use comparator::{BytewiseComparator, Comparator};
pub use db::{Database, DbIterator};
pub use env::{DiskStorage, MemStorage, Storage};
pub use error::Error;
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use format::SequenceNumber;
pub use options::{CompressionType, Options, ReadOptions, WriteOptions};
pub use snapshot::Snapshot;
