//! Per-table filter block: one filter per 2 KiB window of data-block
//! offsets, so a point read probes a single filter chosen by the data
//! block's file offset.

use crate::byteutils::{decode_fixed32, put_fixed32};
use crate::filter::FilterPolicy;
use std::sync::Arc;

/// Generate a filter for every 2 KiB of data offset.
const FILTER_BASE_LG: u32 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> FilterBlockBuilder {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        let offsets = std::mem::take(&mut self.filter_offsets);
        for offset in offsets {
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG as u8);
        &self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // Window with no keys reuses the previous end offset, giving an
            // empty filter slice.
            return;
        }
        let filter = self.policy.create_filter(&self.keys);
        self.result.extend_from_slice(&filter);
        self.keys.clear();
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Offset of the filter-offset array within `data`.
    array_offset: usize,
    num_filters: usize,
    base_lg: u32,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> FilterBlockReader {
        // 4-byte array offset + 1-byte base.
        if data.len() < 5 {
            return FilterBlockReader {
                policy,
                data,
                array_offset: 0,
                num_filters: 0,
                base_lg: FILTER_BASE_LG,
            };
        }
        let base_lg = data[data.len() - 1] as u32;
        let array_offset = decode_fixed32(&data[data.len() - 5..]) as usize;
        let num_filters = if array_offset + 5 <= data.len() {
            (data.len() - 5 - array_offset) / 4
        } else {
            0
        };
        FilterBlockReader {
            policy,
            data,
            array_offset,
            num_filters,
            base_lg,
        }
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Out of range is treated as a potential match.
            return true;
        }
        let start = decode_fixed32(&self.data[self.array_offset + index * 4..]) as usize;
        let end = if index + 1 < self.num_filters {
            decode_fixed32(&self.data[self.array_offset + (index + 1) * 4..]) as usize
        } else {
            self.array_offset
        };
        if start > end || end > self.array_offset {
            // Malformed offsets; do not rule the key out.
            return true;
        }
        if start == end {
            // Empty window holds no keys.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BloomFilterPolicy;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::default())
    }

    #[test]
    fn test_single_window() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        let data = builder.finish().to_vec();

        let reader = FilterBlockReader::new(policy(), data);
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(!reader.key_may_match(100, b"missing"));
    }

    #[test]
    fn test_multiple_windows() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"in-first");
        builder.start_block(3100);
        builder.add_key(b"in-second");
        builder.start_block(9000);
        builder.add_key(b"in-third");
        let data = builder.finish().to_vec();

        let reader = FilterBlockReader::new(policy(), data);
        assert!(reader.key_may_match(0, b"in-first"));
        assert!(!reader.key_may_match(0, b"in-second"));
        assert!(reader.key_may_match(3100, b"in-second"));
        assert!(!reader.key_may_match(3100, b"in-first"));
        assert!(reader.key_may_match(9000, b"in-third"));
        // Window 2 (4096..6143) saw no keys at all.
        assert!(!reader.key_may_match(5000, b"in-first"));
    }

    #[test]
    fn test_empty_builder() {
        let mut builder = FilterBlockBuilder::new(policy());
        let data = builder.finish().to_vec();
        let reader = FilterBlockReader::new(policy(), data);
        // No filters recorded: never rule a key out.
        assert!(reader.key_may_match(0, b"anything"));
    }
}
