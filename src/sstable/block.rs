//! Key/value blocks with prefix-compressed keys and restart points.
//!
//! Entry layout: varint32 shared key length, varint32 non-shared key
//! length, varint32 value length, key suffix, value. Every
//! `restart_interval` entries a restart point stores the full key; the
//! block ends with the u32 restart offsets and their count.

use crate::byteutils::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::comparator::Comparator;
use crate::error::Error;
use crate::iterator::InternalIterator;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_counter: usize,
    last_key: Vec<u8>,
    num_entries: usize,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> BlockBuilder {
        debug_assert!(restart_interval >= 1);
        BlockBuilder {
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            restart_counter: 0,
            last_key: Vec::new(),
            num_entries: 0,
            finished: false,
        }
    }

    /// Keys must be added in ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        let mut shared = 0;
        if self.restart_counter < self.restart_interval {
            let max_shared = self.last_key.len().min(key.len());
            while shared < max_shared && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.restart_counter = 0;
        }

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, (key.len() - shared) as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.restart_counter += 1;
        self.num_entries += 1;
    }

    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.restart_counter = 0;
        self.last_key.clear();
        self.num_entries = 0;
        self.finished = false;
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }
}

/// A parsed, immutable block.
pub struct Block {
    data: Vec<u8>,
    restart_offset: usize,
    num_restarts: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return Err(Error::corruption("block too short"));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]) as usize;
        if num_restarts == 0 {
            return Err(Error::corruption("block has no restart points"));
        }
        let trailer = 4 + num_restarts * 4;
        if data.len() < trailer {
            return Err(Error::corruption("block restart array overruns block"));
        }
        let restart_offset = data.len() - trailer;
        Ok(Block {
            data,
            restart_offset,
            num_restarts,
        })
    }

    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts);
        decode_fixed32(&self.data[self.restart_offset + index * 4..]) as usize
    }

    pub fn iter(self: &Arc<Block>, cmp: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block: self.clone(),
            cmp,
            next_offset: self.restart_offset,
            current_offset: 0,
            restart_index: 0,
            key: Vec::new(),
            value_range: (0, 0),
            valid: false,
            corrupt: false,
        }
    }
}

/// Decodes one entry header at `offset`: (shared, non_shared, value_len,
/// offset of the key suffix).
fn decode_entry(data: &[u8], offset: usize) -> Option<(usize, usize, usize, usize)> {
    let (shared, n1) = get_varint32(&data[offset..])?;
    let (non_shared, n2) = get_varint32(&data[offset + n1..])?;
    let (value_len, n3) = get_varint32(&data[offset + n1 + n2..])?;
    let header = offset + n1 + n2 + n3;
    let end = header
        .checked_add(non_shared as usize)?
        .checked_add(value_len as usize)?;
    if end > data.len() {
        return None;
    }
    Some((shared as usize, non_shared as usize, value_len as usize, header))
}

pub struct BlockIter {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    /// Offset of the entry after the current one.
    next_offset: usize,
    current_offset: usize,
    restart_index: usize,
    key: Vec<u8>,
    value_range: (usize, usize),
    valid: bool,
    corrupt: bool,
}

impl BlockIter {
    fn seek_to_restart(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;
        self.next_offset = self.block.restart_point(index);
        self.valid = false;
    }

    /// Parses the entry at `next_offset` and makes it current. Returns
    /// false at the end of the block or on corruption.
    fn parse_next(&mut self) -> bool {
        if self.next_offset >= self.block.restart_offset {
            self.valid = false;
            return false;
        }
        match decode_entry(&self.block.data, self.next_offset) {
            Some((shared, non_shared, value_len, header)) => {
                if shared > self.key.len() {
                    self.mark_corrupt();
                    return false;
                }
                self.current_offset = self.next_offset;
                self.key.truncate(shared);
                self.key
                    .extend_from_slice(&self.block.data[header..header + non_shared]);
                self.value_range = (header + non_shared, header + non_shared + value_len);
                self.next_offset = self.value_range.1;
                while self.restart_index + 1 < self.block.num_restarts
                    && self.block.restart_point(self.restart_index + 1) <= self.current_offset
                {
                    self.restart_index += 1;
                }
                self.valid = true;
                true
            }
            None => {
                self.mark_corrupt();
                false
            }
        }
    }

    fn mark_corrupt(&mut self) {
        self.corrupt = true;
        self.valid = false;
        self.next_offset = self.block.restart_offset;
    }

    /// Full key stored at a restart point (shared prefix is always empty
    /// there).
    fn restart_key(&self, index: usize) -> Option<&[u8]> {
        let offset = self.block.restart_point(index);
        let (shared, non_shared, _, header) = decode_entry(&self.block.data, offset)?;
        if shared != 0 {
            return None;
        }
        Some(&self.block.data[header..header + non_shared])
    }
}

impl InternalIterator for BlockIter {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        self.seek_to_restart(0);
        self.parse_next();
    }

    fn seek_to_last(&mut self) {
        self.seek_to_restart(self.block.num_restarts - 1);
        while self.parse_next() && self.next_offset < self.block.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary search over restart points for the last full key < target,
        // then scan forward.
        let mut left = 0;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.restart_key(mid) {
                Some(key) => {
                    if self.cmp.compare(key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                None => {
                    self.mark_corrupt();
                    return;
                }
            }
        }
        self.seek_to_restart(left);
        while self.parse_next() {
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid);
        self.parse_next();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid);
        let original = self.current_offset;
        // Back up to the restart point before the current entry, then walk
        // forward to the entry preceding it.
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.valid = false;
                self.next_offset = self.block.restart_offset;
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart(self.restart_index);
        while self.parse_next() && self.next_offset < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_range.0..self.value_range.1]
    }

    fn status(&self) -> Result<()> {
        if self.corrupt {
            return Err(Error::corruption("malformed block entry"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (k, v) in entries {
            builder.add(k, v);
        }
        let data = builder.finish().to_vec();
        Arc::new(Block::new(data).unwrap())
    }

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    #[test]
    fn test_empty_block() {
        let block = build_block(&[], 16);
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
    }

    #[test]
    fn test_iterate_forward_and_back() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| {
                (
                    format!("key{:03}", i).into_bytes(),
                    format!("value{}", i).into_bytes(),
                )
            })
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        // Small restart interval exercises prefix compression boundaries.
        let block = build_block(&borrowed, 4);

        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        for (k, v) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
            iter.next();
        }
        assert!(!iter.valid());

        iter.seek_to_last();
        for (k, _) in entries.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek() {
        let block = build_block(
            &[
                (b"apple", b"1"),
                (b"banana", b"2"),
                (b"cherry", b"3"),
                (b"damson", b"4"),
            ],
            2,
        );
        let mut iter = block.iter(cmp());

        iter.seek(b"banana");
        assert_eq!(iter.key(), b"banana");
        iter.seek(b"bananz");
        assert_eq!(iter.key(), b"cherry");
        iter.seek(b"a");
        assert_eq!(iter.key(), b"apple");
        iter.seek(b"zzz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_across_restarts() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..10)
            .map(|i| (format!("k{}", i).into_bytes(), vec![i as u8]))
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&borrowed, 3);

        let mut iter = block.iter(cmp());
        iter.seek(b"k5");
        assert_eq!(iter.key(), b"k5");
        iter.prev();
        assert_eq!(iter.key(), b"k4");
        iter.prev();
        assert_eq!(iter.key(), b"k3");
    }

    #[test]
    fn test_single_restart_shared_prefixes() {
        let block = build_block(
            &[(b"prefix_a", b"1"), (b"prefix_b", b"2"), (b"prefix_c", b"3")],
            16,
        );
        let mut iter = block.iter(cmp());
        iter.seek(b"prefix_b");
        assert_eq!(iter.key(), b"prefix_b");
        assert_eq!(iter.value(), b"2");
    }
}
