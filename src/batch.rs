//! Atomic multi-key write batches.
//!
//! Wire form (also the journal payload): an 8-byte base sequence, a 4-byte
//! record count, then one record per operation: a kind byte, the
//! length-prefixed key, and for puts the length-prefixed value. Each record
//! consumes one sequence number starting at the base.

use crate::byteutils::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_length_prefixed_slice,
};
use crate::error::Error;
use crate::format::{SequenceNumber, ValueKind};
use crate::memtable::MemTable;
use crate::Result;

const BATCH_HEADER_SIZE: usize = 12;

#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> WriteBatch {
        WriteBatch::new()
    }
}

impl WriteBatch {
    pub fn new() -> WriteBatch {
        WriteBatch {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueKind::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueKind::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Bytes this batch will occupy in the journal and, approximately, in
    /// the memtable.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[..8])
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Reconstructs a batch from a journal record, validating the frame.
    pub(crate) fn from_contents(rep: Vec<u8>) -> Result<WriteBatch> {
        if rep.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("write batch record too short"));
        }
        let batch = WriteBatch { rep };
        // Walk the records now so replay can't fail halfway through.
        batch.for_each(|_, _, _| Ok(()))?;
        Ok(batch)
    }

    /// Visits each record as `(kind, key, value)`; the value slice is empty
    /// for deletions.
    pub(crate) fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(ValueKind, &[u8], &[u8]) -> Result<()>,
    {
        let mut input = &self.rep[BATCH_HEADER_SIZE..];
        let mut found = 0;
        while !input.is_empty() {
            found += 1;
            let kind = ValueKind::from_u8(input[0])?;
            input = &input[1..];
            let (key, n) = get_length_prefixed_slice(input)
                .ok_or_else(|| Error::corruption("bad key length in write batch"))?;
            input = &input[n..];
            match kind {
                ValueKind::Value => {
                    let (value, n) = get_length_prefixed_slice(input)
                        .ok_or_else(|| Error::corruption("bad value length in write batch"))?;
                    input = &input[n..];
                    f(kind, key, value)?;
                }
                ValueKind::Deletion => f(kind, key, &[])?,
                ValueKind::Seek => {
                    return Err(Error::corruption("seek sentinel in write batch"));
                }
            }
        }
        if found != self.count() {
            return Err(Error::corruption("write batch count mismatch"));
        }
        Ok(())
    }

    /// Replays the batch into a memtable, assigning sequence numbers
    /// starting at the batch's base sequence.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut seq = self.sequence();
        self.for_each(|kind, key, value| {
            mem.add(seq, kind, key, value);
            seq += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::format::LookupKey;
    use crate::memtable::Lookup;
    use std::sync::Arc;

    #[test]
    fn test_counts_and_sequence() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"3");
        assert_eq!(batch.count(), 3);

        batch.set_sequence(100);
        assert_eq!(batch.sequence(), 100);
    }

    #[test]
    fn test_for_each_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");

        let mut ops = Vec::new();
        batch
            .for_each(|kind, key, value| {
                ops.push((kind, key.to_vec(), value.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            ops,
            vec![
                (ValueKind::Value, b"a".to_vec(), b"1".to_vec()),
                (ValueKind::Deletion, b"b".to_vec(), Vec::new()),
            ]
        );
    }

    #[test]
    fn test_replay_into_memtable() {
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        batch.delete(b"k1");
        batch.set_sequence(10);

        let mem = MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)));
        batch.insert_into(&mem).unwrap();

        assert!(matches!(mem.get(&LookupKey::new(b"k1", 20)), Lookup::Deleted));
        assert!(matches!(
            mem.get(&LookupKey::new(b"k2", 20)),
            Lookup::Hit(v) if v == b"v2"
        ));
        // Before the delete's sequence the put is visible.
        assert!(matches!(
            mem.get(&LookupKey::new(b"k1", 11)),
            Lookup::Hit(v) if v == b"v1"
        ));
    }

    #[test]
    fn test_roundtrip_through_contents() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        batch.set_sequence(7);
        let restored = WriteBatch::from_contents(batch.contents().to_vec()).unwrap();
        assert_eq!(restored.count(), 1);
        assert_eq!(restored.sequence(), 7);
    }

    #[test]
    fn test_truncated_contents_rejected() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let mut data = batch.contents().to_vec();
        data.truncate(data.len() - 2);
        assert!(WriteBatch::from_contents(data).is_err());

        assert!(WriteBatch::from_contents(vec![0; 4]).is_err());
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let mut data = batch.contents().to_vec();
        data[8] = 2;
        assert!(WriteBatch::from_contents(data).is_err());
    }
}
