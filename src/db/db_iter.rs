//! The user-facing iterator: collapses the internal multi-version entry
//! stream into one live value per user key, honoring the capture sequence.
//!
//! Returned key and value slices alias the iterator's internal buffers and
//! stay valid until the cursor moves or the iterator is dropped.

use crate::comparator::InternalKeyComparator;
use crate::format::{self, SequenceNumber, ValueKind, MAX_SEQUENCE_NUMBER};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::memtable::MemTable;
use crate::version::Version;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(PartialEq, Clone, Copy)]
enum Direction {
    /// The internal cursor sits on the entry whose user key is current.
    Forward,
    /// The internal cursor sits before all entries for the current user
    /// key, whose key and value are buffered in `saved_key`/`saved_value`.
    Reverse,
}

pub struct DbIterator {
    icmp: InternalKeyComparator,
    iter: MergingIterator,
    sequence: SequenceNumber,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    // Pins: the tables and memtables under `iter` must outlive it.
    _version: Arc<Version>,
    _memtables: Vec<Arc<MemTable>>,
}

impl DbIterator {
    pub(crate) fn new(
        icmp: InternalKeyComparator,
        iter: MergingIterator,
        sequence: SequenceNumber,
        version: Arc<Version>,
        memtables: Vec<Arc<MemTable>>,
    ) -> DbIterator {
        DbIterator {
            icmp,
            iter,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            _version: version,
            _memtables: memtables,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => format::user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn status(&self) -> Result<()> {
        self.iter.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        self.iter.seek(&format::pack_internal_key(
            target,
            self.sequence,
            ValueKind::Seek,
        ));
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Reverse {
            // The cursor is before the current key's entries; move it to
            // the first entry at or after the current key so the forward
            // skip starts from the right place.
            self.direction = Direction::Forward;
            if self.iter.valid() {
                self.iter.next();
            } else {
                self.iter.seek_to_first();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(format::user_key(self.iter.key()));
        }
        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Forward {
            // Walk back until the cursor sits before every entry of the
            // current user key.
            self.saved_key.clear();
            self.saved_key.extend_from_slice(format::user_key(self.iter.key()));
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .icmp
                    .compare_user_key(format::user_key(self.iter.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    /// Advances to the next visible, live user entry. With `skipping`, all
    /// entries whose user key is at or below `saved_key` are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);
        loop {
            if !self.iter.valid() {
                break;
            }
            let ikey = self.iter.key();
            if format::sequence(ikey) <= self.sequence {
                let user_key = format::user_key(ikey);
                match format::kind(ikey) {
                    Ok(ValueKind::Deletion) => {
                        // Every older entry for this key is shadowed.
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(user_key);
                        skipping = true;
                    }
                    Ok(ValueKind::Value) => {
                        if skipping
                            && self.icmp.compare_user_key(user_key, &self.saved_key)
                                != Ordering::Greater
                        {
                            // Hidden by a deletion or an already-yielded
                            // newer entry.
                        } else {
                            self.valid = true;
                            self.saved_key.clear();
                            return;
                        }
                    }
                    _ => {}
                }
            }
            self.iter.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Scans backward, buffering the newest visible entry of the previous
    /// user key until the key before it is reached.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);
        let mut value_kind = ValueKind::Deletion;
        while self.iter.valid() {
            let ikey = self.iter.key();
            if format::sequence(ikey) <= self.sequence {
                let user_key = format::user_key(ikey);
                if value_kind != ValueKind::Deletion
                    && self.icmp.compare_user_key(user_key, &self.saved_key) == Ordering::Less
                {
                    // Crossed onto an earlier user key; the buffered entry
                    // is the answer.
                    break;
                }
                match format::kind(ikey) {
                    Ok(ValueKind::Deletion) => {
                        value_kind = ValueKind::Deletion;
                        self.saved_key.clear();
                        self.saved_value.clear();
                    }
                    Ok(ValueKind::Value) => {
                        value_kind = ValueKind::Value;
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.iter.value());
                    }
                    _ => {}
                }
            }
            self.iter.prev();
        }

        if value_kind == ValueKind::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::iterator::VecIterator;
    use crate::options::Options;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn entry(key: &str, seq: u64, kind: ValueKind, value: &str) -> (Vec<u8>, Vec<u8>) {
        (
            format::pack_internal_key(key.as_bytes(), seq, kind),
            value.as_bytes().to_vec(),
        )
    }

    fn db_iter(entries: Vec<(Vec<u8>, Vec<u8>)>, sequence: SequenceNumber) -> DbIterator {
        let children: Vec<Box<dyn InternalIterator>> =
            vec![Box::new(VecIterator::new(icmp(), entries))];
        let merge = MergingIterator::new(icmp(), children);
        let version = Arc::new(Version::new(Options::default(), icmp()));
        DbIterator::new(icmp(), merge, sequence, version, Vec::new())
    }

    fn collect_forward(iter: &mut DbIterator) -> Vec<(String, String)> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((
                String::from_utf8(iter.key().to_vec()).unwrap(),
                String::from_utf8(iter.value().to_vec()).unwrap(),
            ));
            iter.next();
        }
        out
    }

    #[test]
    fn test_newest_version_wins() {
        let mut iter = db_iter(
            vec![
                entry("a", 1, ValueKind::Value, "a1"),
                entry("a", 5, ValueKind::Value, "a5"),
                entry("b", 2, ValueKind::Value, "b2"),
            ],
            MAX_SEQUENCE_NUMBER,
        );
        assert_eq!(
            collect_forward(&mut iter),
            vec![
                ("a".to_string(), "a5".to_string()),
                ("b".to_string(), "b2".to_string()),
            ]
        );
    }

    #[test]
    fn test_deletion_hides_key() {
        let mut iter = db_iter(
            vec![
                entry("a", 1, ValueKind::Value, "a1"),
                entry("a", 5, ValueKind::Deletion, ""),
                entry("b", 2, ValueKind::Value, "b2"),
            ],
            MAX_SEQUENCE_NUMBER,
        );
        assert_eq!(
            collect_forward(&mut iter),
            vec![("b".to_string(), "b2".to_string())]
        );
    }

    #[test]
    fn test_sequence_capture() {
        let entries = vec![
            entry("a", 1, ValueKind::Value, "old"),
            entry("a", 9, ValueKind::Value, "new"),
        ];
        let mut iter = db_iter(entries.clone(), 5);
        assert_eq!(
            collect_forward(&mut iter),
            vec![("a".to_string(), "old".to_string())]
        );

        // A deletion above the capture sequence is invisible.
        let mut entries = entries;
        entries.push(entry("b", 8, ValueKind::Deletion, ""));
        entries.push(entry("b", 2, ValueKind::Value, "b2"));
        let mut iter = db_iter(entries, 5);
        assert_eq!(
            collect_forward(&mut iter),
            vec![
                ("a".to_string(), "old".to_string()),
                ("b".to_string(), "b2".to_string()),
            ]
        );
    }

    #[test]
    fn test_backward_scan() {
        let mut iter = db_iter(
            vec![
                entry("a", 1, ValueKind::Value, "a1"),
                entry("b", 3, ValueKind::Deletion, ""),
                entry("b", 2, ValueKind::Value, "b2"),
                entry("c", 4, ValueKind::Value, "c4"),
            ],
            MAX_SEQUENCE_NUMBER,
        );
        iter.seek_to_last();
        let mut out = Vec::new();
        while iter.valid() {
            out.push(String::from_utf8(iter.key().to_vec()).unwrap());
            iter.prev();
        }
        assert_eq!(out, vec!["c".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_seek_positions_at_or_after() {
        let mut iter = db_iter(
            vec![
                entry("apple", 1, ValueKind::Value, "1"),
                entry("cherry", 2, ValueKind::Value, "2"),
            ],
            MAX_SEQUENCE_NUMBER,
        );
        iter.seek(b"banana");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"cherry");
        iter.seek(b"zucchini");
        assert!(!iter.valid());
    }

    #[test]
    fn test_direction_switch() {
        let mut iter = db_iter(
            vec![
                entry("a", 1, ValueKind::Value, "a1"),
                entry("b", 2, ValueKind::Value, "b2"),
                entry("c", 3, ValueKind::Value, "c3"),
            ],
            MAX_SEQUENCE_NUMBER,
        );
        iter.seek(b"b");
        assert_eq!(iter.key(), b"b");
        iter.prev();
        assert_eq!(iter.key(), b"a");
        iter.next();
        assert_eq!(iter.key(), b"b");
        iter.next();
        assert_eq!(iter.key(), b"c");
    }
}
