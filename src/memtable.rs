//! In-memory ordered write buffer.
//!
//! Entries are keyed by full internal key, so multiple versions of one
//! user key coexist and the newest sorts first. The skip list allows
//! lock-free readers while the single writer inserts; a memtable is never
//! mutated again once it has been frozen for flushing.

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::format::{self, LookupKey, SequenceNumber, ValueKind};
use crate::iterator::InternalIterator;
use crate::Result;
use crossbeam_skiplist::SkipMap;
use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Internal key wrapper that delegates ordering to the configured
/// comparator so the skip list honors custom user-key orders.
struct OrderedKey {
    ikey: Vec<u8>,
    cmp: InternalKeyComparator,
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp.compare(&self.ikey, &other.ikey) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Ord::cmp(self, other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.ikey, &other.ikey)
    }
}

/// Outcome of a memtable point lookup.
pub(crate) enum Lookup {
    Hit(Vec<u8>),
    Deleted,
    Miss,
}

pub struct MemTable {
    cmp: InternalKeyComparator,
    map: SkipMap<OrderedKey, Vec<u8>>,
    approximate_size: AtomicUsize,
}

impl MemTable {
    pub fn new(cmp: InternalKeyComparator) -> MemTable {
        MemTable {
            cmp,
            map: SkipMap::new(),
            approximate_size: AtomicUsize::new(0),
        }
    }

    pub(crate) fn add(
        &self,
        seq: SequenceNumber,
        kind: ValueKind,
        user_key: &[u8],
        value: &[u8],
    ) {
        let ikey = format::pack_internal_key(user_key, seq, kind);
        let charge = ikey.len() + value.len();
        self.map.insert(
            OrderedKey {
                ikey,
                cmp: self.cmp.clone(),
            },
            value.to_vec(),
        );
        self.approximate_size
            .fetch_add(charge, AtomicOrdering::Relaxed);
    }

    /// Looks up the newest entry for the key visible at the lookup's
    /// sequence.
    pub(crate) fn get(&self, key: &LookupKey) -> Lookup {
        let probe = OrderedKey {
            ikey: key.internal_key().to_vec(),
            cmp: self.cmp.clone(),
        };
        if let Some(entry) = self.map.range((Bound::Included(probe), Bound::Unbounded)).next() {
            let ikey = entry.key().ikey.as_slice();
            if self
                .cmp
                .compare_user_key(format::user_key(ikey), key.user_key())
                == Ordering::Equal
            {
                return match format::kind(ikey) {
                    Ok(ValueKind::Value) => Lookup::Hit(entry.value().clone()),
                    _ => Lookup::Deleted,
                };
            }
        }
        Lookup::Miss
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(self: &Arc<MemTable>) -> MemTableIterator {
        MemTableIterator {
            mem: self.clone(),
            current: None,
        }
    }

    fn probe(&self, ikey: &[u8]) -> OrderedKey {
        OrderedKey {
            ikey: ikey.to_vec(),
            cmp: self.cmp.clone(),
        }
    }
}

/// Cursor over a memtable. Holds an owned copy of the current entry and
/// repositions through the skip list on every step, which keeps it valid
/// while the writer concurrently inserts.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.current = self
            .mem
            .map
            .front()
            .map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn seek_to_last(&mut self) {
        self.current = self
            .mem
            .map
            .back()
            .map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn seek(&mut self, target: &[u8]) {
        let probe = self.mem.probe(target);
        self.current = self
            .mem
            .map
            .range((Bound::Included(probe), Bound::Unbounded))
            .next()
            .map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn next(&mut self) {
        let (key, _) = self.current.take().expect("next on invalid iterator");
        let probe = self.mem.probe(&key);
        self.current = self
            .mem
            .map
            .range((Bound::Excluded(probe), Bound::Unbounded))
            .next()
            .map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn prev(&mut self) {
        let (key, _) = self.current.take().expect("prev on invalid iterator");
        let probe = self.mem.probe(&key);
        self.current = self
            .mem
            .map
            .range((Bound::Unbounded, Bound::Excluded(probe)))
            .next_back()
            .map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("key on invalid iterator").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("value on invalid iterator").1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
