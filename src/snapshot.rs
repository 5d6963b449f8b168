//! Snapshots: retained sequence numbers. Compaction may only drop
//! superseded entries below the smallest registered sequence.

use crate::format::SequenceNumber;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Registry of retained sequences with reference counts (several snapshots
/// may share one sequence).
#[derive(Default)]
pub(crate) struct SnapshotList {
    counts: BTreeMap<SequenceNumber, usize>,
}

impl SnapshotList {
    pub fn acquire(&mut self, seq: SequenceNumber) {
        *self.counts.entry(seq).or_insert(0) += 1;
    }

    pub fn release(&mut self, seq: SequenceNumber) {
        match self.counts.get_mut(&seq) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.counts.remove(&seq);
            }
            None => debug_assert!(false, "releasing unregistered snapshot"),
        }
    }

    /// The horizon below which older versions of a key are reclaimable.
    pub fn smallest(&self) -> Option<SequenceNumber> {
        self.counts.keys().next().copied()
    }
}

/// A consistent point-in-time view. Reads through it observe only writes
/// committed before it was taken; dropping it releases the registration.
pub struct Snapshot {
    sequence: SequenceNumber,
    list: Arc<Mutex<SnapshotList>>,
}

impl Snapshot {
    pub(crate) fn new(sequence: SequenceNumber, list: Arc<Mutex<SnapshotList>>) -> Snapshot {
        list.lock().unwrap().acquire(sequence);
        Snapshot { sequence, list }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.lock().unwrap().release(self.sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_tracks_releases() {
        let list = Arc::new(Mutex::new(SnapshotList::default()));
        let s10 = Snapshot::new(10, list.clone());
        let s5 = Snapshot::new(5, list.clone());
        let s5b = Snapshot::new(5, list.clone());
        assert_eq!(list.lock().unwrap().smallest(), Some(5));

        drop(s5);
        // The sequence stays registered while a second holder remains.
        assert_eq!(list.lock().unwrap().smallest(), Some(5));
        drop(s5b);
        assert_eq!(list.lock().unwrap().smallest(), Some(10));
        drop(s10);
        assert_eq!(list.lock().unwrap().smallest(), None);
    }
}
