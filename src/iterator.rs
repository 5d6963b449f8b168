//! Iteration over internal keys.
//!
//! All engine iterators expose the same cursor interface so the read path
//! can merge memtables, level-0 tables and deeper levels uniformly. Keys
//! and values returned by `key`/`value` alias the iterator's buffers and
//! stay valid until the cursor moves.

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::Result;
use std::cmp::Ordering;

pub trait InternalIterator: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    /// Requires `valid()`.
    fn key(&self) -> &[u8];
    /// Requires `valid()`.
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()>;
}

#[derive(PartialEq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges several sorted child iterators into one sorted stream. Supports
/// both scan directions; switching direction re-aligns every child around
/// the current key.
pub struct MergingIterator {
    cmp: InternalKeyComparator,
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(
        cmp: InternalKeyComparator,
        children: Vec<Box<dyn InternalIterator>>,
    ) -> MergingIterator {
        MergingIterator {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.cmp.compare(child.key(), self.children[s].key()) == Ordering::Less {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.cmp.compare(child.key(), self.children[l].key()) == Ordering::Greater {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let current = self.current.expect("next on invalid iterator");

        if self.direction != Direction::Forward {
            // All other children are positioned before key(); advance them
            // to the first entry past it so the forward merge resumes from
            // the right place.
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("prev on invalid iterator");

        if self.direction != Direction::Reverse {
            // Position every other child at the last entry strictly before
            // key().
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    child.prev();
                } else {
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("key on invalid iterator")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("value on invalid iterator")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

/// Sorted in-memory iterator for tests of the merge machinery.
#[cfg(test)]
pub struct VecIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    cmp: InternalKeyComparator,
    index: Option<usize>,
}

#[cfg(test)]
impl VecIterator {
    pub fn new(cmp: InternalKeyComparator, mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> VecIterator {
        entries.sort_by(|a, b| cmp.compare(&a.0, &b.0));
        VecIterator {
            entries,
            cmp,
            index: None,
        }
    }
}

#[cfg(test)]
impl InternalIterator for VecIterator {
    fn valid(&self) -> bool {
        self.index.is_some()
    }

    fn seek_to_first(&mut self) {
        self.index = if self.entries.is_empty() { None } else { Some(0) };
    }

    fn seek_to_last(&mut self) {
        self.index = self.entries.len().checked_sub(1);
    }

    fn seek(&mut self, target: &[u8]) {
        let pos = self
            .entries
            .partition_point(|(k, _)| self.cmp.compare(k, target) == Ordering::Less);
        self.index = if pos < self.entries.len() {
            Some(pos)
        } else {
            None
        };
    }

    fn next(&mut self) {
        let i = self.index.expect("next on invalid iterator");
        self.index = if i + 1 < self.entries.len() {
            Some(i + 1)
        } else {
            None
        };
    }

    fn prev(&mut self) {
        let i = self.index.expect("prev on invalid iterator");
        self.index = i.checked_sub(1);
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.index.unwrap()].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.index.unwrap()].1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
