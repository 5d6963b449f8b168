//! Immutable snapshots of the table set.
//!
//! A version is the per-level list of live tables plus derived compaction
//! state. Readers resolve every lookup against a single version; versions
//! stay alive (and keep their files on disk) for as long as any iterator
//! or snapshot references them.

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::error::Error;
use crate::format::{self, LookupKey, ValueKind, MAX_SEQUENCE_NUMBER};
use crate::iterator::InternalIterator;
use crate::options::{Options, ReadOptions, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::sstable::reader::TableIterator;
use crate::sstable::table_cache::TableCache;
use crate::Result;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

pub mod edit;
pub mod set;

pub use edit::VersionEdit;
pub use set::VersionSet;

/// Seek budget floor: even tiny tables absorb this many charged misses
/// before they become a compaction target.
const MIN_ALLOWED_SEEKS: i64 = 100;

pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key in the table.
    pub smallest: Vec<u8>,
    /// Largest internal key in the table.
    pub largest: Vec<u8>,
    /// Remaining charged misses before this table triggers a compaction.
    allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: Vec<u8>, largest: Vec<u8>) -> FileMetaData {
        // One seek costs about as much as compacting 16 KiB, so a table
        // earns one allowed seek per 16 KiB of size.
        let allowed = ((file_size / 16384) as i64).max(MIN_ALLOWED_SEEKS);
        FileMetaData {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed),
        }
    }

    /// Charges one missed seek; returns true when the budget just ran out.
    fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) == 1
    }
}

pub(crate) fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Index of the first file whose largest key is >= `ikey`, for a level
/// with disjoint, sorted files.
pub(crate) fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    ikey: &[u8],
) -> usize {
    files.partition_point(|f| icmp.compare(&f.largest, ikey) == Ordering::Less)
}

/// Bookkeeping returned by a point read so the caller can charge the
/// first table that was searched fruitlessly.
pub(crate) struct GetStats {
    pub seek_file: Option<(usize, Arc<FileMetaData>)>,
}

pub struct Version {
    options: Options,
    icmp: InternalKeyComparator,
    /// Tables per level. Level 0 is ordered by file number (insertion
    /// order); deeper levels are sorted by smallest key and disjoint.
    pub files: Vec<Vec<Arc<FileMetaData>>>,
    /// Best size-triggered compaction candidate, computed by `finalize`.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,
    /// Table whose seek budget ran out, if any.
    pub(crate) file_to_compact: Mutex<Option<(usize, Arc<FileMetaData>)>>,
}

impl Version {
    pub fn new(options: Options, icmp: InternalKeyComparator) -> Version {
        Version {
            options,
            icmp,
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_score: -1.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub(crate) fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// One line per open: "files[ 2 4 0 0 0 0 0 ]".
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self.files.iter().map(|f| f.len().to_string()).collect();
        format!("files[ {} ]", counts.join(" "))
    }

    /// Point lookup through the level hierarchy, newest first.
    pub(crate) fn get(
        &self,
        ro: &ReadOptions,
        key: &LookupKey,
        table_cache: &TableCache,
    ) -> Result<(Option<Vec<u8>>, GetStats)> {
        let ikey = key.internal_key();
        let ukey = key.user_key();
        let ucmp = self.icmp.user_comparator().clone();

        let mut stats = GetStats { seek_file: None };
        let mut last_file_read: Option<(usize, Arc<FileMetaData>)> = None;

        for level in 0..NUM_LEVELS {
            let candidates: Vec<Arc<FileMetaData>> = if level == 0 {
                // Level 0 files may overlap; consult every covering table,
                // newest file first.
                let mut covering: Vec<Arc<FileMetaData>> = self.files[0]
                    .iter()
                    .filter(|f| {
                        ucmp.compare(ukey, format::user_key(&f.smallest)) != Ordering::Less
                            && ucmp.compare(ukey, format::user_key(&f.largest))
                                != Ordering::Greater
                    })
                    .cloned()
                    .collect();
                covering.sort_by(|a, b| b.number.cmp(&a.number));
                covering
            } else {
                // Disjoint ranges: at most one candidate.
                let index = find_file(&self.icmp, &self.files[level], ikey);
                match self.files[level].get(index) {
                    Some(f)
                        if ucmp.compare(ukey, format::user_key(&f.smallest))
                            != Ordering::Less =>
                    {
                        vec![f.clone()]
                    }
                    _ => Vec::new(),
                }
            };

            for file in candidates {
                if stats.seek_file.is_none() {
                    if let Some(prev) = last_file_read.take() {
                        // Second table consulted for one lookup: charge the
                        // first.
                        stats.seek_file = Some(prev);
                    }
                }
                last_file_read = Some((level, file.clone()));

                match table_cache.get(ro, file.number, file.file_size, ikey)? {
                    Some((found_key, found_value)) => {
                        let (found_user, _, kind) = format::parse_internal_key(&found_key)?;
                        if ucmp.compare(found_user, ukey) == Ordering::Equal {
                            return match kind {
                                ValueKind::Value => Ok((Some(found_value), stats)),
                                ValueKind::Deletion => Ok((None, stats)),
                                ValueKind::Seek => {
                                    Err(Error::corruption("seek sentinel stored in table"))
                                }
                            };
                        }
                    }
                    None => {}
                }
            }
        }
        Ok((None, stats))
    }

    /// Applies read bookkeeping; returns true when a seek-triggered
    /// compaction became due.
    pub(crate) fn update_stats(&self, stats: GetStats) -> bool {
        if let Some((level, file)) = stats.seek_file {
            if file.charge_seek() {
                let mut target = self.file_to_compact.lock().unwrap();
                if target.is_none() {
                    *target = Some((level, file));
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.file_to_compact.lock().unwrap().is_some()
    }

    /// Whether any file at `level` overlaps the user-key range
    /// [`smallest`, `largest`] (either bound may be open).
    pub(crate) fn overlap_in_level(
        &self,
        level: usize,
        smallest: Option<&[u8]>,
        largest: Option<&[u8]>,
    ) -> bool {
        let ucmp = self.icmp.user_comparator();
        if level == 0 {
            return self.files[0].iter().any(|f| {
                let file_start = format::user_key(&f.smallest);
                let file_limit = format::user_key(&f.largest);
                let starts_after = largest
                    .map_or(false, |l| ucmp.compare(file_start, l) == Ordering::Greater);
                let ends_before = smallest
                    .map_or(false, |s| ucmp.compare(file_limit, s) == Ordering::Less);
                !starts_after && !ends_before
            });
        }

        let files = &self.files[level];
        let index = match smallest {
            Some(small) => {
                let probe = format::pack_internal_key(small, MAX_SEQUENCE_NUMBER, ValueKind::Seek);
                find_file(&self.icmp, files, &probe)
            }
            None => 0,
        };
        match files.get(index) {
            None => false,
            Some(f) => match largest {
                Some(large) => {
                    ucmp.compare(format::user_key(&f.smallest), large) != Ordering::Greater
                }
                None => true,
            },
        }
    }

    /// All files at `level` overlapping the given user-key range. At level
    /// 0 the range grows to cover transitively-overlapping files, matching
    /// the requirement that an L0 compaction picks every overlapping table.
    pub(crate) fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator().clone();
        let mut user_begin = begin.map(|b| b.to_vec());
        let mut user_end = end.map(|e| e.to_vec());
        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let f = self.files[level][i].clone();
            i += 1;
            let file_start = format::user_key(&f.smallest);
            let file_limit = format::user_key(&f.largest);
            if let Some(b) = &user_begin {
                if ucmp.compare(file_limit, b) == Ordering::Less {
                    continue;
                }
            }
            if let Some(e) = &user_end {
                if ucmp.compare(file_start, e) == Ordering::Greater {
                    continue;
                }
            }
            if level == 0 {
                // The new file may widen the range; restart so every
                // transitively overlapping table is included.
                let mut restart = false;
                if let Some(b) = &user_begin {
                    if ucmp.compare(file_start, b) == Ordering::Less {
                        user_begin = Some(file_start.to_vec());
                        restart = true;
                    }
                }
                if let Some(e) = &user_end {
                    if ucmp.compare(file_limit, e) == Ordering::Greater {
                        user_end = Some(file_limit.to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(f);
        }
        inputs
    }

    /// Destination level for a flushed memtable covering the given user-key
    /// range: push past empty, non-overlapping levels (bounded by
    /// `MAX_MEM_COMPACT_LEVEL` and by grandparent overlap) to avoid
    /// re-compacting fresh data immediately.
    pub(crate) fn pick_level_for_memtable_output(
        &self,
        smallest_user: &[u8],
        largest_user: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user), Some(largest_user)) {
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(level + 1, Some(smallest_user), Some(largest_user)) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let grandparents =
                        self.overlapping_inputs(level + 2, Some(smallest_user), Some(largest_user));
                    if total_file_size(&grandparents)
                        > self.options.max_grandparent_overlap_bytes()
                    {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// Child iterators for a full merge over this version: every level-0
    /// table individually, then one concatenating iterator per deeper
    /// level.
    pub(crate) fn iters(
        &self,
        ro: &ReadOptions,
        table_cache: Arc<TableCache>,
    ) -> Result<Vec<Box<dyn InternalIterator>>> {
        let mut iters: Vec<Box<dyn InternalIterator>> = Vec::new();
        for f in &self.files[0] {
            iters.push(Box::new(table_cache.iter(ro, f.number, f.file_size)?));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(Box::new(LevelIterator::new(
                    self.icmp.clone(),
                    self.files[level].clone(),
                    table_cache.clone(),
                    ro.clone(),
                )));
            }
        }
        Ok(iters)
    }

    /// Approximate byte offset of `ikey` within the keyspace of this
    /// version, for size estimation.
    pub(crate) fn approximate_offset_of(&self, ikey: &[u8], table_cache: &TableCache) -> u64 {
        let mut result = 0;
        for (level, files) in self.files.iter().enumerate() {
            for f in files {
                if self.icmp.compare(&f.largest, ikey) != Ordering::Greater {
                    // Entirely before the key.
                    result += f.file_size;
                } else if self.icmp.compare(&f.smallest, ikey) == Ordering::Greater {
                    // Entirely after; deeper files in a sorted level are too.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = table_cache.find_table(f.number, f.file_size) {
                    result += table.approximate_offset_of(ikey);
                }
            }
        }
        result
    }

    /// Recomputes the size-triggered compaction candidate. Level 0 scores
    /// by file count so many small flushes still merge promptly; deeper
    /// levels score by total bytes.
    pub(crate) fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score =
            self.files[0].len() as f64 / crate::options::L0_COMPACTION_TRIGGER as f64;
        for level in 1..NUM_LEVELS - 1 {
            let score =
                total_file_size(&self.files[level]) as f64 / self.options.max_bytes_for_level(level);
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }
}

/// Concatenating cursor over the disjoint, sorted tables of one level.
pub struct LevelIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    table_cache: Arc<TableCache>,
    ro: ReadOptions,
    /// files.len() means "past the end".
    index: usize,
    data: Option<TableIterator>,
    error: Option<Error>,
}

impl LevelIterator {
    pub(crate) fn new(
        icmp: InternalKeyComparator,
        files: Vec<Arc<FileMetaData>>,
        table_cache: Arc<TableCache>,
        ro: ReadOptions,
    ) -> LevelIterator {
        let index = files.len();
        LevelIterator {
            icmp,
            files,
            table_cache,
            ro,
            index,
            data: None,
            error: None,
        }
    }

    fn load_table(&mut self) {
        if self.index >= self.files.len() {
            self.data = None;
            return;
        }
        let f = &self.files[self.index];
        match self.table_cache.iter(&self.ro, f.number, f.file_size) {
            Ok(iter) => self.data = Some(iter),
            Err(e) => {
                self.error.get_or_insert(e);
                self.data = None;
            }
        }
    }

    fn data_valid(&self) -> bool {
        self.data.as_ref().map_or(false, |d| d.valid())
    }

    fn skip_forward(&mut self) {
        while !self.data_valid() {
            if self.index + 1 >= self.files.len() {
                self.index = self.files.len();
                self.data = None;
                return;
            }
            self.index += 1;
            self.load_table();
            if let Some(data) = &mut self.data {
                data.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while !self.data_valid() {
            if self.index == 0 {
                self.index = self.files.len();
                self.data = None;
                return;
            }
            self.index -= 1;
            self.load_table();
            if let Some(data) = &mut self.data {
                data.seek_to_last();
            }
        }
    }
}

impl InternalIterator for LevelIterator {
    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        if self.files.is_empty() {
            self.data = None;
            return;
        }
        self.index = 0;
        self.load_table();
        if let Some(data) = &mut self.data {
            data.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            self.data = None;
            return;
        }
        self.index = self.files.len() - 1;
        self.load_table();
        if let Some(data) = &mut self.data {
            data.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        if self.index >= self.files.len() {
            self.data = None;
            return;
        }
        self.load_table();
        if let Some(data) = &mut self.data {
            data.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = &mut self.data {
            data.next();
        }
        self.skip_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(data) = &mut self.data {
            data.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.data.as_ref().expect("key on invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.data.as_ref().expect("value on invalid iterator").value()
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.to_background());
        }
        if let Some(data) = &self.data {
            data.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn meta(number: u64, smallest: &str, largest: &str) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            1000,
            format::pack_internal_key(smallest.as_bytes(), 5, ValueKind::Value),
            format::pack_internal_key(largest.as_bytes(), 1, ValueKind::Value),
        ))
    }

    fn version_with_level1(files: Vec<Arc<FileMetaData>>) -> Version {
        let mut v = Version::new(Options::default(), icmp());
        v.files[1] = files;
        v
    }

    #[test]
    fn test_find_file() {
        let files = vec![meta(1, "b", "d"), meta(2, "f", "h"), meta(3, "j", "l")];
        let v = version_with_level1(files.clone());
        let probe =
            format::pack_internal_key(b"e", MAX_SEQUENCE_NUMBER, ValueKind::Seek);
        assert_eq!(find_file(v.icmp(), &v.files[1], &probe), 1);
        let probe =
            format::pack_internal_key(b"z", MAX_SEQUENCE_NUMBER, ValueKind::Seek);
        assert_eq!(find_file(v.icmp(), &v.files[1], &probe), 3);
        let probe =
            format::pack_internal_key(b"a", MAX_SEQUENCE_NUMBER, ValueKind::Seek);
        assert_eq!(find_file(v.icmp(), &v.files[1], &probe), 0);
    }

    #[test]
    fn test_overlap_in_level() {
        let v = version_with_level1(vec![meta(1, "b", "d"), meta(2, "f", "h")]);
        assert!(v.overlap_in_level(1, Some(b"c"), Some(b"c")));
        assert!(v.overlap_in_level(1, Some(b"d"), Some(b"e")));
        assert!(!v.overlap_in_level(1, Some(b"dd"), Some(b"ee")));
        assert!(v.overlap_in_level(1, None, Some(b"b")));
        assert!(v.overlap_in_level(1, Some(b"h"), None));
        assert!(!v.overlap_in_level(1, Some(b"i"), None));
    }

    #[test]
    fn test_overlapping_inputs_level0_expands() {
        let mut v = Version::new(Options::default(), icmp());
        // 150..200 overlaps the query; 100..175 overlaps that file; the
        // chain pulls in all three.
        v.files[0] = vec![meta(1, "100", "175"), meta(2, "150", "200"), meta(3, "450", "500")];
        let inputs = v.overlapping_inputs(0, Some(b"180"), Some(b"210"));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_overlapping_inputs_level1() {
        let v = version_with_level1(vec![
            meta(1, "a", "c"),
            meta(2, "e", "g"),
            meta(3, "i", "k"),
        ]);
        let inputs = v.overlapping_inputs(1, Some(b"f"), Some(b"j"));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);

        let all = v.overlapping_inputs(1, None, None);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_seek_budget_floor() {
        let small = FileMetaData::new(1, 100, Vec::new(), Vec::new());
        assert_eq!(small.allowed_seeks.load(AtomicOrdering::Relaxed), 100);
        let big = FileMetaData::new(2, 16384 * 200, Vec::new(), Vec::new());
        assert_eq!(big.allowed_seeks.load(AtomicOrdering::Relaxed), 200);
    }

    #[test]
    fn test_update_stats_triggers_once() {
        let v = version_with_level1(vec![meta(9, "a", "z")]);
        let file = v.files[1][0].clone();
        for _ in 0..99 {
            assert!(!v.update_stats(GetStats {
                seek_file: Some((1, file.clone())),
            }));
        }
        assert!(v.update_stats(GetStats {
            seek_file: Some((1, file.clone())),
        }));
        assert!(v.file_to_compact.lock().unwrap().is_some());
    }

    #[test]
    fn test_finalize_scores() {
        let mut v = Version::new(Options::default(), icmp());
        v.files[0] = vec![meta(1, "a", "b"), meta(2, "c", "d")];
        v.finalize();
        assert_eq!(v.compaction_level, 0);
        assert!((v.compaction_score - 0.5).abs() < 1e-9);
        assert!(!v.needs_compaction());

        for i in 0..8 {
            v.files[0].push(meta(10 + i, "e", "f"));
        }
        v.finalize();
        assert!(v.compaction_score >= 1.0);
        assert!(v.needs_compaction());
    }
}
