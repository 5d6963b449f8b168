//! The session around the version chain: file-number allocation, the
//! manifest log, recovery, and compaction input selection.

use crate::compact::Compaction;
use crate::comparator::{Comparator, InternalKeyComparator};
use crate::env::{
    manifest_file_name, parse_file_name, read_current_file, set_current_file, FileKind, Storage,
};
use crate::error::Error;
use crate::format::{self, SequenceNumber};
use crate::journal::{JournalReader, JournalWriter};
use crate::options::{Options, NUM_LEVELS};
use crate::sstable::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::{total_file_size, FileMetaData, Version};
use crate::Result;
use log::{info, warn};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

/// Accumulates one or more edits on top of a base version.
struct VersionBuilder {
    levels: Vec<LevelState>,
}

#[derive(Default)]
struct LevelState {
    deleted: HashSet<u64>,
    added: Vec<Arc<FileMetaData>>,
}

impl VersionBuilder {
    fn new() -> VersionBuilder {
        VersionBuilder {
            levels: (0..NUM_LEVELS).map(|_| LevelState::default()).collect(),
        }
    }

    fn apply(&mut self, edit: &VersionEdit, compaction_pointers: &mut [Vec<u8>]) {
        for (level, key) in &edit.compaction_pointers {
            compaction_pointers[*level] = key.clone();
        }
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted.insert(*number);
        }
        for (level, file) in &edit.new_files {
            self.levels[*level].deleted.remove(&file.number);
            self.levels[*level].added.push(Arc::new(FileMetaData::new(
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            )));
        }
    }

    fn build(self, base: &Version, options: Options, icmp: InternalKeyComparator) -> Version {
        let mut version = Version::new(options, icmp.clone());
        for (level, state) in self.levels.into_iter().enumerate() {
            let mut files: Vec<Arc<FileMetaData>> = base.files[level]
                .iter()
                .filter(|f| !state.deleted.contains(&f.number))
                .cloned()
                .collect();
            files.extend(
                state
                    .added
                    .into_iter()
                    .filter(|f| !state.deleted.contains(&f.number)),
            );
            if level == 0 {
                // Insertion order: newest file (largest number) last.
                files.sort_by_key(|f| f.number);
            } else {
                files.sort_by(|a, b| icmp.compare(&a.smallest, &b.smallest));
                debug_assert!(
                    files
                        .windows(2)
                        .all(|w| icmp.compare(&w[0].largest, &w[1].smallest) == Ordering::Less),
                    "overlapping tables in level {}",
                    level
                );
            }
            version.files[level] = files;
        }
        version
    }
}

pub struct VersionSet {
    storage: Arc<dyn Storage>,
    db_path: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    pub(crate) table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    /// Journals numbered below this are no longer needed for recovery.
    pub(crate) log_number: u64,
    /// Journal of the previous memtable still awaiting flush (0 if none).
    pub(crate) prev_log_number: u64,
    last_sequence: Arc<AtomicU64>,

    current: Arc<Version>,
    /// Every version handed out and possibly still referenced.
    live: Vec<Weak<Version>>,
    manifest: Option<JournalWriter>,
    compaction_pointers: Vec<Vec<u8>>,
    /// Table files being written by an in-flight flush or compaction.
    pub(crate) pending_outputs: HashSet<u64>,
}

impl VersionSet {
    pub fn new(
        storage: Arc<dyn Storage>,
        db_path: PathBuf,
        options: Options,
        table_cache: Arc<TableCache>,
        last_sequence: Arc<AtomicU64>,
    ) -> VersionSet {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let current = Arc::new(Version::new(options.clone(), icmp.clone()));
        VersionSet {
            storage,
            db_path,
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            log_number: 0,
            prev_log_number: 0,
            last_sequence,
            current,
            live: Vec::new(),
            manifest: None,
            compaction_pointers: vec![Vec::new(); NUM_LEVELS],
            pending_outputs: HashSet::new(),
        }
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(AtomicOrdering::Acquire)
    }

    pub fn alloc_file_num(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Hands back an allocated number if nothing newer was taken meanwhile.
    pub fn reuse_file_num(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    /// Initializes an empty database: MANIFEST-1 with a blank edit and a
    /// CURRENT pointing at it.
    pub fn create_new_db(&mut self) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.icmp.user_comparator().name().to_string());
        edit.log_number = Some(0);
        edit.next_file_number = Some(2);
        edit.last_sequence = Some(0);

        let manifest_num = 1;
        let path = manifest_file_name(&self.db_path, manifest_num);
        let file = self.storage.create(&path)?;
        let mut writer = JournalWriter::new(file);
        let result = writer
            .add_record(&edit.encode())
            .and_then(|_| writer.sync())
            .and_then(|_| set_current_file(self.storage.as_ref(), &self.db_path, manifest_num));
        if result.is_err() {
            let _ = self.storage.remove(&path);
        }
        result
    }

    /// Replays the manifest named by CURRENT into the live version and
    /// restores the persistent counters. Manifest corruption is fatal.
    pub fn recover(&mut self) -> Result<()> {
        let manifest_name = read_current_file(self.storage.as_ref(), &self.db_path)?;
        let manifest_path = self.db_path.join(&manifest_name);
        let mut reader = JournalReader::new(self.storage.open_sequential(&manifest_path)?);

        let mut builder = VersionBuilder::new();
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator_name {
                let expected = self.icmp.user_comparator().name();
                if name != expected {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: database uses {}, options supply {}",
                        name, expected
                    )));
                }
            }
            builder.apply(&edit, &mut self.compaction_pointers);
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let next_file_number = next_file_number
            .ok_or_else(|| Error::corruption("manifest has no next-file-number entry"))?;
        let log_number =
            log_number.ok_or_else(|| Error::corruption("manifest has no log-number entry"))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::corruption("manifest has no last-sequence entry"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut version = builder.build(&self.current, self.options.clone(), self.icmp.clone());
        version.finalize();
        self.install(Arc::new(version));

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.last_sequence
            .store(last_sequence, AtomicOrdering::Release);
        // The old manifest is not appended to; a fresh one is written on
        // the first applied edit.
        self.manifest_file_number = self.alloc_file_num();
        info!(
            "recovered manifest {}: {}",
            manifest_name,
            self.current.level_summary()
        );
        Ok(())
    }

    fn install(&mut self, version: Arc<Version>) {
        self.live.retain(|w| w.strong_count() > 0);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }

    /// Applies `edit` to the current version, persists it in the manifest
    /// (fsynced), swaps CURRENT on a fresh manifest, and installs the new
    /// version. Any error leaves the previous version current.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(n) => debug_assert!(n >= self.log_number && n < self.next_file_number),
            None => edit.log_number = Some(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.prev_log_number = Some(self.prev_log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence());

        let mut builder = VersionBuilder::new();
        builder.apply(edit, &mut self.compaction_pointers);
        let mut version = builder.build(&self.current, self.options.clone(), self.icmp.clone());
        version.finalize();

        let mut created_manifest = false;
        if self.manifest.is_none() {
            let path = manifest_file_name(&self.db_path, self.manifest_file_number);
            let file = self.storage.create(&path)?;
            let mut writer = JournalWriter::new(file);
            if let Err(e) = self.write_snapshot(&mut writer) {
                let _ = self.storage.remove(&path);
                return Err(e);
            }
            self.manifest = Some(writer);
            created_manifest = true;
        }

        let record = edit.encode();
        let writer = self.manifest.as_mut().unwrap();
        let write_result = writer.add_record(&record).and_then(|_| writer.sync());
        if let Err(e) = write_result {
            warn!("manifest write failed: {}", e);
            if created_manifest {
                self.manifest = None;
                let _ = self
                    .storage
                    .remove(&manifest_file_name(&self.db_path, self.manifest_file_number));
            }
            return Err(e);
        }
        if created_manifest {
            if let Err(e) =
                set_current_file(self.storage.as_ref(), &self.db_path, self.manifest_file_number)
            {
                // CURRENT still names the old manifest; writing more edits
                // to the new one would lose them on recovery.
                self.manifest = None;
                let _ = self
                    .storage
                    .remove(&manifest_file_name(&self.db_path, self.manifest_file_number));
                return Err(e);
            }
        }

        self.install(Arc::new(version));
        self.log_number = edit.log_number.unwrap();
        self.prev_log_number = edit.prev_log_number.unwrap();
        Ok(())
    }

    /// Writes the full current state as one edit, the first record of every
    /// new manifest.
    fn write_snapshot(&self, writer: &mut JournalWriter) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.icmp.user_comparator().name().to_string());
        for (level, key) in self.compaction_pointers.iter().enumerate() {
            if !key.is_empty() {
                edit.set_compaction_pointer(level, key.clone());
            }
        }
        for (level, files) in self.current.files.iter().enumerate() {
            for f in files {
                edit.add_file(level, f.number, f.file_size, f.smallest.clone(), f.largest.clone());
            }
        }
        writer.add_record(&edit.encode())
    }

    /// Table numbers referenced by any still-reachable version, plus
    /// in-flight outputs.
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.live.retain(|w| w.strong_count() > 0);
        let mut live: HashSet<u64> = self.pending_outputs.iter().copied().collect();
        for weak in &self.live {
            if let Some(version) = weak.upgrade() {
                for files in &version.files {
                    for f in files {
                        live.insert(f.number);
                    }
                }
            }
        }
        live
    }

    /// Deletes files no longer needed: journals below the recovery horizon,
    /// superseded manifests, and tables referenced by no live version.
    pub fn remove_obsolete_files(&mut self) {
        let live = self.live_files();
        let names = match self.storage.list(&self.db_path) {
            Ok(names) => names,
            Err(e) => {
                warn!("listing database directory failed: {}", e);
                return;
            }
        };
        for name in names {
            if let Some((kind, number)) = parse_file_name(&name) {
                let keep = match kind {
                    FileKind::Journal => {
                        number >= self.log_number || number == self.prev_log_number
                    }
                    FileKind::Manifest => number >= self.manifest_file_number,
                    FileKind::Table => live.contains(&number),
                    FileKind::Temp => live.contains(&number),
                    FileKind::Current | FileKind::Lock => true,
                };
                if !keep {
                    if kind == FileKind::Table {
                        self.table_cache.evict(number);
                    }
                    info!("deleting {:?} file {}", kind, name);
                    if let Err(e) = self.storage.remove(&self.db_path.join(&name)) {
                        warn!("deleting {} failed: {}", name, e);
                    }
                }
            }
        }
    }

    /// Smallest and largest internal keys across `files`.
    fn key_range(&self, files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for f in &files[1..] {
            if self.icmp.compare(&f.smallest, &smallest) == Ordering::Less {
                smallest = f.smallest.clone();
            }
            if self.icmp.compare(&f.largest, &largest) == Ordering::Greater {
                largest = f.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn key_range2(
        &self,
        a: &[Arc<FileMetaData>],
        b: &[Arc<FileMetaData>],
    ) -> (Vec<u8>, Vec<u8>) {
        let mut all: Vec<Arc<FileMetaData>> = a.to_vec();
        all.extend_from_slice(b);
        self.key_range(&all)
    }

    /// Chooses the next compaction: a table whose seek budget ran out takes
    /// precedence, otherwise the highest-scoring level if any scores at
    /// least 1.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();

        let seek_target = current.file_to_compact.lock().unwrap().take();
        let (level, seed) = if let Some((level, file)) = seek_target {
            (level, file)
        } else if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            // Round-robin within the level: first table past the last
            // compacted key, wrapping to the front.
            let pointer = &self.compaction_pointers[level];
            let seed = current.files[level]
                .iter()
                .find(|f| {
                    pointer.is_empty()
                        || self.icmp.compare(&f.largest, pointer) == Ordering::Greater
                })
                .or_else(|| current.files[level].first())?
                .clone();
            (level, seed)
        } else {
            return None;
        };

        let mut compaction = Compaction::new(&self.options, level, current.clone());
        compaction.inputs[0] = vec![seed];
        if level == 0 {
            // Level-0 tables overlap each other; the seed drags in every
            // table touching its range.
            let (smallest, largest) = self.key_range(&compaction.inputs[0]);
            compaction.inputs[0] = current.overlapping_inputs(
                0,
                Some(format::user_key(&smallest)),
                Some(format::user_key(&largest)),
            );
            debug_assert!(!compaction.inputs[0].is_empty());
        }
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Builds a compaction for an explicit user-key range at `level`.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        if level > 0 {
            // Bound one manual compaction to roughly one output file's
            // worth of input; callers re-issue for the remainder.
            let limit = self.options.max_file_size;
            let mut total = 0;
            for (i, f) in inputs.iter().enumerate() {
                total += f.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }
        let mut compaction = Compaction::new(&self.options, level, current);
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let current = compaction.input_version.clone();
        let level = compaction.level;
        let (smallest, mut largest) = self.key_range(&compaction.inputs[0]);
        compaction.inputs[1] = current.overlapping_inputs(
            level + 1,
            Some(format::user_key(&smallest)),
            Some(format::user_key(&largest)),
        );
        let (mut all_start, mut all_limit) =
            self.key_range2(&compaction.inputs[0], &compaction.inputs[1]);

        // See whether the level-L+1 range lets us pull extra level-L tables
        // in for free, without changing the L+1 input set and without
        // making the merge unreasonably large.
        if !compaction.inputs[1].is_empty() {
            let expanded0 = current.overlapping_inputs(
                level,
                Some(format::user_key(&all_start)),
                Some(format::user_key(&all_limit)),
            );
            let inputs1_size = total_file_size(&compaction.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > compaction.inputs[0].len()
                && inputs1_size + expanded0_size < self.options.expanded_compaction_byte_limit()
            {
                let (new_start, new_limit) = self.key_range(&expanded0);
                let expanded1 = current.overlapping_inputs(
                    level + 1,
                    Some(format::user_key(&new_start)),
                    Some(format::user_key(&new_limit)),
                );
                if expanded1.len() == compaction.inputs[1].len() {
                    info!(
                        "expanding level-{} compaction: {}+{} to {}+{} files",
                        level,
                        compaction.inputs[0].len(),
                        compaction.inputs[1].len(),
                        expanded0.len(),
                        expanded1.len()
                    );
                    largest = new_limit;
                    compaction.inputs[0] = expanded0;
                    compaction.inputs[1] = expanded1;
                    let range = self.key_range2(&compaction.inputs[0], &compaction.inputs[1]);
                    all_start = range.0;
                    all_limit = range.1;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            compaction.grandparents = current.overlapping_inputs(
                level + 2,
                Some(format::user_key(&all_start)),
                Some(format::user_key(&all_limit)),
            );
        }

        // Resume the next size-triggered pass after this range, even if the
        // compaction later fails.
        self.compaction_pointers[level] = largest.clone();
        compaction.edit.set_compaction_pointer(level, largest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::env::MemStorage;
    use crate::format::ValueKind;

    fn new_set(storage: MemStorage) -> VersionSet {
        let options = Options::default();
        let storage: Arc<dyn Storage> = Arc::new(storage);
        let cache = Arc::new(TableCache::new(
            storage.clone(),
            PathBuf::from("/db"),
            options.clone(),
            Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator))),
        ));
        VersionSet::new(
            storage,
            PathBuf::from("/db"),
            options,
            cache,
            Arc::new(AtomicU64::new(0)),
        )
    }

    fn ikey(user: &str, seq: u64) -> Vec<u8> {
        format::pack_internal_key(user.as_bytes(), seq, ValueKind::Value)
    }

    #[test]
    fn test_create_recover_roundtrip() {
        let storage = MemStorage::new();
        let mut set = new_set(storage.clone());
        set.create_new_db().unwrap();
        set.recover().unwrap();
        assert_eq!(set.log_number, 0);
        assert_eq!(set.current().num_files(0), 0);

        let mut edit = VersionEdit::new();
        let log = set.alloc_file_num();
        edit.log_number = Some(log);
        edit.add_file(0, set.alloc_file_num(), 1024, ikey("a", 1), ikey("m", 9));
        set.log_and_apply(&mut edit).unwrap();
        assert_eq!(set.current().num_files(0), 1);

        // A second session sees the applied edit.
        let mut set2 = new_set(storage);
        set2.recover().unwrap();
        assert_eq!(set2.current().num_files(0), 1);
        assert_eq!(set2.log_number, log);
    }

    #[test]
    fn test_apply_delete_and_add() {
        let storage = MemStorage::new();
        let mut set = new_set(storage);
        set.create_new_db().unwrap();
        set.recover().unwrap();

        let mut edit = VersionEdit::new();
        let table = set.alloc_file_num();
        edit.add_file(1, table, 2048, ikey("a", 1), ikey("f", 2));
        set.log_and_apply(&mut edit).unwrap();

        let mut edit = VersionEdit::new();
        edit.delete_file(1, table);
        let out = set.alloc_file_num();
        edit.add_file(2, out, 2048, ikey("a", 1), ikey("f", 2));
        set.log_and_apply(&mut edit).unwrap();

        let v = set.current();
        assert_eq!(v.num_files(1), 0);
        assert_eq!(v.num_files(2), 1);
        assert_eq!(v.files[2][0].number, out);
    }

    #[test]
    fn test_last_sequence_persisted() {
        let storage = MemStorage::new();
        let mut set = new_set(storage.clone());
        set.create_new_db().unwrap();
        set.recover().unwrap();
        set.last_sequence.store(777, AtomicOrdering::Release);
        let mut edit = VersionEdit::new();
        set.log_and_apply(&mut edit).unwrap();

        let mut set2 = new_set(storage);
        set2.recover().unwrap();
        assert_eq!(set2.last_sequence(), 777);
    }

    #[test]
    fn test_manifest_write_failure_keeps_version() {
        let storage = MemStorage::new();
        let mut set = new_set(storage.clone());
        set.create_new_db().unwrap();
        set.recover().unwrap();

        let mut good = VersionEdit::new();
        good.add_file(0, set.alloc_file_num(), 100, ikey("a", 1), ikey("b", 2));
        set.log_and_apply(&mut good).unwrap();

        storage.fail_writes_containing("MANIFEST");
        let mut bad = VersionEdit::new();
        bad.add_file(0, set.alloc_file_num(), 100, ikey("c", 3), ikey("d", 4));
        assert!(set.log_and_apply(&mut bad).is_err());
        // The failed edit must not be visible.
        assert_eq!(set.current().num_files(0), 1);

        storage.clear_write_failures();
        let mut set2 = new_set(storage);
        set2.recover().unwrap();
        assert_eq!(set2.current().num_files(0), 1);
    }

    #[test]
    fn test_comparator_mismatch_is_fatal() {
        let storage = MemStorage::new();
        let mut set = new_set(storage.clone());
        set.create_new_db().unwrap();
        set.recover().unwrap();

        struct ReversedComparator;
        impl Comparator for ReversedComparator {
            fn name(&self) -> &'static str {
                "test.ReversedComparator"
            }
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                b.cmp(a)
            }
            fn separator(&self, a: &[u8], _b: &[u8]) -> Vec<u8> {
                a.to_vec()
            }
            fn successor(&self, a: &[u8]) -> Vec<u8> {
                a.to_vec()
            }
        }

        let options = Options {
            comparator: Arc::new(ReversedComparator),
            ..Options::default()
        };
        let storage: Arc<dyn Storage> = Arc::new(storage);
        let cache = Arc::new(TableCache::new(
            storage.clone(),
            PathBuf::from("/db"),
            options.clone(),
            Arc::new(InternalKeyComparator::new(options.comparator.clone())),
        ));
        let mut mismatched = VersionSet::new(
            storage,
            PathBuf::from("/db"),
            options,
            cache,
            Arc::new(AtomicU64::new(0)),
        );
        assert!(matches!(
            mismatched.recover(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_file_number_reuse() {
        let storage = MemStorage::new();
        let mut set = new_set(storage);
        let a = set.alloc_file_num();
        set.reuse_file_num(a);
        let b = set.alloc_file_num();
        assert_eq!(a, b);

        let c = set.alloc_file_num();
        set.reuse_file_num(b);
        assert_eq!(set.alloc_file_num(), c + 1);
    }
}
