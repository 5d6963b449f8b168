//! The compaction engine: a single long-running worker owns all table
//! creation and deletion. Writers and the manual-compaction API talk to it
//! over a control channel; errors it hits become sticky until the database
//! is reopened.

use crate::comparator::Comparator;
use crate::db::DbInner;
use crate::env::table_file_name;
use crate::error::Error;
use crate::format::{self, ValueKind, MAX_SEQUENCE_NUMBER};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::memtable::MemTable;
use crate::options::{Options, ReadOptions, NUM_LEVELS};
use crate::sstable::TableBuilder;
use crate::version::edit::VersionEdit;
use crate::version::{total_file_size, FileMetaData, LevelIterator, Version};
use crate::Result;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

/// Control messages from the database facade to the compaction worker.
pub(crate) enum BgSignal {
    /// Something may need compacting; idempotent.
    Schedule,
    /// Drain all pending work, then reply with the sticky error state.
    Wait(Sender<std::result::Result<(), String>>),
    /// Compact every table at `level` overlapping the given user-key range.
    Range {
        level: usize,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        done: Sender<std::result::Result<(), String>>,
    },
    Shutdown,
}

/// A planned compaction: seed inputs at `level`, overlapping inputs at
/// `level + 1`, and the grandparent tables used to bound output size.
pub struct Compaction {
    pub(crate) level: usize,
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,
    pub(crate) edit: VersionEdit,
    pub(crate) input_version: Arc<Version>,

    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    // Per-level scan positions for is_base_level_for_key.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(options: &Options, level: usize, input_version: Arc<Version>) -> Compaction {
        Compaction {
            level,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            edit: VersionEdit::new(),
            input_version,
            max_output_file_size: options.max_file_size,
            max_grandparent_overlap: options.max_grandparent_overlap_bytes(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub(crate) fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// A single input table with nothing to merge against can simply be
    /// reassigned to the next level, unless that would pile up grandparent
    /// overlap for later merges.
    pub(crate) fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    pub(crate) fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for f in &self.inputs[which] {
                self.edit.delete_file(self.level + which, f.number);
            }
        }
    }

    /// True when no level deeper than the output level contains `user_key`,
    /// so its tombstones can be dropped. The per-level cursors rely on the
    /// compaction visiting keys in ascending order.
    pub(crate) fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let ucmp = self.input_version.icmp().user_comparator().clone();
        for level in self.level + 2..NUM_LEVELS {
            let files = &self.input_version.files[level];
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, format::user_key(&f.largest)) != Ordering::Greater {
                    if ucmp.compare(user_key, format::user_key(&f.smallest)) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True when the current output should be cut before `ikey` because it
    /// already overlaps too much of level + 2.
    pub(crate) fn should_stop_before(&mut self, ikey: &[u8]) -> bool {
        let icmp = self.input_version.icmp();
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(ikey, &self.grandparents[self.grandparent_index].largest)
                == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;
        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// Merged view of all inputs: level-0 tables each get their own cursor,
    /// deeper inputs are concatenated.
    pub(crate) fn make_input_iterator(
        &self,
        table_cache: &Arc<crate::sstable::TableCache>,
    ) -> Result<MergingIterator> {
        let ro = ReadOptions {
            verify_checksums: false,
            fill_cache: false,
            snapshot: None,
        };
        let icmp = self.input_version.icmp().clone();
        let mut iters: Vec<Box<dyn InternalIterator>> = Vec::new();
        if self.level == 0 {
            for f in &self.inputs[0] {
                iters.push(Box::new(table_cache.iter(&ro, f.number, f.file_size)?));
            }
        } else if !self.inputs[0].is_empty() {
            iters.push(Box::new(LevelIterator::new(
                icmp.clone(),
                self.inputs[0].clone(),
                table_cache.clone(),
                ro.clone(),
            )));
        }
        if !self.inputs[1].is_empty() {
            iters.push(Box::new(LevelIterator::new(
                icmp.clone(),
                self.inputs[1].clone(),
                table_cache.clone(),
                ro,
            )));
        }
        Ok(MergingIterator::new(icmp, iters))
    }
}

/// Writes the contents of `mem` as one table file, returning its size and
/// key range, or `None` when the memtable is empty. Shared by the flush
/// path and journal replay during open.
pub(crate) fn build_memtable_table(
    storage: &Arc<dyn crate::env::Storage>,
    db_path: &std::path::Path,
    options: &Options,
    icmp: &crate::comparator::InternalKeyComparator,
    table_cache: &crate::sstable::TableCache,
    mem: &Arc<MemTable>,
    file_number: u64,
) -> Result<Option<(u64, Vec<u8>, Vec<u8>)>> {
    let mut iter = mem.iter();
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let path = table_file_name(db_path, file_number);
    let file = storage.create(&path)?;
    let mut builder = TableBuilder::new(options.clone(), Arc::new(icmp.clone()), file);

    let smallest = iter.key().to_vec();
    let mut largest = smallest.clone();
    while iter.valid() {
        largest.clear();
        largest.extend_from_slice(iter.key());
        builder.add(&largest, iter.value())?;
        iter.next();
    }
    let build_result = builder.finish(true);
    if let Err(e) = build_result {
        let _ = storage.remove(&path);
        return Err(e);
    }

    // Confirm the new table is readable before publishing it.
    table_cache.find_table(file_number, builder.file_size())?;
    Ok(Some((builder.file_size(), smallest, largest)))
}

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

#[derive(Default)]
struct CompactionState {
    outputs: Vec<CompactionOutput>,
    builder: Option<TableBuilder>,
    current_number: u64,
    current_smallest: Vec<u8>,
    current_largest: Vec<u8>,
}

/// Worker loop. Signals arrive in order, so a `Wait` reply is only sent
/// once everything enqueued before it has been processed.
pub(crate) fn run_worker(inner: Arc<DbInner>, signals: Receiver<BgSignal>) {
    info!("compaction worker started");
    while let Ok(signal) = signals.recv() {
        match signal {
            BgSignal::Shutdown => break,
            BgSignal::Schedule => inner.background_work(),
            BgSignal::Wait(done) => {
                inner.background_work();
                let _ = done.send(inner.background_error_message());
            }
            BgSignal::Range {
                level,
                begin,
                end,
                done,
            } => {
                let result = inner
                    .manual_compaction(level, begin.as_deref(), end.as_deref())
                    .map_err(|e| e.to_string());
                if let Err(e) = &result {
                    inner.record_background_error(e.clone());
                }
                inner.wake_waiters();
                let _ = done.send(result);
            }
        }
    }
    info!("compaction worker exiting");
}

impl DbInner {
    /// Runs flushes and compactions until there is nothing left to do.
    /// Called only from the worker thread.
    pub(crate) fn background_work(&self) {
        loop {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                break;
            }
            if self.background_error_message().is_err() {
                // Sticky: no further work until reopen.
                break;
            }
            let progressed = match self.background_compaction() {
                Ok(progressed) => progressed,
                Err(e) => {
                    warn!("background compaction failed: {}", e);
                    self.record_background_error(e.to_string());
                    false
                }
            };
            self.wake_waiters();
            if !progressed {
                break;
            }
        }
        self.wake_waiters();
    }

    /// One unit of background work, in priority order: flush the frozen
    /// memtable, else run the best-scoring compaction. Returns false when
    /// idle.
    fn background_compaction(&self) -> Result<bool> {
        if self.imm.read().unwrap().is_some() {
            self.compact_memtable()?;
            return Ok(true);
        }

        let compaction = {
            let mut versions = self.versions.lock().unwrap();
            if !versions.current().needs_compaction() {
                None
            } else {
                versions.pick_compaction()
            }
        };
        match compaction {
            None => Ok(false),
            Some(mut c) if c.is_trivial_move() => {
                let f = c.inputs[0][0].clone();
                c.edit.delete_file(c.level, f.number);
                c.edit.add_file(
                    c.level + 1,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
                let mut versions = self.versions.lock().unwrap();
                versions.log_and_apply(&mut c.edit)?;
                info!(
                    "moved table #{} ({} bytes) to level {}: {}",
                    f.number,
                    f.file_size,
                    c.level + 1,
                    versions.current().level_summary()
                );
                versions.remove_obsolete_files();
                Ok(true)
            }
            Some(mut c) => {
                self.do_compaction_work(&mut c)?;
                Ok(true)
            }
        }
    }

    pub(crate) fn manual_compaction(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        if self.imm.read().unwrap().is_some() {
            self.compact_memtable()?;
        }
        let compaction = self.versions.lock().unwrap().compact_range(level, begin, end);
        match compaction {
            None => Ok(()),
            Some(mut c) => {
                debug!(
                    "manual compaction of {} files at level {}",
                    c.inputs[0].len(),
                    level
                );
                self.do_compaction_work(&mut c)
            }
        }
    }

    /// Flushes the frozen memtable to a table and publishes the edit. The
    /// edit also advances the recovery horizon past the retired journal.
    pub(crate) fn compact_memtable(&self) -> Result<()> {
        let imm = self
            .imm
            .read()
            .unwrap()
            .clone()
            .expect("no frozen memtable to flush");

        let mut edit = VersionEdit::new();
        let base = self.versions.lock().unwrap().current();
        self.write_level0_table(&imm, &mut edit, Some(&base))?;

        if self.shutting_down.load(AtomicOrdering::Acquire) {
            return Err(Error::Background(
                "database shut down during memtable flush".to_string(),
            ));
        }

        edit.log_number = Some(self.journal_number.load(AtomicOrdering::Acquire));
        edit.prev_log_number = Some(0);
        let mut versions = self.versions.lock().unwrap();
        versions.log_and_apply(&mut edit)?;
        *self.imm.write().unwrap() = None;
        versions.remove_obsolete_files();
        debug!("memtable flush complete: {}", versions.current().level_summary());
        Ok(())
    }

    /// Builds a single table from `mem` and records it in `edit`. With a
    /// base version the table may land below level 0 when nothing overlaps.
    pub(crate) fn write_level0_table(
        &self,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Version>,
    ) -> Result<()> {
        let file_number = {
            let mut versions = self.versions.lock().unwrap();
            let n = versions.alloc_file_num();
            versions.pending_outputs.insert(n);
            n
        };

        let result = self.build_memtable_table(mem, file_number);

        let mut versions = self.versions.lock().unwrap();
        versions.pending_outputs.remove(&file_number);
        match result {
            Ok(Some((file_size, smallest, largest))) => {
                let level = match base {
                    Some(base) => base.pick_level_for_memtable_output(
                        format::user_key(&smallest),
                        format::user_key(&largest),
                    ),
                    None => 0,
                };
                info!(
                    "flushed memtable to table #{} ({} bytes) at level {}",
                    file_number, file_size, level
                );
                edit.add_file(level, file_number, file_size, smallest, largest);
                Ok(())
            }
            Ok(None) => {
                versions.reuse_file_num(file_number);
                Ok(())
            }
            Err(e) => {
                versions.reuse_file_num(file_number);
                let _ = self
                    .storage
                    .remove(&table_file_name(&self.db_path, file_number));
                Err(e)
            }
        }
    }

    fn build_memtable_table(
        &self,
        mem: &Arc<MemTable>,
        file_number: u64,
    ) -> Result<Option<(u64, Vec<u8>, Vec<u8>)>> {
        build_memtable_table(
            &self.storage,
            &self.db_path,
            &self.options,
            &self.icmp,
            &self.table_cache,
            mem,
            file_number,
        )
    }

    /// The merge loop: walk all inputs in order, drop shadowed entries and
    /// dead tombstones, cut outputs on size and grandparent overlap, then
    /// publish one edit swapping inputs for outputs.
    fn do_compaction_work(&self, c: &mut Compaction) -> Result<()> {
        info!(
            "compacting {} files at level {} with {} files at level {}",
            c.inputs[0].len(),
            c.level,
            c.inputs[1].len(),
            c.level + 1
        );

        // Entries below every registered snapshot can drop older duplicates.
        let smallest_snapshot = self
            .snapshots
            .lock()
            .unwrap()
            .smallest()
            .unwrap_or_else(|| self.last_sequence.load(AtomicOrdering::Acquire));

        let mut input = c.make_input_iterator(&self.table_cache)?;
        input.seek_to_first();

        let ucmp = self.icmp.user_comparator().clone();
        let mut state = CompactionState::default();
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        let mut result: Result<()> = Ok(());
        while input.valid() {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                result = Err(Error::Background(
                    "database shut down during compaction".to_string(),
                ));
                break;
            }
            // Flushes take priority so stalled writers unblock quickly.
            if self.imm.read().unwrap().is_some() {
                if let Err(e) = self.compact_memtable() {
                    result = Err(e);
                    break;
                }
                self.wake_waiters();
            }

            let key = input.key().to_vec();
            if state.builder.is_some() && c.should_stop_before(&key) {
                if let Err(e) = self.finish_compaction_output(&mut state) {
                    result = Err(e);
                    break;
                }
            }

            let mut drop_entry = false;
            match format::parse_internal_key(&key) {
                Err(_) => {
                    // Carry unparsable entries through unchanged.
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Ok((user_key, seq, kind)) => {
                    let first_occurrence = current_user_key
                        .as_deref()
                        .map_or(true, |cur| ucmp.compare(user_key, cur) != Ordering::Equal);
                    if first_occurrence {
                        current_user_key = Some(user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // A newer entry for this key, itself at or below the
                        // horizon, has already been emitted.
                        drop_entry = true;
                    } else if kind == ValueKind::Deletion
                        && seq <= smallest_snapshot
                        && c.is_base_level_for_key(user_key)
                    {
                        // No deeper level holds this key, so the tombstone
                        // has nothing left to shadow.
                        drop_entry = true;
                    }
                    last_sequence_for_key = seq;
                }
            }

            if !drop_entry {
                if state.builder.is_none() {
                    if let Err(e) = self.open_compaction_output(&mut state) {
                        result = Err(e);
                        break;
                    }
                }
                let builder = state.builder.as_mut().unwrap();
                if builder.is_empty() {
                    state.current_smallest = key.clone();
                }
                state.current_largest.clear();
                state.current_largest.extend_from_slice(&key);
                if let Err(e) = builder.add(&key, input.value()) {
                    result = Err(e);
                    break;
                }
                if builder.file_size() >= c.max_output_file_size() {
                    if let Err(e) = self.finish_compaction_output(&mut state) {
                        result = Err(e);
                        break;
                    }
                }
            }

            input.next();
        }

        if result.is_ok() && state.builder.is_some() {
            result = self.finish_compaction_output(&mut state);
        }
        if result.is_ok() {
            result = input.status();
        }
        drop(input);

        match result {
            Ok(()) => self.install_compaction_results(c, state),
            Err(e) => {
                self.discard_compaction_outputs(state);
                Err(e)
            }
        }
    }

    fn open_compaction_output(&self, state: &mut CompactionState) -> Result<()> {
        let number = {
            let mut versions = self.versions.lock().unwrap();
            let n = versions.alloc_file_num();
            versions.pending_outputs.insert(n);
            n
        };
        let path = table_file_name(&self.db_path, number);
        let file = self.storage.create(&path)?;
        state.builder = Some(TableBuilder::new(
            self.options.clone(),
            Arc::new(self.icmp.clone()),
            file,
        ));
        state.current_number = number;
        Ok(())
    }

    fn finish_compaction_output(&self, state: &mut CompactionState) -> Result<()> {
        let mut builder = state.builder.take().expect("no output open");
        debug_assert!(!builder.is_empty());
        let num_entries = builder.num_entries();
        builder.finish(true)?;
        let file_size = builder.file_size();
        state.outputs.push(CompactionOutput {
            number: state.current_number,
            file_size,
            smallest: std::mem::take(&mut state.current_smallest),
            largest: std::mem::take(&mut state.current_largest),
        });
        // Confirm the output is readable before it can be published.
        self.table_cache.find_table(state.current_number, file_size)?;
        debug!(
            "generated table #{}: {} entries, {} bytes",
            state.current_number, num_entries, file_size
        );
        Ok(())
    }

    fn install_compaction_results(
        &self,
        c: &mut Compaction,
        state: CompactionState,
    ) -> Result<()> {
        c.add_input_deletions();
        for out in &state.outputs {
            c.edit.add_file(
                c.level + 1,
                out.number,
                out.file_size,
                out.smallest.clone(),
                out.largest.clone(),
            );
        }

        let mut versions = self.versions.lock().unwrap();
        let result = versions.log_and_apply(&mut c.edit);
        for out in &state.outputs {
            versions.pending_outputs.remove(&out.number);
        }
        match result {
            Ok(()) => {
                info!(
                    "compacted level {}: {} inputs => {} outputs ({} bytes), now {}",
                    c.level,
                    c.inputs[0].len() + c.inputs[1].len(),
                    state.outputs.len(),
                    state.outputs.iter().map(|o| o.file_size).sum::<u64>(),
                    versions.current().level_summary()
                );
                versions.remove_obsolete_files();
                Ok(())
            }
            Err(e) => {
                drop(versions);
                self.discard_compaction_outputs(state);
                Err(e)
            }
        }
    }

    fn discard_compaction_outputs(&self, state: CompactionState) {
        let mut versions = self.versions.lock().unwrap();
        for out in &state.outputs {
            versions.pending_outputs.remove(&out.number);
            self.table_cache.evict(out.number);
            let _ = self
                .storage
                .remove(&table_file_name(&self.db_path, out.number));
        }
        if state.builder.is_some() {
            versions.pending_outputs.remove(&state.current_number);
            let _ = self
                .storage
                .remove(&table_file_name(&self.db_path, state.current_number));
        }
    }
}
