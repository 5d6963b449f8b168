//! The database facade: accepts writes, serves reads, rotates memtables,
//! and coordinates with the compaction worker over a control channel.

use crate::batch::WriteBatch;
use crate::compact::{self, BgSignal};
use crate::comparator::InternalKeyComparator;
use crate::env::{
    current_file_name, journal_file_name, lock_file_name, parse_file_name, DirLock, DiskStorage,
    FileKind, Storage,
};
use crate::error::Error;
use crate::format::{self, LookupKey, SequenceNumber, ValueKind, MAX_SEQUENCE_NUMBER};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::journal::{JournalReader, JournalWriter};
use crate::memtable::{Lookup, MemTable};
use crate::options::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    NUM_LEVELS,
};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::sstable::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::VersionSet;
use crate::Result;
use crossbeam_channel::Sender;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

pub mod db_iter;

pub use db_iter::DbIterator;

/// State shared between the facade and the compaction worker.
pub(crate) struct DbInner {
    pub(crate) options: Options,
    pub(crate) icmp: InternalKeyComparator,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) db_path: PathBuf,
    pub(crate) table_cache: Arc<TableCache>,

    /// Active memtable; swapped wholesale on rotation.
    pub(crate) mem: RwLock<Arc<MemTable>>,
    /// Frozen memtable awaiting flush.
    pub(crate) imm: RwLock<Option<Arc<MemTable>>>,
    pub(crate) versions: Mutex<VersionSet>,
    pub(crate) last_sequence: Arc<AtomicU64>,
    /// Number of the journal backing the active memtable.
    pub(crate) journal_number: AtomicU64,

    /// The commit slot: writers serialize on this lock for the whole
    /// journal-append + memtable-replay sequence.
    journal: Mutex<JournalWriter>,

    pub(crate) snapshots: Arc<Mutex<SnapshotList>>,
    /// Sticky background error; once set, writes fail until reopen.
    bg_error: Mutex<Option<String>>,

    bg_sender: Sender<BgSignal>,
    /// Bumped by the worker after every state change; writers block on it
    /// for back-pressure.
    work_generation: Mutex<u64>,
    work_cv: Condvar,
    pub(crate) shutting_down: AtomicBool,

    _dir_lock: Box<dyn DirLock>,
}

impl DbInner {
    pub(crate) fn record_background_error(&self, message: String) {
        let mut slot = self.bg_error.lock().unwrap();
        if slot.is_none() {
            warn!("background error becomes sticky: {}", message);
            *slot = Some(message);
        }
    }

    pub(crate) fn background_error_message(&self) -> std::result::Result<(), String> {
        match &*self.bg_error.lock().unwrap() {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    fn check_background_error(&self) -> Result<()> {
        self.background_error_message()
            .map_err(Error::Background)
    }

    /// Called by the worker after publishing any state change. Never call
    /// with `versions` or `imm` held, or writers waiting in
    /// `wait_for_background` could deadlock.
    pub(crate) fn wake_waiters(&self) {
        let mut generation = self.work_generation.lock().unwrap();
        *generation += 1;
        self.work_cv.notify_all();
    }

    pub(crate) fn schedule_compaction(&self) {
        if !self.shutting_down.load(AtomicOrdering::Acquire) {
            let _ = self.bg_sender.send(BgSignal::Schedule);
        }
    }

    /// Blocks until `done` holds; `done` is evaluated under the generation
    /// lock so a worker wake-up cannot slip between check and wait.
    fn wait_for_background<F: Fn() -> bool>(&self, done: F) {
        let mut generation = self.work_generation.lock().unwrap();
        loop {
            if done()
                || self.shutting_down.load(AtomicOrdering::Acquire)
                || self.bg_error.lock().unwrap().is_some()
            {
                return;
            }
            generation = self.work_cv.wait(generation).unwrap();
        }
    }

    /// Ensures the active memtable has room, applying back-pressure and
    /// rotating to a fresh journal + memtable when full.
    fn make_room_for_write(
        &self,
        journal: &mut MutexGuard<JournalWriter>,
        mut force: bool,
    ) -> Result<()> {
        let mut allow_delay = !force;
        loop {
            self.check_background_error()?;

            let level0_files = self.versions.lock().unwrap().num_level_files(0);
            if allow_delay && level0_files >= L0_SLOWDOWN_WRITES_TRIGGER {
                // Soft limit: give compaction a 1ms head start, once per
                // batch.
                std::thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                continue;
            }

            let mem_size = self.mem.read().unwrap().approximate_size();
            if !force && mem_size <= self.options.write_buffer_size {
                break;
            }

            if self.imm.read().unwrap().is_some() {
                // Previous rotation not yet flushed.
                self.wait_for_background(|| self.imm.read().unwrap().is_none());
                self.check_background_error()?;
                continue;
            }

            if level0_files >= L0_STOP_WRITES_TRIGGER {
                info!("too many level-0 tables ({}); stalling writes", level0_files);
                self.wait_for_background(|| {
                    self.versions.lock().unwrap().num_level_files(0) < L0_STOP_WRITES_TRIGGER
                });
                self.check_background_error()?;
                continue;
            }

            // Rotate: fresh journal, freeze the memtable, signal the worker.
            let new_log_number = {
                let mut versions = self.versions.lock().unwrap();
                versions.alloc_file_num()
            };
            let file = match self
                .storage
                .create(&journal_file_name(&self.db_path, new_log_number))
            {
                Ok(file) => file,
                Err(e) => {
                    self.versions.lock().unwrap().reuse_file_num(new_log_number);
                    return Err(e);
                }
            };
            **journal = JournalWriter::new(file);
            self.journal_number
                .store(new_log_number, AtomicOrdering::Release);

            let full_mem = self.mem.read().unwrap().clone();
            *self.imm.write().unwrap() = Some(full_mem);
            *self.mem.write().unwrap() = Arc::new(MemTable::new(self.icmp.clone()));
            force = false;
            self.schedule_compaction();
        }
        Ok(())
    }
}

pub struct Database {
    inner: Arc<DbInner>,
    worker: Option<JoinHandle<()>>,
}

impl Database {
    /// Opens (or creates) a database on local disk storage.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Database> {
        Database::open_with_storage(path, options, Arc::new(DiskStorage))
    }

    /// Opens against an arbitrary storage backend; tests use the in-memory
    /// one.
    pub fn open_with_storage(
        path: impl AsRef<Path>,
        options: Options,
        storage: Arc<dyn Storage>,
    ) -> Result<Database> {
        let db_path = path.as_ref().to_path_buf();
        storage.create_dir_all(&db_path)?;
        let dir_lock = storage.lock(&lock_file_name(&db_path))?;

        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let table_cache = Arc::new(TableCache::new(
            storage.clone(),
            db_path.clone(),
            options.clone(),
            Arc::new(icmp.clone()),
        ));
        let last_sequence = Arc::new(AtomicU64::new(0));
        let mut versions = VersionSet::new(
            storage.clone(),
            db_path.clone(),
            options.clone(),
            table_cache.clone(),
            last_sequence.clone(),
        );

        if !storage.exists(&current_file_name(&db_path)) {
            if !options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    db_path.display()
                )));
            }
            info!("creating database at {}", db_path.display());
            versions.create_new_db()?;
        } else if options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{}: already exists (error_if_exists is true)",
                db_path.display()
            )));
        }
        versions.recover()?;

        // Replay journals written since the manifest was last updated.
        let mut edit = VersionEdit::new();
        let mut max_sequence: SequenceNumber = 0;
        let min_log = versions.log_number;
        let prev_log = versions.prev_log_number;
        let mut journals: Vec<u64> = storage
            .list(&db_path)?
            .iter()
            .filter_map(|name| parse_file_name(name))
            .filter(|(kind, number)| {
                *kind == FileKind::Journal && (*number >= min_log || *number == prev_log)
            })
            .map(|(_, number)| number)
            .collect();
        journals.sort_unstable();
        for number in journals {
            replay_journal(
                &storage,
                &db_path,
                &options,
                &icmp,
                &table_cache,
                &mut versions,
                number,
                &mut edit,
                &mut max_sequence,
            )?;
            versions.mark_file_number_used(number);
        }
        if max_sequence > last_sequence.load(AtomicOrdering::Acquire) {
            last_sequence.store(max_sequence, AtomicOrdering::Release);
        }

        // Fresh journal for the new session, then publish the recovery edit.
        let new_log_number = versions.alloc_file_num();
        let journal_file = storage.create(&journal_file_name(&db_path, new_log_number))?;
        edit.log_number = Some(new_log_number);
        edit.prev_log_number = Some(0);
        versions.log_and_apply(&mut edit)?;
        versions.remove_obsolete_files();
        info!(
            "opened {}: {}, last sequence {}",
            db_path.display(),
            versions.current().level_summary(),
            last_sequence.load(AtomicOrdering::Acquire)
        );

        let (bg_sender, bg_receiver) = crossbeam_channel::unbounded();
        let inner = Arc::new(DbInner {
            options,
            icmp: icmp.clone(),
            storage,
            db_path,
            table_cache,
            mem: RwLock::new(Arc::new(MemTable::new(icmp))),
            imm: RwLock::new(None),
            versions: Mutex::new(versions),
            last_sequence,
            journal_number: AtomicU64::new(new_log_number),
            journal: Mutex::new(JournalWriter::new(journal_file)),
            snapshots: Arc::new(Mutex::new(SnapshotList::default())),
            bg_error: Mutex::new(None),
            bg_sender,
            work_generation: Mutex::new(0),
            work_cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            _dir_lock: dir_lock,
        });

        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("stratadb-compaction".to_string())
            .spawn(move || compact::run_worker(worker_inner, bg_receiver))
            .expect("spawning compaction worker");

        let db = Database {
            inner,
            worker: Some(worker),
        };
        db.inner.schedule_compaction();
        Ok(db)
    }

    pub fn put(&self, wo: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(wo, batch)
    }

    pub fn delete(&self, wo: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(wo, batch)
    }

    /// Commits a batch atomically: journal first (synced when requested),
    /// then the memtable, then the visibility bump.
    pub fn write(&self, wo: &WriteOptions, mut batch: WriteBatch) -> Result<()> {
        let inner = &self.inner;
        let mut journal = inner.journal.lock().unwrap();
        inner.make_room_for_write(&mut journal, false)?;

        let base = inner.last_sequence.load(AtomicOrdering::Acquire);
        batch.set_sequence(base + 1);
        let count = batch.count() as u64;

        let io_result = journal.add_record(batch.contents()).and_then(|_| {
            if wo.sync {
                journal.sync()
            } else {
                journal.flush()
            }
        });
        if let Err(e) = io_result {
            // The journal may hold a partial record; nothing was applied,
            // but further writes could silently lose data.
            inner.record_background_error(e.to_string());
            return Err(e);
        }

        let mem = inner.mem.read().unwrap().clone();
        batch.insert_into(&mem)?;
        inner
            .last_sequence
            .store(base + count, AtomicOrdering::Release);
        Ok(())
    }

    pub fn get(&self, ro: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let sequence = ro
            .snapshot
            .unwrap_or_else(|| inner.last_sequence.load(AtomicOrdering::Acquire));
        let lookup = LookupKey::new(key, sequence);

        let mem = inner.mem.read().unwrap().clone();
        match mem.get(&lookup) {
            Lookup::Hit(value) => return Ok(Some(value)),
            Lookup::Deleted => return Ok(None),
            Lookup::Miss => {}
        }
        if let Some(imm) = inner.imm.read().unwrap().clone() {
            match imm.get(&lookup) {
                Lookup::Hit(value) => return Ok(Some(value)),
                Lookup::Deleted => return Ok(None),
                Lookup::Miss => {}
            }
        }

        let version = inner.versions.lock().unwrap().current();
        let (result, stats) = version.get(ro, &lookup, &inner.table_cache)?;
        if version.update_stats(stats) {
            inner.schedule_compaction();
        }
        Ok(result)
    }

    /// Iterator over the live keys visible at the current sequence (or the
    /// read options' snapshot). Pins the memtables and version it reads.
    pub fn iter(&self, ro: &ReadOptions) -> Result<DbIterator> {
        let inner = &self.inner;
        let sequence = ro
            .snapshot
            .unwrap_or_else(|| inner.last_sequence.load(AtomicOrdering::Acquire));

        let mem = inner.mem.read().unwrap().clone();
        let imm = inner.imm.read().unwrap().clone();
        let version = inner.versions.lock().unwrap().current();

        let mut children: Vec<Box<dyn InternalIterator>> = vec![Box::new(mem.iter())];
        let mut pins = vec![mem];
        if let Some(imm) = imm {
            children.push(Box::new(imm.iter()));
            pins.push(imm);
        }
        children.extend(version.iters(ro, inner.table_cache.clone())?);

        let merge = MergingIterator::new(inner.icmp.clone(), children);
        Ok(DbIterator::new(
            inner.icmp.clone(),
            merge,
            sequence,
            version,
            pins,
        ))
    }

    /// Registers a consistent point-in-time view; release by dropping.
    pub fn snapshot(&self) -> Snapshot {
        let sequence = self.inner.last_sequence.load(AtomicOrdering::Acquire);
        Snapshot::new(sequence, self.inner.snapshots.clone())
    }

    /// Estimated on-disk bytes spanned by the user-key range
    /// [`start`, `limit`). Memtable contents are not counted.
    pub fn approximate_size(&self, start: &[u8], limit: &[u8]) -> u64 {
        let version = self.inner.versions.lock().unwrap().current();
        let start_key = format::pack_internal_key(start, MAX_SEQUENCE_NUMBER, ValueKind::Seek);
        let limit_key = format::pack_internal_key(limit, MAX_SEQUENCE_NUMBER, ValueKind::Seek);
        let start_offset = version.approximate_offset_of(&start_key, &self.inner.table_cache);
        let limit_offset = version.approximate_offset_of(&limit_key, &self.inner.table_cache);
        limit_offset.saturating_sub(start_offset)
    }

    /// Compacts the whole on-disk range [`begin`, `end`] (either bound may
    /// be open), flushing the memtable first. Blocks until done.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.flush()?;
        for level in 0..NUM_LEVELS - 1 {
            self.compact_range_at_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Compacts the tables at one level overlapping the range. Exposed so
    /// tests can drive level-by-level merges deterministically.
    pub fn compact_range_at_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let (done, wait) = crossbeam_channel::bounded(1);
        self.inner
            .bg_sender
            .send(BgSignal::Range {
                level,
                begin: begin.map(|b| b.to_vec()),
                end: end.map(|e| e.to_vec()),
                done,
            })
            .map_err(|_| Error::Background("compaction worker is gone".to_string()))?;
        match wait.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(Error::Background(message)),
            Err(_) => Err(Error::Background(
                "compaction worker is gone".to_string(),
            )),
        }
    }

    /// Freezes the active memtable and waits until the worker has flushed
    /// it (and is otherwise idle).
    pub fn flush(&self) -> Result<()> {
        {
            let mut journal = self.inner.journal.lock().unwrap();
            self.inner.make_room_for_write(&mut journal, true)?;
        }
        self.wait_compaction_idle()
    }

    /// Blocks until the compaction state machine is idle with no pending
    /// request, surfacing any sticky error.
    pub fn wait_compaction_idle(&self) -> Result<()> {
        let (done, wait) = crossbeam_channel::bounded(1);
        self.inner
            .bg_sender
            .send(BgSignal::Wait(done))
            .map_err(|_| Error::Background("compaction worker is gone".to_string()))?;
        match wait.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(Error::Background(message)),
            Err(_) => Err(Error::Background(
                "compaction worker is gone".to_string(),
            )),
        }
    }

    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.inner.versions.lock().unwrap().num_level_files(level)
    }

    pub fn level_summary(&self) -> String {
        self.inner.versions.lock().unwrap().current().level_summary()
    }

    pub fn path(&self) -> &Path {
        &self.inner.db_path
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner
            .shutting_down
            .store(true, AtomicOrdering::Release);
        let _ = self.inner.bg_sender.send(BgSignal::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Replays one journal into fresh memtables, spilling level-0 tables into
/// `edit` whenever a replay memtable fills. Corruption or truncation stops
/// the replay of that journal at the last good record.
#[allow(clippy::too_many_arguments)]
fn replay_journal(
    storage: &Arc<dyn Storage>,
    db_path: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache,
    versions: &mut VersionSet,
    number: u64,
    edit: &mut VersionEdit,
    max_sequence: &mut SequenceNumber,
) -> Result<()> {
    info!("replaying journal {:06}.log", number);
    let path = journal_file_name(db_path, number);
    let mut reader = JournalReader::new(storage.open_sequential(&path)?);
    let mut mem = Arc::new(MemTable::new(icmp.clone()));
    let mut records = 0usize;

    loop {
        match reader.read_record() {
            Ok(Some(record)) => {
                let batch = match WriteBatch::from_contents(record) {
                    Ok(batch) => batch,
                    Err(e) => {
                        // A torn batch at the tail is dropped whole.
                        warn!("journal {:06}.log: {}; ignoring rest", number, e);
                        break;
                    }
                };
                batch.insert_into(&mem)?;
                records += 1;
                if batch.count() > 0 {
                    let last = batch.sequence() + batch.count() as u64 - 1;
                    if last > *max_sequence {
                        *max_sequence = last;
                    }
                }
                if mem.approximate_size() > options.write_buffer_size {
                    spill_replay_memtable(
                        storage, db_path, options, icmp, table_cache, versions, &mem, edit,
                    )?;
                    mem = Arc::new(MemTable::new(icmp.clone()));
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("journal {:06}.log: {}; ignoring rest", number, e);
                break;
            }
        }
    }

    if !mem.is_empty() {
        spill_replay_memtable(storage, db_path, options, icmp, table_cache, versions, &mem, edit)?;
    }
    info!("journal {:06}.log: {} batches replayed", number, records);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spill_replay_memtable(
    storage: &Arc<dyn Storage>,
    db_path: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache,
    versions: &mut VersionSet,
    mem: &Arc<MemTable>,
    edit: &mut VersionEdit,
) -> Result<()> {
    let number = versions.alloc_file_num();
    match compact::build_memtable_table(
        storage, db_path, options, icmp, table_cache, mem, number,
    )? {
        Some((file_size, smallest, largest)) => {
            // Recovery tables always land in level 0.
            edit.add_file(0, number, file_size, smallest, largest);
            Ok(())
        }
        None => {
            versions.reuse_file_num(number);
            Ok(())
        }
    }
}
