#![allow(unused)]
#![allow(dead_code)]

use std::{
    collections::HashSet,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use crossbeam::channel;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
    block::Block,
    compact::{CompactionController, CompactionOptions, CompactionTask, LeveledCompactionController},
    error::LsmError,
    iterators::{
        concat_iterator::SstConcatIterator, merge_iterator::MergeIterator,
        two_merge_iterator::TwoMergeIterator, StorageIterator,
    },
    key::{KeySlice, KeyVec, TS_MAX, TS_MIN},
    lsm_iterator::{FusedIterator, LsmIterator},
    manifest::{self, Manifest, ManifestRecord},
    mem_table::MemTable,
    table::{
        bloom,
        iterator::SsTableIterator,
        FileObject, SsTable, SsTableBuilder,
    },
    value::ValueStruct,
};

pub use crate::config::LsmStorageOptions;

/// Cache capacity, in blocks, for the shared SST block cache.
const BLOCK_CACHE_CAPACITY: usize = 1 << 10;

/// BlockCache for `read block from disk`, this is used when SSTable is built.
pub type BlockCache = crate::cache::AdmissionCache<Arc<Block>>;

/// stores the state of the storage Engine.
/// This is the core structure for Concurrenty Control and MetaData Manangement.
#[derive(Clone)]
pub struct LsmStorageState {
    // mutable memtable (only one at any time, allow multi-thread to access)
    pub memtable: Arc<MemTable>,
    // immutable_memtable for flush to the disk, newest first
    pub imm_memtables: Vec<Arc<MemTable>>,
    // the L0_SsTables stored in the disk, newest first
    pub l0_sstables: Vec<usize>,
    // SSTables sorted by key-range : L1(index:0) ~ Lmax for compaction
    pub levels: Vec<(usize, Vec<usize>)>,
    // SST objects : map index(usize) to SST Object(Arc<SsTable>)
    pub sstables: std::collections::HashMap<usize, Arc<SsTable>>,
}

impl LsmStorageState {
    fn create(options: &LsmStorageOptions) -> Self {
        let levels = match &options.compaction_options {
            CompactionOptions::Leveled(opts) => {
                (1..=opts.max_levels).map(|level| (level, Vec::new())).collect()
            }
            CompactionOptions::NoCompaction => vec![(1, Vec::new())],
        };
        Self {
            memtable: Arc::new(MemTable::create(0)),
            imm_memtables: Vec::new(),
            l0_sstables: Vec::new(),
            levels,
            sstables: std::collections::HashMap::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum CompactionFilter {
    Prefix(Bytes),
}

fn key_within(user_key: &[u8], table_begin: KeySlice, table_end: KeySlice) -> bool {
    table_begin.key_ref() <= user_key && user_key <= table_end.key_ref()
}

/// True if `[lower, upper]` (a scan's user-key range) can possibly intersect
/// a table spanning `[table_begin, table_end]`.
fn range_overlap(
    lower: Bound<&[u8]>,
    upper: Bound<&[u8]>,
    table_begin: KeySlice,
    table_end: KeySlice,
) -> bool {
    match upper {
        Bound::Excluded(key) if key <= table_begin.key_ref() => return false,
        Bound::Included(key) if key < table_begin.key_ref() => return false,
        _ => {}
    }
    match lower {
        Bound::Excluded(key) if key >= table_end.key_ref() => return false,
        Bound::Included(key) if key > table_end.key_ref() => return false,
        _ => {}
    }
    true
}

/// Converts a user-key lower bound into an internal-key bound. `Included`
/// must catch every version of the key, so it's built with `TS_MAX` (the
/// smallest possible suffix, sorting before any real version). `Excluded`
/// must skip every version of the key, so it's built with `TS_MIN` (the
/// largest suffix, sorting after every real version) and stays excluded.
fn lower_internal_bound(bound: Bound<&[u8]>) -> Bound<KeyVec> {
    match bound {
        Bound::Included(k) => Bound::Included(KeyVec::from_user_key_and_ts(k, TS_MAX)),
        Bound::Excluded(k) => Bound::Excluded(KeyVec::from_user_key_and_ts(k, TS_MIN)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Mirror of `lower_internal_bound` for an upper bound: `Included` must
/// catch every version of the key (`TS_MIN`, the largest suffix, sorting
/// last), `Excluded` must skip all of them (`TS_MAX`, the smallest suffix,
/// sorting first).
fn upper_internal_bound(bound: Bound<&[u8]>) -> Bound<KeyVec> {
    match bound {
        Bound::Included(k) => Bound::Included(KeyVec::from_user_key_and_ts(k, TS_MIN)),
        Bound::Excluded(k) => Bound::Excluded(KeyVec::from_user_key_and_ts(k, TS_MAX)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn as_key_slice_bound(bound: &Bound<KeyVec>) -> Bound<KeySlice> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_key_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_key_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn lower_key_slice(bound: &Bound<KeyVec>) -> Option<KeySlice> {
    match bound {
        Bound::Included(k) | Bound::Excluded(k) => Some(k.as_key_slice()),
        Bound::Unbounded => None,
    }
}

/// `id.sst`/`id.wal`'s numeric stem, if `path` has extension `ext`.
fn parse_file_id(path: &Path, ext: &str) -> Option<usize> {
    if path.extension()?.to_str()? != ext {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// the core data-structure of LsmStorage Engine.
/// only visible inside the crate.
pub(crate) struct LsmStorageInner {
    // lock the state for concurrent R/w.
    pub(crate) state: Arc<RwLock<Arc<LsmStorageState>>>,
    // lock for sync.
    pub(crate) state_lock: Mutex<()>,
    // the path to the storage location on the file system.
    path: PathBuf,
    // cache data blocks read from the storage(disk)
    pub(crate) block_cache: Arc<BlockCache>,
    // generate unique ids for SSTables and memtables/WALs.
    next_sst_id: AtomicUsize,
    // monotonically increasing per-write internal key version.
    next_version: AtomicU64,
    // configuration settings control the behavior of LSM Tree
    pub(crate) options: Arc<LsmStorageOptions>,
    pub(crate) compaction_controller: CompactionController,
    pub(crate) manifest: Option<Manifest>,
    pub(crate) compaction_filters: Arc<Mutex<Vec<CompactionFilter>>>,
}

impl LsmStorageInner {
    // CRUD API

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        // 1. get the snapshot to ensure consistency.
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        }; // drop global lock here

        let search_key = KeyVec::from_user_key_and_ts(key, TS_MAX);
        let search_key = search_key.as_key_slice();

        // Search on the current memtable.
        if let Some(value) = snapshot.memtable.get(key) {
            let value = ValueStruct::decode(&value);
            return Ok((!value.is_tombstone()).then_some(Bytes::from(value.value)));
        }

        // Search on immutable memtables.
        for memtable in snapshot.imm_memtables.iter() {
            if let Some(value) = memtable.get(key) {
                let value = ValueStruct::decode(&value);
                return Ok((!value.is_tombstone()).then_some(Bytes::from(value.value)));
            }
        }

        // Search in SSTables.
        let keep_table = |key: &[u8], table: &SsTable| {
            if key_within(key, table.first_key().as_key_slice(), table.last_key().as_key_slice()) {
                return match &table.bloom {
                    Some(bloom) => bloom.may_contain(bloom::hash(key)),
                    None => true,
                };
            }
            false
        };

        // a. L0 SSTables
        let mut l0_iters = Vec::with_capacity(snapshot.l0_sstables.len());
        for table in &snapshot.l0_sstables {
            let table = snapshot.sstables[table].clone();
            if keep_table(key, &table) {
                l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_key(
                    table, search_key,
                )?));
            }
        }
        let l0_iter = MergeIterator::create(l0_iters);

        // b. Higher-Level SSTables.
        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for (_, level_sst_ids) in &snapshot.levels {
            let mut level_ssts = Vec::with_capacity(level_sst_ids.len());
            for table in level_sst_ids {
                let table = snapshot.sstables[table].clone();
                if keep_table(key, &table) {
                    level_ssts.push(table);
                }
            }
            level_iters.push(Box::new(SstConcatIterator::create_and_seek_to_key(
                level_ssts, search_key,
            )?));
        }
        let level_iter = MergeIterator::create(level_iters);

        // Merge Iteration( merges into a single Iterator )
        let iter = TwoMergeIterator::create(l0_iter, level_iter)?;
        // Key Lookup: both iterators were seeked with a TS_MAX search key, so
        // the first match (if any) is the newest version of this user key.
        if iter.is_valid() && iter.key().key_ref() == key {
            let value = ValueStruct::decode(iter.value());
            return Ok((!value.is_tombstone()).then_some(Bytes::from(value.value)));
        }
        Ok(None)
    }

    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<FusedIterator<LsmIterator>> {
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        };

        let lower_key = lower_internal_bound(lower);
        let upper_key = upper_internal_bound(upper);

        let memtable_iters = std::iter::once(snapshot.memtable.as_ref())
            .chain(snapshot.imm_memtables.iter().map(Arc::as_ref))
            .map(|mt| Box::new(mt.scan(as_key_slice_bound(&lower_key), as_key_slice_bound(&upper_key))))
            .collect();
        let memtable_iter = MergeIterator::create(memtable_iters);

        let seek_key = lower_key_slice(&lower_key);
        let lower_excluded = matches!(lower_key, Bound::Excluded(_));
        let skip_seek_key_if_excluded = |iter_key: Option<KeySlice>, is_valid: bool| -> bool {
            lower_excluded && is_valid && iter_key == seek_key
        };

        let mut l0_iters = Vec::with_capacity(snapshot.l0_sstables.len());
        for id in &snapshot.l0_sstables {
            let table = snapshot.sstables[id].clone();
            if !range_overlap(
                lower,
                upper,
                table.first_key().as_key_slice(),
                table.last_key().as_key_slice(),
            ) {
                continue;
            }
            let mut iter = match seek_key {
                Some(key) => SsTableIterator::create_and_seek_to_key(table, key)?,
                None => SsTableIterator::create_and_seek_to_first(table)?,
            };
            if skip_seek_key_if_excluded(iter.is_valid().then(|| iter.key()), iter.is_valid()) {
                iter.next()?;
            }
            l0_iters.push(Box::new(iter));
        }
        let l0_iter = MergeIterator::create(l0_iters);

        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for (_, ids) in &snapshot.levels {
            let mut ssts = Vec::with_capacity(ids.len());
            for id in ids {
                let table = snapshot.sstables[id].clone();
                if range_overlap(
                    lower,
                    upper,
                    table.first_key().as_key_slice(),
                    table.last_key().as_key_slice(),
                ) {
                    ssts.push(table);
                }
            }
            let mut iter = match seek_key {
                Some(key) => SstConcatIterator::create_and_seek_to_key(ssts, key)?,
                None => SstConcatIterator::create_and_seek_to_first(ssts)?,
            };
            if skip_seek_key_if_excluded(iter.is_valid().then(|| iter.key()), iter.is_valid()) {
                iter.next()?;
            }
            level_iters.push(Box::new(iter));
        }
        let level_iter = MergeIterator::create(level_iters);

        let sst_iter = TwoMergeIterator::create(l0_iter, level_iter)?;
        let inner = TwoMergeIterator::create(memtable_iter, sst_iter)?;

        let end_bound = match upper {
            Bound::Included(k) => Bound::Included(Bytes::copy_from_slice(k)),
            Bound::Excluded(k) => Bound::Excluded(Bytes::copy_from_slice(k)),
            Bound::Unbounded => Bound::Unbounded,
        };
        Ok(FusedIterator::new(LsmIterator::new(inner, end_bound)?))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::Put(key, value)])
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::Del(key)])
    }

    pub fn write_batch<T: AsRef<[u8]>>(&self, batch: &[WriteBatchRecord<T>]) -> Result<()> {
        for record in batch {
            match record {
                WriteBatchRecord::Put(key, value) => {
                    let key = key.as_ref();
                    let value = value.as_ref();
                    if key.is_empty() {
                        return Err(LsmError::EmptyKey.into());
                    }
                    let ikey = KeyVec::from_user_key_and_ts(key, self.next_version());
                    let encoded = ValueStruct::new(value.to_vec()).encode();
                    let size;
                    {
                        let guard = self.state.read();
                        guard.memtable.put(ikey.as_key_slice(), &encoded)?;
                        size = guard.memtable.approximate_size();
                    }
                    self.try_freeze(size)?;
                }
                WriteBatchRecord::Del(key) => {
                    let key = key.as_ref();
                    let ikey = KeyVec::from_user_key_and_ts(key, self.next_version());
                    let encoded = ValueStruct::tombstone().encode();
                    let size;
                    {
                        let guard = self.state.read();
                        guard.memtable.put(ikey.as_key_slice(), &encoded)?;
                        size = guard.memtable.approximate_size();
                    }
                    self.try_freeze(size)?;
                }
            }
        }
        Ok(())
    }

    // Freeze API
    pub fn force_freeze_memtable(&self) -> Result<()> {
        let state_lock = self.state_lock.lock();
        self.force_freeze_memtable_locked(&state_lock)
    }

    fn force_freeze_memtable_locked(&self, _state_lock: &MutexGuard<'_, ()>) -> Result<()> {
        let memtable_id = self.next_sst_id();
        let memtable = if self.options.enable_wal {
            Arc::new(MemTable::create_with_wal(memtable_id, self.path_of_wal(memtable_id))?)
        } else {
            Arc::new(MemTable::create(memtable_id))
        };
        self.freeze_memtable_with_memtable(memtable)
    }

    fn try_freeze(&self, estimated_size: usize) -> Result<()> {
        if estimated_size < self.options.mem_table_size {
            return Ok(());
        }
        let state_lock = self.state_lock.lock();
        if self.state.read().memtable.approximate_size() >= self.options.mem_table_size {
            self.force_freeze_memtable_locked(&state_lock)?;
        }
        Ok(())
    }

    fn freeze_memtable_with_memtable(&self, memtable: Arc<MemTable>) -> Result<()> {
        let mut guard = self.state.write();
        let mut snapshot = guard.as_ref().clone();
        let old_memtable = std::mem::replace(&mut snapshot.memtable, memtable);
        snapshot.imm_memtables.insert(0, old_memtable.clone());
        *guard = Arc::new(snapshot);
        drop(guard);
        old_memtable.sync_wal()
    }

    // Flush & Compact API
    pub fn force_flush_next_imm_memtable(&self) -> Result<()> {
        let state_lock = self.state_lock.lock();
        let flush_memtable = {
            let guard = self.state.read();
            guard
                .imm_memtables
                .last()
                .cloned()
                .context("no immutable memtable to flush")?
        };

        let mut builder = SsTableBuilder::new(self.options.block_size);
        builder.set_bloom_false_positive(self.options.bloom_false_positive);
        flush_memtable.flush(&mut builder)?;
        let sst_id = flush_memtable.id();
        let sst = Arc::new(builder.build(
            sst_id,
            Some(self.block_cache.clone()),
            self.path_of_sst(sst_id),
        )?);
        let checksum = sst.checksum();

        {
            let mut guard = self.state.write();
            let mut snapshot = guard.as_ref().clone();
            let popped = snapshot
                .imm_memtables
                .pop()
                .context("no immutable memtable to flush")?;
            assert_eq!(popped.id(), sst_id, "flushed the wrong memtable");
            debug_assert!(self.compaction_controller.flush_to_l0());
            snapshot.l0_sstables.insert(0, sst_id);
            snapshot.sstables.insert(sst_id, sst);
            *guard = Arc::new(snapshot);
        }

        if let Some(manifest) = &self.manifest {
            manifest.add_record(
                &state_lock,
                ManifestRecord::CreateTable {
                    sst_id,
                    level: 0,
                    checksum,
                },
            )?;
        }
        self.sync_dir()?;
        let _ = std::fs::remove_file(self.path_of_wal(sst_id));
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.state.read().memtable.sync_wal()
    }

    pub fn add_compaction_filter(&self, filter: CompactionFilter) {
        self.compaction_filters.lock().push(filter);
    }

    // Inner util methods or functions
    pub(crate) fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).context("failed to create the LSM directory")?;
        let options = Arc::new(options);
        let block_cache = Arc::new(BlockCache::new(BLOCK_CACHE_CAPACITY));

        let compaction_controller = match &options.compaction_options {
            CompactionOptions::Leveled(opts) => {
                CompactionController::Leveled(LeveledCompactionController::new(opts.clone()))
            }
            CompactionOptions::NoCompaction => CompactionController::None,
        };

        let manifest_path = path.join("MANIFEST");
        let mut state = LsmStorageState::create(&options);
        let mut max_file_id = 0usize;
        let mut max_version = 0u64;

        let manifest = if !manifest_path.exists() {
            if options.enable_wal {
                state.memtable = Arc::new(MemTable::create_with_wal(
                    0,
                    Self::path_of_wal_static(&path, 0),
                )?);
            }
            Manifest::create(&manifest_path).context("failed to create manifest")?
        } else {
            let (manifest, records) = Manifest::recover(&manifest_path)?;

            let mut present_sst_ids = HashSet::new();
            for entry in std::fs::read_dir(&path)? {
                if let Some(id) = parse_file_id(&entry?.path(), "sst") {
                    present_sst_ids.insert(id);
                }
            }

            let (levels_by_id, orphans) = manifest::reconcile(&records, &present_sst_ids)?;
            for id in orphans {
                tracing::warn!(id, "removing sst file with no manifest record");
                let _ = std::fs::remove_file(Self::path_of_sst_static(&path, id));
            }

            for (&sst_id, &level) in &levels_by_id {
                let sst = SsTable::open(
                    sst_id,
                    Some(block_cache.clone()),
                    FileObject::open(&Self::path_of_sst_static(&path, sst_id))?,
                )?;
                max_file_id = max_file_id.max(sst_id);
                max_version = max_version.max(sst.max_ts());
                if level == 0 {
                    state.l0_sstables.push(sst_id);
                } else if let Some((_, ids)) = state.levels.iter_mut().find(|(l, _)| *l == level) {
                    ids.push(sst_id);
                }
                state.sstables.insert(sst_id, Arc::new(sst));
            }
            state.l0_sstables.sort_unstable_by(|a, b| b.cmp(a));
            for (_, ids) in state.levels.iter_mut() {
                let sstables = &state.sstables;
                ids.sort_by(|a, b| sstables[a].first_key().cmp(sstables[b].first_key()));
            }

            if options.enable_wal {
                let mut wal_ids: Vec<usize> = std::fs::read_dir(&path)?
                    .filter_map(|e| e.ok())
                    .filter_map(|e| parse_file_id(&e.path(), "wal"))
                    .collect();
                wal_ids.sort_unstable();
                for &id in &wal_ids {
                    let memtable = MemTable::recover_from_wal(id, Self::path_of_wal_static(&path, id))?;
                    max_file_id = max_file_id.max(id);
                    max_version = max_version.max(memtable.max_version());
                    if !memtable.is_empty() {
                        state.imm_memtables.insert(0, Arc::new(memtable));
                    }
                }
            }

            // a fresh active memtable always needs an id past every sst/wal
            // id found on disk, whether or not it carries its own WAL.
            let memtable_id = max_file_id + 1;
            state.memtable = if options.enable_wal {
                Arc::new(MemTable::create_with_wal(
                    memtable_id,
                    Self::path_of_wal_static(&path, memtable_id),
                )?)
            } else {
                Arc::new(MemTable::create(memtable_id))
            };
            max_file_id = memtable_id;

            manifest
        };

        Ok(Arc::new(Self {
            state: Arc::new(RwLock::new(Arc::new(state))),
            state_lock: Mutex::new(()),
            path,
            block_cache,
            next_sst_id: AtomicUsize::new(max_file_id + 1),
            next_version: AtomicU64::new(max_version + 1),
            options,
            compaction_controller,
            manifest: Some(manifest),
            compaction_filters: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    pub(crate) fn next_sst_id(&self) -> usize {
        self.next_sst_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The version to stamp on the next write's internal key. Versions are
    /// never reused, even across a restart: `open()` seeds this past every
    /// version observed on disk so "newest sorts first" still holds.
    pub(crate) fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn path_of_sst_static(dir: &Path, id: usize) -> PathBuf {
        dir.join(format!("{id:05}.sst"))
    }

    pub(crate) fn path_of_sst(&self, id: usize) -> PathBuf {
        Self::path_of_sst_static(&self.path, id)
    }

    fn path_of_wal_static(dir: &Path, id: usize) -> PathBuf {
        dir.join(format!("{id:05}.wal"))
    }

    pub(crate) fn path_of_wal(&self, id: usize) -> PathBuf {
        Self::path_of_wal_static(&self.path, id)
    }

    pub(super) fn sync_dir(&self) -> Result<()> {
        std::fs::File::open(&self.path)?.sync_all()?;
        Ok(())
    }
}

pub enum WriteBatchRecord<T: AsRef<[u8]>> {
    Put(T, T),
    Del(T),
}

/// MiniLsm is a wrapper outside the LsmStorageInner, publicly accessible.
/// Owns the background flush/compaction threads for the lifetime of the
/// store.
pub struct MiniLsm {
    pub(crate) inner: Arc<LsmStorageInner>,
    flush_notifier: channel::Sender<()>,
    compaction_notifier: channel::Sender<()>,
    flush_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    compaction_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MiniLsm {
    pub fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Arc<Self>> {
        let inner = LsmStorageInner::open(path, options)?;
        let (flush_notifier, flush_rx) = channel::unbounded();
        let (compaction_notifier, compaction_rx) = channel::unbounded();
        let compaction_thread = inner.spawn_compaction_thread(compaction_rx)?;
        let flush_thread = inner.spawn_flush_thread(flush_rx)?;
        Ok(Arc::new(Self {
            inner,
            flush_notifier,
            compaction_notifier,
            flush_thread: Mutex::new(flush_thread),
            compaction_thread: Mutex::new(compaction_thread),
        }))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    pub fn write_batch<T: AsRef<[u8]>>(&self, batch: &[WriteBatchRecord<T>]) -> Result<()> {
        self.inner.write_batch(batch)
    }

    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<FusedIterator<LsmIterator>> {
        self.inner.scan(lower, upper)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    pub fn add_compaction_filter(&self, filter: CompactionFilter) {
        self.inner.add_compaction_filter(filter)
    }

    pub fn force_full_compaction(&self) -> Result<()> {
        self.inner.force_compact()
    }

    /// Stops the background threads and flushes whatever is left in memory,
    /// waiting for both to finish before returning.
    pub fn close(&self) -> Result<()> {
        let _ = self.flush_notifier.send(());
        let _ = self.compaction_notifier.send(());
        if let Some(handle) = self.flush_thread.lock().take() {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("flush thread panicked"))?;
        }
        if let Some(handle) = self.compaction_thread.lock().take() {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("compaction thread panicked"))?;
        }
        if !self.inner.options.enable_wal {
            self.inner.force_freeze_memtable()?;
            while !self.inner.state.read().imm_memtables.is_empty() {
                self.inner.force_flush_next_imm_memtable()?;
            }
        }
        self.inner.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::LeveledCompactionOptions;

    fn test_options(dir: &Path) -> LsmStorageOptions {
        LsmStorageOptions {
            work_dir: dir.to_path_buf(),
            mem_table_size: 1024,
            sstable_max_size: 4096,
            block_size: 256,
            bloom_false_positive: 0.01,
            base_level_size: 4096,
            level_size_multiplier: 4,
            base_table_size: 1024,
            table_size_multiplier: 2,
            num_level_zero_tables: 2,
            max_level_num: 3,
            num_compactors: 1,
            value_threshold: 1 << 20,
            value_log_file_size: 256 << 20,
            value_log_max_entries: 1_000_000,
            enable_wal: true,
            compaction_options: CompactionOptions::Leveled(LeveledCompactionOptions {
                level_size_multiplier: 4,
                level0_file_num_compaction_threshold: 2,
                max_levels: 3,
                base_level_size_mb: 4,
            }),
        }
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), test_options(dir.path())).unwrap();
        lsm.put(b"a", b"1").unwrap();
        lsm.put(b"b", b"2").unwrap();
        assert_eq!(lsm.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));
        lsm.delete(b"a").unwrap();
        assert_eq!(lsm.get(b"a").unwrap(), None);
        assert_eq!(lsm.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));
        lsm.close().unwrap();
    }

    #[test]
    fn scan_merges_memtable_and_flushed_sstables() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), test_options(dir.path())).unwrap();
        for i in 0..10u8 {
            lsm.put(&[b'k', i], &[b'v', i]).unwrap();
        }
        lsm.inner.force_freeze_memtable().unwrap();
        lsm.inner.force_flush_next_imm_memtable().unwrap();
        lsm.put(b"k\x0a", b"v\x0a").unwrap();

        let mut iter = lsm.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
        let mut count = 0;
        while iter.is_valid() {
            count += 1;
            iter.next().unwrap();
        }
        assert_eq!(count, 11);
        lsm.close().unwrap();
    }

    #[test]
    fn freeze_and_flush_moves_memtable_to_l0() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), test_options(dir.path())).unwrap();
        lsm.put(b"hello", b"world").unwrap();
        lsm.inner.force_freeze_memtable().unwrap();
        assert_eq!(lsm.inner.state.read().imm_memtables.len(), 1);
        lsm.inner.force_flush_next_imm_memtable().unwrap();
        {
            let state = lsm.inner.state.read();
            assert!(state.imm_memtables.is_empty());
            assert_eq!(state.l0_sstables.len(), 1);
        }
        assert_eq!(lsm.get(b"hello").unwrap(), Some(Bytes::from_static(b"world")));
        lsm.close().unwrap();
    }

    #[test]
    fn reopen_recovers_flushed_and_walled_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lsm = MiniLsm::open(dir.path(), test_options(dir.path())).unwrap();
            lsm.put(b"flushed", b"1").unwrap();
            lsm.inner.force_freeze_memtable().unwrap();
            lsm.inner.force_flush_next_imm_memtable().unwrap();
            lsm.put(b"walled", b"2").unwrap();
            lsm.close().unwrap();
        }
        let lsm = MiniLsm::open(dir.path(), test_options(dir.path())).unwrap();
        assert_eq!(lsm.get(b"flushed").unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(lsm.get(b"walled").unwrap(), Some(Bytes::from_static(b"2")));
        lsm.close().unwrap();
    }

    #[test]
    fn reopen_without_wal_does_not_collide_sst_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = test_options(dir.path());
        opts.enable_wal = false;
        {
            let lsm = MiniLsm::open(dir.path(), opts.clone()).unwrap();
            lsm.put(b"a", b"1").unwrap();
            lsm.close().unwrap();
        }
        // Reopening must not reuse sst id 0 for the fresh active memtable: a
        // later flush would otherwise collide with an existing 00000.sst.
        let lsm = MiniLsm::open(dir.path(), opts).unwrap();
        lsm.put(b"b", b"2").unwrap();
        lsm.inner.force_freeze_memtable().unwrap();
        lsm.inner.force_flush_next_imm_memtable().unwrap();
        assert_eq!(lsm.get(b"a").unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(lsm.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));
        lsm.close().unwrap();
    }

    #[test]
    fn leveled_compaction_preserves_latest_values() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), test_options(dir.path())).unwrap();
        for round in 0..4 {
            for i in 0..20u32 {
                let key = format!("key{i:04}");
                let value = format!("round{round}");
                lsm.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
            lsm.inner.force_freeze_memtable().unwrap();
            lsm.inner.force_flush_next_imm_memtable().unwrap();
        }
        for _ in 0..4 {
            lsm.inner.trigger_compaction().unwrap();
        }
        for i in 0..20u32 {
            let key = format!("key{i:04}");
            assert_eq!(
                lsm.get(key.as_bytes()).unwrap(),
                Some(Bytes::from("round3"))
            );
        }
        lsm.close().unwrap();
    }

    #[test]
    fn version_shadowing_across_levels_drops_unflushed_write_on_crash() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = test_options(dir.path());
        opts.enable_wal = false;
        {
            let lsm = MiniLsm::open(dir.path(), opts.clone()).unwrap();
            lsm.put(b"k", b"a").unwrap();
            lsm.inner.force_freeze_memtable().unwrap();
            lsm.inner.force_flush_next_imm_memtable().unwrap();

            lsm.put(b"k", b"b").unwrap();
            lsm.inner.force_freeze_memtable().unwrap();
            lsm.inner.force_flush_next_imm_memtable().unwrap();
            lsm.inner.trigger_compaction().unwrap();

            lsm.put(b"k", b"c").unwrap();
            assert_eq!(lsm.get(b"k").unwrap(), Some(Bytes::from_static(b"c")));
            // "c" lives only in the active memtable, which has no WAL backing it.
            // Dropping without close() simulates a crash that loses it entirely.
            drop(lsm);
        }
        let lsm = MiniLsm::open(dir.path(), opts).unwrap();
        assert_eq!(lsm.get(b"k").unwrap(), Some(Bytes::from_static(b"b")));
        lsm.close().unwrap();
    }

    #[test]
    fn tombstone_gc_drops_keys_at_bottom_level() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), test_options(dir.path())).unwrap();
        let keys: Vec<String> = (0..40u32).map(|i| format!("key{i:04}")).collect();
        for k in &keys {
            lsm.put(k.as_bytes(), b"v").unwrap();
        }
        lsm.inner.force_freeze_memtable().unwrap();
        lsm.inner.force_flush_next_imm_memtable().unwrap();

        for k in &keys {
            lsm.delete(k.as_bytes()).unwrap();
        }
        lsm.inner.force_freeze_memtable().unwrap();
        lsm.inner.force_flush_next_imm_memtable().unwrap();

        for _ in 0..8 {
            lsm.inner.trigger_compaction().unwrap();
        }

        for k in &keys {
            assert_eq!(lsm.get(k.as_bytes()).unwrap(), None);
        }

        let snapshot = lsm.inner.state.read();
        for sst in snapshot.sstables.values() {
            let mut iter = SsTableIterator::create_and_seek_to_first(sst.clone()).unwrap();
            while iter.is_valid() {
                let k = iter.key().key_ref().to_vec();
                assert!(
                    !keys.iter().any(|want| want.as_bytes() == k.as_slice()),
                    "bottom-level compaction should have dropped tombstoned key {k:?}"
                );
                iter.next().unwrap();
            }
        }
        drop(snapshot);
        lsm.close().unwrap();
    }
}
