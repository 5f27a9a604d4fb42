//! An in-memory, write-ahead-logged table: one arena-backed skip list paired
//! with one WAL file (spec §4.B/§4.C). Replaces the teacher's
//! `crossbeam_skiplist` + `ouroboros` pairing: the skip list iterator holds
//! an `Arc<SkipList>` and a plain cursor offset, so no self-referential
//! struct is needed.

use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::arena::NULL_OFFSET;
use crate::iterators::StorageIterator;
use crate::key::{KeySlice, KeyVec, TS_LEN, TS_MAX};
use crate::skiplist::{SkipList, SkipListCursor};
use crate::table::SsTableBuilder;
use crate::wal::Wal;

const DEFAULT_ARENA_SIZE: usize = 1 << 20;

/// Converts a `Bound<KeySlice>` into an owned, inclusivity-tagged bound
/// over raw internal-key bytes, the form `SkipListCursor` consumes.
fn owned_bound(bound: Bound<KeySlice>) -> Option<(Vec<u8>, bool)> {
    match bound {
        Bound::Included(k) => Some((k.raw_ref().to_vec(), true)),
        Bound::Excluded(k) => Some((k.raw_ref().to_vec(), false)),
        Bound::Unbounded => None,
    }
}

/// An active (or immutable, pending flush) memtable.
pub struct MemTable {
    pub(crate) skiplist: Arc<SkipList>,
    id: usize,
    approximate_size: Arc<AtomicUsize>,
    wal: Option<Wal>,
}

impl MemTable {
    pub fn create(id: usize) -> Self {
        Self {
            id,
            skiplist: Arc::new(SkipList::new(DEFAULT_ARENA_SIZE)),
            approximate_size: Arc::new(AtomicUsize::new(0)),
            wal: None,
        }
    }

    pub fn create_with_wal(id: usize, path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            id,
            wal: Some(Wal::create(path)?),
            skiplist: Arc::new(SkipList::new(DEFAULT_ARENA_SIZE)),
            approximate_size: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Replays a WAL into a fresh skip list, per spec §4.C's torn-tail
    /// tolerant recovery.
    pub fn recover_from_wal(id: usize, path: impl AsRef<Path>) -> Result<Self> {
        let skiplist = Arc::new(SkipList::new(DEFAULT_ARENA_SIZE));
        let mut approximate_size = 0usize;
        let wal = Wal::recover(path, |key, value| {
            approximate_size += key.len() + value.len();
            skiplist.insert_kv(key, value);
        })?;
        Ok(Self {
            id,
            wal: Some(wal),
            skiplist,
            approximate_size: Arc::new(AtomicUsize::new(approximate_size)),
        })
    }

    /// Finds the newest version of `user_key`, if one is live in this
    /// memtable. Several internal keys may share a user key once real
    /// per-write versions are in play; the smallest suffix (built here from
    /// `TS_MAX`, the "whatever is newest" sentinel) sorts first among them.
    pub fn get(&self, user_key: &[u8]) -> Option<Bytes> {
        let search = KeyVec::from_user_key_and_ts(user_key, TS_MAX);
        let found = self.skiplist.find_near(search.raw_ref(), true);
        if found == NULL_OFFSET {
            return None;
        }
        let found_key = self.skiplist.key_at(found);
        if found_key.len() < TS_LEN || &found_key[..found_key.len() - TS_LEN] != user_key {
            return None;
        }
        let (offset, size) = self.skiplist.value_at(found);
        Some(Bytes::from(self.skiplist.read_value(offset, size)))
    }

    /// Largest version number among every entry currently in this memtable,
    /// or `0` if empty. Used at recovery to seed the facade's monotonic
    /// version counter past whatever was already persisted.
    pub fn max_version(&self) -> u64 {
        let mut cursor = SkipListCursor::new(self.skiplist.clone(), None, None);
        let mut max_version = 0u64;
        while cursor.is_valid() {
            let key = cursor.key();
            max_version = max_version.max(KeySlice::from_raw(&key).ts());
            cursor.advance();
        }
        max_version
    }

    pub fn scan(&self, lower: Bound<KeySlice>, upper: Bound<KeySlice>) -> MemTableIterator {
        let cursor = SkipListCursor::new(
            self.skiplist.clone(),
            owned_bound(lower),
            owned_bound(upper),
        );
        MemTableIterator::new(cursor)
    }

    pub fn put(&self, key: KeySlice, value: &[u8]) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.put(key, value)?;
        }
        let estimated_size = key.raw_len() + value.len();
        self.skiplist.insert_kv(key.raw_ref(), value);
        self.approximate_size
            .fetch_add(estimated_size, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Flushes every entry into a fresh SST builder, in key order.
    pub fn flush(&self, builder: &mut SsTableBuilder) -> Result<()> {
        let mut cursor = SkipListCursor::new(self.skiplist.clone(), None, None);
        while cursor.is_valid() {
            let key = cursor.key();
            let value = cursor.value();
            builder.add(KeySlice::from_raw(&key), &value);
            cursor.advance();
        }
        Ok(())
    }

    pub fn sync_wal(&self) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.skiplist.first() == crate::arena::NULL_OFFSET
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Forward iterator over a memtable snapshot, bounded by an optional
/// internal-key range. Caches the current key/value as owned buffers so
/// `key()`/`value()` can hand out borrows tied to `&self`, the way the
/// teacher's `#[self_referencing]` iterator did for its borrowed
/// `crossbeam_skiplist` range.
pub struct MemTableIterator {
    cursor: SkipListCursor,
    current_key: Vec<u8>,
    current_value: Vec<u8>,
}

impl MemTableIterator {
    fn new(cursor: SkipListCursor) -> Self {
        let mut iter = Self {
            cursor,
            current_key: Vec::new(),
            current_value: Vec::new(),
        };
        iter.load_current();
        iter
    }

    fn load_current(&mut self) {
        if self.cursor.is_valid() {
            self.current_key = self.cursor.key();
            self.current_value = self.cursor.value();
        } else {
            self.current_key.clear();
            self.current_value.clear();
        }
    }
}

impl StorageIterator for MemTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        KeySlice::from_raw(&self.current_key)
    }

    fn value(&self) -> &[u8] {
        &self.current_value
    }

    fn is_valid(&self) -> bool {
        !self.current_key.is_empty()
    }

    fn next(&mut self) -> Result<()> {
        self.cursor.advance();
        self.load_current();
        Ok(())
    }
}
