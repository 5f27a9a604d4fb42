//! Lock-free, arena-backed skip list keyed on raw internal-key bytes (spec
//! §4.B). Grounded on `original_source/inmemory/skipList.go`: geometric
//! tower height, `findSpliceForLevel`/`findNear` traversal, CAS-based tower
//! installation, and single-writer overwrite-in-place when an exact internal
//! key (user key + version) is re-inserted.
//!
//! Keys and values are not stored as Rust types inline in the node; the
//! node only holds arena offsets, so the whole structure is safe to share
//! behind an `Arc` and read concurrently with the one writer mutating it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::arena::{Arena, NULL_OFFSET};

pub const MAX_HEIGHT: usize = 20;
/// `heightIncrease = u32::MAX / 3`: each additional level has roughly 1/3
/// the probability of the previous one.
const HEIGHT_INCREASE: u32 = u32::MAX / 3;

const FIELD_KEY_OFFSET: u32 = 0;
const FIELD_KEY_SIZE: u32 = 4;
const FIELD_VALUE: u32 = 8;
const FIELD_HEIGHT: u32 = 16;
const HEADER_SIZE: u32 = 20;

fn pack_value(value_offset: u32, value_size: u32) -> u64 {
    ((value_size as u64) << 32) | value_offset as u64
}

fn unpack_value(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}

fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut h = 1;
    while h < MAX_HEIGHT && rng.gen::<u32>() <= HEIGHT_INCREASE {
        h += 1;
    }
    h
}

pub struct SkipList {
    arena: Arena,
    head: u32,
    height: AtomicU32,
}

impl SkipList {
    pub fn new(arena_capacity: usize) -> Self {
        let arena = Arena::new(arena_capacity);
        let head = Self::alloc_node(&arena, &[], 0, 0, MAX_HEIGHT);
        Self {
            arena,
            head,
            height: AtomicU32::new(1),
        }
    }

    fn alloc_node(arena: &Arena, key: &[u8], value_offset: u32, value_size: u32, height: usize) -> u32 {
        let node_size = HEADER_SIZE as usize + height * 4;
        let node_offset = arena.alloc(node_size);
        let key_offset = if key.is_empty() {
            NULL_OFFSET
        } else {
            arena.put_bytes(key)
        };
        arena.write_u32(node_offset + FIELD_KEY_OFFSET, key_offset);
        arena.write_u32(node_offset + FIELD_KEY_SIZE, key.len() as u32);
        arena
            .atomic_u64_at(node_offset + FIELD_VALUE)
            .store(pack_value(value_offset, value_size), Ordering::Relaxed);
        arena.write_u32(node_offset + FIELD_HEIGHT, height as u32);
        for level in 0..height {
            arena
                .atomic_u32_at(node_offset + HEADER_SIZE + (level as u32) * 4)
                .store(NULL_OFFSET, Ordering::Relaxed);
        }
        node_offset
    }

    fn node_key(&self, node_offset: u32) -> Vec<u8> {
        let key_offset = self.arena.read_u32(node_offset + FIELD_KEY_OFFSET);
        let key_size = self.arena.read_u32(node_offset + FIELD_KEY_SIZE);
        if key_size == 0 {
            return Vec::new();
        }
        self.arena.get_bytes(key_offset, key_size)
    }

    fn node_value(&self, node_offset: u32) -> (u32, u32) {
        let packed = self
            .arena
            .atomic_u64_at(node_offset + FIELD_VALUE)
            .load(Ordering::Acquire);
        unpack_value(packed)
    }

    fn node_height(&self, node_offset: u32) -> usize {
        self.arena.read_u32(node_offset + FIELD_HEIGHT) as usize
    }

    fn next_offset(&self, node_offset: u32, level: usize) -> u32 {
        self.arena
            .atomic_u32_at(node_offset + HEADER_SIZE + (level as u32) * 4)
            .load(Ordering::Acquire)
    }

    fn cas_next(&self, node_offset: u32, level: usize, old: u32, new: u32) -> bool {
        self.arena
            .atomic_u32_at(node_offset + HEADER_SIZE + (level as u32) * 4)
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_next(&self, node_offset: u32, level: usize, new: u32) {
        self.arena
            .atomic_u32_at(node_offset + HEADER_SIZE + (level as u32) * 4)
            .store(new, Ordering::Release);
    }

    fn current_height(&self) -> usize {
        self.height.load(Ordering::Acquire) as usize
    }

    /// Walks forward from `start` at `level`, returning `(before, after)`
    /// such that `before`'s tower points at `after` and `after` is either
    /// null or its key is `>= key`.
    fn find_splice_for_level(&self, key: &[u8], level: usize, start: u32) -> (u32, u32) {
        let mut before = start;
        loop {
            let next = self.next_offset(before, level);
            if next == NULL_OFFSET {
                return (before, next);
            }
            let next_key = self.node_key(next);
            match next_key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => before = next,
                _ => return (before, next),
            }
        }
    }

    /// Finds the first node whose key is `>= key` (or `> key` when
    /// `allow_equal` is false), or `NULL_OFFSET` if none exists.
    pub fn find_near(&self, key: &[u8], allow_equal: bool) -> u32 {
        let mut level = self.current_height().saturating_sub(1);
        let mut x = self.head;
        loop {
            let next = self.next_offset(x, level);
            if next != NULL_OFFSET && self.node_key(next).as_slice() < key {
                x = next;
                continue;
            }
            if level == 0 {
                if next == NULL_OFFSET {
                    return NULL_OFFSET;
                }
                if !allow_equal && self.node_key(next).as_slice() == key {
                    return self.next_offset(next, 0);
                }
                return next;
            }
            level -= 1;
        }
    }

    /// Inserts `key -> (value_offset, value_size)`, or overwrites the
    /// value in place if an identical internal key already exists (spec
    /// §4.B: single-writer overwrite-in-place).
    pub fn insert(&self, key: &[u8], value_offset: u32, value_size: u32) {
        let height = random_height();
        loop {
            let cur_height = self.height.load(Ordering::Acquire);
            if height as u32 <= cur_height {
                break;
            }
            if self
                .height
                .compare_exchange(cur_height, height as u32, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let mut prev = [self.head; MAX_HEIGHT];
        let mut next = [NULL_OFFSET; MAX_HEIGHT];
        let top = self.current_height() - 1;
        let mut cursor = self.head;
        for level in (0..=top).rev() {
            let (before, after) = self.find_splice_for_level(key, level, cursor);
            prev[level] = before;
            next[level] = after;
            cursor = before;
        }

        if next[0] != NULL_OFFSET && self.node_key(next[0]) == key {
            self.arena
                .atomic_u64_at(next[0] + FIELD_VALUE)
                .store(pack_value(value_offset, value_size), Ordering::Release);
            return;
        }

        let node_offset = Self::alloc_node(&self.arena, key, value_offset, value_size, height);
        for level in 0..height {
            loop {
                self.set_next(node_offset, level, next[level]);
                if self.cas_next(prev[level], level, next[level], node_offset) {
                    break;
                }
                // Lost the race (or prev's successor at this level changed
                // since we haven't re-walked it): recompute the splice.
                let (before, after) = self.find_splice_for_level(key, level, prev[level]);
                prev[level] = before;
                next[level] = after;
                if next[level] != NULL_OFFSET && self.node_key(next[level]) == key {
                    assert_eq!(
                        level, 0,
                        "equal-key hit above level 0 during CAS retry: only the \
                         level-0 splice may silently overwrite on an exact match"
                    );
                    self.arena
                        .atomic_u64_at(next[level] + FIELD_VALUE)
                        .store(pack_value(value_offset, value_size), Ordering::Release);
                    return;
                }
            }
        }
    }

    /// Writes `value` into the arena and inserts `key -> value`, or
    /// overwrites the value in place for an exact key match.
    pub fn insert_kv(&self, key: &[u8], value: &[u8]) {
        let value_offset = self.arena.put_bytes(value);
        self.insert(key, value_offset, value.len() as u32);
    }

    /// Returns the value for an exact internal key match, if present.
    pub fn get(&self, key: &[u8]) -> Option<(u32, u32)> {
        let found = self.find_near(key, true);
        if found == NULL_OFFSET {
            return None;
        }
        if self.node_key(found) == key {
            Some(self.node_value(found))
        } else {
            None
        }
    }

    /// Like `get`, but resolves the value bytes directly.
    pub fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get(key).map(|(o, s)| self.arena.get_bytes(o, s))
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn read_value(&self, offset: u32, size: u32) -> Vec<u8> {
        self.arena.get_bytes(offset, size)
    }

    pub fn mem_usage(&self) -> usize {
        self.arena.len() as usize
    }

    /// First node past the head sentinel, or `NULL_OFFSET` if empty.
    pub fn first(&self) -> u32 {
        self.next_offset(self.head, 0)
    }

    pub fn next(&self, node_offset: u32) -> u32 {
        self.next_offset(node_offset, 0)
    }

    pub fn key_at(&self, node_offset: u32) -> Vec<u8> {
        self.node_key(node_offset)
    }

    pub fn value_at(&self, node_offset: u32) -> (u32, u32) {
        self.node_value(node_offset)
    }
}

/// A forward cursor over a skip list, used by `MemTableIterator`. Holds a
/// shared `Arc<SkipList>` and a plain `u32` offset rather than a borrowed
/// Rust iterator, which is why no self-referential struct is needed here
/// (unlike the `crossbeam_skiplist`-backed memtable this replaces).
pub struct SkipListCursor {
    list: Arc<SkipList>,
    current: u32,
    lower: Option<Vec<u8>>,
    lower_inclusive: bool,
    upper: Option<Vec<u8>>,
    upper_inclusive: bool,
}

impl SkipListCursor {
    pub fn new(
        list: Arc<SkipList>,
        lower: Option<(Vec<u8>, bool)>,
        upper: Option<(Vec<u8>, bool)>,
    ) -> Self {
        let start = match &lower {
            Some((key, inclusive)) => {
                let found = list.find_near(key, true);
                if found != NULL_OFFSET && !*inclusive && list.key_at(found) == *key {
                    list.next(found)
                } else {
                    found
                }
            }
            None => list.first(),
        };
        let (lower, lower_inclusive) = lower.map(|(k, i)| (Some(k), i)).unwrap_or((None, true));
        let (upper, upper_inclusive) = upper.map(|(k, i)| (Some(k), i)).unwrap_or((None, true));
        let mut cursor = Self {
            list,
            current: start,
            lower,
            lower_inclusive,
            upper,
            upper_inclusive,
        };
        cursor.clamp_upper();
        cursor
    }

    fn clamp_upper(&mut self) {
        if self.current == NULL_OFFSET {
            return;
        }
        if let Some(upper) = &self.upper {
            let key = self.list.key_at(self.current);
            let past = if self.upper_inclusive {
                key.as_slice() > upper.as_slice()
            } else {
                key.as_slice() >= upper.as_slice()
            };
            if past {
                self.current = NULL_OFFSET;
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.current != NULL_OFFSET
    }

    pub fn key(&self) -> Vec<u8> {
        self.list.key_at(self.current)
    }

    pub fn value_ref(&self) -> (u32, u32) {
        self.list.value_at(self.current)
    }

    pub fn value(&self) -> Vec<u8> {
        let (offset, size) = self.value_ref();
        self.list.read_value(offset, size)
    }

    pub fn advance(&mut self) {
        self.current = self.list.next(self.current);
        self.clamp_upper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let list = SkipList::new(1 << 12);
        list.insert(b"a", 10, 1);
        list.insert(b"b", 20, 2);
        list.insert(b"c", 30, 3);
        assert_eq!(list.get(b"b"), Some((20, 2)));
        assert_eq!(list.get(b"z"), None);
    }

    #[test]
    fn overwrite_in_place() {
        let list = SkipList::new(1 << 12);
        list.insert(b"a", 10, 1);
        list.insert(b"a", 99, 5);
        assert_eq!(list.get(b"a"), Some((99, 5)));
    }

    #[test]
    fn forward_iteration_is_sorted() {
        let list = SkipList::new(1 << 12);
        for k in [b"d", b"b", b"a", b"c"] {
            list.insert(k, 0, 0);
        }
        let list = Arc::new(list);
        let mut cur = SkipListCursor::new(list, None, None);
        let mut seen = Vec::new();
        while cur.is_valid() {
            seen.push(cur.key());
            cur.advance();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn concurrent_writers_insert_disjoint_keys() {
        const WRITERS: usize = 8;
        const PER_WRITER: usize = 2_000;
        let list = Arc::new(SkipList::new(1 << 24));
        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        let key = format!("w{w:02}-{i:06}");
                        list.insert_kv(key.as_bytes(), b"v");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut cur = SkipListCursor::new(Arc::clone(&list), None, None);
        let mut count = 0;
        let mut prev: Option<Vec<u8>> = None;
        while cur.is_valid() {
            let key = cur.key();
            if let Some(prev) = &prev {
                assert!(prev < &key, "iteration order not sorted");
            }
            prev = Some(key);
            count += 1;
            cur.advance();
        }
        assert_eq!(count, WRITERS * PER_WRITER);
    }
}
