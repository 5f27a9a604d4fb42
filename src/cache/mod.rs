//! W-TinyLFU admission cache (spec §4.F): a window-LRU feeds new entries
//! into a segmented LRU (`stage_one` probationary, `stage_two` protected),
//! with a Count-Min sketch and a doorkeeper Bloom filter deciding whether a
//! window eviction is worth admitting over the SLRU's current victim.
//! Grounded on `original_source/cache/cache.go`,
//! `bloomfilter/s2lru.go`. Used as the block cache (`fid|block_idx ->
//! block`, spec §4.H); the open-table map already in `lsm_storage`'s state
//! serves as the "hot index" tier, so only block caching needs a bounded
//! eviction policy here.

mod doorkeeper;
mod sketch;

use std::collections::HashMap;

use parking_lot::Mutex;

use doorkeeper::Doorkeeper;
use sketch::CountMinSketch;

const NIL: usize = usize::MAX;
const WINDOW_PCT: f64 = 0.01;
const STAGE_ONE_PCT: f64 = 0.2;
/// Reset the sketch and doorkeeper after this many `get` calls, so frequency
/// estimates track a moving window instead of all-time totals.
const AGING_THRESHOLD: u32 = 10_000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    Window,
    StageOne,
    StageTwo,
}

struct Node<V> {
    key_hash: u64,
    conflict_hash: u64,
    value: V,
    stage: Stage,
    prev: usize,
    next: usize,
}

/// An intrusive doubly-linked list over a shared slab of `Node<V>`s,
/// addressed by index so nodes can move between the window/stage-one/
/// stage-two lists without reallocating.
struct DList {
    head: usize,
    tail: usize,
    len: usize,
}

impl DList {
    fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    fn push_front<V>(&mut self, arena: &mut [Node<V>], idx: usize) {
        arena[idx].prev = NIL;
        arena[idx].next = self.head;
        if self.head != NIL {
            arena[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
        self.len += 1;
    }

    fn remove<V>(&mut self, arena: &mut [Node<V>], idx: usize) {
        let (prev, next) = (arena[idx].prev, arena[idx].next);
        if prev != NIL {
            arena[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            arena[next].prev = prev;
        } else {
            self.tail = prev;
        }
        arena[idx].prev = NIL;
        arena[idx].next = NIL;
        self.len -= 1;
    }

    fn move_to_front<V>(&mut self, arena: &mut [Node<V>], idx: usize) {
        if self.head == idx {
            return;
        }
        self.remove(arena, idx);
        self.push_front(arena, idx);
    }

    fn back(&self) -> Option<usize> {
        (self.tail != NIL).then_some(self.tail)
    }
}

struct Inner<V> {
    arena: Vec<Node<V>>,
    free: Vec<usize>,
    index: HashMap<u64, usize>,
    window: DList,
    stage_one: DList,
    stage_two: DList,
    window_cap: usize,
    stage_one_cap: usize,
    stage_two_cap: usize,
    sketch: CountMinSketch,
    doorkeeper: Doorkeeper,
    ops_since_aging: u32,
}

impl<V> Inner<V> {
    fn age_if_due(&mut self) {
        self.ops_since_aging += 1;
        if self.ops_since_aging >= AGING_THRESHOLD {
            self.sketch.reset();
            self.doorkeeper.reset();
            self.ops_since_aging = 0;
        }
    }

    fn alloc_node(&mut self, key_hash: u64, conflict_hash: u64, value: V, stage: Stage) -> usize {
        let node = Node {
            key_hash,
            conflict_hash,
            value,
            stage,
            prev: NIL,
            next: NIL,
        };
        if let Some(idx) = self.free.pop() {
            self.arena[idx] = node;
            idx
        } else {
            self.arena.push(node);
            self.arena.len() - 1
        }
    }

    fn drop_node(&mut self, idx: usize) {
        self.index.remove(&self.arena[idx].key_hash);
        self.free.push(idx);
    }

    /// Promotes a just-accessed entry within its list: window entries just
    /// move to front; stage_one entries graduate to stage_two on a second
    /// touch (demoting stage_two's LRU back to stage_one if it's full).
    fn touch(&mut self, idx: usize) {
        match self.arena[idx].stage {
            Stage::Window => self.window.move_to_front(&mut self.arena, idx),
            Stage::StageTwo => self.stage_two.move_to_front(&mut self.arena, idx),
            Stage::StageOne => {
                if self.stage_two.len < self.stage_two_cap {
                    self.stage_one.remove(&mut self.arena, idx);
                    self.arena[idx].stage = Stage::StageTwo;
                    self.stage_two.push_front(&mut self.arena, idx);
                } else if let Some(back) = self.stage_two.back() {
                    self.stage_two.remove(&mut self.arena, back);
                    self.stage_one.remove(&mut self.arena, idx);
                    self.arena[back].stage = Stage::StageOne;
                    self.arena[idx].stage = Stage::StageTwo;
                    self.stage_one.push_front(&mut self.arena, back);
                    self.stage_two.push_front(&mut self.arena, idx);
                }
            }
        }
    }

    fn set(&mut self, key_hash: u64, conflict_hash: u64, value: V) {
        if let Some(&idx) = self.index.get(&key_hash) {
            self.arena[idx].value = value;
            self.arena[idx].conflict_hash = conflict_hash;
            self.touch(idx);
            return;
        }

        let idx = self.alloc_node(key_hash, conflict_hash, value, Stage::Window);
        self.index.insert(key_hash, idx);
        self.window.push_front(&mut self.arena, idx);
        if self.window.len <= self.window_cap {
            return;
        }

        let evicted = self.window.back().expect("just pushed a window entry");
        self.window.remove(&mut self.arena, evicted);

        let slru_len = self.stage_one.len + self.stage_two.len;
        if slru_len < self.stage_one_cap + self.stage_two_cap {
            self.arena[evicted].stage = Stage::StageOne;
            self.stage_one.push_front(&mut self.arena, evicted);
            return;
        }

        let victim = self
            .stage_one
            .back()
            .expect("full slru implies a stage_one victim");
        let seen_before = self.doorkeeper.allow(self.arena[evicted].key_hash);
        if !seen_before {
            self.drop_node(evicted);
            return;
        }

        let victim_est = self.sketch.estimate(self.arena[victim].key_hash);
        let candidate_est = self.sketch.estimate(self.arena[evicted].key_hash);
        if candidate_est > victim_est {
            self.stage_one.remove(&mut self.arena, victim);
            self.drop_node(victim);
            self.arena[evicted].stage = Stage::StageOne;
            self.stage_one.push_front(&mut self.arena, evicted);
        } else {
            self.drop_node(evicted);
        }
    }

    fn remove(&mut self, key_hash: u64) {
        if let Some(&idx) = self.index.get(&key_hash) {
            match self.arena[idx].stage {
                Stage::Window => self.window.remove(&mut self.arena, idx),
                Stage::StageOne => self.stage_one.remove(&mut self.arena, idx),
                Stage::StageTwo => self.stage_two.remove(&mut self.arena, idx),
            }
            self.drop_node(idx);
        }
    }
}

fn key2hash(key: &[u8]) -> (u64, u64) {
    use xxhash_rust::xxh3::xxh3_64_with_seed;
    const CONFLICT_SEED: u64 = 0x9E37_79B9_7F4A_7C15;
    (xxh3_64_with_seed(key, 0), xxh3_64_with_seed(key, CONFLICT_SEED))
}

/// A bounded, frequency-aware cache keyed by raw bytes. Used as the SST
/// block cache (`lsm_storage::BlockCache`), keyed by `fid|block_idx`.
pub struct AdmissionCache<V> {
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> AdmissionCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let window_cap = ((WINDOW_PCT * capacity as f64) as usize).max(1);
        let slru_cap = capacity.saturating_sub(window_cap).max(1);
        let stage_one_cap = ((STAGE_ONE_PCT * slru_cap as f64) as usize).max(1);
        let stage_two_cap = slru_cap.saturating_sub(stage_one_cap).max(1);
        Self {
            inner: Mutex::new(Inner {
                arena: Vec::new(),
                free: Vec::new(),
                index: HashMap::new(),
                window: DList::new(),
                stage_one: DList::new(),
                stage_two: DList::new(),
                window_cap,
                stage_one_cap,
                stage_two_cap,
                sketch: CountMinSketch::new(capacity),
                doorkeeper: Doorkeeper::new(capacity, 0.01),
                ops_since_aging: 0,
            }),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<V> {
        let (key_hash, conflict_hash) = key2hash(key);
        let mut inner = self.inner.lock();
        inner.age_if_due();
        let hit = match inner.index.get(&key_hash).copied() {
            Some(idx) if inner.arena[idx].conflict_hash == conflict_hash => Some(idx),
            _ => None,
        };
        inner.doorkeeper.allow(key_hash);
        inner.sketch.increment(key_hash);
        let idx = hit?;
        let value = inner.arena[idx].value.clone();
        inner.touch(idx);
        Some(value)
    }

    pub fn insert(&self, key: &[u8], value: V) {
        let (key_hash, conflict_hash) = key2hash(key);
        self.inner.lock().set(key_hash, conflict_hash, value);
    }

    #[allow(dead_code)]
    pub fn remove(&self, key: &[u8]) {
        let (key_hash, _) = key2hash(key);
        self.inner.lock().remove(key_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let cache: AdmissionCache<u32> = AdmissionCache::new(64);
        cache.insert(b"a", 1);
        assert_eq!(cache.get(b"a"), Some(1));
        assert_eq!(cache.get(b"missing"), None);
    }

    #[test]
    fn frequently_read_keys_survive_window_churn() {
        let cache: AdmissionCache<u32> = AdmissionCache::new(32);
        cache.insert(b"hot", 1);
        // Touch it enough to graduate to stage_two.
        for _ in 0..5 {
            cache.get(b"hot");
        }
        // Flood with one-touch keys to force window/SLRU churn.
        for i in 0..2000u32 {
            cache.insert(&i.to_le_bytes(), i);
        }
        assert_eq!(cache.get(b"hot"), Some(1));
    }

    #[test]
    fn remove_forgets_key() {
        let cache: AdmissionCache<u32> = AdmissionCache::new(64);
        cache.insert(b"a", 1);
        cache.remove(b"a");
        assert_eq!(cache.get(b"a"), None);
    }
}
