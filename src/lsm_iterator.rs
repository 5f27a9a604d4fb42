//! The engine-facing iterator returned by `scan()`: memtables, L0 tables,
//! and leveled tables merged into one ordered, tombstone-filtering stream
//! bounded by an optional upper key (spec §4.A `scan`).

use std::ops::Bound;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::{
    iterators::{
        concat_iterator::SstConcatIterator, merge_iterator::MergeIterator,
        two_merge_iterator::TwoMergeIterator, StorageIterator,
    },
    mem_table::MemTableIterator,
    table::iterator::SsTableIterator,
    value::ValueStruct,
};

/// memtables (newest first) merged over L0 tables (newest first) merged
/// over leveled tables (each level internally non-overlapping).
pub type LsmIteratorInner = TwoMergeIterator<
    MergeIterator<MemTableIterator>,
    TwoMergeIterator<MergeIterator<SsTableIterator>, MergeIterator<SstConcatIterator>>,
>;

pub struct LsmIterator {
    inner: LsmIteratorInner,
    end_bound: Bound<Bytes>,
    is_valid: bool,
    /// Decoded payload of the current entry, owned since `ValueStruct`
    /// decoding strips the meta/expires_at prefix the inner iterator's
    /// borrow still carries.
    current_value: Vec<u8>,
    /// User key of the last entry this iterator yielded (or considered and
    /// rejected as a stale version of). Internal keys for one user key sort
    /// newest-version-first, so once we've seen a user key, every further
    /// internal key with the same user key is an older version to skip.
    last_key: Option<Vec<u8>>,
}

impl LsmIterator {
    pub(crate) fn new(iter: LsmIteratorInner, end_bound: Bound<Bytes>) -> Result<Self> {
        let mut iter = Self {
            is_valid: iter.is_valid(),
            inner: iter,
            end_bound,
            current_value: Vec::new(),
            last_key: None,
        };
        iter.advance_to_visible()?;
        Ok(iter)
    }

    fn past_end_bound(&self, key: &[u8]) -> bool {
        match self.end_bound.as_ref() {
            Bound::Unbounded => false,
            Bound::Included(k) => key > k.as_ref(),
            Bound::Excluded(k) => key >= k.as_ref(),
        }
    }

    /// Skips older versions of an already-seen key and tombstoned entries,
    /// landing on the next live, newest-version entry (or past the end).
    fn advance_to_visible(&mut self) -> Result<()> {
        loop {
            if !self.inner.is_valid() {
                self.is_valid = false;
                self.current_value.clear();
                return Ok(());
            }
            let key = self.inner.key().key_ref();
            if self.past_end_bound(key) {
                self.is_valid = false;
                self.current_value.clear();
                return Ok(());
            }
            if self.last_key.as_deref() == Some(key) {
                self.inner.next()?;
                continue;
            }
            self.last_key = Some(key.to_vec());
            if ValueStruct::is_tombstone_bytes(self.inner.value()) {
                self.inner.next()?;
                continue;
            }
            self.current_value = ValueStruct::decode(self.inner.value()).value;
            self.is_valid = true;
            return Ok(());
        }
    }
}

impl StorageIterator for LsmIterator {
    type KeyType<'a> = &'a [u8];

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn key(&self) -> &[u8] {
        self.inner.key().key_ref()
    }

    fn value(&self) -> &[u8] {
        &self.current_value
    }

    fn next(&mut self) -> anyhow::Result<()> {
        self.inner.next()?;
        self.advance_to_visible()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.inner.number_of_iterators()
    }
}

/// Wraps an iterator to make misuse loud: calling `key()`/`value()` once
/// invalid, or `next()` again after an error, panics instead of silently
/// returning stale data.
pub struct FusedIterator<I: StorageIterator> {
    iter: I,
    has_errored: bool,
}

impl<I: StorageIterator> FusedIterator<I> {
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            has_errored: false,
        }
    }
}

impl<I: StorageIterator> StorageIterator for FusedIterator<I> {
    type KeyType<'a>
        = I::KeyType<'a>
    where
        Self: 'a;

    fn is_valid(&self) -> bool {
        !self.has_errored && self.iter.is_valid()
    }

    fn key(&self) -> Self::KeyType<'_> {
        assert!(self.is_valid(), "called key() on an invalid iterator");
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.is_valid(), "called value() on an invalid iterator");
        self.iter.value()
    }

    fn next(&mut self) -> Result<()> {
        if self.has_errored {
            bail!("called next() on an iterator that already errored");
        }
        if self.iter.is_valid() {
            if let Err(e) = self.iter.next() {
                self.has_errored = true;
                return Err(e);
            }
        }
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.iter.number_of_iterators()
    }
}
