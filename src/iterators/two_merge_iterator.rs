use anyhow::Result;

use crate::key::KeySlice;

use super::StorageIterator;

/// Merges two ordered iterators `A` and `B` where `A` takes priority on a
/// key collision (used to layer L0/memtable output, which is newer, over a
/// lower level's concatenated output during compaction and point lookups).
pub struct TwoMergeIterator<A: StorageIterator, B: StorageIterator> {
    a: A,
    b: B,
    choose_a: bool,
}

impl<A, B> TwoMergeIterator<A, B>
where
    A: for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
    B: for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
{
    fn choose_a(a: &A, b: &B) -> bool {
        if !a.is_valid() {
            return false;
        }
        if !b.is_valid() {
            return true;
        }
        a.key() <= b.key()
    }

    pub fn create(a: A, b: B) -> Result<Self> {
        let mut iter = Self {
            choose_a: Self::choose_a(&a, &b),
            a,
            b,
        };
        iter.skip_b_duplicates()?;
        Ok(iter)
    }

    /// If both sides currently hold the same key, `b`'s copy is stale and
    /// must be skipped so the merged stream never yields duplicate keys.
    fn skip_b_duplicates(&mut self) -> Result<()> {
        if self.a.is_valid() && self.b.is_valid() && self.a.key() == self.b.key() {
            self.b.next()?;
        }
        Ok(())
    }
}

impl<A, B> StorageIterator for TwoMergeIterator<A, B>
where
    A: for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
    B: for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
{
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        if self.choose_a {
            self.a.key()
        } else {
            self.b.key()
        }
    }

    fn value(&self) -> &[u8] {
        if self.choose_a {
            self.a.value()
        } else {
            self.b.value()
        }
    }

    fn is_valid(&self) -> bool {
        if self.choose_a {
            self.a.is_valid()
        } else {
            self.b.is_valid()
        }
    }

    fn next(&mut self) -> Result<()> {
        if self.choose_a {
            self.a.next()?;
        } else {
            self.b.next()?;
        }
        self.skip_b_duplicates()?;
        self.choose_a = Self::choose_a(&self.a, &self.b);
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.a.number_of_iterators() + self.b.number_of_iterators()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyVec;

    struct VecIter {
        items: Vec<(KeyVec, Vec<u8>)>,
        idx: usize,
    }

    impl VecIter {
        fn new(items: Vec<(&'static [u8], &'static [u8])>) -> Self {
            Self {
                items: items
                    .into_iter()
                    .map(|(k, v)| (KeyVec::from_user_key_and_ts(k, 0), v.to_vec()))
                    .collect(),
                idx: 0,
            }
        }
    }

    impl StorageIterator for VecIter {
        type KeyType<'a> = KeySlice<'a>;
        fn key(&self) -> KeySlice {
            self.items[self.idx].0.as_key_slice()
        }
        fn value(&self) -> &[u8] {
            &self.items[self.idx].1
        }
        fn is_valid(&self) -> bool {
            self.idx < self.items.len()
        }
        fn next(&mut self) -> Result<()> {
            self.idx += 1;
            Ok(())
        }
    }

    #[test]
    fn a_takes_priority_on_collision() {
        let a = VecIter::new(vec![(b"a", b"a-new")]);
        let b = VecIter::new(vec![(b"a", b"a-old"), (b"b", b"b-only")]);
        let mut merged = TwoMergeIterator::create(a, b).unwrap();
        assert_eq!(merged.key().key_ref(), b"a");
        assert_eq!(merged.value(), b"a-new");
        merged.next().unwrap();
        assert_eq!(merged.key().key_ref(), b"b");
        assert_eq!(merged.value(), b"b-only");
        merged.next().unwrap();
        assert!(!merged.is_valid());
    }
}
