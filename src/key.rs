//! Internal keys: a user key extended with an 8-byte big-endian version
//! suffix so that newer versions sort before older versions under plain
//! lexicographic byte compare (see spec §3, "Internal key").

use bytes::Bytes;
use std::cmp::Ordering;

/// Width of the version suffix appended to every internal key.
pub const TS_LEN: usize = 8;

/// Sentinel passed to a lookup that wants the newest version of a key,
/// whatever it is. Encodes to a suffix of zero, which sorts before any
/// real (smaller) version's suffix.
pub const TS_MAX: u64 = u64::MAX;

/// Oldest possible version, useful as an exclusive range's upper bound.
pub const TS_MIN: u64 = 0;

fn encode_ts_suffix(version: u64) -> [u8; TS_LEN] {
    (TS_MAX - version).to_be_bytes()
}

fn decode_ts_suffix(suffix: &[u8]) -> u64 {
    let mut buf = [0u8; TS_LEN];
    buf.copy_from_slice(suffix);
    TS_MAX - u64::from_be_bytes(buf)
}

/// An internal key. `T` holds the raw encoded bytes: user key followed by
/// the 8-byte version suffix. `KeySlice` borrows, `KeyVec` owns a `Vec<u8>`,
/// `KeyBytes` owns a ref-counted `Bytes`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Key<T: AsRef<[u8]>>(T);

pub type KeySlice<'a> = Key<&'a [u8]>;
pub type KeyVec = Key<Vec<u8>>;
pub type KeyBytes = Key<Bytes>;

impl<T: AsRef<[u8]>> Key<T> {
    fn assert_len(bytes: &[u8]) {
        assert!(
            bytes.len() >= TS_LEN,
            "internal key shorter than the version suffix: {} bytes",
            bytes.len()
        );
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Full encoded bytes: user key followed by the version suffix.
    pub fn raw_ref(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn raw_len(&self) -> usize {
        self.0.as_ref().len()
    }

    /// The user-visible key, without the version suffix.
    pub fn key_ref(&self) -> &[u8] {
        let raw = self.0.as_ref();
        Self::assert_len(raw);
        &raw[..raw.len() - TS_LEN]
    }

    /// The decoded version number.
    pub fn ts(&self) -> u64 {
        let raw = self.0.as_ref();
        Self::assert_len(raw);
        decode_ts_suffix(&raw[raw.len() - TS_LEN..])
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_ref().is_empty()
    }
}

impl<T: AsRef<[u8]> + Clone> Key<T> {
    pub fn to_key_vec(&self) -> KeyVec {
        Key(self.0.as_ref().to_vec())
    }
}

impl<'a> KeySlice<'a> {
    /// Wraps already-encoded bytes (user key + suffix) with no further
    /// processing; used when borrowing raw bytes read back off the skip
    /// list, a block, or an SST.
    pub fn from_raw(bytes: &'a [u8]) -> Self {
        Key(bytes)
    }
}

impl KeyVec {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Wraps already-encoded bytes (user key + suffix) with no further
    /// processing; used when reassembling a key read off disk.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Builds an owned internal key from a user key and a version number.
    pub fn from_user_key_and_ts(user_key: &[u8], version: u64) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TS_LEN);
        buf.extend_from_slice(user_key);
        buf.extend_from_slice(&encode_ts_suffix(version));
        Key(buf)
    }

    /// Overwrites this key's bytes from another key's raw (encoded) bytes.
    pub fn set_from_slice(&mut self, key: KeySlice) {
        self.0.clear();
        self.0.extend_from_slice(key.raw_ref());
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key(&self.0[..])
    }

    pub fn into_key_bytes(self) -> KeyBytes {
        Key(self.0.into())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl KeyBytes {
    pub fn new() -> Self {
        Self(Bytes::new())
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Builds an owned internal key (ref-counted storage) from a user key
    /// and a version number. This is the standard way to build a one-off
    /// search key for a lookup or range bound.
    pub fn from_bytes_with_ts(user_key: Bytes, version: u64) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TS_LEN);
        buf.extend_from_slice(&user_key);
        buf.extend_from_slice(&encode_ts_suffix(version));
        Key(buf.into())
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key(&self.0[..])
    }
}

impl<T: AsRef<[u8]>> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw_ref() == other.raw_ref()
    }
}

impl<T: AsRef<[u8]>> Eq for Key<T> {}

impl<T: AsRef<[u8]>> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: AsRef<[u8]>> Ord for Key<T> {
    /// Lexicographic compare of the full encoded bytes. Because the suffix
    /// encodes `u64::MAX - version`, this is exactly the compare contract of
    /// spec §3: equal user keys break ties by ascending suffix, i.e.
    /// descending version (newer first).
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw_ref().cmp(other.raw_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_version_sorts_first() {
        let a = KeyVec::from_user_key_and_ts(b"k", 2);
        let b = KeyVec::from_user_key_and_ts(b"k", 1);
        assert!(a.as_key_slice() < b.as_key_slice());
        assert_eq!(a.key_ref(), b.key_ref());
    }

    #[test]
    fn user_key_dominates_version() {
        let a = KeyVec::from_user_key_and_ts(b"a", 100);
        let b = KeyVec::from_user_key_and_ts(b"b", 1);
        assert!(a.as_key_slice() < b.as_key_slice());
    }

    #[test]
    fn roundtrip_ts() {
        let k = KeyVec::from_user_key_and_ts(b"hello", 42);
        assert_eq!(k.ts(), 42);
        assert_eq!(k.key_ref(), b"hello");
    }

    #[test]
    #[should_panic]
    fn short_key_panics() {
        let k: KeySlice = Key(b"short".as_slice());
        let _ = k.key_ref();
    }
}
