#![allow(unused)]
pub(crate) mod bloom;
pub(crate) mod builder;
pub mod iterator;

pub use builder::SsTableBuilder;
pub use iterator::SsTableIterator;

use self::bloom::Bloom;
use crate::block::Block;
use crate::error::LsmError;
use crate::key::{Key, KeyBytes, KeySlice};
use crate::lsm_storage::BlockCache;
use anyhow::Result;
use bytes::{Buf, BufMut};
use memmap2::Mmap;
use std::{fs::File, io::Read, path::Path, sync::Arc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    offset: usize,
    /// Encoded byte length of this block on disk, including its trailing
    /// checksum. Lets a reader size a block without relying on the next
    /// entry's offset (or `block_meta_offset` for the last block).
    len: u32,
    first_key: KeyBytes,
    last_key: KeyBytes,
    /// Number of entries (including stale/tombstoned ones) in this block.
    key_count: u32,
    /// Bytes occupied by entries in this block that are shadowed by a newer
    /// version of the same user key elsewhere in this table — a lower bound
    /// on what compacting this block away would reclaim.
    stale_data_size: u64,
}

impl BlockMeta {
    pub fn encode_block_meta(block_meta: &[BlockMeta], max_ts: u64, buf: &mut Vec<u8>) {
        // calculate the estimated_size of the encoded data.
        let mut estimated_size = std::mem::size_of::<u32>();
        for meta in block_meta {
            // calculate the size of each block's metadata.
            estimated_size += std::mem::size_of::<u32>(); // offset
            estimated_size += std::mem::size_of::<u32>(); // len
            estimated_size += std::mem::size_of::<u16>() + meta.first_key.len();
            estimated_size += std::mem::size_of::<u16>() + meta.last_key.len();
            estimated_size += std::mem::size_of::<u32>(); // key_count
            estimated_size += std::mem::size_of::<u64>(); // stale_data_size
        }
        // the max version carried across every block, plus the checksum.
        estimated_size += std::mem::size_of::<u64>();
        estimated_size += std::mem::size_of::<u32>();

        // reserve space in the buffer to improve perf.
        buf.reserve(estimated_size);
        let original_len = buf.len();
        buf.put_u32(block_meta.len() as u32);

        for meta in block_meta {
            buf.put_u32(meta.offset as u32);
            buf.put_u32(meta.len);
            buf.put_u16(meta.first_key.len() as u16);
            buf.put_slice(meta.first_key.raw_ref());
            buf.put_u16(meta.last_key.len() as u16);
            buf.put_slice(meta.last_key.raw_ref());
            buf.put_u32(meta.key_count);
            buf.put_u64(meta.stale_data_size);
        }
        buf.put_u64(max_ts);
        buf.put_u32(crc32fast::hash(&buf[original_len + 4..]));
        assert_eq!(estimated_size, buf.len() - original_len)
    }

    pub fn decode_block_meta(mut buf: &[u8]) -> Result<(Vec<BlockMeta>, u64)> {
        let mut block_meta = Vec::new();
        let num = buf.get_u32() as usize;
        let checksum = crc32fast::hash(&buf[..buf.remaining() - 4]);
        for _ in 0..num {
            let offset = buf.get_u32() as usize;
            let len = buf.get_u32();
            let first_key_len = buf.get_u16() as usize;
            let first_key = KeyBytes::from_bytes(buf.copy_to_bytes(first_key_len));
            let last_key_len: usize = buf.get_u16() as usize;
            let last_key = KeyBytes::from_bytes(buf.copy_to_bytes(last_key_len));
            let key_count = buf.get_u32();
            let stale_data_size = buf.get_u64();
            block_meta.push(BlockMeta {
                offset,
                len,
                first_key,
                last_key,
                key_count,
                stale_data_size,
            });
        }
        let max_ts = buf.get_u64();
        if buf.get_u32() != checksum {
            return Err(LsmError::ChecksumMismatch("sstable meta block").into());
        }
        Ok((block_meta, max_ts))
    }
}

/// A file object: a read-only mmap over a finished, immutable SST. SSTs are
/// written once by `SsTableBuilder::build` and never modified afterwards, so
/// the whole file is mapped once at open/create time and reads become plain
/// slice copies instead of syscalls.
pub struct FileObject {
    #[allow(dead_code)]
    file: File,
    mmap: Mmap,
    size: u64,
}

impl FileObject {
    pub fn create(path: &Path, data: Vec<u8>) -> Result<Self> {
        std::fs::write(path, &data)?;
        let file = File::open(path)?;
        file.sync_all()?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(FileObject {
            file,
            mmap,
            size: data.len() as u64,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options().read(true).write(false).open(path)?;
        let size = file.metadata()?.len();
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(FileObject { file, mmap, size })
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + len as usize;
        Ok(self.mmap[start..end].to_vec())
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// An SSTable is a file format used for storing key-value pairs sorted by keys.
pub struct SsTable {
    // the actual storage unit of SsTable.
    pub(crate) file: FileObject,
    // the meda blocks that hold info for data blocks.
    pub(crate) block_meta: Vec<BlockMeta>,
    // the offset that indicates the start point of meta blocks in `file`.
    pub(crate) block_meta_offset: usize,
    id: usize,
    block_cache: Option<Arc<BlockCache>>,
    first_key: KeyBytes,
    last_key: KeyBytes,
    pub(crate) bloom: Option<Bloom>,
    pub(crate) max_ts: u64,
    /// CRC32 over the whole encoded file, computed once at build time and
    /// recorded in the manifest's `CreateTable` record so a later
    /// `open()`/reconcile pass can detect silent on-disk corruption.
    checksum: u32,
}

impl SsTable {
    /// `open()` is responsible for opening an SSTable from a file.
    /// this function reads the necessary metadata from the file,
    /// including the Bloom filter and constructs an `SSTable` object.
    /// id : an identifier for the SSTable
    /// block_cache: Optional, used to store blocks of data read from the SSTable file.
    /// file : the file object representing the SSTable file.
    pub fn open(id: usize, block_cache: Option<Arc<BlockCache>>, file: FileObject) -> Result<Self> {
        // Read metadata.
        let len = file.size();
        let raw_bloom_offset = file.read(len - 4, 4)?;
        let bloom_offset = (&raw_bloom_offset[..]).get_u32() as u64;
        let raw_bloom = file.read(bloom_offset, len - 4 - bloom_offset)?;
        let bloom_filter = Bloom::decode(&raw_bloom)?;
        // read block metadata.
        let raw_meta_offset = file.read(bloom_offset - 4, 4)?;
        let block_meta_offset = (&raw_meta_offset[..]).get_u32() as u64;
        let raw_meta = file.read(block_meta_offset, bloom_offset - 4 - block_meta_offset)?;
        let (block_meta, max_ts) = BlockMeta::decode_block_meta(&raw_meta[..])?;
        let checksum = crc32fast::hash(&file.read(0, len)?);
        // construct SSTable Object.
        Ok(Self {
            file,
            first_key: block_meta.first().unwrap().first_key.clone(),
            last_key: block_meta.last().unwrap().last_key.clone(),
            block_meta,
            block_meta_offset: block_meta_offset as usize,
            id,
            block_cache,
            bloom: Some(bloom_filter),
            max_ts,
            checksum,
        })
    }

    pub fn max_ts(&self) -> u64 {
        self.max_ts
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Total bytes across this table's blocks that belong to a shadowed
    /// (non-newest) version of a user key.
    pub fn stale_data_size(&self) -> u64 {
        self.block_meta.iter().map(|m| m.stale_data_size).sum()
    }

    pub fn first_key(&self) -> &KeyBytes {
        &self.first_key
    }
    pub fn last_key(&self) -> &KeyBytes {
        &self.last_key
    }
    pub fn num_of_blocks(&self) -> usize {
        self.block_meta.len()
    }
    pub fn table_size(&self) -> u64 {
        self.file.size()
    }
    pub fn sst_id(&self) -> usize {
        self.id
    }

    /// Reads and checksum-verifies block `block_idx` straight off disk, no
    /// caching.
    pub fn read_block(&self, block_idx: usize) -> Result<Arc<Block>> {
        let meta = &self.block_meta[block_idx];
        let raw = self.file.read(meta.offset as u64, meta.len as u64)?;
        let block_len = raw.len() - 4;
        let checksum = (&raw[block_len..]).get_u32();
        if checksum != crc32fast::hash(&raw[..block_len]) {
            return Err(LsmError::ChecksumMismatch("sstable data block").into());
        }
        Ok(Arc::new(Block::decode(&raw[..block_len])))
    }

    /// Reads block `block_idx`, going through the block cache (spec §4.H).
    pub fn read_block_cached(&self, block_idx: usize) -> Result<Arc<Block>> {
        let Some(cache) = &self.block_cache else {
            return self.read_block(block_idx);
        };
        let key = Self::block_cache_key(self.id, block_idx);
        if let Some(block) = cache.get(&key) {
            return Ok(block);
        }
        let block = self.read_block(block_idx)?;
        cache.insert(&key, block.clone());
        Ok(block)
    }

    fn block_cache_key(sst_id: usize, block_idx: usize) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&(sst_id as u64).to_le_bytes());
        key[8..].copy_from_slice(&(block_idx as u64).to_le_bytes());
        key
    }

    /// The last block whose `first_key` is `<= key`; the caller falls
    /// through to the next block if the key isn't actually found there.
    pub fn find_block_idx(&self, key: KeySlice) -> usize {
        self.block_meta
            .partition_point(|meta| meta.first_key.as_key_slice() <= key)
            .saturating_sub(1)
    }
}
