//! Block cache sitting between the checker and the block device
//!
//! Every block-granular access of the checker goes through [`BlockCache`]:
//! directory blocks, indirect zone tables, bitmap blocks and inode-table
//! blocks. The block size is that of the filesystem being checked.

use parking_lot::RwLock;
use lru::LruCache;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockDeviceError, Result};

/// A cached block with metadata
struct CachedBlock {
    data: Box<[u8]>,
    dirty: bool,
}

/// A block cache that maintains a fixed-size in-memory cache of blocks
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    block_count: u64,
    cache: RwLock<LruCache<u64, CachedBlock>>,
    write_through: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// Create a new block cache with the given capacity (in number of blocks)
    pub fn new(
        device: Arc<dyn BlockDevice>,
        block_size: usize,
        capacity: usize,
        write_through: bool,
    ) -> Self {
        let block_count = device.size() / block_size as u64;
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            device,
            block_size,
            block_count,
            cache: RwLock::new(LruCache::new(capacity)),
            write_through,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Filesystem block size in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of whole blocks on the device
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// The underlying device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Whether writes to the underlying device are refused
    pub fn is_read_only(&self) -> bool {
        self.device.is_read_only()
    }

    /// (hits, misses) since the cache was created
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn check_block(&self, block_num: u64, len: usize) -> Result<()> {
        if block_num >= self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if len != self.block_size {
            return Err(BlockDeviceError::InvalidBlockSize(len, self.block_size));
        }
        Ok(())
    }

    /// Read a block from the cache or device
    pub async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        self.check_block(block_num, buf.len())?;

        {
            let mut cache = self.cache.write();
            if let Some(block) = cache.get(&block_num) {
                buf.copy_from_slice(&block.data);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let offset = block_num * self.block_size as u64;
        self.device.read_at(offset, buf).await?;

        let cached_block = CachedBlock {
            data: buf.to_vec().into_boxed_slice(),
            dirty: false,
        };
        let evicted = self.cache.write().push(block_num, cached_block);
        self.write_back_evicted(evicted).await
    }

    /// Read a block into a freshly allocated buffer
    pub async fn block(&self, block_num: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        self.read_block(block_num, &mut buf).await?;
        Ok(buf)
    }

    /// Write a block to the cache (and device if write-through)
    pub async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        self.check_block(block_num, data.len())?;
        if self.device.is_read_only() {
            return Err(BlockDeviceError::ReadOnly);
        }

        if self.write_through {
            let offset = block_num * self.block_size as u64;
            self.device.write_at(offset, data).await?;
        }

        let cached_block = CachedBlock {
            data: data.to_vec().into_boxed_slice(),
            dirty: !self.write_through,
        };

        // Don't hold the lock across the write-back of an evicted block
        let evicted = {
            let mut cache = self.cache.write();
            cache.push(block_num, cached_block)
        };
        self.write_back_evicted(evicted).await
    }

    /// Patch `data` into the device at a byte offset, through the cache.
    ///
    /// Used for records that are not block aligned, such as the superblock.
    pub async fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let block_size = self.block_size as u64;
        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let block_num = pos / block_size;
            let within = (pos % block_size) as usize;
            let len = (self.block_size - within).min(data.len() - written);

            let mut block = self.block(block_num).await?;
            block[within..within + len].copy_from_slice(&data[written..written + len]);
            self.write_block(block_num, &block).await?;
            written += len;
        }
        Ok(())
    }

    async fn write_back_evicted(&self, evicted: Option<(u64, CachedBlock)>) -> Result<()> {
        if let Some((evicted_block_num, evicted)) = evicted {
            if evicted.dirty {
                let offset = evicted_block_num * self.block_size as u64;
                self.device.write_at(offset, &evicted.data).await?;
            }
        }
        Ok(())
    }

    /// Flush all dirty blocks to disk
    pub async fn flush(&self) -> Result<()> {
        let dirty_blocks: Vec<_> = {
            let cache = self.cache.read();
            cache
                .iter()
                .filter(|(_, block)| block.dirty)
                .map(|(block_num, block)| (*block_num, block.data.clone()))
                .collect()
        };

        if dirty_blocks.is_empty() {
            return Ok(());
        }

        let mut write_errors = Vec::new();
        for (block_num, data) in dirty_blocks {
            let offset = block_num * self.block_size as u64;
            if let Err(e) = self.device.write_at(offset, &data).await {
                log::error!("Failed to write back block {}: {}", block_num, e);
                write_errors.push(block_num);
            } else if let Some(block) = self.cache.write().peek_mut(&block_num) {
                block.dirty = false;
            }
        }

        if !write_errors.is_empty() {
            return Err(BlockDeviceError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to write {} blocks", write_errors.len()),
            )));
        }

        self.device.sync().await
    }
}
