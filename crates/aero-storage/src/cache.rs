use crate::{check_bounds, DiskError, Result, VirtualDisk};
use lru::LruCache;
use std::num::NonZeroUsize;

const BLOCK_SIZE: usize = 4096;

struct CachedBlock {
    data: Vec<u8>,
    dirty: bool,
}

/// A write-back block cache over any [`VirtualDisk`]. Grounded on the
/// teacher's `aero_storage::BlockCachedDisk` (imported by
/// `aero-storage/tests/block_cache_eviction_writeback_error.rs`).
///
/// Dirty blocks are written back to the underlying disk on eviction. If that
/// writeback fails, the error surfaces from whichever cache operation
/// triggered the eviction — there is no later chance to observe it, since
/// the evicted block's only copy is gone.
pub struct BlockCachedDisk<D: VirtualDisk> {
    inner: D,
    cache: LruCache<u64, CachedBlock>,
}

impl<D: VirtualDisk> BlockCachedDisk<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Self {
        Self {
            inner,
            cache: LruCache::new(NonZeroUsize::new(capacity_blocks.max(1)).unwrap()),
        }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn block_bounds(&self, block_idx: u64) -> (u64, usize) {
        let offset = block_idx * BLOCK_SIZE as u64;
        let len = (self.inner.capacity_bytes() - offset).min(BLOCK_SIZE as u64) as usize;
        (offset, len)
    }

    fn load_block(&mut self, block_idx: u64) -> Result<()> {
        if self.cache.contains(&block_idx) {
            return Ok(());
        }
        let (offset, len) = self.block_bounds(block_idx);
        let mut data = vec![0u8; len];
        self.inner.read_at(offset, &mut data)?;
        if let Some((evicted_idx, evicted)) = self
            .cache
            .push(block_idx, CachedBlock { data, dirty: false })
        {
            if evicted.dirty {
                self.writeback(evicted_idx, &evicted.data)?;
            }
        }
        Ok(())
    }

    fn writeback(&mut self, block_idx: u64, data: &[u8]) -> Result<()> {
        let (offset, len) = self.block_bounds(block_idx);
        self.inner.write_at(offset, &data[..len])
    }

    /// Flush every dirty block to the underlying disk.
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, b)| b.dirty)
            .map(|(idx, _)| *idx)
            .collect();
        for idx in dirty {
            let data = self.cache.peek(&idx).unwrap().data.clone();
            self.writeback(idx, &data)?;
            if let Some(b) = self.cache.peek_mut(&idx) {
                b.dirty = false;
            }
        }
        Ok(())
    }
}

impl<D: VirtualDisk> VirtualDisk for BlockCachedDisk<D> {
    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.capacity_bytes(), offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block_idx = pos / BLOCK_SIZE as u64;
            let block_off = (pos % BLOCK_SIZE as u64) as usize;
            self.load_block(block_idx)?;
            let block = self.cache.get(&block_idx).unwrap();
            let n = (block.data.len() - block_off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&block.data[block_off..block_off + n]);
            done += n;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.inner.is_writable() {
            return Err(DiskError::WriteProtected);
        }
        check_bounds(self.capacity_bytes(), offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block_idx = pos / BLOCK_SIZE as u64;
            let block_off = (pos % BLOCK_SIZE as u64) as usize;
            self.load_block(block_idx)?;
            let block = self.cache.get_mut(&block_idx).unwrap();
            let n = (block.data.len() - block_off).min(buf.len() - done);
            block.data[block_off..block_off + n].copy_from_slice(&buf[done..done + n]);
            block.dirty = true;
            done += n;
        }
        Ok(())
    }
}
