//! Byte-granular access to a block device through the buffer cache.

use super::*;
use buf::Buffer;
use fs::FileSystem;

use log::trace;

impl FileSystem {
    /// `bread` for collaborators outside the cache.
    pub fn read_block(&self, dev: Dev, block: u32) -> Result<Buffer<'_>> {
        self.bcache.bread(dev, block)
    }

    /// Reads `buf.len()` bytes at `*pos`, advancing `pos`. A failure after
    /// some bytes were copied ends the transfer early.
    pub fn block_read(&self, dev: Dev, pos: &mut u64, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            let block = (*pos / BSIZE as u64) as u32;
            let offset = (*pos % BSIZE as u64) as usize;
            let chars = (BSIZE - offset).min(buf.len() - read);
            let bh = match self.bcache.bread(dev, block) {
                Ok(bh) => bh,
                Err(_) if read > 0 => break,
                Err(e) => return Err(e),
            };
            bh.with(|data| buf[read..read + chars].copy_from_slice(&data[offset..offset + chars]));
            read += chars;
            *pos += chars as u64;
        }
        trace!("block_read {dev:#06x}: {read} bytes");
        Ok(read)
    }

    /// Writes `buf` at `*pos`, advancing `pos`. Whole blocks are not read
    /// first.
    pub fn block_write(&self, dev: Dev, pos: &mut u64, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let block = (*pos / BSIZE as u64) as u32;
            let offset = (*pos % BSIZE as u64) as usize;
            let chars = (BSIZE - offset).min(buf.len() - written);
            let res = if chars == BSIZE {
                self.bcache.getblk(dev, block)
            } else {
                self.bcache.bread(dev, block)
            };
            let mut bh = match res {
                Ok(bh) => bh,
                Err(_) if written > 0 => break,
                Err(e) => return Err(e),
            };
            bh.with_mut(|data| data[offset..offset + chars].copy_from_slice(&buf[written..written + chars]));
            bh.set_uptodate();
            written += chars;
            *pos += chars as u64;
        }
        trace!("block_write {dev:#06x}: {written} bytes");
        Ok(written)
    }

    /// `block_write` of `bytes` at `offset` within `block`.
    pub fn write_through(&self, dev: Dev, block: u32, offset: usize, bytes: &[u8]) -> Result<usize> {
        let mut pos = block as u64 * BSIZE as u64 + offset as u64;
        self.block_write(dev, &mut pos, bytes)
    }
}
