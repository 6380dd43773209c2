//! Inode and zone bitmaps.
//!
//! Each bitmap is a handful of pages pinned in the buffer cache for as long
//! as the device is mounted. Bit `j` of page `i` stands for unit
//! `i * BPB + j`; bit 0 of page 0 is never handed out.

use super::*;
use buf::BufId;
use fs::FileSystem;

use log::{trace, warn};

/// Offset of the first clear bit in a page.
fn find_first_zero(data: &[u8; BSIZE]) -> Option<usize> {
    let byte = data.iter().position(|&b| b != 0xff)?;
    Some(byte * 8 + data[byte].trailing_ones() as usize)
}

/// Sets bit `nr`, returning its old value.
fn set_bit(nr: usize, data: &mut [u8; BSIZE]) -> bool {
    let mask = 1 << (nr % 8);
    let old = data[nr / 8] & mask != 0;
    data[nr / 8] |= mask;
    old
}

/// Clears bit `nr`, returning its old value.
fn clear_bit(nr: usize, data: &mut [u8; BSIZE]) -> bool {
    let mask = 1 << (nr % 8);
    let old = data[nr / 8] & mask != 0;
    data[nr / 8] &= !mask;
    old
}

fn test_bit(nr: usize, data: &[u8; BSIZE]) -> bool {
    data[nr / 8] & (1 << (nr % 8)) != 0
}

impl FileSystem {
    /// Takes the first clear bit below `limit`, scanning the pages in order.
    fn alloc_bit(&self, pages: &[Option<BufId>], limit: usize) -> Option<usize> {
        for (i, page) in pages.iter().enumerate() {
            let Some(page) = *page else { continue };
            let found = self.bcache.try_with_mut(page, |data| {
                let j = find_first_zero(data)?;
                if set_bit(j, data) {
                    unreachable!("find_first_zero returned a set bit");
                }
                let nr = i * BPB + j;
                if nr >= limit {
                    // past the end of the filesystem, put it back
                    clear_bit(j, data);
                    return None;
                }
                Some(nr)
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Clears bit `nr`, returning whether it was set.
    fn free_bit(&self, pages: &[Option<BufId>], nr: usize, what: &str) -> bool {
        let page = pages
            .get(nr / BPB)
            .copied()
            .flatten()
            .unwrap_or_else(|| panic!("nonexistent {what} bitmap page for bit {nr}"));
        self.bcache.with_mut(page, |data| clear_bit(nr % BPB, data))
    }

    /// Allocates a zone on `dev` and returns its block number, bound in the
    /// cache, zeroed and dirty.
    pub fn new_block(&self, dev: Dev) -> Result<u32> {
        let sb = self.get_super(dev);
        let Some(bit) = self.alloc_bit(&sb.zmap, sb.zone_bits()) else {
            return Err(FsError::NoSpace { dev });
        };
        let block = (bit + sb.d.firstdatazone as usize - 1) as u32;
        let mut bh = match self.bcache.getblk(dev, block) {
            Ok(bh) => bh,
            Err(e) => {
                self.free_bit(&sb.zmap, bit, "zone");
                return Err(e);
            }
        };
        if bh.count() != 1 {
            drop(bh);
            panic!("new block: count is != 1");
        }
        bh.with_mut(|data| data.fill(0));
        bh.set_uptodate();
        trace!("new_block {dev:#06x}:{block}");
        Ok(block)
    }

    /// Returns a data zone to the bitmap. Freeing a block outside the data
    /// area, or one that is already free, is fatal.
    pub fn free_block(&self, dev: Dev, block: u32) {
        let sb = self.get_super(dev);
        if block < sb.d.firstdatazone as u32 || block >= sb.d.nzones as u32 {
            panic!("trying to free block not in datazone");
        }
        if let Some(bh) = self.bcache.lookup(dev, block) {
            if bh.count() != 1 {
                warn!(
                    "trying to free block ({dev:#06x}:{block}), count={}",
                    bh.count() - 1
                );
                return;
            }
            bh.invalidate();
        }
        let bit = block as usize - (sb.d.firstdatazone as usize - 1);
        if !self.free_bit(&sb.zmap, bit, "zone") {
            panic!("free_block: bit already cleared ({dev:#06x}:{block})");
        }
        trace!("free_block {dev:#06x}:{block}");
    }

    /// Takes an inode number from the bitmap of `dev`.
    pub(crate) fn alloc_inode_bit(&self, dev: Dev) -> Option<u32> {
        let sb = self.get_super(dev);
        let nr = self.alloc_bit(&sb.imap, sb.inode_bits())? as u32;
        trace!("new inode {dev:#06x}:{nr}");
        Some(nr)
    }

    pub(crate) fn free_inode_bit(&self, dev: Dev, num: u32) {
        let sb = self.get_super(dev);
        if num < 1 || num > sb.d.ninodes as u32 {
            panic!("trying to free inode 0 or nonexistant inode");
        }
        if !self.free_bit(&sb.imap, num as usize, "inode") {
            panic!("free_inode: bit already cleared");
        }
        trace!("free inode {dev:#06x}:{num}");
    }

    /// Free zones and free inodes on `dev`, within the declared counts.
    pub fn count_free(&self, dev: Dev) -> (usize, usize) {
        let sb = self.get_super(dev);
        let count = |pages: &[Option<BufId>], bits: usize| -> usize {
            pages
                .iter()
                .enumerate()
                .filter(|(i, _)| i * BPB < bits)
                .map(|(i, page)| match *page {
                    Some(page) => {
                        let valid = (bits - i * BPB).min(BPB);
                        self.bcache
                            .with(page, |data| (0..valid).filter(|&nr| !test_bit(nr, data)).count())
                    }
                    None => 0,
                })
                .sum()
        };
        (count(&sb.zmap, sb.zone_bits()), count(&sb.imap, sb.inode_bits()))
    }
}
