//! Formatter.

use super::*;
use blk_dev::BlockDevice;
use fs::DSuperBlock;
use inode::DInode;

use log::info;
use serde::Serialize;

pub struct MkfsOptions {
    pub ninodes: u16,
    /// device size in blocks
    pub nzones: u16,
    /// create inode 1 as an empty directory
    pub root: bool,
}

#[derive(Serialize)]
struct DirEntry {
    inode: u16,
    name: [u8; DIRSIZ],
}

impl DirEntry {
    fn new(inode: u16, name: &str) -> Self {
        let mut entry = DirEntry {
            inode,
            name: [0; DIRSIZ],
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Superblock for the requested geometry.
pub fn layout(opts: &MkfsOptions) -> Result<DSuperBlock> {
    let ninodes = opts.ninodes as usize;
    let nzones = opts.nzones as usize;
    if ninodes == 0 {
        return Err(FsError::Geometry("no inodes".into()));
    }
    let imap_blocks = div_ceil(ninodes + 1, BPB);
    if imap_blocks > I_MAP_SLOTS {
        return Err(FsError::Geometry(format!("{imap_blocks} inode bitmap blocks")));
    }
    let inode_blocks = div_ceil(ninodes, INODES_PER_BLOCK);
    let mut zmap_blocks = 1;
    let firstdatazone = loop {
        let first = 2 + imap_blocks + zmap_blocks + inode_blocks;
        if first >= nzones {
            return Err(FsError::Geometry(format!(
                "{nzones} blocks leave no room for data after block {first}"
            )));
        }
        if zmap_blocks * BPB >= nzones - first + 1 {
            break first;
        }
        zmap_blocks += 1;
    };
    if zmap_blocks > Z_MAP_SLOTS {
        return Err(FsError::Geometry(format!("{zmap_blocks} zone bitmap blocks")));
    }
    Ok(DSuperBlock {
        ninodes: opts.ninodes,
        nzones: opts.nzones,
        imap_blocks: imap_blocks as u16,
        zmap_blocks: zmap_blocks as u16,
        firstdatazone: firstdatazone as u16,
        log_zone_size: 0,
        max_size: (MAX_FILE_BLOCKS * BSIZE) as u32,
        magic: SUPER_MAGIC,
    })
}

/// Bitmap pages with bit 0, the `used` bits after it, and everything past
/// `bits` set.
fn bitmap(blocks: usize, bits: usize, used: usize) -> Vec<[u8; BSIZE]> {
    let mut pages = vec![[0u8; BSIZE]; blocks];
    let set = |nr: usize, pages: &mut Vec<[u8; BSIZE]>| {
        pages[nr / BPB][nr % BPB / 8] |= 1 << (nr % 8);
    };
    for nr in (0..=used).chain(bits..blocks * BPB) {
        set(nr, &mut pages);
    }
    pages
}

/// Writes an empty filesystem onto `dev`.
pub fn mkfs(dev: &dyn BlockDevice, opts: &MkfsOptions) -> Result<DSuperBlock> {
    let sb = layout(opts)?;
    let zero = [0u8; BSIZE];
    // fails early on a device that is too small
    dev.write_block(sb.nzones as usize - 1, &zero)?;

    let mut block = [0u8; BSIZE];
    dev.write_block(0, &zero)?;
    bincode::serialize_into(&mut block[..], &sb)?;
    dev.write_block(1, &block)?;

    let used = opts.root as usize;
    let imap = bitmap(sb.imap_blocks as usize, sb.ninodes as usize + 1, used);
    let zone_bits = (sb.nzones - sb.firstdatazone) as usize + 1;
    let zmap = bitmap(sb.zmap_blocks as usize, zone_bits, used);
    let mut nr = 2;
    for page in imap.iter().chain(zmap.iter()) {
        dev.write_block(nr, page)?;
        nr += 1;
    }
    while nr < sb.firstdatazone as usize {
        dev.write_block(nr, &zero)?;
        nr += 1;
    }

    if opts.root {
        let (uid, gid) = current_owner();
        let root = DInode {
            mode: S_IFDIR | 0o755,
            uid,
            size: 2 * (2 + DIRSIZ) as u32,
            mtime: current_time(),
            gid,
            nlinks: 2,
            zone: [sb.firstdatazone, 0, 0, 0, 0, 0, 0, 0, 0],
        };
        let first_inode_block = 2 + sb.imap_blocks as usize + sb.zmap_blocks as usize;
        block.fill(0);
        bincode::serialize_into(&mut block[..DINODE_SIZE], &root)?;
        dev.write_block(first_inode_block, &block)?;

        block.fill(0);
        let entries = [DirEntry::new(ROOT_INO as u16, "."), DirEntry::new(ROOT_INO as u16, "..")];
        bincode::serialize_into(&mut block[..], &entries)?;
        dev.write_block(sb.firstdatazone as usize, &block)?;
    }

    info!(
        "mkfs: {} inodes, {} zones, first data zone {}, {} + {} bitmap blocks",
        sb.ninodes, sb.nzones, sb.firstdatazone, sb.imap_blocks, sb.zmap_blocks
    );
    Ok(sb)
}
