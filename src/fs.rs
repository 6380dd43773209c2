//! Superblocks, mounting, and the context object that owns every pool.

use super::*;
use blk_dev::DeviceTable;
use buf::{BufCache, BufId};
use inode::{DInode, InodeId, InodeTable};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Superblock as stored in block 1.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DSuperBlock {
    /// Number of inodes
    pub ninodes: u16,
    /// Size of the device in zones, including the metadata blocks
    pub nzones: u16,
    pub imap_blocks: u16,
    pub zmap_blocks: u16,
    /// Block number of the first data zone
    pub firstdatazone: u16,
    pub log_zone_size: u16,
    /// Largest file, in bytes
    pub max_size: u32,
    /// Must be SUPER_MAGIC
    pub magic: u16,
}

/// In-memory superblock of a mounted device.
#[derive(Clone, Copy, Debug)]
pub struct SuperBlock {
    pub dev: Dev,
    pub d: DSuperBlock,
    /// pinned inode bitmap pages
    pub imap: [Option<BufId>; I_MAP_SLOTS],
    /// pinned zone bitmap pages
    pub zmap: [Option<BufId>; Z_MAP_SLOTS],
    /// root inode of this filesystem, set for the root mount
    pub isup: Option<InodeId>,
    pub imount: Option<InodeId>,
}

impl SuperBlock {
    /// Block holding inode `num`.
    pub fn inode_block(&self, num: u32) -> u32 {
        2 + self.d.imap_blocks as u32
            + self.d.zmap_blocks as u32
            + (num - 1) / INODES_PER_BLOCK as u32
    }

    /// Byte offset of inode `num` inside its block.
    pub fn inode_offset(&self, num: u32) -> usize {
        (num as usize - 1) % INODES_PER_BLOCK * DINODE_SIZE
    }

    /// Valid bits in the zone bitmap: bit 0 plus one per data zone.
    pub fn zone_bits(&self) -> usize {
        self.d.nzones as usize - self.d.firstdatazone as usize + 1
    }

    /// Valid bits in the inode bitmap: bit 0 plus one per inode.
    pub fn inode_bits(&self) -> usize {
        self.d.ninodes as usize + 1
    }
}

/// What `mount_root` hands back to the boot code.
#[derive(Clone, Copy, Debug)]
pub struct RootInfo {
    pub dev: Dev,
    pub root: InodeId,
    pub pwd: InodeId,
    pub free_blocks: usize,
    pub nzones: usize,
    pub free_inodes: usize,
    pub ninodes: usize,
}

pub struct FileSystem {
    config: FsConfig,
    pub(crate) bcache: BufCache,
    pub(crate) itable: InodeTable,
    supers: Mutex<[Option<SuperBlock>; NR_SUPER]>,
}

impl FileSystem {
    pub fn new(config: FsConfig) -> Self {
        debug!(
            "{} buffers, {} in-core inodes, root device {:#06x}",
            config.nr_buffers, config.nr_inodes, config.root_dev
        );
        FileSystem {
            bcache: BufCache::new(config.nr_buffers, DeviceTable::new()),
            itable: InodeTable::new(config.nr_inodes),
            supers: Mutex::new([None; NR_SUPER]),
            config,
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceTable {
        self.bcache.devices()
    }

    pub fn bcache(&self) -> &BufCache {
        &self.bcache
    }

    pub fn try_get_super(&self, dev: Dev) -> Option<SuperBlock> {
        self.supers
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|sb| sb.dev == dev)
            .copied()
    }

    /// Superblock of a mounted device; anything else is a kernel bug.
    pub fn get_super(&self, dev: Dev) -> SuperBlock {
        self.try_get_super(dev)
            .unwrap_or_else(|| panic!("trying to access nonexistent device {dev:#06x}"))
    }

    /// Reads the superblock and pins the bitmap pages of `dev`. On failure
    /// nothing stays pinned and the superblock table is untouched.
    pub fn mount(&self, dev: Dev) -> Result<()> {
        if self.try_get_super(dev).is_some() {
            return Err(FsError::AlreadyMounted(dev));
        }
        let d: DSuperBlock = {
            let bh = self.bcache.bread(dev, 1)?;
            bh.with(|data| bincode::deserialize(&data[..]))?
        };
        if d.magic != SUPER_MAGIC {
            return Err(FsError::BadMagic { dev, magic: d.magic });
        }
        let bad = |reason: &'static str| -> Result<()> {
            Err(FsError::InvalidSuperBlock { dev, reason })
        };
        if d.imap_blocks == 0 || d.imap_blocks as usize > I_MAP_SLOTS {
            return bad("inode bitmap size");
        }
        if d.zmap_blocks == 0 || d.zmap_blocks as usize > Z_MAP_SLOTS {
            return bad("zone bitmap size");
        }
        if d.ninodes == 0 || d.firstdatazone == 0 || d.firstdatazone >= d.nzones {
            return bad("geometry");
        }
        if (d.imap_blocks as usize) * BPB < d.ninodes as usize + 1 {
            return bad("inode bitmap too small");
        }
        if (d.zmap_blocks as usize) * BPB < (d.nzones - d.firstdatazone) as usize + 1 {
            return bad("zone bitmap too small");
        }
        let inode_blocks = (d.ninodes as usize).div_ceil(INODES_PER_BLOCK);
        if (d.firstdatazone as usize) < 2 + (d.imap_blocks + d.zmap_blocks) as usize + inode_blocks {
            return bad("data zones overlap the inode table");
        }

        // handles drop (and release) on any early return
        let mut block = 2;
        let mut imap = Vec::with_capacity(d.imap_blocks as usize);
        for _ in 0..d.imap_blocks {
            imap.push(self.read_bitmap(dev, block)?);
            block += 1;
        }
        let mut zmap = Vec::with_capacity(d.zmap_blocks as usize);
        for _ in 0..d.zmap_blocks {
            zmap.push(self.read_bitmap(dev, block)?);
            block += 1;
        }
        // the null inode and the null zone are always in use
        for page in [&imap[0], &zmap[0]] {
            self.bcache
                .try_with_mut(page.id(), |data| (data[0] & 1 == 0).then(|| data[0] |= 1));
        }

        let mut supers = self.supers.lock().unwrap();
        if supers.iter().flatten().any(|sb| sb.dev == dev) {
            return Err(FsError::AlreadyMounted(dev));
        }
        let Some(entry) = supers.iter_mut().find(|sb| sb.is_none()) else {
            return Err(FsError::NoSuperSlot);
        };
        let mut sb = SuperBlock {
            dev,
            d,
            imap: [None; I_MAP_SLOTS],
            zmap: [None; Z_MAP_SLOTS],
            isup: None,
            imount: None,
        };
        for (page, bh) in sb.imap.iter_mut().zip(imap) {
            *page = Some(bh.pin());
        }
        for (page, bh) in sb.zmap.iter_mut().zip(zmap) {
            *page = Some(bh.pin());
        }
        *entry = Some(sb);
        info!(
            "mounted {dev:#06x}: {} inodes, {} zones, first data zone {}",
            d.ninodes, d.nzones, d.firstdatazone
        );
        Ok(())
    }

    fn read_bitmap(&self, dev: Dev, block: u32) -> Result<buf::Buffer<'_>> {
        self.bcache.bread(dev, block).map_err(|e| {
            warn!("mount {dev:#06x}: bitmap block {block} unreadable");
            e
        })
    }

    /// Mounts the root device and loads its root inode.
    pub fn mount_root(&self) -> Result<RootInfo> {
        if DInode::disk_size() != DINODE_SIZE {
            panic!("bad i-node size");
        }
        let dev = self.config.root_dev;
        self.mount(dev)?;
        let root = match self.iget(dev, ROOT_INO) {
            Ok(root) => root,
            Err(e) => {
                self.umount(dev)?;
                return Err(e);
            }
        };
        let root = root.pin();
        // logically used 4 times: isup, imount, root and pwd
        self.add_inode_refs(root, 3);
        {
            let mut supers = self.supers.lock().unwrap();
            if let Some(sb) = supers.iter_mut().flatten().find(|sb| sb.dev == dev) {
                sb.isup = Some(root);
                sb.imount = Some(root);
            }
        }

        let sb = self.get_super(dev);
        let (free_blocks, free_inodes) = self.count_free(dev);
        info!("{}/{} free blocks", free_blocks, sb.d.nzones);
        info!("{}/{} free inodes", free_inodes, sb.d.ninodes);
        Ok(RootInfo {
            dev,
            root,
            pwd: root,
            free_blocks,
            nzones: sb.d.nzones as usize,
            free_inodes,
            ninodes: sb.d.ninodes as usize,
        })
    }

    /// Writes everything back and releases the bitmap pages of `dev`.
    pub fn umount(&self, dev: Dev) -> Result<()> {
        let sb = self.try_get_super(dev).ok_or(FsError::NotMounted(dev))?;
        if sb.isup.is_some() {
            return Err(FsError::Busy(dev));
        }
        let in_use = self.inodes_in_use(dev);
        if in_use > 0 {
            warn!("umount {dev:#06x}: {in_use} inodes in use");
            return Err(FsError::Busy(dev));
        }
        self.sync_inodes()?;
        self.bcache.sync_dev(dev)?;

        {
            let mut supers = self.supers.lock().unwrap();
            for entry in supers.iter_mut() {
                if entry.is_some_and(|s| s.dev == dev) {
                    *entry = None;
                }
            }
        }
        for id in sb.imap.iter().chain(sb.zmap.iter()).flatten() {
            self.bcache.brelse(*id);
        }
        self.forget_inodes(dev);
        self.bcache.invalidate_dev(dev);
        info!("unmounted {dev:#06x}");
        Ok(())
    }

    /// Writes back every dirty inode and buffer.
    pub fn sync_all(&self) -> Result<()> {
        let inodes = self.sync_inodes();
        let buffers = self.bcache.sync_all();
        inodes.and(buffers)
    }

    /// Syncs and tears the pools down.
    pub fn shutdown(self) -> Result<()> {
        self.sync_all()?;
        debug!("shutdown: {:?}", self.bcache.stats());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blk_dev::{BlockDevice, MemDisk};
    use crate::mkfs::{self, MkfsOptions};
    use crate::testutil::{self, FaultyDisk, TEST_DEV};
    use std::sync::Arc;

    fn formatted(ninodes: u16, nzones: u16, root: bool) -> Arc<MemDisk> {
        testutil::init_log();
        let disk = Arc::new(MemDisk::new(nzones as usize));
        mkfs::mkfs(disk.as_ref(), &MkfsOptions { ninodes, nzones, root }).unwrap();
        disk
    }

    fn fs_with(disk: Arc<dyn BlockDevice>) -> FileSystem {
        let fs = FileSystem::new(FsConfig {
            nr_buffers: 16,
            ..FsConfig::default()
        });
        fs.devices().register(major(TEST_DEV), disk);
        fs
    }

    #[test]
    fn superblock_record_is_packed() {
        let sb = DSuperBlock {
            ninodes: 0x0102,
            magic: SUPER_MAGIC,
            ..Default::default()
        };
        let bytes = bincode::serialize(&sb).unwrap();
        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(&bytes[16..], &SUPER_MAGIC.to_le_bytes());
    }

    #[test]
    fn mount_pins_bitmaps() {
        let fs = fs_with(formatted(64, 256, false));
        fs.mount(TEST_DEV).unwrap();
        let sb = fs.get_super(TEST_DEV);
        assert_eq!(sb.imap.iter().flatten().count(), 1);
        assert_eq!(sb.zmap.iter().flatten().count(), 1);
        assert_eq!(fs.bcache().stats().referenced, 2);
        assert!(matches!(fs.mount(TEST_DEV), Err(FsError::AlreadyMounted(TEST_DEV))));
    }

    #[test]
    fn bad_magic_leaves_nothing_behind() {
        let disk = formatted(64, 256, false);
        let mut block = [0u8; BSIZE];
        disk.read_block(1, &mut block).unwrap();
        block[16] ^= 0xff;
        disk.write_block(1, &block).unwrap();

        let fs = fs_with(disk);
        match fs.mount(TEST_DEV) {
            Err(FsError::BadMagic { dev, .. }) => assert_eq!(dev, TEST_DEV),
            other => panic!("unexpected {other:?}"),
        }
        assert!(fs.try_get_super(TEST_DEV).is_none());
        assert_eq!(fs.bcache().stats().referenced, 0);
    }

    fn rewrite_super(disk: &MemDisk, f: impl FnOnce(&mut DSuperBlock)) {
        let mut block = [0u8; BSIZE];
        disk.read_block(1, &mut block).unwrap();
        let mut d: DSuperBlock = bincode::deserialize(&block).unwrap();
        f(&mut d);
        bincode::serialize_into(&mut block[..], &d).unwrap();
        disk.write_block(1, &block).unwrap();
    }

    #[test]
    fn inconsistent_superblock_is_rejected() {
        let cases: [(&str, fn(&mut DSuperBlock)); 3] = [
            ("inode bitmap too small", |d| d.ninodes = 9000),
            ("zone bitmap too small", |d| d.nzones = 9000),
            ("data zones overlap the inode table", |d| d.firstdatazone = 4),
        ];
        for (reason, corrupt) in cases {
            let disk = formatted(64, 256, false);
            rewrite_super(&disk, corrupt);
            let fs = fs_with(disk);
            match fs.mount(TEST_DEV) {
                Err(FsError::InvalidSuperBlock { reason: r, .. }) => assert_eq!(r, reason),
                other => panic!("{reason}: unexpected {other:?}"),
            }
            assert!(fs.try_get_super(TEST_DEV).is_none());
            assert_eq!(fs.bcache().stats().referenced, 0);
        }
    }

    #[test]
    fn unreadable_bitmap_unpins_what_was_read() {
        let faulty = Arc::new(FaultyDisk::new(1024));
        let opts = MkfsOptions {
            ninodes: 16384,
            nzones: 1024,
            root: false,
        };
        mkfs::mkfs(faulty.as_ref(), &opts).unwrap();
        // inode bitmap is blocks 2..5, the zone bitmap follows
        faulty.fail(4);

        let fs = fs_with(faulty);
        assert!(matches!(fs.mount(TEST_DEV), Err(FsError::Io { block: 4, .. })));
        assert!(fs.try_get_super(TEST_DEV).is_none());
        assert_eq!(fs.bcache().stats().referenced, 0);
    }

    #[test]
    fn mount_root_counts_free_space() {
        let fs = fs_with(formatted(64, 256, true));
        let info = fs.mount_root().unwrap();
        assert_eq!(info.root, info.pwd);
        assert_eq!(info.ninodes, 64);
        // root took one inode and one zone
        assert_eq!(info.free_inodes, 63);
        let sb = fs.get_super(TEST_DEV);
        assert_eq!(info.free_blocks, sb.zone_bits() - 2);
        assert_eq!(sb.isup, Some(info.root));

        let root = fs.dup_inode(info.root);
        assert_eq!(root.info().disk.mode & S_IFMT, S_IFDIR);
        assert_eq!(root.info().count, 5);
        assert!(matches!(fs.umount(TEST_DEV), Err(FsError::Busy(_))));
    }

    #[test]
    fn umount_releases_everything() {
        let fs = fs_with(formatted(64, 256, false));
        fs.mount(TEST_DEV).unwrap();
        let inode = fs.new_inode(TEST_DEV).unwrap();
        assert!(matches!(fs.umount(TEST_DEV), Err(FsError::Busy(_))));
        inode.update(|d| d.mode = S_IFREG | 0o644);
        drop(inode);

        fs.umount(TEST_DEV).unwrap();
        assert!(fs.try_get_super(TEST_DEV).is_none());
        let stats = fs.bcache().stats();
        assert_eq!(stats.referenced, 0);
        assert_eq!(stats.bound, 0);

        // the allocation made it to disk
        fs.mount(TEST_DEV).unwrap();
        assert!(testutil::bit(&fs, 2, 1));
        let back = fs.iget(TEST_DEV, 1).unwrap();
        assert_eq!(back.info().disk.mode, S_IFREG | 0o644);
        assert!(matches!(fs.umount(0x302), Err(FsError::NotMounted(0x302))));
    }

    #[test]
    #[should_panic(expected = "nonexistent device")]
    fn unmounted_device_is_fatal() {
        let fs = fs_with(formatted(64, 256, false));
        let _ = fs.new_block(TEST_DEV);
    }
}
