//! In-core inodes.
//!
//! A fixed table of inode slots. A slot with `dev == 0` is free; a slot with
//! `count == 0` but a device still caches that inode and is recycled when
//! nothing else is free. The `lock` flag is held while a slot is being read
//! from or written to disk, and while blocks are being added to the file.

use super::*;
use fs::FileSystem;

use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard};

/// inode on disk
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DInode {
    /// File type and permissions
    pub mode: u16,
    pub uid: u16,
    /// Size of file (bytes)
    pub size: u32,
    pub mtime: u32,
    pub gid: u8,
    /// Number of links to inode in file system
    pub nlinks: u8,
    /// 7 direct zones, one indirect, one double indirect
    pub zone: [u16; 9],
}

impl DInode {
    /// Encoded size, must equal DINODE_SIZE.
    pub fn disk_size() -> usize {
        bincode::serialized_size(&DInode::default()).map_or(0, |n| n as usize)
    }
}

/// inode in memory
#[derive(Default)]
pub(crate) struct MInode {
    /// copy of disk inode
    d: DInode,
    dev: Dev,
    num: u32,
    count: u32,
    lock: bool,
    dirty: bool,
    /// lives only in memory, backed by `pipe_page`
    pipe: bool,
    atime: u32,
    ctime: u32,
    pipe_page: Option<Box<[u8; PAGE_SIZE]>>,
}

/// Snapshot of an in-core inode.
#[derive(Clone, Copy, Debug)]
pub struct InodeInfo {
    pub dev: Dev,
    pub num: u32,
    pub count: u32,
    pub dirty: bool,
    pub pipe: bool,
    pub atime: u32,
    pub ctime: u32,
    pub disk: DInode,
}

impl From<&MInode> for InodeInfo {
    fn from(m: &MInode) -> Self {
        InodeInfo {
            dev: m.dev,
            num: m.num,
            count: m.count,
            dirty: m.dirty,
            pipe: m.pipe,
            atime: m.atime,
            ctime: m.ctime,
            disk: m.d,
        }
    }
}

/// Slot index in the inode table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeId(usize);

pub(crate) struct InodePool {
    inodes: Vec<MInode>,
    last_allocated: usize,
}

pub(crate) struct InodeTable {
    pool: Mutex<InodePool>,
    wait: Condvar,
}

impl InodeTable {
    pub(crate) fn new(nr_inodes: usize) -> Self {
        assert!(nr_inodes > 0, "empty inode table");
        InodeTable {
            pool: Mutex::new(InodePool {
                inodes: (0..nr_inodes).map(|_| MInode::default()).collect(),
                last_allocated: 0,
            }),
            wait: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InodePool> {
        self.pool.lock().unwrap()
    }
}

fn zone_entry(data: &[u8; BSIZE], k: usize) -> u16 {
    u16::from_le_bytes([data[2 * k], data[2 * k + 1]])
}

fn set_zone_entry(data: &mut [u8; BSIZE], k: usize, zone: u16) {
    data[2 * k..2 * k + 2].copy_from_slice(&zone.to_le_bytes());
}

impl FileSystem {
    fn wait_on_inode<'g>(
        &'g self,
        mut pool: MutexGuard<'g, InodePool>,
        i: usize,
    ) -> MutexGuard<'g, InodePool> {
        while pool.inodes[i].lock {
            pool = self.itable.wait.wait(pool).unwrap();
        }
        pool
    }

    fn lock_inode(&self, i: usize) {
        let pool = self.itable.lock();
        let mut pool = self.wait_on_inode(pool, i);
        pool.inodes[i].lock = true;
    }

    fn unlock_inode(&self, i: usize) {
        self.itable.lock().inodes[i].lock = false;
        self.itable.wait.notify_all();
    }

    /// Loads the disk copy into slot `i`; the caller holds the slot lock.
    fn read_inode(&self, i: usize) -> Result<()> {
        let (dev, num) = {
            let pool = self.itable.lock();
            (pool.inodes[i].dev, pool.inodes[i].num)
        };
        let sb = self.get_super(dev);
        if num == 0 || num > sb.d.ninodes as u32 {
            panic!("bad inode number {dev:#06x}:{num}");
        }
        let block = sb.inode_block(num);
        let off = sb.inode_offset(num);
        let d: DInode = {
            let bh = self.bcache.bread(dev, block)?;
            bh.with(|data| bincode::deserialize(&data[off..off + DINODE_SIZE]))?
        };
        let mut pool = self.itable.lock();
        let m = &mut pool.inodes[i];
        m.d = d;
        m.atime = d.mtime;
        m.ctime = d.mtime;
        debug!("read inode {dev:#06x}:{num} from block {block}");
        Ok(())
    }

    /// Copies slot `i` into its buffer. The buffer is written back later.
    fn write_inode(&self, i: usize) -> Result<()> {
        self.lock_inode(i);
        let res = self.write_inode_locked(i);
        self.unlock_inode(i);
        res
    }

    fn write_inode_locked(&self, i: usize) -> Result<()> {
        let (dev, num, d) = {
            let mut pool = self.itable.lock();
            let m = &mut pool.inodes[i];
            if m.dev == 0 {
                m.dirty = false;
                return Ok(());
            }
            m.dirty = false;
            (m.dev, m.num, m.d)
        };
        let sb = self.get_super(dev);
        let block = sb.inode_block(num);
        let off = sb.inode_offset(num);
        let res = self.bcache.bread(dev, block).and_then(|mut bh| {
            bh.with_mut(|data| bincode::serialize_into(&mut data[off..off + DINODE_SIZE], &d))?;
            Ok(())
        });
        match &res {
            Ok(()) => debug!("wrote inode {dev:#06x}:{num} to block {block}"),
            Err(_) => self.itable.lock().inodes[i].dirty = true,
        }
        res
    }

    /// Copies every dirty inode into the buffer cache.
    pub fn sync_inodes(&self) -> Result<()> {
        let mut first_err = None;
        let n = self.itable.lock().inodes.len();
        for i in 0..n {
            let needs_write = {
                let pool = self.wait_on_inode(self.itable.lock(), i);
                let m = &pool.inodes[i];
                m.dirty && !m.pipe && m.dev != 0
            };
            if needs_write {
                if let Err(e) = self.write_inode(i) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Claims an unreferenced slot, cleared and with one reference. A free
    /// clean slot is taken first; otherwise the last idle cached inode in
    /// ring order is recycled. Running out of slots is fatal.
    fn get_empty_inode(&self) -> Result<usize> {
        loop {
            let mut pool = self.itable.lock();
            let n = pool.inodes.len();
            let start = pool.last_allocated;
            let mut found = None;
            for i in (1..=n).map(|k| (start + k) % n) {
                let m = &pool.inodes[i];
                if m.count != 0 {
                    continue;
                }
                found = Some(i);
                if m.dev == 0 && !m.dirty {
                    break;
                }
            }
            let Some(i) = found else {
                let table: Vec<String> = pool
                    .inodes
                    .iter()
                    .map(|m| format!("{:04x}: {:6}", m.dev, m.num))
                    .collect();
                drop(pool);
                error!("inode table: {}", table.join("\t"));
                panic!("No free inodes in mem");
            };
            pool.last_allocated = i;
            pool = self.wait_on_inode(pool, i);
            while pool.inodes[i].dirty {
                drop(pool);
                self.write_inode(i)?;
                pool = self.wait_on_inode(self.itable.lock(), i);
            }
            if pool.inodes[i].count == 0 {
                pool.inodes[i] = MInode {
                    count: 1,
                    ..MInode::default()
                };
                return Ok(i);
            }
        }
    }

    /// Returns the in-core inode `nr` of `dev`, reading it if necessary.
    pub fn iget(&self, dev: Dev, nr: u32) -> Result<Inode<'_>> {
        if dev == 0 {
            panic!("iget with dev==0");
        }
        let empty = self.get_empty_inode()?;
        let mut pool = self.itable.lock();
        let mut k = 0;
        while k < pool.inodes.len() {
            if pool.inodes[k].dev != dev || pool.inodes[k].num != nr {
                k += 1;
                continue;
            }
            pool = self.wait_on_inode(pool, k);
            if pool.inodes[k].dev != dev || pool.inodes[k].num != nr {
                k = 0;
                continue;
            }
            pool.inodes[k].count += 1;
            // hand back the spare slot
            pool.inodes[empty].count -= 1;
            trace!("iget {dev:#06x}:{nr} hit slot {k}");
            return Ok(Inode::new(self, k));
        }

        let m = &mut pool.inodes[empty];
        m.dev = dev;
        m.num = nr;
        m.lock = true;
        drop(pool);
        match self.read_inode(empty) {
            Ok(()) => {
                self.unlock_inode(empty);
                Ok(Inode::new(self, empty))
            }
            Err(e) => {
                self.itable.lock().inodes[empty] = MInode::default();
                self.itable.wait.notify_all();
                Err(e)
            }
        }
    }

    /// Drops one reference to slot `i`. The last reference to an unlinked
    /// inode frees its blocks and its inode number.
    pub(crate) fn iput(&self, i: usize) -> Result<()> {
        let mut pool = self.wait_on_inode(self.itable.lock(), i);
        if pool.inodes[i].count == 0 {
            drop(pool);
            panic!("iput: trying to free free inode");
        }
        if pool.inodes[i].pipe {
            let m = &mut pool.inodes[i];
            m.count -= 1;
            if m.count == 0 {
                m.pipe_page = None;
                m.dirty = false;
                m.pipe = false;
                trace!("released pipe inode in slot {i}");
            }
            return Ok(());
        }
        if pool.inodes[i].dev == 0 || pool.inodes[i].count > 1 {
            pool.inodes[i].count -= 1;
            return Ok(());
        }
        loop {
            if pool.inodes[i].d.nlinks == 0 {
                drop(pool);
                self.truncate(i);
                self.free_inode_slot(i);
                return Ok(());
            }
            if pool.inodes[i].dirty {
                drop(pool);
                if let Err(e) = self.write_inode(i) {
                    self.itable.lock().inodes[i].count -= 1;
                    return Err(e);
                }
                // we slept, look again
                pool = self.wait_on_inode(self.itable.lock(), i);
                continue;
            }
            pool.inodes[i].count -= 1;
            return Ok(());
        }
    }

    /// Allocates a fresh inode on `dev` with one link and one reference.
    pub fn new_inode(&self, dev: Dev) -> Result<Inode<'_>> {
        let i = self.get_empty_inode()?;
        let Some(num) = self.alloc_inode_bit(dev) else {
            self.iput(i)?;
            return Err(FsError::NoInodes { dev });
        };
        let now = current_time();
        let (uid, gid) = current_owner();
        let mut pool = self.itable.lock();
        // an idle slot may still cache the previous owner of this number
        for (k, m) in pool.inodes.iter_mut().enumerate() {
            if k != i && m.dev == dev && m.num == num {
                if m.count == 0 && !m.lock {
                    *m = MInode::default();
                } else {
                    warn!("new_inode: {dev:#06x}:{num} still referenced in slot {k}");
                }
            }
        }
        let m = &mut pool.inodes[i];
        m.dev = dev;
        m.num = num;
        m.d.nlinks = 1;
        m.d.uid = uid;
        m.d.gid = gid;
        m.d.mtime = now;
        m.atime = now;
        m.ctime = now;
        m.dirty = true;
        debug!("new inode {dev:#06x}:{num} in slot {i}");
        Ok(Inode::new(self, i))
    }

    /// Releases the inode number of a handle whose links are gone. Other
    /// references or remaining links are fatal.
    pub fn free_inode(&self, inode: Inode<'_>) {
        let id = inode.pin();
        self.free_inode_slot(id.0);
    }

    fn free_inode_slot(&self, i: usize) {
        let (dev, num, count, nlinks) = {
            let pool = self.itable.lock();
            let m = &pool.inodes[i];
            (m.dev, m.num, m.count, m.d.nlinks)
        };
        if dev != 0 {
            if count > 1 {
                panic!("trying to free inode with count={count}");
            }
            if nlinks != 0 {
                panic!("trying to free inode with links");
            }
            self.free_inode_bit(dev, num);
        }
        self.itable.lock().inodes[i] = MInode::default();
        self.itable.wait.notify_all();
    }

    /// An in-memory inode with a zeroed page, referenced by a reader and
    /// a writer handle.
    pub fn get_pipe_inode(&self) -> Result<(Inode<'_>, Inode<'_>)> {
        let i = self.get_empty_inode()?;
        let mut pool = self.itable.lock();
        let m = &mut pool.inodes[i];
        m.pipe_page = Some(Box::new([0; PAGE_SIZE]));
        m.count = 2; // sum of readers/writers
        m.pipe = true;
        drop(pool);
        Ok((Inode::new(self, i), Inode::new(self, i)))
    }

    /// Another handle on a pinned inode.
    pub fn dup_inode(&self, id: InodeId) -> Inode<'_> {
        self.add_inode_refs(id, 1);
        Inode::new(self, id.0)
    }

    pub(crate) fn add_inode_refs(&self, id: InodeId, n: u32) {
        let mut pool = self.itable.lock();
        if pool.inodes[id.0].count == 0 {
            drop(pool);
            panic!("dup of free inode");
        }
        pool.inodes[id.0].count += n;
    }

    pub(crate) fn inodes_in_use(&self, dev: Dev) -> usize {
        let pool = self.itable.lock();
        pool.inodes
            .iter()
            .filter(|m| m.dev == dev && m.count > 0)
            .count()
    }

    /// Drops idle cached inodes of an unmounted device.
    pub(crate) fn forget_inodes(&self, dev: Dev) {
        let mut pool = self.itable.lock();
        for m in pool.inodes.iter_mut().filter(|m| m.dev == dev && m.count == 0) {
            if m.dirty {
                warn!("dropping dirty inode {dev:#06x}:{}", m.num);
            }
            *m = MInode::default();
        }
    }

    /// Frees every data zone of slot `i` and empties the file.
    pub(crate) fn truncate(&self, i: usize) {
        let (dev, mode, zones) = {
            let pool = self.itable.lock();
            let m = &pool.inodes[i];
            (m.dev, m.d.mode, m.d.zone)
        };
        // device inodes keep their device number in zone[0]
        if matches!(mode & S_IFMT, S_IFCHR | S_IFBLK) {
            return;
        }
        for &z in zones[..NDIRECT].iter().filter(|&&z| z != 0) {
            self.free_block(dev, z as u32);
        }
        if zones[NDIRECT] != 0 {
            self.free_ind(dev, zones[NDIRECT]);
        }
        if zones[NDIRECT + 1] != 0 {
            self.free_dind(dev, zones[NDIRECT + 1]);
        }
        let now = current_time();
        let mut pool = self.itable.lock();
        let m = &mut pool.inodes[i];
        m.d.zone = [0; 9];
        m.d.size = 0;
        m.d.mtime = now;
        m.ctime = now;
        m.dirty = true;
    }

    fn indirect_entries(&self, dev: Dev, block: u16) -> Vec<u16> {
        match self.bcache.bread(dev, block as u32) {
            Ok(bh) => bh.with(|data| {
                (0..NINDIRECT)
                    .map(|k| zone_entry(data, k))
                    .filter(|&z| z != 0)
                    .collect()
            }),
            Err(e) => {
                warn!("truncate: leaking zones behind {dev:#06x}:{block}: {e}");
                Vec::new()
            }
        }
    }

    fn free_ind(&self, dev: Dev, block: u16) {
        for z in self.indirect_entries(dev, block) {
            self.free_block(dev, z as u32);
        }
        self.free_block(dev, block as u32);
    }

    fn free_dind(&self, dev: Dev, block: u16) {
        for z in self.indirect_entries(dev, block) {
            self.free_ind(dev, z);
        }
        self.free_block(dev, block as u32);
    }

    /// Maps logical block `block` of slot `i` to a zone, allocating missing
    /// zones along the way when `create` is set. 0 means a hole, or that an
    /// allocation failed.
    fn bmap(&self, i: usize, block: usize, create: bool) -> u16 {
        if block >= MAX_FILE_BLOCKS {
            panic!("_bmap: block>big");
        }
        if block < NDIRECT {
            return self.bmap_zone(i, block, create);
        }
        let block = block - NDIRECT;
        let dev = self.itable.lock().inodes[i].dev;
        if block < NINDIRECT {
            let ind = self.bmap_zone(i, NDIRECT, create);
            if ind == 0 {
                return 0;
            }
            return self.bmap_entry(dev, ind, block, create);
        }
        let block = block - NINDIRECT;
        let dind = self.bmap_zone(i, NDIRECT + 1, create);
        if dind == 0 {
            return 0;
        }
        let ind = self.bmap_entry(dev, dind, block / NINDIRECT, create);
        if ind == 0 {
            return 0;
        }
        self.bmap_entry(dev, ind, block % NINDIRECT, create)
    }

    fn bmap_zone(&self, i: usize, slot: usize, create: bool) -> u16 {
        let (dev, zone) = {
            let pool = self.itable.lock();
            (pool.inodes[i].dev, pool.inodes[i].d.zone[slot])
        };
        if zone != 0 || !create {
            return zone;
        }
        match self.new_block(dev) {
            Ok(nr) => {
                let mut pool = self.itable.lock();
                let m = &mut pool.inodes[i];
                m.d.zone[slot] = nr as u16;
                m.ctime = current_time();
                m.dirty = true;
                nr as u16
            }
            Err(e) => {
                debug!("bmap: {e}");
                0
            }
        }
    }

    fn bmap_entry(&self, dev: Dev, table: u16, k: usize, create: bool) -> u16 {
        let mut bh = match self.bcache.bread(dev, table as u32) {
            Ok(bh) => bh,
            Err(e) => {
                warn!("bmap: {e}");
                return 0;
            }
        };
        let zone = bh.with(|data| zone_entry(data, k));
        if zone != 0 || !create {
            return zone;
        }
        match self.new_block(dev) {
            Ok(nr) => {
                bh.with_mut(|data| set_zone_entry(data, k, nr as u16));
                nr as u16
            }
            Err(e) => {
                debug!("bmap: {e}");
                0
            }
        }
    }

    /// `bmap` on a handle; allocation runs with the inode locked.
    pub fn translate(&self, inode: &Inode<'_>, block: usize, create: bool) -> u32 {
        let i = inode.id.0;
        if !create {
            return self.bmap(i, block, false) as u32;
        }
        self.lock_inode(i);
        let zone = self.bmap(i, block, true);
        self.unlock_inode(i);
        zone as u32
    }
}

/// One counted reference to an in-core inode; dropping it calls `iput`.
pub struct Inode<'a> {
    fs: &'a FileSystem,
    id: InodeId,
}

impl<'a> Inode<'a> {
    fn new(fs: &'a FileSystem, i: usize) -> Self {
        Inode { fs, id: InodeId(i) }
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn num(&self) -> u32 {
        self.fs.itable.lock().inodes[self.id.0].num
    }

    pub fn info(&self) -> InodeInfo {
        InodeInfo::from(&self.fs.itable.lock().inodes[self.id.0])
    }

    /// Edits the disk fields; the inode becomes dirty.
    pub fn update<V>(&self, f: impl FnOnce(&mut DInode) -> V) -> V {
        let mut pool = self.fs.itable.lock();
        let m = &mut pool.inodes[self.id.0];
        m.dirty = true;
        m.ctime = current_time();
        f(&mut m.d)
    }

    pub fn translate(&self, block: usize, create: bool) -> u32 {
        self.fs.translate(self, block, create)
    }

    pub fn truncate(&self) {
        self.fs.lock_inode(self.id.0);
        self.fs.truncate(self.id.0);
        self.fs.unlock_inode(self.id.0);
    }

    /// The backing page of a pipe inode.
    pub fn with_pipe_page<V>(&self, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> V) -> Option<V> {
        let mut pool = self.fs.itable.lock();
        pool.inodes[self.id.0].pipe_page.as_deref_mut().map(f)
    }

    /// `iput`, reporting a failed write-back.
    pub fn put(self) -> Result<()> {
        let fs = self.fs;
        let id = self.pin();
        fs.iput(id.0)
    }

    /// Keeps the reference past this handle; see `FileSystem::dup_inode`.
    pub fn pin(self) -> InodeId {
        let id = self.id;
        mem::forget(self);
        id
    }
}

impl Drop for Inode<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.fs.iput(self.id.0) {
            error!("iput: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blk_dev::{BlockDevice, MemDisk};
    use crate::mkfs::{self, MkfsOptions};
    use crate::testutil::{self, FaultyDisk, TEST_DEV};
    use std::sync::Arc;
    use std::thread;

    fn disk_inode(fs: &FileSystem, disk: &MemDisk, num: u32) -> DInode {
        let sb = fs.get_super(TEST_DEV);
        let mut data = [0u8; BSIZE];
        disk.read_block(sb.inode_block(num) as usize, &mut data).unwrap();
        let off = sb.inode_offset(num);
        bincode::deserialize(&data[off..off + DINODE_SIZE]).unwrap()
    }

    fn indirect(fs: &FileSystem, block: u32, k: usize) -> u16 {
        fs.read_block(TEST_DEV, block).unwrap().with(|d| zone_entry(d, k))
    }

    #[test]
    fn disk_inode_is_32_bytes() {
        assert_eq!(DInode::disk_size(), DINODE_SIZE);
        let d = DInode {
            mode: S_IFREG,
            zone: [1, 2, 3, 4, 5, 6, 7, 8, 0x1234],
            ..Default::default()
        };
        let bytes = bincode::serialize(&d).unwrap();
        assert_eq!(&bytes[30..], &[0x34, 0x12]);
    }

    #[test]
    fn iget_shares_the_slot() {
        let (fs, _disk) = testutil::mounted(16, 32, 128);
        let num = fs.new_inode(TEST_DEV).unwrap().num();
        let a = fs.iget(TEST_DEV, num).unwrap();
        let b = fs.iget(TEST_DEV, num).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(b.info().count, 2);
        drop(a);
        assert_eq!(b.info().count, 1);
    }

    #[test]
    fn idle_inodes_stay_cached_while_slots_are_free() {
        let (fs, _disk) = testutil::mounted(16, 32, 128);
        let a = fs.new_inode(TEST_DEV).unwrap();
        let b = fs.new_inode(TEST_DEV).unwrap();
        let (a_num, a_id) = (a.num(), a.id());
        let (b_num, b_id) = (b.num(), b.id());
        drop((a, b));
        fs.sync_all().unwrap();

        let again = fs.iget(TEST_DEV, a_num).unwrap();
        assert_eq!(again.id(), a_id);
        let pool = fs.itable.lock();
        let cached = &pool.inodes[b_id.0];
        assert_eq!((cached.dev, cached.num, cached.count), (TEST_DEV, b_num, 0));
    }

    #[test]
    fn dirty_idle_inode_on_a_dead_disk_does_not_block_free_slots() {
        testutil::init_log();
        let disk = Arc::new(FaultyDisk::new(128));
        let opts = MkfsOptions {
            ninodes: 32,
            nzones: 128,
            root: false,
        };
        mkfs::mkfs(disk.as_ref(), &opts).unwrap();
        let fs = FileSystem::new(FsConfig::default());
        fs.devices().register(major(TEST_DEV), disk.clone());
        fs.mount(TEST_DEV).unwrap();

        let inode = fs.new_inode(TEST_DEV).unwrap();
        let first = inode.id();
        disk.fail(fs.get_super(TEST_DEV).inode_block(inode.num()) as usize);
        assert!(matches!(inode.put(), Err(FsError::Io { .. })));
        assert!(fs.itable.lock().inodes[first.0].dirty);

        // a free slot wins over the unwritable idle one
        let (r, w) = fs.get_pipe_inode().unwrap();
        assert_ne!(r.id(), first);
        drop((r, w));
        assert!(fs.itable.lock().inodes[first.0].dirty);
    }

    #[test]
    fn put_writes_back_dirty_inode() {
        let (fs, disk) = testutil::mounted(16, 32, 128);
        let inode = fs.new_inode(TEST_DEV).unwrap();
        let num = inode.num();
        inode.update(|d| {
            d.mode = S_IFREG | 0o600;
            d.size = 123;
        });
        inode.put().unwrap();

        // iput only touched the buffer
        assert_eq!(disk_inode(&fs, &disk, num), DInode::default());
        fs.sync_all().unwrap();
        let d = disk_inode(&fs, &disk, num);
        assert_eq!(d.size, 123);
        assert_eq!(d.nlinks, 1);
        assert_eq!(d.mode, S_IFREG | 0o600);
    }

    #[test]
    fn sync_keeps_references() {
        let (fs, disk) = testutil::mounted(16, 32, 128);
        let inode = fs.new_inode(TEST_DEV).unwrap();
        inode.update(|d| d.size = 7);
        fs.sync_all().unwrap();
        assert_eq!(disk_inode(&fs, &disk, inode.num()).size, 7);
        assert!(!inode.info().dirty);
        assert_eq!(inode.info().count, 1);
    }

    #[test]
    fn holes_translate_to_zero() {
        let (fs, _disk) = testutil::mounted(16, 32, 128);
        let inode = fs.new_inode(TEST_DEV).unwrap();
        let free = fs.count_free(TEST_DEV).0;
        for block in [0, NDIRECT - 1, NDIRECT, NDIRECT + NINDIRECT, MAX_FILE_BLOCKS - 1] {
            assert_eq!(inode.translate(block, false), 0);
        }
        assert_eq!(fs.count_free(TEST_DEV).0, free);
        assert!(!inode.info().disk.zone.iter().any(|&z| z != 0));
    }

    #[test]
    fn translate_allocates_once_per_level() {
        let (fs, _disk) = testutil::mounted(16, 32, 256);
        let inode = fs.new_inode(TEST_DEV).unwrap();
        let free = || fs.count_free(TEST_DEV).0;
        let mut left = free();

        let mut step = |block: usize, cost: usize| {
            let zone = inode.translate(block, true);
            assert_ne!(zone, 0);
            left -= cost;
            assert_eq!(free(), left, "block {block}");
            assert_eq!(inode.translate(block, false), zone);
            assert_eq!(inode.translate(block, true), zone);
            assert_eq!(free(), left);
            zone
        };

        let d0 = step(0, 1);
        step(NDIRECT, 2);
        let i1 = step(NDIRECT + 1, 1);
        step(NDIRECT + NINDIRECT, 3);
        step(NDIRECT + NINDIRECT + 1, 1);
        let far = step(NDIRECT + 2 * NINDIRECT + 5, 2);

        let zones = inode.info().disk.zone;
        assert_eq!(zones[0] as u32, d0);
        assert_eq!(indirect(&fs, zones[NDIRECT] as u32, 1) as u32, i1);
        let second = indirect(&fs, zones[NDIRECT + 1] as u32, 1);
        assert_eq!(indirect(&fs, second as u32, 5) as u32, far);
    }

    #[test]
    fn translate_reports_exhaustion_as_hole() {
        let (fs, _disk) = testutil::mounted(8, 32, 64);
        let inode = fs.new_inode(TEST_DEV).unwrap();
        while fs.new_block(TEST_DEV).is_ok() {}
        assert_eq!(inode.translate(0, true), 0);
        assert_eq!(inode.translate(NDIRECT + 3, true), 0);
        assert_eq!(inode.info().disk.zone, [0; 9]);
    }

    #[test]
    fn last_put_of_unlinked_inode_frees_everything() {
        let (fs, _disk) = testutil::mounted(16, 32, 256);
        let before = fs.count_free(TEST_DEV);
        let inode = fs.new_inode(TEST_DEV).unwrap();
        for block in [0, 3, NDIRECT, NDIRECT + 9, NDIRECT + NINDIRECT + 600] {
            assert_ne!(inode.translate(block, true), 0);
        }
        assert_eq!(fs.count_free(TEST_DEV).0, before.0 - 8);

        let extra = fs.iget(TEST_DEV, inode.num()).unwrap();
        inode.update(|d| d.nlinks = 0);
        drop(inode);
        // still referenced, nothing released yet
        assert_eq!(fs.count_free(TEST_DEV).0, before.0 - 8);
        drop(extra);
        assert_eq!(fs.count_free(TEST_DEV), before);
        assert!(!testutil::bit(&fs, 2, 1));
    }

    #[test]
    fn truncate_keeps_the_inode() {
        let (fs, _disk) = testutil::mounted(16, 32, 128);
        let before = fs.count_free(TEST_DEV).0;
        let inode = fs.new_inode(TEST_DEV).unwrap();
        inode.update(|d| d.size = 3 * BSIZE as u32);
        for block in 0..3 {
            inode.translate(block, true);
        }
        inode.truncate();
        assert_eq!(fs.count_free(TEST_DEV).0, before);
        let info = inode.info();
        assert_eq!(info.disk.size, 0);
        assert_eq!(info.disk.nlinks, 1);
        assert!(info.dirty);
    }

    #[test]
    fn inode_numbers_run_out_cleanly() {
        let (fs, _disk) = testutil::mounted(16, 4, 64);
        let held: Vec<_> = (0..4).map(|_| fs.new_inode(TEST_DEV).unwrap()).collect();
        let nums: Vec<u32> = held.iter().map(|i| i.num()).collect();
        assert_eq!(nums, [1, 2, 3, 4]);
        assert!(matches!(fs.new_inode(TEST_DEV), Err(FsError::NoInodes { .. })));
        assert_eq!(fs.inodes_in_use(TEST_DEV), 4);
    }

    #[test]
    fn pipe_inode_lives_in_memory() {
        let (fs, _disk) = testutil::mounted(16, 32, 128);
        let (reader, writer) = fs.get_pipe_inode().unwrap();
        assert_eq!(reader.id(), writer.id());
        assert!(reader.info().pipe);
        writer.with_pipe_page(|page| page[..5].copy_from_slice(b"hello"));
        assert_eq!(reader.with_pipe_page(|page| page[..5].to_vec()).unwrap(), b"hello");

        let id = reader.id();
        drop(writer);
        assert_eq!(reader.info().count, 1);
        drop(reader);
        let pool = fs.itable.lock();
        assert_eq!(pool.inodes[id.0].count, 0);
        assert!(pool.inodes[id.0].pipe_page.is_none());
        assert!(!pool.inodes[id.0].pipe);
    }

    #[test]
    fn concurrent_iget_binds_one_slot() {
        let (fs, _disk) = testutil::mounted(16, 32, 128);
        let num = fs.new_inode(TEST_DEV).unwrap().num();
        let ids: Vec<InodeId> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| fs.iget(TEST_DEV, num).unwrap().pin()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(fs.dup_inode(ids[0]).info().count, 5);
    }

    #[test]
    #[should_panic(expected = "No free inodes in mem")]
    fn inode_table_exhaustion_is_fatal() {
        let (fs, _disk) = testutil::mounted_with(
            FsConfig {
                nr_buffers: 16,
                nr_inodes: 2,
                ..FsConfig::default()
            },
            32,
            128,
        );
        let a = fs.new_inode(TEST_DEV).unwrap().pin();
        let b = fs.new_inode(TEST_DEV).unwrap().pin();
        let _ = (a, b);
        let _ = fs.new_inode(TEST_DEV);
    }

    #[test]
    #[should_panic(expected = "trying to free free inode")]
    fn iput_of_free_slot_is_fatal() {
        let (fs, _disk) = testutil::mounted(16, 32, 128);
        let _ = fs.iput(0);
    }
}
