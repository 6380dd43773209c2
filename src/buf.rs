//! Buffer cache.
//!
//! A fixed pool of block buffers. Every buffer sits on the free list for its
//! whole life, in the order it was last (re)bound; a bound buffer is also
//! reachable from the hash table under its (dev, blockno). Eviction takes the
//! first unreferenced buffer from the front of the free list.
//!
//! The pool mutex plays the role of `cli`/`sti`: nothing in the pool changes
//! without it. A buffer's `lock` flag is held across a physical transfer,
//! during which the mutex is released. Unlocking broadcasts on the condvar,
//! so every waiter has to re-check what it was waiting for.

use super::*;
use blk_dev::{DeviceTable, Direction};

use log::{debug, error, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Index of a descriptor in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufId(usize);

struct BufferHead {
    /// 0 while unbound
    dev: Dev,
    blocknr: u32,
    count: u32,
    /// a transfer is in flight
    lock: bool,
    dirty: bool,
    /// data matches the disk (or is newer)
    uptodate: bool,
    data: Box<[u8; BSIZE]>,
}

impl BufferHead {
    fn new() -> Self {
        BufferHead {
            dev: 0,
            blocknr: 0,
            count: 0,
            lock: false,
            dirty: false,
            uptodate: false,
            data: Box::new([0; BSIZE]),
        }
    }
}

struct Pool {
    heads: Vec<BufferHead>,
    hash: HashMap<(Dev, u32), usize>,
    /// every buffer, oldest binding first
    free_list: VecDeque<usize>,
}

impl Pool {
    fn find_buffer(&self, dev: Dev, block: u32) -> Option<usize> {
        self.hash.get(&(dev, block)).copied()
    }

    fn remove_from_queues(&mut self, i: usize) {
        let key = (self.heads[i].dev, self.heads[i].blocknr);
        if self.hash.get(&key) == Some(&i) {
            self.hash.remove(&key);
        }
        let pos = self.free_list.iter().position(|&j| j == i);
        match pos {
            Some(pos) => {
                self.free_list.remove(pos);
            }
            None => panic!("Free block list corrupted"),
        }
    }

    fn insert_into_queues(&mut self, i: usize) {
        self.free_list.push_back(i);
        let bh = &self.heads[i];
        if bh.dev != 0 {
            self.hash.insert((bh.dev, bh.blocknr), i);
        }
    }
}

/// Snapshot of the pool, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub buffers: usize,
    pub bound: usize,
    pub referenced: usize,
    pub dirty: usize,
}

pub struct BufCache {
    pool: Mutex<Pool>,
    /// buffer_wait and every b_wait, folded into one broadcast queue
    wait: Condvar,
    devices: DeviceTable,
}

impl BufCache {
    pub fn new(nr_buffers: usize, devices: DeviceTable) -> Self {
        assert!(nr_buffers > 0, "empty buffer pool");
        let heads: Vec<BufferHead> = (0..nr_buffers).map(|_| BufferHead::new()).collect();
        BufCache {
            pool: Mutex::new(Pool {
                heads,
                hash: HashMap::new(),
                free_list: (0..nr_buffers).collect(),
            }),
            wait: Condvar::new(),
            devices,
        }
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    fn lock_pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap()
    }

    fn wait_on_buffer<'g>(&'g self, mut pool: MutexGuard<'g, Pool>, i: usize) -> MutexGuard<'g, Pool> {
        while pool.heads[i].lock {
            pool = self.wait.wait(pool).unwrap();
        }
        pool
    }

    /// Starts a transfer on buffer `i` and sleeps until it completes.
    fn ll_rw_block<'g>(
        &'g self,
        pool: MutexGuard<'g, Pool>,
        dir: Direction,
        i: usize,
    ) -> (MutexGuard<'g, Pool>, Result<()>) {
        let mut pool = self.wait_on_buffer(pool, i);
        let bh = &mut pool.heads[i];
        let (dev, blocknr) = (bh.dev, bh.blocknr);
        let mut scratch = [0u8; BSIZE];
        if dir == Direction::Write {
            scratch.copy_from_slice(&bh.data[..]);
            bh.dirty = false;
        }
        bh.lock = true;
        drop(pool);

        trace!("{dir:?} {dev:#06x}:{blocknr}");
        let res = self.devices.transfer(dir, dev, blocknr, &mut scratch);

        // completion: clear the lock and wake everybody
        let mut pool = self.lock_pool();
        let bh = &mut pool.heads[i];
        match (&res, dir) {
            (Ok(()), Direction::Read) => {
                bh.data.copy_from_slice(&scratch);
                bh.uptodate = true;
            }
            (Ok(()), Direction::Write) => {}
            (Err(e), _) => {
                warn!("{dir:?} failed on {dev:#06x}:{blocknr}: {e}");
                if dir == Direction::Write {
                    bh.dirty = true;
                }
            }
        }
        bh.lock = false;
        self.wait.notify_all();
        let res = res.map_err(|source| FsError::Io {
            dev,
            block: blocknr,
            source,
        });
        (pool, res)
    }

    fn lookup_locked<'g>(
        &'g self,
        mut pool: MutexGuard<'g, Pool>,
        dev: Dev,
        block: u32,
    ) -> (MutexGuard<'g, Pool>, Option<usize>) {
        loop {
            let Some(i) = pool.find_buffer(dev, block) else {
                return (pool, None);
            };
            pool.heads[i].count += 1;
            pool = self.wait_on_buffer(pool, i);
            if pool.heads[i].dev == dev && pool.heads[i].blocknr == block {
                return (pool, Some(i));
            }
            // repurposed while we slept
            pool = self.brelse_locked(pool, i);
        }
    }

    fn brelse_locked<'g>(&'g self, pool: MutexGuard<'g, Pool>, i: usize) -> MutexGuard<'g, Pool> {
        let mut pool = self.wait_on_buffer(pool, i);
        if pool.heads[i].count == 0 {
            drop(pool);
            panic!("Trying to free free buffer");
        }
        pool.heads[i].count -= 1;
        self.wait.notify_all();
        pool
    }

    /// Returns the buffer already bound to (dev, block), if any.
    pub fn lookup(&self, dev: Dev, block: u32) -> Option<Buffer<'_>> {
        let pool = self.lock_pool();
        let (_pool, found) = self.lookup_locked(pool, dev, block);
        found.map(|i| Buffer::new(self, i))
    }

    /// Returns a buffer bound to (dev, block), recycling the oldest idle
    /// buffer on a miss. The contents are only meaningful if uptodate.
    pub fn getblk(&self, dev: Dev, block: u32) -> Result<Buffer<'_>> {
        let mut pool = self.lock_pool();
        loop {
            let (p, found) = self.lookup_locked(pool, dev, block);
            pool = p;
            if let Some(i) = found {
                trace!("hit {dev:#06x}:{block}");
                return Ok(Buffer::new(self, i));
            }

            let mut victim = None;
            let order: Vec<usize> = pool.free_list.iter().copied().collect();
            for i in order {
                if pool.heads[i].count == 0 {
                    pool = self.wait_on_buffer(pool, i);
                    if pool.heads[i].count == 0 {
                        victim = Some(i);
                        break;
                    }
                }
            }
            let Some(i) = victim else {
                debug!("sleeping on free buffer for {dev:#06x}:{block}");
                pool = self.wait.wait(pool).unwrap();
                continue;
            };

            pool.heads[i].count += 1;
            pool.remove_from_queues(i);
            // nobody can reach it now, so it is safe to sleep while writing it out
            if pool.heads[i].dirty {
                let old = pool.heads[i].dev;
                debug!(
                    "evicting dirty {old:#06x}:{}, syncing the device",
                    pool.heads[i].blocknr
                );
                let (p, res) = self.sync_dev_locked(pool, Some(old));
                pool = p;
                if let Err(e) = res {
                    if pool.heads[i].dirty {
                        self.put_back(&mut pool, i);
                        return Err(e);
                    }
                    warn!("sync of {old:#06x} during eviction: {e}");
                }
            }

            let bh = &mut pool.heads[i];
            bh.dev = dev;
            bh.blocknr = block;
            bh.dirty = false;
            bh.uptodate = false;
            // somebody may have bound this block while we slept in sync
            if pool.find_buffer(dev, block).is_some() {
                let bh = &mut pool.heads[i];
                bh.dev = 0;
                bh.blocknr = 0;
                bh.count = 0;
                pool.insert_into_queues(i);
                self.wait.notify_all();
                continue;
            }
            pool.insert_into_queues(i);
            trace!("miss {dev:#06x}:{block} -> buffer {i}");
            return Ok(Buffer::new(self, i));
        }
    }

    /// Undoes a failed eviction: the victim keeps its old identity unless
    /// that identity was re-bound meanwhile.
    fn put_back(&self, pool: &mut Pool, i: usize) {
        let bh = &pool.heads[i];
        if pool.find_buffer(bh.dev, bh.blocknr).is_some() {
            error!(
                "dropping unwritable dirty block {:#06x}:{}",
                bh.dev,
                bh.blocknr
            );
            let bh = &mut pool.heads[i];
            bh.dev = 0;
            bh.blocknr = 0;
            bh.dirty = false;
            bh.uptodate = false;
        }
        pool.heads[i].count -= 1;
        pool.insert_into_queues(i);
        self.wait.notify_all();
    }

    /// Reads a block, or reports the I/O error with the buffer released.
    pub fn bread(&self, dev: Dev, block: u32) -> Result<Buffer<'_>> {
        let buf = self.getblk(dev, block)?;
        let i = buf.id.0;
        let pool = self.lock_pool();
        let pool = self.wait_on_buffer(pool, i);
        if pool.heads[i].uptodate {
            return Ok(buf);
        }
        let (pool, res) = self.ll_rw_block(pool, Direction::Read, i);
        drop(pool);
        res.map(|()| buf)
    }

    /// Drops one reference.
    pub fn brelse(&self, id: BufId) {
        let pool = self.lock_pool();
        drop(self.brelse_locked(pool, id.0));
    }

    fn sync_dev_locked<'g>(
        &'g self,
        mut pool: MutexGuard<'g, Pool>,
        dev: Option<Dev>,
    ) -> (MutexGuard<'g, Pool>, Result<()>) {
        let mut first_err = None;
        for i in 0..pool.heads.len() {
            if dev.is_some_and(|dev| pool.heads[i].dev != dev) {
                continue;
            }
            pool = self.wait_on_buffer(pool, i);
            if pool.heads[i].dirty && pool.heads[i].dev != 0 {
                let (p, res) = self.ll_rw_block(pool, Direction::Write, i);
                pool = p;
                if let Err(e) = res {
                    first_err.get_or_insert(e);
                }
            }
        }
        (pool, first_err.map_or(Ok(()), Err))
    }

    /// Writes back every dirty buffer of `dev`.
    pub fn sync_dev(&self, dev: Dev) -> Result<()> {
        let pool = self.lock_pool();
        self.sync_dev_locked(pool, Some(dev)).1
    }

    /// Writes back every dirty buffer.
    pub fn sync_all(&self) -> Result<()> {
        let pool = self.lock_pool();
        self.sync_dev_locked(pool, None).1
    }

    /// Unbinds every idle buffer of `dev`; dirty ones are dropped, so sync first.
    pub fn invalidate_dev(&self, dev: Dev) {
        let mut pool = self.lock_pool();
        for i in 0..pool.heads.len() {
            if pool.heads[i].dev != dev || pool.heads[i].count != 0 {
                continue;
            }
            pool.remove_from_queues(i);
            let bh = &mut pool.heads[i];
            bh.dev = 0;
            bh.blocknr = 0;
            bh.dirty = false;
            bh.uptodate = false;
            pool.insert_into_queues(i);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let pool = self.lock_pool();
        pool.heads.iter().fold(
            CacheStats {
                buffers: pool.heads.len(),
                ..Default::default()
            },
            |mut s, bh| {
                s.bound += (bh.dev != 0) as usize;
                s.referenced += (bh.count != 0) as usize;
                s.dirty += bh.dirty as usize;
                s
            },
        )
    }

    /// Reference count of a descriptor.
    pub fn count(&self, id: BufId) -> u32 {
        self.lock_pool().heads[id.0].count
    }

    fn held<'g>(&'g self, id: BufId) -> MutexGuard<'g, Pool> {
        let pool = self.lock_pool();
        if pool.heads[id.0].count == 0 {
            drop(pool);
            panic!("access to unreferenced buffer {}", id.0);
        }
        pool
    }

    /// Runs `f` on the block data under the pool lock; `f` must not call
    /// back into the cache.
    pub fn with<V>(&self, id: BufId, f: impl FnOnce(&[u8; BSIZE]) -> V) -> V {
        let pool = self.held(id);
        f(&*pool.heads[id.0].data)
    }

    /// Like [`BufCache::with`], and marks the buffer dirty.
    pub fn with_mut<V>(&self, id: BufId, f: impl FnOnce(&mut [u8; BSIZE]) -> V) -> V {
        let mut pool = self.held(id);
        let bh = &mut pool.heads[id.0];
        bh.dirty = true;
        f(&mut *bh.data)
    }

    /// Marks the buffer dirty only if `f` returns `Some`.
    pub fn try_with_mut<V>(&self, id: BufId, f: impl FnOnce(&mut [u8; BSIZE]) -> Option<V>) -> Option<V> {
        let mut pool = self.held(id);
        let bh = &mut pool.heads[id.0];
        let res = f(&mut *bh.data);
        if res.is_some() {
            bh.dirty = true;
        }
        res
    }

    fn set_uptodate(&self, id: BufId) {
        let mut pool = self.held(id);
        pool.heads[id.0].uptodate = true;
    }

    fn clear_flags(&self, id: BufId) {
        let mut pool = self.held(id);
        let bh = &mut pool.heads[id.0];
        bh.dirty = false;
        bh.uptodate = false;
    }
}

/// One counted reference to a buffer; dropping it calls `brelse`.
pub struct Buffer<'a> {
    cache: &'a BufCache,
    id: BufId,
}

impl<'a> Buffer<'a> {
    fn new(cache: &'a BufCache, i: usize) -> Self {
        Buffer { cache, id: BufId(i) }
    }

    pub fn id(&self) -> BufId {
        self.id
    }

    pub fn count(&self) -> u32 {
        self.cache.count(self.id)
    }

    pub fn with<V>(&self, f: impl FnOnce(&[u8; BSIZE]) -> V) -> V {
        self.cache.with(self.id, f)
    }

    pub fn with_mut<V>(&mut self, f: impl FnOnce(&mut [u8; BSIZE]) -> V) -> V {
        self.cache.with_mut(self.id, f)
    }

    /// Declares the contents valid without reading the disk. Does not
    /// touch the dirty flag; `with_mut` sets that.
    pub fn set_uptodate(&mut self) {
        self.cache.set_uptodate(self.id);
    }

    /// Forgets the contents; the next `bread` goes to the disk.
    pub fn invalidate(self) {
        self.cache.clear_flags(self.id);
    }

    /// Keeps the reference past this handle. Release it with `BufCache::brelse`.
    pub fn pin(self) -> BufId {
        let id = self.id;
        mem::forget(self);
        id
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        self.cache.brelse(self.id);
    }
}
