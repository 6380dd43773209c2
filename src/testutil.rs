//! Fixtures shared by the unit tests.

use super::*;
use blk_dev::{BlockDevice, MemDisk};
use fs::FileSystem;
use mkfs::MkfsOptions;

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A RAM disk whose transfers of selected blocks fail.
pub struct FaultyDisk {
    disk: MemDisk,
    bad: Mutex<HashSet<usize>>,
    bad_writes: Mutex<HashSet<usize>>,
}

impl FaultyDisk {
    pub fn new(nblocks: usize) -> Self {
        FaultyDisk {
            disk: MemDisk::new(nblocks),
            bad: Mutex::new(HashSet::new()),
            bad_writes: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail(&self, blockno: usize) {
        self.bad.lock().unwrap().insert(blockno);
    }

    pub fn fail_write(&self, blockno: usize) {
        self.bad_writes.lock().unwrap().insert(blockno);
    }
}

impl BlockDevice for FaultyDisk {
    fn read_block(&self, blockno: usize, buf: &mut [u8]) -> io::Result<()> {
        if self.bad.lock().unwrap().contains(&blockno) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read error"));
        }
        self.disk.read_block(blockno, buf)
    }

    fn write_block(&self, blockno: usize, buf: &[u8]) -> io::Result<()> {
        if self.bad_writes.lock().unwrap().contains(&blockno) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write error"));
        }
        self.disk.write_block(blockno, buf)
    }
}

pub const TEST_DEV: Dev = ROOT_DEV;

/// A freshly formatted RAM disk, registered and mounted as `TEST_DEV`.
pub fn mounted(nr_buffers: usize, ninodes: u16, nzones: u16) -> (FileSystem, Arc<MemDisk>) {
    let config = FsConfig {
        nr_buffers,
        ..FsConfig::default()
    };
    mounted_with(config, ninodes, nzones)
}

pub fn mounted_with(config: FsConfig, ninodes: u16, nzones: u16) -> (FileSystem, Arc<MemDisk>) {
    init_log();
    let disk = Arc::new(MemDisk::new(nzones as usize));
    mkfs::mkfs(
        disk.as_ref(),
        &MkfsOptions {
            ninodes,
            nzones,
            root: false,
        },
    )
    .unwrap();
    let fs = FileSystem::new(config);
    fs.devices().register(major(TEST_DEV), disk.clone());
    fs.mount(TEST_DEV).unwrap();
    (fs, disk)
}

/// Is bit `nr` of bitmap block `block` set, as the cache currently sees it.
pub fn bit(fs: &FileSystem, block: u32, nr: usize) -> bool {
    let buf = fs.read_block(TEST_DEV, block).unwrap();
    buf.with(|d| d[nr / 8] & (1 << (nr % 8)) != 0)
}
