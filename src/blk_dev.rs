//! Block device drivers and the major-number dispatch table.

use super::*;

use std::any::Any;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, RwLock};

pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, blockno: usize, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&self, blockno: usize, buf: &[u8]) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Drivers indexed by major number.
pub struct DeviceTable {
    drivers: RwLock<[Option<Arc<dyn BlockDevice>>; NR_BLK_DEV]>,
}

impl DeviceTable {
    pub fn new() -> Self {
        DeviceTable {
            drivers: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Installs `driver` for every device with this major number.
    pub fn register(&self, major: usize, driver: Arc<dyn BlockDevice>) {
        assert!(major < NR_BLK_DEV, "block major {major} out of range");
        self.drivers.write().unwrap()[major] = Some(driver);
        log::debug!("registered block driver for major {major}");
    }

    fn driver(&self, dev: Dev) -> Arc<dyn BlockDevice> {
        let driver = self
            .drivers
            .read()
            .unwrap()
            .get(major(dev))
            .and_then(|d| d.clone());
        driver.unwrap_or_else(|| panic!("Trying to read nonexistent block-device {dev:#06x}"))
    }

    /// One synchronous physical transfer of a whole block.
    pub fn transfer(&self, dir: Direction, dev: Dev, blockno: u32, buf: &mut [u8; BSIZE]) -> io::Result<()> {
        let driver = self.driver(dev);
        match dir {
            Direction::Read => driver.read_block(blockno as usize, &mut buf[..]),
            Direction::Write => driver.write_block(blockno as usize, &buf[..]),
        }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// RAM disk.
pub struct MemDisk {
    blocks: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(nblocks: usize) -> Self {
        MemDisk {
            blocks: Mutex::new(vec![0; nblocks * BSIZE]),
        }
    }

    pub fn nblocks(&self) -> usize {
        self.blocks.lock().unwrap().len() / BSIZE
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, blockno: usize, buf: &mut [u8]) -> io::Result<()> {
        let blocks = self.blocks.lock().unwrap();
        let start = blockno * BSIZE;
        let src = blocks
            .get(start..start + BSIZE)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "block past end of disk"))?;
        buf[..BSIZE].copy_from_slice(src);
        Ok(())
    }

    fn write_block(&self, blockno: usize, buf: &[u8]) -> io::Result<()> {
        let mut blocks = self.blocks.lock().unwrap();
        let start = blockno * BSIZE;
        let dst = blocks
            .get_mut(start..start + BSIZE)
            .ok_or_else(|| io::Error::new(io::ErrorKind::WriteZero, "block past end of disk"))?;
        dst.copy_from_slice(&buf[..BSIZE]);
        Ok(())
    }
}

/// Disk image on the host filesystem.
pub struct BlockFile(pub Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, blockno: usize, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((blockno * BSIZE) as u64))?;
        file.read_exact(&mut buf[..BSIZE])
    }

    fn write_block(&self, blockno: usize, buf: &[u8]) -> io::Result<()> {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((blockno * BSIZE) as u64))?;
        file.write_all(&buf[..BSIZE])
    }
}
