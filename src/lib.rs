mod bitmap; // zone and inode allocation
mod block_rw; // byte I/O on block devices
mod common;
mod config;
mod error;
mod inode; // in-core inodes

pub mod blk_dev; // block device drivers
pub mod buf; // buffer cache
pub mod fs; // superblocks and mounting
pub mod mkfs;

#[cfg(test)]
mod testutil;

pub use blk_dev::{BlockDevice, BlockFile, DeviceTable, MemDisk};
pub use buf::{BufCache, BufId, Buffer, CacheStats};
pub use common::*;
pub use config::FsConfig;
pub use error::{FsError, Result};
pub use fs::{DSuperBlock, FileSystem, RootInfo, SuperBlock};
pub use inode::{DInode, Inode, InodeId, InodeInfo};
