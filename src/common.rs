use std::time::{SystemTime, UNIX_EPOCH};

/// Device number: major in the high byte, minor in the low byte.
pub type Dev = u16;

/// block size
pub const BSIZE: usize = 1024;

/// bits per bitmap block
pub const BPB: usize = BSIZE * 8;

pub const SUPER_MAGIC: u16 = 0x137f;

pub const ROOT_INO: u32 = 1; // root i-number

/// /dev/hda1
pub const ROOT_DEV: Dev = 0x301;

/// default size of the buffer pool
pub const NR_BUFFERS: usize = 64;

/// default size of the in-core inode pool
pub const NR_INODE: usize = 32;

/// mounted filesystems at once
pub const NR_SUPER: usize = 8;

/// block device majors
pub const NR_BLK_DEV: usize = 7;

pub const I_MAP_SLOTS: usize = 8;
pub const Z_MAP_SLOTS: usize = 8;

/// on-disk inode record
pub const DINODE_SIZE: usize = 32;

/// inodes per block
pub const INODES_PER_BLOCK: usize = BSIZE / DINODE_SIZE;

/// direct zones in inode
pub const NDIRECT: usize = 7;

/// zone numbers in an indirect block
pub const NINDIRECT: usize = BSIZE / std::mem::size_of::<u16>();

/// max # of blocks a file can address
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// backing page of a pipe inode
pub const PAGE_SIZE: usize = 4096;

/// directory entry name length
pub const DIRSIZ: usize = 14;

pub const S_IFMT: u16 = 0o170000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;

pub fn major(dev: Dev) -> usize {
    (dev >> 8) as usize
}

pub fn minor(dev: Dev) -> usize {
    (dev & 0xff) as usize
}

/// Seconds since the epoch, truncated to the on-disk width.
pub fn current_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// uid/gid of the calling process, truncated to the on-disk width.
pub fn current_owner() -> (u16, u8) {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    (uid as u16, gid as u8)
}
