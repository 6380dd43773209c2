use super::*;

/// Pool sizes and the boot device.
#[derive(Clone, Debug)]
pub struct FsConfig {
    /// buffers in the block cache
    pub nr_buffers: usize,
    /// in-core inode slots
    pub nr_inodes: usize,
    /// device mounted by `mount_root`
    pub root_dev: Dev,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            nr_buffers: NR_BUFFERS,
            nr_inodes: NR_INODE,
            root_dev: ROOT_DEV,
        }
    }
}
