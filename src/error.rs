use super::*;

use thiserror::Error;

/// Failures a caller is expected to handle. Broken invariants panic instead.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error on device {dev:#06x}, block {block}: {source}")]
    Io {
        dev: Dev,
        block: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("no free blocks on device {dev:#06x}")]
    NoSpace { dev: Dev },
    #[error("no free inodes on device {dev:#06x}")]
    NoInodes { dev: Dev },
    #[error("bad superblock magic {magic:#06x} on device {dev:#06x}")]
    BadMagic { dev: Dev, magic: u16 },
    #[error("invalid superblock on device {dev:#06x}: {reason}")]
    InvalidSuperBlock { dev: Dev, reason: &'static str },
    #[error("superblock table full")]
    NoSuperSlot,
    #[error("device {0:#06x} is already mounted")]
    AlreadyMounted(Dev),
    #[error("device {0:#06x} is not mounted")]
    NotMounted(Dev),
    #[error("device {0:#06x} is busy")]
    Busy(Dev),
    #[error("bad geometry: {0}")]
    Geometry(String),
    #[error("bad on-disk record: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    File(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;
