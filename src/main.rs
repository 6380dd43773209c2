use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use log::info;
use minix_bcache::mkfs::{self, MkfsOptions};
use minix_bcache::{major, BlockFile, FileSystem, FsConfig, Result, BSIZE, NR_BUFFERS, NR_INODE, ROOT_DEV};

#[derive(Parser)]
#[command(version, about = "Minix v1 filesystem images through a block cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format an image file
    Mkfs {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        inodes: u16,
        /// image size in blocks
        #[arg(long)]
        zones: u16,
        /// no root directory
        #[arg(long)]
        bare: bool,
    },
    /// Mount an image as the root device and report on it
    Info {
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value_t = NR_BUFFERS)]
        buffers: usize,
        #[arg(long, default_value_t = NR_INODE)]
        inodes_in_core: usize,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Mkfs {
            image,
            inodes,
            zones,
            bare,
        } => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&image)?;
            file.set_len(zones as u64 * BSIZE as u64)?;
            let opts = MkfsOptions {
                ninodes: inodes,
                nzones: zones,
                root: !bare,
            };
            let sb = mkfs::mkfs(&BlockFile(Mutex::new(file)), &opts)?;
            println!(
                "{}: {} inodes, {} zones, first data zone {}",
                image.display(),
                sb.ninodes,
                sb.nzones,
                sb.firstdatazone
            );
        }
        Command::Info {
            image,
            buffers,
            inodes_in_core,
        } => {
            let file = OpenOptions::new().read(true).write(true).open(&image)?;
            let fs = FileSystem::new(FsConfig {
                nr_buffers: buffers,
                nr_inodes: inodes_in_core,
                root_dev: ROOT_DEV,
            });
            fs.devices()
                .register(major(ROOT_DEV), Arc::new(BlockFile(Mutex::new(file))));
            let root = fs.mount_root()?;
            let sb = fs.get_super(root.dev);
            println!("{}: {:?}", image.display(), sb.d);
            println!("{}/{} free blocks", root.free_blocks, root.nzones);
            println!("{}/{} free inodes", root.free_inodes, root.ninodes);
            println!("root inode: {:?}", fs.dup_inode(root.root).info().disk);
            println!("{:?}", fs.bcache().stats());
            fs.shutdown()?;
            info!("done");
        }
    }
    Ok(())
}
