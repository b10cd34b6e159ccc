//! Filesystem bring-up: register TinyFS, create the root RAM disk, mount
//! it at `/`.

use alloc::boxed::Box;
use alloc::sync::Arc;

use muon_core::sync::SpinLock;
use muon_fs::block::{BlockDevice, RamDisk};
use muon_fs::tinyfs::TinyFs;
use muon_fs::vfs;
use muon_fs::{FileSystem, FsError};

use crate::config;

/// The root RAM disk, created once so remounts see the same contents for
/// the whole session.
static RAMDISK: SpinLock<Option<Arc<RamDisk>>> = SpinLock::new(None);

fn root_device() -> Arc<RamDisk> {
    let mut disk = RAMDISK.lock();
    disk.get_or_insert_with(|| RamDisk::new(config::RAMDISK_BLOCKS))
        .clone()
}

/// Initializes the VFS, registers TinyFS over the RAM disk, and mounts it
/// as the root filesystem.
pub fn init() {
    vfs::init();
    let mounted = vfs::with_vfs(|v| {
        v.register_filesystem(
            "tinyfs",
            Box::new(|device| {
                if device != "ram0" {
                    return Err(FsError::NotFound);
                }
                let dev: Arc<dyn BlockDevice> = root_device();
                let fs: Arc<dyn FileSystem> = TinyFs::mount_or_format(dev)?;
                Ok(fs)
            }),
        );
        v.mount("tinyfs", "ram0", "/")
    });

    match mounted {
        Ok(()) => {
            if let Ok(stats) = vfs::with_vfs(|v| v.statfs()) {
                muon_core::kinfo!(
                    "fs: tinyfs on ram0, {} blocks, {} free",
                    stats.total_blocks,
                    stats.free_blocks
                );
            }
        }
        Err(e) => muon_core::kerr!("fs: mounting root failed: {e}"),
    }
}
