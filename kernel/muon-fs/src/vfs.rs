//! The VFS: filesystem registry, the single root mount, path resolution,
//! the descriptor table, and the current working directory.
//!
//! Filesystem types register a mount constructor under a name; `mount`
//! looks the name up, builds the filesystem over the named device, and (for
//! the only supported mountpoint, `/`) installs its root as both the VFS
//! root and the initial cwd.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::id::Fd;
use muon_core::sync::SpinLock;

use crate::file::{FdTable, OpenFlags, SeekFrom};
use crate::path;
use crate::{DirEntry, FileSystem, FsError, FsStats, NodeKind, Permissions, Vnode};

/// Builds a filesystem instance over the named device.
pub type MountConstructor =
    Box<dyn Fn(&str) -> Result<Arc<dyn FileSystem>, FsError> + Send + Sync>;

/// The virtual filesystem.
pub struct Vfs {
    filesystems: BTreeMap<String, MountConstructor>,
    root_fs: Option<Arc<dyn FileSystem>>,
    root: Option<Arc<dyn Vnode>>,
    cwd: Option<Arc<dyn Vnode>>,
    cwd_path: String,
    fds: FdTable,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Creates a VFS with an empty registry and nothing mounted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filesystems: BTreeMap::new(),
            root_fs: None,
            root: None,
            cwd: None,
            cwd_path: String::from("/"),
            fds: FdTable::new(),
        }
    }

    /// Registers a filesystem type under `name`. Later registrations of the
    /// same name replace the earlier constructor.
    pub fn register_filesystem(&mut self, name: &str, ctor: MountConstructor) {
        self.filesystems.insert(name.to_string(), ctor);
    }

    /// Mounts `fs_type` built over `device` at `mountpoint`.
    ///
    /// Only `/` is supported as a mountpoint in the core; mounting installs
    /// the filesystem root as VFS root and cwd.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] for an unregistered type,
    /// [`FsError::Unsupported`] for a non-root mountpoint, plus whatever the
    /// constructor reports.
    pub fn mount(&mut self, fs_type: &str, device: &str, mountpoint: &str) -> Result<(), FsError> {
        if mountpoint != "/" {
            return Err(FsError::Unsupported);
        }
        let ctor = self.filesystems.get(fs_type).ok_or(FsError::NotFound)?;
        let fs = ctor(device)?;
        let root = fs.root();
        muon_core::kinfo!("vfs: mounted {} ({}) at /", fs_type, device);
        self.root_fs = Some(fs);
        self.root = Some(root.clone());
        self.cwd = Some(root);
        self.cwd_path = String::from("/");
        Ok(())
    }

    /// Unmounts the root filesystem, dropping all node references.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] when nothing is mounted, plus backend errors.
    pub fn unmount(&mut self) -> Result<(), FsError> {
        let fs = self.root_fs.take().ok_or(FsError::NotFound)?;
        self.root = None;
        self.cwd = None;
        self.cwd_path = String::from("/");
        self.fds = FdTable::new();
        fs.unmount()
    }

    /// Resolves an absolute path to a node.
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidArgument`] for relative paths,
    /// [`FsError::NotFound`] when a component is missing or nothing is
    /// mounted, [`FsError::NotADirectory`] when a non-final component is a
    /// file.
    pub fn resolve(&self, abs_path: &str) -> Result<Arc<dyn Vnode>, FsError> {
        if !path::is_absolute(abs_path) {
            return Err(FsError::InvalidArgument);
        }
        let mut node = self.root.clone().ok_or(FsError::NotFound)?;
        for component in path::components(abs_path) {
            node = node.lookup(component)?;
        }
        Ok(node)
    }

    /// Opens a path, allocating the lowest free descriptor from 3.
    ///
    /// With [`OpenFlags::CREATE`], a missing final component is created as a
    /// regular file in its (existing) parent directory.
    ///
    /// # Errors
    ///
    /// Resolution errors, creation errors, or
    /// [`FsError::TooManyOpenFiles`].
    pub fn open(&mut self, abs_path: &str, flags: OpenFlags) -> Result<Fd, FsError> {
        let node = match self.resolve(abs_path) {
            Ok(node) => node,
            Err(FsError::NotFound) if flags.contains(OpenFlags::CREATE) => {
                let (parent, base) =
                    path::split_parent(abs_path).ok_or(FsError::InvalidArgument)?;
                let parent = self.resolve(parent)?;
                parent.create(base, NodeKind::Regular, Permissions::READ | Permissions::WRITE)?
            }
            Err(e) => return Err(e),
        };
        node.open(flags)?;
        self.fds.open(node, flags)
    }

    /// Closes a descriptor, invoking the node's close hook.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFd`] if the descriptor is not open.
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        let entry = self.fds.close(fd)?;
        entry.node.close();
        Ok(())
    }

    /// Reads from the descriptor's position, advancing it by the count.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFd`], [`FsError::NoAccess`] without
    /// [`OpenFlags::READ`], plus node errors.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let entry = self.fds.get_mut(fd)?;
        if !entry.flags.contains(OpenFlags::READ) {
            return Err(FsError::NoAccess);
        }
        let n = entry.node.read(entry.position, buf)?;
        entry.position += n;
        Ok(n)
    }

    /// Writes at the descriptor's position, advancing it by the count.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFd`], [`FsError::NoAccess`] without
    /// [`OpenFlags::WRITE`], plus node errors.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, FsError> {
        let entry = self.fds.get_mut(fd)?;
        if !entry.flags.contains(OpenFlags::WRITE) {
            return Err(FsError::NoAccess);
        }
        if entry.flags.contains(OpenFlags::APPEND) {
            entry.position = entry.node.size();
        }
        let n = entry.node.write(entry.position, buf)?;
        entry.position += n;
        Ok(n)
    }

    /// Repositions a descriptor. See [`FdTable::seek`].
    ///
    /// # Errors
    ///
    /// As [`FdTable::seek`].
    pub fn seek(&mut self, fd: Fd, offset: i64, whence: SeekFrom) -> Result<usize, FsError> {
        self.fds.seek(fd, offset, whence)
    }

    /// Creates a regular file at an absolute path.
    ///
    /// # Errors
    ///
    /// Resolution and creation errors.
    pub fn create(&mut self, abs_path: &str, perms: Permissions) -> Result<(), FsError> {
        self.create_node(abs_path, NodeKind::Regular, perms)
    }

    /// Creates a directory at an absolute path.
    ///
    /// # Errors
    ///
    /// Resolution and creation errors.
    pub fn mkdir(&mut self, abs_path: &str, perms: Permissions) -> Result<(), FsError> {
        self.create_node(abs_path, NodeKind::Directory, perms)
    }

    fn create_node(
        &mut self,
        abs_path: &str,
        kind: NodeKind,
        perms: Permissions,
    ) -> Result<(), FsError> {
        let (parent, base) = path::split_parent(abs_path).ok_or(FsError::InvalidArgument)?;
        let parent = self.resolve(parent)?;
        parent.create(base, kind, perms)?;
        Ok(())
    }

    /// Removes the entry at an absolute path.
    ///
    /// # Errors
    ///
    /// Resolution errors, [`FsError::DirectoryNotEmpty`].
    pub fn unlink(&mut self, abs_path: &str) -> Result<(), FsError> {
        let (parent, base) = path::split_parent(abs_path).ok_or(FsError::InvalidArgument)?;
        let parent = self.resolve(parent)?;
        parent.unlink(base)
    }

    /// Lists the entries of the directory at an absolute path.
    ///
    /// # Errors
    ///
    /// Resolution errors, [`FsError::NotADirectory`].
    pub fn list_directory(&self, abs_path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.resolve(abs_path)?.readdir()
    }

    /// Changes the current directory.
    ///
    /// Relative paths are joined onto the cwd; `.` and `..` resolve; the
    /// stored path keeps no trailing slash except for `/` itself.
    ///
    /// # Errors
    ///
    /// Resolution errors, [`FsError::NotADirectory`] for files.
    pub fn chdir(&mut self, path_arg: &str) -> Result<(), FsError> {
        let full = path::join(&self.cwd_path, path_arg);
        let node = self.resolve(&full)?;
        if node.kind() != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        self.cwd = Some(node);
        self.cwd_path = full;
        Ok(())
    }

    /// The current directory's absolute path.
    #[must_use]
    pub fn cwd_path(&self) -> &str {
        &self.cwd_path
    }

    /// The current directory node.
    pub fn cwd(&self) -> Option<Arc<dyn Vnode>> {
        self.cwd.clone()
    }

    /// Statistics of the root filesystem.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] when nothing is mounted.
    pub fn statfs(&self) -> Result<FsStats, FsError> {
        self.root_fs.as_ref().ok_or(FsError::NotFound)?.stats()
    }
}

// ---------------------------------------------------------------------------
// Global VFS instance
// ---------------------------------------------------------------------------

/// Global VFS, populated by the kernel at boot.
static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// Initializes the global VFS.
///
/// # Panics
///
/// Panics when called twice.
pub fn init() {
    let mut vfs = VFS.lock();
    assert!(vfs.is_none(), "VFS already initialized");
    *vfs = Some(Vfs::new());
}

/// Runs a closure with mutable access to the global VFS.
///
/// # Panics
///
/// Panics if [`init`] has not been called.
pub fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut vfs = VFS.lock();
    f(vfs.as_mut().expect("VFS not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockDevice, RamDisk};
    use crate::tinyfs::TinyFs;

    /// A VFS with tinyfs registered over one shared RAM disk.
    fn vfs_with_tinyfs() -> (Vfs, Arc<RamDisk>) {
        let disk = RamDisk::new(256);
        let mut vfs = Vfs::new();
        let dev = disk.clone();
        vfs.register_filesystem(
            "tinyfs",
            Box::new(move |_device| {
                Ok(TinyFs::mount_or_format(dev.clone() as Arc<dyn BlockDevice>)?
                    as Arc<dyn FileSystem>)
            }),
        );
        vfs.mount("tinyfs", "ram0", "/").unwrap();
        (vfs, disk)
    }

    #[test]
    fn resolve_root_returns_the_root_directory() {
        let (vfs, _disk) = vfs_with_tinyfs();
        let root = vfs.resolve("/").unwrap();
        assert_eq!(root.kind(), NodeKind::Directory);
        assert_eq!(root.inode(), 0);
    }

    #[test]
    fn relative_paths_are_rejected_by_resolve() {
        let (vfs, _disk) = vfs_with_tinyfs();
        assert_eq!(vfs.resolve("etc").err(), Some(FsError::InvalidArgument));
    }

    #[test]
    fn mkdir_create_write_read_round_trip() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        vfs.mkdir("/d", Permissions::all()).unwrap();
        vfs.create("/d/f", Permissions::all()).unwrap();

        let free_before = vfs.statfs().unwrap().free_blocks;

        let fd = vfs.open("/d/f", OpenFlags::WRITE).unwrap();
        assert_eq!(vfs.write(fd, b"hello").unwrap(), 5);
        vfs.close(fd).unwrap();

        let fd = vfs.open("/d/f", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        vfs.close(fd).unwrap();

        // Five bytes cost exactly one data block.
        assert_eq!(vfs.statfs().unwrap().free_blocks, free_before - 1);
    }

    #[test]
    fn write_seek_read_law() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        let fd = vfs
            .open("/law", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();

        let payload = b"round-trip payload";
        assert_eq!(vfs.write(fd, payload).unwrap(), payload.len());
        assert_eq!(vfs.seek(fd, 0, SeekFrom::Set).unwrap(), 0);

        let mut back = [0u8; 18];
        assert_eq!(vfs.read(fd, &mut back).unwrap(), payload.len());
        assert_eq!(&back, payload);
    }

    #[test]
    fn open_create_makes_missing_files_only_with_the_flag() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        assert_eq!(
            vfs.open("/missing", OpenFlags::READ).err(),
            Some(FsError::NotFound)
        );
        let fd = vfs
            .open("/missing", OpenFlags::READ | OpenFlags::CREATE)
            .unwrap();
        vfs.close(fd).unwrap();
        assert!(vfs.resolve("/missing").is_ok());
    }

    #[test]
    fn access_flags_are_enforced() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        let fd = vfs
            .open("/f", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(vfs.read(fd, &mut buf).err(), Some(FsError::NoAccess));
        vfs.close(fd).unwrap();

        let fd = vfs.open("/f", OpenFlags::READ).unwrap();
        assert_eq!(vfs.write(fd, b"x").err(), Some(FsError::NoAccess));
    }

    #[test]
    fn append_writes_land_at_the_end() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        let fd = vfs
            .open("/log", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        vfs.write(fd, b"one").unwrap();
        vfs.close(fd).unwrap();

        let fd = vfs
            .open("/log", OpenFlags::WRITE | OpenFlags::APPEND)
            .unwrap();
        vfs.write(fd, b"two").unwrap();
        vfs.close(fd).unwrap();

        let fd = vfs.open("/log", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"onetwo");
    }

    #[test]
    fn seek_past_eof_then_read_returns_zero() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        let fd = vfs
            .open("/f", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        vfs.write(fd, b"data").unwrap();

        assert_eq!(vfs.seek(fd, 10, SeekFrom::End).unwrap(), 14);
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn created_paths_resolve_and_appear_in_readdir() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        vfs.mkdir("/dir", Permissions::all()).unwrap();
        vfs.create("/dir/leaf", Permissions::all()).unwrap();

        assert!(vfs.resolve("/dir/leaf").is_ok());
        let entries = vfs.list_directory("/dir").unwrap();
        assert!(entries.iter().any(|e| e.name == "leaf"));
    }

    #[test]
    fn create_unlink_create_is_idempotent() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        vfs.create("/p", Permissions::all()).unwrap();
        vfs.unlink("/p").unwrap();
        vfs.create("/p", Permissions::all()).unwrap();
        assert!(vfs.resolve("/p").is_ok());
    }

    #[test]
    fn chdir_tracks_node_and_normalised_path() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        vfs.mkdir("/d", Permissions::all()).unwrap();
        vfs.create("/d/file", Permissions::all()).unwrap();

        // Relative chdir from the root.
        vfs.chdir("d").unwrap();
        assert_eq!(vfs.cwd_path(), "/d");

        // Trailing slash is normalised away.
        vfs.chdir("/d/").unwrap();
        assert_eq!(vfs.cwd_path(), "/d");

        // A file is not a directory.
        assert_eq!(vfs.chdir("file").err(), Some(FsError::NotADirectory));
        assert_eq!(vfs.cwd_path(), "/d");

        // Dot-dot climbs back to the root.
        vfs.chdir("..").unwrap();
        assert_eq!(vfs.cwd_path(), "/");
    }

    #[test]
    fn unknown_fs_type_and_non_root_mountpoints_fail() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        assert_eq!(
            vfs.mount("ext9", "ram0", "/").err(),
            Some(FsError::NotFound)
        );
        assert_eq!(
            vfs.mount("tinyfs", "ram0", "/mnt").err(),
            Some(FsError::Unsupported)
        );
    }

    #[test]
    fn remount_after_unmount_succeeds_and_fresh_device_is_empty() {
        let (mut vfs, _disk) = vfs_with_tinyfs();
        vfs.create("/kept", Permissions::all()).unwrap();
        vfs.unmount().unwrap();
        assert_eq!(vfs.resolve("/").err(), Some(FsError::NotFound));

        // Same device: contents persist for the session.
        vfs.mount("tinyfs", "ram0", "/").unwrap();
        assert!(vfs.resolve("/kept").is_ok());

        // A brand-new device synthesises an empty filesystem.
        let mut other = Vfs::new();
        other.register_filesystem(
            "tinyfs",
            Box::new(|_| {
                Ok(TinyFs::mount_or_format(RamDisk::new(128) as Arc<dyn BlockDevice>)?
                    as Arc<dyn FileSystem>)
            }),
        );
        other.mount("tinyfs", "ram1", "/").unwrap();
        assert!(other.list_directory("/").unwrap().is_empty());
    }
}
