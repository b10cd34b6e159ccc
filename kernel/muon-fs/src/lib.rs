//! Virtual filesystem layer.
//!
//! Filesystems implement [`FileSystem`] and hand out [`Vnode`] trait objects;
//! the VFS in [`vfs`] owns only non-owning `Arc` references, path state, and
//! the file-descriptor table. Backends own their nodes and whatever private
//! state the nodes need — there are no back-pointers from the VFS into
//! filesystem internals.
//!
//! All operations are synchronous: the kernel is cooperative, so an op either
//! completes against in-memory state or performs bounded block-device I/O.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

pub mod block;
pub mod file;
pub mod path;
pub mod tinyfs;
pub mod vfs;

/// Filesystem error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path component, filesystem type, or entry not present.
    NotFound,
    /// Bad path, bad descriptor, or malformed argument.
    InvalidArgument,
    /// Directory operation attempted on a non-directory.
    NotADirectory,
    /// Byte I/O attempted on a directory.
    IsADirectory,
    /// Directory must be empty to be unlinked.
    DirectoryNotEmpty,
    /// An entry with that name already exists.
    AlreadyExists,
    /// No free blocks or table slots in the filesystem.
    NoSpace,
    /// File descriptor is not open.
    BadFd,
    /// The descriptor table is full.
    TooManyOpenFiles,
    /// Open flags do not permit the operation.
    NoAccess,
    /// On-medium structures failed validation (bad magic, broken chain).
    Corruption,
    /// Operation not supported by this filesystem or mount configuration.
    Unsupported,
    /// The underlying block device failed.
    IoError,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::NotFound => "not found",
            Self::InvalidArgument => "invalid argument",
            Self::NotADirectory => "not a directory",
            Self::IsADirectory => "is a directory",
            Self::DirectoryNotEmpty => "directory not empty",
            Self::AlreadyExists => "already exists",
            Self::NoSpace => "no space left on device",
            Self::BadFd => "bad file descriptor",
            Self::TooManyOpenFiles => "too many open files",
            Self::NoAccess => "access denied",
            Self::Corruption => "filesystem corruption detected",
            Self::Unsupported => "operation not supported",
            Self::IoError => "I/O error",
        };
        write!(f, "{msg}")
    }
}

/// What kind of object a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Character device.
    CharDev,
    /// Block device.
    BlockDev,
    /// Pipe endpoint.
    Pipe,
    /// Symbolic link.
    Symlink,
    /// Mount point placeholder.
    Mountpoint,
}

bitflags! {
    /// Node permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// Readable.
        const READ = 0b001;
        /// Writable.
        const WRITE = 0b010;
        /// Executable / searchable.
        const EXEC = 0b100;
    }
}

/// One directory listing entry. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (a single path component).
    pub name: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Size in bytes (zero for directories).
    pub size: u32,
}

/// Filesystem statistics, as reported by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    /// Total blocks on the medium.
    pub total_blocks: u32,
    /// Blocks not referenced by any chain.
    pub free_blocks: u32,
    /// Block size in bytes.
    pub block_size: u32,
}

/// A filesystem object: file, directory, or device node.
///
/// Byte I/O takes an explicit offset; the descriptor table tracks positions.
/// Directory methods fail with [`FsError::NotADirectory`] /
/// [`FsError::IsADirectory`] when called on the wrong kind.
pub trait Vnode: Send + Sync {
    /// Node kind.
    fn kind(&self) -> NodeKind;

    /// Current size in bytes.
    fn size(&self) -> usize;

    /// Permission bits.
    fn permissions(&self) -> Permissions;

    /// Inode number within the owning filesystem.
    fn inode(&self) -> u32;

    /// Hook invoked by `open`; most filesystems need nothing here.
    ///
    /// # Errors
    ///
    /// Backend-specific refusal to open.
    fn open(&self, _flags: file::OpenFlags) -> Result<(), FsError> {
        Ok(())
    }

    /// Hook invoked by `close`.
    fn close(&self) {}

    /// Reads up to `buf.len()` bytes at `offset`. Returns the byte count;
    /// reading at or past EOF returns 0.
    ///
    /// # Errors
    ///
    /// [`FsError::IsADirectory`] on directories, or backend I/O failures.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes `buf` at `offset`, extending the file as needed. Returns the
    /// byte count.
    ///
    /// # Errors
    ///
    /// [`FsError::IsADirectory`] on directories, [`FsError::NoSpace`] when
    /// the filesystem is full, or backend I/O failures.
    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError>;

    /// Finds a child by name.
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`] on non-directories, [`FsError::NotFound`]
    /// when no child matches.
    fn lookup(&self, name: &str) -> Result<Arc<dyn Vnode>, FsError>;

    /// Lists the children. The returned entries are caller-owned.
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`] on non-directories.
    fn readdir(&self) -> Result<Vec<DirEntry>, FsError>;

    /// Creates a child entry.
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`], [`FsError::AlreadyExists`], or
    /// [`FsError::NoSpace`].
    fn create(
        &self,
        name: &str,
        kind: NodeKind,
        perms: Permissions,
    ) -> Result<Arc<dyn Vnode>, FsError>;

    /// Removes a child entry, freeing its data blocks.
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`], [`FsError::NotFound`], or
    /// [`FsError::DirectoryNotEmpty`].
    fn unlink(&self, name: &str) -> Result<(), FsError>;
}

/// A mounted filesystem instance.
pub trait FileSystem: Send + Sync {
    /// Short type name ("tinyfs").
    fn name(&self) -> &'static str;

    /// The root directory node, owned by the filesystem.
    fn root(&self) -> Arc<dyn Vnode>;

    /// Filesystem statistics.
    ///
    /// # Errors
    ///
    /// Backend-specific failures.
    fn stats(&self) -> Result<FsStats, FsError>;

    /// Flushes state and detaches from the device.
    ///
    /// # Errors
    ///
    /// Backend-specific failures.
    fn unmount(&self) -> Result<(), FsError> {
        Ok(())
    }
}
