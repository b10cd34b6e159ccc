//! File descriptors and the descriptor table.
//!
//! A fixed table of 256 entries indexed directly by descriptor number.
//! Descriptors 0–2 are reserved for the console layer; `open` hands out the
//! lowest free descriptor from 3 upward.

use alloc::sync::Arc;

use bitflags::bitflags;
use muon_core::id::Fd;

use crate::{FsError, Vnode};

/// Size of the descriptor table.
pub const MAX_OPEN_FILES: usize = 256;

bitflags! {
    /// Flags for opening a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 0b0001;
        /// Open for writing.
        const WRITE = 0b0010;
        /// All writes go to the end of the file.
        const APPEND = 0b0100;
        /// Create the file if it does not exist.
        const CREATE = 0b1000;
    }
}

/// Origin for [`FdTable::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    /// Absolute offset from the start.
    Set,
    /// Relative to the current position.
    Cur,
    /// Relative to the end of the file.
    End,
}

/// An open file: node reference, position, and the flags it was opened with.
pub struct OpenFile {
    /// The node, shared with the owning filesystem.
    pub node: Arc<dyn Vnode>,
    /// Byte offset for the next read or write.
    pub position: usize,
    /// Flags from `open`.
    pub flags: OpenFlags,
}

/// Fixed-size descriptor table.
pub struct FdTable {
    slots: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_OPEN_FILES],
        }
    }

    /// Records an open node in the lowest free user descriptor (>= 3).
    ///
    /// # Errors
    ///
    /// Returns [`FsError::TooManyOpenFiles`] when the table is full.
    pub fn open(&mut self, node: Arc<dyn Vnode>, flags: OpenFlags) -> Result<Fd, FsError> {
        let start = Fd::FIRST_USER.as_usize();
        let idx = (start..MAX_OPEN_FILES)
            .find(|&i| self.slots[i].is_none())
            .ok_or(FsError::TooManyOpenFiles)?;
        self.slots[idx] = Some(OpenFile {
            node,
            position: 0,
            flags,
        });
        Ok(Fd::new(idx as u32))
    }

    /// Releases a descriptor, returning the entry for its close hook.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::BadFd`] if the descriptor is not open.
    pub fn close(&mut self, fd: Fd) -> Result<OpenFile, FsError> {
        let slot = self
            .slots
            .get_mut(fd.as_usize())
            .ok_or(FsError::BadFd)?;
        slot.take().ok_or(FsError::BadFd)
    }

    /// Shared access to an open entry.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::BadFd`] if the descriptor is not open.
    pub fn get(&self, fd: Fd) -> Result<&OpenFile, FsError> {
        self.slots
            .get(fd.as_usize())
            .and_then(Option::as_ref)
            .ok_or(FsError::BadFd)
    }

    /// Mutable access to an open entry.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::BadFd`] if the descriptor is not open.
    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFile, FsError> {
        self.slots
            .get_mut(fd.as_usize())
            .and_then(Option::as_mut)
            .ok_or(FsError::BadFd)
    }

    /// Computes and stores a new position for `fd`.
    ///
    /// The position may exceed the file size; subsequent reads simply return
    /// 0 until a write extends the file.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFd`] for a closed descriptor,
    /// [`FsError::InvalidArgument`] when the result would be negative.
    pub fn seek(&mut self, fd: Fd, offset: i64, whence: SeekFrom) -> Result<usize, FsError> {
        let entry = self.get_mut(fd)?;
        let base = match whence {
            SeekFrom::Set => 0,
            SeekFrom::Cur => entry.position as i64,
            SeekFrom::End => entry.node.size() as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(FsError::InvalidArgument);
        }
        entry.position = target as usize;
        Ok(entry.position)
    }
}
