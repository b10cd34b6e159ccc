//! TinyFS: a flat-ish FAT-chained filesystem on a 512-byte block device.
//!
//! On-medium layout (all integers little-endian):
//!
//! ```text
//! block 0              superblock (24 bytes, rest zero)
//! fat_start..dir_start FAT, one u32 per block; 0 = free, 0xFFFF_FFFF = EOF
//! dir_start..data_start 256 directory entries, 48 bytes each
//! data_start..total    data blocks
//! ```
//!
//! Directory structure is encoded in the entries themselves: every entry
//! names its parent by inode. The root is virtual (inode 0, not stored);
//! entry `i` has inode `i + 1`. First data blocks are allocated lazily on
//! the first write, so a fresh file occupies no data blocks at all.
//!
//! The whole FAT and entry table live in memory while mounted and are
//! written through to the device after every mutation, so a later mount in
//! the same session sees everything.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;

use muon_core::sync::SpinLock;

use crate::block::{BLOCK_SIZE, BlockDevice};
use crate::{DirEntry, FileSystem, FsError, FsStats, NodeKind, Permissions, Vnode};

/// "TINY" in big-endian ASCII.
pub const TINYFS_MAGIC: u32 = 0x5449_4E59;

/// Maximum directory entries.
pub const MAX_FILES: usize = 256;

/// Maximum blocks the FAT can describe.
pub const MAX_FAT_ENTRIES: usize = 1024;

/// Maximum file-name length (one byte is kept for the NUL of the on-disk
/// fixed-size field).
pub const MAX_NAME_LEN: usize = 31;

const FAT_FREE: u32 = 0;
const FAT_EOF: u32 = 0xFFFF_FFFF;
const DIRENT_SIZE: usize = 48;
const SUPERBLOCK_SIZE: usize = 24;

const DIR_BLOCKS: u32 = ((MAX_FILES * DIRENT_SIZE) as u32).div_ceil(BLOCK_SIZE as u32);

/// The 24-byte superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Superblock {
    magic: u32,
    total_blocks: u32,
    fat_start: u32,
    dir_start: u32,
    data_start: u32,
    free_blocks: u32,
}

impl Superblock {
    fn encode(self, out: &mut [u8; BLOCK_SIZE]) {
        out.fill(0);
        for (i, field) in [
            self.magic,
            self.total_blocks,
            self.fat_start,
            self.dir_start,
            self.data_start,
            self.free_blocks,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&field.to_le_bytes());
        }
    }

    fn decode(block: &[u8; BLOCK_SIZE]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([block[i * 4], block[i * 4 + 1], block[i * 4 + 2], block[i * 4 + 3]])
        };
        Self {
            magic: word(0),
            total_blocks: word(1),
            fat_start: word(2),
            dir_start: word(3),
            data_start: word(4),
            free_blocks: word(5),
        }
    }
}

muon_core::static_assert!(SUPERBLOCK_SIZE == 24);

/// One 48-byte directory entry.
#[derive(Debug, Clone, Copy)]
struct Dirent {
    name: [u8; 32],
    first_block: u32,
    size: u32,
    is_directory: bool,
    used: bool,
    parent_inode: u32,
}

impl Dirent {
    const fn empty() -> Self {
        Self {
            name: [0; 32],
            first_block: 0,
            size: 0,
            is_directory: false,
            used: false,
            parent_inode: 0,
        }
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(32);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn encode(&self, out: &mut [u8]) {
        out[..32].copy_from_slice(&self.name);
        out[32..36].copy_from_slice(&self.first_block.to_le_bytes());
        out[36..40].copy_from_slice(&self.size.to_le_bytes());
        out[40] = u8::from(self.is_directory);
        out[41] = u8::from(self.used);
        out[42..46].copy_from_slice(&self.parent_inode.to_le_bytes());
        out[46] = 0;
        out[47] = 0;
    }

    fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; 32];
        name.copy_from_slice(&raw[..32]);
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            name,
            first_block: word(32),
            size: word(36),
            is_directory: raw[40] != 0,
            used: raw[41] != 0,
            parent_inode: word(42),
        }
    }
}

/// In-memory filesystem state, mirrored to the device after mutations.
struct State {
    sb: Superblock,
    fat: Vec<u32>,
    dirents: Vec<Dirent>,
}

impl State {
    /// Free data blocks, computed from the FAT.
    fn count_free(&self) -> u32 {
        self.fat[self.sb.data_start as usize..]
            .iter()
            .filter(|&&e| e == FAT_FREE)
            .count() as u32
    }

    /// Claims one free data block, marking it end-of-chain.
    fn alloc_block(&mut self) -> Result<u32, FsError> {
        let start = self.sb.data_start as usize;
        let idx = self.fat[start..]
            .iter()
            .position(|&e| e == FAT_FREE)
            .ok_or(FsError::NoSpace)?;
        let block = (start + idx) as u32;
        self.fat[block as usize] = FAT_EOF;
        self.sb.free_blocks -= 1;
        Ok(block)
    }

    /// Frees every block of a chain.
    fn free_chain(&mut self, first: u32) {
        let mut block = first;
        while block != FAT_FREE && block != FAT_EOF && (block as usize) < self.fat.len() {
            let next = self.fat[block as usize];
            self.fat[block as usize] = FAT_FREE;
            self.sb.free_blocks += 1;
            block = next;
        }
    }

    fn find_child(&self, parent_inode: u32, name: &str) -> Option<usize> {
        self.dirents
            .iter()
            .position(|d| d.used && d.parent_inode == parent_inode && d.name_str() == name)
    }
}

/// A mounted TinyFS instance.
pub struct TinyFs {
    dev: Arc<dyn BlockDevice>,
    state: SpinLock<State>,
    me: Weak<TinyFs>,
}

impl TinyFs {
    /// Writes a fresh, empty filesystem onto `dev`.
    ///
    /// # Errors
    ///
    /// [`FsError::NoSpace`] if the device is too small to hold the metadata
    /// plus at least one data block, plus any device I/O error.
    pub fn format(dev: &Arc<dyn BlockDevice>) -> Result<(), FsError> {
        let total = dev.block_count().min(MAX_FAT_ENTRIES as u32);
        let fat_blocks = (total * 4).div_ceil(BLOCK_SIZE as u32);
        let fat_start = 1;
        let dir_start = fat_start + fat_blocks;
        let data_start = dir_start + DIR_BLOCKS;
        if data_start >= total {
            return Err(FsError::NoSpace);
        }

        let state = State {
            sb: Superblock {
                magic: TINYFS_MAGIC,
                total_blocks: total,
                fat_start,
                dir_start,
                data_start,
                free_blocks: total - data_start,
            },
            fat: vec![FAT_FREE; total as usize],
            dirents: vec![Dirent::empty(); MAX_FILES],
        };
        write_meta(dev.as_ref(), &state)
    }

    /// Mounts an existing filesystem.
    ///
    /// # Errors
    ///
    /// [`FsError::Corruption`] when the magic or geometry fail validation,
    /// plus any device I/O error.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Arc<Self>, FsError> {
        let mut block = [0u8; BLOCK_SIZE];
        dev.read_block(0, &mut block)?;
        let sb = Superblock::decode(&block);

        if sb.magic != TINYFS_MAGIC {
            muon_core::kerr!("tinyfs: bad magic {:#010x}", sb.magic);
            return Err(FsError::Corruption);
        }
        if sb.total_blocks > dev.block_count()
            || sb.total_blocks as usize > MAX_FAT_ENTRIES
            || sb.fat_start == 0
            || sb.fat_start >= sb.dir_start
            || sb.dir_start >= sb.data_start
            || sb.data_start >= sb.total_blocks
        {
            muon_core::kerr!("tinyfs: implausible geometry, refusing mount");
            return Err(FsError::Corruption);
        }

        // Load the FAT.
        let mut fat = Vec::with_capacity(sb.total_blocks as usize);
        'fat: for b in sb.fat_start..sb.dir_start {
            dev.read_block(b, &mut block)?;
            for chunk in block.chunks_exact(4) {
                fat.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                if fat.len() == sb.total_blocks as usize {
                    break 'fat;
                }
            }
        }

        // Load the directory entries.
        let mut dirents = Vec::with_capacity(MAX_FILES);
        'dir: for b in sb.dir_start..sb.data_start {
            dev.read_block(b, &mut block)?;
            for raw in block.chunks_exact(DIRENT_SIZE) {
                dirents.push(Dirent::decode(raw));
                if dirents.len() == MAX_FILES {
                    break 'dir;
                }
            }
        }

        Ok(Arc::new_cyclic(|me| Self {
            dev,
            state: SpinLock::new(State { sb, fat, dirents }),
            me: me.clone(),
        }))
    }

    /// Mounts `dev`, formatting it first when it is blank (all-zero magic,
    /// the RAM-disk case). A device with a non-zero, non-TinyFS magic is
    /// still refused as corrupt.
    ///
    /// # Errors
    ///
    /// As [`mount`](Self::mount) and [`format`](Self::format).
    pub fn mount_or_format(dev: Arc<dyn BlockDevice>) -> Result<Arc<Self>, FsError> {
        let mut block = [0u8; BLOCK_SIZE];
        dev.read_block(0, &mut block)?;
        if Superblock::decode(&block).magic == 0 {
            Self::format(&dev)?;
        }
        Self::mount(dev)
    }

    /// Builds a node handle for an inode.
    fn node(&self, inode: u32) -> Arc<dyn Vnode> {
        let fs = self.me.upgrade().expect("filesystem alive while nodes exist");
        Arc::new(TinyNode { fs, inode })
    }

    fn flush(&self, state: &State) -> Result<(), FsError> {
        write_meta(self.dev.as_ref(), state)
    }

    // ── per-inode operations ────────────────────────────────────────────

    fn kind_of(&self, inode: u32) -> NodeKind {
        if inode == 0 {
            return NodeKind::Directory;
        }
        let state = self.state.lock();
        match state.dirents.get(inode as usize - 1) {
            Some(d) if d.used && d.is_directory => NodeKind::Directory,
            _ => NodeKind::Regular,
        }
    }

    fn size_of(&self, inode: u32) -> usize {
        if inode == 0 {
            return 0;
        }
        let state = self.state.lock();
        state
            .dirents
            .get(inode as usize - 1)
            .filter(|d| d.used)
            .map_or(0, |d| d.size as usize)
    }

    fn read_at(&self, inode: u32, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let state = self.state.lock();
        let d = entry(&state, inode)?;
        if d.is_directory {
            return Err(FsError::IsADirectory);
        }

        let size = d.size as usize;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(size - offset);

        let mut block = d.first_block;
        let mut block_idx = 0usize;
        let first_needed = offset / BLOCK_SIZE;
        let mut copied = 0usize;
        let mut tmp = [0u8; BLOCK_SIZE];

        while copied < want && block != FAT_FREE && block != FAT_EOF {
            if block_idx >= first_needed {
                self.dev.read_block(block, &mut tmp)?;
                let in_off = if block_idx == first_needed {
                    offset % BLOCK_SIZE
                } else {
                    0
                };
                let take = (BLOCK_SIZE - in_off).min(want - copied);
                buf[copied..copied + take].copy_from_slice(&tmp[in_off..in_off + take]);
                copied += take;
            }
            block = state.fat[block as usize];
            block_idx += 1;
        }

        Ok(copied)
    }

    fn write_at(&self, inode: u32, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        let d = entry(&state, inode)?;
        if d.is_directory {
            return Err(FsError::IsADirectory);
        }
        let idx = inode as usize - 1;

        let end = offset + data.len();
        let blocks_needed = end.div_ceil(BLOCK_SIZE);
        ensure_chain(self.dev.as_ref(), &mut state, idx, blocks_needed)?;

        // Walk the chain once, patching every block the write touches.
        let first_needed = offset / BLOCK_SIZE;
        let last_needed = (end - 1) / BLOCK_SIZE;
        let mut block = state.dirents[idx].first_block;
        let mut tmp = [0u8; BLOCK_SIZE];
        for block_idx in 0..=last_needed {
            if block_idx >= first_needed {
                let blk_start = block_idx * BLOCK_SIZE;
                let from = offset.max(blk_start);
                let to = end.min(blk_start + BLOCK_SIZE);
                if to - from == BLOCK_SIZE {
                    tmp.fill(0);
                } else {
                    self.dev.read_block(block, &mut tmp)?;
                }
                tmp[from - blk_start..to - blk_start]
                    .copy_from_slice(&data[from - offset..to - offset]);
                self.dev.write_block(block, &tmp)?;
            }
            block = state.fat[block as usize];
        }

        if end as u32 > state.dirents[idx].size {
            state.dirents[idx].size = end as u32;
        }
        self.flush(&state)?;
        Ok(data.len())
    }

    fn lookup_child(&self, dir_inode: u32, name: &str) -> Result<u32, FsError> {
        if self.kind_of(dir_inode) != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let state = self.state.lock();
        state
            .find_child(dir_inode, name)
            .map(|i| i as u32 + 1)
            .ok_or(FsError::NotFound)
    }

    fn children(&self, dir_inode: u32) -> Result<Vec<DirEntry>, FsError> {
        if self.kind_of(dir_inode) != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let state = self.state.lock();
        Ok(state
            .dirents
            .iter()
            .filter(|d| d.used && d.parent_inode == dir_inode)
            .map(|d| DirEntry {
                name: String::from(d.name_str()),
                kind: if d.is_directory {
                    NodeKind::Directory
                } else {
                    NodeKind::Regular
                },
                size: d.size,
            })
            .collect())
    }

    fn create_entry(&self, dir_inode: u32, name: &str, kind: NodeKind) -> Result<u32, FsError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') {
            return Err(FsError::InvalidArgument);
        }
        let is_directory = match kind {
            NodeKind::Directory => true,
            NodeKind::Regular => false,
            _ => return Err(FsError::Unsupported),
        };
        if self.kind_of(dir_inode) != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }

        let mut state = self.state.lock();
        if state.find_child(dir_inode, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = state
            .dirents
            .iter()
            .position(|d| !d.used)
            .ok_or(FsError::NoSpace)?;

        let mut d = Dirent::empty();
        d.name[..name.len()].copy_from_slice(name.as_bytes());
        d.is_directory = is_directory;
        d.used = true;
        d.parent_inode = dir_inode;
        // First data block stays 0 until the first write.
        state.dirents[slot] = d;
        self.flush(&state)?;
        Ok(slot as u32 + 1)
    }

    fn unlink_entry(&self, dir_inode: u32, name: &str) -> Result<(), FsError> {
        if self.kind_of(dir_inode) != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut state = self.state.lock();
        let idx = state
            .find_child(dir_inode, name)
            .ok_or(FsError::NotFound)?;

        let inode = idx as u32 + 1;
        if state.dirents[idx].is_directory
            && state.dirents.iter().any(|d| d.used && d.parent_inode == inode)
        {
            return Err(FsError::DirectoryNotEmpty);
        }

        let first = state.dirents[idx].first_block;
        state.free_chain(first);
        state.dirents[idx] = Dirent::empty();
        self.flush(&state)?;
        Ok(())
    }
}

impl FileSystem for TinyFs {
    fn name(&self) -> &'static str {
        "tinyfs"
    }

    fn root(&self) -> Arc<dyn Vnode> {
        self.node(0)
    }

    fn stats(&self) -> Result<FsStats, FsError> {
        let state = self.state.lock();
        Ok(FsStats {
            total_blocks: state.sb.total_blocks,
            free_blocks: state.count_free(),
            block_size: BLOCK_SIZE as u32,
        })
    }

    fn unmount(&self) -> Result<(), FsError> {
        let state = self.state.lock();
        self.flush(&state)
    }
}

/// Looks up a live file entry, copying it out of the lock.
fn entry(state: &State, inode: u32) -> Result<Dirent, FsError> {
    if inode == 0 {
        // The root is virtual; it has no dirent and no bytes.
        return Err(FsError::IsADirectory);
    }
    state
        .dirents
        .get(inode as usize - 1)
        .filter(|d| d.used)
        .copied()
        .ok_or(FsError::NotFound)
}

/// Extends (or starts) a file's chain to at least `blocks_needed` blocks.
/// Fresh blocks are zeroed on the device so write gaps read back as zero.
fn ensure_chain(
    dev: &dyn BlockDevice,
    state: &mut State,
    idx: usize,
    blocks_needed: usize,
) -> Result<(), FsError> {
    let mut have = 0usize;
    let mut last = FAT_FREE;
    let mut block = state.dirents[idx].first_block;
    while block != FAT_FREE && block != FAT_EOF {
        have += 1;
        last = block;
        block = state.fat[block as usize];
    }

    let missing = blocks_needed.saturating_sub(have);
    if missing == 0 {
        return Ok(());
    }
    // All-or-nothing: refuse before touching the FAT.
    if state.count_free() < missing as u32 {
        return Err(FsError::NoSpace);
    }

    let zero = [0u8; BLOCK_SIZE];
    for _ in 0..missing {
        let fresh = state.alloc_block()?;
        dev.write_block(fresh, &zero)?;
        if last == FAT_FREE {
            state.dirents[idx].first_block = fresh;
        } else {
            state.fat[last as usize] = fresh;
        }
        last = fresh;
    }
    Ok(())
}

/// Writes superblock, FAT, and directory entries back to the device.
fn write_meta(dev: &dyn BlockDevice, state: &State) -> Result<(), FsError> {
    let mut block = [0u8; BLOCK_SIZE];
    state.sb.encode(&mut block);
    dev.write_block(0, &block)?;

    // FAT blocks.
    let per_block = BLOCK_SIZE / 4;
    for (n, b) in (state.sb.fat_start..state.sb.dir_start).enumerate() {
        block.fill(0);
        for i in 0..per_block {
            let entry_idx = n * per_block + i;
            if entry_idx >= state.fat.len() {
                break;
            }
            block[i * 4..i * 4 + 4].copy_from_slice(&state.fat[entry_idx].to_le_bytes());
        }
        dev.write_block(b, &block)?;
    }

    // Directory blocks.
    let dirents_per_block = BLOCK_SIZE / DIRENT_SIZE;
    for (n, b) in (state.sb.dir_start..state.sb.data_start).enumerate() {
        block.fill(0);
        for i in 0..dirents_per_block {
            let entry_idx = n * dirents_per_block + i;
            if entry_idx >= state.dirents.len() {
                break;
            }
            state.dirents[entry_idx].encode(&mut block[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE]);
        }
        dev.write_block(b, &block)?;
    }
    Ok(())
}

/// A node handle into a [`TinyFs`].
struct TinyNode {
    fs: Arc<TinyFs>,
    inode: u32,
}

impl Vnode for TinyNode {
    fn kind(&self) -> NodeKind {
        self.fs.kind_of(self.inode)
    }

    fn size(&self) -> usize {
        self.fs.size_of(self.inode)
    }

    fn permissions(&self) -> Permissions {
        Permissions::READ | Permissions::WRITE
    }

    fn inode(&self) -> u32 {
        self.inode
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        self.fs.read_at(self.inode, offset, buf)
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        self.fs.write_at(self.inode, offset, buf)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Vnode>, FsError> {
        let inode = self.fs.lookup_child(self.inode, name)?;
        Ok(self.fs.node(inode))
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        self.fs.children(self.inode)
    }

    fn create(
        &self,
        name: &str,
        kind: NodeKind,
        _perms: Permissions,
    ) -> Result<Arc<dyn Vnode>, FsError> {
        let inode = self.fs.create_entry(self.inode, name, kind)?;
        Ok(self.fs.node(inode))
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        self.fs.unlink_entry(self.inode, name)
    }
}
