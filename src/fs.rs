//! Volume assembly, the file engine and the public API
//!
//! [`FileSystem`] bundles what every operation needs: the device, the
//! parsed layout and the FAT manager. [`Volume`] adds the open-file arena
//! and carries the public operations; one `Volume` is one mounted
//! filesystem with a single writer. [`FatFilesystem`] wraps a volume in a
//! lock so the surface can be shared, mirroring the host-lock contract.
//!
//! Metadata ordering inside one call is fixed: clusters are allocated and
//! stitched in the FAT first, the directory entry is written last; on
//! close the data flush precedes the directory length update; on remove
//! the chain is freed before the entry is deleted. A power cut between
//! those steps loses clusters but never corrupts a name.

use crate::bpb::BiosParameterBlock;
use crate::device::BlockDevice;
use crate::dir::{Dir, DirEntryInfo};
use crate::fat::FatTable;
use crate::file::{
    decode_mode, FileHandle, Whence, FILE_APPEND, FILE_CREATE, FILE_READ, FILE_WRITE,
};
use crate::handle::HandleTable;
use crate::{
    create_sfn, path, sfn_with_tail, Error, Result, END_OF_CHAIN, INVALID_CLUSTER, SECTOR_SIZE,
};

use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Opaque index of an open file in the handle arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub(crate) usize);

pub struct FileSystem {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) bpb: BiosParameterBlock,
    pub(crate) fat: FatTable,
}

impl FileSystem {
    pub(crate) fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut sector = [0u8; SECTOR_SIZE];
        device.read_sector(0, &mut sector)?;
        let bpb = BiosParameterBlock::parse(&sector)?;
        log::debug!(
            "mount: {:?}, {} data clusters, {} sectors/cluster, fat at {}",
            bpb.fat_type(),
            bpb.total_data_clusters,
            bpb.sectors_per_cluster(),
            bpb.fat_begin_lba
        );
        let fat = FatTable::new(Arc::clone(&device), &bpb);
        Ok(Self { device, bpb, fat })
    }

    pub(crate) fn read_sector(&self, lba: u32, buf: &mut [u8]) -> Result<()> {
        self.device.read_sector(lba, buf).map_err(Error::from)
    }

    pub(crate) fn write_sector(&self, lba: u32, buf: &[u8]) -> Result<()> {
        self.device.write_sector(lba, buf).map_err(Error::from)
    }

    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> Result<()> {
        let zeros = [0u8; SECTOR_SIZE];
        let first = self.bpb.lba_of_cluster(cluster);
        for i in 0..self.bpb.sectors_per_cluster() {
            self.write_sector(first + i, &zeros)?;
        }
        Ok(())
    }

    pub(crate) fn root_cluster(&self) -> u32 {
        self.bpb.root_cluster()
    }

    /// Walk `dir_path` component by component from the root, requiring a
    /// directory at every step. An empty path is the root itself.
    pub(crate) fn open_directory(&mut self, dir_path: &str) -> Result<u32> {
        let mut cluster = self.root_cluster();
        let count = path::level_count(dir_path);
        for level in 0..count {
            let name = match path::component(dir_path, level) {
                Some(name) => name,
                None => break,
            };
            let entry = self.find_entry(cluster, name)?.ok_or(Error::NotFound)?;
            if !entry.is_dir() {
                return Err(Error::NotADirectory);
            }
            cluster = entry.first_cluster();
        }
        Ok(cluster)
    }

    fn open_existing(&mut self, dir_path: &str, leaf: &str, checkfile: bool) -> Result<FileHandle> {
        let parent = self.open_directory(dir_path)?;
        let entry = self.find_entry(parent, leaf)?.ok_or(Error::NotFound)?;
        if checkfile && entry.is_dir() {
            return Err(Error::NotAFile);
        }
        Ok(FileHandle::new(
            dir_path.to_string(),
            leaf.to_string(),
            entry.name_bytes(),
            parent,
            entry.first_cluster(),
            entry.file_size(),
        ))
    }

    /// Create a file or directory: allocate one cluster, synthesize a
    /// unique short name (`~N` tail when the plain shortening collides),
    /// then emit the LFN run plus short entry. Failures release the
    /// claimed cluster before surfacing.
    fn create_node(&mut self, dir_path: &str, leaf: &str, is_dir: bool) -> Result<FileHandle> {
        if !self.device.supports_write() {
            return Err(Error::ReadOnly);
        }
        let parent = self.open_directory(dir_path)?;
        if self.find_entry(parent, leaf)?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let start = self.fat.allocate_chain(1)?;
        if is_dir {
            // Fresh directory clusters must read as all end-markers.
            if let Err(e) = self.zero_cluster(start) {
                self.fat.free_chain(start)?;
                return Err(e);
            }
        }

        let base = create_sfn(leaf);
        let mut short_name = base;
        let mut tail = 0u32;
        loop {
            match self.sfn_exists(parent, &short_name) {
                Ok(false) => break,
                Ok(true) => {
                    tail += 1;
                    if tail > 9999 {
                        log::warn!("create: short-name tails exhausted for {:?}", leaf);
                        self.fat.free_chain(start)?;
                        return Err(Error::NoSpace);
                    }
                    short_name = sfn_with_tail(&base, tail);
                }
                Err(e) => {
                    self.fat.free_chain(start)?;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.add_entry(parent, leaf, &short_name, start, 0, is_dir) {
            self.fat.free_chain(start)?;
            return Err(e);
        }
        self.fat.purge()?;

        Ok(FileHandle::new(
            dir_path.to_string(),
            leaf.to_string(),
            short_name,
            parent,
            start,
            0,
        ))
    }

    /// Resolve the LBA backing file-relative sector `file_sector`,
    /// consulting the per-file cluster cache and walking the FAT only for
    /// the missing hops. With `extend` set, end-of-chain grows the chain
    /// (and a chain-less handle gets its first cluster, patched back into
    /// the directory); otherwise `Ok(None)` reports the chain end.
    fn file_sector_lba(
        &mut self,
        file: &mut FileHandle,
        file_sector: u32,
        extend: bool,
    ) -> Result<Option<u32>> {
        let spc = self.bpb.sectors_per_cluster();
        let cluster_index = file_sector / spc;
        let sector_in_cluster = file_sector % spc;

        if file.start_cluster < 2 {
            if !extend {
                return Ok(None);
            }
            let first = self.fat.allocate_chain(1)?;
            file.start_cluster = first;
            file.cache.invalidate();
            let parent = file.parent_cluster;
            let short_name = file.short_name;
            self.modify_sde(parent, &short_name, |sde| sde.set_first_cluster(first))?;
        }

        let (last_index, last_cluster) = file.cache.last();
        let cluster = if last_index != INVALID_CLUSTER && cluster_index == last_index {
            last_cluster
        } else {
            // Resume from the previous lookup on sequential access, else
            // restart from the head of the chain.
            let (mut index, mut cluster) =
                if last_index != INVALID_CLUSTER && cluster_index == last_index + 1 {
                    (last_index, last_cluster)
                } else {
                    (0, file.start_cluster)
                };

            while index < cluster_index {
                let next = match file.cache.get_next(index) {
                    Some(next) => next,
                    None => self.fat.next(cluster)?,
                };
                let next = if next == END_OF_CHAIN {
                    if !extend {
                        return Ok(None);
                    }
                    let mut tail = cluster;
                    self.fat.add_free_space(&mut tail)?;
                    tail
                } else {
                    next
                };
                file.cache.set_next(index, next);
                cluster = next;
                index += 1;
            }
            file.cache.set_last(cluster_index, cluster);
            cluster
        };

        Ok(Some(self.bpb.lba_of_cluster(cluster) + sector_in_cluster))
    }

    /// Write back the buffered data sector if it is dirty, allocating the
    /// backing cluster on demand.
    fn flush_file(&mut self, file: &mut FileHandle) -> Result<()> {
        if !file.buffer.dirty {
            return Ok(());
        }
        let lba = self
            .file_sector_lba(file, file.buffer.address, true)?
            .ok_or(Error::NoSpace)?;
        self.write_sector(lba, &file.buffer.data)?;
        file.buffer.dirty = false;
        Ok(())
    }

    fn read_file(&mut self, file: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        if file.flags & FILE_READ == 0 {
            return Err(Error::AccessDenied);
        }
        if buf.is_empty() || file.cursor >= file.length {
            return Ok(0);
        }

        let mut count = buf.len();
        if file.cursor as u64 + count as u64 > file.length as u64 {
            count = (file.length - file.cursor) as usize;
        }

        let mut bytes_read = 0;
        while bytes_read < count {
            let sector = file.cursor / SECTOR_SIZE as u32;
            let offset = (file.cursor % SECTOR_SIZE as u32) as usize;

            if file.buffer.address != sector {
                if file.buffer.dirty {
                    self.flush_file(file)?;
                }
                let lba = match self.file_sector_lba(file, sector, false)? {
                    Some(lba) => lba,
                    None => break,
                };
                // A failed sector read ends the loop; the caller gets the
                // bytes copied so far.
                if self.read_sector(lba, &mut file.buffer.data).is_err() {
                    break;
                }
                file.buffer.address = sector;
                file.buffer.dirty = false;
            }

            let copy = core::cmp::min(SECTOR_SIZE - offset, count - bytes_read);
            buf[bytes_read..bytes_read + copy]
                .copy_from_slice(&file.buffer.data[offset..offset + copy]);
            bytes_read += copy;
            file.cursor += copy as u32;
        }
        Ok(bytes_read)
    }

    /// Zero-copy read of one full sector straight into the caller's
    /// buffer. The cursor must be sector-aligned.
    fn read_file_sector(
        &mut self,
        file: &mut FileHandle,
        buf: &mut [u8; SECTOR_SIZE],
    ) -> Result<usize> {
        if file.flags & FILE_READ == 0 {
            return Err(Error::AccessDenied);
        }
        if file.cursor % SECTOR_SIZE as u32 != 0 {
            return Err(Error::InvalidSeek);
        }
        if file.cursor >= file.length {
            return Ok(0);
        }

        let sector = file.cursor / SECTOR_SIZE as u32;
        // Pending bytes for this very sector must reach the device first.
        if file.buffer.dirty && file.buffer.address == sector {
            self.flush_file(file)?;
        }
        let lba = match self.file_sector_lba(file, sector, false)? {
            Some(lba) => lba,
            None => return Ok(0),
        };
        self.read_sector(lba, buf)?;

        let remaining = (file.length - file.cursor) as usize;
        let copied = core::cmp::min(SECTOR_SIZE, remaining);
        file.cursor += copied as u32;
        Ok(copied)
    }

    fn write_file(&mut self, file: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        if file.flags & FILE_WRITE == 0 || !self.device.supports_write() {
            return Err(Error::ReadOnly);
        }
        if file.flags & FILE_APPEND != 0 {
            file.cursor = file.length;
        }

        let length = buf.len();
        let mut written = 0;
        while written < length {
            let sector = file.cursor / SECTOR_SIZE as u32;
            let offset = (file.cursor % SECTOR_SIZE as u32) as usize;
            let copy = core::cmp::min(SECTOR_SIZE - offset, length - written);

            if file.buffer.address != sector {
                if file.buffer.dirty {
                    if let Err(e) = self.flush_file(file) {
                        // Bytes parked in the buffer were already counted;
                        // report the partial write unless nothing landed.
                        return if written > 0 { Ok(written) } else { Err(e) };
                    }
                }
                if copy != SECTOR_SIZE {
                    // Partial sector: fetch the old contents. Past the end
                    // of the chain nothing can be read, and the fresh
                    // sector is defined to start out zeroed.
                    let loaded = match self.file_sector_lba(file, sector, false) {
                        Ok(Some(lba)) => self.read_sector(lba, &mut file.buffer.data).is_ok(),
                        _ => false,
                    };
                    if !loaded {
                        file.buffer.data = [0; SECTOR_SIZE];
                    }
                }
                file.buffer.address = sector;
                file.buffer.dirty = false;
            }

            file.buffer.data[offset..offset + copy].copy_from_slice(&buf[written..written + copy]);
            file.buffer.dirty = true;
            written += copy;
            file.cursor += copy as u32;
        }

        if file.cursor > file.length {
            file.length = file.cursor;
            file.length_changed = true;
        }
        Ok(length)
    }

    fn seek_file(&mut self, file: &mut FileHandle, offset: i64, whence: Whence) -> Result<()> {
        if whence == Whence::End && offset != 0 {
            return Err(Error::InvalidSeek);
        }
        // Pending bytes survive the reposition.
        self.flush_file(file)?;

        let target = match whence {
            Whence::Set => offset.max(0),
            Whence::Cur => (file.cursor as i64 + offset).max(0),
            Whence::End => file.length as i64,
        };
        file.cursor = core::cmp::min(target, u32::MAX as i64) as u32;
        file.buffer.invalidate();
        file.cache.invalidate();
        Ok(())
    }
}

/// One mounted FAT16/FAT32 filesystem: the engine plus the open-file
/// arena. All operations take `&mut self`; wrap the volume in
/// [`FatFilesystem`] (or hand it to [`crate::global`]) when callers need
/// to share it.
pub struct Volume {
    fs: FileSystem,
    handles: HandleTable,
}

impl Volume {
    /// Read the boot sector and derive the volume layout.
    pub fn attach(device: Arc<dyn BlockDevice>) -> Result<Self> {
        Ok(Self {
            fs: FileSystem::mount(device)?,
            handles: HandleTable::new(),
        })
    }

    /// Flush the FAT write-back buffer. Call before the host goes away;
    /// open handles are not implicitly closed.
    pub fn shutdown(&mut self) -> Result<()> {
        self.fs.fat.purge()
    }

    /// Open or create a file. `mode` follows the traditional stream table
    /// (`r`, `w`, `a`, with `+`/`b` modifiers).
    pub fn open(&mut self, path_str: &str, mode: &str) -> Result<FileId> {
        let mut flags = decode_mode(mode);
        if !self.fs.device.supports_write() {
            flags &= !(FILE_CREATE | FILE_WRITE | FILE_APPEND);
        }

        let (dir_path, leaf) = path::split_path(path_str);
        if leaf.is_empty() {
            return Err(Error::NotFound);
        }
        // Claim order matches the pool discipline: no handle slot, no
        // disk-side work.
        if !self.handles.has_free() {
            return Err(Error::NoSpace);
        }
        if self.handles.is_open(dir_path, leaf) {
            return Err(Error::AlreadyOpen);
        }

        let mut last_err = Error::NotFound;
        let mut file = None;

        if flags & FILE_READ != 0 {
            match self.fs.open_existing(dir_path, leaf, true) {
                Ok(f) => file = Some(f),
                Err(e) => last_err = e,
            }
        }
        if file.is_none() && flags & FILE_CREATE != 0 {
            match self.fs.create_node(dir_path, leaf, false) {
                Ok(f) => file = Some(f),
                Err(e) => last_err = e,
            }
        }
        // Write-only open of a file that already exists: the create above
        // reported AlreadyExists, fall through to a plain open.
        if file.is_none()
            && flags & FILE_READ == 0
            && flags & FILE_CREATE != 0
            && flags & (FILE_WRITE | FILE_APPEND) != 0
        {
            match self.fs.open_existing(dir_path, leaf, true) {
                Ok(f) => file = Some(f),
                Err(e) => {
                    if e != Error::NotFound {
                        last_err = e;
                    }
                }
            }
        }

        match file {
            Some(mut f) => {
                f.flags = flags;
                let index = self.handles.allocate(f).ok_or(Error::NoSpace)?;
                Ok(FileId(index))
            }
            None => Err(last_err),
        }
    }

    /// Flush data and metadata, then return the handle to the pool. The
    /// id is dead afterwards even when an error is reported.
    pub fn close(&mut self, id: FileId) -> Result<()> {
        let file = self.handles.get_mut(id.0).ok_or(Error::InvalidHandle)?;

        let mut result = self.fs.flush_file(file);
        if file.length_changed && result.is_ok() {
            let parent = file.parent_cluster;
            let short_name = file.short_name;
            let length = file.length;
            result = self
                .fs
                .modify_sde(parent, &short_name, |sde| sde.set_file_size(length));
        }

        self.handles.release(id.0);
        let purged = self.fs.fat.purge();
        result.and(purged)
    }

    /// Read up to `buf.len()` bytes from the cursor. Short counts happen
    /// at end of file and after a mid-loop sector failure.
    pub fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize> {
        let file = self.handles.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        self.fs.read_file(file, buf)
    }

    /// Zero-copy read of one full sector straight into `buf`, bypassing
    /// the per-file sector buffer. The cursor must be sector-aligned.
    pub fn read_sector_aligned(
        &mut self,
        id: FileId,
        buf: &mut [u8; SECTOR_SIZE],
    ) -> Result<usize> {
        let file = self.handles.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        self.fs.read_file_sector(file, buf)
    }

    /// Buffered write at the cursor (at end of file in append mode). A
    /// partial count is reported when the chain cannot grow mid-write.
    pub fn write(&mut self, id: FileId, buf: &[u8]) -> Result<usize> {
        let file = self.handles.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        self.fs.write_file(file, buf)
    }

    pub fn seek(&mut self, id: FileId, offset: i64, whence: Whence) -> Result<()> {
        let file = self.handles.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        self.fs.seek_file(file, offset, whence)
    }

    pub fn tell(&self, id: FileId) -> Result<u32> {
        let file = self.handles.get(id.0).ok_or(Error::InvalidHandle)?;
        Ok(file.cursor)
    }

    pub fn eof(&self, id: FileId) -> Result<bool> {
        let file = self.handles.get(id.0).ok_or(Error::InvalidHandle)?;
        Ok(file.cursor >= file.length)
    }

    /// Push buffered data and the FAT sector out to the device.
    pub fn flush(&mut self, id: FileId) -> Result<()> {
        let file = self.handles.get_mut(id.0).ok_or(Error::InvalidHandle)?;
        self.fs.flush_file(file)?;
        self.fs.fat.purge()
    }

    /// Delete a file (or an empty-by-convention directory): free the
    /// chain, then erase the directory records. Open files cannot be
    /// removed.
    pub fn remove(&mut self, path_str: &str) -> Result<()> {
        if !self.fs.device.supports_write() {
            return Err(Error::ReadOnly);
        }
        let (dir_path, leaf) = path::split_path(path_str);
        if leaf.is_empty() {
            return Err(Error::NotFound);
        }
        if self.handles.is_open(dir_path, leaf) {
            return Err(Error::AlreadyOpen);
        }

        let file = self.fs.open_existing(dir_path, leaf, false)?;
        if file.start_cluster >= 2 {
            self.fs.fat.free_chain(file.start_cluster)?;
        }
        self.fs.mark_deleted(file.parent_cluster, &file.short_name)?;
        self.fs.fat.purge()
    }

    /// Create a directory. The new cluster is zero-filled; `.`/`..`
    /// entries are not written.
    pub fn create_directory(&mut self, path_str: &str) -> Result<()> {
        if !self.fs.device.supports_write() {
            return Err(Error::ReadOnly);
        }
        let (dir_path, leaf) = path::split_path(path_str);
        if leaf.is_empty() {
            return Err(Error::AlreadyExists);
        }
        if self.handles.is_open(dir_path, leaf) {
            return Err(Error::AlreadyOpen);
        }
        self.fs.create_node(dir_path, leaf, true)?;
        self.fs.fat.purge()
    }

    /// Open a directory stream. `/` (or the empty path) is the root.
    pub fn open_dir(&mut self, path_str: &str) -> Result<Dir> {
        let cluster = self.fs.open_directory(path_str)?;
        Ok(Dir::new(cluster))
    }

    /// Next entry of the stream, or `None` at the end.
    pub fn read_dir(&mut self, dir: &mut Dir) -> Result<Option<DirEntryInfo>> {
        self.fs.read_dir_next(dir)
    }

    /// Collect a whole directory listing.
    pub fn list_dir(&mut self, path_str: &str) -> Result<Vec<DirEntryInfo>> {
        let mut dir = self.open_dir(path_str)?;
        let mut entries = Vec::new();
        while let Some(entry) = self.read_dir(&mut dir)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Whether `path` resolves to a directory. Missing paths and paths
    /// ending in a regular file answer `false`.
    pub fn is_dir(&mut self, path_str: &str) -> Result<bool> {
        match self.fs.open_directory(path_str) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) | Err(Error::NotADirectory) | Err(Error::NotAFile) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Lock wrapper: every call serializes on an internal mutex, standing in
/// for the host `lock()`/`unlock()` callbacks.
pub struct FatFilesystem {
    inner: Mutex<Volume>,
}

impl FatFilesystem {
    pub fn attach(device: Arc<dyn BlockDevice>) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Volume::attach(device)?),
        })
    }

    /// Run `f` against the locked volume.
    pub fn with_volume<R>(&self, f: impl FnOnce(&mut Volume) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn open(&self, path: &str, mode: &str) -> Result<FileId> {
        self.inner.lock().open(path, mode)
    }

    pub fn close(&self, id: FileId) -> Result<()> {
        self.inner.lock().close(id)
    }

    pub fn read(&self, id: FileId, buf: &mut [u8]) -> Result<usize> {
        self.inner.lock().read(id, buf)
    }

    pub fn write(&self, id: FileId, buf: &[u8]) -> Result<usize> {
        self.inner.lock().write(id, buf)
    }

    pub fn seek(&self, id: FileId, offset: i64, whence: Whence) -> Result<()> {
        self.inner.lock().seek(id, offset, whence)
    }

    pub fn tell(&self, id: FileId) -> Result<u32> {
        self.inner.lock().tell(id)
    }

    pub fn eof(&self, id: FileId) -> Result<bool> {
        self.inner.lock().eof(id)
    }

    pub fn flush(&self, id: FileId) -> Result<()> {
        self.inner.lock().flush(id)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.inner.lock().remove(path)
    }

    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.inner.lock().create_directory(path)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntryInfo>> {
        self.inner.lock().list_dir(path)
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        self.inner.lock().is_dir(path)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.inner.lock().shutdown()
    }
}
