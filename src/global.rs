//! Process-wide singleton volume
//!
//! Optional convenience layer for hosts that want the legacy shape:
//! attach the media once, then call free functions everywhere. Every call
//! locks the singleton; [`crate::Error::NoMedia`] is reported when no
//! volume is attached.

use crate::device::BlockDevice;
use crate::dir::DirEntryInfo;
use crate::file::Whence;
use crate::fs::{FileId, Volume};
use crate::{Error, Result};

use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

lazy_static! {
    static ref VOLUME: Mutex<Option<Volume>> = Mutex::new(None);
}

/// Mount `device` as the process-wide volume, replacing any previous one
/// (its FAT buffer is flushed first).
pub fn attach(device: Arc<dyn BlockDevice>) -> Result<()> {
    let volume = Volume::attach(device)?;
    let mut guard = VOLUME.lock();
    if let Some(old) = guard.as_mut() {
        old.shutdown()?;
    }
    *guard = Some(volume);
    Ok(())
}

/// Flush and drop the process-wide volume.
pub fn shutdown() -> Result<()> {
    let mut guard = VOLUME.lock();
    match guard.take() {
        Some(mut volume) => volume.shutdown(),
        None => Ok(()),
    }
}

/// Run `f` against the attached volume.
pub fn with_volume<R>(f: impl FnOnce(&mut Volume) -> Result<R>) -> Result<R> {
    let mut guard = VOLUME.lock();
    match guard.as_mut() {
        Some(volume) => f(volume),
        None => Err(Error::NoMedia),
    }
}

pub fn open(path: &str, mode: &str) -> Result<FileId> {
    with_volume(|v| v.open(path, mode))
}

pub fn close(id: FileId) -> Result<()> {
    with_volume(|v| v.close(id))
}

pub fn read(id: FileId, buf: &mut [u8]) -> Result<usize> {
    with_volume(|v| v.read(id, buf))
}

pub fn write(id: FileId, buf: &[u8]) -> Result<usize> {
    with_volume(|v| v.write(id, buf))
}

pub fn seek(id: FileId, offset: i64, whence: Whence) -> Result<()> {
    with_volume(|v| v.seek(id, offset, whence))
}

pub fn tell(id: FileId) -> Result<u32> {
    with_volume(|v| v.tell(id))
}

pub fn eof(id: FileId) -> Result<bool> {
    with_volume(|v| v.eof(id))
}

pub fn flush(id: FileId) -> Result<()> {
    with_volume(|v| v.flush(id))
}

pub fn remove(path: &str) -> Result<()> {
    with_volume(|v| v.remove(path))
}

pub fn create_directory(path: &str) -> Result<()> {
    with_volume(|v| v.create_directory(path))
}

pub fn list_dir(path: &str) -> Result<Vec<DirEntryInfo>> {
    with_volume(|v| v.list_dir(path))
}

pub fn is_dir(path: &str) -> Result<bool> {
    with_volume(|v| v.is_dir(path))
}
