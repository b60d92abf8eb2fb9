//! An in-memory device backend.
//!
//! Volumes are plain byte vectors registered under a name. Every open, lock,
//! unmount, unlock and close is written to a journal, and individual steps
//! can be made to fail, which makes this backend suitable for test harnesses
//! and dry runs of the controller.
use crate::access::{AccessMode, DeviceAccess, VolumeHandle};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A step that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    Open,
    Lock,
    Unmount,
    /// Fail reads of the chunk starting at this sector.
    ReadAt(u64),
    /// Fail writes of the chunk starting at this sector.
    WriteAt(u64),
}

/// One entry of the handle lifecycle journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    Open,
    Lock,
    Unmount,
    Unlock,
    Close,
}

struct MemoryDisk {
    sector_size: u32,
    data: Vec<u8>,
    locked: bool,
    faults: HashSet<Fault>,
    sectors_written: u64,
}

#[derive(Default)]
struct State {
    disks: HashMap<PathBuf, MemoryDisk>,
    journal: Vec<JournalEntry>,
    free_space: Option<u64>,
    /// Paths considered to be stored on a given volume.
    hosted: HashMap<PathBuf, Vec<PathBuf>>,
}

/// Backend whose volumes live in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a volume. `data` is truncated to a whole number of sectors.
    ///
    /// # Panics
    ///
    /// Panics if `sector_size` is zero.
    pub fn insert_volume(&self, name: impl Into<PathBuf>, sector_size: u32, mut data: Vec<u8>) {
        assert!(sector_size > 0, "memory volume sector size must be non-zero");
        let whole = data.len() - data.len() % sector_size as usize;
        data.truncate(whole);
        self.state().disks.insert(
            name.into(),
            MemoryDisk {
                sector_size,
                data,
                locked: false,
                faults: HashSet::new(),
                sectors_written: 0,
            },
        );
    }

    pub fn inject(&self, name: impl AsRef<Path>, fault: Fault) {
        if let Some(disk) = self.state().disks.get_mut(name.as_ref()) {
            disk.faults.insert(fault);
        }
    }

    /// Sets the free space reported for every path. `None` means unknown.
    pub fn set_free_space(&self, bytes: Option<u64>) {
        self.state().free_space = bytes;
    }

    /// Declares that `path` is stored on volume `name`.
    pub fn host_path(&self, name: impl Into<PathBuf>, path: impl Into<PathBuf>) {
        self.state()
            .hosted
            .entry(name.into())
            .or_default()
            .push(path.into());
    }

    pub fn contents(&self, name: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state().disks.get(name.as_ref()).map(|d| d.data.clone())
    }

    pub fn sectors_written(&self, name: impl AsRef<Path>) -> u64 {
        self.state()
            .disks
            .get(name.as_ref())
            .map_or(0, |d| d.sectors_written)
    }

    pub fn is_locked(&self, name: impl AsRef<Path>) -> bool {
        self.state()
            .disks
            .get(name.as_ref())
            .is_some_and(|d| d.locked)
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state().journal.clone()
    }
}

fn not_found(name: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no memory volume named {}", name.display()),
    )
}

fn injected(what: &str) -> io::Error {
    io::Error::other(format!("injected {what} failure"))
}

impl DeviceAccess for MemoryBackend {
    type Handle = MemoryHandle;

    fn open_volume(&self, identifier: &Path, mode: AccessMode) -> io::Result<MemoryHandle> {
        let mut state = self.state();
        let disk = state
            .disks
            .get(identifier)
            .ok_or_else(|| not_found(identifier))?;
        if disk.faults.contains(&Fault::Open) {
            return Err(injected("open"));
        }
        state.journal.push(JournalEntry::Open);
        Ok(MemoryHandle {
            backend: self.clone(),
            name: identifier.to_path_buf(),
            mode,
            holds_lock: false,
        })
    }

    fn available_space(&self, _path: &Path) -> Option<u64> {
        self.state().free_space
    }

    fn hosts_path(&self, identifier: &Path, path: &Path) -> bool {
        self.state()
            .hosted
            .get(identifier)
            .is_some_and(|paths| paths.iter().any(|p| p == path))
    }
}

/// An open handle on a [`MemoryBackend`] volume.
pub struct MemoryHandle {
    backend: MemoryBackend,
    name: PathBuf,
    mode: AccessMode,
    holds_lock: bool,
}

impl MemoryHandle {
    fn with_disk<T>(
        &self,
        f: impl FnOnce(&mut MemoryDisk, &mut Vec<JournalEntry>) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut state = self.backend.state();
        let State { disks, journal, .. } = &mut *state;
        let disk = disks.get_mut(&self.name).ok_or_else(|| not_found(&self.name))?;
        f(disk, journal)
    }

    fn span(disk: &MemoryDisk, start: u64, sector_size: u32, len: usize) -> io::Result<std::ops::Range<usize>> {
        let offset = start as usize * sector_size as usize;
        let end = offset + len;
        if end > disk.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "access beyond end of volume",
            ));
        }
        Ok(offset..end)
    }
}

impl VolumeHandle for MemoryHandle {
    fn lock(&mut self) -> io::Result<()> {
        self.with_disk(|disk, journal| {
            if disk.faults.contains(&Fault::Lock) {
                return Err(injected("lock"));
            }
            if disk.locked {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "volume is locked by another handle",
                ));
            }
            disk.locked = true;
            journal.push(JournalEntry::Lock);
            Ok(())
        })?;
        self.holds_lock = true;
        Ok(())
    }

    fn unlock(&mut self) -> io::Result<()> {
        if !self.holds_lock {
            return Ok(());
        }
        self.holds_lock = false;
        self.with_disk(|disk, journal| {
            disk.locked = false;
            journal.push(JournalEntry::Unlock);
            Ok(())
        })
    }

    fn unmount(&mut self) -> io::Result<()> {
        self.with_disk(|disk, journal| {
            if disk.faults.contains(&Fault::Unmount) {
                return Err(injected("unmount"));
            }
            journal.push(JournalEntry::Unmount);
            Ok(())
        })
    }

    fn sector_size(&self) -> io::Result<u32> {
        self.with_disk(|disk, _| Ok(disk.sector_size))
    }

    fn sector_count(&self) -> io::Result<u64> {
        self.with_disk(|disk, _| Ok((disk.data.len() / disk.sector_size as usize) as u64))
    }

    fn read_sectors(&mut self, start: u64, sector_size: u32, buf: &mut [u8]) -> io::Result<()> {
        self.with_disk(|disk, _| {
            if disk.faults.contains(&Fault::ReadAt(start)) {
                return Err(injected("read"));
            }
            let span = Self::span(disk, start, sector_size, buf.len())?;
            buf.copy_from_slice(&disk.data[span]);
            Ok(())
        })
    }

    fn write_sectors(&mut self, start: u64, sector_size: u32, buf: &[u8]) -> io::Result<()> {
        if self.mode != AccessMode::Write {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        self.with_disk(|disk, _| {
            if disk.faults.contains(&Fault::WriteAt(start)) {
                return Err(injected("write"));
            }
            let span = Self::span(disk, start, sector_size, buf.len())?;
            disk.data[span].copy_from_slice(buf);
            disk.sectors_written += (buf.len() / sector_size as usize) as u64;
            Ok(())
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        // A handle dropped while still holding the lock lets it go silently.
        let _ = self.unlock();
        self.backend.state().journal.push(JournalEntry::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "sector size must be non-zero")]
    fn zero_sector_size_is_rejected() {
        MemoryBackend::new().insert_volume("mem0", 0, vec![0u8; 512]);
    }

    #[test]
    fn volume_is_truncated_to_whole_sectors() {
        let backend = MemoryBackend::new();
        backend.insert_volume("mem0", 512, vec![1u8; 1300]);
        assert_eq!(backend.contents("mem0").unwrap().len(), 1024);
    }

    #[test]
    fn writes_are_counted_in_sectors() {
        let backend = MemoryBackend::new();
        backend.insert_volume("mem0", 512, vec![0u8; 4096]);
        let mut handle = backend.open_volume(Path::new("mem0"), AccessMode::Write).unwrap();

        handle.write_sectors(2, 512, &[7u8; 1024]).unwrap();

        assert_eq!(backend.sectors_written("mem0"), 2);
        assert_eq!(backend.contents("mem0").unwrap()[1024..2048], [7u8; 1024]);
    }

    #[test]
    fn out_of_range_read_fails() {
        let backend = MemoryBackend::new();
        backend.insert_volume("mem0", 512, vec![0u8; 1024]);
        let mut handle = backend.open_volume(Path::new("mem0"), AccessMode::Read).unwrap();
        let mut buf = [0u8; 1024];

        let err = handle.read_sectors(1, 512, &mut buf).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
