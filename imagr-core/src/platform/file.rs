//! A regular file presented as a volume.
//!
//! Useful for loop images and for exercising the whole controller against
//! real file I/O. The volume has a fixed size: the length of the file when it
//! was opened, rounded down to whole sectors.
use crate::access::{AccessMode, DeviceAccess, VolumeHandle};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Backend that opens regular files as volumes.
#[derive(Clone, Copy, Debug)]
pub struct FileBackend {
    sector_size: u32,
}

impl Default for FileBackend {
    fn default() -> Self {
        Self {
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }
}

impl FileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sector_size(sector_size: u32) -> Self {
        Self { sector_size }
    }
}

impl DeviceAccess for FileBackend {
    type Handle = FileHandle;

    fn open_volume(&self, identifier: &Path, mode: AccessMode) -> io::Result<FileHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::Write)
            .open(identifier)?;
        let len_bytes = file.metadata()?.len();
        debug!(volume = %identifier.display(), len_bytes, "opened file volume");
        Ok(FileHandle {
            file,
            path: identifier.to_path_buf(),
            sector_size: self.sector_size,
            len_bytes,
            locked: false,
        })
    }

    fn hosts_path(&self, identifier: &Path, path: &Path) -> bool {
        match (identifier.canonicalize(), path.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// An open file volume.
pub struct FileHandle {
    file: File,
    path: PathBuf,
    sector_size: u32,
    len_bytes: u64,
    locked: bool,
}

impl FileHandle {
    fn check_span(&self, start: u64, len: usize) -> io::Result<u64> {
        let offset = start * self.sector_size as u64;
        if offset + len as u64 > self.len_bytes {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("access beyond end of {}", self.path.display()),
            ));
        }
        Ok(offset)
    }

    #[cfg(unix)]
    fn flock(&self, operation: libc::c_int) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl VolumeHandle for FileHandle {
    #[cfg(unix)]
    fn lock(&mut self) -> io::Result<()> {
        self.flock(libc::LOCK_EX | libc::LOCK_NB)?;
        self.locked = true;
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(&mut self) -> io::Result<()> {
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> io::Result<()> {
        if !self.locked {
            return Ok(());
        }
        self.locked = false;
        #[cfg(unix)]
        self.flock(libc::LOCK_UN)?;
        Ok(())
    }

    fn unmount(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn sector_size(&self) -> io::Result<u32> {
        Ok(self.sector_size)
    }

    fn sector_count(&self) -> io::Result<u64> {
        Ok(self.len_bytes / self.sector_size as u64)
    }

    fn read_sectors(&mut self, start: u64, _sector_size: u32, buf: &mut [u8]) -> io::Result<()> {
        let offset = self.check_span(start, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_sectors(&mut self, start: u64, _sector_size: u32, buf: &[u8]) -> io::Result<()> {
        let offset = self.check_span(start, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Volume;
    use crate::transfer::SectorIo;

    fn volume_file(len: usize) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; len]).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn geometry_rounds_down_to_whole_sectors() {
        let tmp = volume_file(512 * 10 + 100);
        let volume = Volume::acquire(&FileBackend::new(), tmp.path(), AccessMode::Read).unwrap();
        assert_eq!(volume.sector_count(), 10);
        assert_eq!(volume.sector_size(), 512);
    }

    #[test]
    fn writes_stay_within_the_volume() {
        let tmp = volume_file(512 * 4);
        let mut volume =
            Volume::acquire(&FileBackend::new(), tmp.path(), AccessMode::Write).unwrap();

        volume.write_sectors(3, &[1u8; 512]).unwrap();
        let err = volume.write_sectors(4, &[1u8; 512]).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        drop(volume);
        assert_eq!(std::fs::metadata(tmp.path()).unwrap().len(), 512 * 4);
    }

    #[cfg(unix)]
    #[test]
    fn second_acquire_fails_to_lock() {
        let tmp = volume_file(512);
        let backend = FileBackend::new();
        let _held = Volume::acquire(&backend, tmp.path(), AccessMode::Read).unwrap();

        let err = Volume::acquire(&backend, tmp.path(), AccessMode::Read)
            .err()
            .unwrap();

        assert!(matches!(err, crate::error::AcquireError::Lock { .. }));
    }

    #[test]
    fn file_hosts_only_itself() {
        let tmp = volume_file(512);
        let other = volume_file(512);
        let backend = FileBackend::new();
        assert!(backend.hosts_path(tmp.path(), tmp.path()));
        assert!(!backend.hosts_path(tmp.path(), other.path()));
    }
}
