//! Exclusive access to a physical volume.
//!
//! A platform backend implements [`DeviceAccess`] (open a volume, report free
//! space, tell whether a path lives on a volume) and [`VolumeHandle`] (lock,
//! unmount, geometry, raw sector I/O). The rest of the crate only ever sees a
//! [`Volume`], a guard that owns the handle for the length of one operation
//! and unlocks and closes it when dropped, whichever way the operation ends.
use crate::error::AcquireError;
use crate::transfer::SectorIo;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How a volume is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-only, for imaging to a file and for verification.
    Read,
    /// Read-write, for writing an image to the volume.
    Write,
}

/// An open platform handle to a volume.
///
/// Closing is tied to `Drop`.
pub trait VolumeHandle {
    /// Takes the exclusive lock. Fails if someone else holds it.
    fn lock(&mut self) -> io::Result<()>;
    fn unlock(&mut self) -> io::Result<()>;
    /// Force-unmounts every filesystem mounted from this volume.
    fn unmount(&mut self) -> io::Result<()>;
    fn sector_size(&self) -> io::Result<u32>;
    fn sector_count(&self) -> io::Result<u64>;
    fn read_sectors(&mut self, start: u64, sector_size: u32, buf: &mut [u8]) -> io::Result<()>;
    fn write_sectors(&mut self, start: u64, sector_size: u32, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// The host's device-access capabilities.
pub trait DeviceAccess {
    type Handle: VolumeHandle;

    fn open_volume(&self, identifier: &Path, mode: AccessMode) -> io::Result<Self::Handle>;

    /// Free bytes on the filesystem that holds (or would hold) `path`.
    ///
    /// `None` means the backend cannot tell, in which case no capacity
    /// check is made.
    fn available_space(&self, path: &Path) -> Option<u64> {
        crate::platform::available_space(path)
    }

    /// Whether `path` is stored on the volume `identifier`.
    fn hosts_path(&self, identifier: &Path, path: &Path) -> bool;
}

/// A locked, unmounted volume held for the duration of one operation.
pub struct Volume<H: VolumeHandle> {
    handle: H,
    identifier: PathBuf,
    mode: AccessMode,
    sector_size: u32,
    sector_count: u64,
    locked: bool,
}

impl<H: VolumeHandle> Volume<H> {
    /// Opens, locks and unmounts `identifier`, then reads its geometry.
    ///
    /// Each step only runs if the previous one succeeded. On failure
    /// everything acquired so far is released before the error is returned.
    pub fn acquire<B>(backend: &B, identifier: &Path, mode: AccessMode) -> Result<Self, AcquireError>
    where
        B: DeviceAccess<Handle = H>,
    {
        let path = identifier.to_path_buf();
        debug!(volume = %path.display(), ?mode, "opening volume");
        let handle = backend
            .open_volume(identifier, mode)
            .map_err(|source| AcquireError::Open {
                path: path.clone(),
                source,
            })?;

        let mut volume = Volume {
            handle,
            identifier: path,
            mode,
            sector_size: 0,
            sector_count: 0,
            locked: false,
        };

        volume
            .handle
            .lock()
            .map_err(|source| AcquireError::Lock {
                path: volume.identifier.clone(),
                source,
            })?;
        volume.locked = true;
        debug!(volume = %volume.identifier.display(), "volume locked");

        volume
            .handle
            .unmount()
            .map_err(|source| AcquireError::Unmount {
                path: volume.identifier.clone(),
                source,
            })?;
        debug!(volume = %volume.identifier.display(), "volume unmounted");

        let geometry = volume
            .handle
            .sector_size()
            .and_then(|size| Ok((size, volume.handle.sector_count()?)));
        let (sector_size, sector_count) = geometry.map_err(|source| AcquireError::Geometry {
            path: volume.identifier.clone(),
            source,
        })?;
        if sector_size == 0 {
            return Err(AcquireError::Geometry {
                path: volume.identifier.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, "sector size reported as zero"),
            });
        }
        volume.sector_size = sector_size;
        volume.sector_count = sector_count;
        debug!(
            volume = %volume.identifier.display(),
            sector_size,
            sector_count,
            "volume geometry"
        );

        Ok(volume)
    }

    pub fn identifier(&self) -> &Path {
        &self.identifier
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Unlocks and closes the volume now instead of at the end of scope.
    pub fn release(self) {}

    fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        self.locked = false;
        match self.handle.unlock() {
            Ok(()) => debug!(volume = %self.identifier.display(), "volume released"),
            Err(e) => warn!(volume = %self.identifier.display(), "failed to unlock volume: {e}"),
        }
    }
}

impl<H: VolumeHandle> Drop for Volume<H> {
    fn drop(&mut self) {
        // The handle itself closes when its own Drop runs right after this.
        self.unlock();
    }
}

impl<H: VolumeHandle> SectorIo for Volume<H> {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> io::Result<()> {
        self.handle.read_sectors(start, self.sector_size, buf)
    }

    fn write_sectors(&mut self, start: u64, buf: &[u8]) -> io::Result<()> {
        if self.mode != AccessMode::Write {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "volume was opened read-only",
            ));
        }
        self.handle.write_sectors(start, self.sector_size, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle.flush()
    }
}
