use crate::access::{AccessMode, DeviceAccess, VolumeHandle};
use crate::device::Device;
use anyhow::Result;
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::windows::fs::{FileExt, OpenOptionsExt};
use std::os::windows::io::AsRawHandle;
use std::path::{Component, Path, PathBuf, Prefix};
use sysinfo::Disks;
use tracing::debug;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Storage::FileSystem::{
    FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_READ, FILE_SHARE_WRITE,
    GetDriveTypeW, GetLogicalDrives,
};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::{
    DISK_GEOMETRY_EX, FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, FSCTL_UNLOCK_VOLUME,
    IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, IOCTL_STORAGE_GET_DEVICE_NUMBER, STORAGE_DEVICE_NUMBER,
};

const DRIVE_REMOVABLE: u32 = 2;

/// Sends a control code with no input buffer.
fn device_io_control<T>(file: &File, code: u32, out: Option<&mut T>) -> io::Result<()> {
    let (ptr, len) = match out {
        Some(out) => (out as *mut T as *mut c_void, mem::size_of::<T>() as u32),
        None => (std::ptr::null_mut(), 0),
    };
    let mut returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            file.as_raw_handle() as HANDLE,
            code,
            std::ptr::null(),
            0,
            ptr,
            len,
            &mut returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

/// Drive letter named by a volume identifier such as `E:`, `E:\` or `\\.\E:`.
fn drive_letter(identifier: &Path) -> Option<char> {
    let s = identifier.to_str()?;
    let s = s.strip_prefix(r"\\.\").unwrap_or(s);
    let mut chars = s.chars();
    let letter = chars.next()?;
    if !letter.is_ascii_alphabetic() || chars.next() != Some(':') {
        return None;
    }
    match chars.as_str() {
        "" | "\\" => Some(letter.to_ascii_uppercase()),
        _ => None,
    }
}

fn invalid_identifier(identifier: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} does not name a drive letter", identifier.display()),
    )
}

fn open_raw(path: &str, mode: AccessMode) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(mode == AccessMode::Write)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
        .custom_flags(FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH)
        .open(path)
}

/// Drive-letter volumes. Locking and dismounting happen on the volume
/// (`\\.\E:`); sector I/O goes to the physical drive behind it.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsBackend;

impl DeviceAccess for WindowsBackend {
    type Handle = WindowsHandle;

    fn open_volume(&self, identifier: &Path, mode: AccessMode) -> io::Result<WindowsHandle> {
        let letter = drive_letter(identifier).ok_or_else(|| invalid_identifier(identifier))?;
        let volume = open_raw(&format!(r"\\.\{letter}:"), mode)?;

        let mut number: STORAGE_DEVICE_NUMBER = unsafe { mem::zeroed() };
        device_io_control(&volume, IOCTL_STORAGE_GET_DEVICE_NUMBER, Some(&mut number))?;
        let disk_path = format!(r"\\.\PhysicalDrive{}", number.DeviceNumber);
        debug!(volume = %letter, disk = %disk_path, "resolved physical drive");
        let disk = open_raw(&disk_path, mode)?;

        Ok(WindowsHandle {
            volume,
            disk,
            locked: false,
        })
    }

    fn hosts_path(&self, identifier: &Path, path: &Path) -> bool {
        let Some(letter) = drive_letter(identifier) else {
            return false;
        };
        let Ok(absolute) = std::path::absolute(path) else {
            return false;
        };
        match absolute.components().next() {
            Some(Component::Prefix(prefix)) => match prefix.kind() {
                Prefix::Disk(d) | Prefix::VerbatimDisk(d) => {
                    (d as char).eq_ignore_ascii_case(&letter)
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// A locked volume and the physical drive it lives on.
pub struct WindowsHandle {
    volume: File,
    disk: File,
    locked: bool,
}

impl VolumeHandle for WindowsHandle {
    fn lock(&mut self) -> io::Result<()> {
        device_io_control::<()>(&self.volume, FSCTL_LOCK_VOLUME, None)?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> io::Result<()> {
        if !self.locked {
            return Ok(());
        }
        self.locked = false;
        device_io_control::<()>(&self.volume, FSCTL_UNLOCK_VOLUME, None)
    }

    fn unmount(&mut self) -> io::Result<()> {
        device_io_control::<()>(&self.volume, FSCTL_DISMOUNT_VOLUME, None)
    }

    fn sector_size(&self) -> io::Result<u32> {
        Ok(self.geometry()?.Geometry.BytesPerSector)
    }

    fn sector_count(&self) -> io::Result<u64> {
        let geometry = self.geometry()?;
        let sector_size = geometry.Geometry.BytesPerSector as u64;
        if sector_size == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }
        Ok(geometry.DiskSize as u64 / sector_size)
    }

    fn read_sectors(&mut self, start: u64, sector_size: u32, buf: &mut [u8]) -> io::Result<()> {
        let mut offset = start * sector_size as u64;
        let mut filled = 0;
        while filled < buf.len() {
            match self.disk.seek_read(&mut buf[filled..], offset) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    filled += n;
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_sectors(&mut self, start: u64, sector_size: u32, buf: &[u8]) -> io::Result<()> {
        let mut offset = start * sector_size as u64;
        let mut written = 0;
        while written < buf.len() {
            match self.disk.seek_write(&buf[written..], offset) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.disk.sync_all()
    }
}

impl WindowsHandle {
    fn geometry(&self) -> io::Result<DISK_GEOMETRY_EX> {
        let mut geometry: DISK_GEOMETRY_EX = unsafe { mem::zeroed() };
        device_io_control(&self.disk, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, Some(&mut geometry))?;
        Ok(geometry)
    }
}

/// Scans drive letters for removable volumes that report a non-zero size.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = Disks::new_with_refreshed_list();
    let drive_bits = unsafe { GetLogicalDrives() };
    let mut devices = Vec::new();

    for i in 0..26u8 {
        if (drive_bits >> i) & 1 == 0 {
            continue;
        }
        let letter = (b'A' + i) as char;
        let root = format!(r"{letter}:\");
        let root_wide = wide(&root);
        if unsafe { GetDriveTypeW(root_wide.as_ptr()) } != DRIVE_REMOVABLE {
            continue;
        }

        let disk = disks
            .iter()
            .find(|d| d.mount_point() == Path::new(&root));
        let size_bytes = disk.map_or(0, |d| d.total_space());
        if size_bytes == 0 {
            continue;
        }

        devices.push(Device {
            path: PathBuf::from(format!(r"\\.\{letter}:")),
            name: format!("{letter}:"),
            size_bytes,
            mount_points: vec![PathBuf::from(root)],
        });
    }

    Ok(devices)
}
