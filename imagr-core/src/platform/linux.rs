use crate::access::{AccessMode, DeviceAccess, VolumeHandle};
use crate::device::Device;
use anyhow::Result;
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use nix::{ioctl_read, ioctl_read_bad, request_code_none};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, warn};

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), libc::c_int);

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            // nvme0n1p1 -> nvme0n1, but leave nvme0n1 alone.
            if path_str[index + 1..].chars().all(|c| c.is_ascii_digit())
                && index + 1 < path_str.len()
            {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

fn disk_device_path(disk: &sysinfo::Disk) -> PathBuf {
    PathBuf::from("/dev/").join(disk.name())
}

/// Whether `candidate` is `device` itself or one of its partitions.
fn belongs_to(candidate: &Path, device: &Path) -> bool {
    candidate == device || get_parent_device_path(candidate) == device
}

/// Raw block devices through `/dev`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxBackend;

impl DeviceAccess for LinuxBackend {
    type Handle = LinuxHandle;

    fn open_volume(&self, identifier: &Path, mode: AccessMode) -> io::Result<LinuxHandle> {
        // Resolve /dev/disk/by-id style links so the mount table matches.
        let path = identifier.canonicalize()?;
        if !fs::metadata(&path)?.file_type().is_block_device() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a block device", path.display()),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::Write)
            .custom_flags(libc::O_DIRECT)
            .open(&path)?;

        Ok(LinuxHandle {
            file,
            path,
            locked: false,
        })
    }

    fn hosts_path(&self, identifier: &Path, path: &Path) -> bool {
        let Ok(device) = identifier.canonicalize() else {
            return false;
        };
        let target = match path.canonicalize() {
            Ok(p) => p,
            // A read destination may not exist yet; its directory decides.
            Err(_) => match path.parent().and_then(|p| p.canonicalize().ok()) {
                Some(p) => p,
                None => return false,
            },
        };

        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .is_some_and(|d| belongs_to(&disk_device_path(d), &device))
    }
}

/// An open block device.
pub struct LinuxHandle {
    file: File,
    path: PathBuf,
    locked: bool,
}

impl LinuxHandle {
    fn flock(&self, operation: libc::c_int) -> io::Result<()> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl VolumeHandle for LinuxHandle {
    fn lock(&mut self) -> io::Result<()> {
        self.flock(libc::LOCK_EX | libc::LOCK_NB)?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> io::Result<()> {
        if !self.locked {
            return Ok(());
        }
        self.locked = false;
        self.flock(libc::LOCK_UN)
    }

    fn unmount(&mut self) -> io::Result<()> {
        let disks = Disks::new_with_refreshed_list();
        for disk in disks.iter() {
            if !belongs_to(&disk_device_path(disk), &self.path) {
                continue;
            }
            let mount_point = disk.mount_point();
            debug!(device = %self.path.display(), mount = %mount_point.display(), "unmounting");
            match umount2(mount_point, MntFlags::empty()) {
                Ok(()) => {}
                Err(Errno::EBUSY) => {
                    warn!(mount = %mount_point.display(), "filesystem busy, detaching lazily");
                    umount2(mount_point, MntFlags::MNT_DETACH).map_err(io::Error::from)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn sector_size(&self) -> io::Result<u32> {
        let mut size: libc::c_int = 0;
        unsafe {
            blksszget(self.file.as_raw_fd(), &mut size)?;
        }
        u32::try_from(size).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
    }

    fn sector_count(&self) -> io::Result<u64> {
        let mut size_bytes: u64 = 0;
        unsafe {
            blkgetsize64(self.file.as_raw_fd(), &mut size_bytes)?;
        }
        let sector_size = self.sector_size()? as u64;
        if sector_size == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }
        Ok(size_bytes / sector_size)
    }

    fn read_sectors(&mut self, start: u64, sector_size: u32, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, start * sector_size as u64)
    }

    fn write_sectors(&mut self, start: u64, sector_size: u32, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, start * sector_size as u64)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Scans for all removable block devices on a Linux system.
///
/// Devices are found through `/sys/block`. The disk holding `/` is never
/// listed, and neither are loop devices, non-removable disks or readers
/// reporting a size of zero.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .map(|d| get_parent_device_path(&disk_device_path(d)));
    if system_disk_parent.is_none() {
        debug!("could not determine the system drive");
    }

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || Some(&device_path) == system_disk_parent.as_ref() {
            continue;
        }

        let is_removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        if !is_removable {
            continue;
        }

        // /sys/block/<dev>/size is always in 512-byte units.
        let size_sectors = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let mount_points = disks
            .iter()
            .filter(|d| belongs_to(&disk_device_path(d), &device_path))
            .map(|d| d.mount_point().to_path_buf())
            .collect();

        devices.push(Device {
            path: device_path,
            name: device_name,
            size_bytes: size_sectors * 512,
            mount_points,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_map_to_parent_disk() {
        let cases = [
            ("/dev/sdb1", "/dev/sdb"),
            ("/dev/sdb", "/dev/sdb"),
            ("/dev/mmcblk0p2", "/dev/mmcblk0"),
            ("/dev/mmcblk0", "/dev/mmcblk0"),
            ("/dev/nvme0n1p3", "/dev/nvme0n1"),
            ("/dev/nvme0n1", "/dev/nvme0n1"),
        ];
        for (partition, parent) in cases {
            assert_eq!(
                get_parent_device_path(Path::new(partition)),
                PathBuf::from(parent),
                "{partition}"
            );
        }
    }

    #[test]
    fn partition_belongs_to_its_disk_only() {
        assert!(belongs_to(Path::new("/dev/sdc1"), Path::new("/dev/sdc")));
        assert!(belongs_to(Path::new("/dev/sdc"), Path::new("/dev/sdc")));
        assert!(!belongs_to(Path::new("/dev/sdd1"), Path::new("/dev/sdc")));
        assert!(!belongs_to(Path::new("/dev/sdc1"), Path::new("/dev/sdc2")));
    }

    #[test]
    fn regular_file_is_not_a_block_device() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let err = LinuxBackend
            .open_volume(tmp.path(), AccessMode::Read)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
