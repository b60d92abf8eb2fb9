//! Provides platform-specific functionality.
//!
//! Each host submodule implements [`DeviceAccess`](crate::access::DeviceAccess)
//! for the raw volumes of that OS and exposes `get_removable_devices` for
//! discovery. The right one is picked with `#[cfg]` and re-exported, together
//! with a [`NativeBackend`] alias, so callers never name the OS.
//!
//! [`file`] and [`memory`] are host-independent backends.

pub mod file;
pub mod memory;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::{LinuxBackend as NativeBackend, get_removable_devices};

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::{WindowsBackend as NativeBackend, get_removable_devices};

use std::path::Path;

/// Free bytes available to the current user on the filesystem that holds
/// `path`. If `path` does not exist yet, its parent directory is asked.
///
/// Returns `None` if the host cannot tell.
pub fn available_space(path: &Path) -> Option<u64> {
    let probe = existing_ancestor(path)?;
    host_available_space(probe)
}

fn existing_ancestor(path: &Path) -> Option<&Path> {
    let mut candidate = Some(path);
    while let Some(p) = candidate {
        if p.as_os_str().is_empty() {
            return Some(Path::new("."));
        }
        if p.exists() {
            return Some(p);
        }
        candidate = p.parent();
    }
    None
}

#[cfg(unix)]
fn host_available_space(path: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => Some(stat.blocks_available() as u64 * stat.fragment_size() as u64),
        Err(e) => {
            tracing::debug!(path = %path.display(), "statvfs failed: {e}");
            None
        }
    }
}

#[cfg(windows)]
fn host_available_space(path: &Path) -> Option<u64> {
    let canonical = path.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    // The disk with the longest mount point that prefixes the path.
    disks
        .iter()
        .filter(|d| canonical.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

#[cfg(not(any(unix, windows)))]
fn host_available_space(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-yet").join("out.img");

        assert_eq!(existing_ancestor(&missing), Some(dir.path()));
        assert!(available_space(&missing).is_some());
    }

    #[test]
    fn relative_path_probes_current_dir() {
        assert_eq!(
            existing_ancestor(Path::new("definitely-missing.img")),
            Some(Path::new("."))
        );
    }
}
