use std::fmt;
use std::path::PathBuf;

/// A removable volume discovered on the system.
///
/// Populated by the platform-specific discovery functions in the
/// [`crate::platform`] module. `path` is what gets passed to the controller
/// as the volume identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sdb` or `\\.\E:`).
    pub path: PathBuf,
    /// Short name (e.g., "sdb" or "E:").
    pub name: String,
    pub size_bytes: u64,
    /// Where the device or any of its partitions is mounted.
    pub mount_points: Vec<PathBuf>,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.mount_points.is_empty() {
            "[Not mounted]".to_string()
        } else {
            let points: Vec<_> = self
                .mount_points
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            format!("[Mounted at {}]", points.join(", "))
        };

        write!(
            f,
            "{:<15} {:.1} GB {}",
            self.path.display(),
            self.size_gb(),
            mount_info
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_mounts() {
        let mut device = Device {
            path: PathBuf::from("/dev/sdb"),
            name: "sdb".into(),
            size_bytes: 8 * 1024 * 1024 * 1024,
            mount_points: vec![],
        };
        assert_eq!(device.to_string(), "/dev/sdb        8.0 GB [Not mounted]");

        device.mount_points = vec!["/media/a".into(), "/media/b".into()];
        assert!(device.to_string().ends_with("[Mounted at /media/a, /media/b]"));
    }
}
