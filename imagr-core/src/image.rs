//! Image files on the host filesystem, addressed in volume-sized sectors.
use crate::error::PreflightError;
use crate::transfer::SectorIo;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Which side of a transfer the file is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ImageMode {
    /// Read from, for write and verify.
    Source,
    /// Written to, for read.
    Destination,
}

/// An open image file.
///
/// Sizes are expressed in sectors of the volume it is paired with. A
/// trailing partial sector counts as a whole one and reads back
/// zero-padded.
pub struct ImageFile {
    file: File,
    path: PathBuf,
    mode: ImageMode,
    sector_size: u32,
    len_bytes: u64,
}

impl ImageFile {
    pub fn open_source(path: &Path, sector_size: u32) -> io::Result<Self> {
        let file = File::open(path)?;
        let len_bytes = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode: ImageMode::Source,
            sector_size,
            len_bytes,
        })
    }

    /// Creates (or truncates) the file an image is read into.
    pub fn create_destination(path: &Path, sector_size: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode: ImageMode::Destination,
            sector_size,
            len_bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len_bytes(&self) -> u64 {
        self.len_bytes
    }

    pub fn size_in_sectors(&self) -> u64 {
        sectors_for(self.len_bytes, self.sector_size)
    }
}

/// Number of `sector_size` sectors needed to hold `bytes`, rounded up.
pub fn sectors_for(bytes: u64, sector_size: u32) -> u64 {
    bytes.div_ceil(sector_size as u64)
}

impl SectorIo for ImageFile {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(start * self.sector_size as u64))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        // Past end of file reads as zeros, matching what a write pads with.
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_sectors(&mut self, start: u64, buf: &[u8]) -> io::Result<()> {
        if self.mode != ImageMode::Destination {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "image file was opened as a source",
            ));
        }
        let offset = start * self.sector_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.len_bytes = self.len_bytes.max(offset + buf.len() as u64);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

/// Checks an image that is about to be written or verified.
///
/// Returns its length in bytes.
pub fn check_source(path: &Path) -> Result<u64, PreflightError> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(PreflightError::Permissions(path.to_path_buf()));
        }
        Err(_) => return Err(PreflightError::DoesNotExist(path.to_path_buf())),
    };
    if !metadata.is_file() {
        return Err(PreflightError::DoesNotExist(path.to_path_buf()));
    }
    if let Err(e) = File::open(path) {
        return Err(match e.kind() {
            io::ErrorKind::NotFound => PreflightError::DoesNotExist(path.to_path_buf()),
            _ => PreflightError::Permissions(path.to_path_buf()),
        });
    }
    if metadata.len() == 0 {
        return Err(PreflightError::ContainsNoData(path.to_path_buf()));
    }
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, tempdir};

    #[test]
    fn partial_sector_rounds_up_and_pads() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[0xAB; 700]).unwrap();
        let mut image = ImageFile::open_source(tmp.path(), 512).unwrap();

        assert_eq!(image.size_in_sectors(), 2);

        let mut buf = vec![0xFFu8; 1024];
        image.read_sectors(0, &mut buf).unwrap();
        assert!(buf[..700].iter().all(|&b| b == 0xAB));
        assert!(buf[700..].iter().all(|&b| b == 0));
    }

    #[test]
    fn destination_writes_at_sector_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.img");
        let mut image = ImageFile::create_destination(&path, 512).unwrap();

        image.write_sectors(1, &[3u8; 512]).unwrap();
        image.flush().unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 1024);
        assert!(bytes[..512].iter().all(|&b| b == 0));
        assert!(bytes[512..].iter().all(|&b| b == 3));
        assert_eq!(image.size_in_sectors(), 2);
    }

    #[test]
    fn source_refuses_writes() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 512]).unwrap();
        let mut image = ImageFile::open_source(tmp.path(), 512).unwrap();

        let err = image.write_sectors(0, &[0u8; 512]).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn preflight_classifies_files() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.img");
        assert!(matches!(
            check_source(&missing),
            Err(PreflightError::DoesNotExist(_))
        ));

        assert!(matches!(
            check_source(dir.path()),
            Err(PreflightError::DoesNotExist(_))
        ));

        let empty = dir.path().join("empty.img");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(
            check_source(&empty),
            Err(PreflightError::ContainsNoData(_))
        ));

        let good = dir.path().join("good.img");
        fs::write(&good, [9u8; 10]).unwrap();
        assert_eq!(check_source(&good).unwrap(), 10);
    }

    #[test]
    fn sector_rounding() {
        assert_eq!(sectors_for(0, 512), 0);
        assert_eq!(sectors_for(1, 512), 1);
        assert_eq!(sectors_for(512, 512), 1);
        assert_eq!(sectors_for(3000 * 512, 512), 3000);
        assert_eq!(sectors_for(4097, 4096), 2);
    }
}
