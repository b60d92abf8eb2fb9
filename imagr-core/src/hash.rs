//! Content hashes of image files.
//!
//! Hashing is a plain sequential read of the file, independent of the
//! transfer engine and of any volume.
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Supported digest algorithms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(format!("unknown hash algorithm '{other}' (expected md5, sha1 or sha256)")),
        }
    }
}

/// A finished digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashResult {
    pub algorithm: HashAlgorithm,
    pub hex: String,
    pub bytes_hashed: u64,
}

fn digest_reader<D: Digest, R: Read>(reader: &mut R) -> io::Result<(Vec<u8>, u64)> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize().to_vec(), total))
}

/// Hashes everything `reader` yields.
pub fn hash_reader<R: Read>(reader: &mut R, algorithm: HashAlgorithm) -> io::Result<HashResult> {
    let (digest, bytes_hashed) = match algorithm {
        HashAlgorithm::Md5 => digest_reader::<Md5, _>(reader)?,
        HashAlgorithm::Sha1 => digest_reader::<Sha1, _>(reader)?,
        HashAlgorithm::Sha256 => digest_reader::<Sha256, _>(reader)?,
    };
    Ok(HashResult {
        algorithm,
        hex: hex::encode(digest),
        bytes_hashed,
    })
}

/// Hashes the file at `path`.
pub fn compute(path: &Path, algorithm: HashAlgorithm) -> io::Result<HashResult> {
    let mut file = File::open(path)?;
    hash_reader(&mut file, algorithm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn known_digests() {
        let cases = [
            (HashAlgorithm::Md5, "65a8e27d8879283831b664bd8b7f0ad4"),
            (HashAlgorithm::Sha1, "0a0a9f2a6772942557ab5355d76af442f8f65e01"),
            (
                HashAlgorithm::Sha256,
                "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f",
            ),
        ];
        for (algorithm, expected) in cases {
            let result = hash_reader(&mut Cursor::new(b"Hello, World!"), algorithm).unwrap();
            assert_eq!(result.hex, expected, "{algorithm}");
            assert_eq!(result.bytes_hashed, 13);
        }
    }

    #[test]
    fn file_hash_matches_reader_hash() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..3 * BUFFER_SIZE as u32 / 2).map(|i| i as u8).collect();
        tmp.write_all(&data).unwrap();

        let from_file = compute(tmp.path(), HashAlgorithm::Sha256).unwrap();
        let from_reader = hash_reader(&mut Cursor::new(&data), HashAlgorithm::Sha256).unwrap();

        assert_eq!(from_file, from_reader);
    }

    #[test]
    fn parses_algorithm_names() {
        assert_eq!("MD5".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Md5));
        assert_eq!("sha-1".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha1));
        assert_eq!("Sha256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
        assert!("crc32".parse::<HashAlgorithm>().is_err());
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Sha256);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = compute(Path::new("/nonexistent/imagr.img"), HashAlgorithm::Md5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
