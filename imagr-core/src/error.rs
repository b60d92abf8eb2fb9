//! Error types for imaging operations.
//!
//! Every failure an operation can end in is represented here, and each one
//! maps onto exactly one [`Warning`](crate::controller::Warning) for the
//! front end via [`ImagingError::warning`].
use crate::controller::{OperationStatus, Warning};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for imaging operations.
pub type Result<T> = std::result::Result<T, ImagingError>;

/// Failures while acquiring exclusive access to a volume.
///
/// Whatever was acquired before the failing step has already been released
/// by the time one of these is returned.
#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("cannot open volume {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot lock volume {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot unmount volume {path}: {source}")]
    Unmount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot query geometry of {path}: {source}")]
    Geometry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Pre-flight checks on the image file, run before any volume is touched.
#[derive(Error, Debug)]
pub enum PreflightError {
    #[error("image file {0} does not exist")]
    DoesNotExist(PathBuf),

    #[error("no permission to access image file {0}")]
    Permissions(PathBuf),

    #[error("image file {0} contains no data")]
    ContainsNoData(PathBuf),

    #[error("image file {image} is located on the target volume {volume}")]
    OnTargetDrive { image: PathBuf, volume: PathBuf },
}

/// Failures inside the chunked transfer loop.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("read failed at sector {sector}: {source}")]
    Read {
        sector: u64,
        #[source]
        source: io::Error,
    },

    #[error("write failed at sector {sector}: {source}")]
    Write {
        sector: u64,
        #[source]
        source: io::Error,
    },

    #[error("verification failed at sector {sector}")]
    VerifyMismatch { sector: u64 },
}

/// Invalid runtime configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk size must be at least one sector")]
    ZeroChunk,

    #[error("progress sample interval must be non-zero")]
    ZeroInterval,
}

/// The single error type returned by [`OperationController`](crate::controller::OperationController).
#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("another operation is in progress ({0})")]
    Busy(OperationStatus),

    #[error("shutdown has been requested")]
    ShuttingDown,

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("no media present in {0}")]
    NoMedia(PathBuf),

    #[error(
        "insufficient space: {required} sectors required, {available} available \
         (sector size {sector_size}, data beyond capacity: {data_found})"
    )]
    Capacity {
        required: u64,
        available: u64,
        sector_size: u32,
        data_found: bool,
    },

    #[error("cannot read partition table: {0}")]
    PartitionScan(#[source] io::Error),

    #[error("image file error: {0}")]
    Image(#[source] io::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("operation declined")]
    Declined,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ImagingError {
    /// The warning a front end should show for this error, if any.
    ///
    /// `Busy`, `ShuttingDown` and `Config` reject a request before an
    /// operation starts and `Declined` is reported as a canceled completion,
    /// so none of them carries a warning.
    pub fn warning(&self) -> Option<Warning> {
        let warning = match self {
            ImagingError::Busy(_)
            | ImagingError::ShuttingDown
            | ImagingError::Declined
            | ImagingError::Config(_) => return None,
            ImagingError::Preflight(PreflightError::DoesNotExist(_)) => {
                Warning::ImageFileDoesNotExist
            }
            ImagingError::Preflight(PreflightError::Permissions(_)) => {
                Warning::ImageFilePermissions
            }
            ImagingError::Preflight(PreflightError::ContainsNoData(_)) => {
                Warning::ImageFileContainsNoData
            }
            ImagingError::Preflight(PreflightError::OnTargetDrive { .. }) => {
                Warning::ImageOnTargetDrive
            }
            ImagingError::Acquire(AcquireError::Open { .. }) => Warning::CannotOpenVolume,
            ImagingError::Acquire(AcquireError::Lock { .. }) => Warning::NoLockOnVolume,
            ImagingError::Acquire(AcquireError::Unmount { .. }) => Warning::FailedToUnmount,
            ImagingError::Acquire(AcquireError::Geometry { .. }) => Warning::UnspecifiedIoError,
            ImagingError::NoMedia(_) => Warning::NoMedia,
            ImagingError::Capacity {
                required,
                available,
                sector_size,
                data_found,
            } => Warning::InsufficientSpace {
                required: *required,
                available: *available,
                sector_size: *sector_size,
                data_found: *data_found,
            },
            ImagingError::PartitionScan(_) | ImagingError::Image(_) => {
                Warning::UnspecifiedIoError
            }
            ImagingError::Transfer(TransferError::VerifyMismatch { sector }) => {
                Warning::VerifyMismatch { sector: *sector }
            }
            ImagingError::Transfer(_) => Warning::UnspecifiedIoError,
        };
        Some(warning)
    }
}
