//! The operation state machine.
//!
//! [`OperationController`] is the only thing that starts reads, writes and
//! verifications, and the only writer of [`OperationStatus`]. It runs one
//! operation at a time on the caller's thread: pre-flight checks, volume
//! acquisition, sizing, the capacity check, then the transfer loop. The
//! volume is released before the status goes back to `Idle` on every path.
//!
//! Front ends observe it through an [`EventSink`] and influence it through
//! confirmations and a [`ControlHandle`].
use crate::access::{AccessMode, DeviceAccess, Volume};
use crate::config::{ImagingConfig, Sizing};
use crate::error::{ImagingError, PreflightError, Result};
use crate::hash::{self, HashAlgorithm, HashResult};
use crate::image::{self, ImageFile};
use crate::partition;
use crate::space::{self, SpaceVerdict};
use crate::transfer::{
    CancelFlag, Direction, Outcome, ProgressSample, SectorIo, TransferEngine, TransferObserver,
    TransferPlan,
};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Process-wide operation state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperationStatus {
    #[default]
    Idle,
    Reading,
    Writing,
    Verifying,
    Canceled,
    Exit,
}

impl OperationStatus {
    /// True while a transfer is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperationStatus::Reading | OperationStatus::Writing | OperationStatus::Verifying
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Idle => "idle",
            OperationStatus::Reading => "reading",
            OperationStatus::Writing => "writing",
            OperationStatus::Verifying => "verifying",
            OperationStatus::Canceled => "canceled",
            OperationStatus::Exit => "exiting",
        };
        f.write_str(s)
    }
}

/// The three transfer operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    Verify,
}

impl OperationKind {
    fn status(self) -> OperationStatus {
        match self {
            OperationKind::Read => OperationStatus::Reading,
            OperationKind::Write => OperationStatus::Writing,
            OperationKind::Verify => OperationStatus::Verifying,
        }
    }

    fn direction(self) -> Direction {
        match self {
            OperationKind::Read => Direction::ReadToFile,
            OperationKind::Write => Direction::FileToVolume,
            OperationKind::Verify => Direction::VerifyAgainstFile,
        }
    }

    fn access_mode(self) -> AccessMode {
        match self {
            OperationKind::Write => AccessMode::Write,
            OperationKind::Read | OperationKind::Verify => AccessMode::Read,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Verify => "verify",
        };
        f.write_str(s)
    }
}

/// Conditions reported to the user when an operation cannot finish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    ImageFileDoesNotExist,
    ImageFilePermissions,
    ImageFileContainsNoData,
    ImageOnTargetDrive,
    CannotOpenVolume,
    NoLockOnVolume,
    FailedToUnmount,
    NoMedia,
    InsufficientSpace {
        required: u64,
        available: u64,
        sector_size: u32,
        data_found: bool,
    },
    UnspecifiedIoError,
    VerifyMismatch {
        sector: u64,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ImageFileDoesNotExist => write!(f, "The selected image file does not exist."),
            Warning::ImageFilePermissions => {
                write!(f, "You do not have permission to access the image file.")
            }
            Warning::ImageFileContainsNoData => write!(f, "The image file contains no data."),
            Warning::ImageOnTargetDrive => {
                write!(f, "The image file cannot be located on the target device.")
            }
            Warning::CannotOpenVolume => write!(f, "The volume could not be opened."),
            Warning::NoLockOnVolume => {
                write!(f, "Could not get exclusive access to the volume. Is it in use?")
            }
            Warning::FailedToUnmount => write!(f, "Could not unmount the volume."),
            Warning::NoMedia => write!(f, "The device reports no media (size 0)."),
            Warning::InsufficientSpace {
                required,
                available,
                sector_size,
                data_found,
            } => write!(
                f,
                "Not enough space: {required} sectors required, {available} available \
                 (sector size {sector_size}). The extra space {} appear to contain data.",
                if *data_found { "DOES" } else { "does not" }
            ),
            Warning::UnspecifiedIoError => write!(f, "An I/O error occurred."),
            Warning::VerifyMismatch { sector } => {
                write!(f, "Verification failed at sector {sector}.")
            }
        }
    }
}

/// Decisions the controller asks the user for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// A write is about to destroy the contents of `volume`.
    OverwriteVolume { volume: PathBuf },
    /// A read is about to replace an existing file.
    OverwriteImageFile { path: PathBuf },
    /// The transfer does not fit and would be cut to `available` sectors.
    Truncate {
        operation: OperationKind,
        required: u64,
        available: u64,
        sector_size: u32,
        data_found: bool,
    },
}

/// The narrow interface a front end implements to follow operations.
///
/// Every method except [`confirm`](EventSink::confirm) has a no-op default.
pub trait EventSink {
    fn status_changed(&mut self, _status: OperationStatus) {}

    fn progress_range(&mut self, _min: u64, _max: u64) {}

    fn progress(&mut self, _sample: &ProgressSample) {}

    /// Called after every chunk. The place to pump an event loop.
    fn chunk_transferred(&mut self, _sectors_done: u64) {}

    fn progress_reset(&mut self) {}

    fn operation_complete(&mut self, _canceled: bool) {}

    fn warning(&mut self, _warning: &Warning) {}

    fn hash_generated(&mut self, _result: &HashResult) {}

    fn confirm(&mut self, request: &Confirmation) -> bool;
}

/// Lets another thread cancel the running operation or ask for shutdown.
#[derive(Clone, Debug, Default)]
pub struct ControlHandle {
    cancel: CancelFlag,
    shutdown: Arc<AtomicBool>,
}

impl ControlHandle {
    /// Stops the running operation at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels any running operation and moves to `Exit` once idle.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Runs read, write, verify and hash requests one at a time.
pub struct OperationController<B: DeviceAccess, S: EventSink> {
    backend: B,
    sink: S,
    config: ImagingConfig,
    status: OperationStatus,
    control: ControlHandle,
}

impl<B: DeviceAccess, S: EventSink> OperationController<B, S> {
    pub fn new(backend: B, sink: S, config: ImagingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            sink,
            config,
            status: OperationStatus::Idle,
            control: ControlHandle::default(),
        })
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn config(&self) -> &ImagingConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Moves to `Exit` if idle; otherwise cancels and exits when idle.
    pub fn request_shutdown(&mut self) {
        self.control.request_shutdown();
        if self.status == OperationStatus::Idle {
            self.set_status(OperationStatus::Exit);
        }
    }

    /// Images `volume` into the file at `image`.
    ///
    /// # Arguments
    ///
    /// * `volume` - The device to read from. It is locked and unmounted for
    ///   the whole read.
    /// * `image` - The image file to create. An existing file is only
    ///   replaced after an `OverwriteImageFile` confirmation.
    ///
    /// With [`Sizing::AllocatedPartitions`] only the sectors up to the end
    /// of the last MBR partition are read. If the destination filesystem
    /// cannot hold the image, a `Truncate` confirmation decides whether the
    /// read is shortened. A canceled read removes the partial image.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - Another operation is running, or shutdown was requested.
    /// - The image lives on the volume being read.
    /// - The volume cannot be opened, locked, unmounted or sized, or holds
    ///   no media.
    /// - The image does not fit and truncation is declined.
    /// - An I/O error occurs during the transfer.
    pub fn read(&mut self, volume: &Path, image: &Path) -> Result<Outcome> {
        self.run(OperationKind::Read, volume, image)
    }

    /// Writes the file at `image` onto `volume`.
    ///
    /// # Arguments
    ///
    /// * `volume` - The device to overwrite. Nothing is opened before the
    ///   `OverwriteVolume` confirmation is granted.
    /// * `image` - The raw image to write, starting at sector 0. A partial
    ///   last sector is padded with zeros.
    ///
    /// An image larger than the volume is only written after a `Truncate`
    /// confirmation, and then only as far as the volume reaches.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - Another operation is running, or shutdown was requested.
    /// - The image is missing, unreadable, empty or stored on the volume.
    /// - The user declines to overwrite the volume.
    /// - The volume cannot be opened, locked, unmounted or sized, or holds
    ///   no media.
    /// - The image does not fit and truncation is declined.
    /// - An I/O error occurs during the transfer.
    pub fn write(&mut self, volume: &Path, image: &Path) -> Result<Outcome> {
        self.run(OperationKind::Write, volume, image)
    }

    /// Compares the file at `image` with the start of `volume`.
    ///
    /// # Arguments
    ///
    /// * `volume` - The device to check, opened read-only.
    /// * `image` - The image it is expected to start with.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - Another operation is running, or shutdown was requested.
    /// - The image is missing, unreadable, empty or stored on the volume.
    /// - The volume cannot be opened, locked, unmounted or sized, or holds
    ///   no media.
    /// - The image is larger than the volume and truncation is declined.
    /// - A chunk differs from the image ([`ImagingError::Transfer`] with the
    ///   first sector of that chunk) or cannot be read.
    pub fn verify(&mut self, volume: &Path, image: &Path) -> Result<Outcome> {
        self.run(OperationKind::Verify, volume, image)
    }

    /// Hashes an image file. Only allowed while idle; does not change the
    /// status.
    pub fn hash(&mut self, image: &Path, algorithm: HashAlgorithm) -> Result<HashResult> {
        self.ensure_idle()?;
        if let Err(e) = image::check_source(image) {
            return Err(self.report(e.into()));
        }
        info!(image = %image.display(), %algorithm, "hashing image");
        match hash::compute(image, algorithm) {
            Ok(result) => {
                info!(hash = %result.hex, "hash generated");
                self.sink.hash_generated(&result);
                Ok(result)
            }
            Err(e) => Err(self.report(ImagingError::Image(e))),
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.status {
            OperationStatus::Idle if self.control.shutdown_requested() => {
                Err(ImagingError::ShuttingDown)
            }
            OperationStatus::Idle => Ok(()),
            OperationStatus::Exit => Err(ImagingError::ShuttingDown),
            other => Err(ImagingError::Busy(other)),
        }
    }

    fn set_status(&mut self, status: OperationStatus) {
        if self.status != status {
            debug!(from = %self.status, to = %status, "status changed");
            self.status = status;
            self.sink.status_changed(status);
        }
    }

    fn confirm(&mut self, request: Confirmation) -> bool {
        if self.config.skip_confirmations {
            debug!(?request, "confirmation skipped");
            return true;
        }
        self.sink.confirm(&request)
    }

    /// Emits the warning for a failure that happened before the operation
    /// started, and hands the error back.
    fn report(&mut self, error: ImagingError) -> ImagingError {
        if let Some(warning) = error.warning() {
            warn!("{error}");
            self.sink.warning(&warning);
        }
        error
    }

    fn run(&mut self, kind: OperationKind, volume: &Path, image: &Path) -> Result<Outcome> {
        self.ensure_idle()?;

        if let Err(e) = self.preflight(kind, volume, image) {
            return Err(self.report(e));
        }

        let confirmation = match kind {
            OperationKind::Write => Some(Confirmation::OverwriteVolume {
                volume: volume.to_path_buf(),
            }),
            OperationKind::Read if image.exists() => Some(Confirmation::OverwriteImageFile {
                path: image.to_path_buf(),
            }),
            _ => None,
        };
        if let Some(request) = confirmation {
            if !self.confirm(request) {
                info!(%kind, "operation declined");
                self.sink.operation_complete(true);
                return Err(ImagingError::Declined);
            }
        }

        info!(%kind, volume = %volume.display(), image = %image.display(), "starting operation");
        self.control.cancel.reset();
        self.set_status(kind.status());

        let result = self.execute(kind, volume, image);

        self.finish(kind, result)
    }

    fn preflight(&self, kind: OperationKind, volume: &Path, image: &Path) -> Result<()> {
        if matches!(kind, OperationKind::Write | OperationKind::Verify) {
            image::check_source(image)?;
        }
        if self.backend.hosts_path(volume, image) {
            return Err(PreflightError::OnTargetDrive {
                image: image.to_path_buf(),
                volume: volume.to_path_buf(),
            }
            .into());
        }
        Ok(())
    }

    /// Everything acquired in here is released when it returns.
    fn execute(&mut self, kind: OperationKind, volume_id: &Path, image_path: &Path) -> Result<Outcome> {
        let mut volume = Volume::acquire(&self.backend, volume_id, kind.access_mode())?;
        let sector_size = volume.sector_size();
        let device_sectors = volume.sector_count();
        if device_sectors == 0 {
            return Err(ImagingError::NoMedia(volume_id.to_path_buf()));
        }

        match kind {
            OperationKind::Read => {
                let required = match self.config.sizing {
                    Sizing::FullDevice => device_sectors,
                    Sizing::AllocatedPartitions => {
                        let extent = partition::scan_used_extent(&mut volume)
                            .map_err(ImagingError::PartitionScan)?;
                        if extent > device_sectors {
                            warn!(
                                extent,
                                device_sectors, "partition table extends past end of device"
                            );
                        }
                        extent.min(device_sectors)
                    }
                };
                let mut plan = TransferPlan::new(required, self.config.chunk_sectors);
                if let Some(available) = self.read_capacity(image_path, sector_size) {
                    let verdict = space::evaluate(
                        required,
                        available,
                        &mut volume,
                        self.config.chunk_sectors,
                    );
                    self.settle_capacity(kind, verdict, sector_size, &mut plan)?;
                }

                let mut file = ImageFile::create_destination(image_path, sector_size)
                    .map_err(ImagingError::Image)?;
                let outcome = self.transfer(&mut volume, &mut file, kind, &plan)?;
                volume.release();
                if outcome == Outcome::Canceled {
                    drop(file);
                    // A canceled read leaves nothing usable behind.
                    if let Err(e) = fs::remove_file(image_path) {
                        warn!(image = %image_path.display(), "could not remove partial image: {e}");
                    }
                }
                Ok(outcome)
            }
            OperationKind::Write | OperationKind::Verify => {
                let mut file =
                    ImageFile::open_source(image_path, sector_size).map_err(ImagingError::Image)?;
                let required = file.size_in_sectors();
                let mut plan = TransferPlan::new(required, self.config.chunk_sectors);
                let verdict =
                    space::evaluate(required, device_sectors, &mut file, self.config.chunk_sectors);
                self.settle_capacity(kind, verdict, sector_size, &mut plan)?;

                let outcome = self.transfer(&mut volume, &mut file, kind, &plan)?;
                volume.release();
                Ok(outcome)
            }
        }
    }

    /// Sectors the read destination can hold: free space plus the size of
    /// the file being replaced.
    fn read_capacity(&self, image_path: &Path, sector_size: u32) -> Option<u64> {
        let free = match self.backend.available_space(image_path) {
            Some(free) => free,
            None => {
                warn!(image = %image_path.display(), "free space unknown; skipping capacity check");
                return None;
            }
        };
        let existing = fs::metadata(image_path).map(|m| m.len()).unwrap_or(0);
        Some((free + existing) / sector_size as u64)
    }

    fn settle_capacity(
        &mut self,
        kind: OperationKind,
        verdict: SpaceVerdict,
        sector_size: u32,
        plan: &mut TransferPlan,
    ) -> Result<()> {
        let SpaceVerdict::Shortfall {
            required,
            available,
            data_found,
        } = verdict
        else {
            return Ok(());
        };
        let capacity_error = ImagingError::Capacity {
            required,
            available,
            sector_size,
            data_found,
        };
        if available == 0 {
            return Err(capacity_error);
        }

        warn!(required, available, data_found, "transfer does not fit");
        let confirmed = self.confirm(Confirmation::Truncate {
            operation: kind,
            required,
            available,
            sector_size,
            data_found,
        });
        if !confirmed {
            return Err(capacity_error);
        }
        plan.truncate_to(available);
        info!(sectors = available, "transfer truncated");
        Ok(())
    }

    fn transfer<V, F>(
        &mut self,
        volume: &mut V,
        image: &mut F,
        kind: OperationKind,
        plan: &TransferPlan,
    ) -> Result<Outcome>
    where
        V: SectorIo + ?Sized,
        F: SectorIo + ?Sized,
    {
        self.sink.progress_range(0, plan.total_sectors);
        let cancel = self.control.cancel.clone();
        let engine = TransferEngine::new(*plan, &cancel, self.config.sample_interval);
        let mut observer = Observer {
            sink: &mut self.sink,
            status: &mut self.status,
            cancel: &cancel,
        };
        Ok(engine.run(volume, image, kind.direction(), &mut observer)?)
    }

    fn finish(&mut self, kind: OperationKind, result: Result<Outcome>) -> Result<Outcome> {
        self.sink.progress_reset();
        match &result {
            Ok(Outcome::Completed) => {
                info!(%kind, "operation complete");
                self.sink.operation_complete(false);
            }
            Ok(Outcome::Canceled) => {
                info!(%kind, "operation canceled");
                self.set_status(OperationStatus::Canceled);
                self.sink.operation_complete(true);
            }
            Err(e) => match e.warning() {
                Some(warning) => {
                    warn!(%kind, "operation failed: {e}");
                    self.sink.warning(&warning);
                }
                None => self.sink.operation_complete(true),
            },
        }

        self.set_status(OperationStatus::Idle);
        if self.control.shutdown_requested() {
            self.set_status(OperationStatus::Exit);
        }
        result
    }
}

/// Forwards engine callbacks to the sink and moves the status to
/// `Canceled` as soon as a cancellation is seen between chunks.
struct Observer<'a, S: EventSink> {
    sink: &'a mut S,
    status: &'a mut OperationStatus,
    cancel: &'a CancelFlag,
}

impl<S: EventSink> TransferObserver for Observer<'_, S> {
    fn chunk_done(&mut self, sectors_done: u64) {
        self.sink.chunk_transferred(sectors_done);
        if self.cancel.is_canceled() && self.status.is_active() {
            *self.status = OperationStatus::Canceled;
            self.sink.status_changed(OperationStatus::Canceled);
        }
    }

    fn progress(&mut self, sample: &ProgressSample) {
        self.sink.progress(sample);
    }
}
