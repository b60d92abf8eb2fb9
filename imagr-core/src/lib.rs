//! The core, UI-agnostic library for the `imagr` volume imaging utility.
//!
//! `imagr-core` reads a volume into an image file, writes an image file onto
//! a volume and verifies the two against each other, sector by sector, while
//! holding the volume exclusively. It can also hash image files. Any
//! front end, command line or graphical, drives it through an
//! [`OperationController`](controller::OperationController) and follows
//! along through an [`EventSink`](controller::EventSink).
//!
//! The library is structured into several key modules:
//! - [`controller`]: the operation state machine and the event sink trait.
//! - [`access`]: exclusive volume access, and the traits a platform implements.
//! - [`platform`]: the host backends, device discovery and free-space queries.
//! - [`transfer`]: the chunked transfer loop with progress and cancellation.
//! - [`partition`] and [`space`]: sizing a transfer before it starts.
//! - [`image`] and [`hash`]: image files and their digests.
//!
//! ## Example: Writing an Image
//!
//! ```rust,no_run
//! use imagr_core::config::ImagingConfig;
//! use imagr_core::controller::{Confirmation, EventSink, OperationController, Warning};
//! use imagr_core::platform::{self, NativeBackend};
//! use std::path::Path;
//!
//! struct Printer;
//!
//! impl EventSink for Printer {
//!     fn chunk_transferred(&mut self, sectors_done: u64) {
//!         println!("{sectors_done} sectors done");
//!     }
//!
//!     fn warning(&mut self, warning: &Warning) {
//!         eprintln!("{warning}");
//!     }
//!
//!     fn confirm(&mut self, request: &Confirmation) -> bool {
//!         println!("{request:?}: yes");
//!         true
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let devices = platform::get_removable_devices()?;
//!     let device = devices.first().ok_or_else(|| anyhow::anyhow!("no removable devices"))?;
//!
//!     let mut controller =
//!         OperationController::new(NativeBackend, Printer, ImagingConfig::default())?;
//!
//!     // Ctrl+C handlers and UI buttons hold a clone of this.
//!     let control = controller.control_handle();
//!     let _ = control;
//!
//!     controller.write(&device.path, Path::new("path/to/image.img"))?;
//!     controller.verify(&device.path, Path::new("path/to/image.img"))?;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod hash;
pub mod image;
pub mod partition;
pub mod platform;
pub mod space;
pub mod transfer;

pub use access::{AccessMode, DeviceAccess, Volume, VolumeHandle};
pub use config::{ImagingConfig, Sizing};
pub use controller::{
    Confirmation, ControlHandle, EventSink, OperationController, OperationKind, OperationStatus,
    Warning,
};
pub use device::Device;
pub use error::{ImagingError, Result};
pub use hash::{HashAlgorithm, HashResult};
pub use transfer::{CancelFlag, Outcome, ProgressSample};
