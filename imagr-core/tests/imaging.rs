//! End-to-end runs of the controller against file-backed volumes.
use imagr_core::config::{ImagingConfig, Sizing};
use imagr_core::controller::{
    Confirmation, EventSink, OperationController, OperationStatus, Warning,
};
use imagr_core::error::ImagingError;
use imagr_core::hash::{self, HashAlgorithm};
use imagr_core::platform::file::FileBackend;
use imagr_core::platform::memory::MemoryBackend;
use imagr_core::transfer::{Outcome, ProgressSample};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Status(OperationStatus),
    Range(u64),
    Reset,
    Complete(bool),
    Warning(Warning),
    Confirm(Confirmation),
}

#[derive(Default)]
struct RecordingSink {
    events: Vec<Event>,
    chunks: Vec<u64>,
    samples: Vec<ProgressSample>,
    decline_truncation: bool,
    decline_all: bool,
}

impl RecordingSink {
    fn completions_and_warnings(&self) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Complete(_) | Event::Warning(_)))
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn status_changed(&mut self, status: OperationStatus) {
        self.events.push(Event::Status(status));
    }

    fn progress_range(&mut self, _min: u64, max: u64) {
        self.events.push(Event::Range(max));
    }

    fn progress(&mut self, sample: &ProgressSample) {
        self.samples.push(sample.clone());
    }

    fn chunk_transferred(&mut self, sectors_done: u64) {
        self.chunks.push(sectors_done);
    }

    fn progress_reset(&mut self) {
        self.events.push(Event::Reset);
    }

    fn operation_complete(&mut self, canceled: bool) {
        self.events.push(Event::Complete(canceled));
    }

    fn warning(&mut self, warning: &Warning) {
        self.events.push(Event::Warning(warning.clone()));
    }

    fn confirm(&mut self, request: &Confirmation) -> bool {
        self.events.push(Event::Confirm(request.clone()));
        if self.decline_all {
            return false;
        }
        !(self.decline_truncation && matches!(request, Confirmation::Truncate { .. }))
    }
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, bytes).unwrap();
        path
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8 | 1).collect()
}

type FileController = OperationController<FileBackend, RecordingSink>;

fn file_controller(chunk_sectors: u64) -> FileController {
    let config = ImagingConfig {
        chunk_sectors,
        sample_interval: Duration::from_nanos(1),
        ..Default::default()
    };
    OperationController::new(FileBackend::new(), RecordingSink::default(), config).unwrap()
}

#[test]
fn write_then_verify_file_volume() {
    let ws = Workspace::new();
    let volume = ws.file("volume.bin", &vec![0u8; 512 * 256]);
    let data = patterned(512 * 200 + 37);
    let image = ws.file("image.img", &data);
    let mut ctl = file_controller(64);

    assert_eq!(ctl.write(&volume, &image).unwrap(), Outcome::Completed);
    assert_eq!(ctl.verify(&volume, &image).unwrap(), Outcome::Completed);

    let written = fs::read(&volume).unwrap();
    assert_eq!(&written[..data.len()], &data[..]);
    assert_eq!(written.len(), 512 * 256);
    assert!(
        !ctl.sink()
            .events
            .iter()
            .any(|e| matches!(e, Event::Warning(_)))
    );
    assert_eq!(ctl.sink().completions_and_warnings().len(), 2);
}

#[test]
fn read_round_trips_through_hash() {
    let ws = Workspace::new();
    let data = patterned(512 * 100);
    let volume = ws.file("volume.bin", &data);
    let out = ws.path("copy.img");
    let mut ctl = file_controller(16);

    ctl.read(&volume, &out).unwrap();

    let from_volume = hash::compute(&volume, HashAlgorithm::Sha256).unwrap();
    let from_image = ctl.hash(&out, HashAlgorithm::Sha256).unwrap();
    assert_eq!(from_volume.hex, from_image.hex);
    assert_eq!(from_image.bytes_hashed, 512 * 100);
}

#[test]
fn progress_reports_every_chunk_in_order() {
    let ws = Workspace::new();
    let volume = ws.file("volume.bin", &vec![0u8; 512 * 100]);
    let image = ws.file("image.img", &patterned(512 * 100));
    let mut ctl = file_controller(30);

    ctl.write(&volume, &image).unwrap();

    assert_eq!(ctl.sink().chunks, vec![30, 60, 90, 100]);
    let samples = &ctl.sink().samples;
    assert!(!samples.is_empty());
    assert!(
        samples
            .windows(2)
            .all(|w| w[0].sectors_done <= w[1].sectors_done)
    );
    assert!(samples.iter().all(|s| s.total_sectors == 100));
}

#[test]
fn oversized_zero_tail_truncates_after_confirmation() {
    let ws = Workspace::new();
    let volume = ws.file("volume.bin", &vec![0u8; 512 * 2048]);
    let mut data = patterned(512 * 2048);
    data.resize(512 * 3000, 0);
    let image = ws.file("image.img", &data);
    let mut ctl = file_controller(1024);

    let outcome = ctl.write(&volume, &image).unwrap();

    assert_eq!(outcome, Outcome::Completed);
    assert!(ctl.sink().events.contains(&Event::Confirm(Confirmation::Truncate {
        operation: imagr_core::controller::OperationKind::Write,
        required: 3000,
        available: 2048,
        sector_size: 512,
        data_found: false,
    })));
    assert!(ctl.sink().events.contains(&Event::Range(2048)));
    assert_eq!(ctl.sink().chunks.last(), Some(&2048));
    assert_eq!(fs::read(&volume).unwrap(), data[..512 * 2048]);
}

#[test]
fn declined_truncation_leaves_volume_untouched() {
    let ws = Workspace::new();
    let original = vec![0xEEu8; 512 * 8];
    let volume = ws.file("volume.bin", &original);
    let image = ws.file("image.img", &patterned(512 * 10));
    let mut ctl = file_controller(4);
    ctl.sink_mut().decline_truncation = true;

    let err = ctl.write(&volume, &image).unwrap_err();

    assert!(matches!(
        err,
        ImagingError::Capacity {
            required: 10,
            available: 8,
            data_found: true,
            ..
        }
    ));
    assert_eq!(fs::read(&volume).unwrap(), original);
    assert_eq!(
        ctl.sink().completions_and_warnings(),
        vec![&Event::Warning(Warning::InsufficientSpace {
            required: 10,
            available: 8,
            sector_size: 512,
            data_found: true,
        })]
    );
    assert_eq!(ctl.status(), OperationStatus::Idle);
}

#[test]
fn single_flipped_byte_fails_verification_at_sector_zero() {
    let ws = Workspace::new();
    let data = patterned(512);
    let mut on_volume = data.clone();
    on_volume[0] ^= 0x80;
    let volume = ws.file("volume.bin", &on_volume);
    let image = ws.file("image.img", &data);
    let mut ctl = file_controller(1024);

    let err = ctl.verify(&volume, &image).unwrap_err();

    assert_eq!(err.warning(), Some(Warning::VerifyMismatch { sector: 0 }));
    assert_eq!(
        ctl.sink().completions_and_warnings(),
        vec![&Event::Warning(Warning::VerifyMismatch { sector: 0 })]
    );
}

#[test]
fn declining_overwrite_performs_no_io() {
    let ws = Workspace::new();
    let original = vec![0x11u8; 512 * 4];
    let volume = ws.file("volume.bin", &original);
    let image = ws.file("image.img", &patterned(512 * 4));
    let mut ctl = file_controller(4);
    ctl.sink_mut().decline_all = true;

    let err = ctl.write(&volume, &image).unwrap_err();

    assert!(matches!(err, ImagingError::Declined));
    assert_eq!(fs::read(&volume).unwrap(), original);
    assert_eq!(
        ctl.sink().events,
        vec![
            Event::Confirm(Confirmation::OverwriteVolume {
                volume: volume.clone()
            }),
            Event::Complete(true),
        ]
    );
}

#[test]
fn image_stored_on_target_is_refused() {
    let ws = Workspace::new();
    let volume = ws.file("volume.bin", &patterned(512 * 4));
    let mut ctl = file_controller(4);

    let err = ctl.write(&volume, &volume).unwrap_err();

    assert_eq!(err.warning(), Some(Warning::ImageOnTargetDrive));
    assert_eq!(ctl.status(), OperationStatus::Idle);
}

#[test]
fn allocated_read_stops_at_last_partition() {
    let ws = Workspace::new();
    let mut data = patterned(512 * 64);
    data[..512].fill(0);
    let entry = 0x1BE;
    data[entry + 8..entry + 12].copy_from_slice(&2u32.to_le_bytes());
    data[entry + 12..entry + 16].copy_from_slice(&30u32.to_le_bytes());
    data[510] = 0x55;
    data[511] = 0xAA;
    let volume = ws.file("volume.bin", &data);
    let out = ws.path("allocated.img");
    let config = ImagingConfig {
        chunk_sectors: 8,
        sizing: Sizing::AllocatedPartitions,
        ..Default::default()
    };
    let mut ctl =
        OperationController::new(FileBackend::new(), RecordingSink::default(), config).unwrap();

    ctl.read(&volume, &out).unwrap();

    assert_eq!(fs::read(&out).unwrap(), data[..512 * 32]);
}

#[test]
fn exactly_one_terminal_event_per_operation() {
    let ws = Workspace::new();
    let volume = ws.file("volume.bin", &vec![0u8; 512 * 16]);
    let image = ws.file("image.img", &patterned(512 * 8));
    let empty = ws.file("empty.img", b"");
    let missing = ws.path("missing.img");
    let mut ctl = file_controller(4);

    let runs: Vec<Box<dyn Fn(&mut FileController)>> = vec![
        Box::new(|c: &mut FileController| {
            let _ = c.write(&volume, &image);
        }),
        Box::new(|c: &mut FileController| {
            let _ = c.verify(&volume, &image);
        }),
        Box::new(|c: &mut FileController| {
            let _ = c.write(&volume, &empty);
        }),
        Box::new(|c: &mut FileController| {
            let _ = c.verify(&volume, &missing);
        }),
        Box::new(|c: &mut FileController| {
            let _ = c.verify(Path::new("/nonexistent/volume"), &image);
        }),
    ];

    for run in &runs {
        ctl.sink_mut().events.clear();
        run(&mut ctl);
        assert_eq!(ctl.sink().completions_and_warnings().len(), 1);
        assert_eq!(ctl.status(), OperationStatus::Idle);
    }
}

#[test]
fn memory_backend_releases_after_failures() {
    use imagr_core::platform::memory::Fault;

    let backend = MemoryBackend::new();
    backend.insert_volume("card", 512, vec![0u8; 512 * 32]);
    backend.inject("card", Fault::ReadAt(8));
    let ws = Workspace::new();
    let out = ws.path("card.img");
    let mut ctl = OperationController::new(
        backend.clone(),
        RecordingSink::default(),
        ImagingConfig {
            chunk_sectors: 8,
            ..Default::default()
        },
    )
    .unwrap();

    let err = ctl.read(Path::new("card"), &out).unwrap_err();

    assert_eq!(err.warning(), Some(Warning::UnspecifiedIoError));
    assert!(!backend.is_locked("card"));
    // Partial output from a failed read is left in place.
    assert_eq!(fs::metadata(&out).unwrap().len(), 512 * 8);

    // The volume can be acquired again right away.
    let again = ws.path("card-again.img");
    let mut ctl = OperationController::new(
        backend.clone(),
        RecordingSink::default(),
        ImagingConfig::default(),
    )
    .unwrap();
    backend.insert_volume("card2", 512, vec![0u8; 512 * 4]);
    assert_eq!(ctl.read(Path::new("card2"), &again).unwrap(), Outcome::Completed);
}
