//! The chunked transfer loop shared by read, write and verify.
//!
//! A transfer walks a [`TransferPlan`] from sector 0 upwards in fixed-size
//! chunks. Every chunk gets its own [`SectorChunk`] buffer which is dropped
//! before the next one is requested. Between chunks the loop hands control
//! back to a [`TransferObserver`] and checks the [`CancelFlag`], so a
//! cancellation always lands on a chunk boundary.
use crate::error::TransferError;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Alignment of chunk buffers. Covers 512 and 4096 byte sectors, which is
/// what unbuffered device I/O requires.
const CHUNK_ALIGNMENT: usize = 4096;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Anything that can be addressed in whole sectors.
///
/// Implemented by [`Volume`](crate::access::Volume) and
/// [`ImageFile`](crate::image::ImageFile). Buffers passed in are always a
/// whole number of sectors long.
pub trait SectorIo {
    fn sector_size(&self) -> u32;
    fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_sectors(&mut self, start: u64, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// An owned, aligned buffer for a run of sectors.
///
/// Lives for exactly one loop iteration; dropping it releases the memory.
pub struct SectorChunk {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl SectorChunk {
    pub fn new(sectors: u64, sector_size: u32) -> Self {
        let len = sectors as usize * sector_size as usize;
        let storage = vec![0u8; len + CHUNK_ALIGNMENT];
        let offset = storage.as_ptr().align_offset(CHUNK_ALIGNMENT);
        Self {
            storage,
            offset,
            len,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the first non-zero byte, if any.
    pub fn first_non_zero(&self) -> Option<usize> {
        self.as_slice().iter().position(|&b| b != 0)
    }
}

/// What one operation will move, computed once before the loop starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferPlan {
    pub total_sectors: u64,
    pub start_sector: u64,
    pub chunk_sectors: u64,
    /// Set when the plan was shortened to fit the destination.
    pub truncated: bool,
}

impl TransferPlan {
    pub fn new(total_sectors: u64, chunk_sectors: u64) -> Self {
        Self {
            total_sectors,
            start_sector: 0,
            chunk_sectors: chunk_sectors.max(1),
            truncated: false,
        }
    }

    /// Shortens the plan to `available` sectors. No-op if it already fits.
    pub fn truncate_to(&mut self, available: u64) {
        if available < self.total_sectors {
            self.total_sectors = available;
            self.truncated = true;
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.total_sectors.div_ceil(self.chunk_sectors)
    }

    /// `(start_sector, sector_count)` of every chunk, in ascending order.
    pub fn chunks(&self) -> impl Iterator<Item = (u64, u64)> + use<> {
        let TransferPlan {
            total_sectors,
            start_sector,
            chunk_sectors,
            ..
        } = *self;
        (start_sector..total_sectors)
            .step_by(chunk_sectors as usize)
            .map(move |start| (start, chunk_sectors.min(total_sectors - start)))
    }
}

/// Which way data flows between the volume and the image file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ReadToFile,
    FileToVolume,
    VerifyAgainstFile,
}

/// How a transfer that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Canceled,
}

/// A shared cancellation request.
///
/// Cloned into whatever external actor may cancel (a Ctrl+C handler, a UI
/// button). The transfer loop only looks at it between chunks.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A periodic throughput estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSample {
    pub sectors_done: u64,
    pub total_sectors: u64,
    /// Wall time since the previous sample.
    pub interval: Duration,
    pub throughput_mbs: f64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

/// Rate-limits progress samples to one per `interval` of wall time.
struct ThroughputSampler {
    interval: Duration,
    sector_size: u32,
    total_sectors: u64,
    started: Instant,
    last_instant: Instant,
    last_sector: u64,
}

impl ThroughputSampler {
    fn new(interval: Duration, sector_size: u32, total_sectors: u64, now: Instant) -> Self {
        Self {
            interval,
            sector_size,
            total_sectors,
            started: now,
            last_instant: now,
            last_sector: 0,
        }
    }

    /// Throughput is the bytes moved since the previous sample over the
    /// seconds since it; the ETA extrapolates the average rate so far.
    fn observe(&mut self, sectors_done: u64, now: Instant) -> Option<ProgressSample> {
        let since_last = now.duration_since(self.last_instant);
        if since_last < self.interval {
            return None;
        }

        let bytes = (sectors_done - self.last_sector) as f64 * self.sector_size as f64;
        let secs = since_last.as_secs_f64();
        let throughput_mbs = if secs > 0.0 {
            bytes / secs / BYTES_PER_MB
        } else {
            0.0
        };

        let elapsed = now.duration_since(self.started);
        let eta = if sectors_done > 0 {
            let remaining = self.total_sectors.saturating_sub(sectors_done) as f64;
            let per_sector = elapsed.as_secs_f64() / sectors_done as f64;
            Some(Duration::from_secs_f64(remaining * per_sector))
        } else {
            None
        };

        self.last_instant = now;
        self.last_sector = sectors_done;

        Some(ProgressSample {
            sectors_done,
            total_sectors: self.total_sectors,
            interval: since_last,
            throughput_mbs,
            elapsed,
            eta,
        })
    }
}

/// Receives control between chunks.
pub trait TransferObserver {
    /// Called after every chunk, in ascending sector order.
    fn chunk_done(&mut self, _sectors_done: u64) {}

    /// Called at most once per sample interval.
    fn progress(&mut self, _sample: &ProgressSample) {}
}

/// Drives one transfer to completion, cancellation or failure.
pub struct TransferEngine<'a> {
    plan: TransferPlan,
    cancel: &'a CancelFlag,
    sample_interval: Duration,
}

impl<'a> TransferEngine<'a> {
    pub fn new(plan: TransferPlan, cancel: &'a CancelFlag, sample_interval: Duration) -> Self {
        Self {
            plan,
            cancel,
            sample_interval,
        }
    }

    /// Moves `plan.total_sectors` between `volume` and `image`.
    ///
    /// # Arguments
    ///
    /// * `volume` - The acquired volume. Its sector size sizes every chunk.
    /// * `image` - The image file, addressed in the same sectors.
    /// * `direction` - Which side is read and which is written or compared.
    /// * `observer` - Called after every chunk and at most once per sample
    ///   interval with a throughput estimate.
    ///
    /// A cancellation seen before a chunk, or after the last one, ends the
    /// run with [`Outcome::Canceled`]; the destination is not flushed then.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - A sector range cannot be read from the source side.
    /// - A sector range cannot be written, or the final flush fails.
    /// - A verified chunk differs from the image. The error reports the first
    ///   sector of that chunk.
    ///
    /// Nothing is resumed or skipped after a failure.
    pub fn run<V, F>(
        &self,
        volume: &mut V,
        image: &mut F,
        direction: Direction,
        observer: &mut dyn TransferObserver,
    ) -> Result<Outcome, TransferError>
    where
        V: SectorIo + ?Sized,
        F: SectorIo + ?Sized,
    {
        let sector_size = volume.sector_size();
        let mut sampler = ThroughputSampler::new(
            self.sample_interval,
            sector_size,
            self.plan.total_sectors,
            Instant::now(),
        );

        debug!(
            ?direction,
            total_sectors = self.plan.total_sectors,
            chunk_sectors = self.plan.chunk_sectors,
            chunks = self.plan.chunk_count(),
            "starting transfer"
        );

        for (start, count) in self.plan.chunks() {
            if self.cancel.is_canceled() {
                debug!(sector = start, "transfer canceled");
                return Ok(Outcome::Canceled);
            }

            match direction {
                Direction::ReadToFile => copy_chunk(volume, image, start, count, sector_size)?,
                Direction::FileToVolume => copy_chunk(image, volume, start, count, sector_size)?,
                Direction::VerifyAgainstFile => {
                    compare_chunk(volume, image, start, count, sector_size)?
                }
            }
            trace!(sector = start, count, "chunk transferred");

            let done = start + count;
            observer.chunk_done(done);
            if let Some(sample) = sampler.observe(done, Instant::now()) {
                observer.progress(&sample);
            }
        }

        if self.cancel.is_canceled() {
            debug!(sector = self.plan.total_sectors, "transfer canceled after last chunk");
            return Ok(Outcome::Canceled);
        }

        match direction {
            Direction::ReadToFile => image
                .flush()
                .map_err(|source| write_error(self.plan.total_sectors, source))?,
            Direction::FileToVolume => volume
                .flush()
                .map_err(|source| write_error(self.plan.total_sectors, source))?,
            Direction::VerifyAgainstFile => {}
        }

        Ok(Outcome::Completed)
    }
}

fn write_error(sector: u64, source: io::Error) -> TransferError {
    TransferError::Write { sector, source }
}

fn copy_chunk<S, D>(
    source: &mut S,
    dest: &mut D,
    start: u64,
    count: u64,
    sector_size: u32,
) -> Result<(), TransferError>
where
    S: SectorIo + ?Sized,
    D: SectorIo + ?Sized,
{
    let mut chunk = SectorChunk::new(count, sector_size);
    source
        .read_sectors(start, chunk.as_mut_slice())
        .map_err(|source| TransferError::Read {
            sector: start,
            source,
        })?;
    dest.write_sectors(start, chunk.as_slice())
        .map_err(|source| write_error(start, source))
}

fn compare_chunk<V, F>(
    volume: &mut V,
    image: &mut F,
    start: u64,
    count: u64,
    sector_size: u32,
) -> Result<(), TransferError>
where
    V: SectorIo + ?Sized,
    F: SectorIo + ?Sized,
{
    let mut expected = SectorChunk::new(count, sector_size);
    let mut actual = SectorChunk::new(count, sector_size);
    image
        .read_sectors(start, expected.as_mut_slice())
        .map_err(|source| TransferError::Read {
            sector: start,
            source,
        })?;
    volume
        .read_sectors(start, actual.as_mut_slice())
        .map_err(|source| TransferError::Read {
            sector: start,
            source,
        })?;

    if expected.as_slice() != actual.as_slice() {
        return Err(TransferError::VerifyMismatch { sector: start });
    }
    Ok(())
}
