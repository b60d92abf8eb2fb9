//! Capacity checks before a transfer.
use crate::transfer::{SectorChunk, SectorIo};
use tracing::debug;

/// Result of comparing what a transfer needs with what the destination has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceVerdict {
    Fits,
    Shortfall {
        required: u64,
        available: u64,
        /// Whether the sectors that would be dropped hold any non-zero byte.
        data_found: bool,
    },
}

impl SpaceVerdict {
    pub fn shortfall(&self) -> u64 {
        match self {
            SpaceVerdict::Fits => 0,
            SpaceVerdict::Shortfall {
                required,
                available,
                ..
            } => required - available,
        }
    }
}

/// Compares `required` against `available` sectors.
///
/// On a shortfall, `source` (the side whose tail would be dropped) is
/// scanned from `available` towards `required` and stops at the first
/// non-zero byte. A read error during the scan ends it; that region is not
/// going to be transferred anyway.
pub fn evaluate<S: SectorIo + ?Sized>(
    required: u64,
    available: u64,
    source: &mut S,
    chunk_sectors: u64,
) -> SpaceVerdict {
    if required <= available {
        return SpaceVerdict::Fits;
    }

    let sector_size = source.sector_size();
    let chunk_sectors = chunk_sectors.max(1);
    let mut data_found = false;
    let mut sector = available;
    while sector < required {
        let count = chunk_sectors.min(required - sector);
        let mut chunk = SectorChunk::new(count, sector_size);
        if let Err(e) = source.read_sectors(sector, chunk.as_mut_slice()) {
            debug!(sector, "stopping tail scan on read error: {e}");
            break;
        }
        if let Some(offset) = chunk.first_non_zero() {
            debug!(
                sector = sector + offset as u64 / sector_size as u64,
                "data found beyond capacity"
            );
            data_found = true;
            break;
        }
        sector += count;
    }

    SpaceVerdict::Shortfall {
        required,
        available,
        data_found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct Tail {
        data: Vec<u8>,
        reads: Vec<u64>,
        fail_from: Option<u64>,
    }

    impl Tail {
        fn zeros(sectors: usize) -> Self {
            Self {
                data: vec![0; sectors * 512],
                reads: Vec::new(),
                fail_from: None,
            }
        }
    }

    impl SectorIo for Tail {
        fn sector_size(&self) -> u32 {
            512
        }

        fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> io::Result<()> {
            if self.fail_from.is_some_and(|s| start >= s) {
                return Err(io::Error::other("bad sector"));
            }
            self.reads.push(start);
            let off = start as usize * 512;
            buf.copy_from_slice(&self.data[off..off + buf.len()]);
            Ok(())
        }

        fn write_sectors(&mut self, _start: u64, _buf: &[u8]) -> io::Result<()> {
            unreachable!("evaluate never writes")
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fits_does_not_read() {
        let mut tail = Tail::zeros(10);
        assert_eq!(evaluate(10, 10, &mut tail, 4), SpaceVerdict::Fits);
        assert_eq!(evaluate(5, 10, &mut tail, 4), SpaceVerdict::Fits);
        assert!(tail.reads.is_empty());
    }

    #[test]
    fn zero_tail_reports_no_data() {
        let mut tail = Tail::zeros(3000);
        let verdict = evaluate(3000, 2048, &mut tail, 1024);

        assert_eq!(
            verdict,
            SpaceVerdict::Shortfall {
                required: 3000,
                available: 2048,
                data_found: false,
            }
        );
        assert_eq!(verdict.shortfall(), 952);
        assert_eq!(tail.reads, vec![2048]);
    }

    #[test]
    fn scan_stops_at_first_data() {
        let mut tail = Tail::zeros(100);
        tail.data[25 * 512 + 3] = 1;

        let verdict = evaluate(100, 10, &mut tail, 10);

        assert!(matches!(
            verdict,
            SpaceVerdict::Shortfall {
                data_found: true,
                ..
            }
        ));
        assert_eq!(tail.reads, vec![10, 20]);
    }

    #[test]
    fn data_before_capacity_is_ignored() {
        let mut tail = Tail::zeros(20);
        tail.data[0] = 0xFF;
        let verdict = evaluate(20, 10, &mut tail, 4);
        assert!(matches!(
            verdict,
            SpaceVerdict::Shortfall {
                data_found: false,
                ..
            }
        ));
    }

    #[test]
    fn read_error_ends_scan_without_data() {
        let mut tail = Tail::zeros(40);
        tail.data[35 * 512] = 1;
        tail.fail_from = Some(20);

        let verdict = evaluate(40, 10, &mut tail, 10);

        assert!(matches!(
            verdict,
            SpaceVerdict::Shortfall {
                data_found: false,
                ..
            }
        ));
        assert_eq!(tail.reads, vec![10]);
    }
}
