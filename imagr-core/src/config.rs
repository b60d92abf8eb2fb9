//! Runtime configuration for imaging operations.
//!
//! Nothing here is persisted; the front end builds an [`ImagingConfig`] from
//! its own arguments and hands it to the controller.
use crate::error::ConfigError;
use std::time::Duration;

/// Sectors moved per chunk unless configured otherwise.
pub const DEFAULT_CHUNK_SECTORS: u64 = 1024;

/// Minimum wall time between two throughput samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// How the length of a read is determined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sizing {
    /// Copy every sector the volume reports.
    #[default]
    FullDevice,
    /// Copy up to the end of the last primary MBR partition.
    AllocatedPartitions,
}

/// Settings that shape every operation run by one controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagingConfig {
    pub chunk_sectors: u64,
    pub sample_interval: Duration,
    pub sizing: Sizing,
    /// Answer every confirmation with "yes" instead of asking the sink.
    pub skip_confirmations: bool,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            chunk_sectors: DEFAULT_CHUNK_SECTORS,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            sizing: Sizing::FullDevice,
            skip_confirmations: false,
        }
    }
}

impl ImagingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_sectors == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        if self.sample_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = ImagingConfig::default();
        assert_eq!(config.chunk_sectors, 1024);
        assert_eq!(config.sizing, Sizing::FullDevice);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = ImagingConfig {
            chunk_sectors: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroChunk));

        let config = ImagingConfig {
            sample_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroInterval));
    }
}
