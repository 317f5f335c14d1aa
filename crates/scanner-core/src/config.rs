//! Process-wide configuration records.
//!
//! Both structs are mutated only through their typed `apply_update` method,
//! which validates a bag of optional fields before merging them in. The
//! rest of the core treats a `ScannerConfig`/`ResourceThresholds` value as
//! already-validated.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("dwell_seconds must be positive")]
    InvalidDwell,
    #[error("squelch_db must be in -100.0..=0.0")]
    InvalidSquelch,
    #[error("chunk_duration_seconds must be positive")]
    InvalidChunkDuration,
    #[error("max_session_duration_seconds must be positive")]
    InvalidMaxSessionDuration,
    #[error("signal_timeout_seconds must be positive")]
    InvalidSignalTimeout,
    #[error("retention_days must be positive")]
    InvalidRetentionDays,
    #[error("storage_cap_bytes must be positive")]
    InvalidStorageCap,
    #[error("encoder_bitrate_bps must be in 6000..=510000")]
    InvalidBitrate,
    #[error("threshold percentage must be in 0.0..=100.0")]
    InvalidPercentage,
    #[error("hysteresis_seconds must be positive")]
    InvalidHysteresis,
}

/// Scanner-wide tunables. Single writer: the config-update boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub dwell_seconds: f64,
    pub squelch_db: f64,
    pub chunk_duration_seconds: u64,
    pub max_session_duration_seconds: u64,
    pub signal_timeout_seconds: u64,
    pub retention_days: u32,
    pub storage_cap_bytes: u64,
    pub encoder_bitrate_bps: u32,
    pub scan_device_index: u32,
    pub record_device_index: u32,
    pub process_niceness: i8,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            dwell_seconds: 2.0,
            squelch_db: -20.0,
            chunk_duration_seconds: 30,
            max_session_duration_seconds: 300,
            signal_timeout_seconds: 5,
            retention_days: 14,
            storage_cap_bytes: 10 * 1024 * 1024 * 1024,
            encoder_bitrate_bps: 48_000,
            scan_device_index: 0,
            record_device_index: 1,
            process_niceness: 10,
        }
    }
}

/// Partial update for `ScannerConfig`; every field optional, validated
/// before merge. Mirrors the config-update boundary's dynamic-typing note:
/// by the time this reaches `apply_update`, values are already range-checked.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ScannerConfigUpdate {
    pub dwell_seconds: Option<f64>,
    pub squelch_db: Option<f64>,
    pub chunk_duration_seconds: Option<u64>,
    pub max_session_duration_seconds: Option<u64>,
    pub signal_timeout_seconds: Option<u64>,
    pub retention_days: Option<u32>,
    pub storage_cap_bytes: Option<u64>,
    pub encoder_bitrate_bps: Option<u32>,
}

impl ScannerConfig {
    pub fn apply_update(&mut self, update: &ScannerConfigUpdate) -> Result<(), ConfigError> {
        if let Some(v) = update.dwell_seconds {
            if v <= 0.0 {
                return Err(ConfigError::InvalidDwell);
            }
        }
        if let Some(v) = update.squelch_db {
            if !(-100.0..=0.0).contains(&v) {
                return Err(ConfigError::InvalidSquelch);
            }
        }
        if let Some(v) = update.chunk_duration_seconds {
            if v == 0 {
                return Err(ConfigError::InvalidChunkDuration);
            }
        }
        if let Some(v) = update.max_session_duration_seconds {
            if v == 0 {
                return Err(ConfigError::InvalidMaxSessionDuration);
            }
        }
        if let Some(v) = update.signal_timeout_seconds {
            if v == 0 {
                return Err(ConfigError::InvalidSignalTimeout);
            }
        }
        if let Some(v) = update.retention_days {
            if v == 0 {
                return Err(ConfigError::InvalidRetentionDays);
            }
        }
        if let Some(v) = update.storage_cap_bytes {
            if v == 0 {
                return Err(ConfigError::InvalidStorageCap);
            }
        }
        if let Some(v) = update.encoder_bitrate_bps {
            if !(6_000..=510_000).contains(&v) {
                return Err(ConfigError::InvalidBitrate);
            }
        }

        if let Some(v) = update.dwell_seconds {
            self.dwell_seconds = v;
        }
        if let Some(v) = update.squelch_db {
            self.squelch_db = v;
        }
        if let Some(v) = update.chunk_duration_seconds {
            self.chunk_duration_seconds = v;
        }
        if let Some(v) = update.max_session_duration_seconds {
            self.max_session_duration_seconds = v;
        }
        if let Some(v) = update.signal_timeout_seconds {
            self.signal_timeout_seconds = v;
        }
        if let Some(v) = update.retention_days {
            self.retention_days = v;
        }
        if let Some(v) = update.storage_cap_bytes {
            self.storage_cap_bytes = v;
        }
        if let Some(v) = update.encoder_bitrate_bps {
            self.encoder_bitrate_bps = v;
        }
        Ok(())
    }
}

/// Thresholds driving the resource monitor's throttle decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds {
    pub cpu_max_pct: f64,
    pub io_wait_max_pct: f64,
    pub memory_max_pct: f64,
    pub swap_growth_max_mb: f64,
    pub usb_error_max_delta: u64,
    pub hysteresis_seconds: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        ResourceThresholds {
            cpu_max_pct: 85.0,
            io_wait_max_pct: 20.0,
            memory_max_pct: 85.0,
            swap_growth_max_mb: 200.0,
            usb_error_max_delta: 3,
            hysteresis_seconds: 30,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ResourceThresholdsUpdate {
    pub cpu_max_pct: Option<f64>,
    pub io_wait_max_pct: Option<f64>,
    pub memory_max_pct: Option<f64>,
    pub swap_growth_max_mb: Option<f64>,
    pub usb_error_max_delta: Option<u64>,
    pub hysteresis_seconds: Option<u64>,
}

impl ResourceThresholds {
    pub fn apply_update(&mut self, update: &ResourceThresholdsUpdate) -> Result<(), ConfigError> {
        for pct in [
            update.cpu_max_pct,
            update.io_wait_max_pct,
            update.memory_max_pct,
        ] {
            if let Some(v) = pct {
                if !(0.0..=100.0).contains(&v) {
                    return Err(ConfigError::InvalidPercentage);
                }
            }
        }
        if let Some(v) = update.hysteresis_seconds {
            if v == 0 {
                return Err(ConfigError::InvalidHysteresis);
            }
        }

        if let Some(v) = update.cpu_max_pct {
            self.cpu_max_pct = v;
        }
        if let Some(v) = update.io_wait_max_pct {
            self.io_wait_max_pct = v;
        }
        if let Some(v) = update.memory_max_pct {
            self.memory_max_pct = v;
        }
        if let Some(v) = update.swap_growth_max_mb {
            self.swap_growth_max_mb = v;
        }
        if let Some(v) = update.usb_error_max_delta {
            self.usb_error_max_delta = v;
        }
        if let Some(v) = update.hysteresis_seconds {
            self.hysteresis_seconds = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_dwell() {
        let mut cfg = ScannerConfig::default();
        let update = ScannerConfigUpdate {
            dwell_seconds: Some(0.0),
            ..Default::default()
        };
        assert!(matches!(cfg.apply_update(&update), Err(ConfigError::InvalidDwell)));
        assert_eq!(cfg, ScannerConfig::default());
    }

    #[test]
    fn partial_update_only_touches_given_fields() {
        let mut cfg = ScannerConfig::default();
        let update = ScannerConfigUpdate {
            dwell_seconds: Some(0.5),
            ..Default::default()
        };
        cfg.apply_update(&update).unwrap();
        assert_eq!(cfg.dwell_seconds, 0.5);
        assert_eq!(cfg.squelch_db, ScannerConfig::default().squelch_db);
    }

    #[test]
    fn rejects_out_of_range_bitrate() {
        let mut cfg = ScannerConfig::default();
        let update = ScannerConfigUpdate {
            encoder_bitrate_bps: Some(1_000_000),
            ..Default::default()
        };
        assert!(matches!(cfg.apply_update(&update), Err(ConfigError::InvalidBitrate)));
    }

    #[test]
    fn thresholds_reject_out_of_range_percentage() {
        let mut t = ResourceThresholds::default();
        let update = ResourceThresholdsUpdate {
            cpu_max_pct: Some(150.0),
            ..Default::default()
        };
        assert!(matches!(t.apply_update(&update), Err(ConfigError::InvalidPercentage)));
        assert_eq!(t, ResourceThresholds::default());
    }
}
