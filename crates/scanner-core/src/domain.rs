//! Core data model: frequencies, detections, and recording sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Demodulator mode. Selects sample rate and squelch behavior in the
/// signal detector and audio pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    #[serde(rename = "nfm")]
    Nfm,
    #[serde(rename = "fm")]
    Fm,
    #[serde(rename = "wfm")]
    Wfm,
    #[serde(rename = "am")]
    Am,
    #[serde(rename = "usb")]
    Usb,
    #[serde(rename = "lsb")]
    Lsb,
}

impl Modulation {
    /// Sample rate the demodulator should run at for this mode, matching
    /// the detector's per-mode bandwidth assumptions.
    pub fn sample_rate_hz(self) -> u32 {
        match self {
            Modulation::Am | Modulation::Nfm | Modulation::Fm => 24_000,
            Modulation::Wfm => 200_000,
            Modulation::Usb | Modulation::Lsb => 24_000,
        }
    }
}

/// Lower bound of the supported tuning range, in MHz.
pub const MIN_FREQ_MHZ: f64 = 24.0;
/// Upper bound of the supported tuning range, in MHz.
pub const MAX_FREQ_MHZ: f64 = 1766.0;

/// An immutable entry describing one frequency to scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyEntry {
    pub freq_mhz: f64,
    pub mode: Modulation,
    pub label: Option<String>,
    pub ctcss_hz: Option<f64>,
    pub dcs_code: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrequencyEntryError {
    #[error("frequency {0} MHz is out of range ({MIN_FREQ_MHZ}..={MAX_FREQ_MHZ})")]
    OutOfRange(String),
    #[error("ctcss tone {0} Hz is out of range (67..=254)")]
    CtcssOutOfRange(String),
}

impl FrequencyEntry {
    pub fn new(freq_mhz: f64, mode: Modulation, label: Option<String>) -> Result<Self, FrequencyEntryError> {
        let entry = FrequencyEntry {
            freq_mhz,
            mode,
            label,
            ctcss_hz: None,
            dcs_code: None,
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn validate(&self) -> Result<(), FrequencyEntryError> {
        if !(MIN_FREQ_MHZ..=MAX_FREQ_MHZ).contains(&self.freq_mhz) {
            return Err(FrequencyEntryError::OutOfRange(format!("{:.4}", self.freq_mhz)));
        }
        if let Some(ctcss) = self.ctcss_hz {
            if !(67.0..=254.0).contains(&ctcss) {
                return Err(FrequencyEntryError::CtcssOutOfRange(format!("{:.1}", ctcss)));
            }
        }
        Ok(())
    }

    /// Disk-safe label: spaces become underscores, defaults to "unknown".
    pub fn label_for_filename(&self) -> String {
        match &self.label {
            Some(l) if !l.trim().is_empty() => l.trim().replace(' ', "_"),
            _ => "unknown".to_string(),
        }
    }

    /// Frequency formatted as `FFF_FFFF` (four decimal places, no leading
    /// zero padding) per the recording file naming convention.
    pub fn freq_for_filename(&self) -> String {
        format!("{:.4}", self.freq_mhz).replace('.', "_")
    }
}

/// A live or recently-seen transmission on a frequency.
///
/// Owned by the engine's detection table. Reaped lazily at read time: a
/// detection whose `last_seen` is more than 60s old is not visible via
/// `get_detections`, even though the table entry may still exist internally
/// until the next write touches that key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub freq_mhz: f64,
    pub mode: Modulation,
    pub signal_strength_db: f64,
    pub label: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub recording_id: Option<String>,
}

impl Detection {
    pub fn new(entry: &FrequencyEntry, signal_strength_db: f64, now: DateTime<Utc>) -> Self {
        Detection {
            freq_mhz: entry.freq_mhz,
            mode: entry.mode,
            signal_strength_db,
            label: entry.label.clone(),
            first_seen: now,
            last_seen: now,
            recording_id: None,
        }
    }

    pub fn touch(&mut self, signal_strength_db: f64, now: DateTime<Utc>) {
        debug_assert!(now >= self.first_seen);
        self.signal_strength_db = signal_strength_db;
        self.last_seen = now;
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_seen > ttl
    }
}

/// The at-most-one live recording owned by the scanner engine.
///
/// `session_file` is only populated once `assemble_session` succeeds; until
/// then the session exists only as a sequence of chunk files on disk.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub freq_mhz: f64,
    pub entry: FrequencyEntry,
    pub start_time: DateTime<Utc>,
    pub chunk_index: u32,
    pub chunk_paths: Vec<PathBuf>,
    pub session_file: Option<PathBuf>,
}

impl RecordingSession {
    pub fn new(entry: FrequencyEntry, start_time: DateTime<Utc>) -> Self {
        RecordingSession {
            freq_mhz: entry.freq_mhz,
            entry,
            start_time,
            chunk_index: 0,
            chunk_paths: Vec::new(),
            session_file: None,
        }
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.start_time
    }

    /// The on-disk prefix shared by every chunk and the assembled session
    /// file for this recording: `YYYYMMDD_HHMMSS_FFFF_FFFF_LABEL`.
    pub fn file_prefix(&self) -> String {
        format!(
            "{}_{}_{}",
            self.start_time.format("%Y%m%d_%H%M%S"),
            self.entry.freq_for_filename(),
            self.entry.label_for_filename()
        )
    }
}
