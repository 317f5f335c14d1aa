//! Scanner Core - scanning, detection, recording and adaptive throttling
//!
//! This library owns the scanning loop, the signal presence probe, the
//! recording pipeline, and the resource monitor that feeds back into the
//! loop's pacing. It has no knowledge of HTTP, the frequency-group catalog,
//! or any other external collaborator; those are narrow traits or plain
//! function arguments supplied by the caller.

pub mod config;
pub mod detector;
pub mod domain;
pub mod engine;
pub mod pipeline;
pub mod resource_monitor;
pub mod throttle;

pub use config::{ConfigError, ResourceThresholds, ScannerConfig};
pub use detector::{DetectResult, SignalDetector};
pub use domain::{Detection, FrequencyEntry, Modulation, RecordingSession};
pub use engine::{EngineError, ScanOutcome, ScannerEngine, StopOutcome};
pub use pipeline::{AudioPipeline, PipelineError};
pub use resource_monitor::{ResourceMonitor, ResourceUsage};
pub use throttle::ThrottleState;

/// Crate version, exposed for status responses.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A resolver for named frequency groups.
///
/// The fixed catalog of frequency groups is an external collaborator
/// (a static, read-only data source). The core only needs to resolve a
/// name to a slice of entries; it never owns or loads the catalog itself.
pub trait FrequencyGroupCatalog: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Vec<FrequencyEntry>>;
}

/// A catalog with no groups, useful for tests and for callers that only
/// ever pass `custom_frequencies`.
#[derive(Default)]
pub struct EmptyCatalog;

impl FrequencyGroupCatalog for EmptyCatalog {
    fn resolve(&self, _name: &str) -> Option<Vec<FrequencyEntry>> {
        None
    }
}
