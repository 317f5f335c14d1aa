//! Process wiring for the sdr-scand binary: configuration loading, logging
//! setup, and assembling the scanner core and HTTP server into one daemon.

pub mod catalog_data;
pub mod retention;

use anyhow::{Context, Result};
use catalog_data::BuiltinCatalog;
use scanner_core::config::ResourceThresholds;
use scanner_core::detector::{SignalDetector, SignalProbe};
use scanner_core::pipeline::{AudioPipeline, PipelineSettings};
use scanner_core::resource_monitor::ResourceMonitor;
use scanner_core::{ScannerConfig, ScannerEngine};
use scanner_server::{AppState, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub base_dir: PathBuf,
    pub port: u16,
    pub scan_device_index: u32,
    pub record_device_index: u32,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        DaemonOptions {
            base_dir: PathBuf::from("./sdr-scand-data"),
            port: 8920,
            scan_device_index: 0,
            record_device_index: 1,
        }
    }
}

/// Config file persisted at `<base_dir>/config.json`, loaded at startup and
/// falling back to defaults when absent or malformed.
#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct PersistedConfig {
    #[serde(default)]
    scanner: Option<ScannerConfig>,
    #[serde(default)]
    thresholds: Option<ResourceThresholds>,
}

#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

struct DaemonInner {
    engine: Arc<ScannerEngine>,
    server_state: AppState,
    recordings_dir: PathBuf,
    _log_guards: Vec<WorkerGuard>,
}

impl Daemon {
    pub async fn bootstrap(options: DaemonOptions) -> Result<Self> {
        let base_dir = options.base_dir.clone();
        let recordings_dir = base_dir.join("recordings");
        let logs_dir = base_dir.join("logs");
        std::fs::create_dir_all(&recordings_dir)
            .with_context(|| format!("creating {}", recordings_dir.display()))?;
        std::fs::create_dir_all(&logs_dir).with_context(|| format!("creating {}", logs_dir.display()))?;

        let log_guards = init_logging(&logs_dir)?;

        let persisted = load_persisted_config(&base_dir);
        let scanner_config = persisted.scanner.unwrap_or_default();
        let thresholds = persisted.thresholds.unwrap_or_default();

        let detector: Arc<dyn SignalProbe> =
            Arc::new(SignalDetector::new("rtl_fm", options.scan_device_index));

        let pipeline = Arc::new(AudioPipeline::new(PipelineSettings {
            demodulator_path: "rtl_fm".to_string(),
            encoder_path: "opusenc".to_string(),
            recordings_dir: recordings_dir.clone(),
            device_index: options.record_device_index,
            niceness: scanner_config.process_niceness,
            bitrate_bps: scanner_config.encoder_bitrate_bps,
        }));

        let resource_monitor = Arc::new(ResourceMonitor::new(
            base_dir.clone(),
            thresholds,
            scanner_config.chunk_duration_seconds,
        ));

        let catalog = Arc::new(BuiltinCatalog::load(&base_dir));

        let engine = Arc::new(ScannerEngine::new(
            scanner_config,
            detector,
            pipeline,
            resource_monitor,
            catalog,
            recordings_dir.clone(),
        ));

        let server_state = AppState::new(
            engine.clone(),
            ServerConfig {
                port: options.port,
                bind_addr: "0.0.0.0".to_string(),
            },
            Some(logs_dir),
        );

        Ok(Daemon {
            inner: Arc::new(DaemonInner {
                engine,
                server_state,
                recordings_dir,
                _log_guards: log_guards,
            }),
        })
    }

    pub fn log_startup_banner(&self) {
        println!("sdr-scand {} - dual-dongle SDR scanner and recorder", scanner_core::VERSION);
        println!("listening on port {}", self.inner.server_state.config.port);
        println!("Press Ctrl+C to stop.");
    }

    pub async fn run_server(self) -> Result<()> {
        let retention_engine = self.inner.engine.clone();
        let retention_dir = self.inner.recordings_dir.clone();
        tokio::spawn(retention::run_retention_sweep(retention_engine, retention_dir));

        scanner_server::start_server(self.inner.server_state.clone()).await
    }

    /// Stops any in-progress scan and waits for the final recording to be
    /// assembled before returning, matching the exit contract.
    pub async fn shutdown(&self) {
        self.inner.engine.stop_scan().await;
    }
}

fn load_persisted_config(base_dir: &std::path::Path) -> PersistedConfig {
    let path = base_dir.join("config.json");
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
            tracing::warn!(%err, path = %path.display(), "ignoring malformed config.json");
            PersistedConfig::default()
        }),
        Err(_) => PersistedConfig::default(),
    }
}

/// Four named log files (backend, scanner, rtltcp, install) under
/// `logs_dir`, selected by `tracing` target prefix, plus an stdout layer
/// for local development visibility.
fn init_logging(logs_dir: &std::path::Path) -> Result<Vec<WorkerGuard>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sdr_scand=info,scanner_core=info,scanner_server=info"));

    let mut guards = Vec::new();
    let mut layers = Vec::new();

    for (target_prefix, file_name) in [
        ("scanner_core::engine", "scanner.log"),
        ("scanner_core::detector", "rtltcp.log"),
        ("scanner_server", "backend.log"),
        ("sdr_scand", "install.log"),
    ] {
        let appender = tracing_appender::rolling::never(logs_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_filter(filter_fn(move |metadata| metadata.target().starts_with(target_prefix)));
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(layers)
        .init();

    Ok(guards)
}
