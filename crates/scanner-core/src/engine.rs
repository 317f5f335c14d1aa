//! Scanner Engine: owns the frequency list, the detection table, the
//! recording state machine, and the scanning loop.

use crate::config::{ResourceThresholds, ResourceThresholdsUpdate, ScannerConfig};
use crate::detector::{DetectResult, SignalProbe};
use crate::domain::{Detection, FrequencyEntry};
use crate::pipeline::AudioPipeline;
use crate::resource_monitor::{ResourceMonitor, ResourceUsage};
use crate::throttle::ThrottleState;
use crate::FrequencyGroupCatalog;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Started,
    AlreadyRunning,
    NoFrequencies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// How long a detection remains visible via `get_detections` after its
/// last update.
const DETECTION_TTL: chrono::Duration = chrono::Duration::seconds(60);

/// Sleep taken while `ThrottleState.paused` is set.
const PAUSED_SLEEP: Duration = Duration::from_secs(5);

/// Sleep taken once the scan list wraps back to index 0.
const SCAN_DELAY: Duration = Duration::from_millis(250);

struct RunningScan {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ScannerEngine {
    config: Mutex<ScannerConfig>,
    detections: Mutex<HashMap<u64, Detection>>,
    running_scan: Mutex<Option<RunningScan>>,
    current_index: AtomicUsize,
    total_recordings: AtomicU64,
    detector: Arc<dyn SignalProbe>,
    pipeline: Arc<AudioPipeline>,
    resource_monitor: Arc<ResourceMonitor>,
    catalog: Arc<dyn FrequencyGroupCatalog>,
    recordings_dir: PathBuf,
}

impl ScannerEngine {
    pub fn new(
        config: ScannerConfig,
        detector: Arc<dyn SignalProbe>,
        pipeline: Arc<AudioPipeline>,
        resource_monitor: Arc<ResourceMonitor>,
        catalog: Arc<dyn FrequencyGroupCatalog>,
        recordings_dir: PathBuf,
    ) -> Self {
        ScannerEngine {
            config: Mutex::new(config),
            detections: Mutex::new(HashMap::new()),
            running_scan: Mutex::new(None),
            current_index: AtomicUsize::new(0),
            total_recordings: AtomicU64::new(0),
            detector,
            pipeline,
            resource_monitor,
            catalog,
            recordings_dir,
        }
    }

    pub fn config(&self) -> ScannerConfig {
        self.config.lock().clone()
    }

    pub fn update_config(&self, update: &crate::config::ScannerConfigUpdate) -> Result<ScannerConfig, EngineError> {
        let mut cfg = self.config.lock();
        cfg.apply_update(update)?;
        Ok(cfg.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running_scan.lock().is_some()
    }

    pub fn current_index(&self) -> usize {
        self.current_index.load(Ordering::SeqCst)
    }

    pub fn total_recordings(&self) -> u64 {
        self.total_recordings.load(Ordering::Relaxed)
    }

    pub fn thresholds(&self) -> ResourceThresholds {
        self.resource_monitor.thresholds()
    }

    pub fn update_thresholds(&self, update: &ResourceThresholdsUpdate) -> Result<ResourceThresholds, EngineError> {
        let mut thresholds = self.resource_monitor.thresholds();
        thresholds.apply_update(update)?;
        self.resource_monitor.set_thresholds(thresholds.clone());
        Ok(thresholds)
    }

    pub fn throttle_snapshot(&self) -> ThrottleState {
        self.resource_monitor.throttle_snapshot()
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        self.resource_monitor.get_resource_usage()
    }

    pub fn usb_error_count(&self) -> u64 {
        self.resource_monitor.last_usb_error_count()
    }

    pub fn set_paused(&self, paused: bool) {
        self.resource_monitor.set_paused(paused);
    }

    /// Ordered, non-stale detections, most recently seen first. Safe to
    /// call while the scan loop is running: detections are a plain map
    /// guarded by a brief critical section, never held across an await.
    pub fn get_detections(&self) -> Vec<Detection> {
        let now = Utc::now();
        let mut detections: Vec<Detection> = self
            .detections
            .lock()
            .values()
            .filter(|d| !d.is_stale(now, DETECTION_TTL))
            .cloned()
            .collect();
        detections.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        detections
    }

    /// Composes the scan list from resolved groups followed by custom
    /// entries, resets scan state, and spawns exactly one scan task.
    pub fn start_scan(
        self: &Arc<Self>,
        group_names: &[String],
        custom_frequencies: Vec<FrequencyEntry>,
        dwell_override: Option<f64>,
        squelch_override: Option<f64>,
    ) -> ScanOutcome {
        let mut scan_list = Vec::new();
        for name in group_names {
            match self.catalog.resolve(name) {
                Some(entries) => scan_list.extend(entries),
                None => tracing::warn!(group = %name, "unknown frequency group dropped"),
            }
        }
        scan_list.extend(custom_frequencies);

        if scan_list.is_empty() {
            return ScanOutcome::NoFrequencies;
        }

        let mut running = self.running_scan.lock();
        if running.is_some() {
            return ScanOutcome::AlreadyRunning;
        }

        {
            let mut cfg = self.config.lock();
            if let Some(d) = dwell_override {
                cfg.dwell_seconds = d;
            }
            if let Some(s) = squelch_override {
                cfg.squelch_db = s;
            }
        }

        self.detections.lock().clear();
        self.current_index.store(0, Ordering::SeqCst);

        let (stop_tx, stop_rx) = watch::channel(false);
        let engine = self.clone();
        let task = tokio::spawn(async move { engine.run_scan_loop(scan_list, stop_rx).await });
        *running = Some(RunningScan { stop_tx, task });
        ScanOutcome::Started
    }

    /// Clears the running flag, cancels the scan task, and waits for it to
    /// finish (including assembling whatever chunks an in-flight recording
    /// had produced) before returning.
    pub async fn stop_scan(&self) -> StopOutcome {
        let running = self.running_scan.lock().take();
        let Some(running) = running else {
            return StopOutcome::NotRunning;
        };
        let _ = running.stop_tx.send(true);
        let _ = running.task.await;
        StopOutcome::Stopped
    }

    async fn run_scan_loop(self: Arc<Self>, scan_list: Vec<FrequencyEntry>, mut stop_rx: watch::Receiver<bool>) {
        let mut index: usize = 0;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.resource_monitor.monitor_and_adjust().await;
            let throttle = self.resource_monitor.throttle_snapshot();

            if throttle.paused {
                if wait_or_stop(&mut stop_rx, PAUSED_SLEEP).await {
                    break;
                }
                continue;
            }

            if index >= scan_list.len() {
                index = 0;
                if wait_or_stop(&mut stop_rx, SCAN_DELAY).await {
                    break;
                }
            }

            let entry = scan_list[index].clone();
            self.current_index.store(index, Ordering::SeqCst);
            index += throttle.skip_frequencies as usize + 1;

            let squelch = self.config.lock().squelch_db;
            let result = self.detector.detect_signal(entry.clone(), squelch).await;

            self.apply_recording_transition(&entry, result).await;

            let dwell_secs = self.config.lock().dwell_seconds * throttle.dwell_multiplier;
            if wait_or_stop(&mut stop_rx, Duration::from_secs_f64(dwell_secs.max(0.0))).await {
                break;
            }
        }

        self.finish_active_recording().await;
    }

    /// The Recording Transition Table from the component design: what to
    /// do with the current session (if any) given the probe outcome at
    /// `entry`.
    async fn apply_recording_transition(&self, entry: &FrequencyEntry, result: DetectResult) {
        let now = Utc::now();
        let cfg = self.config();
        let recording_freq = self.pipeline.current_freq_mhz();

        match (recording_freq, result.present) {
            (None, true) => {
                self.touch_detection(entry, result.strength_dbfs, now);
                self.start_new_recording(entry, now).await;
            }
            (None, false) => {}
            (Some(f), true) if f == entry.freq_mhz => {
                self.touch_detection(entry, result.strength_dbfs, now);
                if let Some(start) = self.pipeline.session_start_time() {
                    if now - start >= chrono::Duration::seconds(cfg.max_session_duration_seconds as i64) {
                        self.stop_and_assemble_current().await;
                    }
                }
            }
            (Some(f), false) if f == entry.freq_mhz => {
                if let Some(start) = self.pipeline.session_start_time() {
                    if now - start > chrono::Duration::seconds(cfg.signal_timeout_seconds as i64) {
                        self.stop_and_assemble_current().await;
                    }
                }
            }
            (Some(_other), true) => {
                self.stop_and_assemble_current().await;
                self.touch_detection(entry, result.strength_dbfs, now);
                self.start_new_recording(entry, now).await;
            }
            (Some(_other), false) => {
                // Silence on a frequency other than the recording one does
                // not interrupt that recording.
            }
        }
    }

    fn touch_detection(&self, entry: &FrequencyEntry, strength_dbfs: f64, now: chrono::DateTime<Utc>) {
        let mut detections = self.detections.lock();
        detections
            .entry(entry.freq_mhz.to_bits())
            .and_modify(|d| d.touch(strength_dbfs, now))
            .or_insert_with(|| Detection::new(entry, strength_dbfs, now));
    }

    fn effective_chunk_duration(&self) -> Duration {
        let throttle = self.resource_monitor.throttle_snapshot();
        if throttle.active {
            Duration::from_secs(throttle.chunk_duration_seconds)
        } else {
            Duration::from_secs(self.config.lock().chunk_duration_seconds)
        }
    }

    async fn start_new_recording(&self, entry: &FrequencyEntry, now: chrono::DateTime<Utc>) {
        let chunk_duration = self.effective_chunk_duration();
        if let Err(err) = self.pipeline.start_recording(entry.clone(), chunk_duration, now).await {
            tracing::warn!(freq_mhz = entry.freq_mhz, %err, "recording start failed; continuing scan");
        }
    }

    async fn stop_and_assemble_current(&self) {
        let Some(stopped) = self.pipeline.stop_recording().await else {
            return;
        };
        if stopped.chunks.is_empty() {
            return;
        }

        let prefix = crate::domain::RecordingSession::new(stopped.entry.clone(), stopped.start_time).file_prefix();
        let target = self.recordings_dir.join(format!("{prefix}.ogg"));

        match self.pipeline.assemble_session(&stopped.chunks, &target).await {
            Ok(()) => {
                self.total_recordings.fetch_add(1, Ordering::Relaxed);
                let mut detections = self.detections.lock();
                if let Some(d) = detections.get_mut(&stopped.entry.freq_mhz.to_bits()) {
                    d.recording_id = Some(prefix);
                }
            }
            Err(err) => {
                tracing::error!(%err, "session assembly failed; chunks left in place");
            }
        }
    }

    async fn finish_active_recording(&self) {
        self.stop_and_assemble_current().await;
    }
}

/// Sleeps for `dur`, returning early with `true` if `stop_rx` observes a
/// cancellation request before the sleep elapses.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    if *stop_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        changed = stop_rx.changed() => changed.is_ok() && *stop_rx.borrow(),
    }
}
