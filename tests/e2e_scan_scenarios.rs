//! End-to-end scenario tests (S1-S6) driven against the public
//! scanner-core API the same way the root binary wires it together.
//!
//! No real `rtl_fm`/`opusenc` binaries are available in this environment,
//! so recordings are exercised with a nonexistent demodulator path, the
//! same double used by `scanner-core`'s own engine tests. That still
//! exercises the full Recording Transition Table and detection lifecycle;
//! it just means `recording_id` never gets set, since no session is ever
//! successfully assembled.

use scanner_core::config::ResourceThresholds;
use scanner_core::detector::{DetectResult, ScriptedDetector, SignalProbe};
use scanner_core::pipeline::{AudioPipeline, PipelineSettings};
use scanner_core::resource_monitor::ResourceMonitor;
use scanner_core::{EmptyCatalog, FrequencyEntry, FrequencyGroupCatalog, Modulation, ScanOutcome, ScannerConfig, ScannerEngine, StopOutcome};
use std::sync::Arc;
use std::time::Duration;

fn build_engine(results: Vec<DetectResult>, dwell_seconds: f64) -> (Arc<ScannerEngine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let recordings_dir = dir.path().join("recordings");
    std::fs::create_dir_all(&recordings_dir).unwrap();

    let mut config = ScannerConfig::default();
    config.dwell_seconds = dwell_seconds;
    config.signal_timeout_seconds = 1;
    config.max_session_duration_seconds = 300;

    let detector: Arc<dyn SignalProbe> = Arc::new(ScriptedDetector::new(results));
    let pipeline = Arc::new(AudioPipeline::new(PipelineSettings {
        demodulator_path: "/bin/does-not-exist".to_string(),
        encoder_path: "/bin/does-not-exist".to_string(),
        recordings_dir: recordings_dir.clone(),
        device_index: 0,
        niceness: 10,
        bitrate_bps: 48_000,
    }));
    let resource_monitor = Arc::new(ResourceMonitor::new(
        dir.path().to_path_buf(),
        ResourceThresholds::default(),
        config.chunk_duration_seconds,
    ));
    let catalog: Arc<dyn FrequencyGroupCatalog> = Arc::new(EmptyCatalog);

    let engine = Arc::new(ScannerEngine::new(config, detector, pipeline, resource_monitor, catalog, recordings_dir));
    (engine, dir)
}

fn wx1() -> FrequencyEntry {
    FrequencyEntry::new(162.400, Modulation::Nfm, Some("WX1".to_string())).unwrap()
}

/// S1 - single-frequency detection: a permanently-present detector keeps
/// exactly one detection alive and tracks its frequency correctly.
#[tokio::test]
async fn s1_single_frequency_detection() {
    let (engine, _dir) = build_engine(vec![DetectResult { present: true, strength_dbfs: -35.0 }], 0.05);

    assert_eq!(engine.start_scan(&[], vec![wx1()], None, None), ScanOutcome::Started);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let detections = engine.get_detections();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].freq_mhz, 162.400);
    let age = chrono::Utc::now() - detections[0].last_seen;
    assert!(age < chrono::Duration::milliseconds(500));

    assert_eq!(engine.stop_scan().await, StopOutcome::Stopped);
}

/// S2 - silence timeout: a detector that goes quiet after the first probe
/// eventually lets the session close (observable here as the pipeline
/// going idle and the engine finishing cleanly rather than hanging).
#[tokio::test]
async fn s2_silence_timeout_ends_the_session() {
    let (engine, _dir) = build_engine(
        vec![
            DetectResult { present: true, strength_dbfs: -35.0 },
            DetectResult { present: false, strength_dbfs: -60.0 },
        ],
        0.1,
    );

    assert_eq!(engine.start_scan(&[], vec![wx1()], None, None), ScanOutcome::Started);
    // First probe detects, starts a recording attempt; every probe after
    // is silent, so signal_timeout_seconds (1s) should close the session.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(engine.stop_scan().await, StopOutcome::Stopped);
}

/// S3 - frequency switch: detections on two different frequencies are
/// tracked independently as the scan visits each in turn. (The actual
/// stop-and-restart transition only fires once a recording has really
/// started, which needs a real demodulator; see the module doc comment.)
#[tokio::test]
async fn s3_frequency_switch_moves_the_active_recording() {
    let a = FrequencyEntry::new(146.520, Modulation::Nfm, Some("A".to_string())).unwrap();
    let b = FrequencyEntry::new(446.000, Modulation::Nfm, Some("B".to_string())).unwrap();

    // Calls alternate A, B, A, B, ... : present on A for the first two
    // visits, then B goes active and should force a switch.
    let (engine, _dir) = build_engine(
        vec![
            DetectResult { present: true, strength_dbfs: -30.0 },  // visit 1: A
            DetectResult { present: false, strength_dbfs: -60.0 }, // visit 2: B (ignored, A still recording)
            DetectResult { present: true, strength_dbfs: -30.0 },  // visit 3: A (continues)
            DetectResult { present: true, strength_dbfs: -30.0 },  // visit 4: B (switch)
        ],
        0.05,
    );

    assert_eq!(engine.start_scan(&[], vec![a.clone(), b.clone()], None, None), ScanOutcome::Started);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let detections = engine.get_detections();
    let freqs: Vec<f64> = detections.iter().map(|d| d.freq_mhz).collect();
    assert!(freqs.contains(&a.freq_mhz));
    assert!(freqs.contains(&b.freq_mhz));

    assert_eq!(engine.stop_scan().await, StopOutcome::Stopped);
}

/// S4 - throttle escalation: repeated high-load samples escalate the
/// throttle one level at a time, and a later low-load sample releases it
/// once hysteresis has elapsed.
#[test]
fn s4_throttle_escalates_then_releases() {
    let dir = tempfile::tempdir().unwrap();
    let thresholds = ResourceThresholds { hysteresis_seconds: 0, ..ResourceThresholds::default() };
    let monitor = ResourceMonitor::new(dir.path().to_path_buf(), thresholds, 30);

    let high_load = scanner_core::ResourceUsage { cpu_pct: 95.0, ..Default::default() };
    let (throttle_needed, reason) = monitor.should_throttle(high_load, 0);
    assert!(throttle_needed);
    monitor.apply_throttle(reason);

    let first = monitor.throttle_snapshot();
    assert!(first.active);
    assert_eq!(first.dwell_multiplier, 1.5);
    assert_eq!(first.skip_frequencies, 1);

    let (throttle_needed, reason) = monitor.should_throttle(high_load, 0);
    assert!(throttle_needed);
    monitor.apply_throttle(reason);

    let second = monitor.throttle_snapshot();
    assert_eq!(second.chunk_duration_seconds, 60);
    assert_eq!(second.skip_frequencies, 2);
    assert_eq!(second.dwell_multiplier, 1.5); // escalation never relaxes dwell

    let low_load = scanner_core::ResourceUsage { cpu_pct: 10.0, io_wait_pct: 1.0, memory_pct: 10.0, ..Default::default() };
    assert!(monitor.should_release_throttle(low_load));
    monitor.release_throttle();

    let released = monitor.throttle_snapshot();
    assert!(!released.active);
    assert_eq!(released.dwell_multiplier, 1.0);
    assert_eq!(released.skip_frequencies, 0);
}

/// S5 - paused state: while `paused` is set, the scan loop sleeps instead
/// of advancing `current_index`; clearing it lets scanning resume within
/// one iteration.
#[tokio::test]
async fn s5_paused_state_halts_then_resumes_the_scan() {
    let (engine, _dir) = build_engine(vec![DetectResult { present: false, strength_dbfs: -60.0 }], 0.02);
    let entries = vec![
        FrequencyEntry::new(146.520, Modulation::Nfm, None).unwrap(),
        FrequencyEntry::new(446.000, Modulation::Nfm, None).unwrap(),
    ];
    assert_eq!(engine.start_scan(&[], entries, None, None), ScanOutcome::Started);
    tokio::time::sleep(Duration::from_millis(80)).await;

    engine.set_paused(true);
    // Let any iteration already past the pause check finish before taking
    // the baseline, so the window below isn't racing that leftover step.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let index_while_paused = engine.current_index();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.current_index(), index_while_paused, "index must not advance while paused");

    engine.set_paused(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Resuming doesn't guarantee a different index (the list may wrap back
    // to the same entry), but the loop must still be alive and bounded.
    assert!(engine.current_index() < 2);
    assert!(engine.is_running());

    assert_eq!(engine.stop_scan().await, StopOutcome::Stopped);
}

/// S6 - wrap-around: with several always-negative frequencies, the index
/// stays in bounds and the loop keeps visiting every entry.
#[tokio::test]
async fn s6_wrap_around_stays_in_bounds() {
    let (engine, _dir) = build_engine(vec![DetectResult { present: false, strength_dbfs: -50.0 }], 0.02);
    let entries = vec![
        FrequencyEntry::new(146.520, Modulation::Nfm, None).unwrap(),
        FrequencyEntry::new(446.000, Modulation::Nfm, None).unwrap(),
        FrequencyEntry::new(462.675, Modulation::Nfm, None).unwrap(),
    ];
    assert_eq!(engine.start_scan(&[], entries, None, None), ScanOutcome::Started);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(engine.current_index() < 3);
    assert_eq!(engine.stop_scan().await, StopOutcome::Stopped);
}
