//! Resource Monitor: samples CPU/memory/swap/IO/USB health and drives
//! `ThrottleState` with hysteresis.

use crate::config::ResourceThresholds;
use crate::throttle::ThrottleState;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Disks, System};
use tokio::process::Command;

/// A point-in-time snapshot of host resource usage. A failed sample
/// degrades to all-zero fields rather than propagating an error, per the
/// "resource sampling failure never triggers a false escalation" policy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_pct: f64,
    pub cpu_user_pct: f64,
    pub cpu_system_pct: f64,
    pub io_wait_pct: f64,
    pub memory_pct: f64,
    pub swap_used_mb: f64,
    pub disk_free_bytes: u64,
    pub recordings_dir_bytes: u64,
}

pub struct ResourceMonitor {
    system: Mutex<System>,
    base_dir: PathBuf,
    recordings_dir: PathBuf,
    dmesg_path: String,
    baseline_swap_mb: f64,
    last_usb_error_count: AtomicU64,
    usb_error_baseline: AtomicU64,
    thresholds: Mutex<ResourceThresholds>,
    throttle: Mutex<ThrottleState>,
    default_chunk_duration_seconds: AtomicU64,
}

impl ResourceMonitor {
    pub fn new(base_dir: PathBuf, thresholds: ResourceThresholds, default_chunk_duration_seconds: u64) -> Self {
        let mut system = System::new_all();
        system.refresh_memory();
        let baseline_swap_mb = system.used_swap() as f64 / (1024.0 * 1024.0);
        let recordings_dir = base_dir.join("recordings");

        ResourceMonitor {
            system: Mutex::new(system),
            base_dir,
            recordings_dir,
            dmesg_path: "dmesg".to_string(),
            baseline_swap_mb,
            last_usb_error_count: AtomicU64::new(0),
            usb_error_baseline: AtomicU64::new(0),
            thresholds: Mutex::new(thresholds),
            throttle: Mutex::new(ThrottleState::new()),
            default_chunk_duration_seconds: AtomicU64::new(default_chunk_duration_seconds),
        }
    }

    pub fn throttle_snapshot(&self) -> ThrottleState {
        self.throttle.lock().clone()
    }

    pub fn set_thresholds(&self, thresholds: ResourceThresholds) {
        *self.thresholds.lock() = thresholds;
    }

    pub fn thresholds(&self) -> ResourceThresholds {
        self.thresholds.lock().clone()
    }

    pub fn set_default_chunk_duration_seconds(&self, seconds: u64) {
        self.default_chunk_duration_seconds.store(seconds, Ordering::Relaxed);
    }

    /// Sets or clears `ThrottleState.paused` directly, independent of the
    /// load-based throttle decision. The only external trigger for a pause
    /// in this crate; nothing in `monitor_and_adjust` sets it on its own.
    pub fn set_paused(&self, paused: bool) {
        self.throttle.lock().paused = paused;
    }

    /// Most recent USB error count observed by `check_usb_errors`, without
    /// spawning `dmesg` again.
    pub fn last_usb_error_count(&self) -> u64 {
        self.last_usb_error_count.load(Ordering::Relaxed)
    }

    /// Instantaneous CPU/memory/disk sample. `sysinfo` has no native iowait
    /// figure, so it is approximated from `/proc/stat`'s `iowait` jiffies
    /// delta when available and left at zero otherwise (still a safe,
    /// zeroed-on-failure degrade).
    pub fn get_resource_usage(&self) -> ResourceUsage {
        let mut system = self.system.lock();
        system.refresh_cpu_all();
        system.refresh_memory();

        let cpu_pct = system.global_cpu_usage() as f64;
        let total_mem = system.total_memory();
        let used_mem = system.used_memory();
        let memory_pct = if total_mem > 0 {
            (used_mem as f64 / total_mem as f64) * 100.0
        } else {
            0.0
        };
        let swap_used_mb = system.used_swap() as f64 / (1024.0 * 1024.0);

        let disks = Disks::new_with_refreshed_list();
        let disk_free_bytes = disks
            .iter()
            .filter(|d| self.base_dir.starts_with(d.mount_point()))
            .map(|d| d.available_space())
            .max()
            .unwrap_or(0);

        let recordings_dir_bytes = dir_size(&self.recordings_dir);

        ResourceUsage {
            cpu_pct,
            cpu_user_pct: cpu_pct,
            cpu_system_pct: 0.0,
            io_wait_pct: read_iowait_pct().unwrap_or(0.0),
            memory_pct,
            swap_used_mb,
            disk_free_bytes,
            recordings_dir_bytes,
        }
    }

    /// Scans the kernel ring buffer for lines mentioning "usb" alongside
    /// "error" or "fail" (case-insensitive). Returns the cumulative count
    /// seen this process lifetime; a dmesg failure degrades to the last
    /// observed count rather than propagating. This only updates the
    /// status-reporting counter — the throttle trigger baseline in
    /// `should_throttle` is separate and only advances when it fires.
    pub async fn check_usb_errors(&self) -> u64 {
        let output = Command::new(&self.dmesg_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        let text = match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).to_string(),
            _ => return self.last_usb_error_count.load(Ordering::Relaxed),
        };

        let count = count_usb_errors(&text);
        self.last_usb_error_count.store(count, Ordering::Relaxed);
        count
    }

    pub fn should_throttle(&self, res: ResourceUsage, usb_error_count: u64) -> (bool, String) {
        let thresholds = self.thresholds.lock();
        let mut reasons = Vec::new();

        if res.cpu_pct > thresholds.cpu_max_pct {
            reasons.push(format!("cpu {:.1}% > {:.1}%", res.cpu_pct, thresholds.cpu_max_pct));
        }
        if res.io_wait_pct > thresholds.io_wait_max_pct {
            reasons.push(format!(
                "iowait {:.1}% > {:.1}%",
                res.io_wait_pct, thresholds.io_wait_max_pct
            ));
        }
        if res.memory_pct > thresholds.memory_max_pct {
            reasons.push(format!(
                "memory {:.1}% > {:.1}%",
                res.memory_pct, thresholds.memory_max_pct
            ));
        }
        let swap_growth = res.swap_used_mb - self.baseline_swap_mb;
        if swap_growth > thresholds.swap_growth_max_mb {
            reasons.push(format!(
                "swap grew {:.1}MB > {:.1}MB",
                swap_growth, thresholds.swap_growth_max_mb
            ));
        }
        let baseline = self.usb_error_baseline.load(Ordering::Relaxed);
        if usb_error_count > baseline && usb_error_count - baseline > thresholds.usb_error_max_delta {
            reasons.push(format!(
                "usb errors +{} > {}",
                usb_error_count - baseline,
                thresholds.usb_error_max_delta
            ));
            self.usb_error_baseline.store(usb_error_count, Ordering::Relaxed);
        }

        (!reasons.is_empty(), reasons.join("; "))
    }

    pub fn should_release_throttle(&self, res: ResourceUsage) -> bool {
        let throttle = self.throttle.lock();
        if !throttle.active {
            return false;
        }
        let thresholds = self.thresholds.lock();
        let now = Utc::now();
        if !throttle.hysteresis_elapsed(thresholds.hysteresis_seconds, now) {
            return false;
        }
        res.cpu_pct < thresholds.cpu_max_pct * 0.9
            && res.io_wait_pct < thresholds.io_wait_max_pct * 0.9
            && res.memory_pct < thresholds.memory_max_pct * 0.9
    }

    pub fn apply_throttle(&self, reason: String) {
        let default_chunk = self.default_chunk_duration_seconds.load(Ordering::Relaxed);
        self.throttle.lock().apply(reason, default_chunk, Utc::now());
    }

    pub fn release_throttle(&self) {
        let default_chunk = self.default_chunk_duration_seconds.load(Ordering::Relaxed);
        self.throttle.lock().release(default_chunk);
    }

    /// Composes sampling and the throttle decision. Invoked by the engine
    /// before every frequency probe.
    pub async fn monitor_and_adjust(&self) -> ResourceUsage {
        let usage = self.get_resource_usage();
        let usb_errors = self.check_usb_errors().await;

        let (throttle_needed, reason) = self.should_throttle(usage, usb_errors);
        if throttle_needed {
            self.apply_throttle(reason);
        } else if self.should_release_throttle(usage) {
            self.release_throttle();
        }
        usage
    }
}

fn dir_size(dir: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

fn count_usb_errors(text: &str) -> u64 {
    text.lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("usb") && (lower.contains("error") || lower.contains("fail"))
        })
        .count() as u64
}

fn read_iowait_pct() -> Option<f64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;
    let mut fields = line.split_whitespace();
    fields.next()?; // "cpu"
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    // user nice system idle iowait irq softirq steal
    let iowait = *values.get(4)?;
    let total: u64 = values.iter().sum();
    if total == 0 {
        return Some(0.0);
    }
    Some((iowait as f64 / total as f64) * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_error_counting_is_case_insensitive_and_requires_both_terms() {
        let log = "USB disconnect\nusb 1-1: Error enumerating device\nusb 1-1: FAIL to reset\nunrelated error line\n";
        assert_eq!(count_usb_errors(log), 2);
    }

    #[test]
    fn should_throttle_reports_concatenated_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::new(dir.path().to_path_buf(), ResourceThresholds::default(), 30);
        let res = ResourceUsage {
            cpu_pct: 99.0,
            memory_pct: 99.0,
            ..Default::default()
        };
        let (throttle, reason) = monitor.should_throttle(res, 0);
        assert!(throttle);
        assert!(reason.contains("cpu"));
        assert!(reason.contains("memory"));
        assert!(reason.contains("; "));
    }

    #[test]
    fn should_not_throttle_when_under_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::new(dir.path().to_path_buf(), ResourceThresholds::default(), 30);
        let res = ResourceUsage {
            cpu_pct: 10.0,
            memory_pct: 10.0,
            ..Default::default()
        };
        let (throttle, reason) = monitor.should_throttle(res, 0);
        assert!(!throttle);
        assert!(reason.is_empty());
    }

    #[test]
    fn release_requires_hysteresis_and_low_usage() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::new(dir.path().to_path_buf(), ResourceThresholds::default(), 30);
        monitor.apply_throttle("cpu".to_string());

        let low_usage = ResourceUsage {
            cpu_pct: 5.0,
            io_wait_pct: 1.0,
            memory_pct: 5.0,
            ..Default::default()
        };
        // Hysteresis has not elapsed yet.
        assert!(!monitor.should_release_throttle(low_usage));
    }

    #[test]
    fn zeroed_usage_never_triggers_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::new(dir.path().to_path_buf(), ResourceThresholds::default(), 30);
        let (throttle, _) = monitor.should_throttle(ResourceUsage::default(), 0);
        assert!(!throttle);
    }

    #[test]
    fn usb_error_trigger_compares_against_a_baseline_that_only_moves_on_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::new(dir.path().to_path_buf(), ResourceThresholds::default(), 30);
        let max_delta = monitor.thresholds().usb_error_max_delta;

        // Small deltas never move the baseline or fire the trigger.
        let (throttle, _) = monitor.should_throttle(ResourceUsage::default(), max_delta);
        assert!(!throttle);

        // Crossing the delta fires once and advances the baseline to the
        // fresh count, so re-checking the same count no longer fires.
        let spike = max_delta + 1;
        let (throttle, reason) = monitor.should_throttle(ResourceUsage::default(), spike);
        assert!(throttle);
        assert!(reason.contains("usb errors"));

        let (throttle_again, _) = monitor.should_throttle(ResourceUsage::default(), spike);
        assert!(!throttle_again, "baseline must have advanced to the triggering count");

        // A further spike past the new baseline fires again.
        let (throttle_next, _) = monitor.should_throttle(ResourceUsage::default(), spike + max_delta + 1);
        assert!(throttle_next);
    }
}
