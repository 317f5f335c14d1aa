//! Periodic retention sweep: deletes recordings older than
//! `retention_days`, then trims the oldest remaining files if the
//! directory still exceeds `storage_cap_bytes`.

use scanner_core::ScannerEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub async fn run_retention_sweep(engine: Arc<ScannerEngine>, recordings_dir: PathBuf) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let config = engine.config();
        if let Err(err) = sweep_once(&recordings_dir, config.retention_days, config.storage_cap_bytes) {
            tracing::warn!(%err, "retention sweep failed");
        }
    }
}

fn sweep_once(dir: &Path, retention_days: u32, storage_cap_bytes: u64) -> std::io::Result<()> {
    let files: Vec<(PathBuf, SystemTime, u64)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let metadata = e.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().ok()?;
            Some((e.path(), modified, metadata.len()))
        })
        .collect();

    for path in plan_removals(files, retention_days, storage_cap_bytes, SystemTime::now()) {
        if std::fs::remove_file(&path).is_ok() {
            tracing::info!(path = %path.display(), "removed recording by retention policy");
        }
    }

    Ok(())
}

/// Pure decision logic: which files to delete, given their modified time
/// and size, a retention window, and a storage cap. Files past the
/// retention window are always removed; among the survivors, the oldest
/// are removed first until the remaining total fits under the cap.
fn plan_removals(
    mut files: Vec<(PathBuf, SystemTime, u64)>,
    retention_days: u32,
    storage_cap_bytes: u64,
    now: SystemTime,
) -> Vec<PathBuf> {
    let cutoff = now - Duration::from_secs(retention_days as u64 * 86_400);
    let mut removed = Vec::new();

    files.retain(|(path, modified, _)| {
        if *modified < cutoff {
            removed.push(path.clone());
            false
        } else {
            true
        }
    });

    let mut total: u64 = files.iter().map(|(_, _, len)| len).sum();
    if total <= storage_cap_bytes {
        return removed;
    }

    files.sort_by_key(|(_, modified, _)| *modified);
    for (path, _, len) in files {
        if total <= storage_cap_bytes {
            break;
        }
        removed.push(path);
        total = total.saturating_sub(len);
    }

    removed
}
