//! Audio Pipeline: demodulator + encoder subprocess supervision, chunked
//! recording, and session assembly.
//!
//! At most one recording is live at a time. Chunk files appear atomically
//! (written to a `.tmp` sibling, then renamed) so external readers of the
//! recordings directory never observe a partially-written chunk.

use crate::domain::{FrequencyEntry, RecordingSession};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("a recording is already in progress on {0:.4} MHz")]
    AlreadyRecording(f64),
    #[error("failed to spawn demodulator: {0}")]
    DemodulatorSpawnFailed(String),
    #[error("assembly failed: {0}")]
    AssemblyFailed(String),
}

/// Subprocess paths and recording parameters the pipeline needs to launch
/// a demodulator/encoder pair. Constructed once from `ScannerConfig`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub demodulator_path: String,
    pub encoder_path: String,
    pub recordings_dir: PathBuf,
    pub device_index: u32,
    pub niceness: i8,
    pub bitrate_bps: u32,
}

/// `ionice` class used for the encoder: best-effort idle, so encoding never
/// competes with the demodulator or the rest of the system for disk I/O.
const IONICE_IDLE_CLASS: u8 = 3;

/// Wraps `program` in `nice -n <niceness>` (and, for the encoder, an
/// `ionice -c 3` idle I/O class ahead of that), matching the scheduling
/// priority lowered for both recording subprocesses. The whole chain is
/// placed in its own session so `terminate_child` can signal a demodulator
/// or encoder that forks as a single unit.
fn niced_command(program: &str, args: &[String], niceness: i8, ionice_idle: bool) -> Command {
    let mut argv: Vec<String> = vec!["nice".to_string(), "-n".to_string(), niceness.to_string()];
    if ionice_idle {
        argv.push("ionice".to_string());
        argv.push("-c".to_string());
        argv.push(IONICE_IDLE_CLASS.to_string());
    }
    argv.push(program.to_string());
    argv.extend_from_slice(args);

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }
    cmd
}

/// Bounds a demodulator→encoder copy loop to a wall-clock duration, then
/// reports whether the source hit EOF first or the deadline did.
enum CopyOutcome {
    DeadlineHit,
    SourceEof,
    Error(std::io::Error),
}

async fn copy_until(
    src: &mut tokio::process::ChildStdout,
    dst: &mut tokio::process::ChildStdin,
    deadline: Instant,
) -> CopyOutcome {
    let mut buf = [0u8; 8192];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return CopyOutcome::DeadlineHit;
        }
        match tokio::time::timeout(remaining, src.read(&mut buf)).await {
            Ok(Ok(0)) => return CopyOutcome::SourceEof,
            Ok(Ok(n)) => {
                if let Err(err) = dst.write_all(&buf[..n]).await {
                    return CopyOutcome::Error(err);
                }
            }
            Ok(Err(err)) => return CopyOutcome::Error(err),
            Err(_) => return CopyOutcome::DeadlineHit,
        }
    }
}

/// Metadata and chunk paths returned once a recording is stopped, enough
/// for the caller to assemble a session file without re-deriving the
/// naming prefix.
pub struct StoppedRecording {
    pub entry: FrequencyEntry,
    pub start_time: DateTime<Utc>,
    pub chunks: Vec<PathBuf>,
}

struct ActiveRecording {
    entry: FrequencyEntry,
    start_time: DateTime<Utc>,
    demodulator: Child,
    stop_flag: Arc<AtomicBool>,
    chunks: Arc<Mutex<Vec<PathBuf>>>,
    pump_task: tokio::task::JoinHandle<()>,
}

pub struct AudioPipeline {
    settings: PipelineSettings,
    active: Mutex<Option<ActiveRecording>>,
}

impl AudioPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        AudioPipeline {
            settings,
            active: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(rec) => match rec.demodulator.try_wait() {
                Ok(None) => true,
                _ => false,
            },
            None => false,
        }
    }

    pub fn current_freq_mhz(&self) -> Option<f64> {
        self.active.lock().as_ref().map(|r| r.entry.freq_mhz)
    }

    pub fn session_start_time(&self) -> Option<DateTime<Utc>> {
        self.active.lock().as_ref().map(|r| r.start_time)
    }

    /// Launch the demodulator and the chunk-rotation pump for a fresh
    /// session. Fails without leaving a dangling subprocess if a recording
    /// is already in progress or the demodulator cannot be spawned.
    pub async fn start_recording(
        &self,
        entry: FrequencyEntry,
        chunk_duration: Duration,
        start_time: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if self.active.lock().is_some() {
            return Err(PipelineError::AlreadyRecording(entry.freq_mhz));
        }

        let freq_hz = (entry.freq_mhz * 1_000_000.0) as u64;
        let demod_args = vec![
            "-d".to_string(),
            self.settings.device_index.to_string(),
            "-f".to_string(),
            freq_hz.to_string(),
            "-s".to_string(),
            "48000".to_string(),
            "-r".to_string(),
            "48000".to_string(),
        ];
        let mut demodulator = niced_command(&self.settings.demodulator_path, &demod_args, self.settings.niceness, false)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::DemodulatorSpawnFailed(e.to_string()))?;

        let Some(stdout) = demodulator.stdout.take() else {
            let _ = demodulator.start_kill();
            return Err(PipelineError::DemodulatorSpawnFailed(
                "demodulator stdout unavailable".to_string(),
            ));
        };

        let session = RecordingSession::new(entry.clone(), start_time);
        let prefix = session.file_prefix();
        let dir = self.settings.recordings_dir.clone();
        let encoder_path = self.settings.encoder_path.clone();
        let bitrate = self.settings.bitrate_bps;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let chunks = Arc::new(Mutex::new(Vec::new()));

        let niceness = self.settings.niceness;
        let pump_task = tokio::spawn(run_pump(PumpContext {
            stdout,
            prefix,
            dir,
            encoder_path,
            bitrate,
            niceness,
            chunk_duration,
            stop_flag: stop_flag.clone(),
            chunks: chunks.clone(),
        }));

        *self.active.lock() = Some(ActiveRecording {
            entry,
            start_time,
            demodulator,
            stop_flag,
            chunks,
            pump_task,
        });
        Ok(())
    }

    /// Terminate encoder pipeline and demodulator, then return the ordered
    /// chunk paths written so far along with the session metadata. Returns
    /// `None` if nothing was recording.
    pub async fn stop_recording(&self) -> Option<StoppedRecording> {
        let active = self.active.lock().take();
        let mut active = active?;

        active.stop_flag.store(true, Ordering::SeqCst);
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut active.pump_task).await;

        terminate_child(&mut active.demodulator).await;

        let chunks = active.chunks.lock().clone();
        Some(StoppedRecording {
            entry: active.entry,
            start_time: active.start_time,
            chunks,
        })
    }

    /// Combine chunk files into one session file. A single chunk is
    /// renamed in place; multiple chunks are concatenated via a
    /// stream-copy demuxer run so no re-encoding happens.
    pub async fn assemble_session(&self, chunks: &[PathBuf], target: &Path) -> Result<(), PipelineError> {
        let existing: Vec<&PathBuf> = chunks.iter().filter(|p| p.exists()).collect();
        if existing.is_empty() {
            return Err(PipelineError::AssemblyFailed("no chunks present".to_string()));
        }

        if existing.len() == 1 {
            tokio::fs::rename(existing[0], target)
                .await
                .map_err(|e| PipelineError::AssemblyFailed(e.to_string()))?;
            return Ok(());
        }

        let manifest_path = target.with_extension("concat.txt");
        let manifest = concat_manifest(&existing);
        tokio::fs::write(&manifest_path, manifest)
            .await
            .map_err(|e| PipelineError::AssemblyFailed(e.to_string()))?;

        let status = tokio::time::timeout(
            Duration::from_secs(30),
            Command::new("ffmpeg")
                .arg("-y")
                .arg("-f")
                .arg("concat")
                .arg("-safe")
                .arg("0")
                .arg("-i")
                .arg(&manifest_path)
                .arg("-c")
                .arg("copy")
                .arg(target)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await
        .map_err(|_| PipelineError::AssemblyFailed("concat timed out".to_string()))?
        .map_err(|e| PipelineError::AssemblyFailed(e.to_string()))?;

        let _ = tokio::fs::remove_file(&manifest_path).await;

        if !status.success() {
            return Err(PipelineError::AssemblyFailed(format!(
                "ffmpeg concat exited with {status}"
            )));
        }

        for chunk in existing {
            let _ = tokio::fs::remove_file(chunk).await;
        }
        Ok(())
    }
}

fn concat_manifest(chunks: &[&PathBuf]) -> String {
    chunks
        .iter()
        .map(|p| format!("file '{}'\n", p.display()))
        .collect()
}

struct PumpContext {
    stdout: tokio::process::ChildStdout,
    prefix: String,
    dir: PathBuf,
    encoder_path: String,
    bitrate: u32,
    niceness: i8,
    chunk_duration: Duration,
    stop_flag: Arc<AtomicBool>,
    chunks: Arc<Mutex<Vec<PathBuf>>>,
}

/// Repeatedly spawns one encoder per chunk, copies demodulator output into
/// it for up to `chunk_duration`, then renames the finished chunk into
/// place. Stops when the demodulator reaches EOF or `stop_flag` is set.
async fn run_pump(mut ctx: PumpContext) {
    let mut stdout = ctx.stdout;
    let mut chunk_index: u32 = 0;

    loop {
        if ctx.stop_flag.load(Ordering::SeqCst) {
            break;
        }

        let final_path = ctx.dir.join(format!("{}_part{:03}.ogg", ctx.prefix, chunk_index));
        let tmp_path = final_path.with_extension("ogg.tmp");

        let encoder_args = vec![
            "--bitrate".to_string(),
            ctx.bitrate.to_string(),
            "--raw".to_string(),
            "--raw-rate".to_string(),
            "48000".to_string(),
            "--raw-chan".to_string(),
            "2".to_string(),
            "-".to_string(),
            tmp_path.to_string_lossy().into_owned(),
        ];
        let mut encoder = match niced_command(&ctx.encoder_path, &encoder_args, ctx.niceness, true)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(%err, "failed to spawn encoder for chunk");
                break;
            }
        };

        let Some(mut stdin) = encoder.stdin.take() else {
            let _ = encoder.start_kill();
            break;
        };

        let deadline = Instant::now() + ctx.chunk_duration;
        let outcome = copy_until(&mut stdout, &mut stdin, deadline).await;
        drop(stdin);
        let _ = encoder.wait().await;

        match &outcome {
            CopyOutcome::Error(err) => {
                tracing::warn!(%err, "demodulator read error, ending recording");
                let _ = tokio::fs::remove_file(&tmp_path).await;
                break;
            }
            CopyOutcome::DeadlineHit | CopyOutcome::SourceEof => {
                if tokio::fs::rename(&tmp_path, &final_path).await.is_ok() {
                    ctx.chunks.lock().push(final_path);
                }
            }
        }

        chunk_index += 1;
        if matches!(outcome, CopyOutcome::SourceEof) {
            break;
        }
    }
}

/// `child` was started in its own session via `niced_command`'s `setsid`
/// `pre_exec`, so its pid doubles as its process group id; signaling the
/// negative pid reaches every process it forked, not just the direct child.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Modulation;

    #[test]
    fn concat_manifest_quotes_each_chunk() {
        let a = PathBuf::from("/tmp/a.ogg");
        let b = PathBuf::from("/tmp/b.ogg");
        let manifest = concat_manifest(&[&a, &b]);
        assert_eq!(manifest, "file '/tmp/a.ogg'\nfile '/tmp/b.ogg'\n");
    }

    #[tokio::test]
    async fn assemble_single_chunk_renames_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = dir.path().join("session_part000.ogg");
        tokio::fs::write(&chunk, b"opus-bytes").await.unwrap();
        let target = dir.path().join("session.ogg");

        let settings = PipelineSettings {
            demodulator_path: "true".to_string(),
            encoder_path: "true".to_string(),
            recordings_dir: dir.path().to_path_buf(),
            device_index: 0,
            niceness: 10,
            bitrate_bps: 48_000,
        };
        let pipeline = AudioPipeline::new(settings);
        pipeline
            .assemble_session(&[chunk.clone()], &target)
            .await
            .unwrap();

        assert!(target.exists());
        assert!(!chunk.exists());
    }

    #[tokio::test]
    async fn assemble_missing_chunks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("session_part000.ogg");
        tokio::fs::write(&present, b"opus-bytes").await.unwrap();
        let missing = dir.path().join("session_part001.ogg");
        let target = dir.path().join("session.ogg");

        let settings = PipelineSettings {
            demodulator_path: "true".to_string(),
            encoder_path: "true".to_string(),
            recordings_dir: dir.path().to_path_buf(),
            device_index: 0,
            niceness: 10,
            bitrate_bps: 48_000,
        };
        let pipeline = AudioPipeline::new(settings);
        // Only one chunk actually exists, so this takes the single-chunk
        // rename path rather than invoking the concat subprocess.
        pipeline
            .assemble_session(&[present.clone(), missing], &target)
            .await
            .unwrap();

        assert!(target.exists());
    }

    #[tokio::test]
    async fn assemble_with_no_existing_chunks_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("session.ogg");
        let settings = PipelineSettings {
            demodulator_path: "true".to_string(),
            encoder_path: "true".to_string(),
            recordings_dir: dir.path().to_path_buf(),
            device_index: 0,
            niceness: 10,
            bitrate_bps: 48_000,
        };
        let pipeline = AudioPipeline::new(settings);
        let result = pipeline
            .assemble_session(&[dir.path().join("gone.ogg")], &target)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn not_recording_initially() {
        let settings = PipelineSettings {
            demodulator_path: "true".to_string(),
            encoder_path: "true".to_string(),
            recordings_dir: PathBuf::from("/tmp"),
            device_index: 0,
            niceness: 10,
            bitrate_bps: 48_000,
        };
        let pipeline = AudioPipeline::new(settings);
        assert!(!pipeline.is_recording());
        assert!(pipeline.current_freq_mhz().is_none());
        let _ = Modulation::Nfm;
    }
}
