//! sdr-scand - dual-dongle SDR scanner and recorder daemon
//!
//! Entry point: parses CLI flags, wires up the scanner core and HTTP
//! server, and runs until Ctrl+C.

use anyhow::{Context, Result};
use sdr_scand::{Daemon, DaemonOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    let options = match parse_args() {
        ParsedArgs::Run(options) => options,
        ParsedArgs::PrintAndExit => return Ok(()),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(options))
}

enum ParsedArgs {
    Run(DaemonOptions),
    PrintAndExit,
}

fn parse_args() -> ParsedArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut options = DaemonOptions::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-v" => {
                println!("sdr-scand {}", scanner_core::VERSION);
                return ParsedArgs::PrintAndExit;
            }
            "--help" | "-h" => {
                print_help();
                return ParsedArgs::PrintAndExit;
            }
            "--base-dir" => {
                if let Some(v) = args.get(i + 1) {
                    options.base_dir = PathBuf::from(v);
                    i += 2;
                    continue;
                }
                eprintln!("Error: --base-dir requires a path");
                return ParsedArgs::PrintAndExit;
            }
            "--port" => {
                if let Some(v) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                    options.port = v;
                    i += 2;
                    continue;
                }
                eprintln!("Error: --port requires a number");
                return ParsedArgs::PrintAndExit;
            }
            "--scan-device" => {
                if let Some(v) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                    options.scan_device_index = v;
                    i += 2;
                    continue;
                }
                eprintln!("Error: --scan-device requires a device index");
                return ParsedArgs::PrintAndExit;
            }
            "--record-device" => {
                if let Some(v) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                    options.record_device_index = v;
                    i += 2;
                    continue;
                }
                eprintln!("Error: --record-device requires a device index");
                return ParsedArgs::PrintAndExit;
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {arg}");
                print_help();
                return ParsedArgs::PrintAndExit;
            }
            _ => {}
        }
        i += 1;
    }

    ParsedArgs::Run(options)
}

fn print_help() {
    println!("Usage: sdr-scand [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --base-dir PATH       Base directory for recordings/ and logs/ (default: ./sdr-scand-data)");
    println!("  --port PORT           HTTP control port (default: 8920)");
    println!("  --scan-device INDEX   RTL-SDR device index used for scanning/detection");
    println!("  --record-device INDEX RTL-SDR device index used for recording");
    println!("  -v, --version         Show version");
    println!("  -h, --help            Show this help");
}

async fn run(options: DaemonOptions) -> Result<()> {
    let daemon = Daemon::bootstrap(options).await?;

    daemon.log_startup_banner();

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = running.clone();
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    let server_handle = tokio::spawn(daemon.clone().run_server());

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    tracing::info!("shutdown requested, stopping scan and assembling in-flight recording");
    daemon.shutdown().await;
    server_handle.abort();

    Ok(())
}
