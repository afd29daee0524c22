// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! fx2-capture CLI entry point
//!
//! Captures the display of a BK-0011M or UKNC and reports throughput until
//! interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, Command};
use flume::RecvTimeoutError;
use log::{info, warn, LevelFilter};
use simple_logger::SimpleLogger;

use fx2_capture::{CaptureConfig, CaptureSession, Mode, NusbBackend};

/// How often throughput is logged
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let matches = Command::new("fx2-capture")
        .version(env!("CARGO_PKG_VERSION"))
        .author("fx2-capture Authors")
        .about("Live BK-0011M / UKNC video capture through an FX2 logic analyzer")
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MACHINE")
                .value_parser(|s: &str| s.parse::<Mode>())
                .help("Target machine: bk or uknc [default: uknc]"),
        )
        .arg(
            Arg::new("firmware")
                .short('f')
                .long("firmware")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("fx2lafw firmware image staged into a stock FX2"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("palette")
                .short('p')
                .long("palette")
                .value_name("INDEX")
                .value_parser(value_parser!(u8))
                .help("BK palette, 0 is black & white [default: 1]"),
        )
        .arg(
            Arg::new("show-sync")
                .long("show-sync")
                .action(ArgAction::SetTrue)
                .help("Tint sync samples"),
        )
        .arg(
            Arg::new("no-invert-clock")
                .long("no-invert-clock")
                .action(ArgAction::SetTrue)
                .help("Sample on the rising clock edge"),
        )
        .arg(
            Arg::new("watchdog-secs")
                .long("watchdog-secs")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Watchdog period in seconds [default: 5]"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    // Initialize logging
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new().with_level(log_level).init()?;

    // Build configuration: file first, then command line overrides
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => CaptureConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CaptureConfig::default(),
    };
    if let Some(mode) = matches.get_one::<Mode>("mode") {
        config.mode = *mode;
    }
    if let Some(path) = matches.get_one::<PathBuf>("firmware") {
        config.firmware_path.clone_from(path);
    }
    if let Some(palette) = matches.get_one::<u8>("palette") {
        config.palette = usize::from(*palette);
    }
    if matches.get_flag("show-sync") {
        config.show_sync = true;
    }
    if matches.get_flag("no-invert-clock") {
        config.invert_clock = false;
    }
    if let Some(secs) = matches.get_one::<u64>("watchdog-secs") {
        config.watchdog_period_ms = secs.saturating_mul(1000);
    }
    config.validate()?;

    info!("Starting fx2-capture with config: {config:?}");

    let mut session = CaptureSession::new(NusbBackend, &config)?;

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    session.start()?;
    info!("Capturing, press Ctrl+C to stop");

    let frames = session.frames();
    let store = Arc::clone(session.frame_store());
    let mut report_start = Instant::now();
    let mut report_frames = store.frames_completed();

    while running.load(Ordering::SeqCst) {
        match frames.recv_timeout(Duration::from_millis(100)) {
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let elapsed = report_start.elapsed();
        if elapsed < REPORT_INTERVAL {
            continue;
        }

        let completed = store.frames_completed();
        let fps = (completed - report_frames) as f64 / elapsed.as_secs_f64();
        let health = session.health();
        info!(
            "{fps:.1} fps, buffer {}, {} in flight, {} handled, {} empty, {} restarts",
            store.last_completed_index(),
            health.active,
            health.handled,
            health.empty,
            session.restart_attempts()
        );
        if let Some(err) = session.last_error() {
            warn!("Last error: {err}");
        }

        report_start = Instant::now();
        report_frames = completed;
    }

    info!("Stopping fx2-capture...");
    session.stop();
    Ok(())
}
