use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use fg_capture::synthetic::SyntheticSource;
use fg_capture::FrameGrab;

mod config;
mod grabber;
mod metrics;

use config::Config;
use grabber::{Grabber, StopReason};

#[derive(Parser, Debug)]
#[command(name = "fg-grab")]
#[command(about = "Grab window or monitor frames to raw BGRA files", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "fg-grab.toml")]
    config: PathBuf,

    /// Native window handle to capture (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_handle, conflicts_with_all = ["title", "monitor", "synthetic"])]
    hwnd: Option<usize>,

    /// Capture the first window whose title contains this text
    #[arg(short, long, conflicts_with_all = ["monitor", "synthetic"])]
    title: Option<String>,

    /// Monitor index to capture (0 is the primary)
    #[arg(short, long, conflicts_with = "synthetic")]
    monitor: Option<u32>,

    /// Synthetic solid-colour source, as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    synthetic: Option<(u32, u32)>,

    /// Number of frames to write (overrides config)
    #[arg(short = 'n', long)]
    frames: Option<u32>,

    /// Give up after this many milliseconds (overrides config)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Output directory (overrides config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List capturable windows and exit
    #[arg(long)]
    list_windows: bool,
}

fn parse_handle(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid window handle {:?}: {}", s, e))
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {:?}", s))?;
    let width: u32 = w.trim().parse().map_err(|e| format!("invalid width: {}", e))?;
    let height: u32 = h.trim().parse().map_err(|e| format!("invalid height: {}", e))?;
    if width == 0 || height == 0 {
        return Err("width and height must be non-zero".into());
    }
    Ok((width, height))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level))
        )
        .with_target(false)
        .init();

    info!("fg-grab v{}", env!("CARGO_PKG_VERSION"));

    if args.list_windows {
        return list_windows();
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!("Loading configuration from: {}", args.config.display());
        Config::from_file(&args.config)?
    } else {
        warn!("Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(frames) = args.frames {
        config.output.frames = frames;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.output.timeout_ms = timeout_ms;
    }
    if let Some(dir) = &args.output {
        config.output.dir = dir.clone();
    }

    // Validate configuration
    config.validate()?;

    info!("Configuration:");
    info!("  Pool: {} frames, {} OS buffers, {:?}",
          config.session.pool_capacity, config.session.os_buffers,
          config.session.read_mode);
    info!("  Output: {} frames to {}",
          config.output.frames, config.output.dir.display());

    let grab = open_session(&args, &config)?;
    let mut grabber = Grabber::new(grab, config.output.clone());

    match grabber.run()? {
        StopReason::Done => Ok(()),
        StopReason::Timeout => anyhow::bail!("Timed out waiting for frames"),
        StopReason::SessionEnded => anyhow::bail!("Capture target went away"),
    }
}

fn open_session(args: &Args, config: &Config) -> Result<Box<dyn FrameGrab>> {
    let session = config.session.clone();

    if let Some((width, height)) = args.synthetic {
        info!("Capturing synthetic {}x{} source", width, height);
        return fg_capture::start_boxed(SyntheticSource::new(width, height), session)
            .context("Failed to start synthetic capture");
    }

    if let Some(index) = args.monitor {
        return fg_capture::capture_monitor(index, session)
            .with_context(|| format!("Failed to capture monitor {}", index));
    }

    if let Some(hwnd) = args.hwnd {
        return fg_capture::capture_window(hwnd as *mut std::ffi::c_void, session)
            .with_context(|| format!("Failed to capture window {:#x}", hwnd));
    }

    if let Some(title) = &args.title {
        let hwnd = find_window(title)?;
        return fg_capture::capture_window(hwnd, session)
            .with_context(|| format!("Failed to capture window {:?}", title));
    }

    info!("No target given, capturing the primary monitor");
    fg_capture::capture_monitor(0, session).context("Failed to capture primary monitor")
}

#[cfg(windows)]
fn find_window(title: &str) -> Result<*mut std::ffi::c_void> {
    let window = fg_capture::win32::Window::from_contains_name(title)?;
    Ok(window.as_ptr())
}

#[cfg(not(windows))]
fn find_window(_title: &str) -> Result<*mut std::ffi::c_void> {
    anyhow::bail!("Window lookup by title is only available on Windows")
}

#[cfg(windows)]
fn list_windows() -> Result<()> {
    println!("Capturable windows:");
    for (hwnd, title) in fg_capture::win32::list_windows()? {
        println!("  {:#010x}  {}", hwnd, title);
    }
    Ok(())
}

#[cfg(not(windows))]
fn list_windows() -> Result<()> {
    anyhow::bail!("Window listing is only available on Windows")
}
