use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvm_video::config::{HwAccelMode, PipelineConfig};
use kvm_video::events::PipelineEvent;
use kvm_video::video::VideoPipeline;

/// Log level for the daemon
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// kvm-videod command line arguments
#[derive(Parser, Debug)]
#[command(name = "kvm-videod")]
#[command(version, about = "IP-KVM video capture and encode pipeline", long_about = None)]
struct CliArgs {
    /// Capture device path (overrides VIDEO_DEVICE)
    #[arg(short = 'd', long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Target frame rate (overrides VIDEO_FPS)
    #[arg(short = 'f', long, value_name = "FPS")]
    fps: Option<u32>,

    /// Bitrate token, e.g. 4M (overrides VIDEO_BITRATE)
    #[arg(short = 'b', long, value_name = "BITRATE")]
    bitrate: Option<String>,

    /// Hardware acceleration mode: auto, vaapi, qsv, none
    #[arg(long, value_name = "MODE")]
    hwaccel: Option<String>,

    /// Encoder binary to supervise
    #[arg(long, value_name = "PROGRAM", default_value = "ffmpeg")]
    encoder: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting kvm-videod v{}", env!("CARGO_PKG_VERSION"));

    // Environment first, CLI overrides on top
    let mut config = PipelineConfig::from_env();
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(fps) = args.fps {
        if (1..=120).contains(&fps) {
            config.fps = fps;
        } else {
            tracing::warn!("--fps {} out of range 1-120, keeping {}", fps, config.fps);
        }
    }
    if let Some(bitrate) = args.bitrate {
        config.bitrate = bitrate;
    }
    if let Some(mode_str) = args.hwaccel {
        match HwAccelMode::parse(&mode_str) {
            Some(mode) => config.hwaccel = mode,
            None => tracing::warn!("Unrecognized --hwaccel {:?}, keeping auto", mode_str),
        }
    }

    // The downstream transport owns both queues; these sinks stand in
    // for it and keep the daemon useful as a diagnostic tool.
    let (frame_tx, mut frame_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let pipeline = Arc::new(
        VideoPipeline::new(config, frame_tx, event_tx).with_encoder_program(&args.encoder),
    );
    pipeline.init()?;

    tokio::spawn(async move {
        let mut frames: u64 = 0;
        let mut bytes: u64 = 0;
        while let Some(frame) = frame_rx.recv().await {
            frames += 1;
            bytes += frame.len() as u64;
            if frames % 300 == 0 {
                tracing::info!("Delivered {} frames, {} bytes total", frames, bytes);
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                PipelineEvent::State(state) => {
                    tracing::debug!("State: ready={} fps={}", state.ready, state.fps)
                }
                PipelineEvent::WorkerExit { worker, reason } => {
                    tracing::info!("Worker {:?} exited: {:?}", worker, reason)
                }
            }
        }
    });

    pipeline.start().await?;
    tracing::info!("{}", pipeline.status_summary());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    pipeline.shutdown().await;
    tracing::info!("{}", pipeline.status_summary());

    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "kvm_video=error,kvm_videod=error",
        LogLevel::Warn => "kvm_video=warn,kvm_videod=warn",
        LogLevel::Info => "kvm_video=info,kvm_videod=info",
        LogLevel::Debug => "kvm_video=debug,kvm_videod=debug",
        LogLevel::Trace => "kvm_video=trace,kvm_videod=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
