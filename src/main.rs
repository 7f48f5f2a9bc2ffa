// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use marker_camera::constants::app_info;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "marker-camera")]
#[command(about = "Live camera preview for marker detection")]
#[command(version = app_info::version())]
struct Cli {
    /// Use the synthetic camera instead of V4L2 devices
    #[arg(long = "virtual", global = true)]
    use_virtual: bool,

    /// Config file (default: ~/.config/marker-camera/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Camera id to open (overrides the config)
    #[arg(short, long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    List,

    /// Run the preview pipeline and report throughput
    Preview {
        /// Display width to negotiate for
        #[arg(long, default_value = "1280")]
        width: u32,

        /// Display height to negotiate for
        #[arg(long, default_value = "720")]
        height: u32,

        /// Run time in seconds
        #[arg(short = 't', long, default_value = "10")]
        duration: u64,
    },

    /// Run marker detection on live frames
    Detect {
        /// Display width to negotiate for
        #[arg(long, default_value = "1280")]
        width: u32,

        /// Display height to negotiate for
        #[arg(long, default_value = "720")]
        height: u32,

        /// Run time in seconds
        #[arg(short = 't', long, default_value = "10")]
        duration: u64,

        /// Request a calibration on the first processed frame
        #[arg(long)]
        calibrate: bool,

        /// Save the last processed frame as PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Save one converted frame as PNG
    Snapshot {
        /// Display width to negotiate for
        #[arg(long, default_value = "1920")]
        width: u32,

        /// Display height to negotiate for
        #[arg(long, default_value = "1080")]
        height: u32,

        /// Save the luma plane instead of the colour frame
        #[arg(long)]
        gray: bool,

        /// Output file path (default: ~/Pictures/marker-camera/snapshot_TIMESTAMP.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=marker_camera=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let args = Cli::parse();
    let options = cli::Options {
        use_virtual: args.use_virtual,
        config: args.config,
        device: args.device,
    };

    match args.command {
        Commands::List => cli::list_cameras(&options),
        Commands::Preview {
            width,
            height,
            duration,
        } => cli::run_preview(&options, width, height, duration),
        Commands::Detect {
            width,
            height,
            duration,
            calibrate,
            output,
        } => cli::detect(&options, width, height, duration, calibrate, output),
        Commands::Snapshot {
            width,
            height,
            gray,
            output,
        } => cli::snapshot(&options, width, height, gray, output),
    }
}
