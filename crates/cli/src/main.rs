//! CLI entry point for Firefly
//!
//! Loads configuration, installs the interrupt handler and runs the
//! pipeline once. Exit code 0 on a clean run (including skipped jobs),
//! non-zero on lock contention or a fatal configuration error.

use clap::Parser;
use firefly::{AppConfig, AppMeta, PipelineDriver};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Firefly - quality-targeted H.265 transcoding with VMAF-guided CRF search
#[derive(Parser, Debug)]
#[command(name = "firefly")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the parameters file (the [params] table)
    #[arg(short, long, default_value = "app_config.toml")]
    config: PathBuf,

    /// Path to the application metadata file
    #[arg(short, long, default_value = "firefly.toml")]
    meta: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let meta = match AppMeta::load_from_file(&args.meta) {
        Ok(meta) => meta,
        Err(e) => {
            error!("Failed to load application metadata: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Fatal configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("{} {} starting", meta.app_name, meta.app_version);
    info!("|-Input directory: {}", config.input_dir.display());
    info!("|-Output directory: {}", config.output_dir.display());

    let driver = PipelineDriver::new(config, meta);
    let cancel = driver.cancel_flag();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; stopping after the current step.");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    match tokio::task::spawn_blocking(move || driver.run()).await {
        Ok(Ok(summary)) => {
            if summary.cancelled {
                info!("Run cancelled; journals left at their last checkpoint.");
            }
            info!(
                "{} jobs processed ({} completed, {} stopped, {} HDR pass-through, {} failed)",
                summary.total_jobs,
                summary.completed,
                summary.stopped_safe,
                summary.skipped_hdr,
                summary.failed
            );
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Run failed: {}", e);
            ExitCode::FAILURE
        }
        Err(join_error) => {
            error!("Pipeline task panicked: {}", join_error);
            ExitCode::FAILURE
        }
    }
}
