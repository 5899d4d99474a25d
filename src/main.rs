//! zerobridge binary: load config, run the bridge until signalled.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use zerobridge::{Bridge, EnvCredentialStore};

#[derive(Debug, Parser)]
#[command(name = "zerobridge", version, about = "OT telemetry to Zerobus edge gateway")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "bridge.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let creds = Arc::new(EnvCredentialStore);
    let cfg = zerobridge::config::load_file(&args.config, &*creds)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.check {
        println!("{} is valid", args.config.display());
        return Ok(());
    }

    let bridge = Bridge::new(cfg, creds)
        .await
        .context("initializing bridge")?
        .with_config_path(args.config.clone());
    bridge.start().await.context("starting bridge")?;

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received");
    bridge.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
