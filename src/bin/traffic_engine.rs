//! traffic_engine - live camera counter and MJPEG re-broadcaster
//!
//! This daemon:
//! 1. Loads configuration (JSON file + TRAFFIC_* environment)
//! 2. Serves /video_feed, /api/stats and /health
//! 3. Opens the camera and runs detection only while someone is watching

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use traffic_engine::{Engine, EngineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file.
    #[arg(long, env = "TRAFFIC_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address, overrides the config file.
    #[arg(long, env = "TRAFFIC_API_ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = EngineConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
        config.validate()?;
    }
    log::info!(
        "traffic_engine {} starting: camera={} model={} history={}",
        env!("CARGO_PKG_VERSION"),
        traffic_engine::ingest::redact_url(&config.camera.url),
        config.detection.model_path,
        config.history_path.display()
    );

    let handle = Engine::new(config)?.spawn()?;
    log::info!("serving on http://{}/video_feed", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("traffic_engine waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping engine...");
    handle.stop()?;

    Ok(())
}
