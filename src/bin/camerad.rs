//! camerad - camera frame relay daemon
//!
//! Starts the capture source, then serves the latest frames to
//! persistent-protocol clients and HTTP viewers until Ctrl-C.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use picam_relay::{source_from_config, CameraServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay camera MJPEG frames to protocol and HTTP clients")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "PICAM_CONFIG")]
    config: Option<PathBuf>,

    /// Persistent-protocol listen address (overrides config).
    #[arg(long)]
    protocol_addr: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    http_addr: Option<String>,

    /// Capture program, `http(s)://` MJPEG url or `stub://` test source (overrides config).
    #[arg(long)]
    source: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => ServerConfig::load_from(path)?,
        None => ServerConfig::load()?,
    };
    if let Some(addr) = args.protocol_addr {
        cfg.protocol_addr = addr;
    }
    if let Some(addr) = args.http_addr {
        cfg.http_addr = addr;
    }
    if let Some(source) = args.source {
        cfg.source.program = source;
    }
    cfg.validate()?;

    log::info!(
        "camerad {} starting: source {} ({}x{} @ {} fps), stream quality {}, capture quality {}",
        env!("CARGO_PKG_VERSION"),
        cfg.source.program,
        cfg.source.width,
        cfg.source.height,
        cfg.source.framerate,
        cfg.jpeg.stream_quality,
        cfg.jpeg.capture_quality
    );

    let source = source_from_config(&cfg)?;
    let handle = CameraServer::new(cfg, source).spawn()?;
    log::info!(
        "camerad running: protocol clients on {}, viewer on http://{}/",
        handle.protocol_addr,
        handle.http_addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping camerad...");
    let stats = handle.ingest_stats();
    log::info!(
        "ingest totals: {} frames published, {} decode failures, {} source restarts",
        stats.frames_published,
        stats.decode_failures,
        stats.restarts
    );
    handle.stop()?;
    Ok(())
}
