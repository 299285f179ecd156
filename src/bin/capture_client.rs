//! capture_client - request a still photo over the persistent protocol.
//!
//! Connects to camerad, optionally watches some streamed frames first, sends a
//! `CAPTURE_COMMAND` and writes the returned JPEG to disk.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use picam_relay::protocol::{read_message, write_command, CAPTURE_RESPONSE_LEN};
use picam_relay::{CaptureResponse, MessageType};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture a still photo from camerad")]
struct Args {
    /// camerad persistent-protocol address.
    #[arg(long, env = "PICAM_SERVER_ADDR", default_value = "127.0.0.1:8888")]
    addr: String,

    /// Message id of the capture command; the reply carries it as capture id.
    #[arg(long, default_value_t = 1)]
    message_id: u32,

    /// Streamed frames to receive before asking for the capture.
    #[arg(long, default_value_t = 0)]
    watch_frames: u32,

    /// Directory for the photo (named by the server).
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Explicit output path (overrides --out-dir and the server's filename).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let timeout = Duration::from_secs(args.timeout_secs.max(1));
    let deadline = Instant::now() + timeout;

    let mut stream =
        TcpStream::connect(&args.addr).with_context(|| format!("connect to {}", args.addr))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    log::info!("connected to {}", args.addr);

    let mut watched = 0u32;
    while watched < args.watch_frames {
        let (header, payload) = read_message(&mut stream)?;
        if header.message_type == MessageType::VideoFrame {
            watched += 1;
            log::info!(
                "frame {} received: {} bytes (message {})",
                watched,
                payload.len(),
                header.message_id
            );
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("timed out after {} frames", watched));
        }
    }

    write_command(&mut stream, args.message_id, MessageType::CaptureCommand)?;
    log::info!("capture {} requested", args.message_id);

    loop {
        if Instant::now() >= deadline {
            return Err(anyhow!("no capture response within {:?}", timeout));
        }
        let (header, payload) = read_message(&mut stream)?;
        if header.message_type != MessageType::CaptureResponse {
            continue;
        }
        let response = CaptureResponse::decode(&payload)?;
        if response.capture_id != args.message_id {
            log::warn!("ignoring response for capture {}", response.capture_id);
            continue;
        }
        let image = payload
            .get(CAPTURE_RESPONSE_LEN..CAPTURE_RESPONSE_LEN + response.image_size as usize)
            .ok_or_else(|| anyhow!("capture payload shorter than image_size"))?;
        let path = match &args.output {
            Some(path) => path.clone(),
            None => args.out_dir.join(sanitize_filename(&response.filename())),
        };
        std::fs::write(&path, image).with_context(|| format!("write {}", path.display()))?;
        log::info!("saved {} ({} bytes)", path.display(), image.len());
        return Ok(());
    }
}

/// Keep only the final path component of a server-supplied name.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        "capture.jpg".to_string()
    } else {
        base.to_string()
    }
}
