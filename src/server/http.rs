//! Browser-facing HTTP endpoints.
//!
//! - `GET /`: viewer page
//! - `GET /stream`: endless `multipart/x-mixed-replace` MJPEG stream
//! - `GET /capture`: single JPEG, waits up to `capture_wait` for a frame
//! - `GET /health`: JSON status
//!
//! Frames are served exactly as ingested; no flip or re-encode.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::ServerContext;

const MAX_REQUEST_BYTES: usize = 8192;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
pub const BOUNDARY: &str = "frame";

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Camera</title></head>
<body>
<h1>Live stream</h1>
<img src="/stream" alt="live stream">
<p><a href="/capture">Capture still</a></p>
</body>
</html>
"#;

pub fn handle_client(mut stream: TcpStream, ctx: Arc<ServerContext>) {
    let _guard = ctx.client_guard();
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(err) = serve(&mut stream, &ctx, &peer) {
        log::debug!("http client {} closed: {:#}", peer, err);
    }
}

fn serve(stream: &mut TcpStream, ctx: &ServerContext, peer: &str) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(ctx.poll_interval()))?;
    let write_timeout = ctx.config.timing.write_timeout;
    if !write_timeout.is_zero() {
        stream.set_write_timeout(Some(write_timeout))?;
    }

    let request = read_request(stream, ctx)?;
    log::debug!("http {} {} from {}", request.method, request.path, peer);
    if request.method != "GET" {
        return write_text_response(stream, 405, "method not allowed\n");
    }
    match request.path.as_str() {
        "/" | "/index.html" => {
            write_response(stream, 200, "text/html; charset=utf-8", INDEX_HTML.as_bytes())
        }
        "/stream" => stream_frames(stream, ctx, peer),
        "/capture" => capture(stream, ctx, peer),
        "/health" => health(stream, ctx),
        _ => write_text_response(stream, 404, "not found\n"),
    }
}

fn stream_frames(stream: &mut TcpStream, ctx: &ServerContext, peer: &str) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nTransfer-Encoding: chunked\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    log::info!("http stream opened for {}", peer);

    let poll = ctx.poll_interval();
    let mut seen = 0u64;
    let mut sent = 0u64;
    while !ctx.is_shutting_down() {
        let Some((version, frame)) = ctx.frames.wait_newer(seen, poll) else {
            continue;
        };
        seen = version;
        if let Err(err) = write_chunk(stream, &multipart_part(frame.jpeg())) {
            log::info!("http stream for {} ended after {} frames: {}", peer, sent, err);
            return Ok(());
        }
        sent += 1;
    }
    let _ = write_chunk(stream, &[]);
    log::info!("http stream for {} closed at shutdown", peer);
    Ok(())
}

fn capture(stream: &mut TcpStream, ctx: &ServerContext, peer: &str) -> Result<()> {
    let wait = ctx.config.timing.capture_wait;
    match ctx.frames.wait_latest(wait) {
        Some(frame) => {
            log::info!(
                "http capture for {}: frame {} ({} bytes)",
                peer,
                frame.sequence(),
                frame.jpeg().len()
            );
            write_response(stream, 200, "image/jpeg", frame.jpeg())
        }
        None => {
            log::warn!("http capture for {}: no frame within {:?}", peer, wait);
            write_text_response(
                stream,
                503,
                &format!("no camera frame available within {} ms\n", wait.as_millis()),
            )
        }
    }
}

fn health(stream: &mut TcpStream, ctx: &ServerContext) -> Result<()> {
    let ingest = ctx.ingest.snapshot();
    let latest = ctx.frames.latest();
    let body = serde_json::json!({
        "status": "ok",
        "latest_version": ctx.frames.version(),
        "has_frame": latest.is_some(),
        "latest_frame_age_ms": latest.map(|frame| frame.age().as_millis() as u64),
        "active_clients": ctx.active_clients(),
        "ingest": {
            "bytes_read": ingest.bytes_read,
            "frames_reassembled": ingest.frames_reassembled,
            "frames_published": ingest.frames_published,
            "decode_failures": ingest.decode_failures,
            "restarts": ingest.restarts,
        },
    });
    let payload = serde_json::to_vec(&body)?;
    write_response(stream, 200, "application/json", &payload)
}

/// One multipart part: boundary line, part headers, JPEG bytes, trailing CRLF.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Write one chunk of a chunked body. An empty `data` writes the final chunk.
fn write_chunk<W: Write>(out: &mut W, data: &[u8]) -> Result<()> {
    out.write_all(format!("{:X}\r\n", data.len()).as_bytes())?;
    out.write_all(data)?;
    out.write_all(b"\r\n")?;
    out.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

/// Read the request head. Read timeouts are retried until `REQUEST_TIMEOUT`
/// so shutdown is noticed within one poll interval.
fn read_request<R: Read>(stream: &mut R, ctx: &ServerContext) -> Result<HttpRequest> {
    let deadline = Instant::now() + REQUEST_TIMEOUT;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        if ctx.is_shutting_down() {
            return Err(anyhow!("server shutting down"));
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                data.extend_from_slice(&buf[..n]);
                if data.len() > MAX_REQUEST_BYTES {
                    return Err(anyhow!("request too large"));
                }
                if data.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if Instant::now() >= deadline {
                    return Err(anyhow!("request timed out"));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err).context("read request"),
        }
    }
    parse_request(&data)
}

fn parse_request(data: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(data);
    let request_line = text
        .split("\r\n")
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_text_response<W: Write>(stream: &mut W, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "text/plain; charset=utf-8", body.as_bytes())
}

fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
