//! Persistent-protocol client session.
//!
//! Every accepted socket gets two threads:
//! - the session thread (this module's `handle_client`), which streams
//!   `VIDEO_FRAME` messages and answers commands;
//! - a reader thread, which frames inbound bytes with a `CommandDecoder` and
//!   forwards complete headers over a channel.
//!
//! Any send failure closes the connection. Nothing a client does affects other
//! clients or the server.

use anyhow::{Context, Result};
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

use crate::context::ServerContext;
use crate::frame::Frame;
use crate::imaging::flip_and_encode;
use crate::protocol::{
    write_capture_response, write_command, write_video_frame, CommandDecoder, MessageHeader,
    MessageType,
};

const READ_BUFFER: usize = 1024;

/// Serve one protocol client until it disconnects, a send fails, or the
/// server shuts down.
pub fn handle_client(stream: TcpStream, ctx: Arc<ServerContext>) {
    let _guard = ctx.client_guard();
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(err) => {
            log::warn!("protocol client dropped before setup: {}", err);
            return;
        }
    };
    log::info!(
        "protocol client connected: {} (active clients: {})",
        peer,
        ctx.active_clients()
    );
    match Session::open(stream, peer, ctx.clone()) {
        Ok(mut session) => {
            match session.run() {
                Ok(()) => log::info!("protocol client {} disconnected", peer),
                Err(err) => log::info!("protocol client {} closed: {:#}", peer, err),
            }
            session.close();
        }
        Err(err) => log::warn!("protocol client {} setup failed: {:#}", peer, err),
    }
}

struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    commands: Receiver<MessageHeader>,
    reader_done: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
    next_message_id: u32,
    seen_version: u64,
}

impl Session {
    fn open(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Result<Self> {
        stream.set_nonblocking(false).context("set blocking mode")?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        let write_timeout = ctx.config.timing.write_timeout;
        if !write_timeout.is_zero() {
            stream
                .set_write_timeout(Some(write_timeout))
                .context("set write timeout")?;
        }

        let inbound = stream.try_clone().context("clone client socket")?;
        inbound
            .set_read_timeout(Some(ctx.poll_interval()))
            .context("set read timeout")?;
        let (tx, commands) = mpsc::channel();
        let reader_done = Arc::new(AtomicBool::new(false));
        let reader = {
            let done = reader_done.clone();
            let ctx = ctx.clone();
            std::thread::Builder::new()
                .name(format!("protocol-read-{}", peer))
                .spawn(move || read_commands(inbound, tx, &ctx, &done))
                .context("spawn command reader")?
        };

        Ok(Self {
            stream,
            peer,
            ctx,
            commands,
            reader_done,
            reader: Some(reader),
            next_message_id: 0,
            seen_version: 0,
        })
    }

    /// `Ok` when the peer closed its side or the server is shutting down.
    fn run(&mut self) -> Result<()> {
        let poll = self.ctx.poll_interval();
        while !self.ctx.is_shutting_down() {
            loop {
                match self.commands.try_recv() {
                    Ok(header) => self.handle_command(header)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            if let Some((version, frame)) = self.ctx.frames.wait_newer(self.seen_version, poll) {
                self.seen_version = version;
                self.send_video_frame(&frame)?;
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, header: MessageHeader) -> Result<()> {
        match header.message_type {
            MessageType::CaptureCommand => self.send_capture(header.message_id),
            MessageType::Heartbeat => {
                write_command(&mut self.stream, header.message_id, MessageType::Heartbeat)
            }
            other => {
                log::debug!(
                    "ignoring {:?} message {} from {}",
                    other,
                    header.message_id,
                    self.peer
                );
                Ok(())
            }
        }
    }

    fn send_capture(&mut self, capture_id: u32) -> Result<()> {
        let Some(frame) = self.ctx.frames.latest() else {
            log::warn!(
                "capture {} requested by {} but no frame is available",
                capture_id,
                self.peer
            );
            return Ok(());
        };
        let jpeg = match flip_and_encode(frame.image(), self.ctx.config.jpeg.capture_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!("capture {} encode failed: {:#}", capture_id, err);
                return Ok(());
            }
        };
        let message_id = self.next_id();
        let response = write_capture_response(&mut self.stream, message_id, capture_id, &jpeg)?;
        log::info!(
            "capture {} sent to {}: {} ({} bytes)",
            capture_id,
            self.peer,
            response.filename(),
            response.image_size
        );
        Ok(())
    }

    fn send_video_frame(&mut self, frame: &Frame) -> Result<()> {
        let jpeg = match flip_and_encode(frame.image(), self.ctx.config.jpeg.stream_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!("frame {} encode failed: {:#}", frame.sequence(), err);
                return Ok(());
            }
        };
        let message_id = self.next_id();
        write_video_frame(&mut self.stream, message_id, &jpeg)?;
        log::trace!(
            "frame {} sent to {} as message {}",
            frame.sequence(),
            self.peer,
            message_id
        );
        Ok(())
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn close(&mut self) {
        self.reader_done.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::warn!("command reader for {} panicked", self.peer);
            }
        }
    }
}

/// Reader thread body. Dropping `tx` on exit tells the session the peer is gone.
fn read_commands(
    mut inbound: TcpStream,
    tx: Sender<MessageHeader>,
    ctx: &ServerContext,
    done: &AtomicBool,
) {
    let mut decoder = CommandDecoder::new();
    let mut buf = [0u8; READ_BUFFER];
    while !done.load(Ordering::SeqCst) && !ctx.is_shutting_down() {
        match inbound.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for header in decoder.feed(&buf[..n]) {
                    log::debug!(
                        "received {:?} message {}",
                        header.message_type,
                        header.message_id
                    );
                    if tx.send(header).is_err() {
                        return;
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                log::debug!("command read failed: {}", err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::imaging::{decode_jpeg, encode_jpeg, test_pattern};
    use crate::protocol::{read_message, CaptureResponse, CAPTURE_RESPONSE_LEN};
    use std::net::TcpListener;
    use std::time::Duration;

    fn session_pair(ctx: Arc<ServerContext>) -> (TcpStream, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle_client(stream, ctx);
        });
        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (client, server)
    }

    fn test_context() -> Arc<ServerContext> {
        let mut cfg = ServerConfig::default();
        cfg.timing.poll_interval = Duration::from_millis(20);
        ServerContext::new(cfg)
    }

    fn publish(ctx: &ServerContext, sequence: u64) {
        let image = test_pattern(24, 16, sequence);
        let jpeg = encode_jpeg(&image, 80).unwrap();
        ctx.frames.push(Frame::new(sequence, jpeg, image));
    }

    #[test]
    fn streams_frames_with_increasing_ids() {
        let ctx = test_context();
        publish(&ctx, 1);
        let (mut client, server) = session_pair(ctx.clone());

        let (first, payload) = read_message(&mut client).unwrap();
        assert_eq!(first.message_type, MessageType::VideoFrame);
        assert_eq!(first.message_id, 0);
        assert_eq!(first.payload_length as usize, payload.len());
        assert!(decode_jpeg(&payload).is_ok());

        publish(&ctx, 2);
        let (second, _) = read_message(&mut client).unwrap();
        assert_eq!(second.message_id, 1);

        drop(client);
        ctx.request_shutdown();
        server.join().unwrap();
    }

    #[test]
    fn capture_and_heartbeat_are_answered() {
        let ctx = test_context();
        publish(&ctx, 1);
        let (mut client, server) = session_pair(ctx.clone());

        let (video, _) = read_message(&mut client).unwrap();
        assert_eq!(video.message_type, MessageType::VideoFrame);

        write_command(&mut client, 7, MessageType::Heartbeat).unwrap();
        write_command(&mut client, 42, MessageType::CaptureCommand).unwrap();

        let (heartbeat, payload) = read_message(&mut client).unwrap();
        assert_eq!(heartbeat.message_type, MessageType::Heartbeat);
        assert_eq!(heartbeat.message_id, 7);
        assert!(payload.is_empty());

        let (capture, payload) = read_message(&mut client).unwrap();
        assert_eq!(capture.message_type, MessageType::CaptureResponse);
        assert_eq!(capture.message_id, 1);
        let response = CaptureResponse::decode(&payload).unwrap();
        assert_eq!(response.capture_id, 42);
        assert_eq!(response.filename(), "capture_42.jpg");
        assert_eq!(
            capture.payload_length as usize,
            CAPTURE_RESPONSE_LEN + response.image_size as usize
        );
        assert!(decode_jpeg(&payload[CAPTURE_RESPONSE_LEN..]).is_ok());

        drop(client);
        ctx.request_shutdown();
        server.join().unwrap();
    }

    /// 32x32 black frame with a red top-left quadrant.
    fn publish_corner_marked(ctx: &ServerContext, sequence: u64) {
        let mut pixels = image::RgbImage::new(32, 32);
        for y in 0..16 {
            for x in 0..16 {
                pixels.put_pixel(x, y, image::Rgb([255, 0, 0]));
            }
        }
        let image = image::DynamicImage::ImageRgb8(pixels);
        let jpeg = encode_jpeg(&image, 90).unwrap();
        ctx.frames.push(Frame::new(sequence, jpeg, image));
    }

    fn red_at(jpeg: &[u8], x: u32, y: u32) -> bool {
        let image = decode_jpeg(jpeg).unwrap().to_rgb8();
        let [r, g, b] = image.get_pixel(x, y).0;
        r > 160 && g < 90 && b < 90
    }

    #[test]
    fn video_frames_and_captures_are_rotated_half_turn() {
        let ctx = test_context();
        publish_corner_marked(&ctx, 1);
        let (mut client, server) = session_pair(ctx.clone());

        let (video, payload) = read_message(&mut client).unwrap();
        assert_eq!(video.message_type, MessageType::VideoFrame);
        assert!(red_at(&payload, 27, 27));
        assert!(!red_at(&payload, 4, 4));

        write_command(&mut client, 5, MessageType::CaptureCommand).unwrap();
        let (capture, payload) = read_message(&mut client).unwrap();
        assert_eq!(capture.message_type, MessageType::CaptureResponse);
        let photo = &payload[CAPTURE_RESPONSE_LEN..];
        assert!(red_at(photo, 27, 27));
        assert!(!red_at(photo, 4, 4));

        drop(client);
        ctx.request_shutdown();
        server.join().unwrap();
    }

    #[test]
    fn capture_without_frame_is_unanswered_and_session_continues() {
        let ctx = test_context();
        let (mut client, server) = session_pair(ctx.clone());

        write_command(&mut client, 9, MessageType::CaptureCommand).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        assert!(read_message(&mut client).is_err());

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        publish(&ctx, 1);
        let (video, payload) = read_message(&mut client).unwrap();
        assert_eq!(video.message_type, MessageType::VideoFrame);
        assert_eq!(video.message_id, 0);
        assert!(decode_jpeg(&payload).is_ok());
        assert_eq!(ctx.active_clients(), 1);

        drop(client);
        ctx.request_shutdown();
        server.join().unwrap();
    }

    #[test]
    fn session_ends_when_peer_disconnects() {
        let ctx = test_context();
        let (client, server) = session_pair(ctx.clone());
        drop(client);
        server.join().unwrap();
        assert_eq!(ctx.active_clients(), 0);
    }
}
