//! Camera frame relay.
//!
//! Reads an MJPEG byte stream from a camera source, cuts it into JPEG frames
//! and fans the newest frame out to any number of clients.
//!
//! # Architecture
//!
//! ```text
//! VideoSource -> FrameReassembler -> ingest queue -> decode -> latest-frame register
//!                                                                  |
//!                                  protocol clients (8888) <-------+-------> HTTP clients (8080)
//! ```
//!
//! Ingestion has exactly one producer; every client reads the register without
//! consuming it, so clients never compete for frames.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the bounded, versioned `FrameBuffer`
//! - `reassembly`: SOI/EOI frame reassembly over a byte stream
//! - `protocol`: persistent-socket wire format (big-endian headers, capture responses)
//! - `imaging`: JPEG decode/encode and the 180-degree flip
//! - `ingest`: video sources (camera subprocess, HTTP, synthetic) and the ingest threads
//! - `context`: shared server-lifetime state
//! - `server`: listeners, protocol sessions and HTTP endpoints
//! - `config`: file + environment configuration

pub mod config;
pub mod context;
pub mod frame;
pub mod imaging;
pub mod ingest;
pub mod protocol;
pub mod reassembly;
pub mod server;

pub use config::ServerConfig;
pub use context::{IngestSnapshot, ServerContext};
pub use frame::{Frame, FrameBuffer};
pub use ingest::{source_from_config, VideoSource};
pub use protocol::{CaptureResponse, MessageHeader, MessageType};
pub use reassembly::{FrameReassembler, JpegFrames};
pub use server::{CameraServer, ServerHandle};
