//! Server lifecycle: listeners, accept loops and shutdown.
//!
//! `CameraServer::spawn` binds both listeners, starts ingestion and then the
//! accept loops, so a client can never connect to a server without a source.
//! `ServerHandle::stop` raises the shutdown flag and joins every thread the
//! server started.

pub mod connection;
pub mod http;

use anyhow::{anyhow, Context, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::context::{IngestSnapshot, ServerContext};
use crate::ingest::{IngestHandle, Ingestor, VideoSource};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

type ClientHandler = fn(TcpStream, Arc<ServerContext>);

/// Join handles of connection threads, pruned as connections finish.
type ConnectionThreads = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub struct CameraServer {
    config: ServerConfig,
    source: Box<dyn VideoSource>,
}

pub struct ServerHandle {
    pub protocol_addr: SocketAddr,
    pub http_addr: SocketAddr,
    context: Arc<ServerContext>,
    accept_loops: Vec<JoinHandle<()>>,
    ingest: Option<IngestHandle>,
    connections: ConnectionThreads,
}

impl CameraServer {
    pub fn new(config: ServerConfig, source: Box<dyn VideoSource>) -> Self {
        Self { config, source }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        self.config.validate()?;
        let protocol_listener = bind(&self.config.protocol_addr, "protocol")?;
        let http_listener = bind(&self.config.http_addr, "http")?;
        let protocol_addr = protocol_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let context = ServerContext::new(self.config);
        let ingest = Ingestor::new(context.clone(), self.source).spawn()?;

        let mut handle = ServerHandle {
            protocol_addr,
            http_addr,
            context: context.clone(),
            accept_loops: Vec::new(),
            ingest: Some(ingest),
            connections: Arc::new(Mutex::new(Vec::new())),
        };
        for (name, listener, handler) in [
            ("protocol", protocol_listener, connection::handle_client as ClientHandler),
            ("http", http_listener, http::handle_client as ClientHandler),
        ] {
            let ctx = context.clone();
            let connections = handle.connections.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-accept", name))
                .spawn(move || run_accept_loop(name, listener, ctx, connections, handler));
            match spawned {
                Ok(join) => handle.accept_loops.push(join),
                Err(err) => {
                    if let Err(stop_err) = handle.stop() {
                        log::warn!("cleanup after failed start: {:#}", stop_err);
                    }
                    return Err(err).with_context(|| format!("spawn {} accept loop", name));
                }
            }
        }

        log::info!(
            "camera server listening: protocol on {}, http on {}",
            protocol_addr,
            http_addr
        );
        Ok(handle)
    }
}

impl ServerHandle {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn ingest_stats(&self) -> IngestSnapshot {
        self.context.ingest.snapshot()
    }

    pub fn active_clients(&self) -> usize {
        self.context.active_clients()
    }

    /// Signal shutdown and wait for every server thread to exit.
    pub fn stop(mut self) -> Result<()> {
        log::info!("camera server shutting down");
        self.context.request_shutdown();

        let mut panicked = 0usize;
        for join in self.accept_loops.drain(..) {
            if join.join().is_err() {
                panicked += 1;
            }
        }
        let ingest_result = match self.ingest.take() {
            Some(ingest) => ingest.join(),
            None => Ok(()),
        };
        let connections: Vec<JoinHandle<()>> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for join in connections {
            if join.join().is_err() {
                panicked += 1;
            }
        }
        ingest_result?;
        if panicked > 0 {
            return Err(anyhow!("{} server thread(s) panicked", panicked));
        }
        log::info!("camera server stopped");
        Ok(())
    }
}

fn bind(addr: &str, name: &str) -> Result<TcpListener> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("bind {} listener on {}", name, addr))?;
    listener
        .set_nonblocking(true)
        .with_context(|| format!("set {} listener non-blocking", name))?;
    Ok(listener)
}

fn run_accept_loop(
    name: &'static str,
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    connections: ConnectionThreads,
    handler: ClientHandler,
) {
    while !ctx.is_shutting_down() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let client_ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("{}-{}", name, peer))
                    .spawn(move || handler(stream, client_ctx));
                match spawned {
                    Ok(join) => {
                        let mut threads =
                            connections.lock().unwrap_or_else(PoisonError::into_inner);
                        threads.retain(|t| !t.is_finished());
                        threads.push(join);
                    }
                    Err(err) => log::error!("{} client {} rejected: {}", name, peer, err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("{} accept failed: {}", name, err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    log::debug!("{} accept loop stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SyntheticSource;
    use std::io::{Read, Write};

    fn loopback_config() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.protocol_addr = "127.0.0.1:0".into();
        cfg.http_addr = "127.0.0.1:0".into();
        cfg.timing.poll_interval = Duration::from_millis(20);
        cfg
    }

    #[test]
    fn serves_health_and_stops() {
        let source = SyntheticSource::new(32, 24, 50, 80);
        let handle = CameraServer::new(loopback_config(), Box::new(source))
            .spawn()
            .unwrap();

        let mut stream = TcpStream::connect(handle.http_addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["status"], "ok");

        handle.stop().unwrap();
    }

    #[test]
    fn bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = loopback_config();
        cfg.http_addr = taken.local_addr().unwrap().to_string();
        let source = SyntheticSource::new(8, 8, 10, 80);
        let err = CameraServer::new(cfg, Box::new(source)).spawn().err().unwrap();
        assert!(format!("{:#}", err).contains("bind http listener"));
    }
}
