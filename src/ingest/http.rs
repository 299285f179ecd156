//! Upstream HTTP MJPEG source.
//!
//! Relays another camera's `multipart/x-mixed-replace` stream (or any HTTP body
//! made of concatenated JPEGs). Multipart boundaries and part headers are left
//! in the byte stream; the reassembler skips everything outside SOI/EOI.

use anyhow::{anyhow, Context, Result};
use std::io::{self, Read};
use std::time::Duration;
use url::Url;

use super::VideoSource;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpSource {
    url: Url,
    agent: ureq::Agent,
    body: Option<Box<dyn Read + Send + Sync + 'static>>,
}

impl HttpSource {
    pub fn new(url: &str, read_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).context("parse source url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported source scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(read_timeout)
            .build();
        Ok(Self {
            url,
            agent,
            body: None,
        })
    }
}

impl VideoSource for HttpSource {
    fn start(&mut self) -> Result<()> {
        self.stop();
        let response = self
            .agent
            .get(self.url.as_str())
            .call()
            .with_context(|| format!("connect to {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_string();
        if !content_type.to_lowercase().contains("multipart") {
            log::warn!(
                "{} returned '{}' rather than a multipart stream",
                self.url,
                content_type
            );
        }
        log::info!("connected to {} ({})", self.url, content_type);
        self.body = Some(response.into_reader());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.body.as_mut() {
            Some(body) => body.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "http source not started",
            )),
        }
    }

    fn stop(&mut self) {
        self.body = None;
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}
