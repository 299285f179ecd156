//! Capture subprocess source.
//!
//! Spawns a camera tool that writes MJPEG to stdout (`rpicam-vid --codec mjpeg
//! --output -`). A pump thread moves stdout chunks into a bounded channel so
//! `read` can wait with a timeout instead of blocking on the pipe.

use anyhow::{anyhow, Context, Result};
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use super::VideoSource;

/// Chunks buffered between the pump thread and the reader.
const PUMP_DEPTH: usize = 64;

pub struct CommandSource {
    program: String,
    args: Vec<String>,
    chunk_size: usize,
    read_timeout: Duration,
    running: Option<RunningCommand>,
}

struct RunningCommand {
    child: Child,
    chunks: Receiver<io::Result<Vec<u8>>>,
    pump: JoinHandle<()>,
    /// Unread tail of the last chunk.
    pending: Vec<u8>,
    pending_pos: usize,
}

impl CommandSource {
    pub fn new(program: String, args: Vec<String>, chunk_size: usize, read_timeout: Duration) -> Self {
        Self {
            program,
            args,
            chunk_size: chunk_size.max(2),
            read_timeout,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl VideoSource for CommandSource {
    fn start(&mut self) -> Result<()> {
        self.stop();
        log::info!("spawning {}", self.describe());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn {}", self.program))?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("{} has no stdout pipe", self.program));
            }
        };
        let (tx, chunks) = mpsc::sync_channel(PUMP_DEPTH);
        let chunk_size = self.chunk_size;
        let pump = std::thread::Builder::new()
            .name("source-pump".into())
            .spawn(move || pump_stdout(stdout, tx, chunk_size))
            .context("spawn stdout pump thread")?;
        self.running = Some(RunningCommand {
            child,
            chunks,
            pump,
            pending: Vec::new(),
            pending_pos: 0,
        });
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "source not started"))?;

        if running.pending_pos >= running.pending.len() {
            match running.chunks.recv_timeout(self.read_timeout) {
                Ok(Ok(chunk)) if chunk.is_empty() => return Ok(0),
                Ok(Ok(chunk)) => {
                    running.pending = chunk;
                    running.pending_pos = 0;
                }
                Ok(Err(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no data from capture process",
                    ))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let available = &running.pending[running.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        running.pending_pos += n;
        Ok(n)
    }

    fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let RunningCommand {
            mut child,
            chunks,
            pump,
            ..
        } = running;
        if let Err(err) = child.kill() {
            log::debug!("kill {}: {}", self.program, err);
        }
        // Dropping the receiver unblocks a pump stuck on a full channel.
        drop(chunks);
        if pump.join().is_err() {
            log::warn!("stdout pump thread for {} panicked", self.program);
        }
        match child.wait() {
            Ok(status) => log::info!("{} exited ({})", self.program, status),
            Err(err) => log::warn!("failed to reap {}: {}", self.program, err),
        }
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl Drop for CommandSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward stdout until EOF or error. EOF is signalled with an empty chunk.
fn pump_stdout(mut stdout: ChildStdout, tx: SyncSender<io::Result<Vec<u8>>>, chunk_size: usize) {
    loop {
        let mut chunk = vec![0u8; chunk_size];
        match stdout.read(&mut chunk) {
            Ok(0) => {
                let _ = tx.send(Ok(Vec::new()));
                return;
            }
            Ok(n) => {
                chunk.truncate(n);
                if tx.send(Ok(chunk)).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn read_all(source: &mut CommandSource) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            match source.read(&mut buf) {
                Ok(0) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
                Err(err) => panic!("read failed: {}", err),
            }
        }
    }

    #[test]
    fn reads_process_stdout_until_exit() {
        let mut source = CommandSource::new(
            "printf".into(),
            vec!["hello camera".into()],
            4,
            Duration::from_millis(100),
        );
        source.start().unwrap();
        assert_eq!(read_all(&mut source), b"hello camera");
        source.stop();
        assert!(!source.is_running());
    }

    #[test]
    fn silent_process_times_out_then_stops() {
        let mut source =
            CommandSource::new("sleep".into(), vec!["30".into()], 16, Duration::from_millis(20));
        source.start().unwrap();
        let mut buf = [0u8; 16];
        let err = source.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        source.stop();
    }

    #[test]
    fn missing_program_fails_to_start() {
        let mut source = CommandSource::new(
            "/nonexistent/camera-tool".into(),
            vec![],
            16,
            Duration::from_millis(20),
        );
        assert!(source.start().is_err());
    }

    #[test]
    fn read_before_start_is_an_error() {
        let mut source = CommandSource::new("true".into(), vec![], 16, Duration::from_millis(20));
        let mut buf = [0u8; 4];
        assert_eq!(
            source.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
