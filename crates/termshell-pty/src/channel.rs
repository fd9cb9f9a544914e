//! A terminal channel backed by a local pseudo-terminal.
//!
//! The PTY master is split at spawn time: a dedicated thread drains the
//! reader into a bounded queue, and the writer stays with the channel. Reads
//! therefore never block the runtime and can be abandoned without losing
//! output.

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize,
};
use std::io::{Read, Write};
use std::path::Path;
use termshell_core::{ChannelRequest, TerminalChannel, TransportError};
use tokio::sync::mpsc;

/// Chunks buffered between the reader thread and the channel.
const QUEUE_DEPTH: usize = 64;
const READ_CHUNK: usize = 4096;

/// Errors that can occur while setting up a PTY.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to create PTY: {0}")]
    Creation(String),

    #[error("Failed to spawn shell: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No shell available")]
    NoShell,
}

impl From<PtyError> for TransportError {
    fn from(err: PtyError) -> Self {
        match err {
            PtyError::Io(e) => TransportError::Io(e),
            other => TransportError::Other(other.to_string()),
        }
    }
}

pub struct PtyChannel {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    output: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    terminal_type: String,
    closed: bool,
}

impl PtyChannel {
    /// Open a PTY and start `shell` in it. Blocking; run it off the runtime.
    pub fn spawn(shell: &Path, request: &ChannelRequest, size: PtySize) -> Result<Self, PtyError> {
        let PtyPair { master, slave } = native_pty_system()
            .openpty(size)
            .map_err(|e| PtyError::Creation(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", &request.terminal_type);
        for entry in &request.environment {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = request.working_directory.as_deref() {
            if Path::new(dir).is_dir() {
                cmd.cwd(dir);
            } else {
                tracing::debug!(dir = dir, "Working directory missing, using the shell default");
            }
        }

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // Keeping the slave open would hide end-of-stream once the shell exits.
        drop(slave);

        let reader = master
            .try_clone_reader()
            .map_err(|e| PtyError::Creation(e.to_string()))?;
        let writer = master
            .take_writer()
            .map_err(|e| PtyError::Creation(e.to_string()))?;

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("termshell-pty-reader".into())
            .spawn(move || pump(reader, tx))?;

        tracing::debug!(
            shell = %shell.display(),
            cols = size.cols,
            rows = size.rows,
            "PTY channel opened"
        );

        Ok(Self {
            master,
            writer,
            child: Mutex::new(child),
            output: rx,
            pending: Vec::new(),
            terminal_type: request.terminal_type.clone(),
            closed: false,
        })
    }

    fn kill(&mut self) -> std::io::Result<()> {
        let mut child = self.child.lock();
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        Ok(())
    }
}

/// Forward PTY output until end of stream or until the channel is gone.
fn pump(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the last slave handle closes.
            Err(e) => {
                tracing::debug!(error = %e, "PTY reader stopped");
                break;
            }
        }
    }
}

#[async_trait]
impl TerminalChannel for PtyChannel {
    fn terminal_type(&self) -> &str {
        &self.terminal_type
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.pending.is_empty() {
            match self.output.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TransportError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TransportError::Other(e.to_string()))?;
        tracing::debug!(cols = cols, rows = rows, "PTY resized");
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.closed && matches!(self.child.lock().try_wait(), Ok(None))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.output.close();
        self.kill()?;
        Ok(())
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.kill() {
                tracing::warn!(error = %e, "Failed to stop shell of dropped PTY channel");
            }
        }
    }
}

impl std::fmt::Debug for PtyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyChannel")
            .field("terminal_type", &self.terminal_type)
            .field("closed", &self.closed)
            .finish()
    }
}
