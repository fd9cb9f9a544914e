//! Shell sessions running over a terminal channel.
//!
//! A [`TerminalSession`] owns exactly one [`TerminalChannel`] and presents it
//! through the [`ShellHandle`] operations: write input, read output, liveness
//! and termination. Prompt detection and control-sequence filtering belong to
//! whoever consumes the output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encoding_rs::{CoderResult, Decoder, Encoding};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Result, ShellError};
use crate::transport::{TerminalChannel, TransportError};

/// Command value meaning "just start an interactive shell".
pub const SHELL_INVOCATION: &str = ">";

/// What a session was asked to run, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub working_directory: Option<String>,
    pub command: String,
    pub environment: Vec<String>,
}

impl LaunchSpec {
    pub fn new(
        working_directory: Option<String>,
        command: impl Into<String>,
        environment: Vec<String>,
    ) -> Self {
        Self {
            working_directory,
            command: command.into(),
            environment,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.command.is_empty() || self.command == SHELL_INVOCATION
    }

    /// Lines typed into the shell right after the channel opens.
    fn bootstrap_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(dir) = self.working_directory.as_deref() {
            if !dir.is_empty() && dir != "." {
                lines.push(format!("cd {}", shell_quote(dir)));
            }
        }
        if !self.is_interactive() {
            lines.push(self.command.clone());
        }
        lines
    }
}

/// Quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Channel handed over, bootstrap not done yet.
    Pending,
    Active,
    Closed,
}

/// Operations available on a launched shell.
#[async_trait]
pub trait ShellHandle: Send + std::fmt::Debug {
    fn id(&self) -> Uuid;

    fn launch_spec(&self) -> &LaunchSpec;

    /// Canonical name of the encoding used for text I/O.
    fn encoding(&self) -> &'static str;

    fn state(&self) -> SessionState;

    /// True while the session is active and its channel is usable.
    fn is_alive(&self) -> bool;

    /// Encode `line`, append the line terminator and send it.
    async fn write_input(&mut self, line: &str) -> Result<()>;

    /// Send bytes unchanged.
    async fn write_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Read raw output. `Ok(0)` means the shell went away.
    async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Read and decode the next chunk of output. `None` at end of stream.
    async fn read_text(&mut self) -> Result<Option<String>>;

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Close the channel. Safe to call more than once.
    async fn terminate(&mut self) -> Result<()>;
}

pub struct TerminalSession {
    id: Uuid,
    opened_at: DateTime<Utc>,
    channel: Box<dyn TerminalChannel>,
    spec: LaunchSpec,
    state: SessionState,
    encoding: &'static Encoding,
    decoder: Decoder,
    line_terminator: String,
    read_buffer_size: usize,
}

impl TerminalSession {
    /// Wrap an open channel. The session starts out [`SessionState::Pending`].
    pub fn new(
        channel: Box<dyn TerminalChannel>,
        spec: LaunchSpec,
        encoding: &'static Encoding,
        config: &SessionConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            channel,
            spec,
            state: SessionState::Pending,
            encoding,
            decoder: encoding.new_decoder(),
            line_terminator: config.line_terminator.clone(),
            read_buffer_size: config.read_buffer_size.max(1),
        }
    }

    /// Bring the session up: change to the working directory and type the
    /// command, then mark the session active.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Pending {
            return Err(ShellError::SessionClosed);
        }
        if !self.channel.is_active() {
            return Err(ShellError::LaunchFailed(
                "channel closed before the session started".into(),
            ));
        }
        for line in self.spec.bootstrap_lines() {
            self.send_line(&line).await?;
        }
        self.state = SessionState::Active;
        tracing::info!(
            session = %self.id,
            terminal = self.channel.terminal_type(),
            command = %self.spec.command,
            opened_at = %self.opened_at,
            "Shell session started"
        );
        Ok(())
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Closed => Err(ShellError::SessionClosed),
            _ => Ok(()),
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut data = self.encode(line);
        data.extend_from_slice(&self.encode(&self.line_terminator));
        self.send(&data).await
    }

    fn encode(&self, text: &str) -> Vec<u8> {
        let (bytes, _, _) = self.encoding.encode(text);
        bytes.into_owned()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let result = self.channel.write(data).await;
        result.map_err(|e| self.fail(e))
    }

    /// Record a channel failure; a closed channel closes the session.
    fn fail(&mut self, err: TransportError) -> ShellError {
        if matches!(err, TransportError::Closed) {
            self.state = SessionState::Closed;
        }
        ShellError::from_io(err)
    }

    /// Decode one chunk, growing the output until the decoder has consumed
    /// all of `bytes`.
    fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let mut out = String::with_capacity(bytes.len() + 4);
        let mut input = bytes;
        loop {
            let (result, read, _) = self.decoder.decode_to_string(input, &mut out, last);
            input = &input[read..];
            match result {
                CoderResult::InputEmpty => return out,
                CoderResult::OutputFull => {
                    let needed = self
                        .decoder
                        .max_utf8_buffer_length(input.len())
                        .unwrap_or(input.len() * 3 + 4);
                    out.reserve(needed.max(4));
                }
            }
        }
    }
}

#[async_trait]
impl ShellHandle for TerminalSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn launch_spec(&self) -> &LaunchSpec {
        &self.spec
    }

    fn encoding(&self) -> &'static str {
        self.encoding.name()
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn is_alive(&self) -> bool {
        self.state == SessionState::Active && self.channel.is_active()
    }

    async fn write_input(&mut self, line: &str) -> Result<()> {
        self.ensure_open()?;
        self.send_line(line).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.send(data).await
    }

    async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let result = self.channel.read(buf).await;
        match result {
            Ok(0) => {
                tracing::debug!(session = %self.id, "End of output stream");
                self.state = SessionState::Closed;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn read_text(&mut self) -> Result<Option<String>> {
        let mut buf = vec![0u8; self.read_buffer_size];
        let n = self.read_output(&mut buf).await?;
        if n == 0 {
            let tail = self.decode(&[], true);
            return Ok((!tail.is_empty()).then_some(tail));
        }
        Ok(Some(self.decode(&buf[..n], false)))
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.ensure_open()?;
        let result = self.channel.resize(cols, rows).await;
        result.map_err(|e| self.fail(e))
    }

    async fn terminate(&mut self) -> Result<()> {
        let result = self.channel.close().await;
        match result {
            Ok(()) | Err(TransportError::Closed) => {
                if self.state != SessionState::Closed {
                    self.state = SessionState::Closed;
                    tracing::info!(
                        session = %self.id,
                        opened_at = %self.opened_at,
                        "Shell session terminated"
                    );
                }
                Ok(())
            }
            // The channel may still be up; stay open so the caller can retry.
            Err(e) => Err(ShellError::from_io(e)),
        }
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("command", &self.spec.command)
            .field("encoding", &self.encoding.name())
            .finish()
    }
}
