//! Contract with the terminal transport collaborator.
//!
//! A transport knows how to negotiate and open a raw terminal channel (SSH
//! `pty-req`, Telnet `TTYPE`, a local pseudo-terminal, ...). The bridge only
//! ever asks it for channels; handshakes, authentication and control-sequence
//! handling stay on the transport side.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Terminal type requested for every channel.
///
/// vt100 is what Telnet and SSH clients advertise by default. A "dumb"
/// terminal breaks prompt detection in the output readers downstream.
pub const TERMINAL_TYPE: &str = "vt100";

/// Errors reported by a terminal transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Channel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Parameters for opening a terminal channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub terminal_type: String,
    /// Canonical character-set name (e.g. "UTF-8").
    pub encoding: String,
    /// `KEY=VALUE` entries, in caller order.
    pub environment: Vec<String>,
    /// `None` means "whatever the transport considers the default".
    pub working_directory: Option<String>,
}

/// An open, raw terminal channel.
#[async_trait]
pub trait TerminalChannel: Send {
    /// The terminal type that was negotiated for this channel.
    fn terminal_type(&self) -> &str;

    /// Send bytes to the remote side.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read available bytes. `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Change the window size. Transports without a notion of size ignore it.
    async fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), TransportError> {
        Ok(())
    }

    /// Whether the channel is still usable.
    fn is_active(&self) -> bool;

    /// Tear the channel down. Calling it on a closed channel is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A service able to open terminal channels.
#[async_trait]
pub trait TerminalTransport: Send + Sync {
    /// Short identifier used in logs (e.g. "ssh", "telnet", "pty").
    fn name(&self) -> &str;

    /// Open a new channel.
    ///
    /// Implementations should watch `cancel` and return
    /// [`TransportError::Cancelled`] once it fires, closing anything they had
    /// already set up.
    async fn open_channel(
        &self,
        request: ChannelRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn TerminalChannel>, TransportError>;
}
