use async_trait::async_trait;
use portable_pty::PtySize;
use termshell_core::config::PtyConfig;
use termshell_core::{
    CancellationToken, ChannelRequest, TerminalChannel, TerminalTransport, TransportError,
};

use crate::channel::{PtyChannel, PtyError};
use crate::shell::{resolve_shell, ShellInfo};

/// Opens terminal channels as local shells running in a PTY.
#[derive(Debug, Clone)]
pub struct PtyTransport {
    shell: ShellInfo,
    cols: u16,
    rows: u16,
}

impl PtyTransport {
    pub fn new(shell: ShellInfo, cols: u16, rows: u16) -> Self {
        Self { shell, cols, rows }
    }

    /// Build a transport from the `[pty]` config section, detecting the shell
    /// if none is configured.
    pub fn from_config(config: &PtyConfig) -> Result<Self, PtyError> {
        let shell = resolve_shell(config.shell.as_deref()).ok_or(PtyError::NoShell)?;
        Ok(Self::new(shell, config.cols, config.rows))
    }

    pub fn shell(&self) -> &ShellInfo {
        &self.shell
    }

    fn size(&self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[async_trait]
impl TerminalTransport for PtyTransport {
    fn name(&self) -> &str {
        "pty"
    }

    async fn open_channel(
        &self,
        request: ChannelRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn TerminalChannel>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let path = self.shell.path.clone();
        let size = self.size();
        // Spawning forks and execs; keep it off the async workers. If the
        // caller gives up first, the finished channel is dropped, and dropping
        // it stops the shell.
        let spawn = tokio::task::spawn_blocking(move || PtyChannel::spawn(&path, &request, size));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            joined = spawn => {
                let channel = joined
                    .map_err(|e| TransportError::Other(format!("PTY spawn task failed: {e}")))??;
                let channel: Box<dyn TerminalChannel> = Box::new(channel);
                Ok(channel)
            }
        }
    }
}
