//! Local pseudo-terminal transport for termshell.
//!
//! [`PtyTransport`] opens terminal channels by starting a login shell in a
//! PTY on this machine, so a [`termshell_core::ShellBridge`] can run on it
//! exactly as it would over SSH or Telnet.

pub mod channel;
pub mod shell;
pub mod transport;

pub use channel::{PtyChannel, PtyError};
pub use shell::{default_shell, detect_available_shells, resolve_shell, ShellInfo};
pub use transport::PtyTransport;
