//! Shell service on top of terminal transports.
//!
//! A [`ShellBridge`] takes any [`TerminalTransport`] (SSH, Telnet, a local
//! PTY, ...) and exposes it as a [`ShellService`]: launch a shell or run a
//! command, then talk to it through a [`ShellHandle`]. The
//! [`CapabilityRegistry`] lets holders of a bridge recover alternate views of
//! it, such as the underlying transport.

pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{ShellBridge, ShellService};
pub use capability::{
    Capability, CapabilityKind, CapabilityProvider, CapabilityRegistry, ProviderId, ProviderScope,
};
pub use config::AppConfig;
pub use error::{Result, ShellError};
pub use session::{LaunchSpec, SessionState, ShellHandle, TerminalSession, SHELL_INVOCATION};
pub use transport::{ChannelRequest, TerminalChannel, TerminalTransport, TransportError, TERMINAL_TYPE};
pub use tokio_util::sync::CancellationToken;
