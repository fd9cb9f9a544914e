//! Shell service implemented on top of a terminal transport.

use async_trait::async_trait;
use encoding_rs::Encoding;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capability::{Capability, CapabilityKind, CapabilityRegistry};
use crate::config::{AppConfig, SessionConfig};
use crate::error::{Result, ShellError};
use crate::session::{LaunchSpec, ShellHandle, TerminalSession, SHELL_INVOCATION};
use crate::transport::{ChannelRequest, TerminalChannel, TerminalTransport, TransportError, TERMINAL_TYPE};

const NAME: &str = "Terminal Shell Service";
const DESCRIPTION: &str = "Runs shells and commands over a terminal service connection";

type OpenResult = std::result::Result<Box<dyn TerminalChannel>, TransportError>;

/// Something that can start shells and run commands.
#[async_trait]
pub trait ShellService: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Start an interactive shell. Same as [`ShellService::run_command`] with
    /// [`SHELL_INVOCATION`] as the command.
    async fn launch_shell(
        &self,
        working_directory: &str,
        encoding: &str,
        environment: &[String],
        cancel: CancellationToken,
    ) -> Result<Box<dyn ShellHandle>> {
        self.run_command(working_directory, SHELL_INVOCATION, encoding, environment, cancel)
            .await
    }

    /// Start a shell and run `command` in it.
    ///
    /// An empty `working_directory` leaves the choice to the service; an empty
    /// `encoding` selects the service default.
    async fn run_command(
        &self,
        working_directory: &str,
        command: &str,
        encoding: &str,
        environment: &[String],
        cancel: CancellationToken,
    ) -> Result<Box<dyn ShellHandle>>;
}

/// Adapts a [`TerminalTransport`] into a [`ShellService`].
///
/// The bridge keeps no per-launch state, so concurrent launches do not
/// interfere. It holds on to its transport for as long as it lives, which is
/// what lets [`ShellBridge::query_capability`] hand the transport back out.
pub struct ShellBridge {
    id: Uuid,
    transport: Arc<dyn TerminalTransport>,
    default_encoding: String,
    launch_timeout: Option<Duration>,
    cancel_grace: Duration,
    session: SessionConfig,
}

impl ShellBridge {
    pub fn new(transport: Arc<dyn TerminalTransport>) -> Self {
        Self::with_config(transport, &AppConfig::default())
    }

    pub fn with_config(transport: Arc<dyn TerminalTransport>, config: &AppConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            default_encoding: config.bridge.default_encoding.clone(),
            launch_timeout: config.bridge.launch_timeout(),
            cancel_grace: config.bridge.cancel_grace(),
            session: config.session.clone(),
        }
    }

    /// Override the deadline for opening a channel. `None` waits forever.
    pub fn with_launch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The transport this bridge was built on.
    pub fn transport(&self) -> Arc<dyn TerminalTransport> {
        Arc::clone(&self.transport)
    }

    /// View this bridge through another interface.
    ///
    /// Contributed providers in `registry` get the first word; otherwise the
    /// bridge answers transport-compatible kinds with its own transport.
    pub fn query_capability(
        &self,
        registry: &CapabilityRegistry,
        kind: &CapabilityKind,
    ) -> Result<Option<Capability>> {
        registry.query(self, kind)
    }

    /// Launch a session and return it with its concrete type.
    pub async fn open_session(
        &self,
        working_directory: &str,
        command: &str,
        encoding: &str,
        environment: &[String],
        cancel: CancellationToken,
    ) -> Result<TerminalSession> {
        let encoding = self.resolve_encoding(encoding)?;
        validate_environment(environment)?;

        let working_directory = (!working_directory.is_empty()).then(|| working_directory.to_string());
        let request = ChannelRequest {
            terminal_type: TERMINAL_TYPE.to_string(),
            encoding: encoding.name().to_string(),
            environment: environment.to_vec(),
            working_directory: working_directory.clone(),
        };

        debug!(
            bridge = %self.id,
            transport = self.transport.name(),
            command = command,
            encoding = encoding.name(),
            "Opening terminal channel"
        );
        let channel = self.open_channel(request, cancel).await?;

        let spec = LaunchSpec::new(working_directory, command, environment.to_vec());
        let mut session = TerminalSession::new(channel, spec, encoding, &self.session);
        if let Err(e) = session.start().await {
            if let Err(close_err) = session.terminate().await {
                warn!(error = %close_err, "Failed to close channel after aborted start");
            }
            return Err(match e {
                ShellError::LaunchFailed(_) => e,
                other => ShellError::LaunchFailed(other.to_string()),
            });
        }
        Ok(session)
    }

    fn resolve_encoding(&self, label: &str) -> Result<&'static Encoding> {
        if label.trim().is_empty() {
            return usable_encoding(&self.default_encoding).ok_or_else(|| {
                ShellError::Config(format!("unusable default encoding {:?}", self.default_encoding))
            });
        }
        usable_encoding(label).ok_or_else(|| ShellError::UnsupportedEncoding(label.to_string()))
    }

    /// Ask the transport for a channel, giving up on cancellation or deadline.
    ///
    /// Dropping the returned future also cancels the open.
    async fn open_channel(
        &self,
        request: ChannelRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn TerminalChannel>> {
        if cancel.is_cancelled() {
            return Err(ShellError::Cancelled);
        }

        let token = cancel.child_token();
        let guard = token.clone().drop_guard();
        let mut task = tokio::spawn(open_detached(
            Arc::clone(&self.transport),
            request,
            token.clone(),
            self.cancel_grace,
        ));

        let deadline = async {
            match self.launch_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(bridge = %self.id, "Launch cancelled by caller");
            }
            joined = &mut task => {
                guard.disarm();
                return match joined {
                    Ok(result) => result.map_err(ShellError::from_launch),
                    Err(e) => Err(ShellError::LaunchFailed(format!("transport task failed: {e}"))),
                };
            }
            _ = deadline => {
                warn!(bridge = %self.id, timeout = ?self.launch_timeout, "Launch timed out");
            }
        }

        token.cancel();
        self.reap(task).await;
        Err(ShellError::Cancelled)
    }

    /// Wait for a cancelled open to settle and close whatever it produced.
    async fn reap(&self, mut task: JoinHandle<OpenResult>) {
        // The task gives up on its own after the grace period; the extra
        // margin covers its cleanup.
        match tokio::time::timeout(self.cancel_grace * 2, &mut task).await {
            Ok(Ok(Ok(mut channel))) => {
                debug!(bridge = %self.id, "Closing channel opened after cancellation");
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "Failed to close channel after cancellation");
                }
            }
            Ok(Ok(Err(e))) => {
                debug!(error = %e, "Transport stopped after cancellation");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Transport task failed after cancellation");
            }
            Err(_) => {
                warn!(
                    bridge = %self.id,
                    grace = ?self.cancel_grace,
                    "Cancelled open did not settle, aborting it"
                );
                task.abort();
            }
        }
    }
}

#[async_trait]
impl ShellService for ShellBridge {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    async fn run_command(
        &self,
        working_directory: &str,
        command: &str,
        encoding: &str,
        environment: &[String],
        cancel: CancellationToken,
    ) -> Result<Box<dyn ShellHandle>> {
        let session = self
            .open_session(working_directory, command, encoding, environment, cancel)
            .await?;
        Ok(Box::new(session))
    }
}

impl std::fmt::Debug for ShellBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellBridge")
            .field("id", &self.id)
            .field("transport", &self.transport.name())
            .field("launch_timeout", &self.launch_timeout)
            .finish()
    }
}

/// Run one transport open on its own task.
///
/// The task outlives its caller when the caller goes away, so it finishes
/// its own cleanup: once `token` is cancelled the transport has `grace` to
/// return, and a channel that arrives after cancellation is closed here.
async fn open_detached(
    transport: Arc<dyn TerminalTransport>,
    request: ChannelRequest,
    token: CancellationToken,
    grace: Duration,
) -> OpenResult {
    let abandoned = async {
        token.cancelled().await;
        tokio::time::sleep(grace).await;
    };
    let result = tokio::select! {
        biased;
        result = transport.open_channel(request, token.clone()) => result,
        _ = abandoned => {
            warn!(transport = transport.name(), grace = ?grace, "Transport ignored cancellation, dropping open");
            return Err(TransportError::Cancelled);
        }
    };

    match result {
        Ok(mut channel) if token.is_cancelled() => {
            debug!(transport = transport.name(), "Closing channel opened after cancellation");
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close channel after cancellation");
            }
            Err(TransportError::Cancelled)
        }
        other => other,
    }
}

/// Look up `label`, accepting only encodings text can be written in.
///
/// The replacement encoding and UTF-16 decode but cannot encode, so a
/// session in them could not send its own input.
fn usable_encoding(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label_no_replacement(label.trim().as_bytes())
        .filter(|encoding| encoding.output_encoding() == *encoding)
}

/// Every entry must look like `KEY=VALUE` with a non-empty key.
fn validate_environment(environment: &[String]) -> Result<()> {
    for entry in environment {
        let valid = match entry.split_once('=') {
            Some((key, _)) => !key.is_empty() && !entry.contains('\0'),
            None => false,
        };
        if !valid {
            return Err(ShellError::InvalidEnvironment(entry.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::testing::{Behavior, FakeTransport};

    fn env(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    fn bridge_on(behavior: Behavior) -> (ShellBridge, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new(behavior));
        let bridge = ShellBridge::new(transport.clone())
            .with_launch_timeout(None)
            .with_cancel_grace(Duration::from_millis(200));
        (bridge, transport)
    }

    #[tokio::test]
    async fn test_run_command_scenario() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));

        let handle = bridge
            .run_command("/home/u", "echo hi", "UTF-8", &env(&["FOO=bar"]), CancellationToken::new())
            .await
            .unwrap();

        let spec = handle.launch_spec();
        assert_eq!(spec.command, "echo hi");
        assert_eq!(spec.working_directory.as_deref(), Some("/home/u"));
        assert_eq!(spec.environment, env(&["FOO=bar"]));
        assert_eq!(handle.state(), SessionState::Active);

        let requests = transport.requests();
        assert_eq!(
            requests,
            vec![ChannelRequest {
                terminal_type: "vt100".into(),
                encoding: "UTF-8".into(),
                environment: env(&["FOO=bar"]),
                working_directory: Some("/home/u".into()),
            }]
        );
        assert_eq!(transport.channels()[0].written_text(), "cd '/home/u'\necho hi\n");
    }

    #[tokio::test]
    async fn test_launch_shell_matches_run_command_with_sentinel() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));
        let environment = env(&["LANG=C", "TERM_PROGRAM=termshell"]);

        let shell = bridge
            .launch_shell("/tmp", "utf-8", &environment, CancellationToken::new())
            .await
            .unwrap();
        let run = bridge
            .run_command("/tmp", SHELL_INVOCATION, "utf-8", &environment, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(shell.launch_spec(), run.launch_spec());
        assert_eq!(shell.encoding(), run.encoding());
        let requests = transport.requests();
        assert_eq!(requests[0], requests[1]);
        let channels = transport.channels();
        assert_eq!(channels[0].written_text(), channels[1].written_text());
        assert_eq!(channels[0].written_text(), "cd '/tmp'\n");
    }

    #[tokio::test]
    async fn test_terminal_type_is_always_vt100() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));

        bridge
            .run_command("", "top", "latin1", &[], CancellationToken::new())
            .await
            .unwrap();
        bridge
            .launch_shell("/", "", &env(&["TERM=xterm-256color"]), CancellationToken::new())
            .await
            .unwrap();

        for request in transport.requests() {
            assert_eq!(request.terminal_type, TERMINAL_TYPE);
        }
    }

    #[tokio::test]
    async fn test_empty_inputs_use_defaults() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));

        let handle = bridge
            .launch_shell("", "", &[], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(handle.encoding(), "UTF-8");
        assert_eq!(handle.launch_spec().working_directory, None);
        let request = &transport.requests()[0];
        assert_eq!(request.working_directory, None);
        assert_eq!(request.encoding, "UTF-8");
        assert_eq!(transport.channels()[0].written_text(), "");
    }

    #[tokio::test]
    async fn test_encoding_label_is_canonicalised() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));

        bridge
            .launch_shell("", "latin1", &[], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.requests()[0].encoding, "windows-1252");
    }

    #[tokio::test]
    async fn test_unsupported_encoding() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));

        let err = bridge
            .launch_shell("", "klingon-8", &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::UnsupportedEncoding(ref e) if e == "klingon-8"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_encodings_without_an_encoder_are_unsupported() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));

        for label in ["iso-2022-kr", "hz-gb-2312", "utf-16", "UTF-16BE", "replacement"] {
            let err = bridge
                .launch_shell("", label, &[], CancellationToken::new())
                .await
                .unwrap_err();
            assert!(
                matches!(err, ShellError::UnsupportedEncoding(ref e) if e == label),
                "{label}: {err:?}"
            );
        }
        assert!(transport.requests().is_empty());

        let handle = bridge
            .launch_shell("", "sjis", &[], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.encoding(), "Shift_JIS");
        assert_eq!(transport.requests()[0].encoding, "Shift_JIS");
    }

    #[tokio::test]
    async fn test_unusable_default_encoding_is_config_error() {
        let mut config = AppConfig::default();
        config.bridge.default_encoding = "utf-16".into();
        let transport = Arc::new(FakeTransport::opening());
        let bridge = ShellBridge::with_config(transport.clone(), &config);

        let err = bridge
            .launch_shell("", "", &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Config(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_environment_rejected_before_transport() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));

        for bad in ["NOVALUE", "=value", "A=b\0c"] {
            let err = bridge
                .launch_shell("", "UTF-8", &env(&["OK=1", bad]), CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ShellError::InvalidEnvironment(ref e) if e == bad));
        }
        assert!(transport.requests().is_empty());

        // Empty values and '=' inside values are fine.
        assert!(validate_environment(&env(&["EMPTY=", "EXPR=a=b"])).is_ok());
    }

    #[tokio::test]
    async fn test_transport_failure_is_launch_failed() {
        let (bridge, transport) = bridge_on(Behavior::Refuse("host unreachable".into()));

        let err = bridge
            .run_command("/", "ls", "UTF-8", &[], CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ShellError::LaunchFailed(msg) => assert!(msg.contains("host unreachable")),
            other => panic!("expected LaunchFailed, got {other:?}"),
        }
        assert!(transport.channels().is_empty());

        // The bridge stays usable after a failure.
        let err = bridge
            .run_command("/", "ls", "UTF-8", &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::LaunchFailed(_)));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_closes_channel() {
        let (bridge, transport) = bridge_on(Behavior::OpenFailingWrites);

        let err = bridge
            .run_command("/srv", "make", "UTF-8", &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::LaunchFailed(_)));
        assert_eq!(transport.channels()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_closes_half_opened_channel() {
        let (bridge, transport) = bridge_on(Behavior::OpenAfterCancel);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = bridge
            .launch_shell("", "UTF-8", &[], cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Cancelled));

        let channels = transport.channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_with_cooperative_transport() {
        let (bridge, transport) = bridge_on(Behavior::HonourCancel);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = bridge
            .run_command("/", "sleep 1", "UTF-8", &[], cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Cancelled));
        assert_eq!(transport.channels()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_launch_skips_transport() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bridge.launch_shell("", "UTF-8", &[], cancel).await.unwrap_err();
        assert!(matches!(err, ShellError::Cancelled));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_cancels_launch() {
        let (bridge, transport) = bridge_on(Behavior::OpenAfterCancel);
        let bridge = bridge.with_launch_timeout(Some(Duration::from_millis(30)));

        let err = bridge
            .launch_shell("", "UTF-8", &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Cancelled));
        assert_eq!(transport.channels()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_transport_is_abandoned_after_grace() {
        let (bridge, _transport) = bridge_on(Behavior::IgnoreCancel);
        let bridge = bridge
            .with_launch_timeout(Some(Duration::from_millis(20)))
            .with_cancel_grace(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let err = bridge
            .launch_shell("", "UTF-8", &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// Poll `done` for up to a second.
    async fn settles(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    #[tokio::test]
    async fn test_dropped_launch_cancels_open_and_closes_channel() {
        let (bridge, transport) = bridge_on(Behavior::OpenAfterCancel);

        let launch = bridge.launch_shell("", "UTF-8", &[], CancellationToken::new());
        assert!(tokio::time::timeout(Duration::from_millis(30), launch).await.is_err());

        // Only the test and the bridge hold the transport once the open ends.
        assert!(settles(|| Arc::strong_count(&transport) == 2).await);
        let channels = transport.channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_launch_abandons_unresponsive_transport() {
        let (bridge, transport) = bridge_on(Behavior::IgnoreCancel);
        let bridge = bridge.with_cancel_grace(Duration::from_millis(20));

        let launch = bridge.run_command("/", "ls", "UTF-8", &[], CancellationToken::new());
        assert!(tokio::time::timeout(Duration::from_millis(30), launch).await.is_err());

        assert!(settles(|| Arc::strong_count(&transport) == 2).await);
    }

    #[tokio::test]
    async fn test_concurrent_launches_are_independent() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![]));
        let bridge = Arc::new(bridge);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let bridge = Arc::clone(&bridge);
            tasks.push(tokio::spawn(async move {
                bridge
                    .run_command("", &format!("echo {i}"), "UTF-8", &[], CancellationToken::new())
                    .await
                    .map(|h| (h.id(), h.launch_spec().command.clone()))
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for (i, task) in tasks.into_iter().enumerate() {
            let (id, command) = task.await.unwrap().unwrap();
            assert_eq!(command, format!("echo {i}"));
            ids.insert(id);
        }
        assert_eq!(ids.len(), 8);
        assert_eq!(transport.channels().len(), 8);
    }

    #[tokio::test]
    async fn test_handle_io_through_bridge() {
        let (bridge, transport) = bridge_on(Behavior::Open(vec![b"hi\n".to_vec()]));

        let mut handle = bridge
            .run_command("", "echo hi", "UTF-8", &[], CancellationToken::new())
            .await
            .unwrap();
        assert!(handle.is_alive());
        assert_eq!(handle.read_text().await.unwrap().as_deref(), Some("hi\n"));

        handle.write_input("exit").await.unwrap();
        handle.terminate().await.unwrap();
        assert!(!handle.is_alive());
        assert_eq!(transport.channels()[0].written_text(), "echo hi\nexit\n");
    }

    #[test]
    fn test_metadata() {
        let bridge = ShellBridge::new(Arc::new(FakeTransport::opening()));
        assert_eq!(bridge.name(), "Terminal Shell Service");
        assert!(!bridge.description().is_empty());
        let debug = format!("{:?}", bridge);
        assert!(debug.contains("fake"));
    }
}
