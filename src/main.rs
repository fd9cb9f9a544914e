mod console;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use termshell_core::config::AppConfig;
use termshell_core::{
    CancellationToken, Capability, CapabilityKind, CapabilityRegistry, ProviderScope, ShellBridge,
};
use termshell_pty::PtyTransport;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "termshell",
    about = "Run shells and commands through a terminal transport",
    version,
    author
)]
struct Cli {
    /// Path to config file (default: ~/.config/termshell/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seconds to wait for the terminal to open (0 waits forever)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct LaunchArgs {
    /// Initial working directory (default: the terminal's own)
    #[arg(long, default_value = "")]
    pub cwd: String,

    /// Character encoding (default: from config)
    #[arg(long, default_value = "")]
    pub encoding: String,

    /// Extra environment variable, repeatable
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in a fresh shell and print its output
    Run {
        #[command(flatten)]
        launch: LaunchArgs,

        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Start an interactive shell (default)
    Shell {
        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Show which capabilities the shell bridge resolves
    Capabilities,

    /// Show or manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Initialize default configuration file
    Init,
    /// Print config file path
    Path,
}

/// Identifier of the capability exposing the local shell behind the bridge.
const LOCAL_SHELL: &str = "local-shell";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "termshell=info,warn".into()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if let Some(secs) = cli.timeout {
        config.bridge.launch_timeout_secs = secs;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Some(Commands::Config { action }) => {
            handle_config_command(action, &config)?;
        }
        Some(Commands::Run { launch, command }) => {
            let bridge = connect(&config)?;
            console::run(&bridge, &launch, &command.join(" "), cancel).await?;
        }
        Some(Commands::Shell { launch }) => {
            let bridge = connect(&config)?;
            console::interactive(&bridge, &launch, cancel).await?;
        }
        Some(Commands::Capabilities) => {
            let bridge = connect(&config)?;
            print_capabilities(CapabilityRegistry::global(), &bridge)?;
        }
        None => {
            let bridge = connect(&config)?;
            console::interactive(&bridge, &LaunchArgs::default(), cancel).await?;
        }
    }

    Ok(())
}

/// Build the shell bridge over the local PTY transport.
fn connect(config: &AppConfig) -> Result<ShellBridge> {
    let transport = Arc::new(PtyTransport::from_config(&config.pty)?);
    let bridge = ShellBridge::with_config(transport.clone(), config);
    register_providers(CapabilityRegistry::global(), &bridge, &transport)?;

    tracing::info!(
        "Using {} ({}), launch timeout: {:?}",
        transport.shell().name,
        transport.shell().path.display(),
        config.bridge.launch_timeout(),
    );
    Ok(bridge)
}

/// Startup registrations: expose the local shell description for this bridge.
fn register_providers(
    registry: &CapabilityRegistry,
    bridge: &ShellBridge,
    transport: &PtyTransport,
) -> Result<()> {
    let shell = Arc::new(transport.shell().clone());
    registry.register(
        CapabilityKind::custom(LOCAL_SHELL),
        ProviderScope::Bridge(bridge.id()),
        Arc::new(move |_: &ShellBridge, _: &CapabilityKind| {
            Some(Capability::Custom(shell.clone()))
        }),
    )?;
    Ok(())
}

fn print_capabilities(registry: &CapabilityRegistry, bridge: &ShellBridge) -> Result<()> {
    let kinds = [
        CapabilityKind::TerminalTransport,
        CapabilityKind::Service,
        CapabilityKind::ShellService,
        CapabilityKind::custom(LOCAL_SHELL),
    ];
    for kind in kinds {
        let answer = match bridge.query_capability(registry, &kind)? {
            Some(Capability::TerminalTransport(t)) => format!("transport '{}'", t.name()),
            Some(Capability::ShellService(s)) => format!("shell service '{}'", s.name()),
            Some(capability) => match capability.downcast_custom::<termshell_pty::ShellInfo>() {
                Some(shell) => format!("{} at {}", shell.name, shell.path.display()),
                None => "custom value".to_string(),
            },
            None => "-".to_string(),
        };
        println!("{:<20} {}", kind.to_string(), answer);
    }
    Ok(())
}

fn handle_config_command(action: Option<ConfigAction>, config: &AppConfig) -> Result<()> {
    match action {
        Some(ConfigAction::Show) | None => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
        }
        Some(ConfigAction::Init) => {
            let path = AppConfig::default_path();
            if path.exists() {
                println!("Config already exists at: {}", path.display());
            } else {
                config.save()?;
                println!("Created default config at: {}", path.display());
            }
        }
        Some(ConfigAction::Path) => {
            println!("{}", AppConfig::default_path().display());
        }
    }
    Ok(())
}
