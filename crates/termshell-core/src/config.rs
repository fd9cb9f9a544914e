use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bridge: BridgeConfig,
    pub session: SessionConfig,
    pub pty: PtyConfig,
}

impl AppConfig {
    /// Load configuration from the default path (~/.config/termshell/config.toml),
    /// falling back to defaults if the file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write current configuration to the default path.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("termshell")
            .join("config.toml")
    }
}

/// Launch behaviour of the shell bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Encoding used when a caller passes an empty encoding.
    pub default_encoding: String,
    /// Deadline for opening a channel, in seconds. 0 disables it.
    pub launch_timeout_secs: u64,
    /// How long a cancelled launch waits for the transport to hand back a
    /// half-opened channel so it can be closed.
    pub cancel_grace_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_encoding: "UTF-8".into(),
            launch_timeout_secs: 30,
            cancel_grace_ms: 2000,
        }
    }
}

impl BridgeConfig {
    pub fn launch_timeout(&self) -> Option<Duration> {
        (self.launch_timeout_secs > 0).then(|| Duration::from_secs(self.launch_timeout_secs))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Shell session I/O settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Appended to every line written with `write_input`.
    pub line_terminator: String,
    /// Chunk size used by `read_text`.
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            line_terminator: "\n".into(),
            read_buffer_size: 4096,
        }
    }
}

/// Local pseudo-terminal transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Shell to spawn. Detected from the platform when unset.
    pub shell: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            shell: None,
            cols: 80,
            rows: 24,
        }
    }
}
