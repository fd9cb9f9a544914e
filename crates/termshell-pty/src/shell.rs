//! Picking the login shell a local terminal runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A shell executable the PTY transport can start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellInfo {
    /// Short identifier (e.g. "bash", "zsh", "pwsh").
    pub id: String,
    /// Display name (e.g. "Bash", "PowerShell 7").
    pub name: String,
    pub path: PathBuf,
}

impl ShellInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
        }
    }

    /// Describe the shell at `path`, naming it after the executable.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("sh")
            .to_string();
        let mut chars = id.chars();
        let name = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => id.clone(),
        };
        Self { id, name, path }
    }
}

#[cfg(unix)]
const CANDIDATES: &[(&str, &str, &str)] = &[
    ("bash", "Bash", "/bin/bash"),
    ("zsh", "Zsh", "/bin/zsh"),
    ("fish", "Fish", "/usr/bin/fish"),
    ("sh", "Shell", "/bin/sh"),
    ("bash", "Bash", "/usr/local/bin/bash"),
    ("zsh", "Zsh", "/usr/local/bin/zsh"),
];

#[cfg(windows)]
const CANDIDATES: &[(&str, &str, &str)] = &[
    ("pwsh", "PowerShell 7", r"C:\Program Files\PowerShell\7\pwsh.exe"),
    (
        "powershell",
        "Windows PowerShell",
        r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
    ),
    ("cmd", "Command Prompt", r"C:\Windows\System32\cmd.exe"),
];

/// Shells installed at their well-known locations, in preference order.
pub fn detect_available_shells() -> Vec<ShellInfo> {
    let mut shells: Vec<ShellInfo> = Vec::new();
    for (id, name, path) in CANDIDATES {
        let path = PathBuf::from(path);
        if path.exists() && !shells.iter().any(|s| s.path == path) {
            shells.push(ShellInfo::new(*id, *name, path));
        }
    }
    shells
}

/// The user's shell: `$SHELL` on Unix (`%COMSPEC%` on Windows), otherwise
/// the first detected one.
pub fn default_shell() -> Option<ShellInfo> {
    #[cfg(unix)]
    let var = "SHELL";
    #[cfg(windows)]
    let var = "COMSPEC";

    if let Ok(path) = std::env::var(var) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(ShellInfo::from_path(path));
        }
    }
    detect_available_shells().into_iter().next()
}

/// Use `configured` when it exists, fall back to [`default_shell`].
pub fn resolve_shell(configured: Option<&Path>) -> Option<ShellInfo> {
    match configured {
        Some(path) if path.exists() => Some(ShellInfo::from_path(path)),
        Some(path) => {
            tracing::warn!(path = %path.display(), "Configured shell not found, detecting one");
            default_shell()
        }
        None => default_shell(),
    }
}
