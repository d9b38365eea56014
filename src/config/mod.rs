use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub isolation: IsolationConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between enumeration passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Mount points that are never treated as attachable devices
    #[serde(default = "default_ignore_mounts")]
    pub ignore_mounts: Vec<String>,

    /// Report fixed (non-removable) volumes as well as removable ones
    #[serde(default = "default_true")]
    pub include_fixed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Trust store file (default: state_dir/trust_store.json)
    #[serde(default)]
    pub store_file: Option<String>,

    /// Re-prompt when a remembered device presents a directive whose
    /// fingerprint differs from the one that was approved (default: false)
    #[serde(default)]
    pub rechallenge_on_change: bool,

    /// Append decisions and launches to the hash-chained audit log
    #[serde(default = "default_true")]
    pub audit: bool,
}

/// Whether the native confinement path is attempted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrongIsolationMode {
    /// Use strong isolation when the host supports it, fall back otherwise.
    Auto,
    /// Environment redirection only.
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default = "default_strong_mode")]
    pub strong: StrongIsolationMode,

    /// Address-space ceiling for confined processes in MiB (0 = none)
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// Wall-clock ceiling for confined processes in seconds (0 = none)
    #[serde(default)]
    pub timeout_secs: u64,

    /// RLIMIT_NPROC for confined processes (0 = none). The kernel counts
    /// every process of the user, not just the confined tree.
    #[serde(default)]
    pub max_processes: u32,

    /// Host variables copied verbatim into an isolated environment
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,
}

/// How unknown devices are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Ask on the controlling terminal.
    Terminal,
    /// Refuse once without asking.
    Deny,
    /// Allow once without asking.
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_prompt_mode")]
    pub mode: PromptMode,

    /// Answer used when no terminal is available (daemon mode).
    /// `terminal` is not valid here and is treated as `deny`.
    #[serde(default = "default_headless_mode")]
    pub headless_default: PromptMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Days to keep daemon log files (0 = keep forever, no auto-deletion)
    #[serde(default)]
    pub retention_days: u32,
}

fn default_true() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    5
}
fn default_ignore_mounts() -> Vec<String> {
    vec!["/".to_string(), "/boot".to_string(), "/boot/efi".to_string()]
}
fn default_strong_mode() -> StrongIsolationMode {
    StrongIsolationMode::Auto
}
fn default_max_memory_mb() -> u64 {
    4096
}
fn default_passthrough_env() -> Vec<String> {
    ["LANG", "TERM", "DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_prompt_mode() -> PromptMode {
    PromptMode::Terminal
}
fn default_headless_mode() -> PromptMode {
    PromptMode::Deny
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            ignore_mounts: default_ignore_mounts(),
            include_fixed: default_true(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            store_file: None,
            rechallenge_on_change: false,
            audit: default_true(),
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            strong: default_strong_mode(),
            max_memory_mb: default_max_memory_mb(),
            timeout_secs: 0,
            max_processes: 0,
            passthrough_env: default_passthrough_env(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            mode: default_prompt_mode(),
            headless_default: default_headless_mode(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            retention_days: 0,
        }
    }
}

impl Config {
    /// Load the config from `path`, or from the default location when `None`.
    /// A missing file is created from the commented template.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.config_file());

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            write_template(&path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.paths = paths;

        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Trust store location, honoring `trust.store_file`.
    pub fn trust_store_path(&self) -> PathBuf {
        match self.trust.store_file {
            Some(ref file) if !file.trim().is_empty() => {
                PathBuf::from(shellexpand::tilde(file.trim()).to_string())
            }
            _ => self.paths.trust_store(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs.max(1))
    }
}

/// Write the default config template (used for first-time setup and `config init`).
pub fn write_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    eprintln!("Created default config at {}", path.display());

    Ok(())
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Autorun Configuration
# Auto-created on first run. Edit as needed.

[monitor]
interval_secs = 5
# Mount points never treated as attachable devices
ignore_mounts = ["/", "/boot", "/boot/efi"]
include_fixed = true

[trust]
# store_file = "~/.local/state/autorun/trust_store.json"
# Re-prompt when an approved device's directive changes (default: false)
rechallenge_on_change = false
audit = true

[isolation]
strong = "auto"                # auto | off
max_memory_mb = 4096           # 0 = no ceiling
timeout_secs = 0               # 0 = no ceiling
max_processes = 0              # 0 = no ceiling (counts all user processes)
passthrough_env = ["LANG", "TERM", "DISPLAY", "WAYLAND_DISPLAY"]

[prompt]
mode = "terminal"              # terminal | deny | allow
headless_default = "deny"      # used by the background daemon

[logging]
level = "info"
"#;
