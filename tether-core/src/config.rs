use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::MAX_COUNTDOWN_SECS;

/// Environment switch between the packaged and development layouts.
pub const PACKAGED_ENV: &str = "TETHER_PACKAGED";

pub const CONFIG_FILE_NAMES: [&str; 4] =
    ["tether.yaml", "tether.yml", ".tether.yaml", ".tether.yml"];

/// Connectivity probe and reconnect monitor settings
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConnectivityConfig {
    /// Host name resolved to decide whether we are online
    #[serde(default = "default_probe_host")]
    pub host: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
    /// Reconnect monitor period while Ready
    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u64,
}

fn default_probe_host() -> String {
    "google.com".into()
}
fn default_probe_port() -> u16 {
    443
}
fn default_probe_timeout() -> u64 {
    3000
}
fn default_monitor_interval() -> u64 {
    5000
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            host: default_probe_host(),
            port: default_probe_port(),
            timeout_ms: default_probe_timeout(),
            interval_ms: default_monitor_interval(),
        }
    }
}

/// Update manifest settings
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpdateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Manifest location; no URL means no update check
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default = "default_update_timeout")]
    pub timeout_ms: u64,
}

fn default_update_timeout() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            manifest_url: None,
            timeout_ms: default_update_timeout(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Starting value of the offline backoff countdown
    #[serde(default = "default_countdown")]
    pub countdown_secs: u32,
}

fn default_countdown() -> u32 {
    MAX_COUNTDOWN_SECS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown(),
        }
    }
}

/// Backend executable settings
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackendConfig {
    /// File name looked up in the layout's `backend/` directory
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Explicit path; bypasses layout resolution
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL on stop
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
}

fn default_executable() -> String {
    "server.bin".into()
}
fn default_stop_grace() -> u64 {
    500
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            path: None,
            stop_grace_ms: default_stop_grace(),
        }
    }
}

/// Root configuration file structure
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LauncherConfig {
    /// Version compared against the manifest (defaults to the build version)
    #[serde(default)]
    pub current_version: Option<String>,

    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    #[serde(default)]
    pub updates: UpdateConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            current_version: None,
            connectivity: ConnectivityConfig::default(),
            updates: UpdateConfig::default(),
            retry: RetryConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    InvalidCountdown { value: u32 },
    ZeroDuration { field: &'static str },
    EmptyExecutable,
    InvalidManifestUrl { url: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Yaml(e) => write!(f, "YAML parse error: {}", e),
            Self::InvalidCountdown { value } => write!(
                f,
                "retry.countdown_secs must be between 1 and {}, got {}",
                MAX_COUNTDOWN_SECS, value
            ),
            Self::ZeroDuration { field } => write!(f, "{} must be greater than zero", field),
            Self::EmptyExecutable => write!(f, "backend.executable must not be empty"),
            Self::InvalidManifestUrl { url, reason } => {
                write!(f, "updates.manifest_url '{}' is invalid: {}", url, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Yaml(e)
    }
}

impl LauncherConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a string (useful for testing)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        // An empty file parses as YAML null; treat it as all defaults.
        let config: LauncherConfig = if content.trim().is_empty() {
            LauncherConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Search `start_dir` and its parents for a config file.
    /// Returns `Ok(None)` when there is none; defaults apply.
    pub fn discover(start_dir: &Path) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let mut dir = Some(start_dir);
        while let Some(current) = dir {
            for name in &CONFIG_FILE_NAMES {
                let path = current.join(name);
                if path.is_file() {
                    let config = Self::load(&path)?;
                    return Ok(Some((path, config)));
                }
            }
            dir = current.parent();
        }
        Ok(None)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let countdown = self.retry.countdown_secs;
        if countdown == 0 || countdown > MAX_COUNTDOWN_SECS {
            return Err(ConfigError::InvalidCountdown { value: countdown });
        }

        for (field, value) in [
            ("connectivity.timeout_ms", self.connectivity.timeout_ms),
            ("connectivity.interval_ms", self.connectivity.interval_ms),
            ("updates.timeout_ms", self.updates.timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        if self.backend.executable.trim().is_empty() {
            return Err(ConfigError::EmptyExecutable);
        }

        if let Some(url) = &self.updates.manifest_url {
            url::Url::parse(url).map_err(|e| ConfigError::InvalidManifestUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// Version the manifest is compared against.
    pub fn current_version(&self) -> String {
        self.current_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity.timeout_ms)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.updates.timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.backend.stop_grace_ms)
    }

    /// The manifest URL if update checks are on.
    pub fn manifest_url(&self) -> Option<&str> {
        if !self.updates.enabled {
            return None;
        }
        self.updates.manifest_url.as_deref()
    }
}

/// Where the backend executable is expected to live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendLayout {
    /// Installed app: `<exe dir>/resources/backend/<executable>`
    Packaged,
    /// Source checkout: `<working dir>/backend/<executable>`
    Development,
}

impl BackendLayout {
    /// Read [`PACKAGED_ENV`]; unset or unrecognised falls back to the build
    /// profile (release = packaged).
    pub fn from_env() -> Self {
        Self::from_flag(std::env::var(PACKAGED_ENV).ok().as_deref())
    }

    pub fn from_flag(flag: Option<&str>) -> Self {
        match flag.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("1" | "true" | "yes") => Self::Packaged,
            Some("0" | "false" | "no") => Self::Development,
            _ if cfg!(debug_assertions) => Self::Development,
            _ => Self::Packaged,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Packaged => "packaged",
            Self::Development => "development",
        }
    }
}

/// Resolve the backend executable path for a layout.
///
/// `exe_dir` is the directory of the running launcher binary and `work_dir`
/// the current working directory.
pub fn resolve_backend_path(
    backend: &BackendConfig,
    layout: BackendLayout,
    exe_dir: &Path,
    work_dir: &Path,
) -> PathBuf {
    if let Some(path) = &backend.path {
        return path.clone();
    }
    match layout {
        BackendLayout::Packaged => exe_dir
            .join("resources")
            .join("backend")
            .join(&backend.executable),
        BackendLayout::Development => work_dir.join("backend").join(&backend.executable),
    }
}
