use serde::Serialize;

use crate::key::MachineKey;
use crate::retry::RetryState;

/// Connection state of the backend, as shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Where the launch control loop currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchPhase {
    /// Initial connectivity + update check
    Launching,
    /// Offline at launch, waiting for the next backoff tick
    Retrying,
    /// A newer version exists; only the update window is shown
    UpdatePending,
    /// Main UI up, reconnect monitor running
    Ready,
    /// Main UI torn down after losing connectivity while Ready
    Reconnecting,
    /// Explicit quit; terminal
    ShuttingDown,
}

/// Last observed network reachability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkState {
    Unknown,
    Online,
    Offline,
}

/// Status pushed to the UI as `connection-status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Connected,
    Disconnected,
    Error,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// A newer release advertised by the version manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub latest_version: String,
    pub download_url: String,
}

/// Which presentation surfaces are currently open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Surfaces {
    pub main: bool,
    pub error: bool,
    pub tray: bool,
}

/// All mutable launcher state, owned by the controller.
#[derive(Debug)]
pub struct ControllerState {
    pub phase: LaunchPhase,
    pub connection: ConnectionState,
    pub network: NetworkState,
    pub retry: RetryState,
    pub surfaces: Surfaces,
    /// Last key accepted by `connect`; memory only
    pub last_key: Option<MachineKey>,
}

impl ControllerState {
    pub fn new(countdown_secs: u32) -> Self {
        Self {
            phase: LaunchPhase::Launching,
            connection: ConnectionState::Disconnected,
            network: NetworkState::Unknown,
            retry: RetryState::new(countdown_secs),
            surfaces: Surfaces::default(),
            last_key: None,
        }
    }

    /// True while the reconnect monitor should be polling.
    pub fn is_monitoring(&self) -> bool {
        matches!(self.phase, LaunchPhase::Ready | LaunchPhase::Reconnecting)
    }
}
