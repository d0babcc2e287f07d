//! Collaborators the launch controller drives.
//!
//! The controller only talks to the outside world through these traits:
//! - `ConnectivityProbe`: is the network reachable right now
//! - `UpdateChecker`: is there a newer release
//! - `Supervisor`: start/stop the single backend process
//! - `UrlOpener`: hand a link to the system browser

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use url::Url;

use crate::key::MachineKey;
use crate::model::VersionInfo;

/// Identifies one spawned backend process.
pub type RunId = u64;

/// Output and lifecycle notifications from the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Stdout { run: RunId, line: String },
    Stderr { run: RunId, line: String },
    Exited { run: RunId, code: Option<i32> },
}

impl BackendEvent {
    pub fn run(&self) -> RunId {
        match self {
            Self::Stdout { run, .. } | Self::Stderr { run, .. } | Self::Exited { run, .. } => *run,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorError {
    ExecutableMissing { path: PathBuf },
    AlreadyRunning { run: RunId },
    SpawnFailed { reason: String },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutableMissing { path } => {
                write!(f, "backend binary not found at {}", path.display())
            }
            Self::AlreadyRunning { run } => write!(f, "backend already running (run {})", run),
            Self::SpawnFailed { reason } => write!(f, "failed to spawn backend: {}", reason),
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Network reachability check. Never fails; errors mean offline.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Remote version lookup. Fails soft: any error means "no update".
#[async_trait]
pub trait UpdateChecker: Send + Sync {
    async fn check_for_update(&self, current_version: &str) -> Option<VersionInfo>;
}

/// Owner of the single backend process.
///
/// Implementations emit [`BackendEvent`]s on an unbounded channel handed to
/// them at construction. At most one process is alive at any time; `start`
/// while one is running returns [`SupervisorError::AlreadyRunning`].
#[async_trait]
pub trait Supervisor: Send {
    async fn start(&mut self, key: &MachineKey) -> Result<RunId, SupervisorError>;

    /// Terminate the running process, if any. Idempotent.
    async fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// The run id of the live process, if any.
    fn current_run(&self) -> Option<RunId>;

    /// Drop the handle for `run` after it exited on its own. Returns false if
    /// `run` is not the current process.
    fn reap(&mut self, run: RunId) -> bool;
}

pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &Url) -> Result<(), String>;
}
