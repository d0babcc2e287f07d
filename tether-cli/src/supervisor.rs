use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tether_core::key::MachineKey;
use tether_core::ports::{BackendEvent, RunId, Supervisor, SupervisorError};

/// How long the exit watcher waits for the output readers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct BackendHandle {
    run: RunId,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

/// Spawns and owns the single backend process.
///
/// The process gets the machine key as its only argument. Output lines and
/// the final exit are reported as [`BackendEvent`]s tagged with the run id.
pub struct ProcessSupervisor {
    executable: PathBuf,
    stop_grace: Duration,
    handle: Option<BackendHandle>,
    next_run: RunId,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        executable: PathBuf,
        stop_grace: Duration,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        Self {
            executable,
            stop_grace,
            handle: None,
            next_run: 1,
            events,
        }
    }

    fn spawn(&self, key: &MachineKey) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.executable);
        cmd.arg(key.expose());

        if let Some(dir) = self.executable.parent() {
            cmd.current_dir(dir);
        }

        // Own session so the whole tree can be signalled on stop
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd.spawn()
    }
}

fn forward_lines<R>(
    reader: R,
    events: mpsc::UnboundedSender<BackendEvent>,
    make: fn(RunId, String) -> BackendEvent,
    run: RunId,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if events.send(make(run, line)).is_err() {
                break;
            }
        }
    })
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as i32, signal);
        }
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid = ?pid, "backend ignored SIGTERM, killing");
        signal_group(pid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }

    let _ = child.kill().await;
}

/// Waits for the child to exit, or kills it when asked. Always finishes by
/// reporting `Exited` for `run`.
async fn watch(
    mut child: Child,
    run: RunId,
    pid: Option<u32>,
    grace: Duration,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            debug!(run, "stopping backend");
            terminate(&mut child, pid, grace).await;
            child.wait().await
        }
    };

    // Output written just before exit is delivered ahead of the exit itself.
    for reader in readers {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(run, "failed to wait on backend: {}", e);
            None
        }
    };
    info!(run, code = ?code, "backend exited");
    let _ = events.send(BackendEvent::Exited { run, code });
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&mut self, key: &MachineKey) -> Result<RunId, SupervisorError> {
        if let Some(handle) = &self.handle {
            if !handle.watcher.is_finished() {
                return Err(SupervisorError::AlreadyRunning { run: handle.run });
            }
            // Exited but not yet reaped; its exit event becomes stale.
            debug!(run = handle.run, "replacing finished backend handle");
            self.handle = None;
        }

        if !self.executable.is_file() {
            error!(path = %self.executable.display(), "backend binary not found");
            return Err(SupervisorError::ExecutableMissing {
                path: self.executable.clone(),
            });
        }

        let mut child = self.spawn(key).map_err(|e| {
            error!(path = %self.executable.display(), "failed to spawn backend: {}", e);
            SupervisorError::SpawnFailed {
                reason: e.to_string(),
            }
        })?;

        let run = self.next_run;
        self.next_run += 1;
        let pid = child.id();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(
                stdout,
                self.events.clone(),
                |run, line| BackendEvent::Stdout { run, line },
                run,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(
                stderr,
                self.events.clone(),
                |run, line| BackendEvent::Stderr { run, line },
                run,
            ));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(
            child,
            run,
            pid,
            self.stop_grace,
            kill_rx,
            readers,
            self.events.clone(),
        ));

        info!(run, pid = ?pid, key = %key, "backend started");
        self.handle = Some(BackendHandle {
            run,
            pid,
            kill_tx: Some(kill_tx),
            watcher,
        });
        Ok(run)
    }

    async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        debug!(run = handle.run, pid = ?handle.pid, "stop requested");
        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        let deadline = self.stop_grace + Duration::from_secs(2);
        if tokio::time::timeout(deadline, &mut handle.watcher)
            .await
            .is_err()
        {
            warn!(run = handle.run, "backend did not exit in time, abandoning");
            handle.watcher.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.watcher.is_finished())
    }

    fn current_run(&self) -> Option<RunId> {
        self.handle.as_ref().map(|handle| handle.run)
    }

    fn reap(&mut self, run: RunId) -> bool {
        match &self.handle {
            Some(handle) if handle.run == run => {
                self.handle = None;
                true
            }
            _ => false,
        }
    }
}
