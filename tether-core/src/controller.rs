//! The launch control loop.
//!
//! One task owns all launcher state and multiplexes five sources with
//! `tokio::select!`: the offline retry timer, the reconnect monitor, the
//! in-flight update check, backend process events and UI commands. Each
//! branch runs to completion before the next is polled, so state is never
//! mutated concurrently.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::config::LauncherConfig;
use crate::gateway::{CommandResult, EventPublisher, UiCommand, UiEvent};
use crate::key::MachineKey;
use crate::links::parse_openable_url;
use crate::model::{
    BackendStatus, ConnectionState, ControllerState, LaunchPhase, NetworkState, VersionInfo,
};
use crate::ports::{
    BackendEvent, ConnectivityProbe, Supervisor, SupervisorError, UpdateChecker, UrlOpener,
};
use crate::tray::TrayAction;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub current_version: String,
    pub monitor_interval: Duration,
    pub countdown_secs: u32,
}

impl ControllerConfig {
    pub fn from_launcher(config: &LauncherConfig) -> Self {
        Self {
            current_version: config.current_version(),
            monitor_interval: config.monitor_interval(),
            countdown_secs: config.retry.countdown_secs,
        }
    }
}

/// Everything the controller drives.
pub struct Collaborators {
    pub probe: Box<dyn ConnectivityProbe>,
    pub updates: Box<dyn UpdateChecker>,
    pub supervisor: Box<dyn Supervisor>,
    pub opener: Box<dyn UrlOpener>,
}

/// Why the control loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Tray quit or all windows closed
    Quit { code: i32 },
    /// `exit` command from the UI
    Exit,
    /// Every gateway handle was dropped
    GatewayClosed,
}

enum LaunchOutcome {
    Retry(Duration),
    CheckUpdates,
    UpdatePending,
    Ready,
}

/// Timers and background work owned by the loop; dropped on shutdown.
#[derive(Default)]
struct Scheduled {
    retry: Option<Pin<Box<Sleep>>>,
    monitor: Option<Interval>,
    update_check: Option<JoinHandle<Option<VersionInfo>>>,
}

enum Flow {
    Continue,
    Stop(ExitReason),
}

pub struct LaunchController {
    state: ControllerState,
    config: ControllerConfig,
    probe: Box<dyn ConnectivityProbe>,
    updates: Arc<dyn UpdateChecker>,
    supervisor: Box<dyn Supervisor>,
    opener: Box<dyn UrlOpener>,
    events: EventPublisher,
}

impl LaunchController {
    pub fn new(config: ControllerConfig, parts: Collaborators, events: EventPublisher) -> Self {
        Self {
            state: ControllerState::new(config.countdown_secs),
            config,
            probe: parts.probe,
            updates: Arc::from(parts.updates),
            supervisor: parts.supervisor,
            opener: parts.opener,
            events,
        }
    }

    /// Run until quit, exit, or the gateway goes away. The backend is always
    /// stopped and all timers are dropped before this returns.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<UiCommand>,
        mut backend_events: mpsc::UnboundedReceiver<BackendEvent>,
    ) -> ExitReason {
        let mut scheduled = Scheduled::default();

        let outcome = self.attempt_launch().await;
        self.arm(outcome, &mut scheduled);

        let reason = loop {
            tokio::select! {
                _ = retry_elapsed(&mut scheduled.retry) => {
                    scheduled.retry = None;
                    let outcome = self.attempt_launch().await;
                    self.arm(outcome, &mut scheduled);
                }

                update = update_checked(&mut scheduled.update_check) => {
                    scheduled.update_check = None;
                    let outcome = self.on_update_checked(update);
                    self.arm(outcome, &mut scheduled);
                }

                _ = monitor_tick(&mut scheduled.monitor), if self.state.is_monitoring() => {
                    self.poll_connectivity().await;
                }

                Some(event) = backend_events.recv() => {
                    self.on_backend_event(event);
                }

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        info!("gateway closed, shutting down");
                        break ExitReason::GatewayClosed;
                    };
                    if let Flow::Stop(reason) = self.handle_command(cmd).await {
                        break reason;
                    }
                }
            }
        };

        // Cancel outstanding timers and checks before tearing down the backend.
        if let Some(check) = scheduled.update_check.take() {
            check.abort();
        }
        drop(scheduled);
        self.supervisor.stop().await;
        self.set_phase(LaunchPhase::ShuttingDown);
        info!(?reason, "launch controller stopped");
        reason
    }

    fn arm(&self, outcome: LaunchOutcome, scheduled: &mut Scheduled) {
        match outcome {
            LaunchOutcome::Retry(delay) => {
                scheduled.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            LaunchOutcome::CheckUpdates => {
                let updates = Arc::clone(&self.updates);
                let current = self.config.current_version.clone();
                scheduled.update_check = Some(tokio::spawn(async move {
                    updates.check_for_update(&current).await
                }));
            }
            LaunchOutcome::Ready => {
                let period = self.config.monitor_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                scheduled.monitor = Some(interval);
            }
            LaunchOutcome::UpdatePending => {}
        }
    }

    async fn attempt_launch(&mut self) -> LaunchOutcome {
        self.set_phase(LaunchPhase::Launching);

        let online = self.probe.is_online().await;
        if !online {
            self.state.network = NetworkState::Offline;
            self.set_phase(LaunchPhase::Retrying);

            let tick = self.state.retry.tick();
            self.open_error_window();
            self.events.emit(UiEvent::UpdateRetryInfo {
                attempt: tick.attempt,
                countdown: tick.countdown,
            });

            // A local backend can still be useful while offline.
            self.try_offline_start().await;

            info!(
                attempt = tick.attempt,
                "no internet, retrying in {} seconds",
                tick.next_delay.as_secs()
            );
            return LaunchOutcome::Retry(tick.next_delay);
        }

        self.state.network = NetworkState::Online;
        info!("internet connected, checking for updates");
        LaunchOutcome::CheckUpdates
    }

    fn on_update_checked(&mut self, update: Option<VersionInfo>) -> LaunchOutcome {
        match update {
            Some(update) => {
                info!(
                    current = %self.config.current_version,
                    latest = %update.latest_version,
                    "update available"
                );
                self.set_phase(LaunchPhase::UpdatePending);
                self.close_error_window();
                self.events.emit(UiEvent::ShowUpdateWindow {
                    download_url: update.download_url.clone(),
                });
                self.events.emit(UiEvent::SetDownloadUrl(update.download_url));
                LaunchOutcome::UpdatePending
            }
            None => {
                self.enter_ready();
                LaunchOutcome::Ready
            }
        }
    }

    fn enter_ready(&mut self) {
        self.open_main_window();
        if !self.state.surfaces.tray {
            self.state.surfaces.tray = true;
            self.events.emit(UiEvent::ShowTray);
        }
        self.close_error_window();
        self.state.retry.reset();
        self.set_phase(LaunchPhase::Ready);
        info!("launcher ready, monitoring connectivity");
    }

    async fn try_offline_start(&mut self) {
        if self.supervisor.is_running() {
            debug!("backend already running, skipping offline start");
            return;
        }
        let Some(key) = self.state.last_key.clone() else {
            debug!("backend start deferred: no machine key yet");
            return;
        };
        match self.supervisor.start(&key).await {
            Ok(run) => {
                info!(run, "backend started while offline");
                self.set_connection(ConnectionState::Connected);
            }
            Err(e) => warn!("offline backend start failed: {}", e),
        }
    }

    async fn poll_connectivity(&mut self) {
        let online = self.probe.is_online().await;
        match (self.state.network, online) {
            (NetworkState::Online, false) => {
                warn!("connection lost");
                self.close_main_window();
                self.open_error_window();
                self.state.network = NetworkState::Offline;
                self.set_phase(LaunchPhase::Reconnecting);
            }
            (NetworkState::Offline | NetworkState::Unknown, true) => {
                info!("connection restored");
                self.open_main_window();
                self.close_error_window();
                self.state.network = NetworkState::Online;
                self.set_phase(LaunchPhase::Ready);
                if self.state.connection != ConnectionState::Connected {
                    self.events.emit(UiEvent::LogMessage(
                        "Connection restored. Connect again to resume the backend.".into(),
                    ));
                }
            }
            _ => {}
        }
    }

    fn on_backend_event(&mut self, event: BackendEvent) {
        let current = self.supervisor.current_run();
        match event {
            BackendEvent::Stdout { run, line } => {
                debug!(run, "backend: {}", line);
                self.events.emit(UiEvent::LogMessage(line));
            }
            BackendEvent::Stderr { run, line } => {
                warn!(run, "backend error: {}", line);
                self.events.emit(UiEvent::LogMessage(line));
                if current == Some(run) {
                    self.set_connection(ConnectionState::Error);
                }
            }
            BackendEvent::Exited { run, code } => {
                if self.supervisor.reap(run) {
                    info!(run, ?code, "backend process exited");
                    self.set_connection(ConnectionState::Disconnected);
                } else {
                    debug!(run, ?code, "ignoring exit of a stopped backend run");
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: UiCommand) -> Flow {
        match cmd {
            UiCommand::Connect { machine_key, reply } => {
                let result = self.connect(&machine_key).await;
                let _ = reply.send(result);
                Flow::Continue
            }
            UiCommand::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(CommandResult::ok());
                Flow::Continue
            }
            UiCommand::Exit { reply } => {
                self.disconnect().await;
                self.set_phase(LaunchPhase::ShuttingDown);
                let _ = reply.send(CommandResult::ok());
                self.events.emit(UiEvent::Quit { code: 0 });
                Flow::Stop(ExitReason::Exit)
            }
            UiCommand::OpenExternalUrl { url, reply } => {
                let _ = reply.send(self.open_external_url(&url));
                Flow::Continue
            }
            UiCommand::Tray(action) => self.on_tray_action(action).await,
            UiCommand::AllWindowsClosed => {
                if cfg!(target_os = "macos") {
                    debug!("all windows closed, staying resident");
                    Flow::Continue
                } else {
                    self.quit(0).await
                }
            }
        }
    }

    async fn connect(&mut self, raw_key: &serde_json::Value) -> CommandResult {
        let key = match MachineKey::from_value(raw_key) {
            Ok(key) => key,
            Err(e) => {
                warn!("connect rejected: {}", e);
                return CommandResult::failure("Invalid machine key");
            }
        };

        info!(key = %key, "connecting");
        let previous = self.state.connection;
        self.set_connection(ConnectionState::Connecting);

        match self.supervisor.start(&key).await {
            Ok(run) => {
                info!(run, "backend started");
                self.state.last_key = Some(key);
                self.set_connection(ConnectionState::Connected);
                CommandResult::ok_with("Connected successfully")
            }
            Err(SupervisorError::AlreadyRunning { run }) => {
                warn!(run, "connect ignored: backend already running");
                self.state.connection = previous;
                CommandResult::failure("Backend process already running")
            }
            Err(e) => {
                warn!("connect failed: {}", e);
                self.set_connection(ConnectionState::Error);
                CommandResult::failure(format!("Failed to start backend process: {}", e))
            }
        }
    }

    /// Also forgets the key, so offline retries do not bring the backend back.
    async fn disconnect(&mut self) {
        self.state.last_key = None;
        self.supervisor.stop().await;
        self.set_connection(ConnectionState::Disconnected);
    }

    async fn quit(&mut self, code: i32) -> Flow {
        info!("quit requested");
        self.state.last_key = None;
        self.supervisor.stop().await;
        self.set_connection(ConnectionState::Disconnected);
        self.state.network = NetworkState::Offline;
        self.set_phase(LaunchPhase::ShuttingDown);
        self.events.emit(UiEvent::Quit { code });
        Flow::Stop(ExitReason::Quit { code })
    }

    async fn on_tray_action(&mut self, action: TrayAction) -> Flow {
        match action {
            TrayAction::Open => {
                if self.state.surfaces.main {
                    self.events.emit(UiEvent::ShowMainWindow);
                } else {
                    debug!("tray open ignored: main window not created");
                }
                Flow::Continue
            }
            TrayAction::Disconnect => {
                self.disconnect().await;
                Flow::Continue
            }
            TrayAction::Quit => self.quit(0).await,
        }
    }

    fn open_external_url(&self, raw_url: &str) -> bool {
        let url = match parse_openable_url(raw_url) {
            Ok(url) => url,
            Err(e) => {
                warn!("refusing to open url: {}", e);
                return false;
            }
        };
        match self.opener.open(&url) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to open {}: {}", url, e);
                false
            }
        }
    }

    fn set_phase(&mut self, phase: LaunchPhase) {
        if self.state.phase != phase {
            debug!(from = ?self.state.phase, to = ?phase, "launch phase changed");
            self.state.phase = phase;
        }
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        self.state.connection = connection;
        let status = match connection {
            ConnectionState::Connected => BackendStatus::Connected,
            ConnectionState::Error => BackendStatus::Error,
            ConnectionState::Disconnected => BackendStatus::Disconnected,
            ConnectionState::Connecting => return,
        };
        self.events.emit(UiEvent::ConnectionStatus(status));
    }

    fn open_main_window(&mut self) {
        if !self.state.surfaces.main {
            self.state.surfaces.main = true;
            self.events.emit(UiEvent::ShowMainWindow);
        }
    }

    fn close_main_window(&mut self) {
        if self.state.surfaces.main {
            self.state.surfaces.main = false;
            self.events.emit(UiEvent::CloseMainWindow);
        }
    }

    fn open_error_window(&mut self) {
        if !self.state.surfaces.error {
            self.state.surfaces.error = true;
            self.events.emit(UiEvent::ShowErrorWindow);
        }
    }

    fn close_error_window(&mut self) {
        if self.state.surfaces.error {
            self.state.surfaces.error = false;
            self.events.emit(UiEvent::CloseErrorWindow);
        }
    }
}

async fn retry_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn update_checked(check: &mut Option<JoinHandle<Option<VersionInfo>>>) -> Option<VersionInfo> {
    match check {
        Some(handle) => match handle.await {
            Ok(update) => update,
            Err(e) => {
                warn!("update check task failed: {}", e);
                None
            }
        },
        None => pending().await,
    }
}

async fn monitor_tick(monitor: &mut Option<Interval>) {
    match monitor {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::broadcast;
    use tokio::task::JoinHandle;
    use url::Url;

    use super::*;
    use crate::gateway::{EventEnvelope, Gateway};
    use crate::manifest;
    use crate::model::VersionInfo;
    use crate::ports::RunId;

    #[derive(Clone, Default)]
    struct FakeProbe {
        online: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeProbe {
        fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectivityProbe for FakeProbe {
        async fn is_online(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.online.load(Ordering::SeqCst)
        }
    }

    /// Answers from a canned manifest body, like the HTTP checker would.
    struct FakeUpdates {
        body: &'static str,
        delay: Duration,
    }

    impl FakeUpdates {
        fn answering(body: &'static str) -> Self {
            Self {
                body,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl UpdateChecker for FakeUpdates {
        async fn check_for_update(&self, current_version: &str) -> Option<VersionInfo> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            manifest::evaluate(self.body, current_version).ok().flatten()
        }
    }

    #[derive(Default)]
    struct SupervisorLog {
        running: Option<RunId>,
        next_run: RunId,
        started_with: Vec<String>,
        stops: usize,
        missing_binary: bool,
    }

    #[derive(Clone, Default)]
    struct FakeSupervisor {
        log: Arc<Mutex<SupervisorLog>>,
    }

    impl FakeSupervisor {
        fn starts(&self) -> Vec<String> {
            self.log.lock().unwrap().started_with.clone()
        }

        fn running(&self) -> Option<RunId> {
            self.log.lock().unwrap().running
        }

        fn stops(&self) -> usize {
            self.log.lock().unwrap().stops
        }
    }

    #[async_trait]
    impl Supervisor for FakeSupervisor {
        async fn start(&mut self, key: &MachineKey) -> Result<RunId, SupervisorError> {
            let mut log = self.log.lock().unwrap();
            if log.missing_binary {
                return Err(SupervisorError::ExecutableMissing {
                    path: "/missing/server.bin".into(),
                });
            }
            if let Some(run) = log.running {
                return Err(SupervisorError::AlreadyRunning { run });
            }
            log.next_run += 1;
            let run = log.next_run;
            log.running = Some(run);
            log.started_with.push(key.expose().to_string());
            Ok(run)
        }

        async fn stop(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.stops += 1;
            log.running = None;
        }

        fn is_running(&self) -> bool {
            self.log.lock().unwrap().running.is_some()
        }

        fn current_run(&self) -> Option<RunId> {
            self.log.lock().unwrap().running
        }

        fn reap(&mut self, run: RunId) -> bool {
            let mut log = self.log.lock().unwrap();
            if log.running == Some(run) {
                log.running = None;
                true
            } else {
                false
            }
        }
    }

    #[derive(Clone, Default)]
    struct FakeOpener {
        opened: Arc<Mutex<Vec<String>>>,
    }

    impl UrlOpener for FakeOpener {
        fn open(&self, url: &Url) -> Result<(), String> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    const NO_UPDATE: &str = r#"{"latest": "1.0.0", "download_url": "x"}"#;
    const UPDATE: &str = r#"{"latest": "2.0.0", "download_url": "https://dl.example.com/2.0.0"}"#;

    struct Harness {
        gateway: Gateway,
        events: broadcast::Receiver<EventEnvelope>,
        probe: FakeProbe,
        supervisor: FakeSupervisor,
        opener: FakeOpener,
        backend_tx: mpsc::UnboundedSender<BackendEvent>,
        task: JoinHandle<ExitReason>,
    }

    fn launch(online: bool, manifest_body: &'static str) -> Harness {
        launch_with(online, manifest_body, FakeSupervisor::default())
    }

    fn launch_with(online: bool, manifest_body: &'static str, supervisor: FakeSupervisor) -> Harness {
        launch_parts(online, FakeUpdates::answering(manifest_body), supervisor)
    }

    fn launch_parts(online: bool, updates: FakeUpdates, supervisor: FakeSupervisor) -> Harness {
        let probe = FakeProbe::default();
        probe.set_online(online);
        let opener = FakeOpener::default();

        let (gateway, publisher, command_rx) = Gateway::channel(64);
        let events = gateway.subscribe();
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();

        let controller = LaunchController::new(
            ControllerConfig {
                current_version: "1.0.0".into(),
                monitor_interval: Duration::from_secs(5),
                countdown_secs: 10,
            },
            Collaborators {
                probe: Box::new(probe.clone()),
                updates: Box::new(updates),
                supervisor: Box::new(supervisor.clone()),
                opener: Box::new(opener.clone()),
            },
            publisher,
        );
        let task = tokio::spawn(controller.run(command_rx, backend_rx));

        Harness {
            gateway,
            events,
            probe,
            supervisor,
            opener,
            backend_tx,
            task,
        }
    }

    /// Skip events until one matches.
    async fn wait_for(
        events: &mut broadcast::Receiver<EventEnvelope>,
        mut matches: impl FnMut(&UiEvent) -> bool,
    ) -> UiEvent {
        let found = tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                let envelope = events.recv().await.expect("event stream closed");
                if matches(&envelope.event) {
                    return envelope.event;
                }
            }
        })
        .await;
        found.expect("expected event never arrived")
    }

    /// Everything already buffered on the stream.
    fn drain(events: &mut broadcast::Receiver<EventEnvelope>) -> Vec<UiEvent> {
        let mut seen = Vec::new();
        while let Ok(envelope) = events.try_recv() {
            seen.push(envelope.event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn offline_at_startup_shows_error_window_and_retry_info() {
        let mut h = launch(false, NO_UPDATE);

        wait_for(&mut h.events, |e| *e == UiEvent::ShowErrorWindow).await;
        let first = wait_for(&mut h.events, |e| {
            matches!(e, UiEvent::UpdateRetryInfo { .. })
        })
        .await;
        assert_eq!(
            first,
            UiEvent::UpdateRetryInfo {
                attempt: 1,
                countdown: 10
            }
        );

        let started = Instant::now();
        let second = wait_for(&mut h.events, |e| {
            matches!(e, UiEvent::UpdateRetryInfo { .. })
        })
        .await;
        assert_eq!(
            second,
            UiEvent::UpdateRetryInfo {
                attempt: 2,
                countdown: 9
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(9));

        // Error window is reused across ticks.
        assert!(!drain(&mut h.events).contains(&UiEvent::ShowErrorWindow));
        // The retry tick only restarts a backend with a key accepted earlier;
        // at startup there is none, so the attempt is deferred, not made.
        assert!(h.supervisor.starts().is_empty());
        assert_eq!(h.probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_countdown_wraps_after_reaching_zero() {
        let mut h = launch(false, NO_UPDATE);

        let mut reported = Vec::new();
        for _ in 0..13 {
            if let UiEvent::UpdateRetryInfo { countdown, .. } =
                wait_for(&mut h.events, |e| matches!(e, UiEvent::UpdateRetryInfo { .. })).await
            {
                reported.push(countdown);
            }
        }
        assert_eq!(reported, vec![10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 10, 9]);
        assert!(reported.iter().all(|c| *c <= 10));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_then_online_reaches_ready_and_clears_error_window() {
        let mut h = launch(false, NO_UPDATE);
        wait_for(&mut h.events, |e| matches!(e, UiEvent::UpdateRetryInfo { .. })).await;

        h.probe.set_online(true);
        wait_for(&mut h.events, |e| *e == UiEvent::ShowMainWindow).await;
        wait_for(&mut h.events, |e| *e == UiEvent::ShowTray).await;
        wait_for(&mut h.events, |e| *e == UiEvent::CloseErrorWindow).await;
    }

    #[tokio::test(start_paused = true)]
    async fn online_without_update_reaches_ready() {
        let mut h = launch(true, NO_UPDATE);

        wait_for(&mut h.events, |e| *e == UiEvent::ShowMainWindow).await;
        wait_for(&mut h.events, |e| *e == UiEvent::ShowTray).await;

        let rest = drain(&mut h.events);
        assert!(
            !rest
                .iter()
                .any(|e| matches!(e, UiEvent::ShowUpdateWindow { .. }))
        );
        assert!(!rest.contains(&UiEvent::ShowErrorWindow));
    }

    #[tokio::test(start_paused = true)]
    async fn update_available_opens_update_window_only() {
        let mut h = launch(true, UPDATE);

        let shown = wait_for(&mut h.events, |e| {
            matches!(e, UiEvent::ShowUpdateWindow { .. })
        })
        .await;
        assert_eq!(
            shown,
            UiEvent::ShowUpdateWindow {
                download_url: "https://dl.example.com/2.0.0".into()
            }
        );
        let url = wait_for(&mut h.events, |e| matches!(e, UiEvent::SetDownloadUrl(_))).await;
        assert_eq!(
            url,
            UiEvent::SetDownloadUrl("https://dl.example.com/2.0.0".into())
        );

        // No monitor: the probe is not polled again.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.probe.calls(), 1);
        assert!(!drain(&mut h.events).contains(&UiEvent::ShowMainWindow));
    }

    #[tokio::test(start_paused = true)]
    async fn losing_and_regaining_connectivity_while_ready() {
        let mut h = launch(true, NO_UPDATE);
        wait_for(&mut h.events, |e| *e == UiEvent::ShowTray).await;

        h.probe.set_online(false);
        wait_for(&mut h.events, |e| *e == UiEvent::CloseMainWindow).await;
        wait_for(&mut h.events, |e| *e == UiEvent::ShowErrorWindow).await;

        h.probe.set_online(true);
        wait_for(&mut h.events, |e| *e == UiEvent::ShowMainWindow).await;
        wait_for(&mut h.events, |e| *e == UiEvent::CloseErrorWindow).await;
        wait_for(&mut h.events, |e| matches!(e, UiEvent::LogMessage(_))).await;

        assert!(!h.task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_polls_every_interval() {
        let mut h = launch(true, NO_UPDATE);
        wait_for(&mut h.events, |e| *e == UiEvent::ShowTray).await;
        assert_eq!(h.probe.calls(), 1);

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(h.probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_rejects_invalid_keys_without_starting_backend() {
        let h = launch(true, NO_UPDATE);

        for value in [json!(""), json!("   "), json!(null), json!(7), json!(["k"]), json!({})] {
            let result = h.gateway.connect(value).await;
            assert!(!result.success);
            assert_eq!(result.message.as_deref(), Some("Invalid machine key"));
        }
        assert!(h.supervisor.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_starts_backend_with_key() {
        let mut h = launch(true, NO_UPDATE);

        let result = h.gateway.connect(json!("mk-0001")).await;
        assert!(result.success);
        assert_eq!(result.message.as_deref(), Some("Connected successfully"));
        assert_eq!(h.supervisor.starts(), vec!["mk-0001".to_string()]);
        wait_for(&mut h.events, |e| {
            *e == UiEvent::ConnectionStatus(BackendStatus::Connected)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_rejected_while_backend_runs() {
        let h = launch(true, NO_UPDATE);

        assert!(h.gateway.connect(json!("mk-0001")).await.success);
        let second = h.gateway.connect(json!("mk-0002")).await;
        assert!(!second.success);
        assert_eq!(h.supervisor.starts().len(), 1);
        assert_eq!(h.supervisor.running(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reports_missing_backend_binary() {
        let supervisor = FakeSupervisor::default();
        supervisor.log.lock().unwrap().missing_binary = true;
        let mut h = launch_with(true, NO_UPDATE, supervisor);

        let result = h.gateway.connect(json!("mk-0001")).await;
        assert!(!result.success);
        let message = result.message.unwrap();
        assert!(message.starts_with("Failed to start backend process"));
        assert!(message.contains("/missing/server.bin"));
        wait_for(&mut h.events, |e| {
            *e == UiEvent::ConnectionStatus(BackendStatus::Error)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn backend_stderr_and_exit_update_connection_status() {
        let mut h = launch(true, NO_UPDATE);
        assert!(h.gateway.connect(json!("mk-0001")).await.success);

        h.backend_tx
            .send(BackendEvent::Stderr {
                run: 1,
                line: "auth failed".into(),
            })
            .unwrap();
        wait_for(&mut h.events, |e| *e == UiEvent::LogMessage("auth failed".into())).await;
        wait_for(&mut h.events, |e| {
            *e == UiEvent::ConnectionStatus(BackendStatus::Error)
        })
        .await;

        h.backend_tx
            .send(BackendEvent::Exited {
                run: 1,
                code: Some(1),
            })
            .unwrap();
        wait_for(&mut h.events, |e| {
            *e == UiEvent::ConnectionStatus(BackendStatus::Disconnected)
        })
        .await;
        assert_eq!(h.supervisor.running(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_of_stale_run_is_ignored() {
        let mut h = launch(true, NO_UPDATE);
        assert!(h.gateway.connect(json!("mk-0001")).await.success);
        assert!(h.gateway.disconnect().await.success);
        assert!(h.gateway.connect(json!("mk-0001")).await.success);
        drain(&mut h.events);

        h.backend_tx
            .send(BackendEvent::Exited { run: 1, code: None })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.supervisor.running(), Some(2));
        assert!(
            !drain(&mut h.events)
                .contains(&UiEvent::ConnectionStatus(BackendStatus::Disconnected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn offline_tick_restarts_backend_with_last_key_only_when_stopped() {
        let mut h = launch(false, NO_UPDATE);
        wait_for(&mut h.events, |e| matches!(e, UiEvent::UpdateRetryInfo { .. })).await;

        assert!(h.gateway.connect(json!("mk-offline")).await.success);

        // Still running at the next tick: no second process.
        wait_for(&mut h.events, |e| matches!(e, UiEvent::UpdateRetryInfo { .. })).await;
        assert_eq!(h.supervisor.starts().len(), 1);

        h.backend_tx
            .send(BackendEvent::Exited {
                run: 1,
                code: Some(0),
            })
            .unwrap();
        wait_for(&mut h.events, |e| {
            *e == UiEvent::ConnectionStatus(BackendStatus::Disconnected)
        })
        .await;

        wait_for(&mut h.events, |e| matches!(e, UiEvent::UpdateRetryInfo { .. })).await;
        assert_eq!(
            h.supervisor.starts(),
            vec!["mk-offline".to_string(), "mk-offline".to_string()]
        );
        assert_eq!(h.supervisor.running(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_offline_survives_retry_ticks() {
        let mut h = launch(false, NO_UPDATE);
        wait_for(&mut h.events, |e| matches!(e, UiEvent::UpdateRetryInfo { .. })).await;

        assert!(h.gateway.connect(json!("mk-offline")).await.success);
        assert!(h.gateway.disconnect().await.success);
        assert_eq!(h.supervisor.running(), None);

        for _ in 0..2 {
            wait_for(&mut h.events, |e| matches!(e, UiEvent::UpdateRetryInfo { .. })).await;
        }
        assert_eq!(h.supervisor.starts(), vec!["mk-offline".to_string()]);
        assert_eq!(h.supervisor.running(), None);
        assert!(
            !drain(&mut h.events)
                .contains(&UiEvent::ConnectionStatus(BackendStatus::Connected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tray_disconnect_stops_backend_and_keeps_running() {
        let mut h = launch(true, NO_UPDATE);
        assert!(h.gateway.connect(json!("mk-0001")).await.success);

        assert!(h.gateway.tray(TrayAction::Disconnect).await);
        wait_for(&mut h.events, |e| {
            *e == UiEvent::ConnectionStatus(BackendStatus::Disconnected)
        })
        .await;
        assert_eq!(h.supervisor.running(), None);
        assert_eq!(h.supervisor.stops(), 1);
        assert!(!h.task.is_finished());

        // A fresh connect works after a tray disconnect.
        assert!(h.gateway.connect(json!("mk-0002")).await.success);
        assert_eq!(h.supervisor.running(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_served_while_update_check_runs() {
        let updates = FakeUpdates {
            body: UPDATE,
            delay: Duration::from_secs(60),
        };
        let mut h = launch_parts(true, updates, FakeSupervisor::default());

        let started = Instant::now();
        assert!(h.gateway.connect(json!("mk-0001")).await.success);
        assert!(started.elapsed() < Duration::from_secs(60));

        wait_for(&mut h.events, |e| {
            matches!(e, UiEvent::ShowUpdateWindow { .. })
        })
        .await;
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn quit_during_update_check_ends_loop() {
        let updates = FakeUpdates {
            body: UPDATE,
            delay: Duration::from_secs(600),
        };
        let h = launch_parts(true, updates, FakeSupervisor::default());

        assert!(h.gateway.tray(TrayAction::Quit).await);
        assert_eq!(h.task.await.unwrap(), ExitReason::Quit { code: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let h = launch(true, NO_UPDATE);
        assert!(h.gateway.connect(json!("mk-0001")).await.success);

        assert!(h.gateway.disconnect().await.success);
        assert_eq!(h.supervisor.running(), None);
        assert!(h.gateway.disconnect().await.success);
        assert_eq!(h.supervisor.running(), None);
        assert_eq!(h.supervisor.stops(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tray_quit_stops_backend_and_ends_loop() {
        let mut h = launch(true, NO_UPDATE);
        assert!(h.gateway.connect(json!("mk-0001")).await.success);

        assert!(h.gateway.tray(TrayAction::Quit).await);
        wait_for(&mut h.events, |e| *e == UiEvent::Quit { code: 0 }).await;

        let reason = h.task.await.unwrap();
        assert_eq!(reason, ExitReason::Quit { code: 0 });
        assert_eq!(h.supervisor.running(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_command_replies_then_shuts_down() {
        let h = launch(true, NO_UPDATE);
        assert!(h.gateway.connect(json!("mk-0001")).await.success);

        let result = h.gateway.exit().await;
        assert!(result.success);
        assert_eq!(h.task.await.unwrap(), ExitReason::Exit);
        assert_eq!(h.supervisor.running(), None);
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test(start_paused = true)]
    async fn closing_all_windows_quits() {
        let h = launch(true, NO_UPDATE);
        assert!(h.gateway.windows_closed().await);
        assert_eq!(h.task.await.unwrap(), ExitReason::Quit { code: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_gateway_stops_backend() {
        let h = launch(true, NO_UPDATE);
        assert!(h.gateway.connect(json!("mk-0001")).await.success);

        let Harness {
            gateway,
            supervisor,
            task,
            ..
        } = h;
        drop(gateway);

        assert_eq!(task.await.unwrap(), ExitReason::GatewayClosed);
        assert_eq!(supervisor.running(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn open_external_url_only_allows_http() {
        let h = launch(true, NO_UPDATE);

        assert!(h.gateway.open_external_url("https://example.com/dl").await);
        assert!(!h.gateway.open_external_url("file:///etc/passwd").await);
        assert!(!h.gateway.open_external_url("").await);
        assert_eq!(
            h.opener.opened.lock().unwrap().clone(),
            vec!["https://example.com/dl".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tray_open_reshows_main_window() {
        let mut h = launch(true, NO_UPDATE);
        wait_for(&mut h.events, |e| *e == UiEvent::ShowTray).await;

        assert!(h.gateway.tray(TrayAction::Open).await);
        wait_for(&mut h.events, |e| *e == UiEvent::ShowMainWindow).await;
    }
}
