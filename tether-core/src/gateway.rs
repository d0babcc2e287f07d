//! Message boundary between the launcher core and the presentation layer.
//!
//! Commands flow in over an `mpsc` channel, each with a `oneshot` reply where
//! the UI expects an answer. Status pushes and window directives flow out over
//! a `broadcast` channel so any number of views can subscribe.

use std::time::SystemTime;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::model::BackendStatus;
use crate::tray::TrayAction;

/// Result returned for `connect`, `disconnect` and `exit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Requests from the UI into the controller.
#[derive(Debug)]
pub enum UiCommand {
    Connect {
        /// Raw value from the UI; validated by the controller
        machine_key: Value,
        reply: oneshot::Sender<CommandResult>,
    },
    Disconnect {
        reply: oneshot::Sender<CommandResult>,
    },
    Exit {
        reply: oneshot::Sender<CommandResult>,
    },
    OpenExternalUrl {
        url: String,
        reply: oneshot::Sender<bool>,
    },
    Tray(TrayAction),
    AllWindowsClosed,
}

/// Pushes from the controller to the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum UiEvent {
    ConnectionStatus(BackendStatus),
    LogMessage(String),
    UpdateRetryInfo { attempt: u64, countdown: u32 },
    SetDownloadUrl(String),
    ShowMainWindow,
    CloseMainWindow,
    ShowErrorWindow,
    CloseErrorWindow,
    ShowUpdateWindow { download_url: String },
    ShowTray,
    Quit { code: i32 },
}

#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub id: u64,
    pub at: SystemTime,
    pub event: UiEvent,
}

/// Sending half of the event stream, used by the controller.
pub struct EventPublisher {
    tx: broadcast::Sender<EventEnvelope>,
    next_id: u64,
}

impl EventPublisher {
    pub fn emit(&mut self, event: UiEvent) {
        self.next_id += 1;
        // No subscribers is fine: nothing is rendering yet.
        let _ = self.tx.send(EventEnvelope {
            id: self.next_id,
            at: SystemTime::now(),
            event,
        });
    }
}

/// Cloneable handle the presentation layer uses to talk to the controller.
#[derive(Clone)]
pub struct Gateway {
    commands: mpsc::Sender<UiCommand>,
    events: broadcast::Sender<EventEnvelope>,
}

impl Gateway {
    /// Create the gateway pair: the handle for the UI, plus the publisher and
    /// command receiver the controller runs on.
    pub fn channel(capacity: usize) -> (Self, EventPublisher, mpsc::Receiver<UiCommand>) {
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, _) = broadcast::channel(capacity);
        let publisher = EventPublisher {
            tx: event_tx.clone(),
            next_id: 0,
        };
        (
            Self {
                commands: command_tx,
                events: event_tx,
            },
            publisher,
            command_rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub async fn connect(&self, machine_key: Value) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        self.request(UiCommand::Connect { machine_key, reply }, rx).await
    }

    pub async fn disconnect(&self) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        self.request(UiCommand::Disconnect { reply }, rx).await
    }

    pub async fn exit(&self) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        self.request(UiCommand::Exit { reply }, rx).await
    }

    pub async fn open_external_url(&self, url: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = UiCommand::OpenExternalUrl {
            url: url.into(),
            reply,
        };
        if self.commands.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn tray(&self, action: TrayAction) -> bool {
        self.commands.send(UiCommand::Tray(action)).await.is_ok()
    }

    pub async fn windows_closed(&self) -> bool {
        self.commands.send(UiCommand::AllWindowsClosed).await.is_ok()
    }

    async fn request(
        &self,
        cmd: UiCommand,
        rx: oneshot::Receiver<CommandResult>,
    ) -> CommandResult {
        if self.commands.send(cmd).await.is_err() {
            return CommandResult::failure("launcher is shutting down");
        }
        rx.await
            .unwrap_or_else(|_| CommandResult::failure("launcher is shutting down"))
    }
}
