//! Terminal presentation surface.
//!
//! Renders controller events as lines on stdout and turns typed lines on
//! stdin into gateway calls, standing in for the desktop windows and tray.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use tether_core::gateway::{CommandResult, EventEnvelope, Gateway, UiEvent};
use tether_core::tray::{TRAY_TOOLTIP, TrayAction, action_from_menu_id};

pub const HELP: &str = "\
commands:
  connect <key>        start the backend with a machine key
  disconnect           stop the backend
  exit                 disconnect and quit
  open <url>           open an http(s) link in the browser
  tray <open|disconnect|quit>
  close-all            close every window
  help                 show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Connect(Option<String>),
    Disconnect,
    Exit,
    Open(String),
    Tray(TrayAction),
    CloseAll,
    Help,
    Empty,
    Unknown(String),
}

pub fn parse_line(line: &str) -> ConsoleInput {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleInput::Empty;
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb {
        "connect" => ConsoleInput::Connect((!rest.is_empty()).then(|| rest.to_string())),
        "disconnect" => ConsoleInput::Disconnect,
        "exit" => ConsoleInput::Exit,
        "open" if !rest.is_empty() => ConsoleInput::Open(rest.to_string()),
        "tray" => match parse_tray(rest) {
            Some(action) => ConsoleInput::Tray(action),
            None => ConsoleInput::Unknown(line.to_string()),
        },
        "close-all" => ConsoleInput::CloseAll,
        "help" | "?" => ConsoleInput::Help,
        _ => ConsoleInput::Unknown(line.to_string()),
    }
}

/// Accepts either the menu label or the menu id.
fn parse_tray(arg: &str) -> Option<TrayAction> {
    match arg.to_ascii_lowercase().as_str() {
        "open" => Some(TrayAction::Open),
        "disconnect" => Some(TrayAction::Disconnect),
        "quit" => Some(TrayAction::Quit),
        other => action_from_menu_id(other),
    }
}

pub fn render(event: &UiEvent) -> String {
    match event {
        UiEvent::ConnectionStatus(status) => format!("[status] {}", status.as_str()),
        UiEvent::LogMessage(line) => format!("[log] {}", line),
        UiEvent::UpdateRetryInfo { attempt, countdown } => {
            format!("[offline] attempt {}, retrying in {}s", attempt, countdown)
        }
        UiEvent::SetDownloadUrl(url) => format!("[update] download: {}", url),
        UiEvent::ShowMainWindow => "[window] main shown".to_string(),
        UiEvent::CloseMainWindow => "[window] main closed".to_string(),
        UiEvent::ShowErrorWindow => "[window] no internet connection".to_string(),
        UiEvent::CloseErrorWindow => "[window] error closed".to_string(),
        UiEvent::ShowUpdateWindow { download_url } => {
            format!("[window] update required: {}", download_url)
        }
        UiEvent::ShowTray => {
            let entries: Vec<_> = tether_core::tray::TRAY_MENU
                .iter()
                .map(|action| action.label())
                .collect();
            format!("[tray] {} ({})", TRAY_TOOLTIP, entries.join(" / "))
        }
        UiEvent::Quit { code } => format!("[quit] exit code {}", code),
    }
}

fn render_result(result: &CommandResult) -> String {
    match (&result.message, result.success) {
        (Some(message), true) => format!("ok: {}", message),
        (None, true) => "ok".to_string(),
        (Some(message), false) => format!("error: {}", message),
        (None, false) => "error".to_string(),
    }
}

pub struct ConsoleGateway {
    gateway: Gateway,
    json: bool,
}

impl ConsoleGateway {
    pub fn new(gateway: Gateway, json: bool) -> Self {
        Self { gateway, json }
    }

    fn format(&self, event: &UiEvent) -> String {
        if self.json {
            serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
        } else {
            render(event)
        }
    }

    /// Print events until the controller goes away or quits.
    pub async fn render_events(&self, mut events: broadcast::Receiver<EventEnvelope>) {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    println!("{}", self.format(&envelope.event));
                    if matches!(envelope.event, UiEvent::Quit { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("console fell behind, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Returns the text to print for one input line.
    pub async fn dispatch(&self, input: ConsoleInput) -> Option<String> {
        match input {
            ConsoleInput::Connect(key) => {
                let value = key.map(Value::String).unwrap_or(Value::Null);
                Some(render_result(&self.gateway.connect(value).await))
            }
            ConsoleInput::Disconnect => Some(render_result(&self.gateway.disconnect().await)),
            ConsoleInput::Exit => Some(render_result(&self.gateway.exit().await)),
            ConsoleInput::Open(url) => {
                let opened = self.gateway.open_external_url(url.clone()).await;
                Some(if opened {
                    format!("opened {}", url)
                } else {
                    format!("could not open {}", url)
                })
            }
            ConsoleInput::Tray(action) => {
                self.gateway.tray(action).await;
                None
            }
            ConsoleInput::CloseAll => {
                self.gateway.windows_closed().await;
                None
            }
            ConsoleInput::Help => Some(HELP.to_string()),
            ConsoleInput::Empty => None,
            ConsoleInput::Unknown(line) => Some(format!("unknown command: {} (try 'help')", line)),
        }
    }

    /// Read commands from stdin until EOF.
    pub async fn read_input(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(output) = self.dispatch(parse_line(&line)).await {
                        println!("{}", output);
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, console input stopped");
                    break;
                }
                Err(e) => {
                    warn!("failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }
}
