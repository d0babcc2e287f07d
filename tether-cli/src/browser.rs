use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use tracing::{debug, info};
use url::Url;

use tether_core::ports::UrlOpener;

/// Opens links with the platform's default handler.
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &Url) -> Result<(), String> {
        info!(url = %url, "opening external url");
        open_with_system_browser(url.as_str())
    }
}

/// Spawn the opener and reap it on a helper thread so it does not linger as
/// a zombie.
fn detached(mut cmd: Command, program: &str) -> Result<JoinHandle<Option<ExitStatus>>, String> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("Failed to run '{}': {}", program, e))?;

    let owned_program = program.to_string();
    std::thread::Builder::new()
        .name("url-opener-reaper".into())
        .spawn(move || match child.wait() {
            Ok(status) => {
                debug!(program = %owned_program, ?status, "url opener exited");
                Some(status)
            }
            Err(e) => {
                debug!(program = %owned_program, "failed to wait on url opener: {}", e);
                None
            }
        })
        .map_err(|e| format!("Failed to watch '{}': {}", program, e))
}

#[cfg(target_os = "macos")]
fn open_with_system_browser(url: &str) -> Result<(), String> {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    detached(cmd, "open").map(|_| ())
}

#[cfg(target_os = "windows")]
fn open_with_system_browser(url: &str) -> Result<(), String> {
    let mut cmd = Command::new("rundll32");
    cmd.args(["url.dll,FileProtocolHandler", url]);
    detached(cmd, "rundll32").map(|_| ())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn open_with_system_browser(url: &str) -> Result<(), String> {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(url);
    detached(cmd, "xdg-open").map(|_| ())
}

#[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
fn open_with_system_browser(_url: &str) -> Result<(), String> {
    Err("Opening external URLs is not supported on this platform.".to_string())
}
