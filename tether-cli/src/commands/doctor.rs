use std::path::Path;

use tether_core::ports::ConnectivityProbe;

use crate::LaunchEnv;
use crate::probe::DnsProbe;
use crate::update::{HttpUpdateChecker, UpdateError};

#[derive(Debug)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub hint: Option<String>,
}

impl Check {
    fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            hint: None,
        }
    }

    fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            hint: None,
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

pub async fn run_doctor(env: &LaunchEnv) -> Result<(), String> {
    println!("Tether Doctor\n");

    match &env.config_path {
        Some(path) => println!("Configuration: {}", path.display()),
        None => println!("Configuration: defaults (no tether.yaml found)"),
    }
    println!("Version: {}\n", env.config.current_version());

    let mut checks: Vec<Check> = Vec::new();

    println!("Backend:");
    let backend = vec![
        Check::ok("layout", env.layout.as_str()),
        check_backend(&env.backend_path),
    ];
    for check in &backend {
        print_check(check);
    }
    checks.extend(backend);
    println!();

    println!("Network:");
    let network = vec![check_connectivity(env).await, check_updates(env).await];
    for check in &network {
        print_check(check);
    }
    checks.extend(network);
    println!();

    let failed: Vec<_> = checks.iter().filter(|c| !c.passed).collect();
    if failed.is_empty() {
        println!("All checks passed!");
        return Ok(());
    }

    println!("Issues found:");
    for check in &failed {
        println!("  - {}: {}", check.name, check.message);
        if let Some(hint) = &check.hint {
            println!("    Hint: {}", hint);
        }
    }
    Err(format!("{} check(s) failed", failed.len()))
}

fn print_check(check: &Check) {
    let icon = if check.passed { "✓" } else { "✗" };
    let color = if check.passed { "\x1b[32m" } else { "\x1b[31m" };
    let reset = "\x1b[0m";

    println!(
        "  {}{}{} {}: {}",
        color, icon, reset, check.name, check.message
    );

    if let Some(hint) = &check.hint {
        println!("    └─ {}", hint);
    }
}

fn check_backend(path: &Path) -> Check {
    if !path.is_file() {
        return Check::fail("executable", format!("not found at {}", path.display())).with_hint(
            "Set backend.path in tether.yaml or TETHER_PACKAGED to pick the layout",
        );
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        match std::fs::metadata(path) {
            Ok(meta) if meta.permissions().mode() & 0o111 == 0 => {
                return Check::fail("executable", format!("{} is not executable", path.display()))
                    .with_hint(format!("chmod +x {}", path.display()));
            }
            Err(e) => {
                return Check::fail("executable", format!("{}: {}", path.display(), e));
            }
            Ok(_) => {}
        }
    }

    Check::ok("executable", path.display().to_string())
}

async fn check_connectivity(env: &LaunchEnv) -> Check {
    let probe = DnsProbe::from_config(&env.config);
    if probe.is_online().await {
        Check::ok("connectivity", format!("{} resolves", probe.host()))
    } else {
        Check::fail("connectivity", format!("{} does not resolve", probe.host()))
            .with_hint("The launcher will start offline and keep retrying")
    }
}

async fn check_updates(env: &LaunchEnv) -> Check {
    let Some(url) = env.config.manifest_url() else {
        return Check::ok("updates", "disabled");
    };

    let checker = match HttpUpdateChecker::new(Some(url.to_string()), env.config.update_timeout()) {
        Ok(checker) => checker,
        Err(e) => return Check::fail("updates", format!("http client: {}", e)),
    };

    let current = env.config.current_version();
    match checker.fetch_manifest().await {
        Ok(manifest) if manifest.latest == current => {
            Check::ok("updates", format!("up to date ({})", current))
        }
        Ok(manifest) => Check::ok(
            "updates",
            format!("{} available (running {})", manifest.latest, current),
        ),
        Err(UpdateError::NotConfigured) => Check::ok("updates", "disabled"),
        Err(e) => Check::fail("updates", e.to_string())
            .with_hint(format!("Check updates.manifest_url ({})", url)),
    }
}
