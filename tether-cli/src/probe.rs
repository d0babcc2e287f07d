use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;

use tether_core::config::LauncherConfig;
use tether_core::ports::ConnectivityProbe;

/// Online means the configured host name resolves within the timeout.
pub struct DnsProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl DnsProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn from_config(config: &LauncherConfig) -> Self {
        Self::new(
            config.connectivity.host.clone(),
            config.connectivity.port,
            config.probe_timeout(),
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl ConnectivityProbe for DnsProbe {
    async fn is_online(&self) -> bool {
        if self.host.trim().is_empty() {
            return false;
        }

        match tokio::time::timeout(self.timeout, lookup_host((self.host.as_str(), self.port))).await
        {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                debug!(host = %self.host, "name resolution failed: {}", e);
                false
            }
            Err(_) => {
                debug!(host = %self.host, "name resolution timed out");
                false
            }
        }
    }
}
