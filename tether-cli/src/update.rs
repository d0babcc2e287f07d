use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use tether_core::manifest::{ManifestError, VersionManifest};
use tether_core::model::VersionInfo;
use tether_core::ports::UpdateChecker;

#[derive(Debug)]
pub enum UpdateError {
    NotConfigured,
    Http(reqwest::Error),
    Manifest(ManifestError),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "no manifest url configured"),
            Self::Http(e) => write!(f, "request failed: {}", e),
            Self::Manifest(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        UpdateError::Http(e)
    }
}

impl From<ManifestError> for UpdateError {
    fn from(e: ManifestError) -> Self {
        UpdateError::Manifest(e)
    }
}

/// Fetches the version manifest over HTTP(S).
pub struct HttpUpdateChecker {
    client: Option<reqwest::Client>,
    url: Option<String>,
}

impl HttpUpdateChecker {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client: Some(client),
            url,
        })
    }

    /// A checker that never finds an update.
    pub fn disabled() -> Self {
        Self {
            client: None,
            url: None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub async fn fetch_manifest(&self) -> Result<VersionManifest, UpdateError> {
        let (Some(client), Some(url)) = (&self.client, &self.url) else {
            return Err(UpdateError::NotConfigured);
        };
        let body = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(VersionManifest::parse(&body)?)
    }
}

#[async_trait]
impl UpdateChecker for HttpUpdateChecker {
    async fn check_for_update(&self, current_version: &str) -> Option<VersionInfo> {
        match self.fetch_manifest().await {
            Ok(manifest) => manifest.update_for(current_version),
            Err(UpdateError::NotConfigured) => {
                debug!("update check skipped: no manifest url configured");
                None
            }
            Err(e) => {
                warn!("update check failed: {}", e);
                None
            }
        }
    }
}
