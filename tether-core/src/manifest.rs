//! Remote version manifest: `{ "latest": "<version>", "download_url": "<url>" }`.

use std::fmt;

use serde::Deserialize;

use crate::model::VersionInfo;

#[derive(Clone, Debug, Deserialize)]
pub struct VersionManifest {
    pub latest: String,
    pub download_url: String,
}

#[derive(Debug)]
pub enum ManifestError {
    Json(serde_json::Error),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid version manifest: {}", e),
        }
    }
}

impl std::error::Error for ManifestError {}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        ManifestError::Json(e)
    }
}

impl VersionManifest {
    pub fn parse(body: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Plain string inequality, no semver ordering: any different
    /// `latest` counts as an update.
    pub fn update_for(&self, current_version: &str) -> Option<VersionInfo> {
        if self.latest == current_version {
            return None;
        }
        Some(VersionInfo {
            latest_version: self.latest.clone(),
            download_url: self.download_url.clone(),
        })
    }
}

/// Parse a manifest body and compare it to the running version.
pub fn evaluate(body: &str, current_version: &str) -> Result<Option<VersionInfo>, ManifestError> {
    Ok(VersionManifest::parse(body)?.update_for(current_version))
}
