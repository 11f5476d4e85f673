//! OAuth bearer tokens for the Compute Engine and Cloud Storage clients.
//!
//! Builds normally run on Google infrastructure, so the default source is the
//! instance metadata server. A static token (for example from
//! `gcloud auth print-access-token`) can be supplied instead through
//! `WINBUILDER_ACCESS_TOKEN`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::compute::ComputeError;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR_VALUE: &str = "Google";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Clone, Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Supplies bearer tokens to the REST clients.
#[derive(Clone, Debug)]
pub struct TokenSource {
    kind: SourceKind,
}

#[derive(Clone, Debug)]
enum SourceKind {
    Static(String),
    Metadata {
        http: reqwest::Client,
        cache: Arc<Mutex<Option<CachedToken>>>,
    },
}

impl TokenSource {
    /// Uses `token` when present, otherwise the metadata server.
    #[must_use]
    pub fn from_config(token: Option<&str>, http: reqwest::Client) -> Self {
        let kind = token
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(
                || SourceKind::Metadata {
                    http,
                    cache: Arc::new(Mutex::new(None)),
                },
                |value| SourceKind::Static(value.to_owned()),
            );
        Self { kind }
    }

    /// Returns `true` when the token was supplied by configuration.
    #[must_use]
    pub const fn is_static(&self) -> bool {
        matches!(self.kind, SourceKind::Static(_))
    }

    /// Returns a bearer token, refreshing it when needed.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Auth`] when the metadata server cannot be
    /// reached or answers with an unusable payload.
    pub async fn token(&self) -> Result<String, ComputeError> {
        match &self.kind {
            SourceKind::Static(value) => Ok(value.clone()),
            SourceKind::Metadata { http, cache } => {
                let mut slot = cache.lock().await;
                if let Some(cached) = slot.as_ref()
                    && Instant::now() < cached.refresh_at
                {
                    return Ok(cached.value.clone());
                }

                let fresh = fetch_metadata_token(http).await?;
                let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(REFRESH_MARGIN);
                *slot = Some(CachedToken {
                    value: fresh.access_token.clone(),
                    refresh_at: Instant::now() + lifetime,
                });
                tracing::debug!(expires_in = fresh.expires_in, "refreshed metadata access token");
                Ok(fresh.access_token)
            }
        }
    }
}

async fn fetch_metadata_token(http: &reqwest::Client) -> Result<MetadataToken, ComputeError> {
    let response = http
        .get(METADATA_TOKEN_URL)
        .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE)
        .send()
        .await
        .map_err(|err| ComputeError::Auth(format!("metadata server unreachable: {err}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ComputeError::Auth(format!(
            "metadata server returned {status}"
        )));
    }

    response
        .json::<MetadataToken>()
        .await
        .map_err(|err| ComputeError::Auth(format!("invalid metadata token payload: {err}")))
}
