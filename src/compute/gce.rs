//! Compute Engine REST client built on `reqwest`.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::auth::TokenSource;

use super::{
    ComputeApi, ComputeError, ComputeFuture, ComputeScope, FirewallRule, Instance, InstanceSpec,
    Metadata, Operation, SerialPortOutput,
};

/// Base URL of the Compute Engine v1 API.
pub const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";

/// Production [`ComputeApi`] talking to Compute Engine over HTTPS.
#[derive(Clone, Debug)]
pub struct GceClient {
    http: reqwest::Client,
    tokens: TokenSource,
    base_url: String,
}

impl GceClient {
    /// Creates a client against the public endpoint.
    #[must_use]
    pub fn new(http: reqwest::Client, tokens: TokenSource) -> Self {
        Self::with_base_url(http, tokens, COMPUTE_API_BASE)
    }

    /// Creates a client against an alternative endpoint.
    #[must_use]
    pub fn with_base_url(
        http: reqwest::Client,
        tokens: TokenSource,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn zone_url(&self, scope: &ComputeScope, suffix: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{suffix}",
            self.base_url, scope.project, scope.zone
        )
    }

    fn global_url(&self, scope: &ComputeScope, suffix: &str) -> String {
        format!("{}/projects/{}/global/{suffix}", self.base_url, scope.project)
    }

    async fn authorised(&self, method: Method, url: &str) -> Result<RequestBuilder, ComputeError> {
        let token = self.tokens.token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        resource: &str,
    ) -> Result<T, ComputeError> {
        let response = self.authorised(Method::GET, url).await?.send().await?;
        decode(response, resource).await
    }

    async fn send_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        resource: &str,
    ) -> Result<T, ComputeError> {
        let mut request = self.authorised(method, url).await?;
        if let Some(payload) = body {
            request = request.json(payload);
        }
        let response = request.send().await?;
        decode(response, resource).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response, resource: &str) -> Result<T, ComputeError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| ComputeError::Decode(err.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, resource, &body))
}

pub(crate) fn status_error(status: StatusCode, resource: &str, body: &str) -> ComputeError {
    match status {
        StatusCode::NOT_FOUND => ComputeError::NotFound {
            resource: resource.to_owned(),
        },
        StatusCode::CONFLICT => ComputeError::AlreadyExists {
            resource: resource.to_owned(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ComputeError::Auth(format!(
            "{resource}: {}",
            provider_message(body)
        )),
        other => ComputeError::Api {
            status: other.as_u16(),
            message: provider_message(body),
        },
    }
}

/// Extracts `error.message` from a Google API error body, falling back to the
/// raw body.
pub(crate) fn provider_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| body.trim().to_owned())
}

impl ComputeApi for GceClient {
    fn insert_instance<'a>(
        &'a self,
        scope: &'a ComputeScope,
        spec: &'a InstanceSpec,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let url = self.zone_url(scope, "instances");
            self.send_json(Method::POST, &url, Some(spec), &format!("instance {}", spec.name))
                .await
        })
    }

    fn get_instance<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
    ) -> ComputeFuture<'a, Instance> {
        Box::pin(async move {
            let url = self.zone_url(scope, &format!("instances/{name}"));
            self.get_json(&url, &format!("instance {name}")).await
        })
    }

    fn delete_instance<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let url = self.zone_url(scope, &format!("instances/{name}"));
            self.send_json::<(), _>(Method::DELETE, &url, None, &format!("instance {name}"))
                .await
        })
    }

    fn get_zone_operation<'a>(
        &'a self,
        scope: &'a ComputeScope,
        operation: &'a str,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let url = self.zone_url(scope, &format!("operations/{operation}"));
            self.get_json(&url, &format!("operation {operation}")).await
        })
    }

    fn get_global_operation<'a>(
        &'a self,
        scope: &'a ComputeScope,
        operation: &'a str,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let url = self.global_url(scope, &format!("operations/{operation}"));
            self.get_json(&url, &format!("global operation {operation}"))
                .await
        })
    }

    fn insert_firewall<'a>(
        &'a self,
        scope: &'a ComputeScope,
        rule: &'a FirewallRule,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let url = self.global_url(scope, "firewalls");
            self.send_json(Method::POST, &url, Some(rule), &format!("firewall {}", rule.name))
                .await
        })
    }

    fn set_metadata<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
        metadata: &'a Metadata,
    ) -> ComputeFuture<'a, Operation> {
        Box::pin(async move {
            let url = self.zone_url(scope, &format!("instances/{name}/setMetadata"));
            self.send_json(
                Method::POST,
                &url,
                Some(metadata),
                &format!("instance {name}"),
            )
            .await
        })
    }

    fn serial_port_output<'a>(
        &'a self,
        scope: &'a ComputeScope,
        name: &'a str,
        port: u8,
    ) -> ComputeFuture<'a, String> {
        Box::pin(async move {
            let url = self.zone_url(scope, &format!("instances/{name}/serialPort?port={port}"));
            let output: SerialPortOutput = self
                .get_json(&url, &format!("serial port {port} of {name}"))
                .await?;
            Ok(output.contents)
        })
    }
}
