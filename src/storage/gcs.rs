//! Cloud Storage JSON API client.

use reqwest::{StatusCode, Url};

use crate::auth::TokenSource;
use crate::compute::provider_message;

use super::{ObjectStore, StorageError, StorageFuture};

/// Base URL for object metadata and media downloads.
pub const STORAGE_API_BASE: &str = "https://storage.googleapis.com/storage/v1";
/// Base URL for media uploads.
pub const STORAGE_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Production [`ObjectStore`] backed by Cloud Storage.
#[derive(Clone, Debug)]
pub struct GcsClient {
    http: reqwest::Client,
    tokens: TokenSource,
    api_base: String,
    upload_base: String,
}

impl GcsClient {
    /// Creates a client against the public endpoints.
    #[must_use]
    pub fn new(http: reqwest::Client, tokens: TokenSource) -> Self {
        Self {
            http,
            tokens,
            api_base: STORAGE_API_BASE.to_owned(),
            upload_base: STORAGE_UPLOAD_BASE.to_owned(),
        }
    }

    fn upload_url(&self, bucket: &str, key: &str) -> Result<Url, StorageError> {
        let mut url = parse_base(&self.upload_base)?;
        url.path_segments_mut()
            .map_err(|()| StorageError::Transport(format!("invalid base URL {}", self.upload_base)))?
            .extend(["b", bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);
        Ok(url)
    }

    fn download_url(&self, bucket: &str, key: &str) -> Result<Url, StorageError> {
        let mut url = parse_base(&self.api_base)?;
        // Object names may contain `/`; pushing the key as one segment
        // percent-encodes it as the API expects.
        url.path_segments_mut()
            .map_err(|()| StorageError::Transport(format!("invalid base URL {}", self.api_base)))?
            .extend(["b", bucket, "o", key]);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }

    async fn bearer(&self) -> Result<String, StorageError> {
        self.tokens
            .token()
            .await
            .map_err(|err| StorageError::Auth(err.to_string()))
    }
}

fn parse_base(base: &str) -> Result<Url, StorageError> {
    Url::parse(base).map_err(|err| StorageError::Transport(format!("invalid base URL {base}: {err}")))
}

fn status_error(status: StatusCode, bucket: &str, key: &str, body: &str) -> StorageError {
    match status {
        StatusCode::NOT_FOUND => StorageError::NotFound {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::Auth(provider_message(body))
        }
        other => StorageError::Api {
            status: other.as_u16(),
            message: provider_message(body),
        },
    }
}

impl ObjectStore for GcsClient {
    fn write_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let url = self.upload_url(bucket, key)?;
            let token = self.bearer().await?;
            let size = bytes.len();
            let response = self
                .http
                .post(url)
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_TYPE, ZIP_CONTENT_TYPE)
                .body(bytes)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, bucket, key, &body));
            }
            tracing::debug!(bucket, key, size, "uploaded object");
            Ok(())
        })
    }

    fn read_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let url = self.download_url(bucket, key)?;
            let token = self.bearer().await?;
            let response = self.http.get(url).bearer_auth(token).send().await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, bucket, key, &body));
            }
            let bytes = response.bytes().await?;
            tracing::debug!(bucket, key, size = bytes.len(), "downloaded object");
            Ok(bytes.to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GcsClient {
        GcsClient::new(
            reqwest::Client::new(),
            TokenSource::from_config(Some("token"), reqwest::Client::new()),
        )
    }

    #[test]
    fn upload_url_uses_media_upload() {
        let url = client()
            .upload_url("cloudbuild-windows-proj", "cloudbuild-windows-2024/workspace.zip")
            .expect("upload url");

        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/upload/storage/v1/b/cloudbuild-windows-proj/o?uploadType=media&name=cloudbuild-windows-2024%2Fworkspace.zip"
        );
    }

    #[test]
    fn download_url_encodes_key_as_single_segment() {
        let url = client()
            .download_url("bucket", "prefix/results.zip")
            .expect("download url");

        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bucket/o/prefix%2Fresults.zip?alt=media"
        );
    }

    #[test]
    fn not_found_names_bucket_and_key() {
        let err = status_error(StatusCode::NOT_FOUND, "bucket", "key", "");
        assert_eq!(err.to_string(), "object gs://bucket/key not found");
    }
}
