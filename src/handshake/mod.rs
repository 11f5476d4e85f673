//! Admin credential handshake with the Windows guest agent.
//!
//! The builder publishes an ephemeral RSA public key in the `windows-keys`
//! metadata item. The guest agent creates or resets the named account and
//! writes the password, encrypted to that key, to serial port 4. Only a
//! response echoing the exact modulus of the current request is accepted.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::compute::{ComputeApi, Metadata, MetadataItem};
use crate::lifecycle::{InstanceManager, LifecycleError};
use crate::secret::Secret;
use crate::wait::{PollSchedule, WaitError, poll_until};

mod keys;
mod response;

pub use keys::{
    DEFAULT_KEY_BITS, KeyExchangeRequest, KeyPair, NOTIFICATION_EMAIL, REQUEST_TTL_MINUTES,
    encode_exponent, encode_modulus,
};
pub use response::{
    Acceptance, KeyExchangeResponse, accept, correlate, parse_record, scan, split_records,
};

/// Metadata key watched by the guest agent.
pub const WINDOWS_KEYS_METADATA_KEY: &str = "windows-keys";

/// Serial port the guest agent answers on.
pub const CREDENTIAL_SERIAL_PORT: u8 = 4;

const SERIAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A correlated response that could not be turned into a password.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    /// `encryptedPassword` is not valid base64.
    #[error("encrypted password is not valid base64: {0}")]
    Base64(String),
    /// The ciphertext does not decrypt under the request key.
    #[error("failed to decrypt password: {0}")]
    Decrypt(String),
    /// The plaintext is not UTF-8.
    #[error("decrypted password is not valid UTF-8")]
    Utf8,
}

/// Errors raised by a handshake attempt.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HandshakeError {
    /// The keypair could not be generated.
    #[error("failed to generate RSA key: {0}")]
    KeyGeneration(String),
    /// The request could not be encoded.
    #[error("failed to encode key exchange request: {0}")]
    Encode(String),
    /// Publishing the request in metadata failed.
    #[error("failed to publish key exchange request: {0}")]
    Metadata(String),
    /// Reading the serial console failed.
    #[error("failed to read serial console: {0}")]
    Lookup(String),
    /// No matching response arrived in time.
    #[error("no credential response from {instance} within {}s", timeout.as_secs())]
    Timeout {
        /// Instance name.
        instance: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The guest agent answered with an error.
    #[error("guest agent rejected the credential request: {0}")]
    Rejected(String),
    /// The build was cancelled mid-handshake.
    #[error("credential handshake cancelled")]
    Cancelled,
}

impl HandshakeError {
    /// Returns `true` when the attempt may be retried with a fresh key.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Returns `metadata` with `request_json` appended to the `windows-keys` item.
///
/// An existing item gains the request as a new line; otherwise a new item is
/// added. Every other item and the fingerprint are preserved.
#[must_use]
pub fn with_key_request(metadata: &Metadata, request_json: &str) -> Metadata {
    let mut updated = metadata.clone();
    if let Some(item) = updated
        .items
        .iter_mut()
        .find(|item| item.key == WINDOWS_KEYS_METADATA_KEY)
    {
        let merged = item
            .value
            .take()
            .filter(|existing| !existing.trim().is_empty())
            .map_or_else(
                || request_json.to_owned(),
                |existing| format!("{}\n{request_json}", existing.trim_end()),
            );
        item.value = Some(merged);
        return updated;
    }
    updated
        .items
        .push(MetadataItem::new(WINDOWS_KEYS_METADATA_KEY, request_json));
    updated
}

/// Runs single handshake attempts against the instance held by a manager.
#[derive(Debug)]
pub struct CredentialExchange<'a, C> {
    manager: &'a InstanceManager<C>,
    schedule: PollSchedule,
    key_bits: usize,
}

impl<'a, C: ComputeApi> CredentialExchange<'a, C> {
    /// Creates an exchange that waits up to `timeout` for the response.
    #[must_use]
    pub const fn new(manager: &'a InstanceManager<C>, timeout: Duration) -> Self {
        Self {
            manager,
            schedule: PollSchedule::new(SERIAL_POLL_INTERVAL, timeout),
            key_bits: DEFAULT_KEY_BITS,
        }
    }

    /// Overrides the modulus size. Tests use smaller keys to stay fast.
    #[must_use]
    pub const fn with_key_bits(mut self, bits: usize) -> Self {
        self.key_bits = bits;
        self
    }

    /// Publishes a fresh key for `account` and waits for its password.
    ///
    /// Uses the metadata fingerprint from the manager's descriptor, so the
    /// caller should refresh the instance first.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Timeout`] when no matching response arrives,
    /// [`HandshakeError::Rejected`] when the guest reports an error,
    /// [`HandshakeError::Cancelled`] on cancellation, or the error from the
    /// failing metadata or console call.
    pub async fn reset_password(
        &self,
        account: &str,
        cancel: &CancellationToken,
    ) -> Result<Secret, HandshakeError> {
        let bits = self.key_bits;
        let keys = tokio::task::spawn_blocking(move || KeyPair::generate(bits))
            .await
            .map_err(|err| HandshakeError::KeyGeneration(err.to_string()))??;
        let request = KeyExchangeRequest::new(&keys, account, Utc::now());
        let request_json = request.to_json()?;

        let descriptor = self.manager.descriptor();
        let instance = descriptor.name.as_str();
        let metadata = with_key_request(&descriptor.metadata, &request_json);

        tracing::info!(instance, account, "publishing credential request");
        let operation = self
            .manager
            .compute()
            .set_metadata(self.manager.scope(), instance, &metadata)
            .await
            .map_err(|err| HandshakeError::Metadata(err.to_string()))?;
        self.manager
            .await_operation(&operation, cancel)
            .await
            .map_err(|err| match err {
                LifecycleError::Cancelled { .. } => HandshakeError::Cancelled,
                other => HandshakeError::Metadata(other.to_string()),
            })?;

        tracing::info!(instance, "waiting for credential response on serial console");
        let keys_ref = &keys;
        let secret = poll_until(cancel, self.schedule, || {
            async move {
                let contents = self
                    .manager
                    .compute()
                    .serial_port_output(self.manager.scope(), instance, CREDENTIAL_SERIAL_PORT)
                    .await
                    .map_err(|err| HandshakeError::Lookup(err.to_string()))?;
                match scan(&contents, keys_ref) {
                    Some(Acceptance::Password(secret)) => Ok(Some(secret)),
                    Some(Acceptance::Rejected(message)) => Err(HandshakeError::Rejected(message)),
                    None => Ok(None),
                }
            }
        })
        .await
        .map_err(|err| match err {
            WaitError::TimedOut { timeout } => HandshakeError::Timeout {
                instance: instance.to_owned(),
                timeout,
            },
            WaitError::Cancelled => HandshakeError::Cancelled,
            WaitError::Probe(err) => err,
        })?;

        tracing::info!(instance, account, "received credentials");
        Ok(secret)
    }
}

#[cfg(test)]
mod tests;
