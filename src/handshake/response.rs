//! Serial console response parsing.
//!
//! Each poll runs `split_records -> parse_record -> correlate -> accept` over
//! the full console contents. Lines that are not JSON, or that answer some
//! other request, are ignored.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::secret::Secret;

use super::DecodeError;
use super::keys::KeyPair;

/// Response record the guest agent writes to serial port 4.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyExchangeResponse {
    /// Account the password belongs to.
    pub user_name: String,
    /// Whether the guest produced a password.
    pub password_found: bool,
    /// Base64 RSA-OAEP ciphertext of the password.
    pub encrypted_password: String,
    /// Modulus echoed from the request.
    pub modulus: String,
    /// Exponent echoed from the request.
    pub exponent: String,
    /// Failure reported by the guest agent.
    pub error_message: String,
}

/// Result of accepting a correlated response.
#[derive(Debug, Eq, PartialEq)]
pub enum Acceptance {
    /// The guest returned a password.
    Password(Secret),
    /// The guest refused the request.
    Rejected(String),
}

/// Splits console contents into candidate records.
pub fn split_records(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

/// Parses one line; anything that is not a JSON object yields `None`.
#[must_use]
pub fn parse_record(line: &str) -> Option<KeyExchangeResponse> {
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Returns `true` when `response` answers the request carrying `modulus`.
#[must_use]
pub fn correlate(response: &KeyExchangeResponse, modulus: &str) -> bool {
    !response.modulus.is_empty() && response.modulus == modulus
}

/// Decrypts a correlated response.
///
/// # Errors
///
/// Returns [`DecodeError`] when the ciphertext is not valid base64, does not
/// decrypt under `keys`, or is not UTF-8.
pub fn accept(response: &KeyExchangeResponse, keys: &KeyPair) -> Result<Acceptance, DecodeError> {
    if !response.error_message.is_empty() {
        return Ok(Acceptance::Rejected(response.error_message.clone()));
    }
    let ciphertext = STANDARD
        .decode(response.encrypted_password.trim())
        .map_err(|err| DecodeError::Base64(err.to_string()))?;
    let plaintext = keys.decrypt(&ciphertext)?;
    let password = String::from_utf8(plaintext).map_err(|_| DecodeError::Utf8)?;
    Ok(Acceptance::Password(Secret::new(password)))
}

/// Runs the pipeline over one console snapshot.
///
/// Returns the first acceptance for `keys`; undecodable matches are logged
/// and skipped so a later line can still succeed.
#[must_use]
pub fn scan(contents: &str, keys: &KeyPair) -> Option<Acceptance> {
    split_records(contents)
        .filter_map(parse_record)
        .filter(|response| correlate(response, keys.modulus()))
        .find_map(|response| match accept(&response, keys) {
            Ok(acceptance) => Some(acceptance),
            Err(err) => {
                tracing::warn!(error = %err, "skipping undecodable credential response");
                None
            }
        })
}
