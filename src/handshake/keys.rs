//! Ephemeral RSA keys and the request record published in metadata.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use super::{DecodeError, HandshakeError};

/// Modulus size used for production handshakes.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Address the guest agent records against the reset; never contacted.
pub const NOTIFICATION_EMAIL: &str = "nobody@nowhere.com";

/// Lifetime of a published request.
pub const REQUEST_TTL_MINUTES: i64 = 5;

/// Single-use RSA keypair. The private half never leaves this struct.
pub struct KeyPair {
    private: RsaPrivateKey,
    modulus: String,
    exponent: String,
}

impl KeyPair {
    /// Generates a fresh keypair with a `bits`-bit modulus.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::KeyGeneration`] when the RNG or prime search
    /// fails, or [`HandshakeError::Encode`] for an exponent wider than 32 bits.
    pub fn generate(bits: usize) -> Result<Self, HandshakeError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|err| HandshakeError::KeyGeneration(err.to_string()))?;
        let modulus = encode_modulus(private.n());
        let exponent = encode_exponent(private.e())?;
        Ok(Self {
            private,
            modulus,
            exponent,
        })
    }

    /// Base64 of the big-endian modulus bytes.
    #[must_use]
    pub fn modulus(&self) -> &str {
        &self.modulus
    }

    /// Base64 of the low three bytes of the public exponent.
    #[must_use]
    pub fn exponent(&self) -> &str {
        &self.exponent
    }

    /// Decrypts an RSA-OAEP (SHA-1) ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Decrypt`] when the ciphertext does not match
    /// this key or is malformed.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecodeError> {
        self.private
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(|err| DecodeError::Decrypt(err.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn public_key(&self) -> rsa::RsaPublicKey {
        self.private.to_public_key()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("modulus", &self.modulus)
            .field("exponent", &self.exponent)
            .finish_non_exhaustive()
    }
}

/// Encodes an RSA modulus as base64 of its unsigned big-endian bytes.
#[must_use]
pub fn encode_modulus(n: &BigUint) -> String {
    STANDARD.encode(n.to_bytes_be())
}

/// Encodes a public exponent as base64 of the last three bytes of its
/// four-byte big-endian form (65537 becomes `AQAB`).
///
/// # Errors
///
/// Returns [`HandshakeError::Encode`] when the exponent does not fit in 32
/// bits.
pub fn encode_exponent(e: &BigUint) -> Result<String, HandshakeError> {
    let bytes = e.to_bytes_be();
    if bytes.len() > 4 {
        return Err(HandshakeError::Encode(format!(
            "public exponent is {} bytes wide",
            bytes.len()
        )));
    }
    let low_three: Vec<u8> = std::iter::repeat_n(0_u8, 4 - bytes.len())
        .chain(bytes)
        .skip(1)
        .collect();
    Ok(STANDARD.encode(low_three))
}

/// Record appended to the `windows-keys` metadata item.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeRequest {
    /// Account to create or reset.
    pub user_name: String,
    /// Base64 modulus of the requesting key.
    pub modulus: String,
    /// Base64 exponent of the requesting key.
    pub exponent: String,
    /// Notification address.
    pub email: String,
    /// RFC3339 expiry after which the guest ignores the request.
    pub expire_on: String,
}

impl KeyExchangeRequest {
    /// Builds a request for `user_name` signed by `keys`, expiring five
    /// minutes after `now`.
    #[must_use]
    pub fn new(keys: &KeyPair, user_name: &str, now: DateTime<Utc>) -> Self {
        let expiry = now + chrono::Duration::minutes(REQUEST_TTL_MINUTES);
        Self {
            user_name: user_name.to_owned(),
            modulus: keys.modulus().to_owned(),
            exponent: keys.exponent().to_owned(),
            email: NOTIFICATION_EMAIL.to_owned(),
            expire_on: expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Serialises the request as a single JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Encode`] when serialisation fails.
    pub fn to_json(&self) -> Result<String, HandshakeError> {
        serde_json::to_string(self).map_err(|err| HandshakeError::Encode(err.to_string()))
    }
}
