//! Error types for the compute provider client.

use thiserror::Error;

/// Errors raised by a [`super::ComputeApi`] implementation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ComputeError {
    /// The addressed resource does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// Resource path or name.
        resource: String,
    },
    /// An insert collided with an existing resource.
    #[error("{resource} already exists")]
    AlreadyExists {
        /// Resource path or name.
        resource: String,
    },
    /// The provider rejected the request.
    #[error("compute API returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider error message.
        message: String,
    },
    /// No access token could be obtained.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The request never reached the provider or the connection dropped.
    #[error("compute transport error: {0}")]
    Transport(String),
    /// The provider answered with a body that could not be decoded.
    #[error("failed to decode compute response: {0}")]
    Decode(String),
}

impl ComputeError {
    /// Returns `true` for [`ComputeError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for [`ComputeError::AlreadyExists`].
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl From<reqwest::Error> for ComputeError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}
