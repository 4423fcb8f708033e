//! Failures surfaced by the resource data provider.

use thiserror::Error;

use crate::provider::resources::{Resource, Verb};

/// Errors returned to callers of the data provider.
///
/// Transport and decoding problems are always wrapped; callers never see a
/// bare `reqwest` error.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The resource name is not part of the canonical set.
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// The resource exists but has no endpoint for this verb.
    #[error("Operation {verb} is not supported for resource {resource}")]
    NotSupported {
        /// Requested resource.
        resource: Resource,
        /// Requested verb.
        verb: Verb,
    },

    /// The backend answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Response status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// The request never produced a response.
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// A 2xx body was not valid JSON.
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The body was JSON but neither an object nor an array.
    #[error("Unexpected response shape: {0}")]
    UnexpectedShape(String),

    /// The provider base URL is not usable.
    #[error("Invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Two endpoint rules claim the same resource and verb.
    #[error("Duplicate endpoint rule for {resource} {verb}")]
    DuplicateEndpoint {
        /// Resource named twice.
        resource: Resource,
        /// Verb named twice.
        verb: Verb,
    },
}

impl ProviderError {
    /// HTTP status of an `Http` failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for failures raised before any request was made.
    pub fn is_not_supported(&self) -> bool {
        matches!(
            self,
            ProviderError::NotSupported { .. } | ProviderError::UnknownResource(_)
        )
    }
}

impl From<anyhow::Error> for ProviderError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<serde_json::Error>() {
            Ok(json) => ProviderError::Decode(json),
            Err(err) => match err.downcast::<url::ParseError>() {
                Ok(url) => ProviderError::InvalidUrl(url),
                Err(err) => ProviderError::Transport(err),
            },
        }
    }
}

/// Result alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;
