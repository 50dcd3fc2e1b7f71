//! Error types for the call probe

use thiserror::Error;

/// Result type for call probe operations
pub type CallProbeResult<T> = Result<T, CallProbeError>;

/// Errors that can occur while placing a call and driving its media
#[derive(Debug, Error)]
pub enum CallProbeError {
    /// A proxy authentication challenge was missing a required field
    #[error("Malformed authentication challenge: {reason}")]
    MalformedChallenge { reason: String },

    /// The challenge asked for a digest algorithm we cannot compute
    #[error("Unsupported digest algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// A request target or identity could not be parsed as a SIP URI
    #[error("Invalid SIP URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// No response arrived for a request
    #[error("No response received for {method}")]
    NoResponse { method: String },

    /// The proxy challenged the request again after credentials were supplied
    #[error("Authentication rejected by {realm}")]
    AuthenticationRejected { realm: String },

    /// Signaling collaborator failure
    #[error("Signaling error: {message}")]
    Signaling { message: String },

    /// The RTP connection is not in the mode an operation requires
    #[error("Connection mode {actual} does not allow {operation} (requires {required})")]
    InvalidConnectionMode {
        operation: String,
        required: String,
        actual: String,
    },

    /// A media resource could not be allocated or activated
    #[error("Media resource unavailable: {resource}")]
    ResourceUnavailable { resource: String },

    /// Other media collaborator failure
    #[error("Media error: {message}")]
    Media { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The digit sequence contains a symbol outside the DTMF alphabet
    #[error("Invalid tone sequence '{sequence}': {reason}")]
    InvalidToneSequence { sequence: String, reason: String },

    /// The scenario produced no connected call
    #[error("Unable to make call: {reason}")]
    CallFailed { reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CallProbeError {
    /// Create a malformed challenge error
    pub fn malformed_challenge(reason: impl Into<String>) -> Self {
        Self::MalformedChallenge {
            reason: reason.into(),
        }
    }

    /// Create an invalid URI error
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Create a signaling error
    pub fn signaling(message: impl Into<String>) -> Self {
        Self::Signaling {
            message: message.into(),
        }
    }

    /// Create a resource unavailable error
    pub fn resource_unavailable(resource: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            resource: resource.into(),
        }
    }

    /// Create a media error
    pub fn media(message: impl Into<String>) -> Self {
        Self::Media {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid tone sequence error
    pub fn invalid_tone_sequence(sequence: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidToneSequence {
            sequence: sequence.into(),
            reason: reason.into(),
        }
    }

    /// Create a call failed error
    pub fn call_failed(reason: impl Into<String>) -> Self {
        Self::CallFailed {
            reason: reason.into(),
        }
    }

    /// Whether this error came from the signaling leg rather than media setup
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            Self::MalformedChallenge { .. }
                | Self::UnsupportedAlgorithm { .. }
                | Self::InvalidUri { .. }
                | Self::NoResponse { .. }
                | Self::AuthenticationRejected { .. }
                | Self::Signaling { .. }
        )
    }
}

impl From<toml::de::Error> for CallProbeError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}
