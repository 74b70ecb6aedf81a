//! Error types for secret operations.

use thiserror::Error;

/// Errors returned by the secret client. All recoverable by the caller.
#[derive(Error, Debug)]
pub enum SecretError {
    /// The secret does not exist (or is absent from the cache in
    /// cache-only mode).
    #[error("secret not found: {0}")]
    NotFound(String),

    /// The orchestrator did not answer within the request deadline.
    #[error("secret request timed out: {0}")]
    Timeout(String),

    /// The string form could not be parsed into the requested type.
    #[error("secret {name} is not a valid {target}: {reason}")]
    Parse {
        name: String,
        target: &'static str,
        reason: String,
    },

    /// The control plane to the orchestrator is gone.
    #[error("secret transport error: {0}")]
    Transport(String),
}
