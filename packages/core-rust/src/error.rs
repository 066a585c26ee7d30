//! Crate-level error type for construction-time failures.

use crate::exception::Exception;
use crate::protocol::UnknownProtocol;

/// Errors raised synchronously by factories and registration calls.
#[derive(Debug, thiserror::Error)]
pub enum KoattyError {
    /// Context construction was asked for a protocol outside the supported set.
    #[error("failed to create context: {0}")]
    ContextCreation(#[source] UnknownProtocol),

    /// A component identifier is missing the suffix its kind requires.
    #[error("{kind} class name must be '{kind}' suffix, got `{identifier}`")]
    InvalidSuffix {
        kind: &'static str,
        identifier: String,
    },

    /// A user-raised framework exception.
    #[error(transparent)]
    Exception(#[from] Exception),
}
