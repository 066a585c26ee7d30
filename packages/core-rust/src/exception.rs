//! Framework exceptions and the suppressed control-flow signal.

use std::fmt;

use http::StatusCode;

/// Message carried by an error used purely for flow control.
///
/// Errors with exactly this message stop the current middleware chain but
/// are never logged by the error captors.
pub const PREVENT_NEXT_PROCESS: &str = "PREVENT_NEXT_PROCESS";

/// Default business error code for exceptions raised without one.
pub const DEFAULT_ERROR_CODE: i32 = 1;

/// Client-facing failure raised by request handling code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Exception {
    /// Human readable message, sent to the client.
    pub message: String,
    /// Business error code.
    pub code: i32,
    /// Transport status; `None` is answered as 500.
    pub status: Option<StatusCode>,
}

impl Exception {
    #[must_use]
    pub fn new(message: impl Into<String>, code: i32, status: Option<StatusCode>) -> Self {
        Self {
            message: message.into(),
            code,
            status,
        }
    }

    /// Builds an exception from a numeric status code.
    ///
    /// A known status yields its canonical text as the message unless an
    /// explicit message is given. An unknown status leaves `status` unset
    /// and uses the number itself as the message.
    #[must_use]
    pub fn from_status(status: u16, message: Option<&str>) -> Self {
        let known = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason().map(|reason| (s, reason)));

        let (status, default_message) = match known {
            Some((s, reason)) => (Some(s), reason.to_string()),
            None => (None, status.to_string()),
        };

        Self {
            message: message.map_or(default_message, str::to_string),
            code: DEFAULT_ERROR_CODE,
            status,
        }
    }

    /// Builds an exception from a message, business code, and optional status.
    ///
    /// Status numbers outside the valid HTTP range are dropped.
    #[must_use]
    pub fn from_message(message: impl Into<String>, code: i32, status: Option<u16>) -> Self {
        Self {
            message: message.into(),
            code,
            status: status.and_then(|s| StatusCode::from_u16(s).ok()),
        }
    }

    /// The flow-control signal that is never logged.
    #[must_use]
    pub fn prevent() -> Self {
        Self::new(PREVENT_NEXT_PROCESS, DEFAULT_ERROR_CODE, None)
    }

    /// Status to answer with: the explicit one, or 500.
    #[must_use]
    pub fn status_or_default(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Whether `err` is the suppressed flow-control signal.
pub fn is_prevent<E: fmt::Display + ?Sized>(err: &E) -> bool {
    err.to_string() == PREVENT_NEXT_PROCESS
}
