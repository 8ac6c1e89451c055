//! Connector error model.

use std::time::Duration;

use thiserror::Error;

/// Result type used by connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Error raised by a connector or by the execution utilities wrapped around it.
///
/// Classification matters more than the message: the retry executor consults
/// [`ConnectorError::is_retryable`] to decide whether another attempt is allowed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectorError {
    /// Transport or connect failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials were rejected (401/403-equivalent).
    #[error("authentication failed ({status}): {message}")]
    Authentication { status: u16, message: String },

    /// The remote system throttled us (429-equivalent).
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Malformed input or a required mapped field is missing.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Any other status-bearing response from the remote system.
    #[error("remote returned {status}: {message}")]
    Http { status: u16, message: String },

    /// Failure explicitly flagged as not worth retrying.
    #[error("not retryable: {0}")]
    NotRetryable(String),

    /// Per-source data could not be compared.
    #[error("conflict detection failed: {0}")]
    ConflictDetection(String),

    /// Batch write failure; normally folded into `BulkResult::errors`.
    #[error("bulk operation failed: {0}")]
    BulkOperation(String),

    /// The connector has not been connected (or was disconnected).
    #[error("connector is not connected")]
    NotConnected,

    /// The adapter does not implement the requested capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An error annotated with the operation and connector it came from.
    #[error("{operation} failed on {connector_type}/{connector_name}: {source}")]
    Context {
        operation: String,
        connector_type: String,
        connector_name: String,
        #[source]
        source: Box<ConnectorError>,
    },
}

impl ConnectorError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn authentication(status: u16, msg: impl Into<String>) -> Self {
        Self::Authentication {
            status,
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: msg.into(),
        }
    }

    pub fn not_retryable(msg: impl Into<String>) -> Self {
        Self::NotRetryable(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Wrap this error with the operation and connector identity.
    ///
    /// Already-wrapped errors are returned unchanged so the innermost context wins.
    pub fn with_context(
        self,
        operation: impl Into<String>,
        connector_type: impl Into<String>,
        connector_name: impl Into<String>,
    ) -> Self {
        match self {
            Self::Context { .. } => self,
            other => Self::Context {
                operation: operation.into(),
                connector_type: connector_type.into(),
                connector_name: connector_name.into(),
                source: Box::new(other),
            },
        }
    }

    /// The error without any context wrapper.
    pub fn root(&self) -> &ConnectorError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Status code carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            Self::Authentication { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Validation(_) => Some(400),
            _ => None,
        }
    }

    /// Cooldown requested by the remote system.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Auth (401/403), bad request (400) and explicitly flagged failures are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Context { source, .. } => source.is_retryable(),
            Self::Authentication { .. }
            | Self::Validation(_)
            | Self::NotRetryable(_)
            | Self::ConflictDetection(_)
            | Self::Unsupported(_) => false,
            Self::Http { status, .. } => !matches!(status, 400 | 401 | 403),
            Self::Connection(_)
            | Self::RateLimited { .. }
            | Self::BulkOperation(_)
            | Self::NotConnected => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_bad_request_statuses_are_terminal() {
        assert!(!ConnectorError::authentication(401, "bad token").is_retryable());
        assert!(!ConnectorError::http(403, "forbidden").is_retryable());
        assert!(!ConnectorError::http(400, "bad body").is_retryable());
        assert!(!ConnectorError::not_retryable("nope").is_retryable());
        assert!(ConnectorError::http(503, "unavailable").is_retryable());
        assert!(ConnectorError::connection("reset").is_retryable());
    }

    #[test]
    fn context_wrapper_keeps_classification() {
        let err = ConnectorError::authentication(401, "expired")
            .with_context("getProducts", "shopify", "eu-store");
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(401));
        assert_eq!(
            err.to_string(),
            "getProducts failed on shopify/eu-store: authentication failed (401): expired"
        );
    }

    #[test]
    fn context_is_not_nested_twice() {
        let err = ConnectorError::connection("timeout")
            .with_context("inner", "a", "b")
            .with_context("outer", "c", "d");
        match err {
            ConnectorError::Context { operation, .. } => assert_eq!(operation, "inner"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
