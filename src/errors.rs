//! Error types and failure categorization.
//!
//! Per-request failures never propagate; they are classified into an
//! [`ErrorCategory`] and recorded as metrics. The only run-aborting fault is a
//! [`SetupError`].

use std::fmt;
use thiserror::Error;

/// Categories of request failures observed during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, etc.)
    NetworkError,

    /// Request timeout errors
    TimeoutError,

    /// TLS/SSL certificate errors
    TlsError,

    /// Redirects that were not followed and anything else unexpected
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns `None` for 2xx responses, which are the only statuses counted
    /// as successful requests.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=299 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a transport-level reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() || error.is_body() || error.is_decode()
        {
            ErrorCategory::NetworkError
        } else if error.is_redirect() {
            ErrorCategory::OtherError
        } else {
            Self::from_message(&error.to_string())
        }
    }

    /// Fallback classification from an error message.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            ErrorCategory::TlsError
        } else if msg.contains("timeout") || msg.contains("timed out") {
            ErrorCategory::TimeoutError
        } else if msg.contains("dns")
            || msg.contains("resolve")
            || msg.contains("connect")
            || msg.contains("connection")
        {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::OtherError
        }
    }

    /// Metric/Prometheus label for this category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::OtherError => "other_error",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "HTTP 4xx Client Errors",
            ErrorCategory::ServerError => "HTTP 5xx Server Errors",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Request Timeout Errors",
            ErrorCategory::TlsError => "TLS/SSL Certificate Errors",
            ErrorCategory::OtherError => "Other/Unknown Errors",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A request that never produced an HTTP response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{}] {}", .category.label(), .message)]
pub struct TransportError {
    pub category: ErrorCategory,
    pub message: String,
}

impl TransportError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        Self::new(ErrorCategory::from_reqwest_error(error), error.to_string())
    }
}

/// Fatal failure of the one-time setup phase.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SetupError {
    #[error("setup step '{step}' failed: {source}")]
    Transport {
        step: String,
        #[source]
        source: TransportError,
    },

    #[error("setup step '{step}' returned HTTP {status}")]
    UnexpectedStatus { step: String, status: u16 },

    #[error("setup step '{step}' failed checks")]
    ChecksFailed { step: String },

    #[error("setup did not produce required variable '{0}'")]
    MissingVariable(String),

    #[error("setup interrupted by shutdown")]
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_2xx_is_success() {
        assert_eq!(ErrorCategory::from_status_code(200), None);
        assert_eq!(ErrorCategory::from_status_code(201), None);
        assert_eq!(ErrorCategory::from_status_code(204), None);
        assert_eq!(
            ErrorCategory::from_status_code(302),
            Some(ErrorCategory::OtherError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(0),
            Some(ErrorCategory::OtherError)
        );
    }

    #[test]
    fn test_categorize_error_statuses() {
        assert_eq!(
            ErrorCategory::from_status_code(404),
            Some(ErrorCategory::ClientError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(503),
            Some(ErrorCategory::ServerError)
        );
    }

    #[test]
    fn test_from_message() {
        assert_eq!(
            ErrorCategory::from_message("operation timed out"),
            ErrorCategory::TimeoutError
        );
        assert_eq!(
            ErrorCategory::from_message("invalid peer certificate"),
            ErrorCategory::TlsError
        );
        assert_eq!(
            ErrorCategory::from_message("Connection refused"),
            ErrorCategory::NetworkError
        );
        assert_eq!(ErrorCategory::from_message("weird"), ErrorCategory::OtherError);
    }

    #[test]
    fn test_labels_are_unique() {
        let mut labels: Vec<_> = [
            ErrorCategory::ClientError,
            ErrorCategory::ServerError,
            ErrorCategory::NetworkError,
            ErrorCategory::TimeoutError,
            ErrorCategory::TlsError,
            ErrorCategory::OtherError,
        ]
        .iter()
        .map(|c| c.label())
        .collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), 6);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new(ErrorCategory::TimeoutError, "deadline elapsed");
        assert_eq!(err.to_string(), "[timeout_error] deadline elapsed");
    }

    #[test]
    fn test_setup_error_display() {
        let err = SetupError::UnexpectedStatus {
            step: "admin login".into(),
            status: 401,
        };
        assert_eq!(err.to_string(), "setup step 'admin login' returned HTTP 401");

        let err = SetupError::MissingVariable("admin_token".into());
        assert!(err.to_string().contains("admin_token"));
    }
}
