// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the publisher engine.
//!
//! Failures are grouped by the part of the engine they come from. The
//! reconciliation loop uses the classification to decide what to do next:
//! transient connectivity problems are retried on the next pass, invalidated
//! session or subscription handles force an internal disconnect, and per-node
//! problems only affect the offending monitored item.
//!
//! # Error Categories
//!
//! ```text
//! PublisherError
//! ├── Connection    - Endpoint discovery and connect failures
//! ├── Session       - Session handle invalidation, shutdown
//! ├── Subscription  - Subscription handle invalidation, creation failures
//! ├── Node          - Invalid or unknown node identifiers
//! ├── Configuration - Invalid settings, missing credentials, file loading
//! └── Timeout       - Connect and service call timeouts
//! ```
//!
//! Errors reported by the protocol stack arrive as [`StackError`] and are
//! classified into one of the categories above by `From<StackError>`.
//!
//! # Examples
//!
//! ```
//! use opcpub_engine::error::{PublisherError, StackError};
//! use opcpub_engine::types::StatusCode;
//!
//! let error: PublisherError = StackError::new(StatusCode::BAD_SESSION_ID_INVALID, "gone").into();
//! assert!(error.invalidates_session());
//! assert!(!error.is_node_error());
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;

use crate::types::StatusCode;

// =============================================================================
// PublisherError - Main Error Type
// =============================================================================

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum PublisherError {
    /// Endpoint discovery and connection errors.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// Session lifecycle errors.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Subscription errors.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Per-node errors.
    #[error("{0}")]
    Node(#[from] NodeError),

    /// Configuration errors.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Timeout errors.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),
}

impl PublisherError {
    // =========================================================================
    // Factory Methods
    // =========================================================================

    /// Creates a connection error.
    #[inline]
    pub fn connection(error: ConnectionError) -> Self {
        Self::Connection(error)
    }

    /// Creates a session error.
    #[inline]
    pub fn session(error: SessionError) -> Self {
        Self::Session(error)
    }

    /// Creates a subscription error.
    #[inline]
    pub fn subscription(error: SubscriptionError) -> Self {
        Self::Subscription(error)
    }

    /// Creates a node error.
    #[inline]
    pub fn node(error: NodeError) -> Self {
        Self::Node(error)
    }

    /// Creates a configuration error.
    #[inline]
    pub fn configuration(error: ConfigurationError) -> Self {
        Self::Configuration(error)
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(error: TimeoutError) -> Self {
        Self::Timeout(error)
    }

    /// Creates a not connected error.
    pub fn not_connected() -> Self {
        Self::Connection(ConnectionError::NotConnected)
    }

    /// Creates an invalid node id error.
    pub fn invalid_node_id(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Node(NodeError::invalid_format(node_id, reason))
    }

    /// Creates a missing credential error.
    pub fn missing_credential(endpoint_id: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::missing_credential(endpoint_id))
    }

    // =========================================================================
    // Classification
    // =========================================================================

    /// Returns `true` if the session or subscription handle used for the
    /// failed call is no longer valid on the server.
    ///
    /// The only way to recover is to tear the session down and reconnect.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionError::Invalidated { .. })
                | Self::Subscription(SubscriptionError::Invalidated { .. })
        )
    }

    /// Returns `true` if the failure is confined to a single node.
    pub fn is_node_error(&self) -> bool {
        matches!(self, Self::Node(_))
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::Session(e) => e.is_retryable(),
            Self::Subscription(e) => e.is_retryable(),
            Self::Node(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::Configuration(_) => false,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Connection(e) => e.severity(),
            Self::Session(e) => e.severity(),
            Self::Subscription(_) => ErrorSeverity::Warning,
            Self::Node(_) => ErrorSeverity::Warning,
            Self::Timeout(_) => ErrorSeverity::Warning,
            Self::Configuration(_) => ErrorSeverity::Critical,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Session(_) => "session",
            Self::Subscription(_) => "subscription",
            Self::Node(_) => "node",
            Self::Configuration(_) => "configuration",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Returns a unique error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Node(e) => e.error_code(),
            Self::Configuration(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
        }
    }

    /// Returns recovery hints for this error.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Connection(e) => e.recovery_hints(),
            Self::Session(_) => vec!["The session is re-established on the next reconciliation pass"],
            Self::Subscription(_) => {
                vec!["Subscriptions are recreated after the session reconnects"]
            }
            Self::Node(e) => e.recovery_hints(),
            Self::Configuration(e) => e.recovery_hints(),
            Self::Timeout(_) => vec![
                "Check network connectivity to the server",
                "Increase the session timeout setting",
            ],
        }
    }

    /// Returns the tracing level for this error.
    pub fn tracing_level(&self) -> Level {
        self.severity().to_tracing_level()
    }

    /// Logs this error with appropriate level and context.
    pub fn log(&self, context: &str) {
        let level = self.tracing_level();
        let code = self.error_code();

        match level {
            Level::ERROR => tracing::error!(
                error_code = %code,
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                error_code = %code,
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
            _ => tracing::debug!(
                error_code = %code,
                category = self.category(),
                context = context,
                retryable = self.is_retryable(),
                "{self}"
            ),
        }
    }
}

// =============================================================================
// StackError
// =============================================================================

/// A failure reported by the protocol stack behind the capability boundary.
#[derive(Debug, Clone, Error)]
#[error("{status}: {message}")]
pub struct StackError {
    /// Status code of the failed service call.
    pub status: StatusCode,
    /// Human readable detail.
    pub message: String,
}

impl StackError {
    /// Creates a new stack error.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<StackError> for PublisherError {
    fn from(error: StackError) -> Self {
        let status = error.status;
        match status {
            StatusCode::BAD_SESSION_ID_INVALID
            | StatusCode::BAD_SESSION_CLOSED
            | StatusCode::BAD_SESSION_NOT_ACTIVATED => {
                Self::Session(SessionError::Invalidated { status })
            }
            StatusCode::BAD_SUBSCRIPTION_ID_INVALID => {
                Self::Subscription(SubscriptionError::Invalidated { status })
            }
            StatusCode::BAD_NODE_ID_INVALID => Self::Node(NodeError::Invalid {
                node_id: error.message,
            }),
            StatusCode::BAD_NODE_ID_UNKNOWN => Self::Node(NodeError::Unknown {
                node_id: error.message,
            }),
            StatusCode::BAD_TIMEOUT => Self::Timeout(TimeoutError::Operation {
                operation: error.message,
            }),
            _ => Self::Connection(ConnectionError::Stack {
                status,
                message: error.message,
            }),
        }
    }
}

// =============================================================================
// ConnectionError
// =============================================================================

/// Endpoint discovery and connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The discovery call returned no endpoint for the url scheme.
    #[error("No endpoints discovered at '{endpoint}'")]
    EndpointNotFound {
        /// Discovery url.
        endpoint: String,
    },

    /// No discovered endpoint satisfies the security requirements.
    #[error("No suitable endpoint at '{endpoint}' for security mode '{security_mode}'")]
    NoSuitableEndpoint {
        /// Discovery url.
        endpoint: String,
        /// Requested security mode.
        security_mode: String,
    },

    /// The connection is not established.
    #[error("Not connected")]
    NotConnected,

    /// Any other stack status.
    #[error("Stack call failed with {status}: {message}")]
    Stack {
        /// Status code.
        status: StatusCode,
        /// Detail.
        message: String,
    },
}

impl ConnectionError {
    /// Creates an endpoint not found error.
    pub fn endpoint_not_found(endpoint: impl Into<String>) -> Self {
        Self::EndpointNotFound {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a no suitable endpoint error.
    pub fn no_suitable_endpoint(
        endpoint: impl Into<String>,
        security_mode: impl Into<String>,
    ) -> Self {
        Self::NoSuitableEndpoint {
            endpoint: endpoint.into(),
            security_mode: security_mode.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NoSuitableEndpoint { .. })
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NotConnected => ErrorSeverity::Info,
            Self::NoSuitableEndpoint { .. } => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::EndpointNotFound { .. } => ErrorCode::new(1, 1),
            Self::NoSuitableEndpoint { .. } => ErrorCode::new(1, 2),
            Self::NotConnected => ErrorCode::new(1, 3),
            Self::Stack { .. } => ErrorCode::new(1, 4),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::EndpointNotFound { .. } => vec![
                "Verify the endpoint url and its scheme",
                "Check that the server exposes a discovery endpoint",
            ],
            Self::NoSuitableEndpoint { .. } => vec![
                "Check the security modes offered by the server",
                "Relax the configured security mode or profile",
            ],
            Self::NotConnected => vec!["Wait for the next reconciliation pass"],
            Self::Stack { .. } => vec!["Inspect the status code reported by the server"],
        }
    }
}

// =============================================================================
// SessionError
// =============================================================================

/// Session lifecycle errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server no longer recognizes the session.
    #[error("Session invalidated by server ({status})")]
    Invalidated {
        /// Status code reported.
        status: StatusCode,
    },

    /// Too many keep-alives were missed.
    #[error("Keep-alive lost after {missed} missed signals")]
    KeepAliveLost {
        /// Consecutive misses.
        missed: u32,
    },

    /// No client handle is left to assign.
    #[error("Client handles exhausted on endpoint '{endpoint_id}'")]
    HandlesExhausted {
        /// Endpoint id.
        endpoint_id: String,
    },
}

impl SessionError {
    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::HandlesExhausted { .. })
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::HandlesExhausted { .. } => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Invalidated { .. } => ErrorCode::new(2, 1),
            Self::KeepAliveLost { .. } => ErrorCode::new(2, 2),
            Self::HandlesExhausted { .. } => ErrorCode::new(2, 3),
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription errors.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The server no longer recognizes the subscription.
    #[error("Subscription invalidated by server ({status})")]
    Invalidated {
        /// Status code reported.
        status: StatusCode,
    },

    /// Creating the subscription failed.
    #[error("Failed to create subscription with publishing interval {interval:?}: {message}")]
    CreationFailed {
        /// Requested publishing interval.
        interval: Duration,
        /// Detail.
        message: String,
    },
}

impl SubscriptionError {
    /// Creates a creation failed error.
    pub fn creation_failed(interval: Duration, message: impl Into<String>) -> Self {
        Self::CreationFailed {
            interval,
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        true
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Invalidated { .. } => ErrorCode::new(3, 1),
            Self::CreationFailed { .. } => ErrorCode::new(3, 2),
        }
    }
}

// =============================================================================
// NodeError
// =============================================================================

/// Errors confined to a single node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The configured identifier cannot be parsed.
    #[error("Invalid node id '{node_id}': {reason}")]
    InvalidFormat {
        /// Configured text.
        node_id: String,
        /// Parse failure.
        reason: String,
    },

    /// The server rejected the node id as syntactically invalid.
    #[error("Node id '{node_id}' rejected as invalid by server")]
    Invalid {
        /// Node id.
        node_id: String,
    },

    /// The server does not know the node.
    #[error("Node id '{node_id}' is unknown to server")]
    Unknown {
        /// Node id.
        node_id: String,
    },

    /// The namespace uri of an expanded node id is not in the session's table.
    #[error("Namespace '{namespace_uri}' is not published by the server")]
    UnknownNamespace {
        /// Namespace uri.
        namespace_uri: String,
    },

    /// The node failed too many times and was given up on.
    #[error("Giving up on node '{node_id}' after {attempts} failed attempts")]
    AttemptsExhausted {
        /// Node id.
        node_id: String,
        /// Attempts made.
        attempts: u32,
    },
}

impl NodeError {
    /// Creates an invalid format error.
    pub fn invalid_format(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unknown namespace error.
    pub fn unknown_namespace(namespace_uri: impl Into<String>) -> Self {
        Self::UnknownNamespace {
            namespace_uri: namespace_uri.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    ///
    /// Server-side node errors are retried on later passes since the address
    /// space may change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Invalid { .. } | Self::Unknown { .. } | Self::UnknownNamespace { .. }
        )
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidFormat { .. } => ErrorCode::new(4, 1),
            Self::Invalid { .. } => ErrorCode::new(4, 2),
            Self::Unknown { .. } => ErrorCode::new(4, 3),
            Self::UnknownNamespace { .. } => ErrorCode::new(4, 4),
            Self::AttemptsExhausted { .. } => ErrorCode::new(4, 5),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::InvalidFormat { .. } => vec![
                "Use format: ns=<index>;i=<number> or nsu=<uri>;s=<name>",
            ],
            Self::Invalid { .. } | Self::Unknown { .. } => vec![
                "Browse the server address space to confirm the node exists",
                "Check the namespace index of the configured node id",
            ],
            Self::UnknownNamespace { .. } => {
                vec!["Check the namespace uri against the server's namespace array"]
            }
            Self::AttemptsExhausted { .. } => {
                vec!["Fix the node id and add the node again"]
            }
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// `UsernamePassword` was configured without a credential.
    #[error("Endpoint '{endpoint_id}' uses username/password authentication but has no credential")]
    MissingCredential {
        /// Endpoint id.
        endpoint_id: String,
    },

    /// Invalid configuration value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Reason.
        reason: String,
    },

    /// Unknown security mode string.
    #[error("Invalid security mode: '{value}'")]
    InvalidSecurityMode {
        /// Offending value.
        value: String,
    },

    /// Configuration file does not exist.
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound {
        /// Path.
        path: PathBuf,
    },

    /// Reading the configuration file failed.
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// Path.
        path: PathBuf,
        /// Cause.
        #[source]
        source: io::Error,
    },

    /// Parsing the configuration failed.
    #[error("Failed to parse configuration: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },

    /// File extension does not map to a supported format.
    #[error("Unsupported configuration format: '{extension}'")]
    UnsupportedFormat {
        /// Extension.
        extension: String,
    },

    /// An environment override could not be parsed.
    #[error("Invalid environment variable '{name}': {reason}")]
    InvalidEnvVar {
        /// Variable name.
        name: String,
        /// Reason.
        reason: String,
    },
}

impl ConfigurationError {
    /// Creates a missing credential error.
    pub fn missing_credential(endpoint_id: impl Into<String>) -> Self {
        Self::MissingCredential {
            endpoint_id: endpoint_id.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid security mode error.
    pub fn invalid_security_mode(value: impl Into<String>) -> Self {
        Self::InvalidSecurityMode {
            value: value.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates an invalid environment variable error.
    pub fn invalid_env_var(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEnvVar {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingCredential { .. } => ErrorCode::new(5, 1),
            Self::InvalidValue { .. } => ErrorCode::new(5, 2),
            Self::InvalidSecurityMode { .. } => ErrorCode::new(5, 3),
            Self::FileNotFound { .. } => ErrorCode::new(5, 4),
            Self::Io { .. } => ErrorCode::new(5, 5),
            Self::Parse { .. } => ErrorCode::new(5, 6),
            Self::UnsupportedFormat { .. } => ErrorCode::new(5, 7),
            Self::InvalidEnvVar { .. } => ErrorCode::new(5, 8),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::MissingCredential { .. } => vec![
                "Add a credential reference to the endpoint",
                "Or switch the endpoint to anonymous authentication",
            ],
            Self::FileNotFound { .. } | Self::Io { .. } => {
                vec!["Check the path and file permissions"]
            }
            Self::UnsupportedFormat { .. } => vec!["Use a .yaml, .yml, .toml or .json file"],
            _ => vec!["Review the configuration value"],
        }
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// Timeout errors.
#[derive(Debug, Error)]
pub enum TimeoutError {
    /// Connecting did not complete in time.
    #[error("Connecting to '{endpoint}' timed out after {duration:?}")]
    Connect {
        /// Endpoint url.
        endpoint: String,
        /// Timeout used.
        duration: Duration,
    },

    /// A service call timed out on the server.
    #[error("Operation timed out: {operation}")]
    Operation {
        /// Operation description.
        operation: String,
    },
}

impl TimeoutError {
    /// Creates a connect timeout error.
    pub fn connect(endpoint: impl Into<String>, duration: Duration) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            duration,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connect { .. } => ErrorCode::new(6, 1),
            Self::Operation { .. } => ErrorCode::new(6, 2),
        }
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Severity of an error, used to pick a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational - no action required.
    Info,
    /// Warning - handled by retry.
    Warning,
    /// Error - needs attention, engine keeps running.
    Error,
    /// Critical - startup cannot continue.
    Critical,
}

impl ErrorSeverity {
    /// Converts to tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Stable error code rendered as `PU-CCNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category (1-6).
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }

    /// Returns the full error code as a u16.
    pub fn as_u16(&self) -> u16 {
        ((self.category as u16) << 8) | (self.code as u16)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PU-{:02X}{:02X}", self.category, self.code)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Result type for engine operations.
pub type PublisherResult<T> = Result<T, PublisherError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_error_classification() {
        let session: PublisherError =
            StackError::new(StatusCode::BAD_SESSION_ID_INVALID, "read").into();
        assert!(session.invalidates_session());

        let subscription: PublisherError =
            StackError::new(StatusCode::BAD_SUBSCRIPTION_ID_INVALID, "apply").into();
        assert!(subscription.invalidates_session());

        let unknown: PublisherError =
            StackError::new(StatusCode::BAD_NODE_ID_UNKNOWN, "ns=2;s=Missing").into();
        assert!(unknown.is_node_error());
        assert!(!unknown.invalidates_session());
        assert!(unknown.to_string().contains("ns=2;s=Missing"));

        let timeout: PublisherError = StackError::new(StatusCode::BAD_TIMEOUT, "connect").into();
        assert!(matches!(timeout, PublisherError::Timeout(_)));
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_other_status_is_connection_error() {
        let error: PublisherError =
            StackError::new(StatusCode::BAD_COMMUNICATION_ERROR, "socket").into();
        assert!(matches!(
            error,
            PublisherError::Connection(ConnectionError::Stack { .. })
        ));
        assert_eq!(error.category(), "connection");
    }

    #[test]
    fn test_configuration_not_retryable() {
        let error = PublisherError::missing_credential("plc-1");
        assert!(!error.is_retryable());
        assert_eq!(error.severity(), ErrorSeverity::Critical);
        assert!(error.to_string().contains("plc-1"));
        assert!(!error.recovery_hints().is_empty());
    }

    #[test]
    fn test_error_code_display() {
        let code = ErrorCode::new(4, 3);
        assert_eq!(code.to_string(), "PU-0403");
        assert_eq!(code.as_u16(), 0x0403);
        let error = PublisherError::node(NodeError::Unknown {
            node_id: "i=1".into(),
        });
        assert_eq!(error.error_code(), code);
    }

    #[test]
    fn test_error_codes_per_category() {
        assert_eq!(ConnectionError::NotConnected.error_code().to_string(), "PU-0103");
        let lost = SessionError::KeepAliveLost { missed: 3 };
        assert_eq!(lost.error_code(), ErrorCode::new(2, 2));
        assert!(lost.is_retryable());
        let exhausted = SessionError::HandlesExhausted {
            endpoint_id: "plc-1".into(),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(ErrorSeverity::Info.to_tracing_level(), Level::INFO);
        assert_eq!(ErrorSeverity::Critical.to_tracing_level(), Level::ERROR);
        assert!(ErrorSeverity::Warning < ErrorSeverity::Error);
    }
}
