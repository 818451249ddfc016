//! # Engine Error Types
//!
//! Error types for everything the engine does off-device.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Engine Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidFrame           │ │
//! │  │  MissingWorkerId│  │  Disconnected   │  │  UnsupportedVersion     │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  SerializationFailed    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │      Rest       │  │    Command      │  │   Persistence/Domain    │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  RequestFailed  │  │  Rejected       │  │  SessionLoadFailed      │ │
//! │  │  UnexpectedBody │  │  QueueFull      │  │  Transition (core)      │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient transport failures never reach callers as errors at all: the
//! channels retry forever and only the connectivity snapshot changes. What
//! does surface here is the non-retryable rest: bad config, rejected
//! commands, broken persistence.

use thiserror::Error;

use drover_core::TransitionError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error type covering all engine-side failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - All errors are `Send + Sync` for async compatibility
#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Missing worker ID (required to register on the session channel).
    #[error("Worker ID not configured. Complete registration first.")]
    MissingWorkerId,

    /// Invalid endpoint URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket disconnected unexpectedly.
    #[error("Disconnected from dispatch")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid frame received.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Unsupported protocol version.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// Failed to serialize a frame or payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize a frame or payload.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Rest Errors
    // =========================================================================
    /// HTTP request did not complete.
    #[error("Rest request failed: {0}")]
    RestRequestFailed(String),

    /// HTTP endpoint answered with a non-success status.
    #[error("Rest endpoint returned {status}: {body}")]
    RestStatus { status: u16, body: String },

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// The server explicitly refused a command.
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Too many commands queued while offline.
    #[error("Command queue is full")]
    CommandQueueFull,

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Failed to read the persisted session.
    #[error("Failed to load session state: {0}")]
    SessionLoadFailed(String),

    /// Failed to write the persisted session.
    #[error("Failed to save session state: {0}")]
    SessionSaveFailed(String),

    // =========================================================================
    // Domain Errors
    // =========================================================================
    /// A ride lifecycle rule refused the operation locally.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Engine is shutting down.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        EngineError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => EngineError::Disconnected,
            WsError::AlreadyClosed => EngineError::Disconnected,
            WsError::Protocol(p) => EngineError::WebSocketError(p.to_string()),
            WsError::Io(io) => EngineError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => EngineError::TlsError(tls.to_string()),
            other => EngineError::WebSocketError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Timeout(0)
        } else if let Some(status) = err.status() {
            EngineError::RestStatus {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            EngineError::RestRequestFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        EngineError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl EngineError {
    /// Returns true if this error is recoverable and the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures (network issues)
    /// - Timeouts
    /// - Temporary disconnections
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Protocol/version mismatches
    /// - Explicit server rejections
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConnectionFailed(_)
                | EngineError::Disconnected
                | EngineError::Timeout(_)
                | EngineError::WebSocketError(_)
                | EngineError::RestRequestFailed(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidConfig(_)
                | EngineError::MissingWorkerId
                | EngineError::InvalidUrl(_)
                | EngineError::ConfigLoadFailed(_)
                | EngineError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a malformed or mismatched frame.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidFrame(_)
                | EngineError::UnsupportedVersion(_)
                | EngineError::SerializationFailed(_)
                | EngineError::DeserializationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(EngineError::ConnectionFailed("network error".into()).is_retryable());
        assert!(EngineError::Disconnected.is_retryable());
        assert!(EngineError::Timeout(30).is_retryable());

        assert!(!EngineError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!EngineError::MissingWorkerId.is_retryable());
        assert!(!EngineError::CommandRejected("offer gone".into()).is_retryable());
    }

    #[test]
    fn test_transition_errors_pass_through() {
        let core = TransitionError::NoActiveRide;
        let engine: EngineError = core.into();
        assert_eq!(engine.to_string(), "no active ride");
        assert!(!engine.is_retryable());
    }

    #[test]
    fn test_rest_status_display() {
        let err = EngineError::RestStatus {
            status: 503,
            body: "maintenance".into(),
        };
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("maintenance"));
    }
}
