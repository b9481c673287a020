//! Error types for queue stream operations.

use crate::message::LeaseToken;
use chrono::Duration;
use thiserror::Error;

/// Errors surfaced by a running stream.
///
/// None of these are fatal to the process. Read-side service failures stop
/// the poll loop; everything else leaves the stream usable.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] DeserializationError),

    #[error("Queue service {operation} failed: {source}")]
    Service {
        operation: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error("Stage failed: {message}")]
    Stage { message: String },

    #[error("Stream already has a subscriber")]
    AlreadySubscribed,

    #[error("Stream is closed")]
    Closed,
}

impl StreamError {
    pub(crate) fn service(operation: &'static str, source: ServiceError) -> Self {
        Self::Service { operation, source }
    }

    /// Name of the operation that produced this error, for logging.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Serialization(_) => "serialize",
            Self::Deserialization(_) => "deserialize",
            Self::Service { operation, .. } => operation,
            Self::Stage { .. } => "stage",
            Self::AlreadySubscribed => "subscribe",
            Self::Closed => "subscribe",
        }
    }

    /// The underlying service failure, if this error came from the queue service
    pub fn as_service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Failures reported by a queue service implementation
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Lease token is invalid or expired: {lease_token}")]
    InvalidLeaseToken { lease_token: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Request throttled: {message}")]
    Throttled { message: String },

    #[error("Provider error: {code} - {message}")]
    Provider { code: String, message: String },
}

/// Provider codes that describe the request itself, not the service's state
const PERMANENT_PROVIDER_CODES: &[&str] = &[
    "MessageTooLong",
    "MalformedResponse",
    "InvalidParameterValue",
    "InvalidAttributeName",
    "InvalidMessageContents",
    "MissingParameter",
    "UnsupportedOperation",
    "InvalidAction",
];

impl ServiceError {
    /// Check if the failure is likely to clear up on its own.
    ///
    /// The stream never retries; this is a hint for callers deciding whether
    /// to rebuild a stream after its poll loop stopped.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::InvalidLeaseToken { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::Throttled { .. } => true,
            Self::Provider { code, .. } => !PERMANENT_PROVIDER_CODES.contains(&code.as_str()),
        }
    }

    /// Get suggested delay before rebuilding
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionFailed { .. } => Some(Duration::seconds(5)),
            Self::Throttled { .. } => Some(Duration::seconds(1)),
            _ => None,
        }
    }
}

/// A write-side payload could not be encoded
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A dequeued message body could not be decoded into a job payload
#[derive(Debug, Error)]
#[error("Message {lease_token} has a malformed body: {source}")]
pub struct DeserializationError {
    pub lease_token: LeaseToken,
    #[source]
    pub source: serde_json::Error,
}

/// A progress report could not be delivered to its interceptor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressError {
    #[error("Progress reporter is detached from its interceptor")]
    Detached,
}

/// Invalid stream configuration, raised at construction time
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration value {key}={value} exceeds maximum {max}")]
    OutOfRange { key: String, value: u32, max: u32 },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for domain identifiers
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
