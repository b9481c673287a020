//! Job and message types flowing through a queue stream.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Reference to a single queue, usually the queue URL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueRef(String);

impl QueueRef {
    /// Create new queue reference with validation
    pub fn new(reference: impl Into<String>) -> Result<Self, ValidationError> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "queue".to_string(),
            });
        }

        Ok(Self(reference))
    }

    /// Get queue reference as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Region embedded in an SQS queue URL.
    ///
    /// `https://sqs.eu-west-1.amazonaws.com/123456789012/jobs` yields
    /// `eu-west-1`. References that are not URLs, or whose host has fewer
    /// than three labels, have no region.
    pub fn region(&self) -> Option<String> {
        let url = url::Url::parse(&self.0).ok()?;
        let host = url.host_str()?;
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 3 || labels[1].is_empty() {
            return None;
        }

        Some(labels[1].to_string())
    }

    /// Scheme and host of a URL reference, e.g. `https://sqs.us-east-1.amazonaws.com`
    pub fn endpoint(&self) -> Option<String> {
        let url = url::Url::parse(&self.0).ok()?;
        let host = url.host_str()?;
        match url.port() {
            Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
            None => Some(format!("{}://{}", url.scheme(), host)),
        }
    }
}

impl std::fmt::Display for QueueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueRef {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Opaque handle for one delivery of one message.
///
/// Required to delete that delivery or extend its lease. A redelivered
/// message carries a different token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(String);

impl LeaseToken {
    /// Wrap a token issued by the queue service
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get token as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// A message exactly as the queue service delivered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub body: String,
    pub lease_token: LeaseToken,
    /// Number of times the service has delivered this message, starting at 1
    pub receive_count: u32,
}

impl RawMessage {
    /// Create a message as the service returned it
    pub fn new(body: impl Into<String>, lease_token: LeaseToken, receive_count: u32) -> Self {
        Self {
            body: body.into(),
            lease_token,
            receive_count,
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// A job a producer is about to write into the queue
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob<P = serde_json::Value> {
    pub payload: P,
    /// Seconds the message stays invisible after enqueue
    pub delay_seconds: Option<u32>,
}

impl<P> NewJob<P> {
    /// Create a job for immediate delivery
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            delay_seconds: None,
        }
    }

    /// Delay the first delivery of this job
    pub fn with_delay(mut self, seconds: u32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }
}

impl<P> From<P> for NewJob<P> {
    fn from(payload: P) -> Self {
        Self::new(payload)
    }
}

/// A job read from the queue, holding the lease of the delivery it came from.
///
/// The stream never rewrites any of these fields. Completing the job means
/// handing it back unchanged so its lease token can be deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob<P = serde_json::Value> {
    pub payload: P,
    pub lease_token: LeaseToken,
    pub receive_count: u32,
}

impl<P> LeasedJob<P> {
    /// Token identifying this delivery's lease
    pub fn lease_token(&self) -> &LeaseToken {
        &self.lease_token
    }

    /// True when the service has delivered this message before
    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }
}

/// An item produced by a consumer stage.
///
/// Only `Completed` items are acknowledged against the queue; everything a
/// stage emits that is not a finished job travels as `Passthrough`.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted<T, P = serde_json::Value> {
    Completed(LeasedJob<P>),
    Passthrough(T),
}

impl<T, P> Emitted<T, P> {
    /// Lease token of a completed job; `None` for passthrough values
    pub fn lease_token(&self) -> Option<&LeaseToken> {
        match self {
            Self::Completed(job) => Some(&job.lease_token),
            Self::Passthrough(_) => None,
        }
    }

    /// Take the job out of a `Completed` item
    pub fn into_completed(self) -> Option<LeasedJob<P>> {
        match self {
            Self::Completed(job) => Some(job),
            Self::Passthrough(_) => None,
        }
    }

    /// Take the value out of a `Passthrough` item
    pub fn into_passthrough(self) -> Option<T> {
        match self {
            Self::Completed(_) => None,
            Self::Passthrough(value) => Some(value),
        }
    }
}

/// Out-of-band notice that a job is still being worked on
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSignal {
    pub lease_token: LeaseToken,
    /// Opaque to the stream; only logged
    pub amount: f64,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
