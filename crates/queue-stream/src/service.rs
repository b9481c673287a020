//! The queue service contract and the lease-keeping capability built on it.

use crate::config::StreamConfig;
use crate::error::{ServiceError, StreamError};
use crate::message::{LeaseToken, LeasedJob, QueueRef, RawMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;

/// Operations a managed at-least-once queue must offer.
///
/// Implementations are shared across tasks behind an `Arc`; every method may
/// be called concurrently.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Enqueue one message body, invisible for `delay_seconds`
    async fn enqueue(
        &self,
        queue: &QueueRef,
        body: String,
        delay_seconds: u32,
    ) -> Result<(), ServiceError>;

    /// Lease up to `max_count` messages for `lease_seconds`, waiting up to
    /// `wait_seconds` for at least one to become available
    async fn dequeue_batch(
        &self,
        queue: &QueueRef,
        max_count: u32,
        lease_seconds: u32,
        wait_seconds: u32,
    ) -> Result<Vec<RawMessage>, ServiceError>;

    /// Delete the delivery identified by `lease_token`
    async fn delete_message(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
    ) -> Result<(), ServiceError>;

    /// Reset the lease of a delivery to `lease_seconds` from now
    async fn extend_lease(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
        lease_seconds: u32,
    ) -> Result<(), ServiceError>;
}

/// Capability to acknowledge or extend leased jobs of one queue.
///
/// Handed explicitly to whoever needs it; cloning is cheap.
#[derive(Clone)]
pub struct LeaseKeeper {
    service: Arc<dyn QueueService>,
    queue: QueueRef,
    extend_lease_seconds: u32,
}

impl LeaseKeeper {
    /// Create a keeper for leases on `queue`
    pub fn new(service: Arc<dyn QueueService>, queue: QueueRef, extend_lease_seconds: u32) -> Self {
        Self {
            service,
            queue,
            extend_lease_seconds,
        }
    }

    pub(crate) fn from_config(service: Arc<dyn QueueService>, config: &StreamConfig) -> Self {
        Self::new(
            service,
            config.queue().clone(),
            config.extend_lease_seconds(),
        )
    }

    /// Get the queue whose leases this keeper manages
    pub fn queue(&self) -> &QueueRef {
        &self.queue
    }

    /// Delete a finished job from the queue
    pub async fn complete<P>(&self, job: &LeasedJob<P>) -> Result<(), StreamError> {
        self.delete(&job.lease_token).await
    }

    /// Delete the delivery identified by `lease_token`
    pub async fn delete(&self, lease_token: &LeaseToken) -> Result<(), StreamError> {
        debug!(queue = %self.queue, lease_token = %lease_token, "Deleting message");
        self.service
            .delete_message(&self.queue, lease_token)
            .await
            .map_err(|e| StreamError::service("delete_message", e))
    }

    /// Push the lease of a delivery out by the configured extension
    pub async fn extend(&self, lease_token: &LeaseToken, amount: f64) -> Result<(), StreamError> {
        debug!(
            queue = %self.queue,
            lease_token = %lease_token,
            amount,
            lease_seconds = self.extend_lease_seconds,
            "Extending lease"
        );
        self.service
            .extend_lease(&self.queue, lease_token, self.extend_lease_seconds)
            .await
            .map_err(|e| StreamError::service("extend_lease", e))
    }
}

impl std::fmt::Debug for LeaseKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseKeeper")
            .field("queue", &self.queue)
            .field("extend_lease_seconds", &self.extend_lease_seconds)
            .finish()
    }
}
