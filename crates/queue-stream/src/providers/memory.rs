//! In-memory queue service for testing and development.
//!
//! This module provides a fully functional in-process queue that:
//! - Delays visibility of enqueued messages by their requested delay
//! - Leases received messages for a visibility timeout
//! - Redelivers messages whose lease expired, with an incremented receive count
//! - Emulates long polling by waiting for a message up to the requested time
//!
//! Intended for unit tests of consumers and for running pipelines locally
//! without a cloud queue.

use crate::error::ServiceError;
use crate::message::{LeaseToken, QueueRef, RawMessage};
use crate::service::QueueService;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message waiting in the queue
#[derive(Clone)]
struct StoredMessage {
    body: String,
    receive_count: u32,
    available_at: DateTime<Utc>,
}

impl StoredMessage {
    fn is_available(&self, now: DateTime<Utc>) -> bool {
        now >= self.available_at
    }
}

/// A message currently leased to a consumer
struct InFlightMessage {
    message: StoredMessage,
    lease_expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct InMemoryQueue {
    messages: VecDeque<StoredMessage>,
    in_flight: HashMap<LeaseToken, InFlightMessage>,
}

impl InMemoryQueue {
    /// Return messages with expired leases to the queue
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<LeaseToken> = self
            .in_flight
            .iter()
            .filter(|(_, m)| now >= m.lease_expires_at)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(in_flight) = self.in_flight.remove(&token) {
                trace!(lease_token = %token, "Lease expired; message visible again");
                self.messages.push_back(StoredMessage {
                    available_at: now,
                    ..in_flight.message
                });
            }
        }
    }

    /// Lease up to `max_count` visible messages, oldest first
    fn lease(&mut self, max_count: usize, lease: Duration, now: DateTime<Utc>) -> Vec<RawMessage> {
        let mut leased = Vec::new();
        let mut index = 0;

        while leased.len() < max_count && index < self.messages.len() {
            if !self.messages[index].is_available(now) {
                index += 1;
                continue;
            }

            let Some(mut message) = self.messages.remove(index) else {
                break;
            };
            message.receive_count += 1;

            let token = LeaseToken::new(uuid::Uuid::new_v4().to_string());
            leased.push(RawMessage::new(
                message.body.clone(),
                token.clone(),
                message.receive_count,
            ));
            self.in_flight.insert(
                token,
                InFlightMessage {
                    message,
                    lease_expires_at: now + lease,
                },
            );
        }

        leased
    }

    /// Earliest moment something may become receivable
    fn next_change(&self) -> Option<DateTime<Utc>> {
        let next_visible = self.messages.iter().map(|m| m.available_at).min();
        let next_expiry = self.in_flight.values().map(|m| m.lease_expires_at).min();

        match (next_visible, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

// ============================================================================
// InMemoryQueueService
// ============================================================================

/// In-memory queue service; queues are created on first use
#[derive(Clone, Default)]
pub struct InMemoryQueueService {
    queues: Arc<Mutex<HashMap<QueueRef, InMemoryQueue>>>,
    notify: Arc<Notify>,
}

impl InMemoryQueueService {
    /// Create an empty service with no queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting or delayed in the queue, not counting leased ones
    pub async fn pending_count(&self, queue: &QueueRef) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Messages currently leased to a consumer
    pub async fn in_flight_count(&self, queue: &QueueRef) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, |q| q.in_flight.len())
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn enqueue(
        &self,
        queue: &QueueRef,
        body: String,
        delay_seconds: u32,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        {
            let mut queues = self.queues.lock().await;
            queues
                .entry(queue.clone())
                .or_default()
                .messages
                .push_back(StoredMessage {
                    body,
                    receive_count: 0,
                    available_at: now + Duration::seconds(i64::from(delay_seconds)),
                });
        }

        debug!(queue = %queue, delay_seconds, "Message enqueued");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        queue: &QueueRef,
        max_count: u32,
        lease_seconds: u32,
        wait_seconds: u32,
    ) -> Result<Vec<RawMessage>, ServiceError> {
        let deadline = Utc::now() + Duration::seconds(i64::from(wait_seconds));
        let lease = Duration::seconds(i64::from(lease_seconds));
        let max_count = max_count.max(1) as usize;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Utc::now();
            let wake_at = {
                let mut queues = self.queues.lock().await;
                let state = queues.entry(queue.clone()).or_default();
                state.reclaim_expired(now);

                let leased = state.lease(max_count, lease, now);
                if !leased.is_empty() {
                    debug!(queue = %queue, count = leased.len(), "Messages leased");
                    return Ok(leased);
                }

                match state.next_change() {
                    Some(change) => change.min(deadline),
                    None => deadline,
                }
            };

            if now >= deadline {
                return Ok(Vec::new());
            }

            let pause = (wake_at - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            let _ = tokio::time::timeout(pause, notified).await;
        }
    }

    async fn delete_message(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
    ) -> Result<(), ServiceError> {
        let mut queues = self.queues.lock().await;
        let removed = queues.get_mut(queue).and_then(|q| {
            q.reclaim_expired(Utc::now());
            q.in_flight.remove(lease_token)
        });

        match removed {
            Some(_) => {
                debug!(queue = %queue, lease_token = %lease_token, "Message deleted");
                Ok(())
            }
            None => Err(ServiceError::InvalidLeaseToken {
                lease_token: lease_token.to_string(),
            }),
        }
    }

    async fn extend_lease(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
        lease_seconds: u32,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        {
            let mut queues = self.queues.lock().await;
            let in_flight = queues
                .get_mut(queue)
                .and_then(|q| {
                    q.reclaim_expired(now);
                    q.in_flight.get_mut(lease_token)
                })
                .ok_or_else(|| ServiceError::InvalidLeaseToken {
                    lease_token: lease_token.to_string(),
                })?;
            in_flight.lease_expires_at = now + Duration::seconds(i64::from(lease_seconds));
        }

        // A zero lease makes the message receivable right away
        if lease_seconds == 0 {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
