//! Scripted queue service shared by the unit tests.

use crate::error::ServiceError;
use crate::message::{LeaseToken, QueueRef, RawMessage};
use crate::service::QueueService;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded call against the service
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Enqueue {
        queue: String,
        body: String,
        delay_seconds: u32,
    },
    DequeueBatch {
        queue: String,
        max_count: u32,
        lease_seconds: u32,
        wait_seconds: u32,
    },
    Delete {
        queue: String,
        lease_token: String,
    },
    ExtendLease {
        queue: String,
        lease_token: String,
        lease_seconds: u32,
    },
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    dequeue_script: VecDeque<Result<Vec<RawMessage>, ServiceError>>,
    fail_enqueue: bool,
    fail_delete: bool,
    fail_extend: bool,
}

/// Records every call; dequeue answers come from a script.
///
/// Once the script runs out, `dequeue_batch` returns an empty batch after a
/// short pause, standing in for an expired long poll.
#[derive(Clone, Default)]
pub struct RecordingService {
    state: Arc<Mutex<State>>,
}

impl RecordingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, messages: Vec<RawMessage>) {
        self.state
            .lock()
            .unwrap()
            .dequeue_script
            .push_back(Ok(messages));
    }

    pub fn push_dequeue_error(&self, error: ServiceError) {
        self.state
            .lock()
            .unwrap()
            .dequeue_script
            .push_back(Err(error));
    }

    pub fn fail_enqueue(&self) {
        self.state.lock().unwrap().fail_enqueue = true;
    }

    pub fn fail_delete(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }

    pub fn fail_extend(&self) {
        self.state.lock().unwrap().fail_extend = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn enqueue_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Enqueue { .. }))
            .collect()
    }

    pub fn dequeue_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::DequeueBatch { .. }))
            .count()
    }

    pub fn deleted_tokens(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete { lease_token, .. } => Some(lease_token),
                _ => None,
            })
            .collect()
    }

    pub fn extended_tokens(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ExtendLease { lease_token, .. } => Some(lease_token),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

pub fn message(body: &str, token: &str, receive_count: u32) -> RawMessage {
    RawMessage::new(body, LeaseToken::new(token), receive_count)
}

pub fn provider_error(message: &str) -> ServiceError {
    ServiceError::Provider {
        code: "InternalError".to_string(),
        message: message.to_string(),
    }
}

#[async_trait]
impl QueueService for RecordingService {
    async fn enqueue(
        &self,
        queue: &QueueRef,
        body: String,
        delay_seconds: u32,
    ) -> Result<(), ServiceError> {
        self.record(Call::Enqueue {
            queue: queue.to_string(),
            body,
            delay_seconds,
        });
        if self.state.lock().unwrap().fail_enqueue {
            return Err(provider_error("enqueue refused"));
        }
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        queue: &QueueRef,
        max_count: u32,
        lease_seconds: u32,
        wait_seconds: u32,
    ) -> Result<Vec<RawMessage>, ServiceError> {
        self.record(Call::DequeueBatch {
            queue: queue.to_string(),
            max_count,
            lease_seconds,
            wait_seconds,
        });
        let next = self.state.lock().unwrap().dequeue_script.pop_front();
        match next {
            Some(result) => result,
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_message(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
    ) -> Result<(), ServiceError> {
        self.record(Call::Delete {
            queue: queue.to_string(),
            lease_token: lease_token.to_string(),
        });
        if self.state.lock().unwrap().fail_delete {
            return Err(ServiceError::InvalidLeaseToken {
                lease_token: lease_token.to_string(),
            });
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
        lease_seconds: u32,
    ) -> Result<(), ServiceError> {
        self.record(Call::ExtendLease {
            queue: queue.to_string(),
            lease_token: lease_token.to_string(),
            lease_seconds,
        });
        if self.state.lock().unwrap().fail_extend {
            return Err(provider_error("extend refused"));
        }
        Ok(())
    }
}
