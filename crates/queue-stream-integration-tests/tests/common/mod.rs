//! Common test utilities for queue-stream integration tests
//!
//! This module provides:
//! - Log capture through `tracing-subscriber` (set `RUST_LOG` to see it)
//! - A scripted queue service that records every call
//! - Consumer stages used across test files

use async_trait::async_trait;
use queue_stream::{
    LeaseToken, LeasedJob, QueueRef, QueueService, RawMessage, ServiceError, Stage, StageContext,
    StreamError,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT_TRACING: Once = Once::new();

/// Install a log subscriber once per test binary
#[allow(dead_code)]
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "queue_stream=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

// ============================================================================
// Scripted Queue Service
// ============================================================================

/// A call observed by [`ScriptedService`]
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub enum ServiceCall {
    Enqueue(String, String, u32),
    DequeueBatch(String),
    Delete(String, String),
    ExtendLease(String, String, u32),
}

/// Queue service answering receives from a script and recording all calls
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct ScriptedService {
    calls: Arc<Mutex<Vec<ServiceCall>>>,
    batches: Arc<Mutex<VecDeque<Result<Vec<RawMessage>, ServiceError>>>>,
}

#[allow(dead_code)]
impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_return(&self, batch: Vec<RawMessage>) -> &Self {
        self.batches.lock().unwrap().push_back(Ok(batch));
        self
    }

    pub fn then_fail(&self, error: ServiceError) -> &Self {
        self.batches.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<ServiceCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, ServiceCall::Delete(..)))
            .collect()
    }

    pub fn extensions(&self) -> Vec<ServiceCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, ServiceCall::ExtendLease(..)))
            .collect()
    }

    fn record(&self, call: ServiceCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl QueueService for ScriptedService {
    async fn enqueue(
        &self,
        queue: &QueueRef,
        body: String,
        delay_seconds: u32,
    ) -> Result<(), ServiceError> {
        self.record(ServiceCall::Enqueue(queue.to_string(), body, delay_seconds));
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        queue: &QueueRef,
        _max_count: u32,
        _lease_seconds: u32,
        _wait_seconds: u32,
    ) -> Result<Vec<RawMessage>, ServiceError> {
        self.record(ServiceCall::DequeueBatch(queue.to_string()));
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                // Stand-in for a long poll that found nothing
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_message(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
    ) -> Result<(), ServiceError> {
        self.record(ServiceCall::Delete(queue.to_string(), lease_token.to_string()));
        Ok(())
    }

    async fn extend_lease(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
        lease_seconds: u32,
    ) -> Result<(), ServiceError> {
        self.record(ServiceCall::ExtendLease(
            queue.to_string(),
            lease_token.to_string(),
            lease_seconds,
        ));
        Ok(())
    }
}

#[allow(dead_code)]
pub fn raw(body: &str, token: &str, receive_count: u32) -> RawMessage {
    RawMessage::new(body, LeaseToken::new(token), receive_count)
}

// ============================================================================
// Stages
// ============================================================================

/// Finishes every job right away
#[allow(dead_code)]
pub struct EchoStage;

#[async_trait]
impl Stage<Value> for EchoStage {
    type Output = Value;

    async fn process(
        &mut self,
        job: LeasedJob,
        ctx: &StageContext<Value, Value>,
    ) -> Result<(), StreamError> {
        ctx.finish(job).await
    }
}

/// Reports progress every `step` for `steps` times before finishing
#[allow(dead_code)]
pub struct SlowStage {
    pub step: Duration,
    pub steps: u32,
}

#[async_trait]
impl Stage<Value> for SlowStage {
    type Output = Value;

    async fn process(
        &mut self,
        job: LeasedJob,
        ctx: &StageContext<Value, Value>,
    ) -> Result<(), StreamError> {
        for done in 1..=self.steps {
            tokio::time::sleep(self.step).await;
            ctx.progress(&job, f64::from(done) / f64::from(self.steps))
                .map_err(|e| StreamError::Stage {
                    message: e.to_string(),
                })?;
        }
        ctx.finish(job).await
    }
}
