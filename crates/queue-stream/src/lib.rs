//! # Queue Stream
//!
//! Streaming access to an at-least-once message queue with lease-based
//! delivery, such as Amazon SQS.
//!
//! This library provides:
//! - A write side that serializes jobs and enqueues them, with backpressure
//! - A read side fed by a continuous long-poll loop
//! - Transparent acknowledgment: jobs a consumer stage finishes are deleted,
//!   progress it reports extends the job's lease
//! - In-memory and SQS implementations of the queue service
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for streams, services and configuration
//! - [`message`] - Queue references, lease tokens and jobs
//! - [`config`] - Stream options and validated configuration
//! - [`service`] - The queue service contract and the lease keeper
//! - [`stream`] - The queue stream and its poll loop
//! - [`interceptor`] - Completion interception
//! - [`pipeline`] - Consumer stages and pipe composition
//! - [`providers`] - Queue service implementations
//!
//! ## Usage
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use queue_stream::{
//!     InMemoryQueueService, LeasedJob, NewJob, QueueStream, Stage, StageContext, StreamConfig,
//!     StreamError,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Stage<Value> for Greeter {
//!     type Output = String;
//!
//!     async fn process(
//!         &mut self,
//!         job: LeasedJob,
//!         ctx: &StageContext<String, Value>,
//!     ) -> Result<(), StreamError> {
//!         ctx.pass(format!("hello {}", job.payload["name"])).await?;
//!         ctx.finish(job).await
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StreamConfig::new("jobs")?;
//! let stream = QueueStream::new(config, Arc::new(InMemoryQueueService::new()));
//!
//! stream.write(NewJob::new(json!({"name": "world"}))).await?;
//!
//! let mut pipeline = stream.pipe(Greeter)?;
//! while let Some(item) = pipeline.next().await {
//!     println!("{:?}", item?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod interceptor;
pub mod message;
pub mod pipeline;
pub mod providers;
pub mod service;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types at crate root for convenience
pub use config::{StreamConfig, StreamOptions, MAX_BATCH_SIZE};
pub use error::{
    ConfigurationError, DeserializationError, ProgressError, SerializationError, ServiceError,
    StreamError, ValidationError,
};
pub use interceptor::{CompletionInterceptor, ProgressReporter};
pub use message::{Emitted, LeaseToken, LeasedJob, NewJob, ProgressSignal, QueueRef, RawMessage};
pub use pipeline::{Pipeline, Stage, StageContext};
pub use providers::{InMemoryQueueService, SqsCredentials, SqsQueueService};
pub use service::{LeaseKeeper, QueueService};
pub use stream::{JobReceiver, QueueStream};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
