//! Queue service implementations.
//!
//! This module contains concrete implementations of the `QueueService` trait
//! for an in-process queue and for Amazon SQS.

pub mod memory;
pub mod sqs;

pub use memory::InMemoryQueueService;
pub use sqs::{SqsCredentials, SqsQueueService};
