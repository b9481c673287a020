//! The bidirectional queue stream.
//!
//! Writing enqueues jobs; subscribing starts a poll task that leases messages
//! in batches and hands them to the reader as [`LeasedJob`]s. The stream holds
//! no job once it has been handed downstream: acknowledgment happens through
//! a [`LeaseKeeper`], usually via [`QueueStream::pipe`].

use crate::config::StreamConfig;
use crate::error::{ConfigurationError, DeserializationError, SerializationError, StreamError};
use crate::interceptor::CompletionInterceptor;
use crate::message::{LeasedJob, NewJob, RawMessage};
use crate::pipeline::{Pipeline, Stage};
use crate::providers::SqsQueueService;
use crate::service::{LeaseKeeper, QueueService};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;

/// One item of the read side: a job, or an error scoped to one message or
/// to the poll loop
pub type JobResult<P> = Result<LeasedJob<P>, StreamError>;

/// A stream over one queue.
///
/// Dropping the stream leaves a running poll task alone; call
/// [`close`](Self::close) or drop the receiver to stop it.
pub struct QueueStream {
    config: StreamConfig,
    service: Arc<dyn QueueService>,
    write_permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    subscribed: AtomicBool,
}

impl QueueStream {
    /// Create a stream over an existing service client
    pub fn new(config: StreamConfig, service: Arc<dyn QueueService>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let write_permits = Arc::new(Semaphore::new(config.high_water_mark() as usize));

        Self {
            config,
            service,
            write_permits,
            shutdown_tx,
            subscribed: AtomicBool::new(false),
        }
    }

    /// Create a stream talking to SQS, deriving region from the queue URL and
    /// credentials from the environment
    pub fn from_config(config: StreamConfig) -> Result<Self, ConfigurationError> {
        let service = SqsQueueService::from_queue_ref(config.queue())?;
        Ok(Self::new(config, Arc::new(service)))
    }

    /// Get the stream's configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Capability to delete or extend jobs leased from this stream's queue
    pub fn lease_keeper(&self) -> LeaseKeeper {
        LeaseKeeper::from_config(Arc::clone(&self.service), &self.config)
    }

    /// Check whether `close` has been called
    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Enqueue one job.
    ///
    /// At most `high_water_mark` writes are in flight at once; further
    /// callers wait. A payload that cannot be serialized fails without
    /// touching the queue. Service failures are returned, not retried.
    pub async fn write<P: Serialize>(&self, job: NewJob<P>) -> Result<(), StreamError> {
        let _permit = self
            .write_permits
            .acquire()
            .await
            .map_err(|_| StreamError::Closed)?;

        let body = serde_json::to_string(&job.payload).map_err(SerializationError::from)?;
        let delay_seconds = job.delay_seconds.unwrap_or(0);

        self.service
            .enqueue(self.config.queue(), body, delay_seconds)
            .await
            .map_err(|e| {
                warn!(queue = %self.config.queue(), error = %e, "Enqueue failed");
                StreamError::service("enqueue", e)
            })?;

        debug!(queue = %self.config.queue(), delay_seconds, "Job written");
        Ok(())
    }

    /// Start the poll loop and return the read side.
    ///
    /// A stream has a single reader: a second call fails with
    /// [`StreamError::AlreadySubscribed`], a call after [`close`](Self::close)
    /// with [`StreamError::Closed`].
    pub fn subscribe<P>(&self) -> Result<JobReceiver<P>, StreamError>
    where
        P: DeserializeOwned + Send + 'static,
    {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadySubscribed);
        }

        let (tx, rx) = mpsc::channel(self.config.high_water_mark() as usize);
        let poller = Poller {
            service: Arc::clone(&self.service),
            config: self.config.clone(),
            jobs: tx,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        info!(
            queue = %self.config.queue(),
            batch_size = self.config.batch_size(),
            wait_seconds = self.config.wait_seconds(),
            lease_seconds = self.config.lease_seconds(),
            "Subscribing to queue"
        );
        tokio::spawn(poller.run());

        Ok(JobReceiver { jobs: rx })
    }

    /// Connect a consumer stage to the read side.
    ///
    /// Everything the stage emits passes through a [`CompletionInterceptor`]
    /// before it reaches the returned [`Pipeline`], so finished jobs are
    /// deleted and progress extends leases without the stage knowing about
    /// the queue.
    pub fn pipe<S, P>(&self, stage: S) -> Result<Pipeline<S::Output, P>, StreamError>
    where
        S: Stage<P>,
        P: DeserializeOwned + Send + 'static,
    {
        let jobs = self.subscribe::<P>()?;
        let interceptor = CompletionInterceptor::new(self.lease_keeper());
        Ok(Pipeline::spawn(
            jobs,
            stage,
            interceptor,
            self.config.high_water_mark() as usize,
        ))
    }

    /// Like [`pipe`](Self::pipe), building the stage from this stream's
    /// lease keeper
    pub fn pipe_with<F, S, P>(&self, build: F) -> Result<Pipeline<S::Output, P>, StreamError>
    where
        F: FnOnce(LeaseKeeper) -> S,
        S: Stage<P>,
        P: DeserializeOwned + Send + 'static,
    {
        let stage = build(self.lease_keeper());
        self.pipe(stage)
    }

    /// End the read side.
    ///
    /// A receive call already in flight runs to completion and its messages
    /// are still delivered; no further calls are made. Writes stay possible.
    pub fn close(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!(queue = %self.config.queue(), "Closing queue stream");
        }
    }
}

impl std::fmt::Debug for QueueStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStream")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .field("subscribed", &self.subscribed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Read side of a [`QueueStream`].
///
/// Yields `None` once the poll loop has stopped and every buffered item has
/// been taken.
pub struct JobReceiver<P> {
    jobs: mpsc::Receiver<JobResult<P>>,
}

impl<P> JobReceiver<P> {
    /// Next job or read failure; `None` once polling has stopped
    pub async fn recv(&mut self) -> Option<JobResult<P>> {
        self.jobs.recv().await
    }
}

impl<P> std::fmt::Debug for JobReceiver<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobReceiver").finish_non_exhaustive()
    }
}

// ============================================================================
// Poll Loop
// ============================================================================

struct Poller<P> {
    service: Arc<dyn QueueService>,
    config: StreamConfig,
    jobs: mpsc::Sender<JobResult<P>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<P: DeserializeOwned + Send + 'static> Poller<P> {
    async fn run(self) {
        let queue = self.config.queue();

        loop {
            if *self.shutdown_rx.borrow() {
                debug!(queue = %queue, "Stream closed; not polling again");
                break;
            }
            if self.jobs.is_closed() {
                debug!(queue = %queue, "Receiver dropped; not polling again");
                break;
            }

            let batch = self
                .service
                .dequeue_batch(
                    queue,
                    self.config.batch_size(),
                    self.config.lease_seconds(),
                    self.config.wait_seconds(),
                )
                .await;

            let messages = match batch {
                Ok(messages) => messages,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Receive failed; stopping poll loop");
                    let _ = self
                        .jobs
                        .send(Err(StreamError::service("dequeue_batch", e)))
                        .await;
                    break;
                }
            };

            if messages.is_empty() {
                trace!(queue = %queue, "Empty batch");
                tokio::task::yield_now().await;
                continue;
            }

            debug!(queue = %queue, count = messages.len(), "Received batch");
            for message in messages {
                if self.jobs.send(decode(message)).await.is_err() {
                    debug!(queue = %queue, "Receiver dropped mid-batch");
                    return;
                }
            }
        }

        info!(queue = %queue, "Poll loop stopped");
    }
}

/// Turn one delivery into a job, or an error scoped to that delivery
fn decode<P: DeserializeOwned>(message: RawMessage) -> JobResult<P> {
    let RawMessage {
        body,
        lease_token,
        receive_count,
    } = message;

    match serde_json::from_str::<P>(&body) {
        Ok(payload) => Ok(LeasedJob {
            payload,
            lease_token,
            receive_count,
        }),
        Err(source) => {
            warn!(lease_token = %lease_token, error = %source, "Malformed message body");
            Err(DeserializationError {
                lease_token,
                source,
            }
            .into())
        }
    }
}
