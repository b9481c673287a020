//! Pipe composition: a consumer stage spliced between a stream and an
//! interceptor.
//!
//! ```text
//! QueueStream ──jobs──▶ Stage ──Emitted──▶ CompletionInterceptor ──▶ Pipeline
//!                         │                      ▲
//!                         └──── progress ────────┘
//! ```
//!
//! The stage only sees [`LeasedJob`]s and a [`StageContext`]; it never talks
//! to the queue. The [`Pipeline`] handed back to the caller is the
//! interceptor's output, so anything downstream observes items whose
//! acknowledgment already happened.

use crate::error::{ProgressError, StreamError};
use crate::interceptor::{CompletionInterceptor, ProgressReporter};
use crate::message::{Emitted, LeasedJob};
use crate::service::LeaseKeeper;
use crate::stream::JobReceiver;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;

/// Item type flowing out of a stage and out of a pipeline
pub type EmittedResult<T, P> = Result<Emitted<T, P>, StreamError>;

/// A consumer of leased jobs.
///
/// Finish a job by handing it back through [`StageContext::finish`]; emit
/// anything else through [`StageContext::pass`]. An error returned from
/// `process` shows up on the pipeline's output and the stage keeps receiving
/// jobs.
#[async_trait]
pub trait Stage<P: Send + 'static>: Send + 'static {
    type Output: Send + 'static;

    async fn process(
        &mut self,
        job: LeasedJob<P>,
        ctx: &StageContext<Self::Output, P>,
    ) -> Result<(), StreamError>;
}

/// What a stage may do with its output
pub struct StageContext<T, P> {
    output: mpsc::Sender<EmittedResult<T, P>>,
    reporter: ProgressReporter,
    keeper: LeaseKeeper,
}

impl<T, P> StageContext<T, P> {
    /// Emit a finished job; its lease is deleted before it travels on
    pub async fn finish(&self, job: LeasedJob<P>) -> Result<(), StreamError> {
        self.emit(Emitted::Completed(job)).await
    }

    /// Emit a value that is not a finished job
    pub async fn pass(&self, value: T) -> Result<(), StreamError> {
        self.emit(Emitted::Passthrough(value)).await
    }

    /// Report that `job` is still in progress, extending its lease
    pub fn progress(&self, job: &LeasedJob<P>, amount: f64) -> Result<(), ProgressError> {
        self.reporter.report(job, amount)
    }

    /// Lease keeper of the stream this stage reads from
    pub fn lease_keeper(&self) -> &LeaseKeeper {
        &self.keeper
    }

    async fn emit(&self, item: Emitted<T, P>) -> Result<(), StreamError> {
        self.output
            .send(Ok(item))
            .await
            .map_err(|_| StreamError::Closed)
    }
}

/// The downstream end of a piped stream
pub struct Pipeline<T, P = serde_json::Value> {
    output: mpsc::Receiver<EmittedResult<T, P>>,
}

impl<T, P> Pipeline<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    /// Wire `jobs` through `stage` and `interceptor`, each on its own task
    pub(crate) fn spawn<S>(
        mut jobs: JobReceiver<P>,
        mut stage: S,
        interceptor: CompletionInterceptor,
        capacity: usize,
    ) -> Self
    where
        S: Stage<P, Output = T>,
    {
        let (stage_tx, stage_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);

        let ctx = StageContext {
            output: stage_tx,
            reporter: interceptor.attach(),
            keeper: interceptor.lease_keeper().clone(),
        };
        interceptor.spawn(stage_rx, output_tx);

        tokio::spawn(async move {
            while let Some(item) = jobs.recv().await {
                let outcome = match item {
                    Ok(job) => stage.process(job, &ctx).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    if ctx.output.send(Err(e)).await.is_err() {
                        break;
                    }
                }
            }
            debug!("Stage finished");
        });

        Self { output: output_rx }
    }
}

impl<T, P> Pipeline<T, P> {
    /// Next acknowledged item; `None` once the stream and stage have ended
    pub async fn next(&mut self) -> Option<EmittedResult<T, P>> {
        self.output.recv().await
    }

    /// The underlying channel, for chaining into further tasks
    pub fn into_inner(self) -> mpsc::Receiver<EmittedResult<T, P>> {
        self.output
    }
}

impl<T, P> std::fmt::Debug for Pipeline<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}
