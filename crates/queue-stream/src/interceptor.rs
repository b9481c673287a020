//! Completion interception: turning a consumer's output into acknowledgments.
//!
//! A [`CompletionInterceptor`] sits after a consumer stage. Items tagged
//! [`Emitted::Completed`] have their lease deleted before they are forwarded;
//! [`Emitted::Passthrough`] items go through untouched. Progress reported
//! through an attached [`ProgressReporter`] extends the job's lease.
//!
//! Only one reporter is attached at a time. Attaching again, or detaching,
//! cuts off every earlier reporter: its reports are refused and signals it
//! queued before the cut are dropped without an extend call.

use crate::error::{ProgressError, StreamError};
use crate::message::{Emitted, LeasedJob, ProgressSignal};
use crate::service::LeaseKeeper;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "interceptor_tests.rs"]
mod tests;

type TaggedSignal = (u64, ProgressSignal);

/// Deletes completed jobs and extends leases on progress
pub struct CompletionInterceptor {
    keeper: LeaseKeeper,
    attachment: Arc<AtomicU64>,
    signals_tx: mpsc::UnboundedSender<TaggedSignal>,
    signals_rx: mpsc::UnboundedReceiver<TaggedSignal>,
}

impl CompletionInterceptor {
    /// Create an interceptor acknowledging through `keeper`
    pub fn new(keeper: LeaseKeeper) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            keeper,
            attachment: Arc::new(AtomicU64::new(0)),
            signals_tx,
            signals_rx,
        }
    }

    /// Lease keeper used for deletes and extensions
    pub fn lease_keeper(&self) -> &LeaseKeeper {
        &self.keeper
    }

    /// Subscribe to a producing stage's progress, replacing any earlier
    /// subscription
    pub fn attach(&self) -> ProgressReporter {
        let generation = self.attachment.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(queue = %self.keeper.queue(), generation, "Progress reporter attached");

        ProgressReporter {
            generation,
            attachment: Arc::clone(&self.attachment),
            signals: self.signals_tx.clone(),
        }
    }

    /// Remove the current progress subscription
    pub fn detach(&self) {
        self.attachment.fetch_add(1, Ordering::SeqCst);
        debug!(queue = %self.keeper.queue(), "Progress reporter detached");
    }

    /// Acknowledge one emitted item.
    ///
    /// A completed job is forwarded only after its delete succeeded; on
    /// failure the error is returned instead and the job is not forwarded.
    pub async fn intercept<T, P>(&self, item: Emitted<T, P>) -> Result<Emitted<T, P>, StreamError> {
        if let Some(lease_token) = item.lease_token().cloned() {
            if let Err(e) = self.keeper.delete(&lease_token).await {
                warn!(
                    queue = %self.keeper.queue(),
                    lease_token = %lease_token,
                    error = %e,
                    "Delete failed; job not forwarded"
                );
                return Err(e);
            }
        }

        Ok(item)
    }

    /// Apply every progress signal already queued, returning the failures
    pub async fn flush_progress(&mut self) -> Vec<StreamError> {
        let mut failures = Vec::new();
        while let Ok((generation, signal)) = self.signals_rx.try_recv() {
            if let Some(Err(e)) = self.apply(generation, signal).await {
                failures.push(e);
            }
        }
        failures
    }

    /// Extend the lease named by a signal, unless its reporter was cut off
    async fn apply(&self, generation: u64, signal: ProgressSignal) -> Option<Result<(), StreamError>> {
        if generation != self.attachment.load(Ordering::SeqCst) {
            debug!(
                lease_token = %signal.lease_token,
                "Dropping progress from a detached reporter"
            );
            return None;
        }

        let result = self.keeper.extend(&signal.lease_token, signal.amount).await;
        if let Err(ref e) = result {
            warn!(lease_token = %signal.lease_token, error = %e, "Lease extension failed");
        }
        Some(result)
    }

    /// Run as a pass-through task between `input` and `output`.
    ///
    /// Errors arriving on `input` are forwarded as they are. Progress
    /// signals are handled ahead of items and keep being applied while
    /// `output` is full; extend failures are emitted on `output` after the
    /// item being forwarded at the time. Once `input` is exhausted, queued
    /// signals are applied and the current reporter is detached. The task
    /// also ends when `output` is dropped.
    pub fn spawn<T, P>(
        mut self,
        mut input: mpsc::Receiver<Result<Emitted<T, P>, StreamError>>,
        output: mpsc::Sender<Result<Emitted<T, P>, StreamError>>,
    ) -> JoinHandle<()>
    where
        T: Send + 'static,
        P: Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                let forwarded = tokio::select! {
                    biased;
                    Some((generation, signal)) = self.signals_rx.recv() => {
                        match self.apply(generation, signal).await {
                            Some(Err(e)) => Err(e),
                            _ => continue,
                        }
                    }
                    item = input.recv() => match item {
                        Some(Ok(item)) => self.intercept(item).await,
                        Some(Err(e)) => Err(e),
                        None => break,
                    },
                };
                if !self.forward(&output, forwarded).await {
                    return;
                }
            }

            let failures = self.flush_progress().await;
            self.detach();
            for e in failures {
                if output.send(Err(e)).await.is_err() {
                    return;
                }
            }
        })
    }

    /// Send `item` on `output`, applying progress signals while waiting for
    /// capacity. Returns `false` once `output` is closed.
    async fn forward<T, P>(
        &mut self,
        output: &mpsc::Sender<Result<Emitted<T, P>, StreamError>>,
        item: Result<Emitted<T, P>, StreamError>,
    ) -> bool {
        let mut pending = VecDeque::from([item]);

        while let Some(next) = pending.pop_front() {
            loop {
                tokio::select! {
                    biased;
                    Some((generation, signal)) = self.signals_rx.recv() => {
                        if let Some(Err(e)) = self.apply(generation, signal).await {
                            pending.push_back(Err(e));
                        }
                    }
                    permit = output.reserve() => match permit {
                        Ok(permit) => {
                            permit.send(next);
                            break;
                        }
                        Err(_) => return false,
                    },
                }
            }
        }

        true
    }
}

impl std::fmt::Debug for CompletionInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionInterceptor")
            .field("keeper", &self.keeper)
            .field("attachment", &self.attachment.load(Ordering::SeqCst))
            .finish()
    }
}

/// Progress channel handed to a producing stage.
///
/// Valid until its interceptor attaches another reporter or detaches.
#[derive(Clone)]
pub struct ProgressReporter {
    generation: u64,
    attachment: Arc<AtomicU64>,
    signals: mpsc::UnboundedSender<TaggedSignal>,
}

impl ProgressReporter {
    /// Check whether reports from this reporter are still accepted
    pub fn is_attached(&self) -> bool {
        self.attachment.load(Ordering::SeqCst) == self.generation
    }

    /// Signal that `job` is still being worked on; its lease gets extended
    pub fn report<P>(&self, job: &LeasedJob<P>, amount: f64) -> Result<(), ProgressError> {
        if !self.is_attached() {
            return Err(ProgressError::Detached);
        }

        let signal = ProgressSignal {
            lease_token: job.lease_token.clone(),
            amount,
        };
        self.signals
            .send((self.generation, signal))
            .map_err(|_| ProgressError::Detached)
    }

    /// Detach this reporter, unless it was already replaced
    pub fn detach(self) {
        let _ = self.attachment.compare_exchange(
            self.generation,
            self.generation + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("generation", &self.generation)
            .field("attached", &self.is_attached())
            .finish()
    }
}
