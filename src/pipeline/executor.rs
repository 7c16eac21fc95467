//! The bounded task executor.
//!
//! Given a list of units and a ledger, we skip units the ledger already marks
//! complete, then push the rest through a [`WorkQueue`] capped at
//! `concurrency`. Each unit gets up to `max_retries` attempts with exponential
//! backoff between them. Failures stay with their unit: a unit that runs out
//! of attempts is recorded as failed and its siblings carry on.
//!
//! Outcomes flow back to the single task that called [`Executor::run`], which
//! owns the ledger. It records each outcome and persists the ledger before
//! looking at the next one, so a crash loses at most the units still in
//! flight and the ledger never needs a lock.

use std::{fmt, sync::Arc};

use futures::{FutureExt as _, StreamExt as _, stream};
use keen_retry::RetryResult;
use leaky_bucket::RateLimiter;
use tokio::time::sleep;

use crate::{
    pipeline::manifest::{Ledger, Outcome},
    prelude::*,
    queues::work::{WorkFn, WorkQueue},
    retry::{AttemptResult, RetryPolicy},
    ui::{ProgressConfig, Ui},
};

/// Something the executor can schedule.
pub trait WorkUnit: Send + Sync + 'static {
    type Key: Clone + fmt::Display + Send + Sync + 'static;

    /// The ledger key for this unit.
    fn key(&self) -> Self::Key;
}

/// Performs a single attempt at a unit.
///
/// Return [`RetryResult::Transient`] for failures worth retrying and
/// [`RetryResult::Fatal`] for failures that no retry will fix.
#[async_trait]
pub trait UnitProcessor<U: WorkUnit>: Send + Sync + 'static {
    async fn attempt(&self, unit: &U) -> AttemptResult<()>;
}

/// Persists a ledger after each recorded outcome.
#[async_trait]
pub trait Checkpoint<L>: Send + Sync {
    async fn persist(&self, ledger: &L) -> Result<()>;
}

/// A [`Checkpoint`] for ledgers that only live in memory.
pub struct NoCheckpoint;

#[async_trait]
impl<L: Sync> Checkpoint<L> for NoCheckpoint {
    async fn persist(&self, _ledger: &L) -> Result<()> {
        Ok(())
    }
}

/// Counts for one executor run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Units passed in.
    pub total: usize,
    /// Units the ledger already marked complete.
    pub skipped: usize,
    /// Units that completed during this run.
    pub completed: usize,
    /// Units that ran out of attempts or failed fatally during this run.
    pub failed: usize,
}

/// What happened to one unit.
struct UnitReport<K> {
    key: K,
    attempts: u32,
    outcome: Outcome,
}

/// Runs units with bounded concurrency and retries.
#[derive(Clone)]
pub struct Executor {
    label: String,
    concurrency: usize,
    retry: RetryPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
    ui: Ui,
}

impl Executor {
    /// Create an executor. `label` prefixes progress output, and is usually
    /// the volume ID.
    pub fn new(
        label: impl Into<String>,
        concurrency: usize,
        retry: RetryPolicy,
        ui: Ui,
    ) -> Self {
        Self {
            label: label.into(),
            concurrency: concurrency.max(1),
            retry,
            rate_limiter: None,
            ui,
        }
    }

    /// Make every attempt wait for a permit from `rate_limiter`.
    pub fn with_rate_limiter(mut self, rate_limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Run every unit not yet completed in `ledger`.
    ///
    /// Returns an error only if the work queue breaks or `checkpoint` cannot
    /// persist the ledger. Unit failures are recorded in the ledger.
    pub async fn run<U, L, P, C>(
        &self,
        units: Vec<U>,
        ledger: &mut L,
        processor: Arc<P>,
        checkpoint: &C,
    ) -> Result<RunSummary>
    where
        U: WorkUnit,
        L: Ledger<Key = U::Key>,
        P: UnitProcessor<U>,
        C: Checkpoint<L> + ?Sized,
    {
        let total = units.len();
        let remaining = units
            .into_iter()
            .filter(|unit| !ledger.is_completed(&unit.key()))
            .collect::<Vec<_>>();
        let mut summary = RunSummary {
            total,
            skipped: total - remaining.len(),
            ..RunSummary::default()
        };
        if remaining.is_empty() {
            info!("[{}] all units already complete", self.label);
            return Ok(summary);
        }
        info!(
            "[{}] {} units to process ({} already complete)",
            self.label,
            remaining.len(),
            summary.skipped
        );

        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🔄",
                msg: &self.label,
                done_msg: &format!("{} finished", self.label),
            },
            remaining.len() as u64,
        );

        let work_fn: WorkFn<U, UnitReport<U::Key>> = {
            let retry = self.retry.clone();
            let rate_limiter = self.rate_limiter.clone();
            let label = self.label.clone();
            Arc::new(move |unit| {
                run_unit(
                    label.clone(),
                    unit,
                    processor.clone(),
                    retry.clone(),
                    rate_limiter.clone(),
                )
                .boxed()
            })
        };
        let (queue, worker) = WorkQueue::new(self.concurrency, work_fn);
        let mut reports = queue
            .handle()
            .process_stream(stream::iter(remaining).boxed())
            .buffer_unordered(self.concurrency);

        let mut failure = None;
        while let Some(report) = reports.next().await {
            let report = match report {
                Ok(report) => report,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            ledger.record_outcome(&report.key, &report.outcome);
            if let Err(err) = checkpoint.persist(ledger).await {
                failure =
                    Some(err.context(format!("[{}] failed to save progress", self.label)));
                break;
            }
            pb.inc(1);
            match &report.outcome {
                Outcome::Completed => {
                    summary.completed += 1;
                    info!(
                        "[{}] {} done ({}/{})",
                        self.label,
                        report.key,
                        ledger.completed_count(),
                        total
                    );
                }
                Outcome::Failed(error) => {
                    summary.failed += 1;
                    error!(
                        "[{}] {} FAILED after {} attempts: {}",
                        self.label, report.key, report.attempts, error
                    );
                }
            }
        }

        // Dropping the stream stops new submissions. Units already handed to
        // the worker run to completion before we return.
        drop(reports);
        drop(queue);
        worker.join().await?;
        if let Some(err) = failure {
            pb.abandon();
            return Err(err);
        }
        pb.finish_using_style();
        Ok(summary)
    }
}

/// Attempt one unit until it succeeds, fails fatally, or runs out of
/// attempts.
#[instrument(level = "debug", skip_all, fields(key = %unit.key()))]
async fn run_unit<U, P>(
    label: String,
    unit: U,
    processor: Arc<P>,
    retry: RetryPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
) -> UnitReport<U::Key>
where
    U: WorkUnit,
    P: UnitProcessor<U>,
{
    let key = unit.key();
    let mut attempt = 1;
    loop {
        if let Some(rate_limiter) = &rate_limiter {
            rate_limiter.acquire_one().await;
        }
        let error = match processor.attempt(&unit).await {
            RetryResult::Ok { .. } => {
                return UnitReport {
                    key,
                    attempts: attempt,
                    outcome: Outcome::Completed,
                };
            }
            RetryResult::Transient { error, .. } if attempt < retry.max_retries => {
                let delay = retry.backoff_delay(attempt);
                warn!(
                    "[{label}] {key} retry {attempt}, waiting {:.1}s: {error:#}",
                    delay.as_secs_f64()
                );
                sleep(delay).await;
                attempt += 1;
                continue;
            }
            RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                error
            }
        };
        return UnitReport {
            key,
            attempts: attempt,
            outcome: Outcome::Failed(format!("{error:#}")),
        };
    }
}
