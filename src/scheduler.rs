//! Adaptive batch scheduler.
//!
//! Dispatches batches of concurrent tasks, waits for each batch to settle,
//! and resizes the next batch from the batch's success rate. Stops when the
//! target number of successes is reached or the attempt ceiling is hit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ConcurrencyConfig;
use crate::error::FailureReason;
use crate::events::{EventEmitter, ProgressEvent, RunEvent};
use crate::state_machine::{Task, TaskId, TaskOutcome, TaskRecord};

/// Runs one task attempt to completion. Must never panic across the await;
/// panics are caught and recorded as failures anyway.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, task: TaskId) -> TaskRecord;
}

/// One change to the batch size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConcurrencyChange {
    pub batch: u32,
    pub from: usize,
    pub to: usize,
    pub rate: f64,
}

/// Picks the next batch size from the last batch's success rate.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    current: usize,
    min: usize,
    max: usize,
    raise_above: f64,
    lower_below: f64,
}

impl ConcurrencyController {
    pub fn new(initial: usize, min: usize, max: usize) -> Self {
        let min = min.min(max).max(1);
        Self {
            current: initial.clamp(min, max.max(min)),
            min,
            max: max.max(min),
            raise_above: 0.75,
            lower_below: 0.35,
        }
    }

    pub fn with_thresholds(mut self, raise_above: f64, lower_below: f64) -> Self {
        self.raise_above = raise_above;
        self.lower_below = lower_below;
        self
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Apply a batch success rate. Returns `(from, to)` when the size changed.
    pub fn adjust(&mut self, rate: f64) -> Option<(usize, usize)> {
        let from = self.current;
        let to = if rate > self.raise_above {
            (from + 1).min(self.max)
        } else if rate < self.lower_below {
            from.saturating_sub(1).max(self.min)
        } else {
            from
        };
        self.current = to;
        (to != from).then_some((from, to))
    }
}

/// Counts for a single batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub successes: u32,
    pub attempts: u32,
}

impl BatchStats {
    pub fn record(&mut self, outcome: &TaskOutcome) {
        self.attempts += 1;
        if outcome.is_success() {
            self.successes += 1;
        }
    }

    /// Every non-success counts against the rate, skips included.
    pub fn rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        f64::from(self.successes) / f64::from(self.attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    TargetReached,
    AttemptCeiling,
    Cancelled,
}

/// Final report of a run. Partial failure is reported here, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub target_successful: u32,
    pub actual_successful: u32,
    pub total_attempts: u32,
    pub skipped: u32,
    pub failed: u32,
    pub batches: u32,
    pub concurrency_history: Vec<ConcurrencyChange>,
    pub halt_reason: HaltReason,
}

#[derive(Debug, Default)]
struct RunTotals {
    successful: u32,
    attempts: u32,
    skipped: u32,
    failed: u32,
}

impl RunTotals {
    fn record(&mut self, outcome: &TaskOutcome) {
        self.attempts += 1;
        match outcome {
            TaskOutcome::Succeeded => self.successful += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Failed(_) | TaskOutcome::Pending => self.failed += 1,
        }
    }
}

pub struct Scheduler<E> {
    executor: Arc<E>,
    events: EventEmitter,
    concurrency: ConcurrencyConfig,
    cancel: CancellationToken,
}

impl<E: TaskExecutor> Scheduler<E> {
    pub fn new(
        executor: Arc<E>,
        events: EventEmitter,
        concurrency: ConcurrencyConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            events,
            concurrency,
            cancel,
        }
    }

    /// Run batches until `target_successes` succeed or `max_attempts` tasks
    /// have been tried.
    pub async fn run(
        &self,
        target_successes: u32,
        max_attempts: u32,
        max_concurrency: usize,
    ) -> RunSummary {
        let mut controller = ConcurrencyController::new(
            self.concurrency.initial,
            self.concurrency.min,
            max_concurrency,
        )
        .with_thresholds(self.concurrency.raise_above, self.concurrency.lower_below);

        let mut totals = RunTotals::default();
        let mut history = Vec::new();
        let mut next_task: TaskId = 1;
        let mut batch_no = 0u32;

        tracing::info!(
            target = target_successes,
            max_attempts,
            concurrency = controller.current(),
            "Starting run"
        );

        let halt_reason = loop {
            if totals.successful >= target_successes {
                break HaltReason::TargetReached;
            }
            if totals.attempts >= max_attempts {
                break HaltReason::AttemptCeiling;
            }
            if self.cancel.is_cancelled() {
                break HaltReason::Cancelled;
            }

            let remaining_successes = (target_successes - totals.successful) as usize;
            let remaining_attempts = (max_attempts - totals.attempts) as usize;
            let size = controller
                .current()
                .min(remaining_successes)
                .min(remaining_attempts);

            batch_no += 1;
            self.events.emit(RunEvent::BatchStarted {
                batch: batch_no,
                size,
                concurrency: controller.current(),
            });
            tracing::debug!(batch = batch_no, size, "Dispatching batch");

            let mut set = JoinSet::new();
            for _ in 0..size {
                let id = next_task;
                next_task += 1;
                let executor = Arc::clone(&self.executor);
                set.spawn(async move {
                    match AssertUnwindSafe(executor.execute(id)).catch_unwind().await {
                        Ok(record) => record,
                        Err(_) => panicked_record(id),
                    }
                });
            }

            let mut batch = BatchStats::default();
            let mut cancelled = false;
            loop {
                let joined = tokio::select! {
                    joined = set.join_next() => joined,
                    _ = self.cancel.cancelled(), if !cancelled => {
                        tracing::info!(batch = batch_no, "Run cancelled - aborting batch");
                        cancelled = true;
                        set.abort_all();
                        continue;
                    }
                };
                let Some(joined) = joined else { break };
                let record = match joined {
                    Ok(record) => record,
                    // Aborted by cancellation; the attempt never settled.
                    Err(_) => continue,
                };

                batch.record(&record.outcome);
                totals.record(&record.outcome);
                tracing::info!(
                    task = record.task,
                    outcome = %record.outcome,
                    successful = totals.successful,
                    attempts = totals.attempts,
                    "Task settled"
                );
                self.events.emit(RunEvent::TaskSettled(record));
                self.events.emit(RunEvent::Progress(ProgressEvent {
                    successful: totals.successful,
                    attempts: totals.attempts,
                }));
            }

            if cancelled {
                break HaltReason::Cancelled;
            }

            let rate = batch.rate();
            if let Some((from, to)) = controller.adjust(rate) {
                let change = ConcurrencyChange {
                    batch: batch_no,
                    from,
                    to,
                    rate,
                };
                tracing::info!(from, to, rate, "Concurrency adjusted");
                history.push(change);
                self.events.emit(RunEvent::ConcurrencyAdjusted(change));
            }
        };

        let summary = RunSummary {
            target_successful: target_successes,
            actual_successful: totals.successful,
            total_attempts: totals.attempts,
            skipped: totals.skipped,
            failed: totals.failed,
            batches: batch_no,
            concurrency_history: history,
            halt_reason,
        };
        tracing::info!(
            successful = summary.actual_successful,
            attempts = summary.total_attempts,
            skipped = summary.skipped,
            failed = summary.failed,
            halt = ?summary.halt_reason,
            "Run finished"
        );
        self.events.emit(RunEvent::Finished(summary.clone()));
        summary
    }
}

fn panicked_record(id: TaskId) -> TaskRecord {
    tracing::error!(task = id, "Task panicked");
    let mut task = Task::new(id);
    task.outcome = TaskOutcome::Failed(FailureReason::WorkflowStepFailed("task panicked".into()));
    task.finished_at = Some(chrono::Utc::now());
    TaskRecord::from_task(&task)
}
