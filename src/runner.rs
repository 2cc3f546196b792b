//! Drives a single task through its stages.
//!
//! Every stage returns `Result<_, Halt>` so `?` moves the task straight to
//! its terminal outcome. The pooled resource is released and the turn
//! released on every exit path, a panicking collaborator included.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::arbiter::TurnArbiter;
use crate::config::{ChallengeConfig, ConfirmationConfig, FinalizeConfig};
use crate::error::FailureReason;
use crate::pool::ResourcePool;
use crate::prefetch::{Credential, PrefetchQueue};
use crate::relay::{HumanRelay, RelayReply};
use crate::scheduler::TaskExecutor;
use crate::state_machine::{StateMachine, Task, TaskId, TaskOutcome, TaskRecord, Transition};
use crate::workflow::{
    ChallengeSnapshot, CompletionSignals, ConfirmationPoller, Solver, WorkflowDriver,
};

/// Where candidate challenge answers come from.
#[derive(Clone)]
pub enum AnswerSource {
    Automated(Arc<dyn Solver>),
    Human {
        relay: Arc<dyn HumanRelay>,
        timeout: Duration,
    },
}

/// Why a task stopped before succeeding.
#[derive(Debug)]
enum Halt {
    Skipped,
    Failed(FailureReason),
}

impl From<FailureReason> for Halt {
    fn from(reason: FailureReason) -> Self {
        Halt::Failed(reason)
    }
}

/// Shared collaborators for every task in a run.
pub struct TaskRunner<S> {
    target: String,
    pool: Arc<ResourcePool<S>>,
    credentials: Arc<PrefetchQueue>,
    arbiter: Arc<TurnArbiter>,
    driver: Arc<dyn WorkflowDriver<S>>,
    poller: Arc<dyn ConfirmationPoller>,
    answers: AnswerSource,
    challenge: ChallengeConfig,
    confirmation: ConfirmationConfig,
    finalize: FinalizeConfig,
}

impl<S: Send + Sync + 'static> TaskRunner<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: impl Into<String>,
        pool: Arc<ResourcePool<S>>,
        credentials: Arc<PrefetchQueue>,
        arbiter: Arc<TurnArbiter>,
        driver: Arc<dyn WorkflowDriver<S>>,
        poller: Arc<dyn ConfirmationPoller>,
        answers: AnswerSource,
        challenge: ChallengeConfig,
        confirmation: ConfirmationConfig,
        finalize: FinalizeConfig,
    ) -> Self {
        Self {
            target: target.into(),
            pool,
            credentials,
            arbiter,
            driver,
            poller,
            answers,
            challenge,
            confirmation,
            finalize,
        }
    }

    /// Run one attempt end to end and return its record.
    pub async fn run(&self, id: TaskId) -> TaskRecord {
        let mut task = Task::new(id);
        let span = tracing::info_span!("task", task = id);

        let result = self.acquire_and_run(&mut task).instrument(span).await;
        let outcome = match result {
            Ok(()) => TaskOutcome::Succeeded,
            Err(Halt::Skipped) => TaskOutcome::Skipped,
            Err(Halt::Failed(reason)) => {
                tracing::warn!(task = id, stage = %task.stage, reason = %reason, "Task failed");
                TaskOutcome::Failed(reason)
            }
        };
        StateMachine::conclude(&mut task, outcome);
        TaskRecord::from_task(&task)
    }

    fn enter(&self, task: &mut Task) {
        if let Transition::Next(stage) = StateMachine::advance(task) {
            tracing::debug!(stage = %stage, "Entered stage");
        }
    }

    async fn acquire_and_run(&self, task: &mut Task) -> Result<(), Halt> {
        self.enter(task);
        let resource = self.pool.acquire().await.map_err(FailureReason::from)?;
        task.resource = Some(resource.id().to_string());

        // A panicking collaborator must not keep the session checked out.
        let work = AssertUnwindSafe(self.run_with_session(task, resource.session()))
            .catch_unwind()
            .await;
        let result = work.unwrap_or_else(|_| {
            tracing::error!(stage = %task.stage, "Task panicked");
            Err(FailureReason::WorkflowStepFailed("task panicked".into()).into())
        });
        self.pool.release(resource).await;
        result
    }

    async fn run_with_session(&self, task: &mut Task, session: &S) -> Result<(), Halt> {
        let credential = self.credentials.take().await.map_err(FailureReason::from)?;
        task.credential = Some(credential.address.clone());

        self.enter(task);
        self.driver
            .fill_identity(session, &self.target, &credential)
            .await
            .map_err(FailureReason::from)?;

        // The code is on its way as soon as the identity step is done; poll
        // for it while the challenge is being solved.
        let confirmation = ConfirmationWait::spawn(
            Arc::clone(&self.poller),
            credential,
            self.confirmation.clone(),
            task.id,
        );

        self.driver
            .advance_to_challenge(session)
            .await
            .map_err(FailureReason::from)?;

        self.enter(task);
        let turn = self.arbiter.enqueue(task.id).await;
        self.enter(task);
        let solved = self.solve_challenge(task, session).await;
        turn.release();
        solved?;

        self.enter(task);
        let code = confirmation
            .wait()
            .await
            .ok_or(FailureReason::ConfirmationTimeout)?;

        self.enter(task);
        self.finish(session, &code).await
    }

    async fn solve_challenge(&self, task: &mut Task, session: &S) -> Result<(), Halt> {
        let rounds = self.challenge.rounds;
        let attempts = self.challenge.attempts_per_round;

        for round in 1..=rounds {
            if round > 1
                && let Err(e) = self.driver.refresh_challenge(session).await
            {
                tracing::warn!(round, error = %e, "Could not refresh challenge");
            }

            for attempt in 1..=attempts {
                let snapshot = match self.driver.capture_challenge(session).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::warn!(round, attempt, error = %e, "Could not capture challenge");
                        continue;
                    }
                };

                let Some(answer) = self.candidate(task.id, &snapshot).await? else {
                    tracing::debug!(round, attempt, "No usable answer");
                    continue;
                };

                if let Err(e) = self.driver.submit_answer(session, &answer).await {
                    tracing::warn!(round, attempt, error = %e, "Could not submit answer");
                    continue;
                }
                task.submissions += 1;

                if self.challenge_passed(session).await {
                    tracing::info!(round, attempt, "Challenge passed");
                    return Ok(());
                }
                tracing::debug!(round, attempt, "No success signal after submission");
            }
        }

        Err(FailureReason::ChallengeUnsolved {
            submissions: task.submissions,
        }
        .into())
    }

    async fn candidate(
        &self,
        task: TaskId,
        snapshot: &ChallengeSnapshot,
    ) -> Result<Option<String>, Halt> {
        let raw = match &self.answers {
            AnswerSource::Automated(solver) => solver.solve(snapshot).await,
            AnswerSource::Human { relay, timeout } => {
                match relay.ask(task, snapshot, *timeout).await {
                    RelayReply::Answer(answer) => Some(answer),
                    RelayReply::Skip => {
                        tracing::info!("Skipped by operator");
                        return Err(Halt::Skipped);
                    }
                    RelayReply::TimedOut | RelayReply::Unavailable => None,
                }
            }
        };
        Ok(raw
            .map(|answer| answer.trim().to_string())
            .filter(|answer| !answer.is_empty()))
    }

    async fn challenge_passed(&self, session: &S) -> bool {
        let checks = self.challenge.signal_checks.max(1);
        for check in 1..=checks {
            match self.driver.challenge_signals(session).await {
                Ok(signals) if signals.passed() => return true,
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Could not read challenge signals"),
            }
            if check < checks {
                tokio::time::sleep(self.challenge.signal_interval()).await;
            }
        }
        false
    }

    async fn finish(&self, session: &S, code: &str) -> Result<(), Halt> {
        self.driver
            .submit_code(session, code)
            .await
            .map_err(FailureReason::from)?;
        if let Err(e) = self.driver.complete(session).await {
            tracing::warn!(error = %e, "Could not complete remaining steps");
        }

        let checks = self.finalize.settle_checks.max(1);
        for check in 1..=checks {
            match self.driver.completion_signals(session).await {
                Ok(CompletionSignals {
                    already_completed: true,
                    ..
                }) => {
                    tracing::info!("Target reports already completed");
                    return Ok(());
                }
                Ok(CompletionSignals { success: true, .. }) => return Ok(()),
                Ok(CompletionSignals {
                    failure: Some(message),
                    ..
                }) => return Err(FailureReason::Rejected(message).into()),
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Could not read completion signals"),
            }
            if check < checks {
                tokio::time::sleep(self.finalize.settle_interval()).await;
            }
        }

        if self.finalize.assume_success_on_silence {
            tracing::warn!("No final acknowledgment - assuming success");
            Ok(())
        } else {
            Err(FailureReason::Rejected("no final acknowledgment".into()).into())
        }
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> TaskExecutor for TaskRunner<S> {
    async fn execute(&self, task: TaskId) -> TaskRecord {
        self.run(task).await
    }
}

/// Background poll for the confirmation code. Aborted if dropped unawaited.
struct ConfirmationWait {
    handle: JoinHandle<Option<String>>,
}

impl ConfirmationWait {
    fn spawn(
        poller: Arc<dyn ConfirmationPoller>,
        credential: Credential,
        config: ConfirmationConfig,
        task: TaskId,
    ) -> Self {
        let handle = tokio::spawn(
            async move { poll_for_code(poller.as_ref(), &credential, &config).await }
                .instrument(tracing::debug_span!("confirmation", task)),
        );
        Self { handle }
    }

    async fn wait(mut self) -> Option<String> {
        (&mut self.handle).await.ok().flatten()
    }
}

impl Drop for ConfirmationWait {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn poll_for_code(
    poller: &dyn ConfirmationPoller,
    credential: &Credential,
    config: &ConfirmationConfig,
) -> Option<String> {
    for probe in 1..=config.max_probes {
        match poller.poll(credential).await {
            Ok(Some(code)) => {
                tracing::debug!(probe, "Confirmation code received");
                return Some(code);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(probe, error = %e, "Confirmation poll failed"),
        }
        if probe < config.max_probes {
            tokio::time::sleep(config.delay_for_probe(probe)).await;
        }
    }
    tracing::warn!(probes = config.max_probes, "No confirmation code within bound");
    None
}
