//! Run-level facade over the pool, prefetch queue, arbiter and scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::arbiter::{ArbiterStats, TurnArbiter};
use crate::config::{ChallengeConfig, ConcurrencyConfig, ConvoyConfig, SolverMode};
use crate::error::{ConvoyError, PoolError};
use crate::events::{EventEmitter, RunEvent};
use crate::pool::{PoolStats, ResourcePool, SessionFactory};
use crate::prefetch::{CredentialProvider, PrefetchQueue, ProviderChain};
use crate::relay::HumanRelay;
use crate::runner::{AnswerSource, TaskRunner};
use crate::scheduler::{RunSummary, Scheduler};
use crate::workflow::{ConfirmationPoller, Solver, WorkflowDriver};

/// Everything the engine talks to outside itself.
pub struct Collaborators<S> {
    pub sessions: Arc<dyn SessionFactory<S>>,
    pub driver: Arc<dyn WorkflowDriver<S>>,
    /// Tried in order for every credential.
    pub providers: Vec<Arc<dyn CredentialProvider>>,
    pub poller: Arc<dyn ConfirmationPoller>,
    /// Required when the challenge mode is `auto`.
    pub solver: Option<Arc<dyn Solver>>,
    /// Required when the challenge mode is `human`.
    pub relay: Option<Arc<dyn HumanRelay>>,
}

pub struct Engine<S> {
    config: ConvoyConfig,
    pool: Arc<ResourcePool<S>>,
    credentials: Arc<PrefetchQueue>,
    arbiter: Arc<TurnArbiter>,
    driver: Arc<dyn WorkflowDriver<S>>,
    poller: Arc<dyn ConfirmationPoller>,
    solver: Option<Arc<dyn Solver>>,
    relay: Option<Arc<dyn HumanRelay>>,
    events: EventEmitter,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<S: Send + Sync + 'static> Engine<S> {
    pub fn new(config: ConvoyConfig, collaborators: Collaborators<S>) -> Result<Self, ConvoyError> {
        config.validate()?;
        if collaborators.providers.is_empty() {
            return Err(ConvoyError::Config(
                "at least one credential provider is required".into(),
            ));
        }

        let pool = Arc::new(ResourcePool::new(collaborators.sessions, config.pool.capacity));
        let credentials = PrefetchQueue::new(
            ProviderChain::new(collaborators.providers),
            config.prefetch.depth,
        );

        Ok(Self {
            pool,
            credentials,
            arbiter: TurnArbiter::new(),
            driver: collaborators.driver,
            poller: collaborators.poller,
            solver: collaborators.solver,
            relay: collaborators.relay,
            events: EventEmitter::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &ConvoyConfig {
        &self.config
    }

    /// Subscribe to run events, progress included.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn arbiter_stats(&self) -> ArbiterStats {
        self.arbiter.stats()
    }

    /// Attempt tasks against `target_url` until `target_successes` succeed
    /// or the attempt ceiling is reached.
    ///
    /// Per-task failures never surface here; they are counted in the
    /// summary. Errors are reserved for misconfiguration, a pool that cannot
    /// produce even one resource, and calls after [`cleanup`](Self::cleanup).
    pub async fn start_run(
        &self,
        target_url: &str,
        target_successes: u32,
        concurrency: &ConcurrencyConfig,
        challenge: &ChallengeConfig,
    ) -> Result<RunSummary, ConvoyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConvoyError::Closed);
        }
        self.check_concurrency(concurrency)?;
        if challenge.rounds == 0 || challenge.attempts_per_round == 0 {
            return Err(ConvoyError::Config(
                "challenge rounds and attempts must be at least 1".into(),
            ));
        }
        let answers = self.answer_source(challenge)?;

        self.warm_up().await?;

        let runner = TaskRunner::new(
            target_url,
            Arc::clone(&self.pool),
            Arc::clone(&self.credentials),
            Arc::clone(&self.arbiter),
            Arc::clone(&self.driver),
            Arc::clone(&self.poller),
            answers,
            challenge.clone(),
            self.config.confirmation.clone(),
            self.config.finalize.clone(),
        );
        let scheduler = Scheduler::new(
            Arc::new(runner),
            self.events.clone(),
            concurrency.clone(),
            self.cancel.clone(),
        );

        let max_attempts = target_successes.saturating_mul(concurrency.attempt_multiplier);
        tracing::info!(
            target = %target_url,
            successes = target_successes,
            max_attempts,
            mode = ?challenge.mode,
            "Run starting"
        );

        let refill = self
            .credentials
            .start(std::time::Duration::from_millis(self.config.prefetch.refill_interval_ms));
        let summary = scheduler
            .run(target_successes, max_attempts, concurrency.max)
            .await;
        refill.abort();
        Ok(summary)
    }

    /// Stop any run in progress and tear down every pooled resource.
    /// Safe to call at any time, any number of times.
    pub async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Cleanup already done");
            return;
        }
        tracing::info!("Cleaning up engine");
        self.cancel.cancel();
        self.credentials.shutdown();
        self.pool.cleanup().await;
    }

    fn check_concurrency(&self, concurrency: &ConcurrencyConfig) -> Result<(), ConvoyError> {
        concurrency.validate()?;
        if concurrency.max > self.pool.capacity() {
            return Err(ConvoyError::Config(format!(
                "max concurrency {} exceeds pool capacity {}",
                concurrency.max,
                self.pool.capacity()
            )));
        }
        Ok(())
    }

    fn answer_source(&self, challenge: &ChallengeConfig) -> Result<AnswerSource, ConvoyError> {
        match challenge.mode {
            SolverMode::Auto => self
                .solver
                .clone()
                .map(AnswerSource::Automated)
                .ok_or_else(|| ConvoyError::Config("mode auto requires a solver".into())),
            SolverMode::Human => self
                .relay
                .clone()
                .map(|relay| AnswerSource::Human {
                    relay,
                    timeout: challenge.human_timeout(),
                })
                .ok_or_else(|| ConvoyError::Config("mode human requires a relay".into())),
        }
    }

    /// Prove the pool can produce a resource before any task is dispatched.
    async fn warm_up(&self) -> Result<(), ConvoyError> {
        match self.pool.acquire().await {
            Ok(resource) => {
                self.pool.release(resource).await;
                Ok(())
            }
            // Another run holds everything; the pool evidently works.
            Err(PoolError::Exhausted { .. }) => Ok(()),
            Err(PoolError::Closed) => Err(ConvoyError::Closed),
            Err(e @ PoolError::Creation(_)) => Err(ConvoyError::Setup(e.to_string())),
        }
    }
}
