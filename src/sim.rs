//! In-process stand-ins for the external collaborators.
//!
//! Used by `convoy demo` and by the tests. Behavior is scripted through
//! [`SimBehavior`]; every collaborator counts its calls so tests can assert
//! on them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{CredentialError, StepError};
use crate::pool::SessionFactory;
use crate::prefetch::{Credential, CredentialProvider};
use crate::workflow::{
    ChallengeSignals, ChallengeSnapshot, CompletionSignals, ConfirmationPoller, Solver,
    WorkflowDriver,
};

/// A fake interactive session. Carries per-task state until sanitized.
#[derive(Debug, Default)]
pub struct SimSession {
    pub serial: u64,
    in_flow: AtomicBool,
    submissions: AtomicU32,
    passed: AtomicBool,
}

impl SimSession {
    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct SimSessionFactory {
    created: AtomicU64,
    torn_down: AtomicU64,
    fail_create: bool,
}

impl SimSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose every `create` fails.
    pub fn broken() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> u64 {
        self.torn_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory<SimSession> for SimSessionFactory {
    async fn create(&self) -> anyhow::Result<SimSession> {
        if self.fail_create {
            bail!("session backend unreachable");
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(serial, "Created simulated session");
        Ok(SimSession {
            serial,
            ..SimSession::default()
        })
    }

    async fn sanitize(&self, session: &SimSession) -> anyhow::Result<()> {
        session.in_flow.store(false, Ordering::SeqCst);
        session.submissions.store(0, Ordering::SeqCst);
        session.passed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self, session: &SimSession) {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(serial = session.serial, "Tore down simulated session");
    }
}

/// How the simulated target reacts once the code is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCompletion {
    Success,
    AlreadyCompleted,
    Rejected(String),
    Silent,
}

#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// Every K-th identity step fails. `None` never fails.
    pub identity_fail_every: Option<u64>,
    /// Fail the step that leads to the challenge.
    pub fail_advance: bool,
    /// The challenge passes on this submission within a task. `None` never passes.
    pub pass_on_submission: Option<u32>,
    pub completion: SimCompletion,
    /// Delay added to every driver step.
    pub latency: Duration,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            identity_fail_every: None,
            fail_advance: false,
            pass_on_submission: Some(1),
            completion: SimCompletion::Success,
            latency: Duration::ZERO,
        }
    }
}

pub struct SimDriver {
    behavior: SimBehavior,
    identity_calls: AtomicU64,
    captures: AtomicU64,
    refreshes: AtomicU64,
}

impl SimDriver {
    pub fn new(behavior: SimBehavior) -> Self {
        Self {
            behavior,
            identity_calls: AtomicU64::new(0),
            captures: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn identity_calls(&self) -> u64 {
        self.identity_calls.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.behavior.latency.is_zero() {
            tokio::time::sleep(self.behavior.latency).await;
        }
    }
}

#[async_trait]
impl WorkflowDriver<SimSession> for SimDriver {
    async fn fill_identity(
        &self,
        session: &SimSession,
        _target: &str,
        credential: &Credential,
    ) -> Result<(), StepError> {
        self.pause().await;
        let call = self.identity_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(every) = self.behavior.identity_fail_every
            && every > 0
            && call % every == 0
        {
            return Err(StepError::new("identity", "form rejected the address"));
        }
        session.in_flow.store(true, Ordering::SeqCst);
        tracing::debug!(address = %credential.address, "Identity filled");
        Ok(())
    }

    async fn advance_to_challenge(&self, session: &SimSession) -> Result<(), StepError> {
        self.pause().await;
        if self.behavior.fail_advance {
            return Err(StepError::new("advance", "next button never appeared"));
        }
        if !session.in_flow.load(Ordering::SeqCst) {
            return Err(StepError::new("advance", "identity step not completed"));
        }
        Ok(())
    }

    async fn capture_challenge(&self, session: &SimSession) -> Result<ChallengeSnapshot, StepError> {
        self.pause().await;
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(ChallengeSnapshot::png(
            format!("challenge-{}-{n}", session.serial).into_bytes(),
        ))
    }

    async fn refresh_challenge(&self, _session: &SimSession) -> Result<(), StepError> {
        self.pause().await;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn submit_answer(&self, session: &SimSession, _answer: &str) -> Result<(), StepError> {
        self.pause().await;
        let n = session.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.behavior.pass_on_submission.is_some_and(|pass| n >= pass) {
            session.passed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn challenge_signals(&self, session: &SimSession) -> Result<ChallengeSignals, StepError> {
        let passed = session.passed.load(Ordering::SeqCst);
        Ok(ChallengeSignals {
            channel_gone: passed,
            ..ChallengeSignals::default()
        })
    }

    async fn submit_code(&self, _session: &SimSession, code: &str) -> Result<(), StepError> {
        self.pause().await;
        if code.is_empty() {
            return Err(StepError::new("code", "empty confirmation code"));
        }
        Ok(())
    }

    async fn complete(&self, _session: &SimSession) -> Result<(), StepError> {
        self.pause().await;
        Ok(())
    }

    async fn completion_signals(&self, _session: &SimSession) -> Result<CompletionSignals, StepError> {
        Ok(match &self.behavior.completion {
            SimCompletion::Success => CompletionSignals {
                success: true,
                ..CompletionSignals::default()
            },
            SimCompletion::AlreadyCompleted => CompletionSignals {
                already_completed: true,
                ..CompletionSignals::default()
            },
            SimCompletion::Rejected(message) => CompletionSignals {
                failure: Some(message.clone()),
                ..CompletionSignals::default()
            },
            SimCompletion::Silent => CompletionSignals::default(),
        })
    }
}

/// Answers every challenge with the same text, or never.
pub struct SimSolver {
    answer: Option<String>,
    calls: AtomicU32,
}

impl SimSolver {
    pub fn answering(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn silent() -> Self {
        Self {
            answer: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Solver for SimSolver {
    async fn solve(&self, _snapshot: &ChallengeSnapshot) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

/// Delivers a code for an address after a fixed number of probes.
pub struct SimPoller {
    ready_after: Option<u32>,
    probes: DashMap<String, u32>,
}

impl SimPoller {
    pub fn ready_after(probes: u32) -> Self {
        Self {
            ready_after: Some(probes),
            probes: DashMap::new(),
        }
    }

    pub fn never() -> Self {
        Self {
            ready_after: None,
            probes: DashMap::new(),
        }
    }

    pub fn probes_for(&self, address: &str) -> u32 {
        self.probes.get(address).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl ConfirmationPoller for SimPoller {
    async fn poll(&self, credential: &Credential) -> Result<Option<String>, StepError> {
        let probe = {
            let mut entry = self.probes.entry(credential.address.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        Ok(match self.ready_after {
            Some(ready) if probe >= ready => Some(format!("{:06}", probe * 1_013)),
            _ => None,
        })
    }
}

/// Issues numbered throwaway addresses, or fails every request.
pub struct SimProvider {
    name: String,
    fail: bool,
    issued: AtomicU64,
}

impl SimProvider {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fail: false,
            issued: AtomicU64::new(0),
        })
    }

    pub fn failing(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fail: true,
            issued: AtomicU64::new(0),
        })
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for SimProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self) -> Result<Credential, CredentialError> {
        if self.fail {
            return Err(CredentialError::Unavailable {
                provider: self.name.clone(),
                message: "simulated outage".into(),
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential {
            address: format!("box{n}@{}.sim", self.name),
            secret: format!("secret-{n}"),
            provider: self.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sanitize_resets_session_state() {
        let factory = SimSessionFactory::new();
        let driver = SimDriver::new(SimBehavior::default());
        let session = factory.create().await.unwrap();
        let credential = SimProvider::new("p").request().await.unwrap();

        driver.fill_identity(&session, "t", &credential).await.unwrap();
        driver.submit_answer(&session, "a").await.unwrap();
        assert!(driver.challenge_signals(&session).await.unwrap().passed());

        factory.sanitize(&session).await.unwrap();
        assert_eq!(session.submissions(), 0);
        assert!(!driver.challenge_signals(&session).await.unwrap().passed());
        assert!(driver.advance_to_challenge(&session).await.is_err());
    }

    #[tokio::test]
    async fn identity_fails_every_kth_call() {
        let driver = SimDriver::new(SimBehavior {
            identity_fail_every: Some(3),
            ..SimBehavior::default()
        });
        let session = SimSession::default();
        let credential = SimProvider::new("p").request().await.unwrap();

        let results: Vec<bool> = futures::future::join_all(
            (0..6).map(|_| driver.fill_identity(&session, "t", &credential)),
        )
        .await
        .into_iter()
        .map(|r| r.is_ok())
        .collect();
        assert_eq!(results.iter().filter(|ok| !**ok).count(), 2);
    }

    #[tokio::test]
    async fn poller_counts_probes_per_address() {
        let poller = SimPoller::ready_after(3);
        let credential = SimProvider::new("p").request().await.unwrap();

        assert_eq!(poller.poll(&credential).await.unwrap(), None);
        assert_eq!(poller.poll(&credential).await.unwrap(), None);
        assert!(poller.poll(&credential).await.unwrap().is_some());
        assert_eq!(poller.probes_for(&credential.address), 3);
    }
}
