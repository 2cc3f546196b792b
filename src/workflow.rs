//! Contracts for the external collaborators a task drives.
//!
//! The engine never touches the target directly: every interaction goes
//! through a [`WorkflowDriver`] operating on a pooled session, a [`Solver`]
//! for automated challenge answers, and a [`ConfirmationPoller`] for the
//! out-of-band confirmation code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StepError;
use crate::prefetch::Credential;

/// A captured image of the challenge currently presented.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeSnapshot {
    pub data: Vec<u8>,
    pub content_type: String,
    pub captured_at: DateTime<Utc>,
}

impl ChallengeSnapshot {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            data,
            content_type: "image/png".to_string(),
            captured_at: Utc::now(),
        }
    }
}

/// Independent heuristics read after an answer is submitted. Any one of them
/// firing means the challenge was passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChallengeSignals {
    /// The challenge frame is no longer in the page.
    pub channel_gone: bool,
    /// The challenge frame is present but hidden.
    pub channel_hidden: bool,
    /// An explicit success marker is shown.
    pub success_indicator: bool,
    /// A resend cooldown/countdown appeared, which only happens after a pass.
    pub cooldown_indicator: bool,
}

impl ChallengeSignals {
    pub fn passed(&self) -> bool {
        self.channel_gone || self.channel_hidden || self.success_indicator || self.cooldown_indicator
    }
}

/// Signals read from the target after the confirmation code is submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionSignals {
    pub already_completed: bool,
    pub success: bool,
    /// An explicit negative acknowledgment, with the text shown.
    pub failure: Option<String>,
}

/// Performs the site-specific interaction steps on a session.
#[async_trait]
pub trait WorkflowDriver<S>: Send + Sync {
    /// Open the target and complete the identity step with the credential.
    async fn fill_identity(
        &self,
        session: &S,
        target: &str,
        credential: &Credential,
    ) -> Result<(), StepError>;

    /// Continue until the challenge is presented.
    async fn advance_to_challenge(&self, session: &S) -> Result<(), StepError>;

    async fn capture_challenge(&self, session: &S) -> Result<ChallengeSnapshot, StepError>;

    /// Ask the target for a fresh challenge at the start of a new round.
    async fn refresh_challenge(&self, session: &S) -> Result<(), StepError>;

    async fn submit_answer(&self, session: &S, answer: &str) -> Result<(), StepError>;

    async fn challenge_signals(&self, session: &S) -> Result<ChallengeSignals, StepError>;

    async fn submit_code(&self, session: &S, code: &str) -> Result<(), StepError>;

    /// Complete the steps remaining after the code is accepted.
    async fn complete(&self, session: &S) -> Result<(), StepError>;

    async fn completion_signals(&self, session: &S) -> Result<CompletionSignals, StepError>;
}

/// Best-effort automated challenge solver. One call per attempt.
#[async_trait]
pub trait Solver: Send + Sync {
    async fn solve(&self, snapshot: &ChallengeSnapshot) -> Option<String>;
}

/// Polls for the confirmation code sent to a credential's address.
#[async_trait]
pub trait ConfirmationPoller: Send + Sync {
    /// `Ok(None)` means not yet.
    async fn poll(&self, credential: &Credential) -> Result<Option<String>, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_signals_do_not_pass() {
        assert!(!ChallengeSignals::default().passed());
    }

    #[test]
    fn any_single_signal_passes() {
        let variants = [
            ChallengeSignals { channel_gone: true, ..Default::default() },
            ChallengeSignals { channel_hidden: true, ..Default::default() },
            ChallengeSignals { success_indicator: true, ..Default::default() },
            ChallengeSignals { cooldown_indicator: true, ..Default::default() },
        ];
        for signals in variants {
            assert!(signals.passed(), "{signals:?} should pass");
        }
    }
}
