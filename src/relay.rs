//! Human relay for challenge answers.
//!
//! A challenge snapshot goes out on an mpsc channel to whatever front end is
//! attached; the answer (or a skip) comes back through [`ChannelRelay::respond`]
//! and is matched to the waiting task by id via a registry of one-shot slots.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::state_machine::TaskId;
use crate::workflow::ChallengeSnapshot;

/// What came back from the human side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayReply {
    Answer(String),
    /// Operator asked to abandon this task.
    Skip,
    TimedOut,
    /// No front end is attached.
    Unavailable,
}

/// Registry of one-shot result slots keyed by task id. Each slot is
/// fulfilled at most once; fulfilling an absent key is a no-op.
pub struct ReplyRegistry<T> {
    slots: DashMap<TaskId, oneshot::Sender<T>>,
}

impl<T> Default for ReplyRegistry<T> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<T> ReplyRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `task`, replacing any stale one.
    pub fn register(&self, task: TaskId) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        if self.slots.insert(task, tx).is_some() {
            tracing::debug!(task, "Replaced stale reply slot");
        }
        rx
    }

    /// Deliver `value` to the task waiting on it. Returns false if nobody is.
    pub fn fulfill(&self, task: TaskId, value: T) -> bool {
        match self.slots.remove(&task) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => {
                tracing::debug!(task, "No pending reply slot");
                false
            }
        }
    }

    pub fn cancel(&self, task: TaskId) -> bool {
        self.slots.remove(&task).is_some()
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

/// Pushes a challenge out and waits for a correlated reply.
#[async_trait]
pub trait HumanRelay: Send + Sync {
    async fn ask(&self, task: TaskId, snapshot: &ChallengeSnapshot, timeout: Duration)
    -> RelayReply;
}

/// A challenge awaiting a human answer.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengePrompt {
    pub task: TaskId,
    pub snapshot: ChallengeSnapshot,
    pub timeout_secs: u64,
}

/// [`HumanRelay`] over an mpsc channel of prompts.
pub struct ChannelRelay {
    outbound: mpsc::Sender<ChallengePrompt>,
    replies: ReplyRegistry<RelayReply>,
}

impl ChannelRelay {
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<ChallengePrompt>) {
        let (tx, rx) = mpsc::channel(buffer);
        let relay = Arc::new(Self {
            outbound: tx,
            replies: ReplyRegistry::new(),
        });
        (relay, rx)
    }

    /// Route a reply from the front end to the waiting task.
    pub fn respond(&self, task: TaskId, reply: RelayReply) -> bool {
        self.replies.fulfill(task, reply)
    }

    pub fn skip(&self, task: TaskId) -> bool {
        self.respond(task, RelayReply::Skip)
    }

    pub fn pending(&self) -> usize {
        self.replies.pending()
    }
}

struct SlotGuard<'a> {
    replies: &'a ReplyRegistry<RelayReply>,
    task: TaskId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.replies.cancel(self.task);
    }
}

#[async_trait]
impl HumanRelay for ChannelRelay {
    async fn ask(
        &self,
        task: TaskId,
        snapshot: &ChallengeSnapshot,
        timeout: Duration,
    ) -> RelayReply {
        let rx = self.replies.register(task);
        let _slot = SlotGuard {
            replies: &self.replies,
            task,
        };

        let prompt = ChallengePrompt {
            task,
            snapshot: snapshot.clone(),
            timeout_secs: timeout.as_secs(),
        };

        let exchange = async {
            if self.outbound.send(prompt).await.is_err() {
                return RelayReply::Unavailable;
            }
            rx.await.unwrap_or(RelayReply::Unavailable)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::info!(task, timeout_secs = timeout.as_secs(), "Human answer timed out");
                RelayReply::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ChallengeSnapshot {
        ChallengeSnapshot::png(vec![1, 2, 3])
    }

    #[test]
    fn registry_fulfills_once() {
        let registry = ReplyRegistry::new();
        let mut rx = registry.register(4);

        assert!(registry.fulfill(4, "abc".to_string()));
        assert_eq!(rx.try_recv().unwrap(), "abc");
        assert!(!registry.fulfill(4, "again".to_string()));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn fulfilling_absent_key_is_noop() {
        let registry: ReplyRegistry<String> = ReplyRegistry::new();
        assert!(!registry.fulfill(99, "orphan".into()));
    }

    #[tokio::test]
    async fn relay_routes_answer_to_task() {
        let (relay, mut prompts) = ChannelRelay::new(4);

        let asker = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.ask(7, &snapshot(), Duration::from_secs(5)).await })
        };

        let prompt = prompts.recv().await.unwrap();
        assert_eq!(prompt.task, 7);
        assert!(relay.respond(7, RelayReply::Answer("x7k2".into())));

        assert_eq!(asker.await.unwrap(), RelayReply::Answer("x7k2".into()));
        assert_eq!(relay.pending(), 0);
    }

    #[tokio::test]
    async fn relay_times_out_and_clears_slot() {
        let (relay, _prompts) = ChannelRelay::new(4);
        let reply = relay.ask(1, &snapshot(), Duration::from_millis(20)).await;
        assert_eq!(reply, RelayReply::TimedOut);
        assert_eq!(relay.pending(), 0);
        assert!(!relay.skip(1));
    }

    #[tokio::test]
    async fn relay_without_front_end_is_unavailable() {
        let (relay, prompts) = ChannelRelay::new(1);
        drop(prompts);
        let reply = relay.ask(1, &snapshot(), Duration::from_secs(1)).await;
        assert_eq!(reply, RelayReply::Unavailable);
    }

    #[tokio::test]
    async fn skip_reaches_waiting_task() {
        let (relay, mut prompts) = ChannelRelay::new(4);
        let asker = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.ask(3, &snapshot(), Duration::from_secs(5)).await })
        };
        prompts.recv().await.unwrap();
        assert!(relay.skip(3));
        assert_eq!(asker.await.unwrap(), RelayReply::Skip);
    }
}
