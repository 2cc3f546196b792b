//! Exclusive, FIFO-fair access to the challenge channel.
//!
//! At most one task holds the turn. Waiters are granted strictly in arrival
//! order. A [`Turn`] releases itself on drop, and a waiter whose `enqueue`
//! future is dropped before it observes its grant gives the grant back, so
//! cancelled tasks never wedge the queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::state_machine::TaskId;

struct Waiter {
    task: TaskId,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct ArbiterState {
    holder: Option<TaskId>,
    waiters: VecDeque<Waiter>,
    grants: u64,
    releases: u64,
}

/// Diagnostic snapshot of the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub holder: Option<TaskId>,
    pub waiting: usize,
    pub grants: u64,
    pub releases: u64,
}

#[derive(Default)]
pub struct TurnArbiter {
    state: Mutex<ArbiterState>,
}

impl TurnArbiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the turn. Resolves once every earlier ticket has been released.
    pub async fn enqueue(self: &Arc<Self>, task: TaskId) -> Turn {
        let rx = {
            let mut state = self.lock();
            if state.holder.is_none() && state.waiters.is_empty() {
                state.holder = Some(task);
                state.grants += 1;
                tracing::debug!(task, "Turn granted immediately");
                return Turn::new(Arc::clone(self), task);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { task, tx });
            tracing::debug!(task, position = state.waiters.len(), "Waiting for turn");
            rx
        };

        let mut pending = PendingTurn {
            arbiter: self,
            task,
            armed: true,
        };
        // The sender is only dropped after a successful grant or by our own
        // abandon(), so the result carries no extra information.
        let _ = rx.await;
        pending.armed = false;
        Turn::new(Arc::clone(self), task)
    }

    /// Release the turn held by `task`. A release by anyone other than the
    /// current holder is ignored. Returns whether the turn was released.
    pub fn release(&self, task: TaskId) -> bool {
        let mut state = self.lock();
        if state.holder != Some(task) {
            tracing::debug!(task, holder = ?state.holder, "Ignoring release by non-holder");
            return false;
        }
        state.holder = None;
        state.releases += 1;
        tracing::debug!(task, "Turn released");
        Self::grant_next(&mut state);
        true
    }

    fn grant_next(state: &mut ArbiterState) {
        while let Some(waiter) = state.waiters.pop_front() {
            state.holder = Some(waiter.task);
            state.grants += 1;
            if waiter.tx.send(()).is_ok() {
                tracing::debug!(task = waiter.task, "Turn granted");
                return;
            }
            // Receiver vanished without abandoning; pass the grant on.
            state.holder = None;
            state.releases += 1;
        }
    }

    /// Called when an `enqueue` future is dropped before returning.
    fn abandon(&self, task: TaskId) {
        let mut state = self.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.task == task) {
            state.waiters.remove(pos);
            tracing::debug!(task, "Abandoned turn request");
        } else if state.holder == Some(task) {
            // Granted between the send and the drop.
            state.holder = None;
            state.releases += 1;
            tracing::debug!(task, "Returning unobserved turn");
            Self::grant_next(&mut state);
        }
    }

    pub fn holder(&self) -> Option<TaskId> {
        self.lock().holder
    }

    pub fn stats(&self) -> ArbiterStats {
        let state = self.lock();
        ArbiterStats {
            holder: state.holder,
            waiting: state.waiters.len(),
            grants: state.grants,
            releases: state.releases,
        }
    }
}

struct PendingTurn<'a> {
    arbiter: &'a Arc<TurnArbiter>,
    task: TaskId,
    armed: bool,
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.arbiter.abandon(self.task);
        }
    }
}

/// The exclusive right to use the challenge channel. Released on drop.
#[must_use = "dropping a Turn releases it immediately"]
pub struct Turn {
    arbiter: Arc<TurnArbiter>,
    task: TaskId,
    released: bool,
}

impl Turn {
    fn new(arbiter: Arc<TurnArbiter>, task: TaskId) -> Self {
        Self {
            arbiter,
            task,
            released: false,
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn release(mut self) {
        self.released = true;
        self.arbiter.release(self.task);
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        if !self.released {
            self.arbiter.release(self.task);
        }
    }
}
