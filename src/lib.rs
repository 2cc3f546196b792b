//! Concurrent task orchestration over pooled, sanitizable sessions.
//!
//! A run dispatches tasks in adaptive batches. Each task takes a pooled
//! session and a prefetched credential, drives an external workflow, and
//! waits its turn at the [`arbiter::TurnArbiter`] for the challenge step.
//! Observers follow along through [`events::RunEvent`]s.

pub mod arbiter;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod pool;
pub mod prefetch;
pub mod provider;
pub mod relay;
pub mod runner;
pub mod scheduler;
pub mod sim;
pub mod state_machine;
pub mod ui;
pub mod workflow;

pub use engine::{Collaborators, Engine};
pub use error::{ConvoyError, FailureReason};
pub use scheduler::RunSummary;
