use std::fmt;

use serde::{Deserialize, Serialize};

use super::task::{Task, TaskOutcome};

/// The stages a task passes through.
///
/// Happy path: STARTING → ACQUIRING_RESOURCES → PERFORMING_STEPS →
/// AWAITING_TURN → SOLVING_CHALLENGE → AWAITING_CONFIRMATION → FINALIZING →
/// SUCCEEDED. Any non-terminal stage may end in FAILED; only
/// SOLVING_CHALLENGE may end in SKIPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Starting,
    AcquiringResources,
    PerformingSteps,
    AwaitingTurn,
    SolvingChallenge,
    AwaitingConfirmation,
    Finalizing,
    Succeeded,
    Skipped,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Starting => "STARTING",
            Stage::AcquiringResources => "ACQUIRING_RESOURCES",
            Stage::PerformingSteps => "PERFORMING_STEPS",
            Stage::AwaitingTurn => "AWAITING_TURN",
            Stage::SolvingChallenge => "SOLVING_CHALLENGE",
            Stage::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Stage::Finalizing => "FINALIZING",
            Stage::Succeeded => "SUCCEEDED",
            Stage::Skipped => "SKIPPED",
            Stage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Skipped | Stage::Failed)
    }

    /// The next stage on the happy path, `None` for `Finalizing` and terminals.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::Starting => Some(Stage::AcquiringResources),
            Stage::AcquiringResources => Some(Stage::PerformingSteps),
            Stage::PerformingSteps => Some(Stage::AwaitingTurn),
            Stage::AwaitingTurn => Some(Stage::SolvingChallenge),
            Stage::SolvingChallenge => Some(Stage::AwaitingConfirmation),
            Stage::AwaitingConfirmation => Some(Stage::Finalizing),
            Stage::Finalizing | Stage::Succeeded | Stage::Skipped | Stage::Failed => None,
        }
    }

    fn can_conclude_with(&self, outcome: &TaskOutcome) -> bool {
        match outcome {
            TaskOutcome::Pending => false,
            TaskOutcome::Succeeded => *self == Stage::Finalizing,
            TaskOutcome::Skipped => *self == Stage::SolvingChallenge,
            TaskOutcome::Failed(_) => !self.is_terminal(),
        }
    }
}

/// The result of asking the state machine to move a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Moved to the next stage.
    Next(Stage),
    /// The task reached a terminal stage with this outcome.
    Complete(TaskOutcome),
    /// The move is not allowed from the current stage; nothing changed.
    Invalid { from: Stage, to: Stage },
}

/// Moves a [`Task`] between stages, recording history.
pub struct StateMachine;

impl StateMachine {
    /// Advance the task one step along the happy path.
    pub fn advance(task: &mut Task) -> Transition {
        match task.stage.successor() {
            Some(next) => {
                task.stage_history.push(task.stage);
                task.stage = next;
                Transition::Next(next)
            }
            None => Transition::Invalid {
                from: task.stage,
                to: task.stage,
            },
        }
    }

    /// Conclude the task with a terminal outcome.
    pub fn conclude(task: &mut Task, outcome: TaskOutcome) -> Transition {
        let to = outcome.terminal_stage();
        if !task.stage.can_conclude_with(&outcome) {
            tracing::error!(
                task = task.id,
                from = %task.stage,
                to = %to,
                "Bug: invalid terminal transition"
            );
            return Transition::Invalid {
                from: task.stage,
                to,
            };
        }
        task.stage_history.push(task.stage);
        task.stage = to;
        task.outcome = outcome.clone();
        task.finished_at = Some(chrono::Utc::now());
        Transition::Complete(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;

    fn advance_to(task: &mut Task, stage: Stage) {
        while task.stage != stage {
            assert!(matches!(StateMachine::advance(task), Transition::Next(_)));
        }
    }

    #[test]
    fn happy_path_walks_all_stages() {
        let mut task = Task::new(1);
        assert_eq!(task.stage, Stage::Starting);

        advance_to(&mut task, Stage::Finalizing);
        let t = StateMachine::conclude(&mut task, TaskOutcome::Succeeded);
        assert_eq!(t, Transition::Complete(TaskOutcome::Succeeded));
        assert_eq!(task.stage, Stage::Succeeded);
        assert_eq!(
            task.stage_history,
            vec![
                Stage::Starting,
                Stage::AcquiringResources,
                Stage::PerformingSteps,
                Stage::AwaitingTurn,
                Stage::SolvingChallenge,
                Stage::AwaitingConfirmation,
                Stage::Finalizing,
            ]
        );
    }

    #[test]
    fn finalizing_has_no_successor() {
        let mut task = Task::new(1);
        advance_to(&mut task, Stage::Finalizing);
        let t = StateMachine::advance(&mut task);
        assert!(matches!(t, Transition::Invalid { .. }));
        assert_eq!(task.stage, Stage::Finalizing);
    }

    #[test]
    fn failure_allowed_from_any_live_stage() {
        let mut task = Task::new(2);
        StateMachine::advance(&mut task);
        let t = StateMachine::conclude(
            &mut task,
            TaskOutcome::Failed(FailureReason::ResourceUnavailable("exhausted".into())),
        );
        assert!(matches!(t, Transition::Complete(TaskOutcome::Failed(_))));
        assert_eq!(task.stage, Stage::Failed);
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn skip_only_from_solving_challenge() {
        let mut task = Task::new(3);
        advance_to(&mut task, Stage::PerformingSteps);
        let t = StateMachine::conclude(&mut task, TaskOutcome::Skipped);
        assert!(matches!(t, Transition::Invalid { .. }));
        assert_eq!(task.stage, Stage::PerformingSteps);

        advance_to(&mut task, Stage::SolvingChallenge);
        let t = StateMachine::conclude(&mut task, TaskOutcome::Skipped);
        assert_eq!(t, Transition::Complete(TaskOutcome::Skipped));
        assert_eq!(task.stage, Stage::Skipped);
    }

    #[test]
    fn terminal_stage_cannot_conclude_again() {
        let mut task = Task::new(4);
        StateMachine::conclude(&mut task, TaskOutcome::Failed(FailureReason::ConfirmationTimeout));
        let t = StateMachine::conclude(&mut task, TaskOutcome::Failed(FailureReason::ConfirmationTimeout));
        assert!(matches!(t, Transition::Invalid { .. }));
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::AwaitingTurn.to_string(), "AWAITING_TURN");
        assert_eq!(Stage::SolvingChallenge.to_string(), "SOLVING_CHALLENGE");
        assert_eq!(Stage::Skipped.to_string(), "SKIPPED");
    }
}
