use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Experiment lifecycle states.
///
/// `Stopping*` states form a pre-terminal barrier: no new work starts while
/// the experiment drains outstanding trials, then it moves to the paired
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Active,
    Paused,
    StoppingCanceled,
    StoppingKilled,
    StoppingCompleted,
    StoppingError,
    Canceled,
    Killed,
    Completed,
    Error,
}

impl State {
    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            State::StoppingCanceled
                | State::StoppingKilled
                | State::StoppingCompleted
                | State::StoppingError
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Canceled | State::Killed | State::Completed | State::Error
        )
    }

    /// The terminal state paired with a stopping state, if any.
    pub fn stopping_to_terminal(self) -> Option<State> {
        match self {
            State::StoppingCanceled => Some(State::Canceled),
            State::StoppingKilled => Some(State::Killed),
            State::StoppingCompleted => Some(State::Completed),
            State::StoppingError => Some(State::Error),
            _ => None,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    ///
    /// Killing wins over a softer stop already in progress, and any stopping
    /// state may degrade to `StoppingError`. Terminal states admit nothing.
    pub fn can_transition(self, to: State) -> bool {
        match (self, to) {
            (State::Active, State::Paused) | (State::Paused, State::Active) => true,
            (State::Active | State::Paused, to) if to.is_stopping() => true,
            (State::StoppingCanceled, State::Canceled) => true,
            (State::StoppingKilled, State::Killed) => true,
            (State::StoppingCompleted, State::Completed) => true,
            (State::StoppingError, State::Error) => true,
            (
                State::StoppingCanceled | State::StoppingCompleted,
                State::StoppingKilled | State::StoppingError,
            ) => true,
            (State::StoppingKilled, State::StoppingError) => true,
            _ => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A requested state change plus a human-readable reason, surfaced in logs
/// and forwarded to trials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateWithReason {
    pub state: State,
    pub informational_reason: String,
}

impl StateWithReason {
    pub fn new(state: State, reason: impl Into<String>) -> Self {
        Self {
            state,
            informational_reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal experiment state transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: State,
    pub to: State,
}
