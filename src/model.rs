use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{IllegalTransition, State};

/// Database id of an experiment. Zero means "not yet persisted".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ExperimentId(pub i64);

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Database id of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(pub i64);

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a trial within an experiment, assigned by the
/// searcher. Survives restarts via the experiment snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler-facing job id for the whole experiment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task id assigned to a single trial or maintenance task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn for_trial(experiment_id: ExperimentId, request_id: RequestId) -> Self {
        Self(format!("{experiment_id}.{request_id}"))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a trial exited before the searcher closed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitedReason {
    Errored,
    UserRequestedStop,
    UserCanceled,
    InvalidHyperparameters,
    InitInvalidDataset,
}

impl fmt::Display for ExitedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A persisted model checkpoint, used for warm-starting new trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub uuid: Uuid,
    pub trial_id: TrialId,
    pub report_time: DateTime<Utc>,
}

/// The persisted experiment entity. Mutation is confined to the coordinator
/// loop; every accepted state transition is written back through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentModel {
    pub id: ExperimentId,
    pub job_id: JobId,
    pub owner_id: i32,
    pub username: String,
    pub project_id: i32,
    pub workspace_id: i32,
    pub start_time: DateTime<Utc>,
    pub state: State,
    pub archived: bool,
    pub unmanaged: bool,
}

impl ExperimentModel {
    /// A fresh, not-yet-persisted experiment. New experiments start paused;
    /// activation is an explicit control RPC.
    pub fn new(owner_id: i32, username: impl Into<String>, project_id: i32, workspace_id: i32) -> Self {
        Self {
            id: ExperimentId(0),
            job_id: JobId::generate(),
            owner_id,
            username: username.into(),
            project_id,
            workspace_id,
            start_time: Utc::now(),
            state: State::Paused,
            archived: false,
            unmanaged: false,
        }
    }

    /// Validated state transition.
    ///
    /// Returns `Ok(true)` and mutates on a legal transition, `Ok(false)` when
    /// the experiment is already in the target state (idempotent no-op), and
    /// an error when the transition is illegal. The state is unchanged on
    /// `Ok(false)` and `Err`.
    pub fn transition(&mut self, to: State) -> Result<bool, IllegalTransition> {
        if self.state == to {
            return Ok(false);
        }
        if !self.state.can_transition(to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(true)
    }
}

/// Key material generated once per experiment and shared by all of its
/// trials. Opaque to the coordinator; trials mount it into task containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialKeys {
    pub public_key: String,
    pub private_key: String,
}

/// Generate trial key material from OS randomness.
pub fn generate_trial_keys() -> TrialKeys {
    let mut rng = rand::rngs::OsRng;
    let mut public = [0u8; 32];
    let mut private = [0u8; 64];
    rng.fill_bytes(&mut public);
    rng.fill_bytes(&mut private);
    TrialKeys {
        public_key: hex(&public),
        private_key: hex(&private),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
