use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::experiment::snapshot::TrialSearcherState;
use crate::experiment::ExperimentHandle;
use crate::model::{Checkpoint, ExitedReason, ExperimentId, JobId, RequestId, TaskId, TrialKeys};
use crate::state::{State, StateWithReason};
use crate::tasks::TaskSpec;

/// The coordinator's view of a running trial.
///
/// The trial subsystem itself is external; these are the only calls the
/// coordinator makes into it. Per-call errors on fan-out paths are logged
/// by the coordinator, never propagated.
#[async_trait]
pub trait Trial: Send + Sync {
    /// Push the searcher's current view of this trial (outstanding op,
    /// completion, closure).
    async fn patch_searcher_state(&self, state: TrialSearcherState) -> Result<()>;

    /// Push an experiment state change.
    async fn patch_state(&self, state: StateWithReason) -> Result<()>;

    /// Move the trial to a different resource pool.
    async fn patch_resource_pool(&self, pool: &str) -> Result<()>;

    /// Relay a user-initiated early exit; the trial is expected to wind
    /// down and call back through `ExperimentHandle::trial_closed`.
    async fn set_user_initiated_early_exit(&self, reason: ExitedReason) -> Result<()>;
}

/// Everything a trial needs at construction time.
#[derive(Clone)]
pub struct TrialContext {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub experiment_id: ExperimentId,
    pub experiment_state: State,
    pub searcher_state: TrialSearcherState,
    /// Deep copy of the active config at creation time.
    pub config: ExperimentConfig,
    pub warm_start_checkpoint: Option<Checkpoint>,
    pub task_spec: TaskSpec,
    pub keys: TrialKeys,
    /// True when the trial is being rebuilt from a snapshot.
    pub restored: bool,
    /// Clone of the owning experiment's handle, for callbacks.
    pub experiment: ExperimentHandle,
}

impl TrialContext {
    pub fn request_id(&self) -> RequestId {
        self.searcher_state.create.request_id
    }
}

/// Constructs trials. A failed construction is finalized by the coordinator
/// via `trial_closed(request_id, Errored)` so the searcher stays consistent
/// with the registry.
#[async_trait]
pub trait TrialSpawner: Send + Sync {
    async fn spawn(&self, ctx: TrialContext) -> Result<Arc<dyn Trial>>;
}
