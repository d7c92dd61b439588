use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::model::{ExperimentId, JobId, TaskId};

/// Glob matching every file of a checkpoint, used when GC should delete the
/// checkpoint entirely.
pub const FULL_DELETE_GLOB: &str = "**/*";

/// Opaque template stamped onto every task the experiment launches (trials
/// and the checkpoint-GC task). The coordinator only reads the session
/// token, at shutdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub owner: String,
    pub user_session_token: String,
    pub agent_user_group: Option<String>,
    #[serde(default)]
    pub extras: Value,
}

/// Work order for the asynchronous checkpoint-GC task spawned at shutdown.
#[derive(Debug, Clone)]
pub struct CheckpointGcRequest {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub experiment_id: ExperimentId,
    pub start_time: DateTime<Utc>,
    pub config: ExperimentConfig,
    pub checkpoints: Vec<Uuid>,
    pub delete_globs: Vec<String>,
    pub task_spec: TaskSpec,
}

impl CheckpointGcRequest {
    /// GC tasks get their own task id, namespaced under the experiment.
    pub fn task_id_for(experiment_id: ExperimentId) -> TaskId {
        TaskId(format!("{experiment_id}.{}", Uuid::new_v4()))
    }
}

/// Runs checkpoint garbage collection. The coordinator fires this in a
/// detached task with no cancellation path: it outlives the coordinator.
#[async_trait]
pub trait CheckpointGc: Send + Sync {
    async fn run(&self, req: CheckpointGcRequest) -> Result<()>;
}

/// GC runner that discards the request.
pub struct NoopCheckpointGc;

#[async_trait]
impl CheckpointGc for NoopCheckpointGc {
    async fn run(&self, _req: CheckpointGcRequest) -> Result<()> {
        Ok(())
    }
}
