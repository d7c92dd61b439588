use async_trait::async_trait;
use thiserror::Error;

use crate::model::JobId;

/// Resource-manager call failures.
///
/// `Unsupported` is not treated as an error by the coordinator: the config
/// mutation that triggered the call stands and the call is skipped. Anything
/// else rolls the mutation back.
#[derive(Debug, Clone, Error)]
pub enum RmError {
    #[error("unsupported by this resource manager: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Failed(String),
}

/// Non-fatal warnings surfaced when validating resource availability for a
/// new experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchWarning {
    CurrentSlotsExceeded,
}

/// Outbound surface of the resource manager, which admits jobs onto compute
/// and exposes group-level scheduling controls.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Resolve a (possibly empty) pool name to a concrete pool the workspace
    /// may use for trials of the given size. Failure means the requested
    /// pool is invalid and the change or creation is rejected.
    async fn resolve_resource_pool(
        &self,
        name: &str,
        workspace_id: i32,
        slots_per_trial: i32,
    ) -> Result<String, RmError>;

    async fn validate_resources(
        &self,
        pool: &str,
        slots_per_trial: i32,
        is_single_node: bool,
    ) -> Result<(), RmError>;

    async fn validate_resource_pool_availability(
        &self,
        pool: &str,
        slots_per_trial: i32,
    ) -> Result<Vec<LaunchWarning>, RmError>;

    async fn set_group_max_slots(
        &self,
        job_id: &JobId,
        max_slots: Option<i32>,
    ) -> Result<(), RmError>;

    async fn set_group_priority(&self, job_id: &JobId, priority: i32) -> Result<(), RmError>;

    async fn set_group_weight(&self, job_id: &JobId, weight: f64) -> Result<(), RmError>;

    /// Re-assert a recovered queue position after a restore.
    async fn recover_job_position(
        &self,
        job_id: &JobId,
        position: f64,
        pool: &str,
    ) -> Result<(), RmError>;
}
