use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::experiment::ExperimentHandle;
use crate::model::JobId;

/// The job-service view of an experiment, returned by the `GetJob` RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub entity_id: String,
    pub submission_time: DateTime<Utc>,
    pub username: String,
    pub user_id: i32,
    pub progress: f64,
    pub name: String,
    /// Zero when the owning workspace was never resolved (e.g. deleted).
    pub workspace_id: i32,
    pub resource_pool: String,
    pub priority: i32,
    pub weight: f64,
    pub is_preemptible: bool,
}

/// Tracks which experiments are registered as schedulable jobs.
pub trait JobService: Send + Sync {
    fn register_job(&self, job_id: &JobId, handle: ExperimentHandle);

    fn unregister_job(&self, job_id: &JobId);
}

/// Job service backed by a process-local map. Suitable for the demo binary
/// and tests; a deployment registers with the cluster-wide service instead.
#[derive(Default)]
pub struct LocalJobService {
    jobs: Mutex<HashMap<JobId, ExperimentHandle>>,
}

impl LocalJobService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &JobId) -> Option<ExperimentHandle> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().unwrap().is_empty()
    }
}

impl JobService for LocalJobService {
    fn register_job(&self, job_id: &JobId, handle: ExperimentHandle) {
        self.jobs.lock().unwrap().insert(job_id.clone(), handle);
    }

    fn unregister_job(&self, job_id: &JobId) {
        self.jobs.lock().unwrap().remove(job_id);
    }
}
