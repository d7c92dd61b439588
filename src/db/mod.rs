pub mod trial_logs;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::config::ExperimentConfig;
use crate::error::{ExperimentError, Result};
use crate::model::{Checkpoint, ExperimentId, ExperimentModel, JobId, RequestId, TrialId};
use crate::state::State;

/// Persistence surface the coordinator depends on: a transactional record
/// of the experiment plus the snapshot blob store keyed by experiment id.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Insert a new experiment and its config, assigning `model.id` when it
    /// is zero.
    async fn add_experiment(
        &self,
        model: &mut ExperimentModel,
        config: &ExperimentConfig,
    ) -> Result<()>;

    async fn save_experiment_config(
        &self,
        id: ExperimentId,
        config: &ExperimentConfig,
    ) -> Result<()>;

    async fn save_experiment_state(&self, model: &ExperimentModel) -> Result<()>;

    async fn save_experiment_progress(&self, id: ExperimentId, progress: f64) -> Result<()>;

    async fn job_queue_position(&self, job_id: &JobId) -> Result<Option<f64>>;

    async fn update_job_position(&self, job_id: &JobId, position: f64) -> Result<()>;

    async fn save_snapshot(&self, id: ExperimentId, blob: Value) -> Result<()>;

    async fn experiment_snapshot(&self, id: ExperimentId) -> Result<Option<Value>>;

    async fn delete_snapshots_for_experiment(&self, id: ExperimentId) -> Result<()>;

    /// Checkpoints that fall outside the retention policy and should be
    /// garbage collected at shutdown.
    async fn checkpoints_to_gc(
        &self,
        id: ExperimentId,
        save_experiment_best: u32,
        save_trial_best: u32,
        save_trial_latest: u32,
    ) -> Result<Vec<Uuid>>;

    async fn trial_by_request_id(
        &self,
        id: ExperimentId,
        request_id: RequestId,
    ) -> Result<Option<TrialId>>;

    async fn latest_checkpoint_for_trial(&self, trial_id: TrialId) -> Result<Option<Checkpoint>>;

    async fn checkpoint_by_uuid(&self, uuid: Uuid) -> Result<Option<Checkpoint>>;

    async fn delete_session_by_token(&self, token: &str) -> Result<()>;
}

#[derive(Default)]
struct MemStoreInner {
    next_experiment_id: i64,
    experiments: BTreeMap<ExperimentId, ExperimentModel>,
    configs: BTreeMap<ExperimentId, ExperimentConfig>,
    progress: BTreeMap<ExperimentId, f64>,
    snapshots: BTreeMap<ExperimentId, Value>,
    job_positions: BTreeMap<JobId, f64>,
    trials: BTreeMap<(ExperimentId, RequestId), TrialId>,
    checkpoints: Vec<Checkpoint>,
    gc_checkpoints: BTreeMap<ExperimentId, Vec<Uuid>>,
    sessions: BTreeSet<String>,
    fail_config_saves: bool,
}

/// In-memory reference store. Backs the demo binary and the test suite;
/// deployments implement `ExperimentStore` against their database instead.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, token: impl Into<String>) {
        self.inner.lock().unwrap().sessions.insert(token.into());
    }

    pub fn has_session(&self, token: &str) -> bool {
        self.inner.lock().unwrap().sessions.contains(token)
    }

    pub fn register_trial(&self, id: ExperimentId, request_id: RequestId, trial_id: TrialId) {
        self.inner
            .lock()
            .unwrap()
            .trials
            .insert((id, request_id), trial_id);
    }

    pub fn add_checkpoint(&self, checkpoint: Checkpoint) {
        self.inner.lock().unwrap().checkpoints.push(checkpoint);
    }

    pub fn set_gc_checkpoints(&self, id: ExperimentId, uuids: Vec<Uuid>) {
        self.inner.lock().unwrap().gc_checkpoints.insert(id, uuids);
    }

    pub fn set_job_position(&self, job_id: JobId, position: f64) {
        self.inner
            .lock()
            .unwrap()
            .job_positions
            .insert(job_id, position);
    }

    /// Make every subsequent `save_experiment_config` fail, for rollback
    /// tests.
    pub fn fail_config_saves(&self, fail: bool) {
        self.inner.lock().unwrap().fail_config_saves = fail;
    }

    pub fn saved_config(&self, id: ExperimentId) -> Option<ExperimentConfig> {
        self.inner.lock().unwrap().configs.get(&id).cloned()
    }

    pub fn saved_state(&self, id: ExperimentId) -> Option<State> {
        self.inner
            .lock()
            .unwrap()
            .experiments
            .get(&id)
            .map(|m| m.state)
    }

    pub fn saved_progress(&self, id: ExperimentId) -> Option<f64> {
        self.inner.lock().unwrap().progress.get(&id).copied()
    }

    pub fn snapshot(&self, id: ExperimentId) -> Option<Value> {
        self.inner.lock().unwrap().snapshots.get(&id).cloned()
    }
}

#[async_trait]
impl ExperimentStore for MemStore {
    async fn add_experiment(
        &self,
        model: &mut ExperimentModel,
        config: &ExperimentConfig,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if model.id.0 == 0 {
            inner.next_experiment_id += 1;
            model.id = ExperimentId(inner.next_experiment_id);
        }
        inner.experiments.insert(model.id, model.clone());
        inner.configs.insert(model.id, config.clone());
        Ok(())
    }

    async fn save_experiment_config(
        &self,
        id: ExperimentId,
        config: &ExperimentConfig,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_config_saves {
            return Err(ExperimentError::internal("injected config save failure"));
        }
        inner.configs.insert(id, config.clone());
        Ok(())
    }

    async fn save_experiment_state(&self, model: &ExperimentModel) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .experiments
            .insert(model.id, model.clone());
        Ok(())
    }

    async fn save_experiment_progress(&self, id: ExperimentId, progress: f64) -> Result<()> {
        self.inner.lock().unwrap().progress.insert(id, progress);
        Ok(())
    }

    async fn job_queue_position(&self, job_id: &JobId) -> Result<Option<f64>> {
        Ok(self.inner.lock().unwrap().job_positions.get(job_id).copied())
    }

    async fn update_job_position(&self, job_id: &JobId, position: f64) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .job_positions
            .insert(job_id.clone(), position);
        Ok(())
    }

    async fn save_snapshot(&self, id: ExperimentId, blob: Value) -> Result<()> {
        self.inner.lock().unwrap().snapshots.insert(id, blob);
        Ok(())
    }

    async fn experiment_snapshot(&self, id: ExperimentId) -> Result<Option<Value>> {
        Ok(self.inner.lock().unwrap().snapshots.get(&id).cloned())
    }

    async fn delete_snapshots_for_experiment(&self, id: ExperimentId) -> Result<()> {
        self.inner.lock().unwrap().snapshots.remove(&id);
        Ok(())
    }

    async fn checkpoints_to_gc(
        &self,
        id: ExperimentId,
        _save_experiment_best: u32,
        _save_trial_best: u32,
        _save_trial_latest: u32,
    ) -> Result<Vec<Uuid>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .gc_checkpoints
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn trial_by_request_id(
        &self,
        id: ExperimentId,
        request_id: RequestId,
    ) -> Result<Option<TrialId>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .trials
            .get(&(id, request_id))
            .copied())
    }

    async fn latest_checkpoint_for_trial(&self, trial_id: TrialId) -> Result<Option<Checkpoint>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .checkpoints
            .iter()
            .filter(|c| c.trial_id == trial_id)
            .max_by_key(|c| c.report_time)
            .cloned())
    }

    async fn checkpoint_by_uuid(&self, uuid: Uuid) -> Result<Option<Checkpoint>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .checkpoints
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned())
    }

    async fn delete_session_by_token(&self, token: &str) -> Result<()> {
        self.inner.lock().unwrap().sessions.remove(token);
        Ok(())
    }
}
