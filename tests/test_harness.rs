//! Test harness for experiment coordinator integration tests.
//!
//! Provides mock collaborators (resource manager, trial spawner, checkpoint
//! GC), a scriptable search method, and builders for wiring a coordinator
//! against an in-memory store.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use hypersweep::config::ExperimentConfig;
use hypersweep::db::MemStore;
use hypersweep::error::{ExperimentError, Result};
use hypersweep::experiment::snapshot::TrialSearcherState;
use hypersweep::experiment::{Experiment, ExperimentDeps, ExperimentHandle};
use hypersweep::jobs::LocalJobService;
use hypersweep::model::{ExitedReason, ExperimentModel, JobId, RequestId};
use hypersweep::rm::{LaunchWarning, ResourceManager, RmError};
use hypersweep::searcher::{Create, Operation, SearchMethod, ValidateAfter};
use hypersweep::state::StateWithReason;
use hypersweep::tasks::{CheckpointGc, CheckpointGcRequest, TaskSpec};
use hypersweep::telemetry::{LogTelemetry, NoopWebhooks};
use hypersweep::trial::{Trial, TrialContext, TrialSpawner};

pub const TEST_SESSION_TOKEN: &str = "test-session";

/// Everything tests typically want to observe about searcher callbacks.
#[derive(Debug, Default)]
pub struct ScriptedCalls {
    pub initial_operations: usize,
    pub validations: Vec<(RequestId, Value, u64)>,
    pub closed: Vec<RequestId>,
    pub exited_early: Vec<(RequestId, ExitedReason)>,
}

/// Search method driven entirely by the test: fixed initial operations plus
/// queues of responses for validation/close callbacks.
pub struct ScriptedSearch {
    initial_ops: Vec<Operation>,
    on_validation: VecDeque<Vec<Operation>>,
    on_closed: VecDeque<Vec<Operation>>,
    calls: Arc<Mutex<ScriptedCalls>>,
}

impl ScriptedSearch {
    pub fn new(initial_ops: Vec<Operation>) -> (Self, Arc<Mutex<ScriptedCalls>>) {
        let calls = Arc::new(Mutex::new(ScriptedCalls::default()));
        (
            Self {
                initial_ops,
                on_validation: VecDeque::new(),
                on_closed: VecDeque::new(),
                calls: calls.clone(),
            },
            calls,
        )
    }

    pub fn on_validation(mut self, ops: Vec<Operation>) -> Self {
        self.on_validation.push_back(ops);
        self
    }

    pub fn on_closed(mut self, ops: Vec<Operation>) -> Self {
        self.on_closed.push_back(ops);
        self
    }
}

impl SearchMethod for ScriptedSearch {
    fn initial_operations(&mut self) -> Result<Vec<Operation>> {
        self.calls.lock().unwrap().initial_operations += 1;
        Ok(self.initial_ops.clone())
    }

    fn trial_created(&mut self, _request_id: RequestId) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn validation_completed(
        &mut self,
        request_id: RequestId,
        metric: &Value,
        op: ValidateAfter,
    ) -> Result<Vec<Operation>> {
        self.calls
            .lock()
            .unwrap()
            .validations
            .push((request_id, metric.clone(), op.length));
        Ok(self.on_validation.pop_front().unwrap_or_default())
    }

    fn trial_closed(&mut self, request_id: RequestId) -> Result<Vec<Operation>> {
        self.calls.lock().unwrap().closed.push(request_id);
        Ok(self.on_closed.pop_front().unwrap_or_default())
    }

    fn trial_exited_early(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> Result<Vec<Operation>> {
        self.calls
            .lock()
            .unwrap()
            .exited_early
            .push((request_id, reason));
        Ok(Vec::new())
    }

    fn progress(&self, _trial_progress: &BTreeMap<RequestId, f64>) -> f64 {
        0.0
    }

    fn snapshot(&self) -> Result<Value> {
        Ok(json!({"scripted": true}))
    }

    fn restore(&mut self, _state: &Value) -> Result<()> {
        Ok(())
    }
}

/// Tracks how many patches are in flight at once across all mock trials.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Everything the coordinator pushed into one mock trial.
#[derive(Debug, Default)]
pub struct TrialRecord {
    pub searcher_patches: Vec<TrialSearcherState>,
    pub state_patches: Vec<StateWithReason>,
    pub rp_patches: Vec<String>,
    pub early_exits: Vec<ExitedReason>,
}

pub struct MockTrial {
    request_id: RequestId,
    record: Arc<Mutex<TrialRecord>>,
    patch_delay: Duration,
    gauge: Arc<ConcurrencyGauge>,
}

#[async_trait]
impl Trial for MockTrial {
    async fn patch_searcher_state(&self, state: TrialSearcherState) -> Result<()> {
        self.gauge.enter();
        tokio::time::sleep(self.patch_delay).await;
        self.record.lock().unwrap().searcher_patches.push(state);
        self.gauge.exit();
        Ok(())
    }

    async fn patch_state(&self, state: StateWithReason) -> Result<()> {
        self.gauge.enter();
        tokio::time::sleep(self.patch_delay).await;
        self.record.lock().unwrap().state_patches.push(state);
        self.gauge.exit();
        Ok(())
    }

    async fn patch_resource_pool(&self, pool: &str) -> Result<()> {
        self.record.lock().unwrap().rp_patches.push(pool.to_string());
        Ok(())
    }

    async fn set_user_initiated_early_exit(&self, reason: ExitedReason) -> Result<()> {
        self.record.lock().unwrap().early_exits.push(reason);
        Ok(())
    }
}

/// Spawner that hands out `MockTrial`s and records every construction.
#[derive(Default)]
pub struct MockSpawner {
    contexts: Mutex<Vec<TrialContext>>,
    records: Mutex<HashMap<RequestId, Arc<Mutex<TrialRecord>>>>,
    fail_spawns: AtomicBool,
    patch_delay_ms: AtomicU64,
    pub gauge: Arc<ConcurrencyGauge>,
}

impl MockSpawner {
    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    pub fn set_patch_delay(&self, delay: Duration) {
        self.patch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Contexts of every spawn attempt, in order.
    pub fn spawned(&self) -> Vec<TrialContext> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn record_for(&self, request_id: RequestId) -> Option<Arc<Mutex<TrialRecord>>> {
        self.records.lock().unwrap().get(&request_id).cloned()
    }
}

#[async_trait]
impl TrialSpawner for MockSpawner {
    async fn spawn(&self, ctx: TrialContext) -> Result<Arc<dyn Trial>> {
        self.contexts.lock().unwrap().push(ctx.clone());
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(ExperimentError::internal("injected trial spawn failure"));
        }
        let record = Arc::new(Mutex::new(TrialRecord::default()));
        self.records
            .lock()
            .unwrap()
            .insert(ctx.request_id(), record.clone());
        Ok(Arc::new(MockTrial {
            request_id: ctx.request_id(),
            record,
            patch_delay: Duration::from_millis(self.patch_delay_ms.load(Ordering::SeqCst)),
            gauge: self.gauge.clone(),
        }))
    }
}

/// Resource manager with injectable failures per call family.
#[derive(Default)]
pub struct MockRm {
    resolve_fails: AtomicBool,
    priority_error: Mutex<Option<RmError>>,
    weight_error: Mutex<Option<RmError>>,
    pub calls: Mutex<Vec<String>>,
    pub recovered_positions: Mutex<Vec<(JobId, f64, String)>>,
}

impl MockRm {
    pub fn fail_resolve(&self, fail: bool) {
        self.resolve_fails.store(fail, Ordering::SeqCst);
    }

    /// Error returned by every subsequent `set_group_priority`.
    pub fn set_priority_error(&self, error: Option<RmError>) {
        *self.priority_error.lock().unwrap() = error;
    }

    pub fn set_weight_error(&self, error: Option<RmError>) {
        *self.weight_error.lock().unwrap() = error;
    }
}

#[async_trait]
impl ResourceManager for MockRm {
    async fn resolve_resource_pool(
        &self,
        name: &str,
        _workspace_id: i32,
        _slots_per_trial: i32,
    ) -> std::result::Result<String, RmError> {
        if self.resolve_fails.load(Ordering::SeqCst) {
            return Err(RmError::Failed("no such pool".to_string()));
        }
        Ok(if name.is_empty() {
            "default".to_string()
        } else {
            name.to_string()
        })
    }

    async fn validate_resources(
        &self,
        _pool: &str,
        _slots_per_trial: i32,
        _is_single_node: bool,
    ) -> std::result::Result<(), RmError> {
        Ok(())
    }

    async fn validate_resource_pool_availability(
        &self,
        _pool: &str,
        _slots_per_trial: i32,
    ) -> std::result::Result<Vec<LaunchWarning>, RmError> {
        Ok(Vec::new())
    }

    async fn set_group_max_slots(
        &self,
        _job_id: &JobId,
        _max_slots: Option<i32>,
    ) -> std::result::Result<(), RmError> {
        self.calls.lock().unwrap().push("set_group_max_slots".to_string());
        Ok(())
    }

    async fn set_group_priority(
        &self,
        _job_id: &JobId,
        priority: i32,
    ) -> std::result::Result<(), RmError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("set_group_priority({priority})"));
        match self.priority_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn set_group_weight(
        &self,
        _job_id: &JobId,
        weight: f64,
    ) -> std::result::Result<(), RmError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("set_group_weight({weight})"));
        match self.weight_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn recover_job_position(
        &self,
        job_id: &JobId,
        position: f64,
        pool: &str,
    ) -> std::result::Result<(), RmError> {
        self.recovered_positions
            .lock()
            .unwrap()
            .push((job_id.clone(), position, pool.to_string()));
        Ok(())
    }
}

/// Records GC requests and wakes waiters when one lands.
#[derive(Default)]
pub struct MockGc {
    pub requests: Mutex<Vec<CheckpointGcRequest>>,
    pub notify: Notify,
}

#[async_trait]
impl CheckpointGc for MockGc {
    async fn run(&self, req: CheckpointGcRequest) -> Result<()> {
        self.requests.lock().unwrap().push(req);
        // notify_one stores a permit, so a waiter that arrives after the GC
        // ran still wakes up.
        self.notify.notify_one();
        Ok(())
    }
}

/// One bundle of mock collaborators plus the in-memory store.
pub struct Harness {
    pub store: Arc<MemStore>,
    pub rm: Arc<MockRm>,
    pub spawner: Arc<MockSpawner>,
    pub gc: Arc<MockGc>,
    pub jobs: Arc<LocalJobService>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemStore::new());
        store.add_session(TEST_SESSION_TOKEN);
        Self {
            store,
            rm: Arc::new(MockRm::default()),
            spawner: Arc::new(MockSpawner::default()),
            gc: Arc::new(MockGc::default()),
            jobs: Arc::new(LocalJobService::new()),
        }
    }

    pub fn deps(&self) -> ExperimentDeps {
        ExperimentDeps {
            store: self.store.clone(),
            rm: self.rm.clone(),
            spawner: self.spawner.clone(),
            telemetry: Arc::new(LogTelemetry),
            webhooks: Arc::new(NoopWebhooks),
            jobs: self.jobs.clone(),
            gc: self.gc.clone(),
        }
    }

    pub fn task_spec(&self) -> TaskSpec {
        TaskSpec {
            owner: "tester".to_string(),
            user_session_token: TEST_SESSION_TOKEN.to_string(),
            ..TaskSpec::default()
        }
    }

    /// Build (but do not start) a coordinator with a scripted method.
    pub async fn build(
        &self,
        config: ExperimentConfig,
        method: Box<dyn SearchMethod>,
    ) -> Experiment {
        self.build_with_model(ExperimentModel::new(1, "tester", 1, 1), config, method)
            .await
    }

    /// `build` with an explicit model, e.g. to reload an experiment that
    /// already has an id.
    pub async fn build_with_model(
        &self,
        model: ExperimentModel,
        config: ExperimentConfig,
        method: Box<dyn SearchMethod>,
    ) -> Experiment {
        let (experiment, _warnings) =
            Experiment::with_search_method(self.deps(), model, config, self.task_spec(), method)
                .await
                .expect("building experiment");
        experiment
    }

    pub async fn spawn(
        &self,
        config: ExperimentConfig,
        method: Box<dyn SearchMethod>,
    ) -> (ExperimentHandle, JoinHandle<()>) {
        self.build(config, method).await.spawn()
    }
}

/// `[Create, ValidateAfter]` for one trial.
pub fn create_and_validate(request_id: RequestId, length: u64) -> Vec<Operation> {
    vec![
        Operation::Create(Create::new(request_id, BTreeMap::new())),
        Operation::ValidateAfter(ValidateAfter { request_id, length }),
    ]
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let ok = wait_for(condition, timeout).await;
    assert!(ok, "{}", message);
}
