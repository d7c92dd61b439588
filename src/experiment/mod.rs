pub mod snapshot;

mod shutdown;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use futures::{stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ExperimentConfig, DEFAULT_SCHEDULING_PRIORITY};
use crate::db::ExperimentStore;
use crate::error::{ExperimentError, Result};
use crate::jobs::{JobRecord, JobService};
use crate::model::{
    Checkpoint, ExitedReason, ExperimentId, ExperimentModel, JobId, RequestId, TaskId, TrialId,
    TrialKeys,
};
use crate::registry::TrialRegistry;
use crate::rm::{LaunchWarning, ResourceManager, RmError};
use crate::searcher::queue::EventWatcher;
use crate::searcher::{methods, ops, Create, Operation, SearchMethod, Searcher, ValidateAfter};
use crate::state::{State, StateWithReason};
use crate::tasks::{CheckpointGc, TaskSpec};
use crate::telemetry::{Telemetry, Webhooks};
use crate::trial::{TrialContext, TrialSpawner};

use self::snapshot::{ExperimentSnapshot, TrialSearcherState};

/// Cap on concurrently in-flight trial patches during any fan-out.
pub const MAX_CONCURRENT_TRIAL_OPS: usize = 16;

/// Injected collaborators. One set per coordinator; all are owned by the
/// loop task and only touched from inside it.
#[derive(Clone)]
pub struct ExperimentDeps {
    pub store: Arc<dyn ExperimentStore>,
    pub rm: Arc<dyn ResourceManager>,
    pub spawner: Arc<dyn TrialSpawner>,
    pub telemetry: Arc<dyn Telemetry>,
    pub webhooks: Arc<dyn Webhooks>,
    pub jobs: Arc<dyn JobService>,
    pub gc: Arc<dyn CheckpointGc>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum ExperimentMessage {
    TrialCompleteOperation {
        request_id: RequestId,
        op: ValidateAfter,
        metric: Value,
        reply: Reply<()>,
    },
    TrialReportProgress {
        request_id: RequestId,
        progress: f64,
    },
    TrialGetSearcherState {
        request_id: RequestId,
        reply: Reply<TrialSearcherState>,
    },
    UserInitiatedEarlyExit {
        request_id: RequestId,
        reason: ExitedReason,
        reply: Reply<()>,
    },
    PatchTrialState {
        request_id: RequestId,
        state: StateWithReason,
        reply: Reply<()>,
    },
    TrialClosed {
        request_id: RequestId,
        reason: Option<ExitedReason>,
        done: oneshot::Sender<()>,
    },
    PatchState {
        state: StateWithReason,
    },
    PatchConfigName {
        name: String,
    },
    Activate {
        reply: Reply<()>,
    },
    Pause {
        reply: Reply<()>,
    },
    Cancel {
        reply: Reply<()>,
    },
    Kill {
        reply: Reply<()>,
    },
    SetGroupMaxSlots {
        max_slots: Option<i32>,
    },
    SetGroupPriority {
        priority: i32,
        reply: Reply<()>,
    },
    NotifyRmPriorityChange {
        priority: i32,
        reply: Reply<()>,
    },
    SetGroupWeight {
        weight: f64,
        reply: Reply<()>,
    },
    SetResourcePool {
        pool: String,
        reply: Reply<()>,
    },
    RegisterJobPosition {
        position: f64,
    },
    InvalidResourcesRequest {
        cause: String,
    },
    GetJob {
        reply: Reply<JobRecord>,
    },
    PostSearcherOperations {
        operations: Vec<Value>,
        triggered_by_event_id: u64,
        reply: Reply<()>,
    },
    GetSearcherEvents {
        reply: Reply<EventWatcher>,
    },
    UnwatchEvents {
        id: Uuid,
        reply: Reply<()>,
    },
}

/// Clonable entry point to a running coordinator.
///
/// Every method funnels through the coordinator's message channel, so calls
/// from any task are serialized with each other and with trial callbacks.
/// The handle also tracks the last published experiment state, which lets
/// Cancel/Kill stay idempotent after the coordinator has already shut down.
#[derive(Clone)]
pub struct ExperimentHandle {
    experiment_id: ExperimentId,
    job_id: JobId,
    tx: mpsc::Sender<ExperimentMessage>,
    state_rx: watch::Receiver<State>,
}

impl ExperimentHandle {
    pub fn experiment_id(&self) -> ExperimentId {
        self.experiment_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Last state published by the coordinator.
    pub fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> ExperimentMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(make(tx)).await.is_err() {
            return Err(ExperimentError::Precondition { state: self.state() });
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ExperimentError::internal(
                "experiment stopped before responding",
            )),
        }
    }

    async fn tell(&self, msg: ExperimentMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ExperimentError::Precondition { state: self.state() })
    }

    pub async fn activate(&self) -> Result<()> {
        self.ask(|reply| ExperimentMessage::Activate { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.ask(|reply| ExperimentMessage::Pause { reply }).await
    }

    pub async fn cancel(&self) -> Result<()> {
        match self.ask(|reply| ExperimentMessage::Cancel { reply }).await {
            Err(ExperimentError::Precondition { state })
                if state.is_stopping() || state.is_terminal() =>
            {
                Ok(())
            }
            other => other,
        }
    }

    pub async fn kill(&self) -> Result<()> {
        match self.ask(|reply| ExperimentMessage::Kill { reply }).await {
            Err(ExperimentError::Precondition { state })
                if state.is_stopping() || state.is_terminal() =>
            {
                Ok(())
            }
            other => other,
        }
    }

    /// A trial reports that it satisfied its outstanding validate-after op.
    pub async fn trial_complete_operation(
        &self,
        request_id: RequestId,
        op: ValidateAfter,
        metric: Value,
    ) -> Result<()> {
        self.ask(|reply| ExperimentMessage::TrialCompleteOperation {
            request_id,
            op,
            metric,
            reply,
        })
        .await
    }

    pub async fn trial_report_progress(
        &self,
        request_id: RequestId,
        progress: f64,
    ) -> Result<()> {
        self.tell(ExperimentMessage::TrialReportProgress {
            request_id,
            progress,
        })
        .await
    }

    pub async fn trial_get_searcher_state(
        &self,
        request_id: RequestId,
    ) -> Result<TrialSearcherState> {
        self.ask(|reply| ExperimentMessage::TrialGetSearcherState { request_id, reply })
            .await
    }

    pub async fn user_initiated_early_exit(
        &self,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> Result<()> {
        self.ask(|reply| ExperimentMessage::UserInitiatedEarlyExit {
            request_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn patch_trial_state(
        &self,
        request_id: RequestId,
        state: StateWithReason,
    ) -> Result<()> {
        self.ask(|reply| ExperimentMessage::PatchTrialState {
            request_id,
            state,
            reply,
        })
        .await
    }

    /// Callback invoked by a trial when it is done. Resolves once the
    /// coordinator has finished the close flow.
    pub async fn trial_closed(
        &self,
        request_id: RequestId,
        reason: Option<ExitedReason>,
    ) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.tell(ExperimentMessage::TrialClosed {
            request_id,
            reason,
            done,
        })
        .await?;
        let _ = ack.await;
        Ok(())
    }

    pub async fn patch_state(&self, state: StateWithReason) -> Result<()> {
        self.tell(ExperimentMessage::PatchState { state }).await
    }

    pub async fn patch_config_name(&self, name: String) -> Result<()> {
        self.tell(ExperimentMessage::PatchConfigName { name }).await
    }

    pub async fn set_group_max_slots(&self, max_slots: Option<i32>) -> Result<()> {
        self.tell(ExperimentMessage::SetGroupMaxSlots { max_slots })
            .await
    }

    pub async fn set_group_priority(&self, priority: i32) -> Result<()> {
        self.ask(|reply| ExperimentMessage::SetGroupPriority { priority, reply })
            .await
    }

    /// Priority change originating from the resource manager itself; applied
    /// and persisted but not forwarded back.
    pub async fn notify_rm_priority_change(&self, priority: i32) -> Result<()> {
        self.ask(|reply| ExperimentMessage::NotifyRmPriorityChange { priority, reply })
            .await
    }

    pub async fn set_group_weight(&self, weight: f64) -> Result<()> {
        self.ask(|reply| ExperimentMessage::SetGroupWeight { weight, reply })
            .await
    }

    pub async fn set_resource_pool(&self, pool: impl Into<String>) -> Result<()> {
        let pool = pool.into();
        self.ask(|reply| ExperimentMessage::SetResourcePool { pool, reply })
            .await
    }

    pub async fn register_job_position(&self, position: f64) -> Result<()> {
        self.tell(ExperimentMessage::RegisterJobPosition { position })
            .await
    }

    pub async fn invalid_resources_request(&self, cause: String) -> Result<()> {
        self.tell(ExperimentMessage::InvalidResourcesRequest { cause })
            .await
    }

    pub async fn get_job(&self) -> Result<JobRecord> {
        self.ask(|reply| ExperimentMessage::GetJob { reply }).await
    }

    /// Feed a batch of external searcher operations, acknowledging the event
    /// that triggered them.
    pub async fn post_searcher_operations(
        &self,
        operations: Vec<Value>,
        triggered_by_event_id: u64,
    ) -> Result<()> {
        self.ask(|reply| ExperimentMessage::PostSearcherOperations {
            operations,
            triggered_by_event_id,
            reply,
        })
        .await
    }

    pub async fn get_searcher_events(&self) -> Result<EventWatcher> {
        self.ask(|reply| ExperimentMessage::GetSearcherEvents { reply })
            .await
    }

    pub async fn unwatch_events(&self, id: Uuid) -> Result<()> {
        self.ask(|reply| ExperimentMessage::UnwatchEvents { id, reply })
            .await
    }
}

/// The experiment coordinator: all state for one hyperparameter search,
/// owned by a single loop task.
pub struct Experiment {
    deps: ExperimentDeps,
    model: ExperimentModel,
    active_config: ExperimentConfig,
    searcher: Searcher,
    trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
    trials: TrialRegistry,
    warm_start_checkpoint: Option<Checkpoint>,
    task_spec: TaskSpec,
    keys: TrialKeys,
    fault_tolerance_enabled: bool,
    restored: bool,
    self_ref: Option<ExperimentHandle>,
    state_tx: Option<watch::Sender<State>>,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("model", &self.model)
            .field("restored", &self.restored)
            .finish_non_exhaustive()
    }
}

impl Experiment {
    /// Build a coordinator for a fresh or reloaded experiment.
    ///
    /// Resolves and validates the resource pool, constructs the searcher
    /// from the config, resolves the warm-start checkpoint, and persists the
    /// experiment (with creation telemetry) when the model has no id yet.
    pub async fn new(
        deps: ExperimentDeps,
        model: ExperimentModel,
        active_config: ExperimentConfig,
        task_spec: TaskSpec,
    ) -> Result<(Self, Vec<LaunchWarning>)> {
        let method = methods::new_search_method(
            &active_config.searcher,
            &active_config.hyperparameters,
            active_config.reproducibility.seed,
        );
        Self::with_search_method(deps, model, active_config, task_spec, method).await
    }

    /// `new` with an explicit search method, for callers that plug in their
    /// own algorithm.
    pub async fn with_search_method(
        deps: ExperimentDeps,
        mut model: ExperimentModel,
        mut active_config: ExperimentConfig,
        task_spec: TaskSpec,
        method: Box<dyn SearchMethod>,
    ) -> Result<(Self, Vec<LaunchWarning>)> {
        if model.unmanaged {
            return Err(ExperimentError::validation(
                "unmanaged experiments cannot be run by a coordinator",
            ));
        }

        let resources = &active_config.resources;
        let pool = deps
            .rm
            .resolve_resource_pool(
                &resources.resource_pool,
                model.workspace_id,
                resources.slots_per_trial,
            )
            .await
            .map_err(|e| {
                ExperimentError::validation(format!("cannot create an experiment: {e}"))
            })?;

        let mut warnings = Vec::new();
        if model.id.0 == 0 {
            deps.rm
                .validate_resources(&pool, resources.slots_per_trial, false)
                .await
                .map_err(|e| {
                    ExperimentError::validation(format!("validating resources: {e}"))
                })?;
            warnings = deps
                .rm
                .validate_resource_pool_availability(&pool, resources.slots_per_trial)
                .await
                .map_err(|e| {
                    ExperimentError::validation(format!("getting resource availability: {e}"))
                })?;
        }
        active_config.resources.resource_pool = pool;

        let searcher = Searcher::new(method);

        let warm_start_checkpoint = checkpoint_from_trial_id_or_uuid(
            deps.store.as_ref(),
            active_config.searcher.source_trial_id,
            active_config.searcher.source_checkpoint_uuid,
        )
        .await?;

        if model.id.0 == 0 {
            deps.store.add_experiment(&mut model, &active_config).await?;
            deps.telemetry.report_experiment_created(&model, &active_config);
        }

        Ok((
            Self {
                deps,
                model,
                active_config,
                searcher,
                trial_searcher_state: BTreeMap::new(),
                trials: TrialRegistry::new(),
                warm_start_checkpoint,
                task_spec,
                keys: crate::model::generate_trial_keys(),
                fault_tolerance_enabled: true,
                restored: false,
                self_ref: None,
                state_tx: None,
            },
            warnings,
        ))
    }

    /// Persist an unmanaged experiment: paused, flagged, and never
    /// supervised. Returns only the model; there is no coordinator to build
    /// from it (`new` rejects unmanaged models).
    pub async fn create_unmanaged(
        store: &dyn ExperimentStore,
        telemetry: &dyn Telemetry,
        mut model: ExperimentModel,
        config: &ExperimentConfig,
    ) -> Result<ExperimentModel> {
        model.state = State::Paused;
        model.unmanaged = true;
        store.add_experiment(&mut model, config).await?;
        telemetry.report_experiment_created(&model, config);
        Ok(model)
    }

    pub fn id(&self) -> ExperimentId {
        self.model.id
    }

    pub fn state(&self) -> State {
        self.model.state
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.active_config
    }

    /// One JSON blob combining the searcher's snapshot and the coordinator's
    /// per-trial searcher state. Deterministic for identical state.
    pub fn snapshot(&self) -> Result<Value> {
        let snapshot = ExperimentSnapshot {
            searcher_state: self.searcher.snapshot()?,
            trial_searcher_state: self.trial_searcher_state.clone(),
        };
        serde_json::to_value(&snapshot).map_err(|e| {
            ExperimentError::internal(format!("failed to marshal experiment snapshot: {e}"))
        })
    }

    /// Inverse of `snapshot`. Coordinator state is decoded first, then the
    /// searcher restores from its own bytes. Marks the experiment restored,
    /// which switches startup from `initial_operations` to trial rebuild.
    pub fn restore(&mut self, blob: Value) -> Result<()> {
        let snapshot: ExperimentSnapshot = serde_json::from_value(blob).map_err(|e| {
            ExperimentError::internal(format!("failed to unmarshal experiment snapshot: {e}"))
        })?;
        self.trial_searcher_state = snapshot.trial_searcher_state;
        self.searcher.restore(&snapshot.searcher_state)?;
        self.restored = true;
        Ok(())
    }

    /// Start the coordinator loop. The returned handle is the only way in;
    /// the join handle resolves after the shutdown sequencer has run.
    pub fn spawn(mut self) -> (ExperimentHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(128);
        let (state_tx, state_rx) = watch::channel(self.model.state);
        let handle = ExperimentHandle {
            experiment_id: self.model.id,
            job_id: self.model.job_id.clone(),
            tx,
            state_rx,
        };
        self.self_ref = Some(handle.clone());
        self.state_tx = Some(state_tx);
        let join = tokio::spawn(self.run(rx));
        (handle, join)
    }

    fn publish_state(&self) {
        if let Some(tx) = &self.state_tx {
            let _ = tx.send(self.model.state);
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ExperimentMessage>) {
        if let Err(e) = self.pre_start().await {
            error!(experiment_id = %self.model.id, error = %e, "experiment startup failed");
        }
        self.publish_state();

        while !self.can_terminate() {
            let Some(msg) = rx.recv().await else {
                warn!(experiment_id = %self.model.id, "all experiment handles dropped");
                break;
            };
            self.handle_message(msg).await;
        }

        rx.close();
        if let Err(e) = shutdown::run(&mut self).await {
            error!(experiment_id = %self.model.id, error = %e, "experiment shutdown failed");
        }
        self.publish_state();

        // Late messages raced with termination; answer them from the final
        // state instead of dropping their reply channels.
        while let Ok(msg) = rx.try_recv() {
            self.respond_terminated(msg);
        }
    }

    async fn pre_start(&mut self) -> Result<()> {
        info!(
            experiment_id = %self.model.id,
            job_id = %self.model.job_id,
            restored = self.restored,
            "experiment coordinator starting"
        );

        if let Err(e) = self
            .deps
            .rm
            .set_group_max_slots(&self.model.job_id, self.active_config.resources.max_slots)
            .await
        {
            warn!(error = %e, "failed to push max slots to the resource manager");
        }
        let weight = self.active_config.resources.weight;
        if let Err(e) = self.set_weight(weight).await {
            self.update_state(StateWithReason::new(State::StoppingError, e.to_string()))
                .await;
            return Err(e);
        }
        let priority = self.active_config.resources.priority;
        if let Err(e) = self.set_priority(priority, true).await {
            self.update_state(StateWithReason::new(State::StoppingError, e.to_string()))
                .await;
            return Err(e);
        }

        if let Some(handle) = &self.self_ref {
            self.deps.jobs.register_job(&self.model.job_id, handle.clone());
        }

        if self.restored {
            match self.deps.store.job_queue_position(&self.model.job_id).await {
                Ok(position) => {
                    if let Some(position) = position.filter(|p| *p > 0.0) {
                        let pool = self.active_config.resources.resource_pool.clone();
                        if let Err(e) = self
                            .deps
                            .rm
                            .recover_job_position(&self.model.job_id, position, &pool)
                            .await
                        {
                            warn!(error = %e, "failed to recover job queue position");
                        }
                    }
                }
                Err(e) => {
                    self.update_state(StateWithReason::new(State::StoppingError, e.to_string()))
                        .await;
                    return Err(e);
                }
            }
            self.restore_trials().await;
            return Ok(());
        }

        let ops = match self.searcher.initial_operations() {
            Ok(ops) => ops,
            Err(e) => {
                let e = ExperimentError::internal(format!(
                    "failed to generate initial operations: {e}"
                ));
                self.update_state(StateWithReason::new(State::StoppingError, e.to_string()))
                    .await;
                return Err(e);
            }
        };
        self.process_operations(ops, None).await;
        Ok(())
    }

    async fn handle_message(&mut self, msg: ExperimentMessage) {
        match msg {
            ExperimentMessage::TrialCompleteOperation {
                request_id,
                op,
                metric,
                reply,
            } => {
                let result = self.trial_complete_operation(request_id, op, metric).await;
                let _ = reply.send(result);
            }
            ExperimentMessage::TrialReportProgress {
                request_id,
                progress,
            } => {
                self.searcher.set_trial_progress(request_id, progress);
                let progress = self.searcher.progress();
                if let Err(e) = self
                    .deps
                    .store
                    .save_experiment_progress(self.model.id, progress)
                    .await
                {
                    error!(error = %e, "failed to save experiment progress");
                }
            }
            ExperimentMessage::TrialGetSearcherState { request_id, reply } => {
                let result = self
                    .trial_searcher_state
                    .get(&request_id)
                    .cloned()
                    .ok_or_else(|| ExperimentError::not_found("trial has no state"));
                let _ = reply.send(result);
            }
            ExperimentMessage::UserInitiatedEarlyExit {
                request_id,
                reason,
                reply,
            } => {
                let result = match self.trials.get(&request_id) {
                    Some(trial) => trial.set_user_initiated_early_exit(reason).await,
                    None => Err(ExperimentError::not_found("trial not found")),
                };
                let _ = reply.send(result);
            }
            ExperimentMessage::PatchTrialState {
                request_id,
                state,
                reply,
            } => {
                let result = match self.trials.get(&request_id) {
                    Some(trial) => trial.patch_state(state).await,
                    None => Err(ExperimentError::not_found("trial not found")),
                };
                let _ = reply.send(result);
            }
            ExperimentMessage::TrialClosed {
                request_id,
                reason,
                done,
            } => {
                self.handle_trial_closed(request_id, reason).await;
                let _ = done.send(());
            }
            ExperimentMessage::PatchState { state } => {
                self.update_state(state).await;
            }
            ExperimentMessage::PatchConfigName { name } => {
                self.active_config.name = name;
            }
            ExperimentMessage::Activate { reply } => {
                let result = self
                    .control_transition(State::Active, "user requested activation")
                    .await;
                let _ = reply.send(result);
            }
            ExperimentMessage::Pause { reply } => {
                let result = self
                    .control_transition(State::Paused, "user requested pause")
                    .await;
                let _ = reply.send(result);
            }
            ExperimentMessage::Cancel { reply } => {
                let result = if self.model.state.is_stopping() || self.model.state.is_terminal()
                {
                    Ok(())
                } else {
                    self.control_transition(
                        State::StoppingCanceled,
                        "user requested cancellation",
                    )
                    .await
                };
                let _ = reply.send(result);
            }
            ExperimentMessage::Kill { reply } => {
                let result = if self.model.state == State::StoppingKilled
                    || self.model.state.is_terminal()
                {
                    Ok(())
                } else {
                    self.control_transition(State::StoppingKilled, "user requested kill")
                        .await
                };
                let _ = reply.send(result);
            }
            ExperimentMessage::SetGroupMaxSlots { max_slots } => {
                self.active_config.resources.max_slots = max_slots;
                if let Err(e) = self
                    .deps
                    .rm
                    .set_group_max_slots(&self.model.job_id, max_slots)
                    .await
                {
                    warn!(error = %e, "failed to forward max slots to the resource manager");
                }
            }
            ExperimentMessage::SetGroupPriority { priority, reply } => {
                let result = self.set_priority(Some(priority), true).await;
                if let Err(e) = &result {
                    info!(error = %e, "setting experiment job priority");
                }
                let _ = reply.send(result);
            }
            ExperimentMessage::NotifyRmPriorityChange { priority, reply } => {
                let result = self.set_priority(Some(priority), false).await;
                if let Err(e) = &result {
                    info!(error = %e, "setting experiment job priority");
                }
                let _ = reply.send(result);
            }
            ExperimentMessage::SetGroupWeight { weight, reply } => {
                let result = self.set_weight(weight).await;
                if let Err(e) = &result {
                    info!(error = %e, "setting experiment job weight");
                }
                let _ = reply.send(result);
            }
            ExperimentMessage::SetResourcePool { pool, reply } => {
                let result = self.set_resource_pool(&pool).await;
                let _ = reply.send(result);
            }
            ExperimentMessage::RegisterJobPosition { position } => {
                if let Err(e) = self
                    .deps
                    .store
                    .update_job_position(&self.model.job_id, position)
                    .await
                {
                    error!(
                        error = %e,
                        job_id = %self.model.job_id,
                        "persisting job queue position failed"
                    );
                }
            }
            ExperimentMessage::InvalidResourcesRequest { cause } => {
                self.update_state(StateWithReason::new(State::StoppingError, cause))
                    .await;
            }
            ExperimentMessage::GetJob { reply } => {
                let _ = reply.send(Ok(self.job_record()));
            }
            ExperimentMessage::PostSearcherOperations {
                operations,
                triggered_by_event_id,
                reply,
            } => {
                let result = self
                    .post_searcher_operations(operations, triggered_by_event_id)
                    .await;
                let _ = reply.send(result);
            }
            ExperimentMessage::GetSearcherEvents { reply } => {
                let _ = reply.send(self.searcher.watch_events());
            }
            ExperimentMessage::UnwatchEvents { id, reply } => {
                let result = self.searcher.event_queue_mut().map(|q| q.unwatch(id));
                let _ = reply.send(result);
            }
        }
    }

    /// Answer a message that arrived after the loop ended, using the final
    /// state.
    fn respond_terminated(&self, msg: ExperimentMessage) {
        let state = self.model.state;
        match msg {
            ExperimentMessage::Cancel { reply } | ExperimentMessage::Kill { reply } => {
                let _ = reply.send(if state.is_terminal() || state.is_stopping() {
                    Ok(())
                } else {
                    Err(ExperimentError::Precondition { state })
                });
            }
            ExperimentMessage::Activate { reply } | ExperimentMessage::Pause { reply } => {
                let _ = reply.send(Err(ExperimentError::Precondition { state }));
            }
            ExperimentMessage::GetJob { reply } => {
                let _ = reply.send(Ok(self.job_record()));
            }
            ExperimentMessage::TrialClosed { done, .. } => {
                let _ = done.send(());
            }
            ExperimentMessage::TrialCompleteOperation { reply, .. }
            | ExperimentMessage::UserInitiatedEarlyExit { reply, .. }
            | ExperimentMessage::PatchTrialState { reply, .. }
            | ExperimentMessage::SetGroupPriority { reply, .. }
            | ExperimentMessage::NotifyRmPriorityChange { reply, .. }
            | ExperimentMessage::SetGroupWeight { reply, .. }
            | ExperimentMessage::SetResourcePool { reply, .. }
            | ExperimentMessage::PostSearcherOperations { reply, .. }
            | ExperimentMessage::UnwatchEvents { reply, .. } => {
                let _ = reply.send(Err(ExperimentError::Precondition { state }));
            }
            ExperimentMessage::TrialGetSearcherState { reply, .. } => {
                let _ = reply.send(Err(ExperimentError::Precondition { state }));
            }
            ExperimentMessage::GetSearcherEvents { reply } => {
                let _ = reply.send(Err(ExperimentError::Precondition { state }));
            }
            ExperimentMessage::TrialReportProgress { .. }
            | ExperimentMessage::PatchState { .. }
            | ExperimentMessage::PatchConfigName { .. }
            | ExperimentMessage::SetGroupMaxSlots { .. }
            | ExperimentMessage::RegisterJobPosition { .. }
            | ExperimentMessage::InvalidResourcesRequest { .. } => {}
        }
    }

    /// User-driven state change: `Ok` on success or idempotent no-op,
    /// `FailedPrecondition` when the transition is illegal from the current
    /// state.
    async fn control_transition(&mut self, target: State, reason: &str) -> Result<()> {
        if self
            .update_state(StateWithReason::new(target, reason))
            .await
        {
            Ok(())
        } else {
            Err(ExperimentError::Precondition {
                state: self.model.state,
            })
        }
    }

    async fn trial_complete_operation(
        &mut self,
        request_id: RequestId,
        op: ValidateAfter,
        metric: Value,
    ) -> Result<()> {
        let state = match self.trial_searcher_state.get(&op.request_id) {
            None => return Err(ExperimentError::validation("no such trial")),
            Some(state) => state.clone(),
        };
        match state.op {
            Some(stored) if stored == op => {}
            _ => {
                return Err(ExperimentError::validation(format!(
                    "expected op {:?} but received op {:?}",
                    state.op, op
                )))
            }
        }
        if state.complete {
            return Err(ExperimentError::validation(format!(
                "received op {op:?} which was previously completed"
            )));
        }

        let mut state = state;
        state.complete = true;
        self.trial_searcher_state.insert(op.request_id, state.clone());

        let Some(trial) = self.trials.get(&op.request_id) else {
            return Err(ExperimentError::not_found("trial not found"));
        };
        if let Err(e) = trial.patch_searcher_state(state).await {
            error!(request_id = %op.request_id, error = %e, "patching trial searcher state");
            return Err(e);
        }

        let result = self.searcher.validation_completed(request_id, metric, op);
        self.process_ops_result(result).await;
        Ok(())
    }

    async fn handle_trial_closed(
        &mut self,
        request_id: RequestId,
        reason: Option<ExitedReason>,
    ) {
        let mut worklist = VecDeque::new();
        self.trial_closed_inline(request_id, reason, &mut worklist)
            .await;
        while let Some(batch) = worklist.pop_front() {
            self.process_operations(batch, None).await;
        }
    }

    async fn trial_closed_inline(
        &mut self,
        request_id: RequestId,
        reason: Option<ExitedReason>,
        worklist: &mut VecDeque<Vec<Operation>>,
    ) {
        if let Some(reason) = reason {
            self.trial_report_early_exit(request_id, reason, worklist)
                .await;
        }
        self.trials.remove(&request_id);
        match self.searcher.trial_closed(request_id) {
            Ok(ops) => {
                if !ops.is_empty() {
                    worklist.push_back(ops);
                }
            }
            Err(e) => self.searcher_failed(&e.to_string()).await,
        }
    }

    async fn trial_report_early_exit(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
        worklist: &mut VecDeque<Vec<Operation>>,
    ) {
        info!(request_id = %request_id, reason = %reason, "experiment received trial early exit");
        let Some(mut state) = self.trial_searcher_state.get(&request_id).cloned() else {
            error!(request_id = %request_id, "trial has no searcher state on early exit");
            return;
        };
        state.complete = true;
        state.closed = true;
        self.trial_searcher_state.insert(request_id, state.clone());

        let Some(trial) = self.trials.get(&request_id) else {
            warn!(request_id = %request_id, "missing trial to patch on early exit");
            return;
        };
        if let Err(e) = trial.patch_searcher_state(state).await {
            error!(request_id = %request_id, error = %e, "patching trial searcher state");
            return;
        }

        match self.searcher.trial_exited_early(request_id, reason) {
            Ok(ops) => {
                if !ops.is_empty() {
                    worklist.push_back(ops);
                }
            }
            Err(e) => self.searcher_failed(&e.to_string()).await,
        }
    }

    async fn process_ops_result(&mut self, result: Result<Vec<Operation>>) {
        match result {
            Ok(ops) => self.process_operations(ops, None).await,
            Err(e) => self.process_operations(Vec::new(), Some(e.to_string())).await,
        }
    }

    async fn searcher_failed(&mut self, err: &str) {
        error!(error = err, "searcher failure");
        self.update_state(StateWithReason::new(
            State::StoppingError,
            format!("encountered error {err}"),
        ))
        .await;
    }

    /// Apply one batch of searcher operations.
    ///
    /// Skipped entirely in stopping states; a source error is equivalent to
    /// `Shutdown{failure}`. Follow-up batches produced mid-batch (trial
    /// created, close-on-construction-failure) join the worklist rather than
    /// recursing. Ends with one bounded fan-out of changed trial states and
    /// one snapshot save.
    async fn process_operations(&mut self, ops: Vec<Operation>, source_error: Option<String>) {
        if self.model.state.is_stopping() {
            return;
        }
        if let Some(err) = source_error {
            self.searcher_failed(&err).await;
            return;
        }

        let mut updated: BTreeSet<RequestId> = BTreeSet::new();
        let mut worklist: VecDeque<Vec<Operation>> = VecDeque::new();
        worklist.push_back(ops);
        while let Some(batch) = worklist.pop_front() {
            for operation in batch {
                debug!(op = ?operation, "handling searcher operation");
                match operation {
                    Operation::Create(op) => self.handle_create(op, &mut worklist).await,
                    Operation::ValidateAfter(op) => {
                        match self.trial_searcher_state.get_mut(&op.request_id) {
                            Some(state) => {
                                state.op = Some(op);
                                state.complete = false;
                                updated.insert(op.request_id);
                            }
                            None => {
                                error!(request_id = %op.request_id, "validate-after for unknown trial")
                            }
                        }
                    }
                    Operation::Close { request_id } => {
                        match self.trial_searcher_state.get_mut(&request_id) {
                            Some(state) => {
                                state.closed = true;
                                updated.insert(request_id);
                            }
                            None => error!(request_id = %request_id, "close for unknown trial"),
                        }
                    }
                    Operation::SetSearcherProgress { progress } => {
                        if let Err(e) = self.searcher.set_custom_searcher_progress(progress) {
                            error!(error = %e, "failed to set searcher progress");
                        }
                    }
                    Operation::Shutdown { failure, cancel } => {
                        info!(failure, cancel, "searcher shutdown");
                        let (state, reason) = if failure {
                            (State::StoppingError, "hp search failed")
                        } else if cancel {
                            (State::StoppingCanceled, "hp search canceled")
                        } else {
                            (State::StoppingCompleted, "hp search completed")
                        };
                        self.update_state(StateWithReason::new(state, reason)).await;
                    }
                }
            }
        }

        let mut targets = Vec::new();
        for request_id in updated {
            let Some(trial) = self.trials.get(&request_id) else {
                error!(request_id = %request_id, "no live trial for updated searcher state");
                continue;
            };
            if let Some(state) = self.trial_searcher_state.get(&request_id) {
                targets.push((request_id, trial, state.clone()));
            }
        }
        stream::iter(targets)
            .for_each_concurrent(MAX_CONCURRENT_TRIAL_OPS, |(request_id, trial, state)| async move {
                if let Err(e) = trial.patch_searcher_state(state).await {
                    error!(request_id = %request_id, error = %e, "updating trial searcher state");
                }
            })
            .await;

        self.snapshot_and_save().await;
    }

    async fn handle_create(&mut self, op: Create, worklist: &mut VecDeque<Vec<Operation>>) {
        let request_id = op.request_id;
        if self.trials.contains(&request_id) {
            error!(request_id = %request_id, "trial already exists");
            return;
        }
        let checkpoint = match self.checkpoint_for_create(&op).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "resolving checkpoint for new trial");
                self.update_state(StateWithReason::new(
                    State::StoppingError,
                    format!("hp search unable to get checkpoint for new trial with error {e}"),
                ))
                .await;
                return;
            }
        };

        let state = TrialSearcherState::new(op);
        self.trial_searcher_state.insert(request_id, state.clone());

        let handle = self
            .self_ref
            .clone()
            .expect("experiment not started before processing operations");
        let ctx = TrialContext {
            task_id: TaskId::for_trial(self.model.id, request_id),
            job_id: self.model.job_id.clone(),
            experiment_id: self.model.id,
            experiment_state: self.model.state,
            searcher_state: state,
            config: self.active_config.clone(),
            warm_start_checkpoint: checkpoint,
            task_spec: self.task_spec.clone(),
            keys: self.keys.clone(),
            restored: false,
            experiment: handle,
        };
        match self.deps.spawner.spawn(ctx).await {
            Ok(trial) => self.register_trial(request_id, trial, worklist).await,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "failed to create trial");
                self.trial_closed_inline(request_id, Some(ExitedReason::Errored), worklist)
                    .await;
            }
        }
    }

    async fn register_trial(
        &mut self,
        request_id: RequestId,
        trial: Arc<dyn crate::trial::Trial>,
        worklist: &mut VecDeque<Vec<Operation>>,
    ) {
        if !self.searcher.trial_is_created(request_id) {
            match self.searcher.trial_created(request_id) {
                Ok(ops) => {
                    if !ops.is_empty() {
                        worklist.push_back(ops);
                    }
                }
                Err(e) => self.searcher_failed(&e.to_string()).await,
            }
        }
        self.trials.insert(request_id, trial);
    }

    /// Rebuild trials from the snapshotted searcher states. Trials the
    /// searcher has fully finished with stay out of the registry.
    async fn restore_trials(&mut self) {
        let states: Vec<TrialSearcherState> =
            self.trial_searcher_state.values().cloned().collect();
        for state in states {
            if state.is_terminal() {
                continue;
            }
            let request_id = state.create.request_id;
            let checkpoint = match self.checkpoint_for_create(&state.create).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "restoring trial checkpoint");
                    self.update_state(StateWithReason::new(
                        State::StoppingError,
                        format!("failed getting checkpoint to restore with error {e}"),
                    ))
                    .await;
                    return;
                }
            };

            let handle = self
                .self_ref
                .clone()
                .expect("experiment not started before restoring trials");
            let ctx = TrialContext {
                task_id: TaskId::for_trial(self.model.id, request_id),
                job_id: self.model.job_id.clone(),
                experiment_id: self.model.id,
                experiment_state: self.model.state,
                searcher_state: state.clone(),
                config: self.active_config.clone(),
                warm_start_checkpoint: checkpoint,
                task_spec: self.task_spec.clone(),
                keys: self.keys.clone(),
                restored: true,
                experiment: handle,
            };

            let mut worklist = VecDeque::new();
            match self.deps.spawner.spawn(ctx).await {
                Ok(trial) => self.register_trial(request_id, trial, &mut worklist).await,
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "failed to restore trial");
                    self.trial_closed_inline(request_id, Some(ExitedReason::Errored), &mut worklist)
                        .await;
                }
            }
            while let Some(batch) = worklist.pop_front() {
                self.process_operations(batch, None).await;
            }
        }
    }

    /// Resolve the warm-start checkpoint for a create operation: a
    /// create-specific source trial overrides the experiment-wide warm
    /// start.
    async fn checkpoint_for_create(&self, op: &Create) -> Result<Option<Checkpoint>> {
        let mut checkpoint = self.warm_start_checkpoint.clone();
        if let Some(source) = &op.checkpoint {
            let trial_id = self
                .deps
                .store
                .trial_by_request_id(self.model.id, source.request_id)
                .await?
                .ok_or_else(|| {
                    ExperimentError::validation(format!(
                        "invalid request ID in create operation: {}",
                        source.request_id
                    ))
                })?;
            let source_checkpoint = checkpoint_from_trial_id_or_uuid(
                self.deps.store.as_ref(),
                Some(trial_id),
                None,
            )
            .await?
            .ok_or_else(|| ExperimentError::not_found("checkpoint not found"))?;
            checkpoint = Some(source_checkpoint);
        }
        Ok(checkpoint)
    }

    async fn post_searcher_operations(
        &mut self,
        payloads: Vec<Value>,
        triggered_by_event_id: u64,
    ) -> Result<()> {
        self.searcher.event_queue_mut()?;
        let ops = ops::decode_operations(&payloads);
        info!(count = ops.len(), "processing searcher operations");

        let queue = self.searcher.event_queue_mut()?;
        queue.remove_up_to(triggered_by_event_id).map_err(|_| {
            ExperimentError::internal("failed to remove events from queue")
        })?;
        self.searcher.record(&ops);
        self.process_operations(ops, None).await;
        Ok(())
    }

    /// Validated transition plus its side effects: telemetry, webhook,
    /// bounded state fan-out to trials, persistence. Returns false only when
    /// the transition was illegal.
    async fn update_state(&mut self, state: StateWithReason) -> bool {
        match self.model.transition(state.state) {
            Err(e) => {
                error!(error = %e, "error transitioning experiment state");
                return false;
            }
            Ok(false) => return true,
            Ok(true) => {}
        }
        // Publish before any reply can be sent so observers never see the
        // acknowledgment ahead of the state it acknowledges.
        self.publish_state();
        self.deps.telemetry.report_experiment_state_changed(&self.model);
        if let Err(e) = self
            .deps
            .webhooks
            .report_experiment_state_changed(&self.model, &self.active_config)
            .await
        {
            error!(error = %e, "failed to send experiment state change webhook");
        }
        self.searcher.record_state_change(self.model.state);
        info!(
            state = %self.model.state,
            reason = %state.informational_reason,
            "experiment state changed"
        );

        let targets = self.trials.all();
        let patch = state;
        stream::iter(targets)
            .for_each_concurrent(MAX_CONCURRENT_TRIAL_OPS, |(request_id, trial)| {
                let patch = patch.clone();
                async move {
                    if let Err(e) = trial.patch_state(patch).await {
                        error!(request_id = %request_id, error = %e, "patching trial state");
                    }
                }
            })
            .await;

        if let Err(e) = self.deps.store.save_experiment_state(&self.model).await {
            error!(error = %e, "error saving experiment state");
        }
        true
    }

    fn can_terminate(&self) -> bool {
        self.model.state.is_stopping() && self.trials.is_empty()
    }

    async fn snapshot_and_save(&mut self) {
        if !self.fault_tolerance_enabled {
            return;
        }
        match self.snapshot() {
            Ok(blob) => {
                if let Err(e) = self.deps.store.save_snapshot(self.model.id, blob).await {
                    error!(error = %e, "failed to persist experiment snapshot");
                }
            }
            Err(e) => error!(error = %e, "failed to snapshot experiment"),
        }
    }

    async fn save_config(&self) -> Result<()> {
        self.deps
            .store
            .save_experiment_config(self.model.id, &self.active_config)
            .await
    }

    /// Best-effort re-persist of a rolled-back config; its own failure is
    /// only logged.
    async fn resave_rolled_back_config(&self) {
        if let Err(e) = self.save_config().await {
            debug!(error = %e, "failed to re-persist configuration during rollback");
        }
    }

    async fn set_priority(&mut self, priority: Option<i32>, forward: bool) -> Result<()> {
        let Some(priority) = priority else {
            return Ok(());
        };
        let old = self.active_config.resources.priority;
        self.active_config.resources.priority = Some(priority);

        if let Err(e) = self.save_config().await {
            self.active_config.resources.priority = old;
            self.resave_rolled_back_config().await;
            return Err(ExperimentError::internal(format!(
                "setting experiment {} priority: {e}",
                self.model.id
            )));
        }

        if forward {
            match self
                .deps
                .rm
                .set_group_priority(&self.model.job_id, priority)
                .await
            {
                Ok(()) => {}
                Err(RmError::Unsupported(reason)) => {
                    debug!(reason, "ignoring unsupported call to set group priority");
                }
                Err(e) => {
                    self.active_config.resources.priority = old;
                    self.resave_rolled_back_config().await;
                    return Err(ExperimentError::internal(format!(
                        "setting experiment {} priority: {e}",
                        self.model.id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn set_weight(&mut self, weight: f64) -> Result<()> {
        let old = self.active_config.resources.weight;
        self.active_config.resources.weight = weight;

        if let Err(e) = self.save_config().await {
            self.active_config.resources.weight = old;
            self.resave_rolled_back_config().await;
            return Err(ExperimentError::internal(format!(
                "setting experiment {} weight: {e}",
                self.model.id
            )));
        }

        match self
            .deps
            .rm
            .set_group_weight(&self.model.job_id, weight)
            .await
        {
            Ok(()) => Ok(()),
            Err(RmError::Unsupported(reason)) => {
                debug!(reason, "ignoring unsupported call to set group weight");
                Ok(())
            }
            Err(e) => {
                self.active_config.resources.weight = old;
                self.resave_rolled_back_config().await;
                Err(ExperimentError::internal(format!(
                    "setting experiment {} weight: {e}",
                    self.model.id
                )))
            }
        }
    }

    async fn set_resource_pool(&mut self, pool: &str) -> Result<()> {
        let old = self.active_config.resources.resource_pool.clone();
        let resolved = self
            .deps
            .rm
            .resolve_resource_pool(
                pool,
                self.model.workspace_id,
                self.active_config.resources.slots_per_trial,
            )
            .await
            .map_err(|_| {
                ExperimentError::validation(format!("invalid resource pool name {pool}"))
            })?;
        if old == resolved {
            return Err(ExperimentError::validation(format!(
                "resource pool is unchanged ({old} == {resolved})"
            )));
        }

        self.active_config.resources.resource_pool = resolved.clone();
        if let Err(e) = self.save_config().await {
            self.active_config.resources.resource_pool = old;
            self.resave_rolled_back_config().await;
            return Err(ExperimentError::internal(format!(
                "setting experiment {} resource pool to {resolved}: {e}",
                self.model.id
            )));
        }

        let targets = self.trials.all();
        let resolved = Arc::new(resolved);
        stream::iter(targets)
            .for_each_concurrent(MAX_CONCURRENT_TRIAL_OPS, |(request_id, trial)| {
                let resolved = resolved.clone();
                async move {
                    if let Err(e) = trial.patch_resource_pool(resolved.as_str()).await {
                        error!(request_id = %request_id, error = %e, "patching trial resource pool");
                    }
                }
            })
            .await;
        Ok(())
    }

    fn job_record(&self) -> JobRecord {
        let resources = &self.active_config.resources;
        JobRecord {
            job_id: self.model.job_id.clone(),
            entity_id: self.model.id.to_string(),
            submission_time: self.model.start_time,
            username: self.model.username.clone(),
            user_id: self.model.owner_id,
            progress: self.searcher.progress(),
            name: self.active_config.name.clone(),
            workspace_id: self.model.workspace_id,
            resource_pool: resources.resource_pool.clone(),
            priority: resources.priority.unwrap_or(DEFAULT_SCHEDULING_PRIORITY),
            weight: resources.weight,
            is_preemptible: false,
        }
    }
}

/// Resolve a checkpoint from a trial id or a checkpoint uuid, whichever is
/// present. Both absent means no warm start.
pub async fn checkpoint_from_trial_id_or_uuid(
    store: &dyn ExperimentStore,
    trial_id: Option<TrialId>,
    checkpoint_uuid: Option<Uuid>,
) -> Result<Option<Checkpoint>> {
    if let Some(trial_id) = trial_id {
        let checkpoint = store
            .latest_checkpoint_for_trial(trial_id)
            .await
            .map_err(|e| {
                ExperimentError::internal(format!(
                    "failed to get checkpoint for source trial {trial_id}: {e}"
                ))
            })?;
        return match checkpoint {
            Some(checkpoint) => Ok(Some(checkpoint)),
            None => Err(ExperimentError::not_found(format!(
                "no checkpoint found for source trial {trial_id}"
            ))),
        };
    }
    if let Some(uuid) = checkpoint_uuid {
        let checkpoint = store.checkpoint_by_uuid(uuid).await.map_err(|e| {
            ExperimentError::internal(format!("failed to get source checkpoint {uuid}: {e}"))
        })?;
        return match checkpoint {
            Some(checkpoint) => Ok(Some(checkpoint)),
            None => Err(ExperimentError::not_found(format!(
                "no checkpoint found with UUID {uuid}"
            ))),
        };
    }
    Ok(None)
}
