use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hypersweep::config::{
    ExperimentConfig, Hyperparameter, SearcherConfig, SearcherKind,
};
use hypersweep::db::MemStore;
use hypersweep::error::Result;
use hypersweep::experiment::snapshot::TrialSearcherState;
use hypersweep::experiment::{Experiment, ExperimentDeps, ExperimentHandle};
use hypersweep::jobs::LocalJobService;
use hypersweep::model::{ExitedReason, ExperimentModel, JobId, RequestId};
use hypersweep::rm::{LaunchWarning, ResourceManager, RmError};
use hypersweep::state::StateWithReason;
use hypersweep::tasks::{NoopCheckpointGc, TaskSpec};
use hypersweep::telemetry::{LogTelemetry, NoopWebhooks};
use hypersweep::trial::{Trial, TrialContext, TrialSpawner};

#[derive(Parser, Debug)]
#[command(name = "hypersweep")]
#[command(about = "Run a hyperparameter search experiment with simulated trials")]
struct Args {
    /// Search method: "single" or "random"
    #[arg(long, default_value = "random")]
    searcher: String,

    /// Number of trials (random searcher only)
    #[arg(long, default_value = "3")]
    trials: usize,

    /// Training length per trial before validation
    #[arg(long, default_value = "100")]
    length: u64,

    /// Hyperparameter sampling seed
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Resource manager that accepts everything, for local runs.
struct DevResourceManager;

#[async_trait]
impl ResourceManager for DevResourceManager {
    async fn resolve_resource_pool(
        &self,
        name: &str,
        _workspace_id: i32,
        _slots_per_trial: i32,
    ) -> std::result::Result<String, RmError> {
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
        Ok(())
    }

    async fn set_group_priority(
        &self,
        _job_id: &JobId,
        _priority: i32,
    ) -> std::result::Result<(), RmError> {
        Ok(())
    }

    async fn set_group_weight(
        &self,
        _job_id: &JobId,
        _weight: f64,
    ) -> std::result::Result<(), RmError> {
        Ok(())
    }

    async fn recover_job_position(
        &self,
        _job_id: &JobId,
        _position: f64,
        _pool: &str,
    ) -> std::result::Result<(), RmError> {
        Ok(())
    }
}

/// A trial that fakes a training loop: it reports progress, completes its
/// validate-after op with a synthetic metric, and calls back into the
/// experiment when the searcher closes it or the experiment stops.
struct SimTrial {
    request_id: RequestId,
    experiment: ExperimentHandle,
    training: AtomicBool,
    closed_sent: AtomicBool,
}

impl SimTrial {
    fn kick(&self, state: &TrialSearcherState) {
        if let (Some(op), false) = (state.op, state.complete) {
            if !self.training.swap(true, Ordering::SeqCst) {
                let handle = self.experiment.clone();
                let request_id = self.request_id;
                tokio::spawn(async move {
                    for fraction in [0.25, 0.5, 0.75, 1.0] {
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        let units = op.length as f64 * fraction;
                        let _ = handle.trial_report_progress(request_id, units).await;
                    }
                    let metric = json!(1.0 / (1.0 + op.length as f64));
                    if let Err(e) = handle
                        .trial_complete_operation(request_id, op, metric)
                        .await
                    {
                        warn!(request_id = %request_id, error = %e, "validation report rejected");
                    }
                });
            }
        } else if state.closed && state.complete {
            self.send_closed(None);
        }
    }

    fn send_closed(&self, reason: Option<ExitedReason>) {
        if !self.closed_sent.swap(true, Ordering::SeqCst) {
            let handle = self.experiment.clone();
            let request_id = self.request_id;
            tokio::spawn(async move {
                let _ = handle.trial_closed(request_id, reason).await;
            });
        }
    }
}

#[async_trait]
impl Trial for SimTrial {
    async fn patch_searcher_state(&self, state: TrialSearcherState) -> Result<()> {
        self.kick(&state);
        Ok(())
    }

    async fn patch_state(&self, state: StateWithReason) -> Result<()> {
        if state.state.is_stopping() {
            self.send_closed(None);
        }
        Ok(())
    }

    async fn patch_resource_pool(&self, pool: &str) -> Result<()> {
        debug!(request_id = %self.request_id, pool, "trial moved to resource pool");
        Ok(())
    }

    async fn set_user_initiated_early_exit(&self, reason: ExitedReason) -> Result<()> {
        self.send_closed(Some(reason));
        Ok(())
    }
}

struct SimTrialSpawner;

#[async_trait]
impl TrialSpawner for SimTrialSpawner {
    async fn spawn(&self, ctx: TrialContext) -> Result<Arc<dyn Trial>> {
        info!(
            task_id = %ctx.task_id,
            restored = ctx.restored,
            warm_start = ?ctx.warm_start_checkpoint.as_ref().map(|c| c.uuid),
            "launching simulated trial"
        );
        let trial = Arc::new(SimTrial {
            request_id: ctx.request_id(),
            experiment: ctx.experiment.clone(),
            training: AtomicBool::new(false),
            closed_sent: AtomicBool::new(false),
        });
        trial.kick(&ctx.searcher_state);
        Ok(trial)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let kind = match args.searcher.as_str() {
        "single" => SearcherKind::Single,
        "random" => SearcherKind::Random,
        other => return Err(format!("unknown searcher {other}").into()),
    };

    let mut hyperparameters = BTreeMap::new();
    hyperparameters.insert(
        "learning_rate".to_string(),
        Hyperparameter::Log {
            minval: -4.0,
            maxval: -1.0,
            base: 10.0,
        },
    );
    hyperparameters.insert(
        "layers".to_string(),
        Hyperparameter::Int {
            minval: 2,
            maxval: 8,
        },
    );
    hyperparameters.insert(
        "optimizer".to_string(),
        Hyperparameter::Categorical {
            vals: vec![json!("adam"), json!("sgd")],
        },
    );

    let config = ExperimentConfig {
        name: "demo-sweep".to_string(),
        searcher: SearcherConfig {
            kind,
            max_length: args.length,
            max_trials: args.trials,
            ..SearcherConfig::default()
        },
        hyperparameters,
        reproducibility: hypersweep::config::ReproducibilityConfig { seed: args.seed },
        ..ExperimentConfig::default()
    };

    let store = Arc::new(MemStore::new());
    store.add_session("demo-session");
    let deps = ExperimentDeps {
        store: store.clone(),
        rm: Arc::new(DevResourceManager),
        spawner: Arc::new(SimTrialSpawner),
        telemetry: Arc::new(LogTelemetry),
        webhooks: Arc::new(NoopWebhooks),
        jobs: Arc::new(LocalJobService::new()),
        gc: Arc::new(NoopCheckpointGc),
    };

    let model = ExperimentModel::new(1, "demo", 1, 1);
    let task_spec = TaskSpec {
        owner: "demo".to_string(),
        user_session_token: "demo-session".to_string(),
        ..TaskSpec::default()
    };

    let (experiment, launch_warnings) = Experiment::new(deps, model, config, task_spec).await?;
    for warning in &launch_warnings {
        warn!(?warning, "launch warning");
    }
    let experiment_id = experiment.id();

    let (handle, mut join) = experiment.spawn();
    handle.activate().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, killing experiment");
            let _ = handle.kill().await;
            let _ = (&mut join).await;
        }
        _ = &mut join => {}
    }

    info!(
        state = %handle.state(),
        progress = ?store.saved_progress(experiment_id),
        "experiment finished"
    );
    Ok(())
}
