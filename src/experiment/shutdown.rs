//! Shutdown sequencer: the side effects that run exactly once when the
//! coordinator loop ends. Every step tolerates failure of the ones after it;
//! persistence and webhook errors are logged and swallowed so shutdown
//! always makes forward progress.

use tracing::{error, info};

use crate::error::{ExperimentError, Result};
use crate::state::State;
use crate::tasks::{CheckpointGcRequest, FULL_DELETE_GLOB};

use super::Experiment;

pub(super) async fn run(exp: &mut Experiment) -> Result<()> {
    if matches!(
        exp.model.state,
        State::Completed | State::StoppingCompleted
    ) {
        if let Err(e) = exp
            .deps
            .store
            .save_experiment_progress(exp.model.id, 1.0)
            .await
        {
            error!(error = %e, "failed to save final experiment progress");
        }
    }

    exp.deps.jobs.unregister_job(&exp.model.job_id);

    let Some(terminal) = exp.model.state.stopping_to_terminal() else {
        return Err(ExperimentError::Fatal(format!(
            "experiment in unexpected state {} at shutdown",
            exp.model.state
        )));
    };
    match exp.model.transition(terminal) {
        Err(e) => return Err(ExperimentError::Fatal(e.to_string())),
        Ok(false) => {
            return Err(ExperimentError::Fatal(
                "experiment is already in a terminal state".to_string(),
            ))
        }
        Ok(true) => {}
    }

    exp.deps.telemetry.report_experiment_state_changed(&exp.model);
    if let Err(e) = exp
        .deps
        .webhooks
        .report_experiment_state_changed(&exp.model, &exp.active_config)
        .await
    {
        error!(error = %e, "failed to send experiment state change webhook");
    }
    if let Err(e) = exp.deps.store.save_experiment_state(&exp.model).await {
        error!(error = %e, "failed to save final experiment state");
    }
    info!(state = %exp.model.state, "experiment reached terminal state");

    let retention = &exp.active_config.checkpoint_storage;
    match exp
        .deps
        .store
        .checkpoints_to_gc(
            exp.model.id,
            retention.save_experiment_best,
            retention.save_trial_best,
            retention.save_trial_latest,
        )
        .await
    {
        Ok(checkpoints) if !checkpoints.is_empty() => {
            let request = CheckpointGcRequest {
                task_id: CheckpointGcRequest::task_id_for(exp.model.id),
                job_id: exp.model.job_id.clone(),
                experiment_id: exp.model.id,
                start_time: exp.model.start_time,
                config: exp.active_config.clone(),
                checkpoints,
                delete_globs: vec![FULL_DELETE_GLOB.to_string()],
                task_spec: exp.task_spec.clone(),
            };
            let gc = exp.deps.gc.clone();
            // Detached on purpose: GC outlives the coordinator and has no
            // cancellation path.
            tokio::spawn(async move {
                if let Err(e) = gc.run(request).await {
                    error!(error = %e, "failed to GC experiment checkpoints");
                }
            });
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "failed to query checkpoints for garbage collection"),
    }

    if let Err(e) = exp
        .deps
        .store
        .delete_snapshots_for_experiment(exp.model.id)
        .await
    {
        error!(
            error = %e,
            experiment_id = %exp.model.id,
            "failure to delete snapshots for experiment"
        );
    }

    if let Err(e) = exp
        .deps
        .store
        .delete_session_by_token(&exp.task_spec.user_session_token)
        .await
    {
        error!(
            error = %e,
            experiment_id = %exp.model.id,
            "failure to delete user session for experiment"
        );
    }

    info!(experiment_id = %exp.model.id, "experiment shut down successfully");
    Ok(())
}
