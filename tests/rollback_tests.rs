//! Config-mutation contract: snapshot old value, mutate, persist, forward to
//! the RM; roll back and re-persist on failure; `Unsupported` RM answers
//! leave the change standing.

mod test_harness;

use hypersweep::config::ExperimentConfig;
use hypersweep::model::RequestId;
use hypersweep::rm::RmError;
use hypersweep::searcher::Operation;

use test_harness::{create_and_validate, Harness, ScriptedSearch};

#[tokio::test]
async fn test_priority_rolls_back_when_rm_rejects() {
    let h = Harness::new();
    let (script, _calls) = ScriptedSearch::new(Vec::new());
    let experiment = h.build(ExperimentConfig::default(), Box::new(script)).await;
    let id = experiment.id();
    let (handle, _join) = experiment.spawn();

    h.rm.set_priority_error(Some(RmError::Failed("scheduler says no".to_string())));
    let err = handle.set_group_priority(77).await.unwrap_err();
    assert!(err.to_string().contains("scheduler says no"));

    // Persisted config equals the pre-call config.
    let saved = h.store.saved_config(id).unwrap();
    assert_eq!(saved.resources.priority, None);
    // In-memory config rolled back too: the job record shows the default.
    assert_eq!(handle.get_job().await.unwrap().priority, 42);
}

#[tokio::test]
async fn test_priority_unsupported_rm_is_not_an_error() {
    let h = Harness::new();
    let (script, _calls) = ScriptedSearch::new(Vec::new());
    let experiment = h.build(ExperimentConfig::default(), Box::new(script)).await;
    let id = experiment.id();
    let (handle, _join) = experiment.spawn();

    h.rm.set_priority_error(Some(RmError::Unsupported("no priorities here")));
    handle.set_group_priority(55).await.unwrap();

    let saved = h.store.saved_config(id).unwrap();
    assert_eq!(saved.resources.priority, Some(55));
    assert_eq!(handle.get_job().await.unwrap().priority, 55);
}

#[tokio::test]
async fn test_priority_rolls_back_when_persist_fails() {
    let h = Harness::new();
    let (script, _calls) = ScriptedSearch::new(Vec::new());
    let experiment = h.build(ExperimentConfig::default(), Box::new(script)).await;
    let (handle, _join) = experiment.spawn();
    // Let startup's own config pushes land before injecting failures.
    handle.get_job().await.unwrap();

    h.store.fail_config_saves(true);
    let err = handle.set_group_priority(77).await.unwrap_err();
    assert!(err.to_string().contains("priority"));
    h.store.fail_config_saves(false);

    assert_eq!(handle.get_job().await.unwrap().priority, 42);
}

#[tokio::test]
async fn test_rm_notified_priority_change_is_not_forwarded() {
    let h = Harness::new();
    let (script, _calls) = ScriptedSearch::new(Vec::new());
    let experiment = h.build(ExperimentConfig::default(), Box::new(script)).await;
    let id = experiment.id();
    let (handle, _join) = experiment.spawn();
    // Round-trip so startup's own RM calls are all accounted for.
    handle.get_job().await.unwrap();
    let calls_before = h.rm.calls.lock().unwrap().len();

    handle.notify_rm_priority_change(9).await.unwrap();

    // Persisted but never echoed back to the RM.
    assert_eq!(h.store.saved_config(id).unwrap().resources.priority, Some(9));
    assert_eq!(h.rm.calls.lock().unwrap().len(), calls_before);
}

#[tokio::test]
async fn test_weight_rolls_back_when_rm_rejects() {
    let h = Harness::new();
    let (script, _calls) = ScriptedSearch::new(Vec::new());
    let experiment = h.build(ExperimentConfig::default(), Box::new(script)).await;
    let id = experiment.id();
    let (handle, _join) = experiment.spawn();
    // Let startup's own weight push land before injecting the failure.
    handle.get_job().await.unwrap();

    h.rm.set_weight_error(Some(RmError::Failed("weights unsupported today".to_string())));
    handle.set_group_weight(3.5).await.unwrap_err();

    let saved = h.store.saved_config(id).unwrap();
    assert_eq!(saved.resources.weight, 1.0);
    assert_eq!(handle.get_job().await.unwrap().weight, 1.0);
}

#[tokio::test]
async fn test_resource_pool_unchanged_is_rejected_without_persist() {
    let h = Harness::new();
    let mut config = ExperimentConfig::default();
    config.resources.resource_pool = "gpu-pool".to_string();
    let (script, _calls) = ScriptedSearch::new(Vec::new());
    let experiment = h.build(config, Box::new(script)).await;
    let id = experiment.id();
    let (handle, _join) = experiment.spawn();

    let err = handle.set_resource_pool("gpu-pool").await.unwrap_err();
    assert!(err.to_string().contains("unchanged"));
    assert_eq!(
        h.store.saved_config(id).unwrap().resources.resource_pool,
        "gpu-pool"
    );
}

#[tokio::test]
async fn test_resource_pool_change_patches_live_trials() {
    let h = Harness::new();
    let r1 = RequestId::new();
    let (script, _calls) = ScriptedSearch::new(create_and_validate(r1, 100));
    let experiment = h.build(ExperimentConfig::default(), Box::new(script)).await;
    let id = experiment.id();
    let (handle, _join) = experiment.spawn();

    handle.set_resource_pool("gpu-pool").await.unwrap();

    assert_eq!(
        h.store.saved_config(id).unwrap().resources.resource_pool,
        "gpu-pool"
    );
    let record = h.spawner.record_for(r1).unwrap();
    assert_eq!(record.lock().unwrap().rp_patches, vec!["gpu-pool".to_string()]);
}

#[tokio::test]
async fn test_resource_pool_resolve_failure_is_user_error() {
    let h = Harness::new();
    let (script, _calls) = ScriptedSearch::new(Vec::new());
    let experiment = h.build(ExperimentConfig::default(), Box::new(script)).await;
    let (handle, _join) = experiment.spawn();

    h.rm.fail_resolve(true);
    let err = handle.set_resource_pool("tpu-pool").await.unwrap_err();
    assert!(err.to_string().contains("invalid resource pool name tpu-pool"));
}

#[tokio::test]
async fn test_max_slots_patch_forwards_without_persisting() {
    let h = Harness::new();
    let (script, _calls) = ScriptedSearch::new(Vec::new());
    let experiment = h.build(ExperimentConfig::default(), Box::new(script)).await;
    let id = experiment.id();
    let (handle, _join) = experiment.spawn();
    let saved_before = h.store.saved_config(id).unwrap();

    handle.set_group_max_slots(Some(8)).await.unwrap();
    // Round-trip to make sure the patch was handled.
    handle.get_job().await.unwrap();

    // Forwarded to the RM, in-memory only (matches the upstream contract of
    // the max-slots patch path).
    assert!(h
        .rm
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.contains("set_group_max_slots"))
        .count()
        >= 2);
    assert_eq!(
        h.store.saved_config(id).unwrap().resources.max_slots,
        saved_before.resources.max_slots
    );
}

#[tokio::test]
async fn test_shutdown_from_searcher_cancel_flag() {
    let h = Harness::new();
    let (script, _calls) = ScriptedSearch::new(vec![Operation::Shutdown {
        failure: false,
        cancel: true,
    }]);
    let (handle, join) = h.spawn(ExperimentConfig::default(), Box::new(script)).await;
    join.await.unwrap();
    assert_eq!(handle.state(), hypersweep::state::State::Canceled);
}
