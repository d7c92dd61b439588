use async_trait::async_trait;
use tracing::debug;

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::model::ExperimentModel;

/// Usage telemetry sink. Fire-and-forget; emitters must not block the
/// coordinator for long.
pub trait Telemetry: Send + Sync {
    fn report_experiment_created(&self, model: &ExperimentModel, config: &ExperimentConfig);

    fn report_experiment_state_changed(&self, model: &ExperimentModel);
}

/// External webhook notifications for experiment state changes. Errors are
/// logged by the coordinator and never change experiment state.
#[async_trait]
pub trait Webhooks: Send + Sync {
    async fn report_experiment_state_changed(
        &self,
        model: &ExperimentModel,
        config: &ExperimentConfig,
    ) -> Result<()>;
}

/// Telemetry that just logs at debug level.
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn report_experiment_created(&self, model: &ExperimentModel, config: &ExperimentConfig) {
        debug!(experiment_id = %model.id, name = %config.name, "experiment created");
    }

    fn report_experiment_state_changed(&self, model: &ExperimentModel) {
        debug!(experiment_id = %model.id, state = %model.state, "experiment state changed");
    }
}

/// Webhook sink that drops everything.
pub struct NoopWebhooks;

#[async_trait]
impl Webhooks for NoopWebhooks {
    async fn report_experiment_state_changed(
        &self,
        _model: &ExperimentModel,
        _config: &ExperimentConfig,
    ) -> Result<()> {
        Ok(())
    }
}
