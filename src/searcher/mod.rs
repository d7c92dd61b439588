pub mod methods;
pub mod ops;
pub mod queue;

pub use self::ops::{Create, Operation, TrialSourceCheckpoint, ValidateAfter};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExperimentError, Result};
use crate::model::{ExitedReason, RequestId};
use crate::state::State;

use self::queue::{EventWatcher, QueueState, SearcherEventKind, SearcherEventQueue};

/// A pluggable hyperparameter search algorithm.
///
/// Methods are called only from the coordinator loop, so implementations
/// need no internal synchronization. Each entry point may return follow-up
/// operations for the coordinator to process.
pub trait SearchMethod: Send + Sync {
    fn initial_operations(&mut self) -> Result<Vec<Operation>>;

    fn trial_created(&mut self, request_id: RequestId) -> Result<Vec<Operation>>;

    fn validation_completed(
        &mut self,
        request_id: RequestId,
        metric: &Value,
        op: ValidateAfter,
    ) -> Result<Vec<Operation>>;

    fn trial_closed(&mut self, request_id: RequestId) -> Result<Vec<Operation>>;

    fn trial_exited_early(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> Result<Vec<Operation>>;

    /// Aggregate search progress in `[0, 1]` given per-trial partial units.
    fn progress(&self, trial_progress: &BTreeMap<RequestId, f64>) -> f64;

    /// Method-private state for the experiment snapshot.
    fn snapshot(&self) -> Result<Value>;

    fn restore(&mut self, state: &Value) -> Result<()>;

    /// Whether this method is driven by an external searcher process.
    fn is_custom(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Bookkeeping {
    trial_progress: BTreeMap<RequestId, f64>,
    trials_created: BTreeSet<RequestId>,
    trials_closed: BTreeSet<RequestId>,
    custom_progress: Option<f64>,
    recorded_ops: Vec<Operation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SearcherSnapshot {
    method: Value,
    bookkeeping: Bookkeeping,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    events: Option<QueueState>,
}

/// Bookkeeping wrapper around a `SearchMethod`.
///
/// Tracks which trials exist and how far along they are, owns the event
/// queue when the method is custom, and produces the opaque searcher blob
/// stored in the experiment snapshot.
pub struct Searcher {
    method: Box<dyn SearchMethod>,
    bookkeeping: Bookkeeping,
    event_queue: Option<SearcherEventQueue>,
}

impl Searcher {
    pub fn new(method: Box<dyn SearchMethod>) -> Self {
        let event_queue = method.is_custom().then(SearcherEventQueue::new);
        Self {
            method,
            bookkeeping: Bookkeeping::default(),
            event_queue,
        }
    }

    pub fn initial_operations(&mut self) -> Result<Vec<Operation>> {
        if let Some(queue) = &mut self.event_queue {
            queue.enqueue(SearcherEventKind::InitialOperations);
        }
        self.method.initial_operations()
    }

    pub fn trial_is_created(&self, request_id: RequestId) -> bool {
        self.bookkeeping.trials_created.contains(&request_id)
    }

    pub fn trial_created(&mut self, request_id: RequestId) -> Result<Vec<Operation>> {
        self.bookkeeping.trials_created.insert(request_id);
        if let Some(queue) = &mut self.event_queue {
            queue.enqueue(SearcherEventKind::TrialCreated { request_id });
        }
        self.method.trial_created(request_id)
    }

    pub fn validation_completed(
        &mut self,
        request_id: RequestId,
        metric: Value,
        op: ValidateAfter,
    ) -> Result<Vec<Operation>> {
        if let Some(queue) = &mut self.event_queue {
            queue.enqueue(SearcherEventKind::ValidationCompleted {
                request_id,
                metric: metric.clone(),
                validate_after: op.length,
            });
        }
        self.method.validation_completed(request_id, &metric, op)
    }

    pub fn trial_closed(&mut self, request_id: RequestId) -> Result<Vec<Operation>> {
        self.bookkeeping.trials_closed.insert(request_id);
        if let Some(queue) = &mut self.event_queue {
            queue.enqueue(SearcherEventKind::TrialClosed { request_id });
        }
        self.method.trial_closed(request_id)
    }

    pub fn trial_exited_early(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> Result<Vec<Operation>> {
        if let Some(queue) = &mut self.event_queue {
            queue.enqueue(SearcherEventKind::TrialExitedEarly { request_id, reason });
        }
        self.method.trial_exited_early(request_id, reason)
    }

    pub fn set_trial_progress(&mut self, request_id: RequestId, partial_units: f64) {
        self.bookkeeping
            .trial_progress
            .insert(request_id, partial_units);
        if let Some(queue) = &mut self.event_queue {
            queue.enqueue(SearcherEventKind::TrialProgress {
                request_id,
                partial_units,
            });
        }
    }

    /// Aggregate progress: an explicitly reported custom-searcher progress
    /// wins over the method's own estimate.
    pub fn progress(&self) -> f64 {
        match self.bookkeeping.custom_progress {
            Some(p) => p,
            None => self
                .method
                .progress(&self.bookkeeping.trial_progress)
                .clamp(0.0, 1.0),
        }
    }

    pub fn set_custom_searcher_progress(&mut self, progress: f64) -> Result<()> {
        if self.event_queue.is_none() {
            return Err(ExperimentError::validation(
                "search method is not a custom searcher",
            ));
        }
        self.bookkeeping.custom_progress = Some(progress);
        Ok(())
    }

    /// Record operations received from an external searcher process so they
    /// survive in the snapshot.
    pub fn record(&mut self, ops: &[Operation]) {
        self.bookkeeping.recorded_ops.extend_from_slice(ops);
    }

    /// Notify an external searcher process of an experiment state change.
    pub fn record_state_change(&mut self, state: State) {
        if let Some(queue) = &mut self.event_queue {
            queue.enqueue(SearcherEventKind::ExperimentStateChanged { state });
        }
    }

    pub fn event_queue_mut(&mut self) -> Result<&mut SearcherEventQueue> {
        self.event_queue.as_mut().ok_or_else(|| {
            ExperimentError::internal("event queue is only available for custom searchers")
        })
    }

    pub fn watch_events(&mut self) -> Result<EventWatcher> {
        Ok(self.event_queue_mut()?.watch())
    }

    pub fn snapshot(&self) -> Result<Value> {
        let snapshot = SearcherSnapshot {
            method: self.method.snapshot()?,
            bookkeeping: self.bookkeeping.clone(),
            events: self.event_queue.as_ref().map(SearcherEventQueue::save),
        };
        serde_json::to_value(&snapshot)
            .map_err(|e| ExperimentError::internal(format!("failed to snapshot searcher: {e}")))
    }

    pub fn restore(&mut self, state: &Value) -> Result<()> {
        let snapshot: SearcherSnapshot = serde_json::from_value(state.clone())
            .map_err(|e| ExperimentError::internal(format!("failed to restore searcher: {e}")))?;
        self.method.restore(&snapshot.method)?;
        self.bookkeeping = snapshot.bookkeeping;
        if self.event_queue.is_some() {
            self.event_queue = Some(
                snapshot
                    .events
                    .map(SearcherEventQueue::load)
                    .unwrap_or_default(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::methods::new_search_method;
    use super::*;
    use crate::config::SearcherConfig;

    fn single_searcher() -> Searcher {
        let config = SearcherConfig::default();
        Searcher::new(new_search_method(&config, &BTreeMap::new(), 7))
    }

    #[test]
    fn test_trial_created_bookkeeping() {
        let mut s = single_searcher();
        let ops = s.initial_operations().unwrap();
        let rid = match &ops[0] {
            Operation::Create(c) => c.request_id,
            other => panic!("expected create, got {other:?}"),
        };
        assert!(!s.trial_is_created(rid));
        s.trial_created(rid).unwrap();
        assert!(s.trial_is_created(rid));
    }

    #[test]
    fn test_custom_progress_rejected_for_builtin_method() {
        let mut s = single_searcher();
        assert!(s.set_custom_searcher_progress(0.5).is_err());
        assert!(s.event_queue_mut().is_err());
    }

    #[test]
    fn test_snapshot_round_trip_preserves_bookkeeping() {
        let mut s = single_searcher();
        let ops = s.initial_operations().unwrap();
        let rid = match &ops[0] {
            Operation::Create(c) => c.request_id,
            other => panic!("expected create, got {other:?}"),
        };
        s.trial_created(rid).unwrap();
        s.set_trial_progress(rid, 40.0);

        let blob = s.snapshot().unwrap();
        let mut restored = single_searcher();
        restored.restore(&blob).unwrap();
        assert!(restored.trial_is_created(rid));
        assert_eq!(restored.snapshot().unwrap(), blob);
    }
}
