use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::RequestId;
use crate::trial::Trial;

/// Live trials by request id.
///
/// An entry is created only after a trial is successfully constructed and
/// removed when the trial closes; the searcher-state map is a superset of
/// these keys (closed trials keep their searcher state for the snapshot).
#[derive(Default)]
pub struct TrialRegistry {
    trials: BTreeMap<RequestId, Arc<dyn Trial>>,
}

impl TrialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request_id: RequestId, trial: Arc<dyn Trial>) {
        self.trials.insert(request_id, trial);
    }

    pub fn get(&self, request_id: &RequestId) -> Option<Arc<dyn Trial>> {
        self.trials.get(request_id).cloned()
    }

    pub fn remove(&mut self, request_id: &RequestId) -> Option<Arc<dyn Trial>> {
        self.trials.remove(request_id)
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.trials.contains_key(request_id)
    }

    /// Snapshot of all live trials, used for bounded fan-outs.
    pub fn all(&self) -> Vec<(RequestId, Arc<dyn Trial>)> {
        self.trials
            .iter()
            .map(|(rid, t)| (*rid, t.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }
}
