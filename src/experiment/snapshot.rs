use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::RequestId;
use crate::searcher::{Create, ValidateAfter};

/// The searcher's view of one trial, kept for every trial the searcher has
/// ever created (closed trials included, for the snapshot).
///
/// `complete && closed` is terminal: the searcher will never ask anything
/// of this trial again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSearcherState {
    #[serde(rename = "Create")]
    pub create: Create,
    #[serde(rename = "Op")]
    pub op: Option<ValidateAfter>,
    #[serde(rename = "Complete")]
    pub complete: bool,
    #[serde(rename = "Closed")]
    pub closed: bool,
}

impl TrialSearcherState {
    /// State for a freshly created trial: no op outstanding yet, so the
    /// trial has nothing left to complete.
    pub fn new(create: Create) -> Self {
        Self {
            create,
            op: None,
            complete: true,
            closed: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.complete && self.closed
    }
}

/// The persisted experiment snapshot: the searcher's opaque state next to
/// the coordinator's per-trial map. Restore order is coordinator state
/// first, then the searcher bytes are handed back to the searcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub searcher_state: Value,
    pub trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blob_shape_matches_wire_format() {
        let rid = RequestId::new();
        let mut map = BTreeMap::new();
        map.insert(
            rid,
            TrialSearcherState::new(Create::new(rid, BTreeMap::new())),
        );
        let snapshot = ExperimentSnapshot {
            searcher_state: json!({"method": {}}),
            trial_searcher_state: map,
        };

        let blob = serde_json::to_value(&snapshot).unwrap();
        assert!(blob.get("searcher_state").is_some());
        let trial = &blob["trial_searcher_state"][rid.to_string()];
        assert!(trial.get("Create").is_some());
        assert_eq!(trial["Op"], Value::Null);
        assert_eq!(trial["Complete"], json!(true));
        assert_eq!(trial["Closed"], json!(false));
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let rid = RequestId::new();
        let mut map = BTreeMap::new();
        let mut state = TrialSearcherState::new(Create::new(rid, BTreeMap::new()));
        state.op = Some(ValidateAfter {
            request_id: rid,
            length: 512,
        });
        state.complete = false;
        map.insert(rid, state);
        let snapshot = ExperimentSnapshot {
            searcher_state: json!({"x": 1}),
            trial_searcher_state: map,
        };

        let blob = serde_json::to_value(&snapshot).unwrap();
        let back: ExperimentSnapshot = serde_json::from_value(blob.clone()).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), blob);
        assert_eq!(back.trial_searcher_state[&rid].op.unwrap().length, 512);
    }
}
