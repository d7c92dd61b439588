use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{sample_hyperparameters, Hyperparameter, SearcherConfig, SearcherKind};
use crate::error::{ExperimentError, Result};
use crate::model::{ExitedReason, RequestId};

use super::{Create, Operation, SearchMethod, ValidateAfter};

/// Build the search method named by the experiment configuration.
pub fn new_search_method(
    config: &SearcherConfig,
    hyperparameters: &BTreeMap<String, Hyperparameter>,
    seed: u64,
) -> Box<dyn SearchMethod> {
    match config.kind {
        SearcherKind::Single => Box::new(SingleSearch::new(
            config.max_length,
            hyperparameters.clone(),
            seed,
        )),
        SearcherKind::Random => Box::new(RandomSearch::new(
            config.max_trials,
            config.max_length,
            hyperparameters.clone(),
            seed,
        )),
        SearcherKind::Custom => Box::new(CustomSearch),
    }
}

fn triple(request_id: RequestId, hparams: BTreeMap<String, Value>, length: u64) -> Vec<Operation> {
    vec![
        Operation::Create(Create::new(request_id, hparams)),
        Operation::ValidateAfter(ValidateAfter { request_id, length }),
        Operation::Close { request_id },
    ]
}

/// Trains a single trial with one sampled hyperparameter assignment for
/// `max_length` units, then shuts the search down.
pub struct SingleSearch {
    max_length: u64,
    space: BTreeMap<String, Hyperparameter>,
    rng: StdRng,
    request_id: Option<RequestId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SingleState {
    request_id: Option<RequestId>,
}

impl SingleSearch {
    pub fn new(max_length: u64, space: BTreeMap<String, Hyperparameter>, seed: u64) -> Self {
        Self {
            max_length,
            space,
            rng: StdRng::seed_from_u64(seed),
            request_id: None,
        }
    }
}

impl SearchMethod for SingleSearch {
    fn initial_operations(&mut self) -> Result<Vec<Operation>> {
        let request_id = RequestId::new();
        self.request_id = Some(request_id);
        let hparams = sample_hyperparameters(&self.space, &mut self.rng);
        Ok(triple(request_id, hparams, self.max_length))
    }

    fn trial_created(&mut self, _request_id: RequestId) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn validation_completed(
        &mut self,
        _request_id: RequestId,
        _metric: &Value,
        _op: ValidateAfter,
    ) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_closed(&mut self, request_id: RequestId) -> Result<Vec<Operation>> {
        if self.request_id == Some(request_id) {
            return Ok(vec![Operation::Shutdown {
                failure: false,
                cancel: false,
            }]);
        }
        Ok(Vec::new())
    }

    fn trial_exited_early(
        &mut self,
        _request_id: RequestId,
        _reason: ExitedReason,
    ) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn progress(&self, trial_progress: &BTreeMap<RequestId, f64>) -> f64 {
        let Some(request_id) = self.request_id else {
            return 0.0;
        };
        trial_progress
            .get(&request_id)
            .map(|units| units / self.max_length as f64)
            .unwrap_or(0.0)
    }

    fn snapshot(&self) -> Result<Value> {
        serde_json::to_value(SingleState {
            request_id: self.request_id,
        })
        .map_err(|e| ExperimentError::internal(e.to_string()))
    }

    fn restore(&mut self, state: &Value) -> Result<()> {
        let state: SingleState = serde_json::from_value(state.clone())
            .map_err(|e| ExperimentError::internal(e.to_string()))?;
        self.request_id = state.request_id;
        Ok(())
    }
}

/// Runs `max_trials` independently sampled trials and shuts down once all
/// of them have closed.
pub struct RandomSearch {
    max_trials: usize,
    max_length: u64,
    space: BTreeMap<String, Hyperparameter>,
    rng: StdRng,
    created: Vec<RequestId>,
    closed: BTreeSet<RequestId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RandomState {
    created: Vec<RequestId>,
    closed: BTreeSet<RequestId>,
}

impl RandomSearch {
    pub fn new(
        max_trials: usize,
        max_length: u64,
        space: BTreeMap<String, Hyperparameter>,
        seed: u64,
    ) -> Self {
        Self {
            max_trials,
            max_length,
            space,
            rng: StdRng::seed_from_u64(seed),
            created: Vec::new(),
            closed: BTreeSet::new(),
        }
    }
}

impl SearchMethod for RandomSearch {
    fn initial_operations(&mut self) -> Result<Vec<Operation>> {
        let mut ops = Vec::with_capacity(self.max_trials * 3);
        for _ in 0..self.max_trials {
            let request_id = RequestId::new();
            self.created.push(request_id);
            let hparams = sample_hyperparameters(&self.space, &mut self.rng);
            ops.extend(triple(request_id, hparams, self.max_length));
        }
        Ok(ops)
    }

    fn trial_created(&mut self, _request_id: RequestId) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn validation_completed(
        &mut self,
        _request_id: RequestId,
        _metric: &Value,
        _op: ValidateAfter,
    ) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_closed(&mut self, request_id: RequestId) -> Result<Vec<Operation>> {
        self.closed.insert(request_id);
        if self.closed.len() >= self.max_trials {
            return Ok(vec![Operation::Shutdown {
                failure: false,
                cancel: false,
            }]);
        }
        Ok(Vec::new())
    }

    fn trial_exited_early(
        &mut self,
        _request_id: RequestId,
        _reason: ExitedReason,
    ) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn progress(&self, trial_progress: &BTreeMap<RequestId, f64>) -> f64 {
        if self.max_trials == 0 {
            return 0.0;
        }
        let total: f64 = self
            .created
            .iter()
            .map(|rid| {
                if self.closed.contains(rid) {
                    self.max_length as f64
                } else {
                    trial_progress
                        .get(rid)
                        .copied()
                        .unwrap_or(0.0)
                        .min(self.max_length as f64)
                }
            })
            .sum();
        total / (self.max_trials as f64 * self.max_length as f64)
    }

    fn snapshot(&self) -> Result<Value> {
        serde_json::to_value(RandomState {
            created: self.created.clone(),
            closed: self.closed.clone(),
        })
        .map_err(|e| ExperimentError::internal(e.to_string()))
    }

    fn restore(&mut self, state: &Value) -> Result<()> {
        let state: RandomState = serde_json::from_value(state.clone())
            .map_err(|e| ExperimentError::internal(e.to_string()))?;
        self.created = state.created;
        self.closed = state.closed;
        Ok(())
    }
}

/// Driven entirely by an external searcher process: produces no operations
/// itself, every searcher entry point surfaces as an event on the queue.
pub struct CustomSearch;

impl SearchMethod for CustomSearch {
    fn initial_operations(&mut self) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_created(&mut self, _request_id: RequestId) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn validation_completed(
        &mut self,
        _request_id: RequestId,
        _metric: &Value,
        _op: ValidateAfter,
    ) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_closed(&mut self, _request_id: RequestId) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_exited_early(
        &mut self,
        _request_id: RequestId,
        _reason: ExitedReason,
    ) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn progress(&self, _trial_progress: &BTreeMap<RequestId, f64>) -> f64 {
        0.0
    }

    fn snapshot(&self) -> Result<Value> {
        Ok(json!({}))
    }

    fn restore(&mut self, _state: &Value) -> Result<()> {
        Ok(())
    }

    fn is_custom(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_emits_create_validate_close() {
        let mut method = SingleSearch::new(100, BTreeMap::new(), 1);
        let ops = method.initial_operations().unwrap();
        assert_eq!(ops.len(), 3);
        let rid = match &ops[0] {
            Operation::Create(c) => c.request_id,
            other => panic!("expected create, got {other:?}"),
        };
        assert_eq!(
            ops[1],
            Operation::ValidateAfter(ValidateAfter {
                request_id: rid,
                length: 100
            })
        );
        assert_eq!(ops[2], Operation::Close { request_id: rid });
    }

    #[test]
    fn test_single_shuts_down_when_its_trial_closes() {
        let mut method = SingleSearch::new(100, BTreeMap::new(), 1);
        let ops = method.initial_operations().unwrap();
        let rid = match &ops[0] {
            Operation::Create(c) => c.request_id,
            other => panic!("expected create, got {other:?}"),
        };
        assert!(method.trial_closed(RequestId::new()).unwrap().is_empty());
        let shutdown = method.trial_closed(rid).unwrap();
        assert_eq!(
            shutdown,
            vec![Operation::Shutdown {
                failure: false,
                cancel: false
            }]
        );
    }

    #[test]
    fn test_random_shuts_down_after_all_trials_close() {
        let mut method = RandomSearch::new(3, 10, BTreeMap::new(), 1);
        let ops = method.initial_operations().unwrap();
        assert_eq!(ops.len(), 9);
        let rids: Vec<RequestId> = ops
            .iter()
            .filter_map(|op| match op {
                Operation::Create(c) => Some(c.request_id),
                _ => None,
            })
            .collect();
        assert!(method.trial_closed(rids[0]).unwrap().is_empty());
        assert!(method.trial_closed(rids[1]).unwrap().is_empty());
        assert_eq!(
            method.trial_closed(rids[2]).unwrap(),
            vec![Operation::Shutdown {
                failure: false,
                cancel: false
            }]
        );
    }

    #[test]
    fn test_random_progress_counts_closed_trials_as_full() {
        let mut method = RandomSearch::new(2, 10, BTreeMap::new(), 1);
        let ops = method.initial_operations().unwrap();
        let rids: Vec<RequestId> = ops
            .iter()
            .filter_map(|op| match op {
                Operation::Create(c) => Some(c.request_id),
                _ => None,
            })
            .collect();
        let mut progress = BTreeMap::new();
        progress.insert(rids[1], 5.0);
        method.trial_closed(rids[0]).unwrap();
        let p = method.progress(&progress);
        assert!((p - 0.75).abs() < 1e-9, "progress was {p}");
    }
}
