use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::TrialId;

/// Priority used when an experiment does not set one explicitly.
pub const DEFAULT_SCHEDULING_PRIORITY: i32 = 42;

/// The active configuration document for an experiment. Deep-copied (cloned)
/// into every trial at creation time so later config patches never leak into
/// running trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub resources: ResourcesConfig,
    pub searcher: SearcherConfig,
    pub hyperparameters: BTreeMap<String, Hyperparameter>,
    pub checkpoint_storage: CheckpointStorageConfig,
    pub reproducibility: ReproducibilityConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "unnamed-experiment".to_string(),
            resources: ResourcesConfig::default(),
            searcher: SearcherConfig::default(),
            hyperparameters: BTreeMap::new(),
            checkpoint_storage: CheckpointStorageConfig::default(),
            reproducibility: ReproducibilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub resource_pool: String,
    pub priority: Option<i32>,
    pub weight: f64,
    pub max_slots: Option<i32>,
    pub slots_per_trial: i32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            resource_pool: "default".to_string(),
            priority: None,
            weight: 1.0,
            max_slots: None,
            slots_per_trial: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearcherKind {
    Single,
    Random,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherConfig {
    pub kind: SearcherKind,
    pub metric: String,
    pub smaller_is_better: bool,
    /// Training length a trial must reach before its validation, in the
    /// unit the trial subsystem counts (batches, epochs, records).
    pub max_length: u64,
    /// Number of trials for searchers that run more than one.
    pub max_trials: usize,
    /// Warm-start source: at most one of these resolves to a checkpoint.
    pub source_trial_id: Option<TrialId>,
    pub source_checkpoint_uuid: Option<Uuid>,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            kind: SearcherKind::Single,
            metric: "validation_loss".to_string(),
            smaller_is_better: true,
            max_length: 100,
            max_trials: 1,
            source_trial_id: None,
            source_checkpoint_uuid: None,
        }
    }
}

/// Checkpoint retention policy consulted at shutdown to decide which
/// checkpoints to garbage collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStorageConfig {
    pub save_experiment_best: u32,
    pub save_trial_best: u32,
    pub save_trial_latest: u32,
}

impl Default for CheckpointStorageConfig {
    fn default() -> Self {
        Self {
            save_experiment_best: 0,
            save_trial_best: 1,
            save_trial_latest: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproducibilityConfig {
    pub seed: u64,
}

impl Default for ReproducibilityConfig {
    fn default() -> Self {
        Self { seed: 0 }
    }
}

/// One dimension of the hyperparameter space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Hyperparameter {
    Const { val: Value },
    Int { minval: i64, maxval: i64 },
    Double { minval: f64, maxval: f64 },
    /// Samples `base^x` for `x` uniform in `[minval, maxval]`; min/max are
    /// exponents.
    Log { minval: f64, maxval: f64, base: f64 },
    Categorical { vals: Vec<Value> },
}

impl Hyperparameter {
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            Hyperparameter::Const { val } => val.clone(),
            Hyperparameter::Int { minval, maxval } => {
                Value::from(rng.gen_range(*minval..=*maxval))
            }
            Hyperparameter::Double { minval, maxval } => {
                Value::from(rng.gen_range(*minval..*maxval))
            }
            Hyperparameter::Log {
                minval,
                maxval,
                base,
            } => Value::from(base.powf(rng.gen_range(*minval..*maxval))),
            Hyperparameter::Categorical { vals } => vals[rng.gen_range(0..vals.len())].clone(),
        }
    }
}

/// Sample a concrete assignment for every dimension of the space.
pub fn sample_hyperparameters<R: Rng>(
    space: &BTreeMap<String, Hyperparameter>,
    rng: &mut R,
) -> BTreeMap<String, Value> {
    space
        .iter()
        .map(|(name, hp)| (name.clone(), hp.sample(rng)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    #[test]
    fn test_int_sample_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let hp = Hyperparameter::Int {
            minval: 2,
            maxval: 5,
        };
        for _ in 0..100 {
            let v = hp.sample(&mut rng).as_i64().unwrap();
            assert!((2..=5).contains(&v));
        }
    }

    #[test]
    fn test_log_sample_uses_exponents() {
        let mut rng = StdRng::seed_from_u64(7);
        let hp = Hyperparameter::Log {
            minval: -4.0,
            maxval: -1.0,
            base: 10.0,
        };
        for _ in 0..100 {
            let v = hp.sample(&mut rng).as_f64().unwrap();
            assert!(v >= 1e-4 && v <= 1e-1);
        }
    }

    #[test]
    fn test_categorical_sample_picks_listed_value() {
        let mut rng = StdRng::seed_from_u64(7);
        let hp = Hyperparameter::Categorical {
            vals: vec![json!("adam"), json!("sgd")],
        };
        let v = hp.sample(&mut rng);
        assert!(v == json!("adam") || v == json!("sgd"));
    }

    #[test]
    fn test_sample_space_is_deterministic_for_seed() {
        let mut space = BTreeMap::new();
        space.insert(
            "lr".to_string(),
            Hyperparameter::Double {
                minval: 0.0,
                maxval: 1.0,
            },
        );
        space.insert(
            "layers".to_string(),
            Hyperparameter::Int {
                minval: 1,
                maxval: 8,
            },
        );
        let a = sample_hyperparameters(&space, &mut StdRng::seed_from_u64(42));
        let b = sample_hyperparameters(&space, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
