use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::model::RequestId;

/// Warm-start reference carried by a `Create`: the new trial should start
/// from the latest checkpoint of the named trial, overriding the
/// experiment-wide warm-start checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSourceCheckpoint {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Create {
    pub request_id: RequestId,
    pub hparams: BTreeMap<String, Value>,
    pub checkpoint: Option<TrialSourceCheckpoint>,
}

impl Create {
    pub fn new(request_id: RequestId, hparams: BTreeMap<String, Value>) -> Self {
        Self {
            request_id,
            hparams,
            checkpoint: None,
        }
    }
}

/// "Train this trial until cumulative length, then validate."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateAfter {
    pub request_id: RequestId,
    pub length: u64,
}

/// A directive from the searcher. This set is closed: every operation the
/// coordinator can act on, whether produced by a built-in search method or
/// decoded from an external searcher process, is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Create(Create),
    ValidateAfter(ValidateAfter),
    Close { request_id: RequestId },
    SetSearcherProgress { progress: f64 },
    Shutdown { failure: bool, cancel: bool },
}

/// Decode a batch of external searcher-operation payloads into the closed
/// variant set.
///
/// The wire shape mirrors the RPC union: each payload is an object with
/// exactly one of the keys `create_trial`, `trial_operation` (wrapping
/// `validate_after`), `close_trial`, `set_searcher_progress` or `shut_down`.
/// Unknown or malformed entries are logged and skipped; a bad entry never
/// fails the batch.
pub fn decode_operations(payloads: &[Value]) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(payloads.len());
    for payload in payloads {
        match decode_operation(payload) {
            Ok(Some(op)) => ops.push(op),
            Ok(None) => error!(payload = %payload, "unimplemented searcher operation"),
            Err(reason) => error!(payload = %payload, reason, "invalid searcher operation"),
        }
    }
    ops
}

fn decode_operation(payload: &Value) -> Result<Option<Operation>, &'static str> {
    let obj = payload.as_object().ok_or("operation is not an object")?;

    if let Some(create) = obj.get("create_trial") {
        let request_id = match create.get("request_id") {
            Some(v) => parse_request_id(v)?,
            None => RequestId::new(),
        };
        let hparams = match create.get("hyperparams") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Some(_) => return Err("hyperparams is not an object"),
            None => BTreeMap::new(),
        };
        let checkpoint = match create.get("checkpoint") {
            Some(ckpt) => Some(TrialSourceCheckpoint {
                request_id: parse_request_id(
                    ckpt.get("request_id").ok_or("checkpoint without request_id")?,
                )?,
            }),
            None => None,
        };
        return Ok(Some(Operation::Create(Create {
            request_id,
            hparams,
            checkpoint,
        })));
    }

    if let Some(trial_op) = obj.get("trial_operation") {
        if let Some(validate) = trial_op.get("validate_after") {
            let request_id = parse_request_id(
                validate
                    .get("request_id")
                    .ok_or("validate_after without request_id")?,
            )?;
            let length = validate
                .get("length")
                .and_then(Value::as_u64)
                .ok_or("validate_after without length")?;
            return Ok(Some(Operation::ValidateAfter(ValidateAfter {
                request_id,
                length,
            })));
        }
        return Ok(None);
    }

    if let Some(close) = obj.get("close_trial") {
        let request_id = parse_request_id(
            close.get("request_id").ok_or("close_trial without request_id")?,
        )?;
        return Ok(Some(Operation::Close { request_id }));
    }

    if let Some(progress) = obj.get("set_searcher_progress") {
        let progress = progress
            .get("progress")
            .and_then(Value::as_f64)
            .ok_or("set_searcher_progress without progress")?;
        return Ok(Some(Operation::SetSearcherProgress { progress }));
    }

    if let Some(shutdown) = obj.get("shut_down") {
        let failure = shutdown
            .get("failure")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let cancel = shutdown
            .get("cancel")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        return Ok(Some(Operation::Shutdown { failure, cancel }));
    }

    Ok(None)
}

fn parse_request_id(v: &Value) -> Result<RequestId, &'static str> {
    let s = v.as_str().ok_or("request_id is not a string")?;
    uuid::Uuid::parse_str(s)
        .map(RequestId)
        .map_err(|_| "request_id is not a valid uuid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_full_batch() {
        let rid = RequestId::new();
        let payloads = vec![
            json!({"create_trial": {"request_id": rid.to_string(), "hyperparams": {"lr": 0.1}}}),
            json!({"trial_operation": {"validate_after": {"request_id": rid.to_string(), "length": 100}}}),
            json!({"close_trial": {"request_id": rid.to_string()}}),
            json!({"set_searcher_progress": {"progress": 0.5}}),
            json!({"shut_down": {"cancel": true}}),
        ];
        let ops = decode_operations(&payloads);
        assert_eq!(ops.len(), 5);
        match &ops[0] {
            Operation::Create(c) => {
                assert_eq!(c.request_id, rid);
                assert_eq!(c.hparams.get("lr"), Some(&json!(0.1)));
            }
            other => panic!("expected create, got {other:?}"),
        }
        assert_eq!(
            ops[1],
            Operation::ValidateAfter(ValidateAfter {
                request_id: rid,
                length: 100
            })
        );
        assert_eq!(ops[2], Operation::Close { request_id: rid });
        assert_eq!(ops[3], Operation::SetSearcherProgress { progress: 0.5 });
        assert_eq!(
            ops[4],
            Operation::Shutdown {
                failure: false,
                cancel: true
            }
        );
    }

    #[test]
    fn test_unknown_variant_is_skipped() {
        let payloads = vec![
            json!({"rename_trial": {"request_id": "x"}}),
            json!({"shut_down": {}}),
        ];
        let ops = decode_operations(&payloads);
        assert_eq!(
            ops,
            vec![Operation::Shutdown {
                failure: false,
                cancel: false
            }]
        );
    }

    #[test]
    fn test_malformed_entry_does_not_fail_batch() {
        let payloads = vec![
            json!({"close_trial": {"request_id": "not-a-uuid"}}),
            json!(42),
            json!({"set_searcher_progress": {"progress": 1.0}}),
        ];
        let ops = decode_operations(&payloads);
        assert_eq!(ops, vec![Operation::SetSearcherProgress { progress: 1.0 }]);
    }

    #[test]
    fn test_create_without_request_id_generates_one() {
        let payloads = vec![json!({"create_trial": {"hyperparams": {}}})];
        let ops = decode_operations(&payloads);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], Operation::Create(_)));
    }
}
