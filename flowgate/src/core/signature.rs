//! Canonical JSON encoding and SHA-256 fingerprints.
//!
//! Call signatures must be reproducible by any implementation, so the encoding
//! is fixed: object keys sorted lexicographically by code point, compact
//! separators (`,` and `:`), UTF-8 output with no escaping beyond what JSON
//! requires.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// Encode a JSON value canonically (sorted keys, compact separators).
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Lowercase hex SHA-256 of the given bytes.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// Fingerprint a step attempt's intent.
///
/// The digest covers exactly six fields; two attempts with the same goal,
/// step, worker, key inputs, strategy and retrieval stage share a signature.
pub fn compute_call_signature(
    goal: &str,
    step_id: &str,
    worker_type: &str,
    key_inputs: &Value,
    strategy_id: &str,
    retrieval_stage: u32,
) -> String {
    let payload = json!({
        "goal": goal,
        "step_id": step_id,
        "worker_type": worker_type,
        "key_inputs": key_inputs,
        "strategy_id": strategy_id,
        "retrieval_stage": retrieval_stage,
    });
    sha256_hex(canonical_json(&payload))
}
