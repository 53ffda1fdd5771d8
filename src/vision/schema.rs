use serde_json::{json, Value};

use super::{Candidate, Identification, OutputSchema};
use crate::error::{truncate, LocateError, Result};

pub const CANDIDATE_COUNT: usize = 3;

/// Strict JSON schema sent with every identification call
pub fn identification_schema() -> OutputSchema {
    let candidate = json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["name", "why", "confidence", "searchQuery"],
        "properties": {
            "name": {"type": "string"},
            "why": {"type": "string"},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "searchQuery": {"type": "string"}
        }
    });

    OutputSchema {
        name: "place_candidates".to_string(),
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["photoContext", "candidates"],
            "properties": {
                "photoContext": {"type": "string"},
                "candidates": {
                    "type": "array",
                    "minItems": CANDIDATE_COUNT,
                    "maxItems": CANDIDATE_COUNT,
                    "items": candidate
                }
            }
        }),
    }
}

fn violation(msg: impl Into<String>) -> LocateError {
    crate::metrics::MODEL_CONTRACT_VIOLATIONS.inc();
    LocateError::ModelContractViolation(msg.into())
}

fn require_str(obj: &serde_json::Map<String, Value>, field: &str, at: &str) -> Result<String> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(violation(format!("{}.{} is not a string", at, field))),
        None => Err(violation(format!("{}.{} is missing", at, field))),
    }
}

fn parse_candidate(index: usize, value: &Value) -> Result<Candidate> {
    let at = format!("candidates[{}]", index);
    let obj = value
        .as_object()
        .ok_or_else(|| violation(format!("{} is not an object", at)))?;

    let confidence = obj
        .get("confidence")
        .ok_or_else(|| violation(format!("{}.confidence is missing", at)))?
        .as_f64()
        .ok_or_else(|| violation(format!("{}.confidence is not a number", at)))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(violation(format!("{}.confidence {} is outside [0,1]", at, confidence)));
    }

    Ok(Candidate {
        name: require_str(obj, "name", &at)?,
        why: require_str(obj, "why", &at)?,
        confidence,
        search_query: require_str(obj, "searchQuery", &at)?,
    })
}

/// Parse and validate a model answer. Nothing is padded, truncated or coerced.
pub fn parse_identification(raw: &str) -> Result<Identification> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(|e| {
        violation(format!("answer is not JSON ({}): {}", e, truncate(raw, 120)))
    })?;
    let obj = value
        .as_object()
        .ok_or_else(|| violation("answer is not a JSON object"))?;

    let photo_context = require_str(obj, "photoContext", "answer")?;
    let candidates = obj
        .get("candidates")
        .and_then(|c| c.as_array())
        .ok_or_else(|| violation("answer.candidates is missing or not an array"))?;
    if candidates.len() != CANDIDATE_COUNT {
        return Err(violation(format!(
            "expected {} candidates, got {}",
            CANDIDATE_COUNT,
            candidates.len()
        )));
    }

    let candidates = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| parse_candidate(i, c))
        .collect::<Result<Vec<_>>>()?;

    Ok(Identification {
        photo_context,
        candidates,
    })
}
