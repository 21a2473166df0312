//! Versioned result schema for the process boundary
//!
//! A worker process prints exactly one JSON envelope on stdout. The parent
//! refuses anything that is not this schema instead of guessing.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::rules::{EvidenceValue, ValidationResult};

pub const SCHEMA: &str = "ruleguard.result/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub schema: String,
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ValidationResult>,
    /// Predicate error message, when the rule failed to evaluate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a worker reported
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Result(ValidationResult),
    Error(String),
}

/// Reduce evidence that only implements `Debug` to its string form
pub fn sanitize(mut result: ValidationResult) -> ValidationResult {
    for value in result.evidence.values_mut() {
        if value.is_opaque() {
            *value = EvidenceValue::Json(value.to_json());
        }
    }
    result
}

pub fn encode_result(result: ValidationResult) -> Result<String> {
    let envelope = ResultEnvelope {
        schema: SCHEMA.to_string(),
        rule_id: result.rule_id.clone(),
        result: Some(sanitize(result)),
        error: None,
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub fn encode_error(rule_id: &str, error: &anyhow::Error) -> Result<String> {
    let envelope = ResultEnvelope {
        schema: SCHEMA.to_string(),
        rule_id: rule_id.to_string(),
        result: None,
        error: Some(format!("{error:#}")),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse worker stdout. The envelope is the last non-empty line, so stray
/// output printed before it is tolerated.
pub fn decode(stdout: &str, expected_rule: &str) -> Result<Payload> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("worker produced no output"))?;
    let envelope: ResultEnvelope =
        serde_json::from_str(line.trim()).map_err(|e| anyhow!("unreadable worker output: {e}"))?;

    if envelope.schema != SCHEMA {
        bail!("unsupported result schema '{}' (expected {SCHEMA})", envelope.schema);
    }
    if envelope.rule_id != expected_rule {
        bail!("worker answered for '{}' instead of '{expected_rule}'", envelope.rule_id);
    }
    match (envelope.result, envelope.error) {
        (Some(result), _) => Ok(Payload::Result(result)),
        (None, Some(error)) => Ok(Payload::Error(error)),
        (None, None) => bail!("worker envelope carries neither a result nor an error"),
    }
}
