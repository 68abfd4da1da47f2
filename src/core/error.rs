use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MembankError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Path error: {0}")]
    PathError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Corrupted {what}: {reason}")]
    Corrupted { what: String, reason: String },
    #[error("Invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("Gate violation on '{id}' ({from} -> {to}): {}", .unmet.join(", "))]
    GateViolation {
        id: String,
        from: String,
        to: String,
        unmet: Vec<String>,
    },
    #[error("Conflict on '{id}': expected version {expected}, stored version {actual}")]
    Conflict { id: String, expected: u64, actual: u64 },
    #[error("Dependency cycle between segments: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Result codes surfaced across the operation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Success,
    NotFound,
    Corrupted,
    Invalid,
    GateViolation,
    Conflict,
    CycleError,
    Internal,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::NotFound => "NOT_FOUND",
            ResultCode::Corrupted => "CORRUPTED",
            ResultCode::Invalid => "INVALID",
            ResultCode::GateViolation => "GATE_VIOLATION",
            ResultCode::Conflict => "CONFLICT",
            ResultCode::CycleError => "CYCLE_ERROR",
            ResultCode::Internal => "INTERNAL",
        }
    }
}

impl MembankError {
    pub fn code(&self) -> ResultCode {
        match self {
            MembankError::NotFound(_) => ResultCode::NotFound,
            MembankError::Corrupted { .. } => ResultCode::Corrupted,
            MembankError::Invalid(_) | MembankError::ValidationError(_) => ResultCode::Invalid,
            MembankError::GateViolation { .. } => ResultCode::GateViolation,
            MembankError::Conflict { .. } => ResultCode::Conflict,
            MembankError::Cycle(_) => ResultCode::CycleError,
            MembankError::RusqliteError(_)
            | MembankError::IoError(_)
            | MembankError::JsonError(_)
            | MembankError::PathError(_)
            | MembankError::ConfigError(_) => ResultCode::Internal,
        }
    }

    /// Structured payload for the RPC error envelope.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            MembankError::Invalid(reasons) => Some(serde_json::json!({ "reasons": reasons })),
            MembankError::GateViolation {
                id,
                from,
                to,
                unmet,
            } => Some(serde_json::json!({
                "id": id,
                "from": from,
                "to": to,
                "unmet": unmet,
            })),
            MembankError::Conflict {
                id,
                expected,
                actual,
            } => Some(serde_json::json!({
                "id": id,
                "expected_version": expected,
                "stored_version": actual,
            })),
            MembankError::Cycle(ids) => Some(serde_json::json!({ "segment_ids": ids })),
            MembankError::Corrupted { what, reason } => {
                Some(serde_json::json!({ "what": what, "reason": reason }))
            }
            _ => None,
        }
    }

    pub fn corrupted(what: impl Into<String>, reason: impl Into<String>) -> Self {
        MembankError::Corrupted {
            what: what.into(),
            reason: reason.into(),
        }
    }
}
