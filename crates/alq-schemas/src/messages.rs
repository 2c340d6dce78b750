//! Inbound broker message classification.
//!
//! Broker payloads arrive as dynamically-keyed JSON maps. This module is the
//! boundary that turns them into a tagged [`QueueEvent`]; anything it cannot
//! classify is rejected with a [`MessageError`] for the caller to log and
//! discard. The auxiliary `{bug_id, comment}` pair is extracted separately so
//! a comment still gets posted even when the primary action is malformed.

use std::fmt;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Parsed shapes
// ---------------------------------------------------------------------------

/// A landing request received directly over the broker (bypassing ingest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub bug_id: i64,
    /// Normalized to lowercase, elementwise.
    pub branches: Vec<String>,
    pub try_syntax: Option<String>,
    pub patches: Vec<i64>,
}

/// Which CI stage a run-level message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Try,
    Branch,
}

/// Every message kind the queue reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Job(JobRequest),
    /// `SUCCESS / TRY.PUSH`: the trial push landed, optionally with its revision.
    TryPushSucceeded {
        patchset_id: i64,
        revision: Option<String>,
    },
    /// `SUCCESS / TRY.RUN` or `SUCCESS / BRANCH.RUN`, matched by revision.
    RunSucceeded { stage: RunStage, revision: String },
    /// `SUCCESS / BRANCH.PUSH`: terminal success for the patchset.
    BranchPushSucceeded { patchset_id: i64 },
    /// `TIMED_OUT / TRY.RUN`.
    RunTimedOut { revision: String },
    /// `ERROR` or `FAILURE` on `TRY.RUN` / `BRANCH.RUN`.
    RunFailed { stage: RunStage, revision: String },
    /// `ERROR` or `FAILURE` on `PATCHSET.APPLY`.
    ApplyFailed { patchset_id: i64 },
}

/// Auxiliary comment carried by any message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugNote {
    pub bug_id: i64,
    pub comment: String,
}

/// Result of boundary classification: the note (if any) plus the primary
/// event or the reason it was rejected.
#[derive(Debug)]
pub struct ParsedMessage {
    pub note: Option<BugNote>,
    pub event: Result<QueueEvent, MessageError>,
}

// ---------------------------------------------------------------------------
// MessageError
// ---------------------------------------------------------------------------

/// Why an inbound payload could not be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    MissingType,
    UnknownType(String),
    UnknownAction { kind: String, action: String },
    MissingField(&'static str),
    Malformed(String),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::MissingType => write!(f, "message has no type field"),
            MessageError::UnknownType(t) => write!(f, "unknown message type: {t}"),
            MessageError::UnknownAction { kind, action } => {
                write!(f, "unknown action for {kind}: {action}")
            }
            MessageError::MissingField(name) => write!(f, "missing field: {name}"),
            MessageError::Malformed(why) => write!(f, "malformed message: {why}"),
        }
    }
}

impl std::error::Error for MessageError {}

// ---------------------------------------------------------------------------
// Value accessors
// ---------------------------------------------------------------------------

fn v_i64(v: &Value, key: &'static str) -> Result<i64, MessageError> {
    v.get(key)
        .and_then(Value::as_i64)
        .ok_or(MessageError::MissingField(key))
}

fn v_str(v: &Value, key: &'static str) -> Result<String, MessageError> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(MessageError::MissingField(key))
}

fn v_opt_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn v_i64_list(v: &Value, key: &'static str) -> Result<Vec<i64>, MessageError> {
    let arr = v
        .get(key)
        .and_then(Value::as_array)
        .ok_or(MessageError::MissingField(key))?;
    arr.iter()
        .map(|x| {
            x.as_i64()
                .ok_or_else(|| MessageError::Malformed(format!("{key} contains a non-integer")))
        })
        .collect()
}

fn v_str_list(v: &Value, key: &'static str) -> Result<Vec<String>, MessageError> {
    let arr = v
        .get(key)
        .and_then(Value::as_array)
        .ok_or(MessageError::MissingField(key))?;
    arr.iter()
        .map(|x| {
            x.as_str()
                .map(str::to_string)
                .ok_or_else(|| MessageError::Malformed(format!("{key} contains a non-string")))
        })
        .collect()
}

// Accept either a JSON bool or the 0/1 integers the wire historically used.
fn v_bool_like(v: &Value, key: &str) -> Option<bool> {
    match v.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify one inbound payload.
pub fn parse_inbound(payload: &Value) -> ParsedMessage {
    let note = match (
        payload.get("bug_id").and_then(Value::as_i64),
        v_opt_str(payload, "comment"),
    ) {
        (Some(bug_id), Some(comment)) => Some(BugNote { bug_id, comment }),
        _ => None,
    };

    ParsedMessage {
        note,
        event: classify(payload),
    }
}

fn classify(payload: &Value) -> Result<QueueEvent, MessageError> {
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or(MessageError::MissingType)?;

    match kind {
        "JOB" => classify_job(payload),
        "SUCCESS" => {
            let action = v_str(payload, "action")?;
            match action.as_str() {
                "TRY.PUSH" => Ok(QueueEvent::TryPushSucceeded {
                    patchset_id: v_i64(payload, "patchsetid")?,
                    revision: v_opt_str(payload, "revision"),
                }),
                "TRY.RUN" => Ok(QueueEvent::RunSucceeded {
                    stage: RunStage::Try,
                    revision: v_str(payload, "revision")?,
                }),
                "BRANCH.RUN" => Ok(QueueEvent::RunSucceeded {
                    stage: RunStage::Branch,
                    revision: v_str(payload, "revision")?,
                }),
                "BRANCH.PUSH" => Ok(QueueEvent::BranchPushSucceeded {
                    patchset_id: v_i64(payload, "patchsetid")?,
                }),
                _ => Err(MessageError::UnknownAction {
                    kind: kind.to_string(),
                    action,
                }),
            }
        }
        "TIMED_OUT" => {
            let action = v_str(payload, "action")?;
            if action == "TRY.RUN" {
                Ok(QueueEvent::RunTimedOut {
                    revision: v_str(payload, "revision")?,
                })
            } else {
                Err(MessageError::UnknownAction {
                    kind: kind.to_string(),
                    action,
                })
            }
        }
        "ERROR" | "FAILURE" => {
            let action = v_str(payload, "action")?;
            match action.as_str() {
                "TRY.RUN" => Ok(QueueEvent::RunFailed {
                    stage: RunStage::Try,
                    revision: v_str(payload, "revision")?,
                }),
                "BRANCH.RUN" => Ok(QueueEvent::RunFailed {
                    stage: RunStage::Branch,
                    revision: v_str(payload, "revision")?,
                }),
                "PATCHSET.APPLY" => Ok(QueueEvent::ApplyFailed {
                    patchset_id: v_i64(payload, "patchsetid")?,
                }),
                _ => Err(MessageError::UnknownAction {
                    kind: kind.to_string(),
                    action,
                }),
            }
        }
        other => Err(MessageError::UnknownType(other.to_string())),
    }
}

fn classify_job(payload: &Value) -> Result<QueueEvent, MessageError> {
    let bug_id = v_i64(payload, "bug_id")?;
    let branches: Vec<String> = v_str_list(payload, "branches")?
        .into_iter()
        .map(|b| b.trim().to_lowercase())
        .collect();
    let patches = v_i64_list(payload, "patches")?;

    // A request that explicitly opts out of the trial stage has no queue
    // entry point; everything starts with a trial run.
    if v_bool_like(payload, "try_run") == Some(false) {
        return Err(MessageError::Malformed(
            "JOB with try_run=0 has nothing to queue".to_string(),
        ));
    }

    Ok(QueueEvent::Job(JobRequest {
        bug_id,
        branches,
        try_syntax: v_opt_str(payload, "try_syntax"),
        patches,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
