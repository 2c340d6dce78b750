//! Shared types for the autoland queue.
//!
//! Everything here is plain data: store entities, patch/flag records, and
//! the wire format pushed to the downstream pusher. Inbound broker message
//! classification lives in [`messages`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod messages;

pub use messages::{parse_inbound, BugNote, JobRequest, MessageError, ParsedMessage, QueueEvent, RunStage};

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

/// A landing destination. Provisioned out-of-band; read-only to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Unique name, compared case-insensitively (`mozilla-central`, `try`, …).
    pub name: String,
    /// Canonical repository URL for this branch.
    pub repo_url: String,
    /// Maximum concurrent in-flight patchsets on this branch.
    pub threshold: i64,
    /// Whether landings here additionally need an `approval-<branch>` flag.
    pub approval_required: bool,
    /// Opaque group identifier handed to the permission oracle.
    pub permission_group: String,
}

/// The name of the scratch branch used for trial runs.
pub const TRY_BRANCH: &str = "try";

/// The integration branch that trial-only requests are reinterpreted against.
pub const DEFAULT_INTEGRATION_BRANCH: &str = "mozilla-central";

// ---------------------------------------------------------------------------
// Patchset
// ---------------------------------------------------------------------------

/// The unit of work: an ordered group of patches headed for one branch.
///
/// Lifecycle: inserted with `try_run = true`, dispatched to the trial branch,
/// annotated with `revision` on trial-push success, flipped to
/// `try_run = false` on trial-run success, dispatched to the real branch,
/// deleted on any terminal event. A row with `try_run = false` always has a
/// `revision` (the trial populated it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patchset {
    /// Store-assigned identifier.
    pub id: i64,
    pub bug_id: i64,
    /// References [`Branch::name`].
    pub branch: String,
    /// Ordered attachment ids to apply.
    pub patches: Vec<i64>,
    pub try_syntax: Option<String>,
    /// Email of the first patch's author, recorded at ingest.
    pub author: Option<String>,
    /// `true` until the trial run has completed for a non-try branch.
    pub try_run: bool,
    /// Trial revision hash, populated by a successful trial push.
    pub revision: Option<String>,
    /// Timestamp of the last dispatch; `None` means "waiting in queue".
    pub push_time: Option<DateTime<Utc>>,
    pub retries: i64,
    pub created_at: DateTime<Utc>,
}

impl Patchset {
    /// `true` while dispatched and awaiting a terminal event.
    pub fn in_flight(&self) -> bool {
        self.push_time.is_some()
    }
}

/// A patchset as handed to the store for insertion. The store assigns
/// `id`, `created_at`, and zeroes `retries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPatchset {
    pub bug_id: i64,
    pub branch: String,
    pub patches: Vec<i64>,
    pub try_syntax: Option<String>,
    pub author: Option<String>,
    pub try_run: bool,
}

// ---------------------------------------------------------------------------
// Comment
// ---------------------------------------------------------------------------

/// Durable outbox entry for a tracker comment that could not be posted inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub bug: i64,
    pub comment: String,
    /// Failed delivery attempts so far (0..5; dead-lettered at 5).
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComment {
    pub bug: i64,
    pub comment: String,
}

// ---------------------------------------------------------------------------
// Patches, flags, people
// ---------------------------------------------------------------------------

/// A tracker user as resolved through the tracker's user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub email: String,
}

/// Result of a labelled vote on a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagResult {
    #[serde(rename = "+")]
    Granted,
    #[serde(rename = "-")]
    Denied,
    #[serde(rename = "?")]
    Requested,
}

impl FlagResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagResult::Granted => "+",
            FlagResult::Denied => "-",
            FlagResult::Requested => "?",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "+" => Some(FlagResult::Granted),
            "-" => Some(FlagResult::Denied),
            "?" => Some(FlagResult::Requested),
            _ => None,
        }
    }
}

/// The three review flavours; all count equivalently for review policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewKind {
    #[serde(rename = "review")]
    Review,
    #[serde(rename = "superreview")]
    Superreview,
    #[serde(rename = "ui-review")]
    UiReview,
}

impl ReviewKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "review" => Some(ReviewKind::Review),
            "superreview" => Some(ReviewKind::Superreview),
            "ui-review" => Some(ReviewKind::UiReview),
            _ => None,
        }
    }
}

/// One review vote on a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    #[serde(rename = "type")]
    pub kind: ReviewKind,
    pub reviewer: UserRecord,
    pub result: FlagResult,
}

/// One approval vote on a patch. `branch` is the flag name with the
/// `approval-` prefix stripped (e.g. `approval-mozilla-beta` → `mozilla-beta`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    #[serde(rename = "type")]
    pub branch: String,
    pub approver: UserRecord,
    pub result: FlagResult,
}

/// A single patch with its resolved review and approval state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: i64,
    pub author: UserRecord,
    pub reviews: Vec<Review>,
    pub approvals: Vec<Approval>,
}

// ---------------------------------------------------------------------------
// Outbound wire format
// ---------------------------------------------------------------------------

/// The job published to the pusher on a successful dispatch.
///
/// `message_id` is stamped fresh on every publish so the pusher can keep a
/// dedup log; a patchset whose `push_time` persist failed may be re-published
/// and must be discardable downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushJob {
    pub job_type: String,
    pub message_id: Uuid,
    pub bug_id: i64,
    pub branch: String,
    pub branch_url: String,
    pub push_url: String,
    #[serde(with = "intbool")]
    pub try_run: bool,
    pub try_syntax: Option<String>,
    pub patchsetid: i64,
    pub patches: Vec<Patch>,
}

impl PushJob {
    pub const JOB_TYPE: &'static str = "patchset";
}

/// Serialize a bool as the 0/1 integer the pusher-side tooling expects, and
/// accept either form when reading back.
pub mod intbool {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match serde_json::Value::deserialize(d)? {
            serde_json::Value::Bool(b) => Ok(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(D::Error::custom("expected 0 or 1")),
            },
            _ => Err(D::Error::custom("expected bool or 0/1")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reviewer() -> UserRecord {
        UserRecord {
            name: "Rev. Name".to_string(),
            email: "rev@example.org".to_string(),
        }
    }

    #[test]
    fn flag_result_round_trips_symbols() {
        for s in ["+", "-", "?"] {
            let r = FlagResult::parse(s).unwrap();
            assert_eq!(r.as_str(), s);
        }
        assert_eq!(FlagResult::parse("~"), None);
    }

    #[test]
    fn review_serializes_wire_shape() {
        let r = Review {
            kind: ReviewKind::Superreview,
            reviewer: reviewer(),
            result: FlagResult::Granted,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "superreview");
        assert_eq!(v["result"], "+");
        assert_eq!(v["reviewer"]["email"], "rev@example.org");
    }

    #[test]
    fn approval_type_field_is_branch_name() {
        let a = Approval {
            branch: "mozilla-beta".to_string(),
            approver: reviewer(),
            result: FlagResult::Requested,
        };
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["type"], "mozilla-beta");
        assert_eq!(v["result"], "?");
    }

    #[test]
    fn push_job_try_run_serializes_as_int() {
        let job = PushJob {
            job_type: PushJob::JOB_TYPE.to_string(),
            message_id: Uuid::nil(),
            bug_id: 42,
            branch: "mozilla-central".to_string(),
            branch_url: "ssh://hg.example.org/mozilla-central".to_string(),
            push_url: "ssh://hg.example.org/try".to_string(),
            try_run: true,
            try_syntax: Some("-p linux".to_string()),
            patchsetid: 7,
            patches: vec![],
        };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["try_run"], 1);
        assert_eq!(v["job_type"], "patchset");

        let back: PushJob = serde_json::from_value(v).unwrap();
        assert!(back.try_run);
    }

    #[test]
    fn patchset_in_flight_tracks_push_time() {
        let mut ps = Patchset {
            id: 1,
            bug_id: 42,
            branch: "mozilla-central".to_string(),
            patches: vec![10, 11],
            try_syntax: None,
            author: None,
            try_run: true,
            revision: None,
            push_time: None,
            retries: 0,
            created_at: Utc::now(),
        };
        assert!(!ps.in_flight());
        ps.push_time = Some(Utc::now());
        assert!(ps.in_flight());
    }
}
