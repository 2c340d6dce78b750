//! Contracts for the external collaborators.
//!
//! This module defines **only** the boundary types and traits. No HTTP, no
//! retries, no serialization beyond what the contracts carry; concrete
//! clients live elsewhere and in-memory fakes satisfy the same traits for
//! tests.
//!
//! Every error here is transient from the queue's perspective: the caller
//! logs and retries on the next tick, never crashes.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use alq_schemas::{PushJob, UserRecord};

// ---------------------------------------------------------------------------
// ClientError
// ---------------------------------------------------------------------------

/// Errors a collaborator client may return.
#[derive(Debug)]
pub enum ClientError {
    /// Network or transport failure.
    Transport(String),
    /// The upstream service returned an application-level error.
    Api(String),
    /// A response payload could not be decoded.
    Decode(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(msg) => write!(f, "transport error: {msg}"),
            ClientError::Api(msg) => write!(f, "api error: {msg}"),
            ClientError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// A bug surfaced by a whiteboard search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugHit {
    pub bug_id: i64,
    pub whiteboard: String,
}

/// One labelled vote as the tracker reports it, unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFlag {
    /// Flag name: `review`, `superreview`, `ui-review`, or `approval-<branch>`.
    pub name: String,
    /// Login of the user who set the flag.
    pub setter: String,
    /// `+`, `-`, or `?`.
    pub status: String,
}

/// A bug attachment as the tracker reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: i64,
    /// Login of the user who attached it.
    pub attacher: String,
    pub is_patch: bool,
    pub is_obsolete: bool,
    pub flags: Vec<AttachmentFlag>,
}

/// The bug tracker, as far as the queue is concerned.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Bugs whose whiteboard matches `pattern` (a regex).
    async fn search_whiteboard(&self, pattern: &str) -> Result<Vec<BugHit>, ClientError>;

    /// All attachments of a bug, in the tracker's natural order.
    async fn bug_attachments(&self, bug_id: i64) -> Result<Vec<Attachment>, ClientError>;

    /// Resolve a login to a user record.
    async fn user_info(&self, login: &str) -> Result<UserRecord, ClientError>;

    /// Post a comment. Implementations perform their own short-horizon
    /// retries; an `Err` here means delivery genuinely failed for now.
    async fn notify_bug(&self, bug_id: i64, comment: &str) -> Result<(), ClientError>;

    /// Delete every whiteboard substring matching `pattern`.
    async fn remove_whiteboard_tag(&self, pattern: &str, bug_id: i64) -> Result<(), ClientError>;

    /// Replace the first whiteboard substring matching `pattern` with
    /// `replacement`.
    async fn replace_whiteboard_tag(
        &self,
        pattern: &str,
        replacement: &str,
        bug_id: i64,
    ) -> Result<(), ClientError>;
}

// ---------------------------------------------------------------------------
// PermissionOracle
// ---------------------------------------------------------------------------

/// Group-membership lookups. Consulted only for principals who have
/// themselves voted `+` on a patch.
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn is_member(&self, email: &str, group: &str) -> Result<bool, ClientError>;
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// The message broker: publish push jobs, poll the queue's own inbox, and
/// (for the purge CLI path) drop everything pending.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, routing_key: &str, job: &PushJob) -> Result<(), ClientError>;

    /// One pending inbound message, or `None` when the queue is empty.
    async fn poll(&self) -> Result<Option<Value>, ClientError>;

    /// Drop all pending messages; returns how many were discarded.
    async fn purge(&self) -> Result<u64, ClientError>;
}
