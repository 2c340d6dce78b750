//! The autoland queue core: whiteboard tag parsing, patchset assembly,
//! review/approval policy, ingest, broker event handling, dispatch, and the
//! durable comment outbox, tied together by a single-flow pump runner.
//!
//! The four failure-prone collaborators (tracker, permission oracle, message
//! bus, state store) are explicit dependencies behind traits so every one
//! substitutes with an in-memory fake.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alq_db::QueueStore;

pub mod clients;
pub mod comments;
pub mod dispatch;
pub mod events;
pub mod ingest;
pub mod patchset;
pub mod policy;
pub mod runner;
pub mod tag;

pub use clients::{Attachment, AttachmentFlag, BugHit, ClientError, MessageBus, PermissionOracle, Tracker};
pub use runner::QueueRunner;

/// The collaborators every queue activity runs against.
#[derive(Clone)]
pub struct QueueDeps {
    pub store: Arc<dyn QueueStore>,
    pub tracker: Arc<dyn Tracker>,
    pub oracle: Arc<dyn PermissionOracle>,
    pub bus: Arc<dyn MessageBus>,
}

/// Tunables for the runner loop.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Time between whiteboard scans.
    pub poll_interval: Duration,
    /// Sleep between inner pump iterations.
    pub pump_interval: Duration,
    /// Routing key for outbound push jobs.
    pub routing_key: String,
    /// Where permanently undeliverable comments are recorded.
    pub dead_letter_path: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            pump_interval: Duration::from_secs(5),
            routing_key: "hgpusher".to_string(),
            dead_letter_path: PathBuf::from(comments::DEAD_LETTER_FILE),
        }
    }
}
