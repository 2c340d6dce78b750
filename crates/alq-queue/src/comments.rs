//! User-visible comments: inline posting with a durable outbox fallback.
//!
//! Comments are at-least-once: either the tracker accepts them (inline or
//! from the outbox) or, after five failed outbox attempts, they land in the
//! dead-letter file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use tracing::{error, info, warn};

use alq_db::{QueueStore, StoreError};
use alq_schemas::NewComment;

use crate::clients::Tracker;

/// Default dead-letter file, relative to the working directory.
pub const DEAD_LETTER_FILE: &str = "failed_comments.log";

/// How many outbox entries one drain pass handles.
pub const OUTBOX_BATCH: i64 = 5;

/// Delivery attempts before an entry is dead-lettered.
pub const MAX_ATTEMPTS: i64 = 5;

/// Post a comment immediately; enqueue it on failure.
///
/// Never propagates: a comment that can be neither posted nor enqueued is
/// logged and dropped, and must not take the request down with it.
pub async fn post_comment(tracker: &dyn Tracker, store: &dyn QueueStore, bug_id: i64, text: &str) {
    match tracker.notify_bug(bug_id, text).await {
        Ok(()) => info!(bug = bug_id, "posted comment: {text:?}"),
        Err(e) => {
            info!(bug = bug_id, "could not post comment, queueing for retry: {e}");
            let c = NewComment {
                bug: bug_id,
                comment: text.to_string(),
            };
            if let Err(e) = store.comment_enqueue(&c).await {
                error!(bug = bug_id, "failed to enqueue comment: {e}");
            }
        }
    }
}

/// Retry the oldest queued comments.
///
/// Success deletes the entry. Failure bumps `attempts`; at
/// [`MAX_ATTEMPTS`] the entry is recorded in the dead-letter file and
/// dropped.
pub async fn drain_outbox(
    tracker: &dyn Tracker,
    store: &dyn QueueStore,
    dead_letter: &Path,
) -> Result<(), StoreError> {
    let comments = store.comment_take_oldest(OUTBOX_BATCH).await?;
    for mut c in comments {
        match tracker.notify_bug(c.bug, &c.comment).await {
            Ok(()) => {
                store.comment_delete(c.id).await?;
            }
            Err(e) => {
                warn!(bug = c.bug, attempts = c.attempts + 1, "comment retry failed: {e}");
                c.attempts += 1;
                store.comment_update(&c).await?;
                if c.attempts >= MAX_ATTEMPTS {
                    error!(
                        bug = c.bug,
                        "could not post comment, dropping: {:?}", c.comment
                    );
                    dead_letter_append(dead_letter, c.bug, &c.comment);
                    store.comment_delete(c.id).await?;
                }
            }
        }
    }
    Ok(())
}

/// Append one record to the dead-letter file. An unwritable file is logged;
/// there is nowhere further to escalate.
fn dead_letter_append(path: &Path, bug: i64, comment: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{bug}\n\t{comment}"));
    if let Err(e) = result {
        error!("unable to append to dead-letter file {path:?}: {e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
