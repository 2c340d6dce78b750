//! Broker event handling: advance patchset lifecycles from asynchronous
//! status messages.
//!
//! Terminal events remove the in-queue whiteboard marker and delete the
//! patchset; receiving the same terminal message twice is a no-op because
//! the second lookup finds nothing. A malformed or unknown message is
//! logged and discarded, never crashing the daemon.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use alq_db::{PatchsetQuery, StoreError};
use alq_schemas::{
    parse_inbound, JobRequest, NewPatchset, Patchset, QueueEvent, RunStage, TRY_BRANCH,
};
use alq_schemas::DEFAULT_INTEGRATION_BRANCH;

use crate::comments::post_comment;
use crate::{tag, QueueDeps};

/// Handle one inbound broker payload.
pub async fn handle_message(deps: &QueueDeps, payload: &Value) {
    info!("received message: {payload}");
    let parsed = parse_inbound(payload);

    // The auxiliary comment is posted no matter what the primary action is.
    if let Some(note) = &parsed.note {
        post_comment(
            deps.tracker.as_ref(),
            deps.store.as_ref(),
            note.bug_id,
            &note.comment,
        )
        .await;
    }

    let event = match parsed.event {
        Ok(ev) => ev,
        Err(e) => {
            error!("discarding broker message: {e}");
            return;
        }
    };

    if let Err(e) = apply_event(deps, event).await {
        // Transient store/tracker trouble; the message is already consumed,
        // so all we can do is surface it.
        error!("event handling failed: {e:#}");
    }
}

async fn apply_event(deps: &QueueDeps, event: QueueEvent) -> Result<()> {
    match event {
        QueueEvent::Job(job) => insert_job(deps, job).await,

        QueueEvent::TryPushSucceeded {
            patchset_id,
            revision,
        } => {
            let Some(mut ps) = deps
                .store
                .find_patchset(&PatchsetQuery::by_id(patchset_id))
                .await?
            else {
                info!(patchset = patchset_id, "no corresponding patchset for trial push");
                return Ok(());
            };
            match revision {
                Some(rev) => {
                    debug!(patchset = ps.id, revision = %rev, "recording trial revision");
                    ps.revision = Some(rev);
                    deps.store.update_patchset(&ps).await?;
                }
                None => warn!(patchset = ps.id, "trial push succeeded without a revision"),
            }
            Ok(())
        }

        QueueEvent::RunSucceeded { stage, revision } => {
            let Some(mut ps) = deps
                .store
                .find_patchset(&PatchsetQuery::by_revision(&revision))
                .await?
            else {
                error!(%revision, "revision not found for run success");
                return Ok(());
            };
            let pending_branch_stage = ps.try_run
                && stage == RunStage::Try
                && !ps.branch.eq_ignore_ascii_case(TRY_BRANCH);
            if pending_branch_stage {
                // The trial is done; clear push_time so the dispatcher picks
                // the patchset up for its branch push.
                ps.try_run = false;
                ps.push_time = None;
                debug!(patchset = ps.id, %revision, "flagged for push to branch");
                deps.store.update_patchset(&ps).await?;
            } else {
                close_patchset(deps, &ps).await?;
            }
            Ok(())
        }

        QueueEvent::BranchPushSucceeded { patchset_id } => {
            match deps
                .store
                .find_patchset(&PatchsetQuery::by_id(patchset_id))
                .await?
            {
                Some(ps) => {
                    debug!(patchset = ps.id, "successful push to branch");
                    close_patchset(deps, &ps).await
                }
                None => {
                    error!(patchset = patchset_id, "no corresponding patchset for branch push");
                    Ok(())
                }
            }
        }

        QueueEvent::RunTimedOut { revision } => {
            match deps
                .store
                .find_patchset(&PatchsetQuery::by_revision(&revision))
                .await?
            {
                Some(ps) => {
                    // The timing component already commented on the bug.
                    debug!(patchset = ps.id, %revision, "run timed out");
                    close_patchset(deps, &ps).await
                }
                None => {
                    error!(%revision, "no corresponding patchset for timed out revision");
                    Ok(())
                }
            }
        }

        QueueEvent::RunFailed { stage: _, revision } => {
            match deps
                .store
                .find_patchset(&PatchsetQuery::by_revision(&revision))
                .await?
            {
                Some(ps) => {
                    debug!(patchset = ps.id, %revision, "run failed");
                    close_patchset(deps, &ps).await
                }
                None => {
                    error!(%revision, "no corresponding patchset for failed revision");
                    Ok(())
                }
            }
        }

        QueueEvent::ApplyFailed { patchset_id } => {
            match deps
                .store
                .find_patchset(&PatchsetQuery::by_id(patchset_id))
                .await?
            {
                Some(ps) => {
                    debug!(patchset = ps.id, "patchset failed to apply");
                    close_patchset(deps, &ps).await
                }
                None => {
                    error!(patchset = patchset_id, "no corresponding patchset for apply failure");
                    Ok(())
                }
            }
        }
    }
}

/// Insert patchsets for a broker-delivered landing request.
async fn insert_job(deps: &QueueDeps, job: JobRequest) -> Result<()> {
    // A request explicitly for the trial branch is reinterpreted as a
    // trial-only flow against the default integration branch.
    let branches = if job.branches == [TRY_BRANCH] {
        vec![DEFAULT_INTEGRATION_BRANCH.to_string()]
    } else {
        job.branches
    };

    for branch in branches {
        let ps = NewPatchset {
            bug_id: job.bug_id,
            branch,
            patches: job.patches.clone(),
            try_syntax: job.try_syntax.clone(),
            author: None,
            try_run: true,
        };
        match deps.store.insert_patchset(&ps).await {
            Ok(id) => info!(bug = job.bug_id, branch = %ps.branch, patchset = id, "queued patchset from broker job"),
            Err(StoreError::Conflict) => {
                info!(bug = job.bug_id, branch = %ps.branch, "job already queued")
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Terminal transition: remove the in-queue marker and delete the row.
/// Marker removal is best-effort; the row must go regardless.
async fn close_patchset(deps: &QueueDeps, ps: &Patchset) -> Result<()> {
    if let Err(e) = deps
        .tracker
        .remove_whiteboard_tag(tag::IN_QUEUE_PATTERN, ps.bug_id)
        .await
    {
        error!(bug = ps.bug_id, "failed to remove in-queue marker: {e}");
    }
    deps.store.delete_patchset(ps.id).await?;
    debug!(patchset = ps.id, "deleted patchset");
    Ok(())
}
