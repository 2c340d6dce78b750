//! Dispatch: pick the next runnable patchset and hand it to the pusher.
//!
//! Queue-to-dispatch latency can be hours, so everything is re-validated
//! against live tracker state first, since reviews and approvals can be
//! retracted. Validation failures are terminal for the patchset (comment,
//! delete); capacity and transient-client conditions release the claim so
//! the next pump iteration retries.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use alq_schemas::{Patch, Patchset, PushJob, TRY_BRANCH};

use crate::comments::post_comment;
use crate::patchset::{assemble, AssembleError};
use crate::policy::{approval_status, join_ids, review_status, Verdict};
use crate::QueueDeps;

/// What became of one claimed patchset.
enum Outcome {
    /// Published; the dispatch timestamp has been persisted.
    Dispatched,
    /// Deleted from the queue (validation failure).
    Closed,
    /// Not dispatched this round; the claim must be released.
    Deferred,
}

/// One dispatch attempt for one patchset claimed via `take_next_patchset`.
///
/// Every exit that neither dispatches nor deletes the row hands the claim
/// back, so a capacity-blocked or transiently-failed patchset returns to
/// the queue with a null `push_time`.
pub async fn handle_patchset(deps: &QueueDeps, routing_key: &str, ps: Patchset) -> Result<()> {
    let id = ps.id;
    match try_dispatch(deps, routing_key, ps).await {
        Ok(Outcome::Dispatched) | Ok(Outcome::Closed) => Ok(()),
        Ok(Outcome::Deferred) => {
            deps.store.release_patchset(id).await?;
            Ok(())
        }
        Err(e) => {
            // Hand the row back before surfacing the error; a stuck claim
            // would park the patchset forever.
            if let Err(release_err) = deps.store.release_patchset(id).await {
                error!(patchset = id, "failed to release claim: {release_err}");
            }
            Err(e)
        }
    }
}

async fn try_dispatch(deps: &QueueDeps, routing_key: &str, mut ps: Patchset) -> Result<Outcome> {
    debug!(patchset = ps.id, branch = %ps.branch, "handling patchset from queue");

    // Re-validate the patch list against the tracker.
    let patches = match assemble(deps.tracker.as_ref(), ps.bug_id, Some(&ps.patches)).await {
        Ok(p) => p,
        Err(AssembleError::Client(e)) => {
            warn!(patchset = ps.id, "tracker unavailable, retrying later: {e}");
            return Ok(Outcome::Deferred);
        }
        Err(e) => {
            info!(patchset = ps.id, "patchset no longer valid, deleting: {e}");
            if let Some(msg) = e.user_message() {
                post_comment(deps.tracker.as_ref(), deps.store.as_ref(), ps.bug_id, &msg).await;
            }
            deps.store.delete_patchset(ps.id).await?;
            return Ok(Outcome::Closed);
        }
    };

    let Some(branch) = deps.store.branch_by_name(&ps.branch).await? else {
        info!(patchset = ps.id, branch = %ps.branch, "branch not in branches table, deleting");
        post_comment(
            deps.tracker.as_ref(),
            deps.store.as_ref(),
            ps.bug_id,
            &format!(
                "Autoland Failure:\nBranch {} is not configured for landing.",
                ps.branch
            ),
        )
        .await;
        deps.store.delete_patchset(ps.id).await?;
        return Ok(Outcome::Closed);
    };

    // Double-check reviews and approvals; state may have moved since ingest.
    if let Some(rejection) = revalidate(deps, &branch, &ps, &patches).await? {
        info!(patchset = ps.id, "validation failed at dispatch: {rejection}");
        post_comment(
            deps.tracker.as_ref(),
            deps.store.as_ref(),
            ps.bug_id,
            &format!("Autoland Failure:\n{rejection}"),
        )
        .await;
        deps.store.delete_patchset(ps.id).await?;
        return Ok(Outcome::Closed);
    }

    // Capacity check against the push target. The count is recomputed from
    // the store every attempt, and the claim already stamped push_time on
    // this row, so the raw count includes the patchset being dispatched;
    // subtract it to compare only genuinely in-flight work.
    let push_url = if ps.try_run {
        let Some(try_branch) = deps.store.branch_by_name(TRY_BRANCH).await? else {
            warn!("trial branch is not configured, cannot dispatch");
            return Ok(Outcome::Deferred);
        };
        let running = deps.store.running_on_branch(TRY_BRANCH, true).await? - 1;
        debug!(running, threshold = try_branch.threshold, "trial branch load");
        if running >= try_branch.threshold {
            info!("too many jobs running on the trial branch right now");
            return Ok(Outcome::Deferred);
        }
        try_branch.repo_url
    } else {
        let running = deps.store.running_on_branch(&ps.branch, false).await? - 1;
        debug!(running, threshold = branch.threshold, branch = %branch.name, "branch load");
        if running >= branch.threshold {
            info!(branch = %branch.name, "too many jobs landing right now");
            return Ok(Outcome::Deferred);
        }
        branch.repo_url.clone()
    };

    let job = PushJob {
        job_type: PushJob::JOB_TYPE.to_string(),
        message_id: Uuid::new_v4(),
        bug_id: ps.bug_id,
        branch: ps.branch.clone(),
        branch_url: branch.repo_url.clone(),
        push_url,
        try_run: ps.try_run,
        try_syntax: ps.try_syntax.clone(),
        patchsetid: ps.id,
        patches,
    };

    if let Err(e) = deps.bus.publish(routing_key, &job).await {
        warn!(patchset = ps.id, "publish failed, retrying later: {e}");
        return Ok(Outcome::Deferred);
    }
    info!(patchset = ps.id, branch = %ps.branch, try_run = ps.try_run, "sent job to pusher");

    ps.push_time = Some(Utc::now());
    deps.store.update_patchset(&ps).await?;
    Ok(Outcome::Dispatched)
}

/// Re-run the review/approval gates. Returns the user-visible failure line,
/// or `None` when the patchset may proceed.
async fn revalidate(
    deps: &QueueDeps,
    branch: &alq_schemas::Branch,
    ps: &Patchset,
    patches: &[Patch],
) -> Result<Option<String>> {
    if !ps.branch.eq_ignore_ascii_case(TRY_BRANCH) {
        match review_status(deps.oracle.as_ref(), patches, &branch.permission_group).await? {
            Verdict::Pass => {}
            Verdict::Fail(ids) => {
                return Ok(Some(format!(
                    "Failed review on patch(es): {}",
                    join_ids(ids.as_deref().unwrap_or_default(), " ")
                )))
            }
            Verdict::Pending(ids) => {
                return Ok(Some(format!(
                    "Missing required review for patch(es): {}",
                    join_ids(&ids, " ")
                )))
            }
            Verdict::Invalid(ids) => {
                return Ok(Some(format!(
                    "Invalid review for patch(es): {}",
                    join_ids(&ids, " ")
                )))
            }
        }
    }

    if branch.approval_required {
        let branch_key = branch.name.to_lowercase();
        match approval_status(
            deps.oracle.as_ref(),
            patches,
            &branch_key,
            &branch.permission_group,
        )
        .await?
        {
            Verdict::Pass => {}
            Verdict::Fail(ids) => {
                return Ok(Some(format!(
                    "Failed approval for branch {} on patch(es): {}",
                    branch.name,
                    join_ids(ids.as_deref().unwrap_or_default(), " ")
                )))
            }
            Verdict::Pending(ids) => {
                return Ok(Some(format!(
                    "Missing required approval for branch {} on patch(es): {}",
                    branch.name,
                    join_ids(&ids, " ")
                )))
            }
            Verdict::Invalid(ids) => {
                return Ok(Some(format!(
                    "Invalid approval for patch(es): {}",
                    join_ids(&ids, " ")
                )))
            }
        }
    }

    Ok(None)
}
