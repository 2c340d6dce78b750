//! Whiteboard ingest: turn flagged bugs into queued patchsets.
//!
//! One scan queries the tracker for `[autoland…]` whiteboards and processes
//! each bug independently; a failure on one bug (or one branch within a
//! bug) never aborts the others. Accepted bugs get their tag rewritten to
//! the in-queue marker; fully rejected bugs get the tag removed so they stop
//! showing up.

use anyhow::Result;
use tracing::{debug, error, info};

use alq_db::StoreError;
use alq_schemas::{Branch, NewPatchset, Patch, TRY_BRANCH};

use crate::clients::{BugHit, ClientError};
use crate::comments::post_comment;
use crate::patchset::{assemble, AssembleError};
use crate::policy::{approval_status, join_ids, review_status, Verdict};
use crate::{tag, QueueDeps};

/// One ingest cycle. Transient tracker errors skip the whole cycle; no
/// partial state is written.
pub async fn scan(deps: &QueueDeps) {
    let bugs = match deps.tracker.search_whiteboard(tag::SEARCH_PATTERN).await {
        Ok(bugs) => bugs,
        Err(e) => {
            error!("error while polling the tracker: {e}");
            return;
        }
    };

    for hit in bugs {
        if let Err(e) = ingest_bug(deps, &hit).await {
            // Transient; the next scan retries this bug.
            error!(bug = hit.bug_id, "ingest failed: {e:#}");
        }
    }
}

async fn ingest_bug(deps: &QueueDeps, hit: &BugHit) -> Result<()> {
    let Some(parsed) = tag::parse_first(&hit.whiteboard) else {
        return Ok(());
    };
    if parsed.in_queue {
        return Ok(());
    }
    if parsed.branches.is_empty() {
        // Skeleton [autoland] tag with no branch attached.
        debug!(bug = hit.bug_id, "no branches in tag, skipping");
        return Ok(());
    }
    debug!(bug = hit.bug_id, "processing tag {parsed}");

    // Drop branch names the store does not know; the job still lands on the
    // correct ones.
    let mut branches: Vec<Branch> = Vec::new();
    for name in &parsed.branches {
        match deps.store.branch_by_name(name).await? {
            Some(b) => branches.push(b),
            None => error!(branch = %name, "branch does not exist"),
        }
    }
    if branches.is_empty() {
        return Ok(());
    }

    let requested: Option<&[i64]> = (!parsed.patches.is_empty()).then_some(&parsed.patches[..]);
    let patches = match assemble(deps.tracker.as_ref(), hit.bug_id, requested).await {
        Ok(p) => p,
        Err(AssembleError::Client(e)) => return Err(e.into()),
        Err(e) => {
            error!(bug = hit.bug_id, "nothing to land, removing from the queue: {e}");
            if let Some(msg) = e.user_message() {
                post_comment(deps.tracker.as_ref(), deps.store.as_ref(), hit.bug_id, &msg).await;
            }
            deps.tracker
                .remove_whiteboard_tag(tag::ANY_TAG_PATTERN, hit.bug_id)
                .await?;
            return Ok(());
        }
    };

    let author = patches[0].author.email.clone();
    let patch_ids: Vec<i64> = patches.iter().map(|p| p.id).collect();

    let mut notes: Vec<String> = Vec::new();
    let mut accepted: Vec<String> = Vec::new();
    for branch in &branches {
        if let Some(rejection) = vet_branch(deps, branch, &patches).await? {
            notes.push(rejection);
            continue;
        }

        let ps = NewPatchset {
            bug_id: hit.bug_id,
            branch: branch.name.clone(),
            patches: patch_ids.clone(),
            try_syntax: parsed.try_syntax.clone(),
            author: Some(author.clone()),
            // Every landing starts with a trial run; the branch push stage
            // is reached only through a trial-run success event.
            try_run: true,
        };
        match deps.store.insert_patchset(&ps).await {
            Ok(id) => {
                info!(bug = hit.bug_id, branch = %branch.name, patchset = id, "queued patchset");
                accepted.push(branch.name.clone());
            }
            Err(StoreError::Conflict) => {
                debug!(bug = hit.bug_id, branch = %branch.name, "duplicate patchset, dropping branch");
                notes.push(format!(
                    "Already landing patches {} on branch {}.",
                    join_ids(&patch_ids, ","),
                    branch.name
                ));
            }
            Err(e) => return Err(e.into()),
        }
    }

    if !notes.is_empty() {
        let header = if accepted.is_empty() {
            "Autoland Failure:".to_string()
        } else {
            format!(
                "Autoland Warning: Only landing on branch(es): {}",
                accepted.join(" ")
            )
        };
        let mut lines = vec![header];
        lines.extend(notes);
        post_comment(
            deps.tracker.as_ref(),
            deps.store.as_ref(),
            hit.bug_id,
            &lines.join("\n\t"),
        )
        .await;
    }

    if accepted.is_empty() {
        deps.tracker
            .remove_whiteboard_tag(tag::ANY_TAG_PATTERN, hit.bug_id)
            .await?;
    } else {
        deps.tracker
            .replace_whiteboard_tag(tag::ANY_TAG_PATTERN, tag::IN_QUEUE_MARKER, hit.bug_id)
            .await?;
    }
    Ok(())
}

/// Check one branch's review/approval requirements. Returns the user-visible
/// rejection line, or `None` when the branch is accepted.
async fn vet_branch(
    deps: &QueueDeps,
    branch: &Branch,
    patches: &[Patch],
) -> Result<Option<String>, ClientError> {
    // Trial-branch iterations run without review: the trial run is the point.
    if !branch.name.eq_ignore_ascii_case(TRY_BRANCH) {
        match review_status(deps.oracle.as_ref(), patches, &branch.permission_group).await? {
            Verdict::Pass => {}
            Verdict::Fail(ids) => {
                return Ok(Some(format!(
                    "Review failed on patch(es): {}",
                    join_ids(ids.as_deref().unwrap_or_default(), " ")
                )))
            }
            Verdict::Pending(ids) => {
                return Ok(Some(format!(
                    "Review not yet given on patch(es): {}",
                    join_ids(&ids, " ")
                )))
            }
            Verdict::Invalid(ids) => {
                return Ok(Some(format!(
                    "Reviewer doesn't have correct permissions for {} on patch(es): {}",
                    branch.name,
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
                    "Approval failed on patch(es): {}",
                    join_ids(ids.as_deref().unwrap_or_default(), " ")
                )))
            }
            Verdict::Pending(ids) => {
                return Ok(Some(format!(
                    "Approval not yet given for branch {} on patch(es): {}",
                    branch.name,
                    join_ids(&ids, " ")
                )))
            }
            Verdict::Invalid(ids) => {
                return Ok(Some(format!(
                    "Approver for branch {} doesn't have correct permissions on patch(es): {}",
                    branch.name,
                    join_ids(&ids, " ")
                )))
            }
        }
    }

    Ok(None)
}
