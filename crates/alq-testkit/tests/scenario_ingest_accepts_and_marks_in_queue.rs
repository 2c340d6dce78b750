//! Happy-path ingest: a flagged bug with a valid member review is queued
//! for its trial run and the whiteboard tag is rewritten to the canonical
//! in-queue marker. Re-flagging the same work trips the identity invariant
//! and is reported as already-landing.

use alq_queue::clients::{Attachment, AttachmentFlag};
use alq_queue::ingest;
use alq_schemas::Branch;
use alq_testkit::TestHarness;

fn reviewed_patch(id: i64) -> Attachment {
    Attachment {
        id,
        attacher: "dev".to_string(),
        is_patch: true,
        is_obsolete: false,
        flags: vec![AttachmentFlag {
            name: "review".to_string(),
            setter: "rev".to_string(),
            status: "+".to_string(),
        }],
    }
}

fn harness() -> TestHarness {
    let h = TestHarness::new();
    h.store.add_branch(Branch {
        name: "mozilla-central".to_string(),
        repo_url: "ssh://hg.example.org/mozilla-central".to_string(),
        threshold: 10,
        approval_required: false,
        permission_group: "scm_level_3".to_string(),
    });
    h.tracker.add_user("dev", "Dev", "dev@example.org");
    h.tracker.add_user("rev", "Rev", "rev@example.org");
    h.oracle.add_member("scm_level_3", "rev@example.org");
    h
}

#[tokio::test]
async fn accepted_bug_is_queued_and_marked() {
    let h = harness();
    h.tracker.set_whiteboard(42, "[autoland-mozilla-central]");
    h.tracker.add_attachment(42, reviewed_patch(10));
    h.tracker.add_attachment(42, reviewed_patch(11));

    ingest::scan(&h.deps()).await;

    let patchsets = h.store.patchsets();
    assert_eq!(patchsets.len(), 1);
    let ps = &patchsets[0];
    assert_eq!(ps.bug_id, 42);
    assert_eq!(ps.branch, "mozilla-central");
    assert_eq!(ps.patches, vec![10, 11]);
    assert!(ps.try_run);
    assert_eq!(ps.author.as_deref(), Some("dev@example.org"));
    assert!(ps.push_time.is_none());

    assert_eq!(h.tracker.whiteboard(42).as_deref(), Some("[autoland-in-queue]"));
    // A fully accepted bug needs no comment.
    assert!(h.tracker.posted().is_empty());
}

#[tokio::test]
async fn reflagged_duplicate_is_reported_and_tag_removed() {
    let h = harness();
    h.tracker.set_whiteboard(42, "[autoland-mozilla-central]");
    h.tracker.add_attachment(42, reviewed_patch(10));

    ingest::scan(&h.deps()).await;
    assert_eq!(h.store.patchsets().len(), 1);

    // Someone re-adds the tag while the first request is still queued.
    h.tracker.set_whiteboard(42, "[autoland-mozilla-central]");
    ingest::scan(&h.deps()).await;

    // Still exactly one patchset; the duplicate was dropped with a comment
    // and the stray tag removed.
    assert_eq!(h.store.patchsets().len(), 1);
    let posted = h.tracker.posted();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].1.starts_with("Autoland Failure:"));
    assert!(posted[0].1.contains("Already landing patches 10 on branch mozilla-central."));
    assert_eq!(h.tracker.whiteboard(42).as_deref(), Some(""));
}

#[tokio::test]
async fn unknown_branches_are_dropped_but_known_ones_land() {
    let h = harness();
    h.tracker
        .set_whiteboard(42, "[autoland-mozilla-central,no-such-branch]");
    h.tracker.add_attachment(42, reviewed_patch(10));

    ingest::scan(&h.deps()).await;

    // The unknown branch vanishes silently (it never reached policy); the
    // known branch is queued.
    let patchsets = h.store.patchsets();
    assert_eq!(patchsets.len(), 1);
    assert_eq!(patchsets[0].branch, "mozilla-central");
    assert_eq!(h.tracker.whiteboard(42).as_deref(), Some("[autoland-in-queue]"));
}
