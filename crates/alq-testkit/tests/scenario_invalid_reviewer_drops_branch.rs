//! Policy rejections at ingest: a `+` from outside the branch group is
//! INVALID, a lone `?` is PENDING, a `-` is FAIL. Each drops the branch
//! with a descriptive comment and, with no branch left, removes the tag.

use alq_queue::clients::{Attachment, AttachmentFlag};
use alq_queue::ingest;
use alq_schemas::Branch;
use alq_testkit::TestHarness;

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
    h.tracker.add_user("outsider", "Outsider", "outsider@example.org");
    h
}

fn patch_with_review(id: i64, setter: &str, status: &str) -> Attachment {
    Attachment {
        id,
        attacher: "dev".to_string(),
        is_patch: true,
        is_obsolete: false,
        flags: vec![AttachmentFlag {
            name: "review".to_string(),
            setter: setter.to_string(),
            status: status.to_string(),
        }],
    }
}

#[tokio::test]
async fn reviewer_without_permissions_is_invalid() {
    let h = harness();
    h.tracker.set_whiteboard(42, "[autoland-mozilla-central]");
    h.tracker.add_attachment(42, patch_with_review(10, "outsider", "+"));

    ingest::scan(&h.deps()).await;

    assert!(h.store.patchsets().is_empty());
    let posted = h.tracker.posted();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].1.starts_with("Autoland Failure:"));
    assert!(posted[0]
        .1
        .contains("Reviewer doesn't have correct permissions for mozilla-central on patch(es): 10"));
    // No branch survived, so the tag is gone entirely.
    assert_eq!(h.tracker.whiteboard(42).as_deref(), Some(""));
}

#[tokio::test]
async fn pending_review_drops_the_branch() {
    let h = harness();
    h.tracker.set_whiteboard(42, "[autoland-mozilla-central]");
    h.tracker.add_attachment(42, patch_with_review(10, "outsider", "?"));

    ingest::scan(&h.deps()).await;

    assert!(h.store.patchsets().is_empty());
    let posted = h.tracker.posted();
    assert!(posted[0].1.contains("Review not yet given on patch(es): 10"));
}

#[tokio::test]
async fn failed_review_drops_the_branch() {
    let h = harness();
    h.oracle.add_member("scm_level_3", "outsider@example.org");
    h.tracker.set_whiteboard(42, "[autoland-mozilla-central]");
    // A `+` and a `-` on the same patch: the `-` wins.
    h.tracker.add_attachment(
        42,
        Attachment {
            id: 10,
            attacher: "dev".to_string(),
            is_patch: true,
            is_obsolete: false,
            flags: vec![
                AttachmentFlag {
                    name: "review".to_string(),
                    setter: "outsider".to_string(),
                    status: "+".to_string(),
                },
                AttachmentFlag {
                    name: "review".to_string(),
                    setter: "dev".to_string(),
                    status: "-".to_string(),
                },
            ],
        },
    );

    ingest::scan(&h.deps()).await;

    assert!(h.store.patchsets().is_empty());
    let posted = h.tracker.posted();
    assert!(posted[0].1.contains("Review failed on patch(es): 10"));
}

#[tokio::test]
async fn trial_branch_skips_review_entirely() {
    let h = harness();
    h.store.add_branch(Branch {
        name: "try".to_string(),
        repo_url: "ssh://hg.example.org/try".to_string(),
        threshold: 10,
        approval_required: false,
        permission_group: "scm_level_1".to_string(),
    });
    h.tracker.set_whiteboard(42, "[autoland-try]");
    // No review flags at all, still fine for try.
    h.tracker.add_attachment(
        42,
        Attachment {
            id: 10,
            attacher: "dev".to_string(),
            is_patch: true,
            is_obsolete: false,
            flags: vec![],
        },
    );

    ingest::scan(&h.deps()).await;

    let patchsets = h.store.patchsets();
    assert_eq!(patchsets.len(), 1);
    assert_eq!(patchsets[0].branch, "try");
    assert!(patchsets[0].try_run);
}

#[tokio::test]
async fn missing_approval_drops_an_approval_required_branch() {
    let h = harness();
    h.store.add_branch(Branch {
        name: "mozilla-beta".to_string(),
        repo_url: "ssh://hg.example.org/mozilla-beta".to_string(),
        threshold: 10,
        approval_required: true,
        permission_group: "scm_release".to_string(),
    });
    h.oracle.add_member("scm_release", "outsider@example.org");
    h.tracker.set_whiteboard(42, "[autoland-mozilla-beta]");
    // Review passes, but there is no approval-mozilla-beta flag.
    h.tracker.add_attachment(42, patch_with_review(10, "outsider", "+"));

    ingest::scan(&h.deps()).await;

    assert!(h.store.patchsets().is_empty());
    let posted = h.tracker.posted();
    assert!(posted[0]
        .1
        .contains("Approval not yet given for branch mozilla-beta on patch(es): 10"));
}
