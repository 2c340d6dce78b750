//! Per-branch concurrency caps: a branch at its threshold takes no new
//! dispatch, and the blocked patchset keeps a null push_time so the next
//! pump retries it. Capacity frees up as soon as an in-flight row goes away.

use std::path::PathBuf;
use std::time::Duration;

use alq_db::QueueStore;
use alq_queue::clients::{Attachment, AttachmentFlag};
use alq_queue::{QueueRunner, RunnerConfig};
use alq_schemas::{Branch, Patchset};
use alq_testkit::TestHarness;
use chrono::Utc;

fn runner_config(dead_letter: PathBuf) -> RunnerConfig {
    RunnerConfig {
        poll_interval: Duration::from_secs(60),
        pump_interval: Duration::from_millis(1),
        routing_key: "hgpusher".to_string(),
        dead_letter_path: dead_letter,
    }
}

fn in_flight(id: i64, bug_id: i64, branch: &str) -> Patchset {
    Patchset {
        id,
        bug_id,
        branch: branch.to_string(),
        patches: vec![id * 10],
        try_syntax: None,
        author: None,
        try_run: false,
        revision: Some(format!("rev-{id}")),
        push_time: Some(Utc::now()),
        retries: 0,
        created_at: Utc::now(),
    }
}

fn harness() -> TestHarness {
    let h = TestHarness::new();
    h.store.add_branch(Branch {
        name: "release-x".to_string(),
        repo_url: "ssh://hg.example.org/release-x".to_string(),
        threshold: 2,
        approval_required: false,
        permission_group: "scm_release".to_string(),
    });
    h.tracker.add_user("dev", "Dev", "dev@example.org");
    h.tracker.add_user("rev", "Rev", "rev@example.org");
    h.oracle.add_member("scm_release", "rev@example.org");
    h
}

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

#[tokio::test]
async fn saturated_branch_defers_dispatch() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();

    // Two in-flight branch pushes saturate threshold=2.
    h.store.seed_patchset(in_flight(1, 101, "release-x"));
    h.store.seed_patchset(in_flight(2, 102, "release-x"));

    // A third, trial-complete patchset is waiting.
    h.store.seed_patchset(Patchset {
        id: 3,
        bug_id: 103,
        branch: "release-x".to_string(),
        patches: vec![30],
        try_syntax: None,
        author: None,
        try_run: false,
        revision: Some("rev-3".to_string()),
        push_time: None,
        retries: 0,
        created_at: Utc::now(),
    });
    h.tracker.add_attachment(103, reviewed_patch(30));

    let runner = QueueRunner::new(h.deps(), runner_config(dir.path().join("dead.log")));
    runner.pump_once().await;

    assert!(h.bus.published().is_empty(), "no dispatch above threshold");
    let blocked = h
        .store
        .patchsets()
        .into_iter()
        .find(|ps| ps.id == 3)
        .unwrap();
    assert!(blocked.push_time.is_none(), "push_time must stay null");

    // One in-flight patchset terminates; the next pump dispatches.
    h.store.delete_patchset(1).await.unwrap();
    runner.pump_once().await;

    let published = h.bus.published();
    assert_eq!(published.len(), 1);
    let (routing_key, job) = &published[0];
    assert_eq!(routing_key, "hgpusher");
    assert_eq!(job.patchsetid, 3);
    assert!(!job.try_run);
    assert_eq!(job.push_url, "ssh://hg.example.org/release-x");
    assert_eq!(job.branch_url, "ssh://hg.example.org/release-x");

    let dispatched = h
        .store
        .patchsets()
        .into_iter()
        .find(|ps| ps.id == 3)
        .unwrap();
    assert!(dispatched.push_time.is_some());
}

#[tokio::test]
async fn trial_dispatch_counts_against_trial_branch() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    h.store.add_branch(Branch {
        name: "try".to_string(),
        repo_url: "ssh://hg.example.org/try".to_string(),
        threshold: 1,
        approval_required: false,
        permission_group: "scm_level_1".to_string(),
    });

    // One trial run in flight (for an unrelated branch) fills try's slot.
    h.store.seed_patchset(Patchset {
        id: 1,
        bug_id: 201,
        branch: "release-x".to_string(),
        patches: vec![5],
        try_syntax: None,
        author: None,
        try_run: true,
        revision: None,
        push_time: Some(Utc::now()),
        retries: 0,
        created_at: Utc::now(),
    });
    // A fresh trial-stage patchset is waiting.
    h.store.seed_patchset(Patchset {
        id: 2,
        bug_id: 202,
        branch: "release-x".to_string(),
        patches: vec![20],
        try_syntax: Some("-p linux".to_string()),
        author: None,
        try_run: true,
        revision: None,
        push_time: None,
        retries: 0,
        created_at: Utc::now(),
    });
    h.tracker.add_attachment(202, reviewed_patch(20));

    let runner = QueueRunner::new(h.deps(), runner_config(dir.path().join("dead.log")));
    runner.pump_once().await;
    assert!(h.bus.published().is_empty(), "trial branch is saturated");

    h.store.delete_patchset(1).await.unwrap();
    runner.pump_once().await;

    let published = h.bus.published();
    assert_eq!(published.len(), 1);
    let job = &published[0].1;
    assert!(job.try_run);
    assert_eq!(job.push_url, "ssh://hg.example.org/try");
    assert_eq!(job.branch_url, "ssh://hg.example.org/release-x");
    assert_eq!(job.try_syntax.as_deref(), Some("-p linux"));
}
