//! Review and approval policy.
//!
//! A patchset is classified per patch and aggregated with precedence
//! FAIL > INVALID > PENDING > PASS: one bad patch poisons the set. The
//! permission oracle is consulted only for principals who have themselves
//! voted `+`; we never reveal group membership of anyone who hasn't voted.

use tracing::debug;

use alq_schemas::{FlagResult, Patch};

use crate::clients::{ClientError, PermissionOracle};

/// Aggregated policy outcome. Failing outcomes carry the offending patch
/// ids; `Fail(None)` is the empty-patchset case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every patch has at least one `+` from a group member and no `-`.
    Pass,
    /// At least one patch carries a `-` (from anyone).
    Fail(Option<Vec<i64>>),
    /// At least one patch's only `+` votes came from outside the group.
    Invalid(Vec<i64>),
    /// At least one patch has only `?` votes, or no relevant votes at all.
    Pending(Vec<i64>),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Render a patch id list for user-visible comments.
pub fn join_ids(ids: &[i64], sep: &str) -> String {
    ids.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

struct Vote<'a> {
    email: &'a str,
    result: FlagResult,
}

#[derive(Default)]
struct FlagScan {
    member_plus: bool,
    nonmember_plus: bool,
    minus: bool,
}

#[derive(Default)]
struct Aggregate {
    failed: Vec<i64>,
    invalid: Vec<i64>,
    pending: Vec<i64>,
}

impl Aggregate {
    fn add(&mut self, patch_id: i64, scan: FlagScan) {
        if scan.minus {
            self.failed.push(patch_id);
        }
        if !scan.member_plus {
            if scan.nonmember_plus {
                self.invalid.push(patch_id);
            } else {
                self.pending.push(patch_id);
            }
        }
    }

    fn verdict(self) -> Verdict {
        if !self.failed.is_empty() {
            Verdict::Fail(Some(self.failed))
        } else if !self.invalid.is_empty() {
            Verdict::Invalid(self.invalid)
        } else if !self.pending.is_empty() {
            Verdict::Pending(self.pending)
        } else {
            Verdict::Pass
        }
    }
}

async fn scan_votes(
    oracle: &dyn PermissionOracle,
    votes: &[Vote<'_>],
    group: &str,
) -> Result<FlagScan, ClientError> {
    let mut scan = FlagScan::default();
    for v in votes {
        match v.result {
            FlagResult::Granted => {
                if oracle.is_member(v.email, group).await? {
                    debug!(email = v.email, group, "voter has valid permissions");
                    scan.member_plus = true;
                } else {
                    scan.nonmember_plus = true;
                }
            }
            FlagResult::Denied => scan.minus = true,
            FlagResult::Requested => {}
        }
    }
    Ok(scan)
}

/// Review status of a patchset. All three review flavours count equivalently.
pub async fn review_status(
    oracle: &dyn PermissionOracle,
    patches: &[Patch],
    group: &str,
) -> Result<Verdict, ClientError> {
    if patches.is_empty() {
        return Ok(Verdict::Fail(None));
    }
    let mut agg = Aggregate::default();
    for patch in patches {
        let votes: Vec<Vote> = patch
            .reviews
            .iter()
            .map(|r| Vote {
                email: &r.reviewer.email,
                result: r.result,
            })
            .collect();
        let scan = scan_votes(oracle, &votes, group).await?;
        agg.add(patch.id, scan);
    }
    Ok(agg.verdict())
}

/// Approval status of a patchset for one branch. Only `approval-<branch>`
/// flags whose branch part matches (case-insensitive, trimmed) count;
/// approvals for other branches are ignored.
pub async fn approval_status(
    oracle: &dyn PermissionOracle,
    patches: &[Patch],
    branch: &str,
    group: &str,
) -> Result<Verdict, ClientError> {
    if patches.is_empty() {
        return Ok(Verdict::Fail(None));
    }
    let mut agg = Aggregate::default();
    for patch in patches {
        let votes: Vec<Vote> = patch
            .approvals
            .iter()
            .filter(|a| a.branch.trim().eq_ignore_ascii_case(branch))
            .map(|a| Vote {
                email: &a.approver.email,
                result: a.result,
            })
            .collect();
        let scan = scan_votes(oracle, &votes, group).await?;
        agg.add(patch.id, scan);
    }
    Ok(agg.verdict())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use alq_schemas::{Approval, Review, ReviewKind, UserRecord};
    use async_trait::async_trait;

    struct Members(&'static [&'static str]);

    #[async_trait]
    impl PermissionOracle for Members {
        async fn is_member(&self, email: &str, _group: &str) -> Result<bool, ClientError> {
            Ok(self.0.contains(&email))
        }
    }

    fn user(email: &str) -> UserRecord {
        UserRecord {
            name: email.to_string(),
            email: email.to_string(),
        }
    }

    fn patch_with_reviews(id: i64, reviews: Vec<(&str, FlagResult)>) -> Patch {
        Patch {
            id,
            author: user("author@example.org"),
            reviews: reviews
                .into_iter()
                .map(|(email, result)| Review {
                    kind: ReviewKind::Review,
                    reviewer: user(email),
                    result,
                })
                .collect(),
            approvals: vec![],
        }
    }

    fn patch_with_approvals(id: i64, approvals: Vec<(&str, &str, FlagResult)>) -> Patch {
        Patch {
            id,
            author: user("author@example.org"),
            reviews: vec![],
            approvals: approvals
                .into_iter()
                .map(|(branch, email, result)| Approval {
                    branch: branch.to_string(),
                    approver: user(email),
                    result,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn member_plus_passes() {
        let oracle = Members(&["rev@example.org"]);
        let patches = vec![patch_with_reviews(1, vec![("rev@example.org", FlagResult::Granted)])];
        let v = review_status(&oracle, &patches, "scm_l1").await.unwrap();
        assert_eq!(v, Verdict::Pass);
    }

    #[tokio::test]
    async fn minus_beats_member_plus() {
        let oracle = Members(&["rev@example.org"]);
        let patches = vec![patch_with_reviews(
            1,
            vec![
                ("rev@example.org", FlagResult::Granted),
                ("other@example.org", FlagResult::Denied),
            ],
        )];
        let v = review_status(&oracle, &patches, "scm_l1").await.unwrap();
        assert_eq!(v, Verdict::Fail(Some(vec![1])));
    }

    #[tokio::test]
    async fn nonmember_plus_is_invalid() {
        let oracle = Members(&[]);
        let patches = vec![patch_with_reviews(7, vec![("rev@example.org", FlagResult::Granted)])];
        let v = review_status(&oracle, &patches, "scm_l1").await.unwrap();
        assert_eq!(v, Verdict::Invalid(vec![7]));
    }

    #[tokio::test]
    async fn question_or_no_flags_is_pending() {
        let oracle = Members(&[]);
        let patches = vec![
            patch_with_reviews(1, vec![("rev@example.org", FlagResult::Requested)]),
            patch_with_reviews(2, vec![]),
        ];
        let v = review_status(&oracle, &patches, "scm_l1").await.unwrap();
        assert_eq!(v, Verdict::Pending(vec![1, 2]));
    }

    #[tokio::test]
    async fn invalid_outranks_pending_across_patches() {
        let oracle = Members(&[]);
        let patches = vec![
            patch_with_reviews(1, vec![]),
            patch_with_reviews(2, vec![("rev@example.org", FlagResult::Granted)]),
        ];
        let v = review_status(&oracle, &patches, "scm_l1").await.unwrap();
        assert_eq!(v, Verdict::Invalid(vec![2]));
    }

    #[tokio::test]
    async fn empty_patchset_fails_with_no_list() {
        let oracle = Members(&[]);
        let v = review_status(&oracle, &[], "scm_l1").await.unwrap();
        assert_eq!(v, Verdict::Fail(None));
    }

    #[tokio::test]
    async fn adding_a_minus_patch_to_a_passing_set_fails() {
        let oracle = Members(&["rev@example.org"]);
        let mut patches =
            vec![patch_with_reviews(1, vec![("rev@example.org", FlagResult::Granted)])];
        assert!(review_status(&oracle, &patches, "g").await.unwrap().is_pass());

        patches.push(patch_with_reviews(2, vec![("rev@example.org", FlagResult::Denied)]));
        let v = review_status(&oracle, &patches, "g").await.unwrap();
        assert_eq!(v, Verdict::Fail(Some(vec![2])));
    }

    #[tokio::test]
    async fn approvals_filter_on_branch_name() {
        let oracle = Members(&["app@example.org"]);
        let patches = vec![patch_with_approvals(
            1,
            vec![
                (" Mozilla-Beta ", "app@example.org", FlagResult::Granted),
                ("mozilla-aurora", "app@example.org", FlagResult::Denied),
            ],
        )];
        // The aurora `-` is invisible to the beta evaluation.
        let v = approval_status(&oracle, &patches, "mozilla-beta", "g").await.unwrap();
        assert_eq!(v, Verdict::Pass);

        let v = approval_status(&oracle, &patches, "mozilla-aurora", "g").await.unwrap();
        assert_eq!(v, Verdict::Fail(Some(vec![1])));
    }

    #[tokio::test]
    async fn approval_for_other_branch_only_is_pending() {
        let oracle = Members(&["app@example.org"]);
        let patches = vec![patch_with_approvals(
            3,
            vec![("mozilla-aurora", "app@example.org", FlagResult::Granted)],
        )];
        let v = approval_status(&oracle, &patches, "mozilla-beta", "g").await.unwrap();
        assert_eq!(v, Verdict::Pending(vec![3]));
    }
}
