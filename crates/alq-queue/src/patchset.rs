//! Patchset assembly: resolve a bug to the ordered list of patches with
//! their review and approval flags.
//!
//! Only attachments that are patches and not obsolete are eligible. With an
//! explicit request list the output follows the caller's order and any
//! missing id fails the whole assembly; otherwise the tracker's natural
//! attachment order is kept.

use std::fmt;

use alq_schemas::{Approval, FlagResult, Patch, Review, ReviewKind};

use crate::clients::{Attachment, ClientError, Tracker};
use crate::policy::join_ids;

const APPROVAL_PREFIX: &str = "approval-";

/// Why a bug could not be assembled into a patchset.
#[derive(Debug)]
pub enum AssembleError {
    /// Requested attachment ids that do not exist, are not patches, or are
    /// obsolete.
    MissingRequested(Vec<i64>),
    /// The bug has no eligible patches at all.
    Empty,
    /// The tracker could not be consulted; transient.
    Client(ClientError),
}

impl AssembleError {
    /// The user-visible comment for a non-transient assembly failure.
    pub fn user_message(&self) -> Option<String> {
        match self {
            AssembleError::MissingRequested(ids) => Some(format!(
                "Autoland Failure\nSpecified patches {} do not exist, or are not posted to this bug.",
                join_ids(ids, ",")
            )),
            AssembleError::Empty => {
                Some("Autoland Failure\nThere are no patches to run.".to_string())
            }
            AssembleError::Client(_) => None,
        }
    }
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleError::MissingRequested(ids) => {
                write!(f, "requested patches not found: {}", join_ids(ids, ","))
            }
            AssembleError::Empty => write!(f, "no eligible patches"),
            AssembleError::Client(e) => write!(f, "tracker unavailable: {e}"),
        }
    }
}

impl std::error::Error for AssembleError {}

impl From<ClientError> for AssembleError {
    fn from(e: ClientError) -> Self {
        AssembleError::Client(e)
    }
}

fn eligible(a: &Attachment) -> bool {
    a.is_patch && !a.is_obsolete
}

/// Assemble the patchset for a bug.
pub async fn assemble(
    tracker: &dyn Tracker,
    bug_id: i64,
    requested: Option<&[i64]>,
) -> Result<Vec<Patch>, AssembleError> {
    let attachments = tracker.bug_attachments(bug_id).await?;

    let mut patchset = Vec::new();
    match requested {
        Some(ids) if !ids.is_empty() => {
            let mut missing = Vec::new();
            for &id in ids {
                match attachments.iter().find(|a| a.id == id && eligible(a)) {
                    Some(att) => patchset.push(resolve_patch(tracker, att).await?),
                    None => missing.push(id),
                }
            }
            if !missing.is_empty() {
                return Err(AssembleError::MissingRequested(missing));
            }
        }
        _ => {
            for att in attachments.iter().filter(|a| eligible(a)) {
                patchset.push(resolve_patch(tracker, att).await?);
            }
        }
    }

    if patchset.is_empty() {
        return Err(AssembleError::Empty);
    }
    Ok(patchset)
}

/// Resolve one attachment: author plus review/approval flags, with every
/// setter looked up through the tracker.
async fn resolve_patch(tracker: &dyn Tracker, att: &Attachment) -> Result<Patch, ClientError> {
    let author = tracker.user_info(&att.attacher).await?;

    let mut reviews = Vec::new();
    let mut approvals = Vec::new();
    for flag in &att.flags {
        let Some(result) = FlagResult::parse(&flag.status) else {
            continue;
        };
        if let Some(kind) = ReviewKind::parse(&flag.name) {
            reviews.push(Review {
                kind,
                reviewer: tracker.user_info(&flag.setter).await?,
                result,
            });
        } else if let Some(branch) = flag.name.strip_prefix(APPROVAL_PREFIX) {
            approvals.push(Approval {
                branch: branch.to_string(),
                approver: tracker.user_info(&flag.setter).await?,
                result,
            });
        }
    }

    Ok(Patch {
        id: att.id,
        author,
        reviews,
        approvals,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{AttachmentFlag, BugHit};
    use alq_schemas::UserRecord;
    use async_trait::async_trait;

    struct StubTracker {
        attachments: Vec<Attachment>,
    }

    #[async_trait]
    impl Tracker for StubTracker {
        async fn search_whiteboard(&self, _pattern: &str) -> Result<Vec<BugHit>, ClientError> {
            Ok(vec![])
        }

        async fn bug_attachments(&self, _bug_id: i64) -> Result<Vec<Attachment>, ClientError> {
            Ok(self.attachments.clone())
        }

        async fn user_info(&self, login: &str) -> Result<UserRecord, ClientError> {
            Ok(UserRecord {
                name: login.to_string(),
                email: format!("{login}@example.org"),
            })
        }

        async fn notify_bug(&self, _bug_id: i64, _comment: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn remove_whiteboard_tag(
            &self,
            _pattern: &str,
            _bug_id: i64,
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn replace_whiteboard_tag(
            &self,
            _pattern: &str,
            _replacement: &str,
            _bug_id: i64,
        ) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn attachment(id: i64, is_patch: bool, is_obsolete: bool) -> Attachment {
        Attachment {
            id,
            attacher: "author".to_string(),
            is_patch,
            is_obsolete,
            flags: vec![
                AttachmentFlag {
                    name: "review".to_string(),
                    setter: "rev".to_string(),
                    status: "+".to_string(),
                },
                AttachmentFlag {
                    name: "approval-mozilla-beta".to_string(),
                    setter: "driver".to_string(),
                    status: "?".to_string(),
                },
                AttachmentFlag {
                    name: "needinfo".to_string(),
                    setter: "someone".to_string(),
                    status: "?".to_string(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn natural_order_skips_ineligible() {
        let tracker = StubTracker {
            attachments: vec![
                attachment(10, true, false),
                attachment(11, false, false),
                attachment(12, true, true),
                attachment(13, true, false),
            ],
        };
        let ps = assemble(&tracker, 42, None).await.unwrap();
        let ids: Vec<i64> = ps.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![10, 13]);
    }

    #[tokio::test]
    async fn flags_map_to_reviews_and_approvals() {
        let tracker = StubTracker {
            attachments: vec![attachment(10, true, false)],
        };
        let ps = assemble(&tracker, 42, None).await.unwrap();
        let patch = &ps[0];
        assert_eq!(patch.author.email, "author@example.org");
        assert_eq!(patch.reviews.len(), 1);
        assert_eq!(patch.reviews[0].kind, ReviewKind::Review);
        assert_eq!(patch.reviews[0].result, FlagResult::Granted);
        // The needinfo flag is neither a review nor an approval.
        assert_eq!(patch.approvals.len(), 1);
        assert_eq!(patch.approvals[0].branch, "mozilla-beta");
        assert_eq!(patch.approvals[0].result, FlagResult::Requested);
    }

    #[tokio::test]
    async fn requested_order_is_preserved() {
        let tracker = StubTracker {
            attachments: vec![attachment(10, true, false), attachment(11, true, false)],
        };
        let ps = assemble(&tracker, 42, Some(&[11, 10])).await.unwrap();
        let ids: Vec<i64> = ps.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![11, 10]);
    }

    #[tokio::test]
    async fn missing_requested_fails_whole_assembly() {
        let tracker = StubTracker {
            attachments: vec![attachment(10, true, false), attachment(12, true, true)],
        };
        let err = assemble(&tracker, 42, Some(&[10, 12, 99])).await.unwrap_err();
        match err {
            AssembleError::MissingRequested(ids) => assert_eq!(ids, vec![12, 99]),
            other => panic!("expected MissingRequested, got {other:?}"),
        }
        let msg = AssembleError::MissingRequested(vec![12, 99]).user_message().unwrap();
        assert!(msg.contains("12,99"));
    }

    #[tokio::test]
    async fn no_eligible_patches_is_empty() {
        let tracker = StubTracker {
            attachments: vec![attachment(11, false, false)],
        };
        let err = assemble(&tracker, 42, None).await.unwrap_err();
        assert!(matches!(err, AssembleError::Empty));
    }
}
