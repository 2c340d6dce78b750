//! Queue state store: the persistence contract plus the Postgres
//! implementation.
//!
//! All persisted entities (branches, patchsets, comments) are owned by this
//! layer; every mutation goes through [`QueueStore`]. `take_next_patchset`
//! claims the row it returns in the same atomic operation (the Postgres
//! implementation selects with SKIP LOCKED and stamps `push_time` in one
//! statement), so concurrent dispatchers never pop the same patchset. A
//! claim that does not end in a dispatch or a delete must be handed back
//! with `release_patchset`.

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};

use alq_schemas::{Branch, Comment, NewComment, NewPatchset, Patchset};

mod pg;

pub use pg::PgStore;

pub const ENV_DB_URL: &str = "ALQ_DATABASE_URL";

/// Connect to Postgres using ALQ_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors surfaced by store operations.
///
/// `Conflict` is the one kind callers branch on: inserting a patchset that
/// already exists for the same `(bug_id, branch, patches, try_run)` means
/// the work is already queued, not that anything is broken.
#[derive(Debug)]
pub enum StoreError {
    Conflict,
    Backend(anyhow::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "uniqueness conflict"),
            StoreError::Backend(e) => write!(f, "store backend error: {e:#}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(e)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_unique_violation(&e) {
            StoreError::Conflict
        } else {
            StoreError::Backend(anyhow::Error::new(e))
        }
    }
}

/// Detect a Postgres unique constraint violation (SQLSTATE 23505).
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Query criteria
// ---------------------------------------------------------------------------

/// Criteria for `find_patchset`; any subset of fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchsetQuery {
    pub id: Option<i64>,
    pub bug_id: Option<i64>,
    pub branch: Option<String>,
    pub patches: Option<Vec<i64>>,
    pub try_run: Option<bool>,
    pub revision: Option<String>,
}

impl PatchsetQuery {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_revision(revision: &str) -> Self {
        Self {
            revision: Some(revision.to_string()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

/// Persistence contract used by ingest, the event handler, the dispatcher,
/// and the comment outbox. Implementations must make every operation atomic
/// with respect to concurrent callers.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn branch_by_name(&self, name: &str) -> Result<Option<Branch>, StoreError>;

    /// Count in-flight patchsets. With `include_trial`, counts trial runs
    /// regardless of branch (the trial branch hosts every branch's trials);
    /// without it, counts branch pushes for `name` only.
    async fn running_on_branch(&self, name: &str, include_trial: bool)
        -> Result<i64, StoreError>;

    async fn find_patchset(&self, q: &PatchsetQuery) -> Result<Option<Patchset>, StoreError>;

    /// Insert a patchset, returning its id. Fails with
    /// [`StoreError::Conflict`] when an equal `(bug_id, branch, patches,
    /// try_run)` row already exists.
    async fn insert_patchset(&self, p: &NewPatchset) -> Result<i64, StoreError>;

    async fn update_patchset(&self, p: &Patchset) -> Result<(), StoreError>;

    async fn delete_patchset(&self, id: i64) -> Result<(), StoreError>;

    /// Claim the oldest patchset (by `created_at`, ties by `id`) with null
    /// `push_time` that is eligible for its next stage: still awaiting its
    /// trial run, or trial-complete with a recorded revision.
    ///
    /// The claim stamps `push_time` in the same atomic operation as the
    /// select, so the same patchset is never returned to two concurrent
    /// callers. The caller MUST finish with a dispatch (persisting the real
    /// `push_time` via `update_patchset`), a delete, or `release_patchset`;
    /// an unreleased claim keeps the row out of the queue.
    async fn take_next_patchset(&self) -> Result<Option<Patchset>, StoreError>;

    /// Hand a claimed patchset back to the queue: clears `push_time` so the
    /// next `take_next_patchset` can pick it up again.
    async fn release_patchset(&self, id: i64) -> Result<(), StoreError>;

    /// Revisions of all patchsets that have one (trial pushed or later).
    async fn patchset_revisions(&self) -> Result<Vec<String>, StoreError>;

    async fn comment_enqueue(&self, c: &NewComment) -> Result<i64, StoreError>;

    async fn comment_take_oldest(&self, limit: i64) -> Result<Vec<Comment>, StoreError>;

    async fn comment_update(&self, c: &Comment) -> Result<(), StoreError>;

    async fn comment_delete(&self, id: i64) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Patch-list encoding
// ---------------------------------------------------------------------------

/// Patch lists persist as comma-joined text so the uniqueness index covers
/// the exact ordered list.
pub fn patches_to_text(patches: &[i64]) -> String {
    patches
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn patches_from_text(s: &str) -> Vec<i64> {
    s.split(',')
        .filter(|t| !t.is_empty())
        .filter_map(|t| t.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_text_round_trip() {
        let ids = vec![10, 11, 205];
        assert_eq!(patches_to_text(&ids), "10,11,205");
        assert_eq!(patches_from_text("10,11,205"), ids);
        assert_eq!(patches_from_text(""), Vec::<i64>::new());
    }

    #[test]
    fn query_builders_set_single_field() {
        let q = PatchsetQuery::by_revision("abc123");
        assert_eq!(q.revision.as_deref(), Some("abc123"));
        assert_eq!(q.id, None);
        assert_eq!(PatchsetQuery::by_id(5).id, Some(5));
    }
}
