//! In-memory [`QueueStore`] with the same invariants as the SQL schema:
//! the patchset identity tuple is unique, branch names compare
//! case-insensitively, and a branch-stage row always carries a revision.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use alq_db::{PatchsetQuery, QueueStore, StoreError};
use alq_schemas::{Branch, Comment, NewComment, NewPatchset, Patchset};

#[derive(Default)]
struct Inner {
    branches: Vec<Branch>,
    patchsets: Vec<Patchset>,
    comments: Vec<Comment>,
    next_patchset_id: i64,
    next_comment_id: i64,
}

pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_patchset_id: 1,
                next_comment_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Provision a branch record (normally done out-of-band).
    pub fn add_branch(&self, branch: Branch) {
        self.inner.lock().unwrap().branches.push(branch);
    }

    /// Seed a fully-formed patchset row, bypassing insert-time checks; for
    /// arranging mid-lifecycle states (e.g. in-flight rows) in tests.
    pub fn seed_patchset(&self, ps: Patchset) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_patchset_id = inner.next_patchset_id.max(ps.id + 1);
        inner.patchsets.push(ps);
    }

    /// Snapshot of all patchset rows.
    pub fn patchsets(&self) -> Vec<Patchset> {
        self.inner.lock().unwrap().patchsets.clone()
    }

    /// Snapshot of all queued comments.
    pub fn queued_comments(&self) -> Vec<Comment> {
        self.inner.lock().unwrap().comments.clone()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_query(ps: &Patchset, q: &PatchsetQuery) -> bool {
    if let Some(id) = q.id {
        if ps.id != id {
            return false;
        }
    }
    if let Some(bug_id) = q.bug_id {
        if ps.bug_id != bug_id {
            return false;
        }
    }
    if let Some(ref branch) = q.branch {
        if !ps.branch.eq_ignore_ascii_case(branch) {
            return false;
        }
    }
    if let Some(ref patches) = q.patches {
        if &ps.patches != patches {
            return false;
        }
    }
    if let Some(try_run) = q.try_run {
        if ps.try_run != try_run {
            return false;
        }
    }
    if let Some(ref revision) = q.revision {
        if ps.revision.as_deref() != Some(revision.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl QueueStore for MemStore {
    async fn branch_by_name(&self, name: &str) -> Result<Option<Branch>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .branches
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn running_on_branch(
        &self,
        name: &str,
        include_trial: bool,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        let n = inner
            .patchsets
            .iter()
            .filter(|ps| ps.push_time.is_some())
            .filter(|ps| {
                if include_trial {
                    ps.try_run
                } else {
                    !ps.try_run && ps.branch.eq_ignore_ascii_case(name)
                }
            })
            .count();
        Ok(n as i64)
    }

    async fn find_patchset(&self, q: &PatchsetQuery) -> Result<Option<Patchset>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut hits: Vec<&Patchset> =
            inner.patchsets.iter().filter(|ps| matches_query(ps, q)).collect();
        hits.sort_by_key(|ps| ps.id);
        Ok(hits.first().map(|ps| (*ps).clone()))
    }

    async fn insert_patchset(&self, p: &NewPatchset) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if !p.try_run {
            // Mirrors the schema check: a branch-stage row without a trial
            // revision cannot exist.
            return Err(StoreError::Backend(anyhow::anyhow!(
                "refusing to insert branch-stage patchset without a revision"
            )));
        }

        let duplicate = inner.patchsets.iter().any(|ps| {
            ps.bug_id == p.bug_id
                && ps.branch.eq_ignore_ascii_case(&p.branch)
                && ps.patches == p.patches
                && ps.try_run == p.try_run
        });
        if duplicate {
            return Err(StoreError::Conflict);
        }

        let id = inner.next_patchset_id;
        inner.next_patchset_id += 1;
        inner.patchsets.push(Patchset {
            id,
            bug_id: p.bug_id,
            branch: p.branch.clone(),
            patches: p.patches.clone(),
            try_syntax: p.try_syntax.clone(),
            author: p.author.clone(),
            try_run: p.try_run,
            revision: None,
            push_time: None,
            retries: 0,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn update_patchset(&self, p: &Patchset) -> Result<(), StoreError> {
        if !p.try_run && p.revision.is_none() {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "refusing to store branch-stage patchset without a revision"
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.patchsets.iter_mut().find(|ps| ps.id == p.id) {
            *slot = p.clone();
        }
        Ok(())
    }

    async fn delete_patchset(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.patchsets.retain(|ps| ps.id != id);
        Ok(())
    }

    async fn take_next_patchset(&self) -> Result<Option<Patchset>, StoreError> {
        // Mirrors the Postgres claim: the returned row has push_time stamped
        // under the same lock, so a second caller cannot receive it.
        let mut inner = self.inner.lock().unwrap();
        let mut best: Option<usize> = None;
        for (i, ps) in inner.patchsets.iter().enumerate() {
            if ps.push_time.is_some() || !(ps.try_run || ps.revision.is_some()) {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(j) => {
                    let current = &inner.patchsets[j];
                    if (ps.created_at, ps.id) < (current.created_at, current.id) {
                        best = Some(i);
                    }
                }
            }
        }
        Ok(best.map(|i| {
            let slot = &mut inner.patchsets[i];
            slot.push_time = Some(Utc::now());
            slot.clone()
        }))
    }

    async fn release_patchset(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ps) = inner.patchsets.iter_mut().find(|ps| ps.id == id) {
            ps.push_time = None;
        }
        Ok(())
    }

    async fn patchset_revisions(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut with_rev: Vec<&Patchset> =
            inner.patchsets.iter().filter(|ps| ps.revision.is_some()).collect();
        with_rev.sort_by_key(|ps| ps.id);
        Ok(with_rev
            .into_iter()
            .filter_map(|ps| ps.revision.clone())
            .collect())
    }

    async fn comment_enqueue(&self, c: &NewComment) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_comment_id;
        inner.next_comment_id += 1;
        inner.comments.push(Comment {
            id,
            bug: c.bug,
            comment: c.comment.clone(),
            attempts: 0,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn comment_take_oldest(&self, limit: i64) -> Result<Vec<Comment>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<&Comment> = inner.comments.iter().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all.into_iter().take(limit.max(0) as usize).cloned().collect())
    }

    async fn comment_update(&self, c: &Comment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.comments.iter_mut().find(|x| x.id == c.id) {
            *slot = c.clone();
        }
        Ok(())
    }

    async fn comment_delete(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.comments.retain(|c| c.id != id);
        Ok(())
    }
}
