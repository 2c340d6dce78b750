//! Postgres-backed [`QueueStore`].
//!
//! Queries are runtime-checked; the schema invariants (uniqueness over the
//! patchset identity tuple, the trial/revision check) live in
//! `./migrations` so they hold even against out-of-band writers.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};

use alq_schemas::{Branch, Comment, NewComment, NewPatchset, Patchset};

use crate::{patches_from_text, patches_to_text, PatchsetQuery, QueueStore, StoreError};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const PATCHSET_COLUMNS: &str = "id, bug_id, branch, patches, try_syntax, author, try_run, \
                                revision, push_time, retries, created_at";

fn row_to_patchset(row: &PgRow) -> Result<Patchset, StoreError> {
    Ok(Patchset {
        id: row.try_get("id").map_err(StoreError::from)?,
        bug_id: row.try_get("bug_id").map_err(StoreError::from)?,
        branch: row.try_get("branch").map_err(StoreError::from)?,
        patches: patches_from_text(row.try_get::<String, _>("patches").map_err(StoreError::from)?.as_str()),
        try_syntax: row.try_get("try_syntax").map_err(StoreError::from)?,
        author: row.try_get("author").map_err(StoreError::from)?,
        try_run: row.try_get("try_run").map_err(StoreError::from)?,
        revision: row.try_get("revision").map_err(StoreError::from)?,
        push_time: row.try_get("push_time").map_err(StoreError::from)?,
        retries: row.try_get("retries").map_err(StoreError::from)?,
        created_at: row.try_get("created_at").map_err(StoreError::from)?,
    })
}

#[async_trait]
impl QueueStore for PgStore {
    async fn branch_by_name(&self, name: &str) -> Result<Option<Branch>, StoreError> {
        let row = sqlx::query(
            r#"
            select name, repo_url, threshold, approval_required, permission_group
            from branches
            where lower(name) = lower($1)
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        Ok(Some(Branch {
            name: row.try_get("name").map_err(StoreError::from)?,
            repo_url: row.try_get("repo_url").map_err(StoreError::from)?,
            threshold: row.try_get("threshold").map_err(StoreError::from)?,
            approval_required: row.try_get("approval_required").map_err(StoreError::from)?,
            permission_group: row.try_get("permission_group").map_err(StoreError::from)?,
        }))
    }

    async fn running_on_branch(
        &self,
        name: &str,
        include_trial: bool,
    ) -> Result<i64, StoreError> {
        let (n,): (i64,) = if include_trial {
            sqlx::query_as(
                r#"
                select count(*)::bigint
                from patchsets
                where push_time is not null and try_run
                "#,
            )
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                select count(*)::bigint
                from patchsets
                where push_time is not null
                  and not try_run
                  and lower(branch) = lower($1)
                "#,
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await?
        };
        Ok(n)
    }

    async fn find_patchset(&self, q: &PatchsetQuery) -> Result<Option<Patchset>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "select {PATCHSET_COLUMNS} from patchsets where true"
        ));
        if let Some(id) = q.id {
            qb.push(" and id = ").push_bind(id);
        }
        if let Some(bug_id) = q.bug_id {
            qb.push(" and bug_id = ").push_bind(bug_id);
        }
        if let Some(ref branch) = q.branch {
            qb.push(" and lower(branch) = lower(").push_bind(branch.clone()).push(")");
        }
        if let Some(ref patches) = q.patches {
            qb.push(" and patches = ").push_bind(patches_to_text(patches));
        }
        if let Some(try_run) = q.try_run {
            qb.push(" and try_run = ").push_bind(try_run);
        }
        if let Some(ref revision) = q.revision {
            qb.push(" and revision = ").push_bind(revision.clone());
        }
        qb.push(" order by id asc limit 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_patchset).transpose()
    }

    async fn insert_patchset(&self, p: &NewPatchset) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into patchsets (bug_id, branch, patches, try_syntax, author, try_run)
            values ($1, $2, $3, $4, $5, $6)
            returning id
            "#,
        )
        .bind(p.bug_id)
        .bind(&p.branch)
        .bind(patches_to_text(&p.patches))
        .bind(&p.try_syntax)
        .bind(&p.author)
        .bind(p.try_run)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_patchset(&self, p: &Patchset) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            update patchsets
            set bug_id = $2,
                branch = $3,
                patches = $4,
                try_syntax = $5,
                author = $6,
                try_run = $7,
                revision = $8,
                push_time = $9,
                retries = $10
            where id = $1
            "#,
        )
        .bind(p.id)
        .bind(p.bug_id)
        .bind(&p.branch)
        .bind(patches_to_text(&p.patches))
        .bind(&p.try_syntax)
        .bind(&p.author)
        .bind(p.try_run)
        .bind(&p.revision)
        .bind(p.push_time)
        .bind(p.retries)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_patchset(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("delete from patchsets where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take_next_patchset(&self) -> Result<Option<Patchset>, StoreError> {
        // Select and claim in one statement: the SKIP LOCKED row lock alone
        // would be gone the moment the statement returns, so the same UPDATE
        // stamps push_time as the claim marker. Concurrent callers skip the
        // locked row while the statement runs and fail the push_time
        // predicate afterwards.
        let row = sqlx::query(&format!(
            r#"
            with next as (
                select id
                from patchsets
                where push_time is null
                  and (try_run or revision is not null)
                order by created_at asc, id asc
                limit 1
                for update skip locked
            )
            update patchsets
               set push_time = now()
             where id in (select id from next)
            returning {PATCHSET_COLUMNS}
            "#
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_patchset).transpose()
    }

    async fn release_patchset(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            update patchsets
               set push_time = null
             where id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn patchset_revisions(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            select revision
            from patchsets
            where revision is not null
            order by id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(r,)| r).collect())
    }

    async fn comment_enqueue(&self, c: &NewComment) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into comments (bug, comment)
            values ($1, $2)
            returning id
            "#,
        )
        .bind(c.bug)
        .bind(&c.comment)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn comment_take_oldest(&self, limit: i64) -> Result<Vec<Comment>, StoreError> {
        let rows = sqlx::query(
            r#"
            select id, bug, comment, attempts, created_at
            from comments
            order by created_at asc, id asc
            limit $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Comment {
                id: row.try_get("id").map_err(StoreError::from)?,
                bug: row.try_get("bug").map_err(StoreError::from)?,
                comment: row.try_get("comment").map_err(StoreError::from)?,
                attempts: row.try_get("attempts").map_err(StoreError::from)?,
                created_at: row.try_get("created_at").map_err(StoreError::from)?,
            });
        }
        Ok(out)
    }

    async fn comment_update(&self, c: &Comment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            update comments
            set bug = $2, comment = $3, attempts = $4
            where id = $1
            "#,
        )
        .bind(c.id)
        .bind(c.bug)
        .bind(&c.comment)
        .bind(c.attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn comment_delete(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("delete from comments where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
