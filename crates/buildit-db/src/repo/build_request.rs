//! Build request repository.
//!
//! The store is shared by every master. Claiming is the only cross-process
//! arbiter of who builds a request, so `claim_build_requests` is atomic over
//! the whole id set: either every id is claimed or none is.

use async_trait::async_trait;
use buildit_core::{BuildRequest, BuildRequestId, NewBuildRequest, ResourceId, SourceStamp};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::HashSet;

use crate::{DbError, DbResult};

/// Result of an attempt to claim a set of build requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Every requested id is now claimed by the caller.
    Claimed,
    /// Nothing was claimed; these ids are held by someone else, already
    /// complete, or unknown.
    AlreadyClaimed(Vec<BuildRequestId>),
}

#[async_trait]
pub trait BuildRequestStore: Send + Sync {
    async fn add_build_request(&self, request: NewBuildRequest) -> DbResult<BuildRequest>;
    async fn get_build_request(&self, id: BuildRequestId) -> DbResult<BuildRequest>;

    /// Unclaimed, incomplete requests for a builder, oldest first.
    async fn get_unclaimed_build_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>>;

    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        claimant: ResourceId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<ClaimOutcome>;

    /// Release claims on incomplete requests. Unclaiming twice is a no-op.
    async fn unclaim_build_requests(&self, ids: &[BuildRequestId]) -> DbResult<()>;

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        complete_at: DateTime<Utc>,
    ) -> DbResult<()>;

    /// Submission time of the oldest unclaimed request for a builder.
    async fn get_oldest_request_time(&self, builder: &str) -> DbResult<Option<DateTime<Utc>>>;
}

/// Ids in the order given, without repeats.
pub(crate) fn dedup_ids(ids: &[BuildRequestId]) -> Vec<BuildRequestId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRequestRow {
    id: i64,
    builder: String,
    buildset_id: i64,
    submitted_at: DateTime<Utc>,
    priority: Option<i32>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<uuid::Uuid>,
    complete_at: Option<DateTime<Utc>>,
    sourcestamps: Json<Vec<SourceStamp>>,
}

impl From<BuildRequestRow> for BuildRequest {
    fn from(row: BuildRequestRow) -> Self {
        BuildRequest {
            id: BuildRequestId::new(row.id),
            builder: row.builder,
            buildset_id: row.buildset_id,
            submitted_at: row.submitted_at,
            priority: row.priority,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by.map(ResourceId::from_uuid),
            complete_at: row.complete_at,
            sourcestamps: row.sourcestamps.0,
        }
    }
}

/// PostgreSQL implementation of BuildRequestStore.
pub struct PgBuildRequestStore {
    pool: PgPool,
}

impl PgBuildRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn raw_ids(ids: &[BuildRequestId]) -> Vec<i64> {
    dedup_ids(ids).iter().map(|id| id.get()).collect()
}

#[async_trait]
impl BuildRequestStore for PgBuildRequestStore {
    async fn add_build_request(&self, request: NewBuildRequest) -> DbResult<BuildRequest> {
        let row = sqlx::query_as::<_, BuildRequestRow>(
            r#"
            INSERT INTO build_requests (builder, buildset_id, submitted_at, priority, sourcestamps)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&request.builder)
        .bind(request.buildset_id)
        .bind(request.submitted_at)
        .bind(request.priority)
        .bind(Json(&request.sourcestamps))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_build_request(&self, id: BuildRequestId) -> DbResult<BuildRequest> {
        let row = sqlx::query_as::<_, BuildRequestRow>("SELECT * FROM build_requests WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build request {}", id)))?;
        Ok(row.into())
    }

    async fn get_unclaimed_build_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
        let rows = sqlx::query_as::<_, BuildRequestRow>(
            r#"
            SELECT * FROM build_requests
            WHERE builder = $1 AND claimed_by IS NULL AND complete_at IS NULL
            ORDER BY submitted_at ASC, id ASC
            "#,
        )
        .bind(builder)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        claimant: ResourceId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<ClaimOutcome> {
        let wanted = raw_ids(ids);
        if wanted.is_empty() {
            return Ok(ClaimOutcome::Claimed);
        }

        // Concurrent claimers block on the row locks; once the winner commits
        // the loser's WHERE clause no longer matches those rows.
        let mut tx = self.pool.begin().await?;
        let claimed: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE build_requests
            SET claimed_by = $1, claimed_at = $2
            WHERE id = ANY($3) AND claimed_by IS NULL AND complete_at IS NULL
            RETURNING id
            "#,
        )
        .bind(claimant.as_uuid())
        .bind(claimed_at)
        .bind(&wanted)
        .fetch_all(&mut *tx)
        .await?;

        if claimed.len() == wanted.len() {
            tx.commit().await?;
            return Ok(ClaimOutcome::Claimed);
        }

        tx.rollback().await?;
        let claimed: HashSet<i64> = claimed.into_iter().collect();
        let conflicts = wanted
            .into_iter()
            .filter(|id| !claimed.contains(id))
            .map(BuildRequestId::new)
            .collect();
        Ok(ClaimOutcome::AlreadyClaimed(conflicts))
    }

    async fn unclaim_build_requests(&self, ids: &[BuildRequestId]) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE build_requests
            SET claimed_by = NULL, claimed_at = NULL
            WHERE id = ANY($1) AND complete_at IS NULL
            "#,
        )
        .bind(raw_ids(ids))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_build_requests(
        &self,
        ids: &[BuildRequestId],
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE build_requests SET complete_at = $2 WHERE id = ANY($1)")
            .bind(raw_ids(ids))
            .bind(complete_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_oldest_request_time(&self, builder: &str) -> DbResult<Option<DateTime<Utc>>> {
        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(submitted_at) FROM build_requests
            WHERE builder = $1 AND claimed_by IS NULL AND complete_at IS NULL
            "#,
        )
        .bind(builder)
        .fetch_one(&self.pool)
        .await?;
        Ok(oldest)
    }
}
