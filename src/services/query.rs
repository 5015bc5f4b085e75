//! Query orchestrator (C12): listings, search, and the read-by-id path,
//! each enforcing the visibility predicate from spec §4.12 before handing
//! results back. Pagination clamping and the 3-query batch assembly are
//! delegated to the catalog repository (C5).

use sqlx::SqlitePool;

use crate::auth::tokens::Principal;
use crate::catalog::images;
use crate::db::models::{ImageAggregate, PaginatedResponse, PaginationParams, Role};
use crate::error::{AppError, AppResult};

pub struct QueryOrchestrator {
    pool: SqlitePool,
}

impl QueryOrchestrator {
    pub fn new(pool: SqlitePool) -> Self {
        QueryOrchestrator { pool }
    }

    /// Read-by-id. A requester who isn't the owner or a moderator/admin may
    /// only see `active` images with `visibility ∈ {public, unlisted}` —
    /// anything else is reported as `not_found`, identically to how a
    /// genuinely absent id would be reported, so existence can't be probed.
    pub async fn get_image(&self, principal: Option<&Principal>, id: &str) -> AppResult<ImageAggregate> {
        let aggregate = images::find_aggregate_by_id(&self.pool, id)
            .await?
            .ok_or(AppError::NotFound)?;

        if self.can_view(principal, &aggregate.image.owner_id, &aggregate.image.status, &aggregate.image.visibility) {
            Ok(aggregate)
        } else {
            Err(AppError::NotFound)
        }
    }

    fn can_view(&self, principal: Option<&Principal>, owner_id: &str, status: &str, visibility: &str) -> bool {
        if let Some(principal) = principal {
            if principal.user_id == owner_id {
                return true;
            }
            if matches!(Role::parse(&principal.role), Some(Role::Moderator) | Some(Role::Admin)) {
                return true;
            }
        }
        status == "active" && matches!(visibility, "public" | "unlisted")
    }

    pub async fn list_public(&self, pagination: &PaginationParams) -> AppResult<PaginatedResponse<ImageAggregate>> {
        let (rows, total) = images::list_public(&self.pool, pagination.offset(), pagination.limit()).await?;
        self.assemble(rows, total, pagination).await
    }

    /// Lists everything the given owner has, any status/visibility — used
    /// for the "my uploads" endpoint, always gated on `principal.user_id ==
    /// owner_id` by the caller (the handler), since it bypasses the
    /// visibility predicate entirely.
    pub async fn list_owned(&self, owner_id: &str, pagination: &PaginationParams) -> AppResult<PaginatedResponse<ImageAggregate>> {
        let (rows, total) = images::list_by_owner(&self.pool, owner_id, pagination.offset(), pagination.limit()).await?;
        self.assemble(rows, total, pagination).await
    }

    pub async fn list_by_tag(&self, tag: &str, pagination: &PaginationParams) -> AppResult<PaginatedResponse<ImageAggregate>> {
        let (rows, total) = images::list_by_tag(&self.pool, tag, pagination.offset(), pagination.limit()).await?;
        self.assemble(rows, total, pagination).await
    }

    pub async fn search(&self, text: &str, pagination: &PaginationParams) -> AppResult<PaginatedResponse<ImageAggregate>> {
        let (rows, total) = images::search(&self.pool, text, pagination.offset(), pagination.limit()).await?;
        self.assemble(rows, total, pagination).await
    }

    async fn assemble(
        &self,
        rows: Vec<crate::db::models::Image>,
        total: i64,
        pagination: &PaginationParams,
    ) -> AppResult<PaginatedResponse<ImageAggregate>> {
        let data = images::load_aggregates(&self.pool, rows).await?;
        Ok(PaginatedResponse {
            data,
            total,
            offset: pagination.offset(),
            limit: pagination.limit(),
        })
    }
}
