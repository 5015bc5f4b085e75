//! Image endpoints (spec §6): upload, read-by-id, listing/search, and the
//! owner-gated update/delete pair.

use axum::extract::{Extension, Multipart, Path, Query, State};
use axum::Json;

use crate::auth::middleware::authorize_owner_or_role;
use crate::auth::ratelimit::{self, UPLOAD_PER_USER};
use crate::auth::tokens::Principal;
use crate::catalog::images;
use crate::db::models::{
    ImageAggregate, PaginatedResponse, PaginationParams, UpdateImageInput, Visibility,
};
use crate::error::{AppError, AppResult};
use crate::services::audit;
use crate::AppState;

#[derive(serde::Serialize)]
pub struct AcceptedUpload {
    pub id: String,
    pub status: &'static str,
}

pub async fn upload(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    mut multipart: Multipart,
) -> AppResult<(axum::http::StatusCode, Json<AcceptedUpload>)> {
    let mut redis = state.redis.clone();
    let decision = ratelimit::check(&mut redis, &UPLOAD_PER_USER, &principal.user_id).await;
    if !decision.allowed {
        return Err(AppError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_secs: decision.reset_secs,
        });
    }

    let mut filename = String::new();
    let mut bytes: Option<Vec<u8>> = None;
    let mut visibility = Visibility::Private;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                filename = field.file_name().unwrap_or("upload").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("failed to read file field: {e}")))?;
                bytes = Some(data.to_vec());
            }
            "visibility" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("invalid visibility field: {e}")))?;
                visibility = Visibility::parse(&text)
                    .ok_or_else(|| AppError::Validation(format!("unknown visibility: {text}")))?;
            }
            _ => {}
        }
    }

    let bytes = bytes.ok_or_else(|| AppError::Validation("missing file field".into()))?;

    let image = state
        .upload_orchestrator
        .accept_upload(&principal.user_id, &filename, visibility, bytes)
        .await?;

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(AcceptedUpload {
            id: image.id,
            status: "pending",
        }),
    ))
}

pub async fn get_one(
    State(state): State<AppState>,
    principal: Option<Extension<Principal>>,
    Path(id): Path<String>,
) -> AppResult<Json<ImageAggregate>> {
    let principal = principal.map(|Extension(p)| p);
    let aggregate = state.query_orchestrator.get_image(principal.as_ref(), &id).await?;
    Ok(Json(aggregate))
}

#[derive(serde::Deserialize)]
pub struct ListParams {
    pub owner: Option<String>,
    pub q: Option<String>,
    pub tag: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    principal: Option<Extension<Principal>>,
    Query(filters): Query<ListParams>,
    Query(pagination): Query<PaginationParams>,
) -> AppResult<Json<PaginatedResponse<ImageAggregate>>> {
    let principal = principal.map(|Extension(p)| p);

    let page = if let Some(text) = filters.q.filter(|t| !t.trim().is_empty()) {
        state.query_orchestrator.search(&text, &pagination).await?
    } else if let Some(tag) = filters.tag.filter(|t| !t.trim().is_empty()) {
        state.query_orchestrator.list_by_tag(&tag, &pagination).await?
    } else if let Some(owner) = filters.owner {
        let principal = principal.as_ref().ok_or(AppError::Unauthenticated)?;
        if principal.user_id != owner && !is_moderator_or_admin(principal) {
            return Err(AppError::Forbidden);
        }
        state.query_orchestrator.list_owned(&owner, &pagination).await?
    } else {
        state.query_orchestrator.list_public(&pagination).await?
    };

    Ok(Json(page))
}

fn is_moderator_or_admin(principal: &Principal) -> bool {
    matches!(principal.role.as_str(), "moderator" | "admin")
}

pub async fn update(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(input): Json<UpdateImageInput>,
) -> AppResult<axum::http::StatusCode> {
    let existing = images::find_by_id(&state.db, &id).await?.ok_or(AppError::NotFound)?;
    authorize_owner_or_role(&principal, &existing.owner_id, true)?;

    let visibility = input
        .visibility
        .map(|v| Visibility::parse(&v).ok_or_else(|| AppError::Validation(format!("unknown visibility: {v}"))))
        .transpose()?;

    images::update_metadata(&state.db, &id, input.title, input.description, visibility).await?;
    if let Some(tags) = input.tags {
        images::set_image_tags(&state.db, &id, &tags).await?;
    }

    audit::log_action(
        &state.db,
        &principal.user_id,
        "update",
        "image",
        &id,
        &serde_json::json!({}),
    )
    .await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult<axum::http::StatusCode> {
    let existing = images::find_by_id(&state.db, &id).await?.ok_or(AppError::NotFound)?;
    authorize_owner_or_role(&principal, &existing.owner_id, true)?;

    images::soft_delete(&state.db, &id).await?;

    audit::log_action(
        &state.db,
        &principal.user_id,
        "delete",
        "image",
        &id,
        &serde_json::json!({}),
    )
    .await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}
