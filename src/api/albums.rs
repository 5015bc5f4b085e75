//! Album endpoints (spec §4.5's "corresponding operations for albums"):
//! create/list/rename/delete an album, and manage its ordered image
//! membership. All operations are owner-gated — an album is private
//! bookkeeping over the owner's own images, not a shared resource.

use axum::extract::{Extension, Path, State};
use axum::Json;

use crate::auth::middleware::authorize_owner_or_role;
use crate::auth::tokens::Principal;
use crate::catalog::albums;
use crate::db::models::Album;
use crate::error::{AppError, AppResult};
use crate::AppState;

#[derive(serde::Deserialize)]
pub struct CreateAlbumInput {
    pub title: String,
}

#[derive(serde::Deserialize)]
pub struct RenameAlbumInput {
    pub title: String,
}

#[derive(serde::Deserialize)]
pub struct AlbumImageInput {
    pub image_id: String,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(input): Json<CreateAlbumInput>,
) -> AppResult<(axum::http::StatusCode, Json<Album>)> {
    if input.title.trim().is_empty() {
        return Err(AppError::Validation("title is required".into()));
    }
    let album = albums::create(&state.db, &principal.user_id, input.title.trim()).await?;
    Ok((axum::http::StatusCode::CREATED, Json(album)))
}

pub async fn list_mine(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> AppResult<Json<Vec<Album>>> {
    let albums = albums::list_by_owner(&state.db, &principal.user_id).await?;
    Ok(Json(albums))
}

async fn load_owned(state: &AppState, principal: &Principal, album_id: &str) -> AppResult<Album> {
    let album = albums::find_by_id(&state.db, album_id).await?.ok_or(AppError::NotFound)?;
    authorize_owner_or_role(principal, &album.owner_id, false)?;
    Ok(album)
}

#[derive(serde::Serialize)]
pub struct AlbumWithImages {
    #[serde(flatten)]
    pub album: Album,
    pub image_ids: Vec<String>,
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(album_id): Path<String>,
) -> AppResult<Json<AlbumWithImages>> {
    let album = load_owned(&state, &principal, &album_id).await?;
    let image_ids = albums::list_image_ids(&state.db, &album_id).await?;
    Ok(Json(AlbumWithImages { album, image_ids }))
}

pub async fn rename(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(album_id): Path<String>,
    Json(input): Json<RenameAlbumInput>,
) -> AppResult<axum::http::StatusCode> {
    load_owned(&state, &principal, &album_id).await?;
    if input.title.trim().is_empty() {
        return Err(AppError::Validation("title is required".into()));
    }
    albums::rename(&state.db, &album_id, input.title.trim()).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(album_id): Path<String>,
) -> AppResult<axum::http::StatusCode> {
    load_owned(&state, &principal, &album_id).await?;
    albums::delete(&state.db, &album_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn add_image(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(album_id): Path<String>,
    Json(input): Json<AlbumImageInput>,
) -> AppResult<axum::http::StatusCode> {
    load_owned(&state, &principal, &album_id).await?;
    crate::catalog::images::find_by_id(&state.db, &input.image_id)
        .await?
        .ok_or(AppError::NotFound)?;
    albums::add_image(&state.db, &album_id, &input.image_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn remove_image(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((album_id, image_id)): Path<(String, String)>,
) -> AppResult<axum::http::StatusCode> {
    load_owned(&state, &principal, &album_id).await?;
    albums::remove_image(&state.db, &album_id, &image_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
