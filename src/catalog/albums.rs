//! Album persistence: ordered image membership. Deleting an album removes
//! its membership rows (`ON DELETE CASCADE` on `album_images`) but never
//! the images themselves — an album is a view over images, not their owner.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::Album;
use crate::error::{AppError, AppResult};

pub async fn create(pool: &SqlitePool, owner_id: &str, title: &str) -> AppResult<Album> {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO albums (id, owner_id, title) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(owner_id)
        .bind(title)
        .execute(pool)
        .await?;

    find_by_id(pool, &id).await?.ok_or(AppError::Internal("album vanished after insert".into()))
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Album>> {
    let album = sqlx::query_as::<_, Album>(
        "SELECT id, owner_id, title, created_at, updated_at FROM albums WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(album)
}

pub async fn list_by_owner(pool: &SqlitePool, owner_id: &str) -> AppResult<Vec<Album>> {
    let albums = sqlx::query_as::<_, Album>(
        "SELECT id, owner_id, title, created_at, updated_at FROM albums
         WHERE owner_id = ? ORDER BY created_at DESC",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;
    Ok(albums)
}

/// Image ids belonging to an album, in membership order.
pub async fn list_image_ids(pool: &SqlitePool, album_id: &str) -> AppResult<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT image_id FROM album_images WHERE album_id = ? ORDER BY position ASC",
    )
    .bind(album_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Appends an image to the end of the album, deriving the next position
/// from the current max. Idempotent: re-adding an image already in the
/// album is a silent no-op rather than a duplicate row or an error.
pub async fn add_image(pool: &SqlitePool, album_id: &str, image_id: &str) -> AppResult<()> {
    let next_position = sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM album_images WHERE album_id = ?",
    )
    .bind(album_id)
    .fetch_one(pool)
    .await?;

    sqlx::query(
        "INSERT INTO album_images (album_id, image_id, position) VALUES (?, ?, ?)
         ON CONFLICT(album_id, image_id) DO NOTHING",
    )
    .bind(album_id)
    .bind(image_id)
    .bind(next_position)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn remove_image(pool: &SqlitePool, album_id: &str, image_id: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM album_images WHERE album_id = ? AND image_id = ?")
        .bind(album_id)
        .bind(image_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn rename(pool: &SqlitePool, album_id: &str, title: &str) -> AppResult<()> {
    sqlx::query(
        "UPDATE albums SET title = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
    )
    .bind(title)
    .bind(album_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, album_id: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM albums WHERE id = ?")
        .bind(album_id)
        .execute(pool)
        .await?;
    Ok(())
}
