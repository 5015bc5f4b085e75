//! Image + variant + tag persistence.
//!
//! Listing reads follow the batch protocol mandated by spec §4.5: one query
//! for the page of image rows, one query that fetches every variant whose
//! `image_id` is in that page's id set, one analogous query for tags. The
//! repository assembles `ImageAggregate`s in memory; callers never trigger a
//! per-row follow-up query (P8). A separate `COUNT(*)` query supplies the
//! pagination total — its cost doesn't grow with the page size N, so it
//! doesn't reintroduce the N+1 pattern the 3-query protocol guards against.

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::models::{Image, ImageAggregate, ImageStatus, Variant, VariantKind, Visibility};
use crate::error::{AppError, AppResult};

pub struct NewImage<'a> {
    pub id: &'a str,
    pub owner_id: &'a str,
    pub original_filename: &'a str,
    pub format: &'a str,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub visibility: Visibility,
}

pub async fn create_pending(pool: &SqlitePool, input: NewImage<'_>) -> AppResult<Image> {
    sqlx::query(
        "INSERT INTO images
            (id, owner_id, original_filename, format, width, height, byte_size,
             visibility, status, scan_status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 'pending')",
    )
    .bind(input.id)
    .bind(input.owner_id)
    .bind(input.original_filename)
    .bind(input.format)
    .bind(input.width as i64)
    .bind(input.height as i64)
    .bind(input.byte_size as i64)
    .bind(input.visibility.as_str())
    .execute(pool)
    .await?;

    find_by_id(pool, input.id).await?.ok_or(AppError::NotFound)
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Image>> {
    let image = sqlx::query_as::<_, Image>(
        "SELECT id, owner_id, title, description, original_filename, format, width, height,
                byte_size, visibility, status, scan_status, infected_signature,
                created_at, updated_at, deleted_at
         FROM images WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(image)
}

/// Loads a single image together with its variants and tags — the same
/// 3-query protocol as listings, just with a one-row "page".
pub async fn find_aggregate_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<ImageAggregate>> {
    let Some(image) = find_by_id(pool, id).await? else {
        return Ok(None);
    };
    let ids = [image.id.clone()];
    let mut variants_by_image = fetch_variants_for(pool, &ids).await?;
    let mut tags_by_image = fetch_tags_for(pool, &ids).await?;
    let variants = variants_by_image.remove(&image.id).unwrap_or_default();
    let tags = tags_by_image.remove(&image.id).unwrap_or_default();
    Ok(Some(ImageAggregate {
        image,
        variants,
        tags,
    }))
}

/// Page of publicly visible images: `status = active AND visibility IN
/// (public, unlisted)`. Per spec §4.12, unlisted images are reachable only
/// by direct id, never through a listing — so this function excludes them
/// too despite the invariant in §3 reading "visibility != private".
pub async fn list_public(pool: &SqlitePool, offset: u32, limit: u32) -> AppResult<(Vec<Image>, i64)> {
    let rows = sqlx::query_as::<_, Image>(
        "SELECT id, owner_id, title, description, original_filename, format, width, height,
                byte_size, visibility, status, scan_status, infected_signature,
                created_at, updated_at, deleted_at
         FROM images
         WHERE status = 'active' AND visibility = 'public' AND deleted_at IS NULL
         ORDER BY created_at DESC
         LIMIT ? OFFSET ?",
    )
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM images
         WHERE status = 'active' AND visibility = 'public' AND deleted_at IS NULL",
    )
    .fetch_one(pool)
    .await?;

    Ok((rows, total))
}

/// Page of everything a given owner has uploaded, any status/visibility —
/// the owner always sees their own pending/scanning/failed/infected rows.
pub async fn list_by_owner(
    pool: &SqlitePool,
    owner_id: &str,
    offset: u32,
    limit: u32,
) -> AppResult<(Vec<Image>, i64)> {
    let rows = sqlx::query_as::<_, Image>(
        "SELECT id, owner_id, title, description, original_filename, format, width, height,
                byte_size, visibility, status, scan_status, infected_signature,
                created_at, updated_at, deleted_at
         FROM images
         WHERE owner_id = ? AND deleted_at IS NULL
         ORDER BY created_at DESC
         LIMIT ? OFFSET ?",
    )
    .bind(owner_id)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM images WHERE owner_id = ? AND deleted_at IS NULL",
    )
    .bind(owner_id)
    .fetch_one(pool)
    .await?;

    Ok((rows, total))
}

/// Page of active, publicly-listable images carrying a given tag.
pub async fn list_by_tag(pool: &SqlitePool, tag: &str, offset: u32, limit: u32) -> AppResult<(Vec<Image>, i64)> {
    let rows = sqlx::query_as::<_, Image>(
        "SELECT i.id, i.owner_id, i.title, i.description, i.original_filename, i.format,
                i.width, i.height, i.byte_size, i.visibility, i.status, i.scan_status,
                i.infected_signature, i.created_at, i.updated_at, i.deleted_at
         FROM images i
         JOIN image_tags it ON it.image_id = i.id
         JOIN tags t ON t.id = it.tag_id
         WHERE t.name = ? AND i.status = 'active' AND i.visibility = 'public' AND i.deleted_at IS NULL
         ORDER BY i.created_at DESC
         LIMIT ? OFFSET ?",
    )
    .bind(tag)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*)
         FROM images i
         JOIN image_tags it ON it.image_id = i.id
         JOIN tags t ON t.id = it.tag_id
         WHERE t.name = ? AND i.status = 'active' AND i.visibility = 'public' AND i.deleted_at IS NULL",
    )
    .bind(tag)
    .fetch_one(pool)
    .await?;

    Ok((rows, total))
}

/// Full-text search over title/description via the `images_fts` virtual
/// table (spec §4.5: "must not compute the vector at query time" — FTS5
/// maintains its own index incrementally via the triggers in the migration).
pub async fn search(pool: &SqlitePool, text: &str, offset: u32, limit: u32) -> AppResult<(Vec<Image>, i64)> {
    if text.trim().is_empty() {
        return Ok((Vec::new(), 0));
    }
    let fts_query = format!("{}*", text.trim());

    let rows = sqlx::query_as::<_, Image>(
        "SELECT i.id, i.owner_id, i.title, i.description, i.original_filename, i.format,
                i.width, i.height, i.byte_size, i.visibility, i.status, i.scan_status,
                i.infected_signature, i.created_at, i.updated_at, i.deleted_at
         FROM images_fts
         JOIN images i ON i.rowid = images_fts.rowid
         WHERE images_fts MATCH ?
           AND i.status = 'active' AND i.visibility = 'public' AND i.deleted_at IS NULL
         ORDER BY bm25(images_fts)
         LIMIT ? OFFSET ?",
    )
    .bind(&fts_query)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*)
         FROM images_fts
         JOIN images i ON i.rowid = images_fts.rowid
         WHERE images_fts MATCH ?
           AND i.status = 'active' AND i.visibility = 'public' AND i.deleted_at IS NULL",
    )
    .bind(&fts_query)
    .fetch_one(pool)
    .await?;

    Ok((rows, total))
}

/// Second query of the 3-query listing protocol: every variant whose
/// `image_id` is in `ids`, grouped by image id. Empty `ids` short-circuits
/// without touching the database.
pub async fn fetch_variants_for(pool: &SqlitePool, ids: &[String]) -> AppResult<HashMap<String, Vec<Variant>>> {
    let mut map: HashMap<String, Vec<Variant>> = HashMap::new();
    if ids.is_empty() {
        return Ok(map);
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, image_id, kind, storage_key, width, height, byte_size, format
         FROM image_variants WHERE image_id IN (",
    );
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    qb.push(")");

    let rows = qb.build_query_as::<Variant>().fetch_all(pool).await?;
    for variant in rows {
        map.entry(variant.image_id.clone()).or_default().push(variant);
    }
    Ok(map)
}

/// Third query of the 3-query listing protocol: every tag name attached to
/// an image in `ids`, grouped by image id, ordered by join-table position.
pub async fn fetch_tags_for(pool: &SqlitePool, ids: &[String]) -> AppResult<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    if ids.is_empty() {
        return Ok(map);
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT it.image_id AS image_id, t.name AS name
         FROM image_tags it
         JOIN tags t ON t.id = it.tag_id
         WHERE it.image_id IN (",
    );
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    qb.push(") ORDER BY it.position ASC");

    let rows: Vec<(String, String)> = qb
        .build_query_as::<(String, String)>()
        .fetch_all(pool)
        .await?;
    for (image_id, name) in rows {
        map.entry(image_id).or_default().push(name);
    }
    Ok(map)
}

/// Assembles `ImageAggregate`s from a page of `Image` rows using exactly the
/// two batch queries above — never one query per row.
pub async fn load_aggregates(pool: &SqlitePool, images: Vec<Image>) -> AppResult<Vec<ImageAggregate>> {
    let ids: Vec<String> = images.iter().map(|i| i.id.clone()).collect();
    let mut variants_by_image = fetch_variants_for(pool, &ids).await?;
    let mut tags_by_image = fetch_tags_for(pool, &ids).await?;

    Ok(images
        .into_iter()
        .map(|image| {
            let variants = variants_by_image.remove(&image.id).unwrap_or_default();
            let tags = tags_by_image.remove(&image.id).unwrap_or_default();
            ImageAggregate {
                image,
                variants,
                tags,
            }
        })
        .collect())
}

/// Attaches a set of tag names to an image, creating any tag rows that don't
/// already exist. Position reflects the order the caller supplied.
pub async fn set_image_tags(pool: &SqlitePool, image_id: &str, tag_names: &[String]) -> AppResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM image_tags WHERE image_id = ?")
        .bind(image_id)
        .execute(&mut *tx)
        .await?;

    for (position, name) in tag_names.iter().enumerate() {
        let tag_id = sqlx::query_scalar::<_, String>(
            "INSERT INTO tags (id, name) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET name = excluded.name
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO image_tags (image_id, tag_id, position) VALUES (?, ?, ?)")
            .bind(image_id)
            .bind(&tag_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn update_metadata(
    pool: &SqlitePool,
    id: &str,
    title: Option<String>,
    description: Option<String>,
    visibility: Option<Visibility>,
) -> AppResult<()> {
    let existing = find_by_id(pool, id).await?.ok_or(AppError::NotFound)?;
    let title = title.unwrap_or(existing.title);
    let description = description.unwrap_or(existing.description);
    let visibility = visibility.map(|v| v.as_str().to_string()).unwrap_or(existing.visibility);

    sqlx::query(
        "UPDATE images SET title = ?, description = ?, visibility = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?",
    )
    .bind(title)
    .bind(description)
    .bind(visibility)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_status(pool: &SqlitePool, id: &str, status: ImageStatus) -> AppResult<()> {
    sqlx::query(
        "UPDATE images SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_infected(pool: &SqlitePool, id: &str, signature_name: &str) -> AppResult<()> {
    sqlx::query(
        "UPDATE images
         SET status = 'infected', scan_status = 'infected', infected_signature = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?",
    )
    .bind(signature_name)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_scan_clean(pool: &SqlitePool, id: &str) -> AppResult<()> {
    sqlx::query(
        "UPDATE images SET scan_status = 'clean', updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND scan_status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Transactionally writes every variant row and flips the image to `active`
/// in a single commit (spec §4.5: "Transactional save of image + variants").
/// Called by whichever of {scan, transcode} completes last, gated by the
/// caller having already confirmed scan-clean — the `WHERE scan_status =
/// 'clean'` compare-and-set is what makes the two-task race in spec §4.11
/// safe without an explicit lock.
pub async fn finalize_active(
    pool: &SqlitePool,
    image_id: &str,
    variants: &[(VariantKind, String, u32, u32, u64, String)],
) -> AppResult<bool> {
    let mut tx = pool.begin().await?;

    for (kind, storage_key, width, height, byte_size, format) in variants {
        sqlx::query(
            "INSERT INTO image_variants (id, image_id, kind, storage_key, width, height, byte_size, format)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(image_id, kind) DO UPDATE SET
                storage_key = excluded.storage_key,
                width = excluded.width,
                height = excluded.height,
                byte_size = excluded.byte_size,
                format = excluded.format",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(image_id)
        .bind(kind.as_str())
        .bind(storage_key)
        .bind(*width as i64)
        .bind(*height as i64)
        .bind(*byte_size as i64)
        .bind(format)
        .execute(&mut *tx)
        .await?;
    }

    let result = sqlx::query(
        "UPDATE images SET status = 'active', updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND scan_status = 'clean' AND status != 'active'",
    )
    .bind(image_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// Attempts the `active` transition for an image whose variants were already
/// stored by a transcode task that won the race against this scan task —
/// the scan handler calls this after marking `scan_status = 'clean'` so that
/// whichever of {scan, transcode} finishes last is the one that flips the
/// row to `active` (spec §4.11). No-op (returns `false`) if the required
/// variant set isn't fully stored yet; the eventual transcode completion
/// will perform the transition itself via `finalize_active`.
pub async fn try_activate(pool: &SqlitePool, image_id: &str) -> AppResult<bool> {
    let variant_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM image_variants WHERE image_id = ? AND kind != 'original'",
    )
    .bind(image_id)
    .fetch_one(pool)
    .await?;
    if variant_count < VariantKind::derived_kinds().len() as i64 {
        return Ok(false);
    }

    let result = sqlx::query(
        "UPDATE images SET status = 'active', updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND scan_status = 'clean' AND status != 'active'",
    )
    .bind(image_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn soft_delete(pool: &SqlitePool, id: &str) -> AppResult<()> {
    // Idempotent: re-deleting an already-deleted image is a no-op success.
    sqlx::query(
        "UPDATE images SET status = 'deleted', deleted_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
