//! Background maintenance: spawns a long-lived tokio task that wakes up on
//! a fixed interval and runs a handful of independent sweeps, mirroring the
//! teacher's `tasks::spawn_background_tasks` shape (SPEC_FULL §4.13).
//!
//! Each sweep is independent — a failure in one logs and returns early, the
//! next tick (60s later) retries cleanly rather than wedging the whole loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use sqlx::SqlitePool;

use crate::catalog::images;
use crate::queue::{self, SCAN_QUEUE, TRANSCODE_QUEUE};
use crate::storage::{object_key, ObjectStore};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Orphan blobs are reclaimed only once their image row has sat in
/// `failed`/`deleted` for this long — recent rows might still be mid-retry
/// at the task layer (spec §9: "periodic reaper task ... older than a grace
/// window (e.g., 24h)").
const ORPHAN_GRACE: ChronoDuration = ChronoDuration::hours(24);

pub fn spawn_background_tasks(pool: SqlitePool, redis: ConnectionManager, storage: Arc<dyn ObjectStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            run_scheduled_tasks(&pool, &redis, storage.as_ref()).await;
        }
    });
}

async fn run_scheduled_tasks(pool: &SqlitePool, redis: &ConnectionManager, storage: &dyn ObjectStore) {
    if let Err(e) = reap_orphaned_images(pool, storage).await {
        tracing::error!("orphan blob reaper failed: {e}");
    }
    if let Err(e) = prune_expired_refresh_tokens(pool).await {
        tracing::error!("refresh token pruning failed: {e}");
    }
    let mut redis = redis.clone();
    for queue_name in [SCAN_QUEUE, TRANSCODE_QUEUE] {
        match queue::reclaim_expired(&mut redis, queue_name).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(queue = queue_name, recovered = n, "reclaimed expired in-flight tasks"),
            Err(e) => tracing::error!(queue = queue_name, "failed to reclaim expired tasks: {e}"),
        }
    }
}

/// Deletes the source and variant blobs belonging to images that crashed
/// between a blob write and the catalog commit finalizing them (spec §5:
/// "the blob is orphaned and reclaimed by a later sweep — specified as
/// acceptable temporary garbage, not an invariant violation"), then removes
/// the now-useless catalog rows for anything past the grace window.
async fn reap_orphaned_images(pool: &SqlitePool, storage: &dyn ObjectStore) -> sqlx::Result<()> {
    let cutoff = Utc::now() - ORPHAN_GRACE;

    let candidates = sqlx::query_as::<_, crate::db::models::Image>(
        "SELECT id, owner_id, title, description, original_filename, format, width, height,
                byte_size, visibility, status, scan_status, infected_signature,
                created_at, updated_at, deleted_at
         FROM images
         WHERE (status IN ('failed', 'infected') OR deleted_at IS NOT NULL)
           AND updated_at < ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    if candidates.is_empty() {
        return Ok(());
    }

    let ids: Vec<String> = candidates.iter().map(|i| i.id.clone()).collect();
    let variants_by_image = images::fetch_variants_for(pool, &ids).await.unwrap_or_default();

    let mut reaped = 0u64;
    for image in &candidates {
        let _ = storage.delete(&object_key(&image.id, "source")).await;
        if let Some(variants) = variants_by_image.get(&image.id) {
            for variant in variants {
                let _ = storage.delete(&variant.storage_key).await;
            }
        }
        sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(&image.id)
            .execute(pool)
            .await?;
        reaped += 1;
    }

    tracing::info!(reaped, "reaped orphaned image blobs and catalog rows");
    Ok(())
}

/// Keeps `refresh_tokens` from growing without bound — a token past its
/// `expires_at` can never redeem successfully, so there's no reason to keep
/// the row once a family-revocation audit trail is no longer useful.
async fn prune_expired_refresh_tokens(pool: &SqlitePool) -> sqlx::Result<()> {
    let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    if result.rows_affected() > 0 {
        tracing::info!(count = result.rows_affected(), "pruned expired refresh tokens");
    }
    Ok(())
}
