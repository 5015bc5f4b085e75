//! Worker pool (C10): parallel workers pulling tasks from named queues with
//! bounded concurrency per queue. No HTTP coupling — `WorkerDeps` carries
//! only the catalog pool, the shared key-value store, and the storage/
//! scanner/transcoder ports the two task handlers need.

use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use sqlx::SqlitePool;
use tokio::sync::watch;

use crate::catalog::images;
use crate::db::models::ImageStatus;
use crate::media::transcoder::Transcoder;
use crate::queue::{self, Task, SCAN_QUEUE, TRANSCODE_QUEUE};
use crate::scanner::{MalwareScanner, ScanOutcome};
use crate::services::audit;
use crate::storage::{object_key, ObjectStore};

const EMPTY_QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct WorkerDeps {
    pub pool: SqlitePool,
    pub redis: ConnectionManager,
    pub storage: Arc<dyn ObjectStore>,
    pub scanner: Arc<dyn MalwareScanner>,
    pub transcoder: Arc<Transcoder>,
}

/// Spawns `concurrency` workers per queue. Returns a `watch::Sender<bool>`
/// the caller can set to `true` to request graceful shutdown — in-flight
/// handlers are allowed to finish their current task before a worker exits.
pub fn spawn(deps: WorkerDeps, concurrency: usize) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for queue_name in [SCAN_QUEUE, TRANSCODE_QUEUE] {
        for worker_index in 0..concurrency {
            let deps = deps.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                tracing::info!(queue = queue_name, worker = worker_index, "worker started");
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        result = run_one(&deps, queue_name) => {
                            match result {
                                Ok(true) => {}
                                Ok(false) => tokio::time::sleep(EMPTY_QUEUE_POLL_INTERVAL).await,
                                Err(e) => tracing::error!(queue = queue_name, "worker loop error: {e}"),
                            }
                        }
                    }
                }
                tracing::info!(queue = queue_name, worker = worker_index, "worker stopped");
            });
        }
    }

    shutdown_tx
}

/// Dequeues and dispatches a single task. Returns `Ok(true)` if a task was
/// processed, `Ok(false)` if the queue was empty.
async fn run_one(deps: &WorkerDeps, queue_name: &'static str) -> redis::RedisResult<bool> {
    let mut redis = deps.redis.clone();
    let Some(task) = queue::dequeue(&mut redis, queue_name).await? else {
        return Ok(false);
    };

    let started = Instant::now();
    let attempt = task.attempt;
    let task_id = task.id.clone();
    let task_type = task.task_type.clone();

    let outcome = match queue_name {
        SCAN_QUEUE => handle_scan(deps, &task).await,
        TRANSCODE_QUEUE => handle_transcode(deps, &task).await,
        _ => Err(crate::error::AppError::Internal(format!("unknown queue {queue_name}"))),
    };

    let duration = started.elapsed();
    match outcome {
        Ok(()) => {
            tracing::info!(
                task_type, task_id, attempt, duration_ms = duration.as_millis() as u64,
                "task completed"
            );
            queue::ack(&mut redis, queue_name, &task.id).await?;
        }
        Err(e) => {
            tracing::warn!(
                task_type, task_id, attempt, duration_ms = duration.as_millis() as u64,
                "task failed: {e}"
            );
            queue::fail(&mut redis, queue_name, task).await?;
        }
    }

    Ok(true)
}

async fn handle_scan(deps: &WorkerDeps, task: &Task) -> crate::error::AppResult<()> {
    let image_id = task
        .payload
        .get("image_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::error::AppError::Internal("scan task missing image_id".into()))?;

    let source_key = object_key(image_id, "source");
    let bytes = deps
        .storage
        .get(&source_key)
        .await
        .map_err(|e| crate::error::AppError::Internal(format!("failed to fetch source for scan: {e}")))?;

    match deps.scanner.scan(&bytes).await {
        ScanOutcome::Clean => {
            images::mark_scan_clean(&deps.pool, image_id).await?;
            images::mark_status(&deps.pool, image_id, ImageStatus::Scanning).await?;
            // Variants may already be stored if transcode won the race —
            // attempt the `active` transition here too (spec §4.11).
            let became_active = images::try_activate(&deps.pool, image_id).await?;
            if became_active {
                tracing::debug!(image_id, "scan-clean completed activation after transcode");
            }
            Ok(())
        }
        ScanOutcome::Infected { signature_name } => {
            images::mark_infected(&deps.pool, image_id, &signature_name).await?;
            let _ = deps.storage.delete(&source_key).await;
            audit::log_action(
                &deps.pool,
                "system",
                "scan",
                "image",
                image_id,
                &serde_json::json!({ "result": "infected", "signature": signature_name }),
            )
            .await;
            Ok(())
        }
        ScanOutcome::Error { kind } => Err(crate::error::AppError::Internal(format!(
            "scan unavailable: {kind:?}"
        ))),
    }
}

async fn handle_transcode(deps: &WorkerDeps, task: &Task) -> crate::error::AppResult<()> {
    let image_id = task
        .payload
        .get("image_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::error::AppError::Internal("transcode task missing image_id".into()))?;
    let format_name = task
        .payload
        .get("format")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::error::AppError::Internal("transcode task missing format".into()))?;
    let detected_format = image::ImageFormat::from_extension(format_name)
        .ok_or_else(|| crate::error::AppError::Internal(format!("unrecognized format {format_name}")))?;

    let source_key = object_key(image_id, "source");
    let bytes = deps
        .storage
        .get(&source_key)
        .await
        .map_err(|e| crate::error::AppError::Internal(format!("failed to fetch source for transcode: {e}")))?;

    let output = deps.transcoder.process(bytes, detected_format).await?;

    let mut rows = Vec::with_capacity(output.variants.len());
    for variant in output.variants {
        let key = object_key(image_id, &format!("{}.{}", variant.kind.as_str(), variant.format));
        deps.storage
            .put(&key, variant.bytes.clone())
            .await
            .map_err(|e| crate::error::AppError::Internal(format!("failed to store variant: {e}")))?;
        rows.push((
            variant.kind,
            key,
            variant.width,
            variant.height,
            variant.bytes.len() as u64,
            variant.format.to_string(),
        ));
    }
    let became_active = images::finalize_active(&deps.pool, image_id, &rows).await?;
    if !became_active {
        tracing::debug!(image_id, "variants stored but scan not yet clean; activation deferred");
    }

    Ok(())
}
