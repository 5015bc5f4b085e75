//! Upload orchestrator (C11). The synchronous portion blocks the client
//! just long enough to validate and persist a pending row; everything
//! required to reach `active` happens in the worker pool (spec §4.11).

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::catalog::images::{self, NewImage};
use crate::db::models::{Image, ImageStatus, Visibility};
use crate::error::{AppError, AppResult};
use crate::queue::{self, SCAN_QUEUE, TRANSCODE_QUEUE};
use crate::services::audit;
use crate::storage::{object_key, ObjectStore};
use crate::validation::UploadValidator;

pub struct UploadOrchestrator {
    pool: SqlitePool,
    redis: ConnectionManager,
    storage: Arc<dyn ObjectStore>,
    validator: Arc<UploadValidator>,
}

impl UploadOrchestrator {
    pub fn new(
        pool: SqlitePool,
        redis: ConnectionManager,
        storage: Arc<dyn ObjectStore>,
        validator: Arc<UploadValidator>,
    ) -> Self {
        UploadOrchestrator {
            pool,
            redis,
            storage,
            validator,
        }
    }

    /// Runs the full synchronous path: validate, persist, store, enqueue.
    /// A validator rejection leaves no trace (no row, no blob, no task) —
    /// the request is safe to retry unchanged.
    pub async fn accept_upload(
        &self,
        owner_id: &str,
        filename: &str,
        visibility: Visibility,
        bytes: Vec<u8>,
    ) -> AppResult<Image> {
        let validated = self.validator.validate(&bytes, filename).await?;

        let image_id = Uuid::new_v4().to_string();
        let format_label = format_label(validated.format);

        let image = images::create_pending(
            &self.pool,
            NewImage {
                id: &image_id,
                owner_id,
                original_filename: &validated.sanitized_filename,
                format: format_label,
                width: validated.width,
                height: validated.height,
                byte_size: bytes.len() as u64,
                visibility,
            },
        )
        .await?;

        let source_key = object_key(&image_id, "source");
        if let Err(e) = self.storage.put(&source_key, bytes).await {
            // Nothing downstream has been scheduled yet, so marking the row
            // failed is enough cleanup — no blob or task to unwind.
            images::mark_status(&self.pool, &image_id, ImageStatus::Failed).await?;
            return Err(AppError::Internal(format!("failed to store upload: {e}")));
        }

        let mut redis = self.redis.clone();
        let payload = serde_json::json!({ "image_id": image_id, "format": format_label });

        if let Err(e) = queue::enqueue(&mut redis, SCAN_QUEUE, "scan", payload.clone()).await {
            images::mark_status(&self.pool, &image_id, ImageStatus::Failed).await?;
            return Err(AppError::Internal(format!("failed to enqueue scan task: {e}")));
        }
        if let Err(e) = queue::enqueue(&mut redis, TRANSCODE_QUEUE, "transcode", payload).await {
            images::mark_status(&self.pool, &image_id, ImageStatus::Failed).await?;
            return Err(AppError::Internal(format!("failed to enqueue transcode task: {e}")));
        }

        audit::log_action(
            &self.pool,
            owner_id,
            "upload",
            "image",
            &image_id,
            &serde_json::json!({ "filename": validated.sanitized_filename, "byte_size": image.byte_size }),
        )
        .await;

        Ok(image)
    }
}

fn format_label(format: image::ImageFormat) -> &'static str {
    match format {
        image::ImageFormat::Jpeg => "jpeg",
        image::ImageFormat::Png => "png",
        image::ImageFormat::Gif => "gif",
        image::ImageFormat::WebP => "webp",
        _ => "unknown",
    }
}
