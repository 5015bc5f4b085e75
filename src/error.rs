use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

/// Error kinds surfaced to API clients, mapped 1:1 onto the `problem+json`
/// `type`/`status` pair documented in spec §7.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Unauthenticated")]
    Unauthenticated,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Unsupported format")]
    UnsupportedFormat,
    #[error("Image too large: {0}")]
    ImageTooLarge(String),
    #[error("Malware detected: {0}")]
    MalwareDetected(String),
    #[error("Scan unavailable")]
    ScanUnavailable,
    #[error("Rate limited")]
    RateLimited { limit: u64, remaining: u64, reset_secs: u64 },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn problem_type(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::PayloadTooLarge => "payload_too_large",
            AppError::UnsupportedFormat => "unsupported_format",
            AppError::ImageTooLarge(_) => "image_too_large",
            AppError::MalwareDetected(_) => "malware_detected",
            AppError::ScanUnavailable => "scan_unavailable",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::Database(_) | AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::ImageTooLarge(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::MalwareDetected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ScanUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Detail text shown to the client. Internal/database errors never leak
    /// their real message — only the trace id is surfaced, the full error is
    /// logged server-side in `into_response`.
    fn detail(&self) -> Option<String> {
        match self {
            AppError::Validation(m)
            | AppError::Conflict(m)
            | AppError::ImageTooLarge(m)
            | AppError::MalwareDetected(m) => Some(m.clone()),
            AppError::Database(_) | AppError::Internal(_) => None,
            _ => None,
        }
    }

    /// Client-facing title. Unlike `Display`, this never embeds the wrapped
    /// message for `Database`/`Internal` — those can carry SQL fragments or
    /// file paths that must not leave the server (spec §7).
    fn title(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let trace_id = Uuid::new_v4().to_string();
        let status = self.status();

        match &self {
            AppError::Database(e) => {
                tracing::error!(trace_id, "database error: {:?}", e);
            }
            AppError::Internal(m) => {
                tracing::error!(trace_id, "internal error: {}", m);
            }
            AppError::MalwareDetected(sig) => {
                tracing::error!(trace_id, signature = %sig, "malware detected in upload");
            }
            _ => {}
        }

        let title = self.title();
        let rate_limit = match &self {
            AppError::RateLimited { limit, remaining, reset_secs } => Some((*limit, *remaining, *reset_secs)),
            _ => None,
        };
        let body = json!({
            "type": format!("https://errors.imgvault.dev/{}", self.problem_type()),
            "title": title,
            "status": status.as_u16(),
            "detail": self.detail(),
            "instance": serde_json::Value::Null,
            "errors": serde_json::Value::Null,
            "traceId": trace_id,
        });

        let mut response = (status, Json(body)).into_response();

        // spec §4.7: a 429 carries all four of {limit, remaining, reset,
        // retry-after}, not just retry-after — a client needs limit/remaining
        // to back off proactively rather than learning its budget by
        // exhausting it.
        if let Some((limit, remaining, reset_secs)) = rate_limit {
            let headers = response.headers_mut();
            for (name, value) in [
                ("limit", limit.to_string()),
                ("remaining", remaining.to_string()),
                ("reset", reset_secs.to_string()),
                ("retry-after", reset_secs.to_string()),
            ] {
                if let Ok(value) = axum::http::HeaderValue::from_str(&value) {
                    headers.insert(name, value);
                }
            }
        }

        response
    }
}

/// Outermost middleware: captures the request path before dispatch and, for
/// any error response carrying a null `instance` field (spec §6's
/// problem-details body), rewrites it to the actual request path. `AppError`
/// can't populate `instance` itself — `into_response` only ever sees `self`,
/// not the request it's responding to.
pub async fn populate_instance(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    if !response.status().is_client_error() && !response.status().is_server_error() {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, 1024 * 1024).await else {
        return Response::from_parts(parts, axum::body::Body::empty());
    };
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return Response::from_parts(parts, axum::body::Body::from(bytes));
    };

    if let Some(obj) = value.as_object_mut() {
        if obj.get("instance").map(|v| v.is_null()).unwrap_or(false) {
            obj.insert("instance".to_string(), serde_json::Value::String(path));
        }
    }

    let new_bytes = serde_json::to_vec(&value).unwrap_or_else(|_| bytes.to_vec());
    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    Response::from_parts(parts, axum::body::Body::from(new_bytes))
}

pub type AppResult<T> = Result<T, AppError>;
