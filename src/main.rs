use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use redis::aio::ConnectionManager;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use imgvault::auth::tokens::TokenService;
use imgvault::config::Config;
use imgvault::media::transcoder::Transcoder;
use imgvault::queue::worker::WorkerDeps;
use imgvault::scanner::clamav::ClamAvScanner;
use imgvault::scanner::MalwareScanner;
use imgvault::services::query::QueryOrchestrator;
use imgvault::services::upload::UploadOrchestrator;
use imgvault::storage::local::LocalObjectStore;
use imgvault::storage::ObjectStore;
use imgvault::validation::UploadValidator;
use imgvault::{api, db, queue, storage, tasks, AppState};

/// Pool size by environment, per spec §5: 25 in development, 100 in
/// production. `RUST_ENV=production` opts into the larger pool.
fn pool_size() -> u32 {
    match std::env::var("RUST_ENV").as_deref() {
        Ok("production") => 100,
        _ => 25,
    }
}

async fn build_object_store(config: &Config) -> Arc<dyn ObjectStore> {
    match config.storage_provider.as_str() {
        "local" => Arc::new(LocalObjectStore::new(config.uploads_dir.clone())),
        #[cfg(feature = "storage-s3")]
        "s3" | "spaces" | "b2" => {
            let endpoint = config
                .storage_endpoint
                .as_deref()
                .unwrap_or_else(|| panic!("STORAGE_ENDPOINT is required for storage_provider={}", config.storage_provider));
            let region = config.storage_region.as_deref().unwrap_or("us-east-1");
            let access_key = config
                .storage_access_key
                .as_deref()
                .unwrap_or_else(|| panic!("STORAGE_ACCESS_KEY is required for storage_provider={}", config.storage_provider));
            let secret_key = config
                .storage_secret_key
                .as_deref()
                .unwrap_or_else(|| panic!("STORAGE_SECRET_KEY is required for storage_provider={}", config.storage_provider));
            let bucket = config
                .storage_bucket
                .as_deref()
                .unwrap_or_else(|| panic!("STORAGE_BUCKET is required for storage_provider={}", config.storage_provider));
            Arc::new(storage::s3::S3ObjectStore::new(endpoint, region, access_key, secret_key, bucket).await)
        }
        #[cfg(not(feature = "storage-s3"))]
        "s3" | "spaces" | "b2" => {
            panic!("storage_provider={} requires the storage-s3 feature", config.storage_provider)
        }
        other => panic!("unknown storage_provider: {other}"),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if config.storage_provider == "local" {
        std::fs::create_dir_all(&config.uploads_dir).unwrap_or_else(|e| {
            panic!("failed to create uploads directory '{}': {e}", config.uploads_dir);
        });
    }

    let pool = db::create_pool(&config.database_url, pool_size())
        .await
        .expect("failed to connect to database and run migrations");

    let redis_client =
        redis::Client::open(config.redis_url.clone()).expect("invalid REDIS_URL");
    let redis = ConnectionManager::new(redis_client)
        .await
        .expect("failed to connect to the shared key-value store");

    let private_key = std::fs::read(&config.jwt_private_key_path)
        .unwrap_or_else(|e| panic!("failed to read JWT private key '{}': {e}", config.jwt_private_key_path));
    let public_keys: Vec<Vec<u8>> = config
        .public_key_paths()
        .iter()
        .map(|path| std::fs::read(path).unwrap_or_else(|e| panic!("failed to read JWT public key '{path}': {e}")))
        .collect();
    let tokens = Arc::new(
        TokenService::new(&private_key, &public_keys, "imgvault".to_string())
            .expect("failed to initialize the token service"),
    );

    let storage = build_object_store(&config).await;
    let scanner: Arc<dyn MalwareScanner> = Arc::new(ClamAvScanner::new(config.clamav_host.clone(), config.clamav_port));
    let transcoder = Arc::new(Transcoder::new(config.transcode_concurrency, config.transcode_mem_cap_mb));

    let validator = Arc::new(UploadValidator::new(
        scanner.clone(),
        config.upload_max_bytes,
        config.image_max_dimension,
        config.image_max_pixels,
    ));
    let upload_orchestrator = Arc::new(UploadOrchestrator::new(
        pool.clone(),
        redis.clone(),
        storage.clone(),
        validator,
    ));
    let query_orchestrator = Arc::new(QueryOrchestrator::new(pool.clone()));

    let state = AppState {
        db: pool.clone(),
        redis: redis.clone(),
        tokens,
        upload_orchestrator,
        query_orchestrator,
    };

    tasks::spawn_background_tasks(pool.clone(), redis.clone(), storage.clone());
    queue::worker::spawn(
        WorkerDeps {
            pool: pool.clone(),
            redis: redis.clone(),
            storage: storage.clone(),
            scanner,
            transcoder,
        },
        config.transcode_concurrency.min(8),
    );

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::router(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind TCP listener");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}

/// `GET /health` — liveness probe for load balancers and container health
/// checks. Unauthenticated and exempt from rate limiting by virtue of living
/// outside `api::router`.
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
