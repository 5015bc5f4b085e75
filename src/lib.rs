//! Library crate backing the `imgvault` binary and its integration tests.
//! `main.rs` wires these modules into an axum `Router` and a `tokio` runtime;
//! tests/ exercises the orchestrators and repository directly against an
//! in-memory SQLite pool without going through HTTP.

pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod media;
pub mod queue;
pub mod scanner;
pub mod services;
pub mod storage;
pub mod tasks;
pub mod validation;

use std::sync::Arc;

use auth::tokens::TokenService;
use redis::aio::ConnectionManager;
use services::query::QueryOrchestrator;
use services::upload::UploadOrchestrator;
use sqlx::SqlitePool;

/// Shared application state passed to every handler via Axum's `State`
/// extractor. Must be `Clone` — Axum clones it once per request, so every
/// field here is either cheap to clone (a pool, a connection manager) or
/// already wrapped in an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub redis: ConnectionManager,
    pub tokens: Arc<TokenService>,
    pub upload_orchestrator: Arc<UploadOrchestrator>,
    pub query_orchestrator: Arc<QueryOrchestrator>,
}
