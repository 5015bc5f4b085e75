//! HTTP surface (spec §6). Handlers translate between the wire format and
//! the orchestrators/repositories in `services`/`catalog`; no business logic
//! lives here beyond request parsing and response shaping.

pub mod albums;
pub mod auth;
pub mod images;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::auth::middleware as auth_mw;
use crate::AppState;

/// The 10 MiB upload ceiling (spec §4.4) plus headroom for multipart framing
/// overhead — the validator enforces the real limit on the decoded bytes.
const MULTIPART_BODY_LIMIT: usize = 11 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout));

    // Mutating endpoints require a verified principal and count against the
    // per-user rate-limit tier.
    let write_routes = Router::new()
        .route(
            "/",
            post(images::upload).layer(DefaultBodyLimit::max(MULTIPART_BODY_LIMIT)),
        )
        .route("/{id}", patch(images::update))
        .route("/{id}", delete(images::delete))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_mw::rate_limit_per_user))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_mw::require_auth));

    // Reads stay open to anonymous callers — the query orchestrator applies
    // the visibility predicate itself (spec §4.12) — but pick up a principal
    // when a valid bearer token is presented, so owners/moderators see more.
    // The per-user tier (spec §4.7) applies generally, not just to writes, so
    // it's layered here too; `rate_limit_per_user` no-ops for anonymous callers.
    let read_routes = Router::new()
        .route("/", get(images::list))
        .route("/{id}", get(images::get_one))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_mw::rate_limit_per_user))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_mw::try_auth));

    let image_routes = write_routes.merge(read_routes);

    // Albums are owner-private bookkeeping over a user's own images (spec
    // §4.5); every operation requires a principal, none are publicly readable.
    let album_routes = Router::new()
        .route("/", post(albums::create))
        .route("/", get(albums::list_mine))
        .route("/{album_id}", get(albums::get_one))
        .route("/{album_id}", patch(albums::rename))
        .route("/{album_id}", delete(albums::delete))
        .route("/{album_id}/images", post(albums::add_image))
        .route("/{album_id}/images/{image_id}", delete(albums::remove_image))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_mw::rate_limit_per_user))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_mw::require_auth));

    Router::new()
        .nest("/api/v1/auth", auth_routes)
        .nest("/api/v1/images", image_routes)
        .nest("/api/v1/albums", album_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_mw::rate_limit_global_ip))
        .layer(middleware::from_fn(crate::error::populate_instance))
        .with_state(state)
}
