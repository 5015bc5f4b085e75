//! Service-level scenario tests exercising the catalog + query orchestrator
//! together against a real (in-memory) SQLite database. These correspond to
//! the end-to-end scenarios in spec §8 that don't require the key-value
//! store (rate limiter, token blacklist, job queue) to observe: visibility
//! enforcement across owner/anonymous/moderator callers (S7, P2), status
//! gating of non-active images on listings (P3), and the N+1-free batch
//! assembly (P8) via `fetch_variants_for`/`fetch_tags_for`.

use imgvault::auth::tokens::Principal;
use imgvault::catalog::images::{self, NewImage};
use imgvault::db::models::{ImageStatus, Visibility};
use imgvault::services::query::QueryOrchestrator;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite connects");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations apply to the fresh in-memory database");
    pool
}

async fn seed_user(pool: &SqlitePool, role: &str) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO users (id, email, username, password_hash, role, status)
         VALUES (?, ?, ?, 'hash', ?, 'active')",
    )
    .bind(&id)
    .bind(format!("{id}@example.com"))
    .bind(format!("user-{id}"))
    .bind(role)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn seed_image(pool: &SqlitePool, owner_id: &str, visibility: Visibility, status: ImageStatus) -> String {
    let id = Uuid::new_v4().to_string();
    images::create_pending(
        pool,
        NewImage {
            id: &id,
            owner_id,
            original_filename: "photo.jpg",
            format: "jpeg",
            width: 800,
            height: 600,
            byte_size: 1024,
            visibility,
        },
    )
    .await
    .unwrap();
    images::mark_status(pool, &id, status).await.unwrap();
    id
}

fn principal(user_id: &str, role: &str) -> Principal {
    Principal {
        user_id: user_id.to_string(),
        role: role.to_string(),
    }
}

/// S7: a private image is invisible to a second authenticated user, but
/// becomes visible to them once its visibility flips to public — exercised
/// here against the catalog directly rather than the HTTP layer, matching
/// the teacher's service-level test scope.
#[tokio::test]
async fn private_image_visibility_flips_from_not_found_to_visible() {
    let pool = test_pool().await;
    let orchestrator = QueryOrchestrator::new(pool.clone());

    let owner = seed_user(&pool, "user").await;
    let other = seed_user(&pool, "user").await;
    let image_id = seed_image(&pool, &owner, Visibility::Private, ImageStatus::Active).await;

    let other_principal = principal(&other, "user");
    let err = orchestrator
        .get_image(Some(&other_principal), &image_id)
        .await
        .unwrap_err();
    assert!(matches!(err, imgvault::error::AppError::NotFound));

    images::update_metadata(&pool, &image_id, None, None, Some(Visibility::Public))
        .await
        .unwrap();

    let aggregate = orchestrator
        .get_image(Some(&other_principal), &image_id)
        .await
        .unwrap();
    assert_eq!(aggregate.image.id, image_id);
}

/// P2: an unlisted image resolves by direct id for an anonymous caller but
/// is absent from the public listing.
#[tokio::test]
async fn unlisted_image_is_reachable_by_id_but_excluded_from_listings() {
    let pool = test_pool().await;
    let orchestrator = QueryOrchestrator::new(pool.clone());

    let owner = seed_user(&pool, "user").await;
    let image_id = seed_image(&pool, &owner, Visibility::Unlisted, ImageStatus::Active).await;

    let direct = orchestrator.get_image(None, &image_id).await.unwrap();
    assert_eq!(direct.image.id, image_id);

    let pagination = imgvault::db::models::PaginationParams {
        offset: None,
        limit: None,
    };
    let page = orchestrator.list_public(&pagination).await.unwrap();
    assert!(page.data.iter().all(|a| a.image.id != image_id));
}

/// P3: images in pending/scanning/failed/infected never appear in a public
/// listing, regardless of their declared visibility.
#[tokio::test]
async fn non_active_images_never_appear_in_public_listings() {
    let pool = test_pool().await;
    let orchestrator = QueryOrchestrator::new(pool.clone());

    let owner = seed_user(&pool, "user").await;
    for status in [
        ImageStatus::Pending,
        ImageStatus::Scanning,
        ImageStatus::Failed,
        ImageStatus::Infected,
    ] {
        seed_image(&pool, &owner, Visibility::Public, status).await;
    }
    // One genuinely listable control row so the listing isn't trivially empty.
    let visible_id = seed_image(&pool, &owner, Visibility::Public, ImageStatus::Active).await;

    let pagination = imgvault::db::models::PaginationParams {
        offset: None,
        limit: None,
    };
    let page = orchestrator.list_public(&pagination).await.unwrap();
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0].image.id, visible_id);
}

/// P8 (batch assembly half): variants and tags attached to a page of images
/// are all recovered via the two batch-fetch helpers, with no per-image
/// follow-up call required by the caller.
#[tokio::test]
async fn variants_and_tags_are_batch_loaded_for_a_page_of_images() {
    let pool = test_pool().await;

    let owner = seed_user(&pool, "user").await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = seed_image(&pool, &owner, Visibility::Public, ImageStatus::Active).await;
        images::set_image_tags(&pool, &id, &["landscape".to_string(), "2024".to_string()])
            .await
            .unwrap();
        images::finalize_active(
            &pool,
            &id,
            &[(
                imgvault::db::models::VariantKind::Thumbnail,
                format!("images/{id}/thumbnail.webp"),
                160,
                120,
                2048,
                "webp".to_string(),
            )],
        )
        .await
        .unwrap();
        ids.push(id);
    }

    let variants_by_image = images::fetch_variants_for(&pool, &ids).await.unwrap();
    let tags_by_image = images::fetch_tags_for(&pool, &ids).await.unwrap();

    for id in &ids {
        assert_eq!(variants_by_image.get(id).map(|v| v.len()).unwrap_or(0), 1);
        assert_eq!(
            tags_by_image.get(id).cloned().unwrap_or_default(),
            vec!["landscape".to_string(), "2024".to_string()]
        );
    }
}

/// spec §4.11: the scan and transcode tasks race to perform the `active`
/// transition. When transcode wins (variants stored first, scan still
/// pending), the subsequent scan-clean completion must still flip the image
/// to `active` — not leave it stranded in `scanning` forever.
#[tokio::test]
async fn scan_completing_after_transcode_still_activates_the_image() {
    let pool = test_pool().await;
    let owner = seed_user(&pool, "user").await;
    let image_id = seed_image(&pool, &owner, Visibility::Public, ImageStatus::Pending).await;

    // Transcode wins the race: all derived variants are stored, but
    // scan_status is still 'pending' so finalize_active cannot activate yet.
    let variants: Vec<_> = imgvault::db::models::VariantKind::derived_kinds()
        .into_iter()
        .map(|kind| {
            (
                kind,
                format!("images/{image_id}/{}.webp", kind.as_str()),
                160,
                120,
                2048,
                "webp".to_string(),
            )
        })
        .collect();
    let became_active = images::finalize_active(&pool, &image_id, &variants).await.unwrap();
    assert!(!became_active, "must not activate before scan is clean");

    // Scan completes last: marks clean, then must perform the transition
    // itself since the variants are already fully stored.
    images::mark_scan_clean(&pool, &image_id).await.unwrap();
    let became_active = images::try_activate(&pool, &image_id).await.unwrap();
    assert!(became_active);

    let image = images::find_by_id(&pool, &image_id).await.unwrap().unwrap();
    assert_eq!(image.status, "active");
}

/// Owner and moderator can both see a private/non-active row that an
/// ordinary non-owner cannot (spec §4.8 ownership predicate, applied via
/// the query orchestrator's visibility gate rather than the HTTP layer).
#[tokio::test]
async fn owner_and_moderator_bypass_the_visibility_predicate() {
    let pool = test_pool().await;
    let orchestrator = QueryOrchestrator::new(pool.clone());

    let owner = seed_user(&pool, "user").await;
    let moderator = seed_user(&pool, "moderator").await;
    let image_id = seed_image(&pool, &owner, Visibility::Private, ImageStatus::Pending).await;

    let owner_principal = principal(&owner, "user");
    assert!(orchestrator.get_image(Some(&owner_principal), &image_id).await.is_ok());

    let moderator_principal = principal(&moderator, "moderator");
    assert!(orchestrator
        .get_image(Some(&moderator_principal), &image_id)
        .await
        .is_ok());

    let stranger = seed_user(&pool, "user").await;
    let stranger_principal = principal(&stranger, "user");
    assert!(orchestrator
        .get_image(Some(&stranger_principal), &image_id)
        .await
        .is_err());
}
