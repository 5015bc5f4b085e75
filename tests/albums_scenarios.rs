//! Scenario tests for album membership (spec §4.5's "corresponding
//! operations for albums"): ordered membership, idempotent re-add, and the
//! owner-gate every `src/api/albums.rs` handler applies before touching an
//! album.

use imgvault::auth::middleware::authorize_owner_or_role;
use imgvault::auth::tokens::Principal;
use imgvault::catalog::albums;
use imgvault::catalog::images::{self, NewImage};
use imgvault::db::models::{ImageStatus, Visibility};
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

async fn seed_user(pool: &SqlitePool) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO users (id, email, username, password_hash, role, status)
         VALUES (?, ?, ?, 'hash', 'user', 'active')",
    )
    .bind(&id)
    .bind(format!("{id}@example.com"))
    .bind(format!("user-{id}"))
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn seed_image(pool: &SqlitePool, owner_id: &str) -> String {
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
            visibility: Visibility::Private,
        },
    )
    .await
    .unwrap();
    images::mark_status(pool, &id, ImageStatus::Active).await.unwrap();
    id
}

#[tokio::test]
async fn images_are_returned_in_membership_order() {
    let pool = test_pool().await;
    let owner = seed_user(&pool).await;
    let album = albums::create(&pool, &owner, "Vacation").await.unwrap();

    let first = seed_image(&pool, &owner).await;
    let second = seed_image(&pool, &owner).await;
    let third = seed_image(&pool, &owner).await;

    albums::add_image(&pool, &album.id, &first).await.unwrap();
    albums::add_image(&pool, &album.id, &second).await.unwrap();
    albums::add_image(&pool, &album.id, &third).await.unwrap();

    let ids = albums::list_image_ids(&pool, &album.id).await.unwrap();
    assert_eq!(ids, vec![first, second, third]);
}

#[tokio::test]
async fn re_adding_an_image_already_in_the_album_is_a_silent_no_op() {
    let pool = test_pool().await;
    let owner = seed_user(&pool).await;
    let album = albums::create(&pool, &owner, "Vacation").await.unwrap();
    let image = seed_image(&pool, &owner).await;

    albums::add_image(&pool, &album.id, &image).await.unwrap();
    albums::add_image(&pool, &album.id, &image).await.unwrap();

    let ids = albums::list_image_ids(&pool, &album.id).await.unwrap();
    assert_eq!(ids, vec![image]);
}

#[tokio::test]
async fn removing_an_image_drops_membership_but_not_the_image_row() {
    let pool = test_pool().await;
    let owner = seed_user(&pool).await;
    let album = albums::create(&pool, &owner, "Vacation").await.unwrap();
    let image = seed_image(&pool, &owner).await;
    albums::add_image(&pool, &album.id, &image).await.unwrap();

    albums::remove_image(&pool, &album.id, &image).await.unwrap();

    assert!(albums::list_image_ids(&pool, &album.id).await.unwrap().is_empty());
    assert!(images::find_by_id(&pool, &image).await.unwrap().is_some());
}

#[tokio::test]
async fn deleting_an_album_cascades_membership_but_not_images() {
    let pool = test_pool().await;
    let owner = seed_user(&pool).await;
    let album = albums::create(&pool, &owner, "Vacation").await.unwrap();
    let image = seed_image(&pool, &owner).await;
    albums::add_image(&pool, &album.id, &image).await.unwrap();

    albums::delete(&pool, &album.id).await.unwrap();

    assert!(albums::find_by_id(&pool, &album.id).await.unwrap().is_none());
    assert!(images::find_by_id(&pool, &image).await.unwrap().is_some());
}

#[test]
fn non_owner_is_forbidden_from_album_handlers() {
    let owner = "user-a".to_string();
    let intruder = Principal {
        user_id: "user-b".to_string(),
        role: "user".to_string(),
    };
    assert!(authorize_owner_or_role(&intruder, &owner, false).is_err());

    let moderator = Principal {
        user_id: "user-b".to_string(),
        role: "moderator".to_string(),
    };
    // Albums are owner-private (spec §4.5); moderator bypass is not granted
    // the way it is for image visibility/moderation.
    assert!(authorize_owner_or_role(&moderator, &owner, false).is_err());
}
