use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Read models (database rows) ─────────────────────────────────────────────
//
// Each struct maps 1-to-1 to a database table row. `sqlx::FromRow` is derived
// so sqlx can hydrate them directly from query results without manual
// mapping. Timestamp columns are stored as TEXT in SQLite and mapped to
// `DateTime<Utc>` via sqlx's chrono integration.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "unlisted" => Some(Visibility::Unlisted),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Scanning,
    Active,
    Infected,
    Failed,
    Deleted,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Scanning => "scanning",
            ImageStatus::Active => "active",
            ImageStatus::Infected => "infected",
            ImageStatus::Failed => "failed",
            ImageStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ImageStatus::Pending),
            "scanning" => Some(ImageStatus::Scanning),
            "active" => Some(ImageStatus::Active),
            "infected" => Some(ImageStatus::Infected),
            "failed" => Some(ImageStatus::Failed),
            "deleted" => Some(ImageStatus::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Thumbnail,
    Small,
    Medium,
    Large,
    Original,
}

impl VariantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantKind::Thumbnail => "thumbnail",
            VariantKind::Small => "small",
            VariantKind::Medium => "medium",
            VariantKind::Large => "large",
            VariantKind::Original => "original",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "thumbnail" => Some(VariantKind::Thumbnail),
            "small" => Some(VariantKind::Small),
            "medium" => Some(VariantKind::Medium),
            "large" => Some(VariantKind::Large),
            "original" => Some(VariantKind::Original),
            _ => None,
        }
    }

    /// Derived kinds (everything but `original`) target these max dimensions,
    /// contain-fit scaled, re-encoded as webp. Spec §3 "Variant".
    pub fn derived_kinds() -> [VariantKind; 4] {
        [
            VariantKind::Thumbnail,
            VariantKind::Small,
            VariantKind::Medium,
            VariantKind::Large,
        ]
    }

    pub fn max_dimension(&self) -> Option<u32> {
        match self {
            VariantKind::Thumbnail => Some(160),
            VariantKind::Small => Some(320),
            VariantKind::Medium => Some(800),
            VariantKind::Large => Some(1600),
            VariantKind::Original => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Image {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub original_filename: String,
    pub format: String,
    pub width: i64,
    pub height: i64,
    pub byte_size: i64,
    pub visibility: String,
    pub status: String,
    pub scan_status: String,
    pub infected_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Image {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// `Image` with its variants and tags attached — the aggregate assembled by
/// the repository's 3-query batch protocol (spec §4.5).
#[derive(Debug, Clone, Serialize)]
pub struct ImageAggregate {
    #[serde(flatten)]
    pub image: Image,
    pub variants: Vec<Variant>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Variant {
    pub id: String,
    pub image_id: String,
    pub kind: String,
    pub storage_key: String,
    pub width: i64,
    pub height: i64,
    pub byte_size: i64,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Album {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub status: String,
    pub failed_login_count: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// `User` without the password hash — what handlers and JSON responses see.
#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub id: String,
    pub email: String,
    pub username: String,
    pub role: String,
    pub status: String,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        PublicUser {
            id: u.id,
            email: u.email,
            username: u.username,
            role: u.role,
            status: u.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }
}

/// A refresh token record — one node in a token family's parent-pointer
/// chain. Spec §3 "Session / Refresh token family".
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub id: String,
    pub family_id: String,
    pub parent_id: Option<String>,
    pub user_id: String,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub ip_hash: String,
    pub user_agent_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: String,
    pub user_id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

// ─── Write / input models ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterInput {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginInput {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshInput {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateImageInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub visibility: Option<String>,
    pub tags: Option<Vec<String>>,
}

// ─── Utility types ────────────────────────────────────────────────────────────

/// Query parameters for paginated list endpoints. Limit is clamped to
/// `[1, 100]` per spec §4.12.
#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

impl PaginationParams {
    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T: Serialize> {
    pub data: Vec<T>,
    pub total: i64,
    pub offset: u32,
    pub limit: u32,
}
