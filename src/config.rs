use serde::Deserialize;

/// Application configuration loaded from environment variables via `envy`.
///
/// All fields map directly to environment variable names (uppercased by
/// envy). Provide defaults via `.env` for local development; override via
/// real env vars in production / Docker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite connection string for the catalog, e.g. `sqlite:data/imgvault.db?mode=rwc`.
    pub database_url: String,

    /// `local`, `s3`, `spaces`, or `b2`. Only `local` and `s3` are implemented;
    /// `spaces`/`b2` are accepted as S3-compatible aliases (same wire protocol,
    /// different endpoint).
    #[serde(default = "default_storage_provider")]
    pub storage_provider: String,

    /// Filesystem path backing the `local` storage provider.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,

    /// S3-compatible bucket name (ignored by the `local` provider).
    pub storage_bucket: Option<String>,
    /// S3-compatible endpoint URL, e.g. `https://nyc3.digitaloceanspaces.com`.
    pub storage_endpoint: Option<String>,
    /// S3-compatible region.
    pub storage_region: Option<String>,
    pub storage_access_key: Option<String>,
    pub storage_secret_key: Option<String>,

    /// Connection string for the shared key-value store backing rate-limit
    /// counters, the token blacklist, login lockouts, and the job queue.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Host of the external malware-scan daemon (ClamAV INSTREAM protocol).
    pub clamav_host: String,
    #[serde(default = "default_clamav_port")]
    pub clamav_port: u16,

    /// PEM path to the RSA private key used to sign access tokens.
    pub jwt_private_key_path: String,
    /// PEM paths to RSA public keys accepted for verification, comma-separated
    /// by envy from a single env var. Supporting a list allows key rotation:
    /// the newest key signs, all listed keys verify.
    pub jwt_public_key_paths: String,

    #[serde(default = "default_upload_max_bytes")]
    pub upload_max_bytes: u64,
    #[serde(default = "default_image_max_dimension")]
    pub image_max_dimension: u32,
    #[serde(default = "default_image_max_pixels")]
    pub image_max_pixels: u64,
    #[serde(default = "default_transcode_concurrency")]
    pub transcode_concurrency: usize,
    #[serde(default = "default_transcode_mem_cap_mb")]
    pub transcode_mem_cap_mb: u64,
}

fn default_port() -> u16 {
    8080
}
fn default_storage_provider() -> String {
    "local".to_string()
}
fn default_uploads_dir() -> String {
    "data/uploads".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_clamav_port() -> u16 {
    3310
}
fn default_upload_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_image_max_dimension() -> u32 {
    8192
}
fn default_image_max_pixels() -> u64 {
    100_000_000
}
fn default_transcode_concurrency() -> usize {
    32
}
fn default_transcode_mem_cap_mb() -> u64 {
    256
}

impl Config {
    /// Load configuration from the current process environment.
    ///
    /// Panics with a clear message if any required variable is missing —
    /// there is no sane default for a database URL or a signing key, so
    /// failing fast at startup beats limping along with `Option::None`.
    pub fn from_env() -> Self {
        envy::from_env::<Config>().unwrap_or_else(|err| {
            panic!("configuration error: {err}\nCheck that all required environment variables are set (see .env.example).");
        })
    }

    /// Splits the comma-separated `JWT_PUBLIC_KEY_PATHS` env var into
    /// individual paths, trimming whitespace and dropping empty entries.
    pub fn public_key_paths(&self) -> Vec<String> {
        self.jwt_public_key_paths
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
