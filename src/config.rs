use anyhow::{Context, Result, bail};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// S3 bucket holding originals and derived variants.
    pub bucket: String,
    /// Optional custom S3 endpoint (MinIO and friends). Implies path-style addressing.
    pub s3_endpoint: Option<String>,
    pub database_url: String,
    /// Base URL used when building public image URLs in responses.
    pub public_base_url: String,
    /// Cloudflare Access team domain, e.g. `example.cloudflareaccess.com`.
    pub team_domain: Option<String>,
    /// Audience (policy id) the access token must carry.
    pub policy_aud: Option<String>,
    /// JSON file with the list of emails allowed to POST images.
    pub allowlist_file: String,
    /// Maximum decoded upload size in bytes.
    pub max_upload_bytes: usize,
    /// JWKS cache lifetime in seconds (Cloudflare default: 4 hours).
    pub jwks_cache_secs: u64,
    /// When false, token verification and the allowlist are skipped entirely.
    pub require_auth: bool,
    /// Exact origins allowed for CORS. Empty means permissive without credentials.
    pub allowed_origins: Vec<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Image storage and resize API")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// S3 bucket for image payloads (overrides IMAGE_STORE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Custom S3 endpoint URL (overrides IMAGE_STORE_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Database URL (overrides IMAGE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Disable the identity gate (token + allowlist); for local development only
    #[arg(long)]
    pub no_auth: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_JWKS_CACHE_SECS: u64 = 14_400;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("IMAGE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("IMAGE_STORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing IMAGE_STORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading IMAGE_STORE_PORT"),
        };
        let env_bucket = env::var("IMAGE_STORE_BUCKET").unwrap_or_else(|_| "images".into());
        let env_db = env::var("IMAGE_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/image_store.db".into());

        let require_auth = if args.no_auth {
            false
        } else {
            match env::var("IMAGE_STORE_REQUIRE_AUTH") {
                Ok(value) => value.parse::<bool>().with_context(|| {
                    format!("parsing IMAGE_STORE_REQUIRE_AUTH value `{}`", value)
                })?,
                Err(_) => true,
            }
        };

        let team_domain = env::var("IMAGE_STORE_TEAM_DOMAIN").ok();
        let policy_aud = env::var("IMAGE_STORE_POLICY_AUD").ok();
        if require_auth && (team_domain.is_none() || policy_aud.is_none()) {
            bail!(
                "IMAGE_STORE_TEAM_DOMAIN and IMAGE_STORE_POLICY_AUD are required unless auth is disabled"
            );
        }

        let max_upload_bytes = match env::var("IMAGE_STORE_MAX_UPLOAD_BYTES") {
            Ok(value) => value.parse::<usize>().with_context(|| {
                format!("parsing IMAGE_STORE_MAX_UPLOAD_BYTES value `{}`", value)
            })?,
            Err(_) => DEFAULT_MAX_UPLOAD_BYTES,
        };
        let jwks_cache_secs = match env::var("IMAGE_STORE_JWKS_CACHE_SECS") {
            Ok(value) => value.parse::<u64>().with_context(|| {
                format!("parsing IMAGE_STORE_JWKS_CACHE_SECS value `{}`", value)
            })?,
            Err(_) => DEFAULT_JWKS_CACHE_SECS,
        };

        // Comma-separated list, e.g. "https://a.example,https://b.example"
        let allowed_origins = env::var("IMAGE_STORE_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            bucket: args.bucket.unwrap_or(env_bucket),
            s3_endpoint: args
                .s3_endpoint
                .or_else(|| env::var("IMAGE_STORE_S3_ENDPOINT").ok()),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: env::var("IMAGE_STORE_PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            team_domain,
            policy_aud,
            allowlist_file: env::var("IMAGE_STORE_ALLOWLIST_FILE")
                .unwrap_or_else(|_| "/config/post_allowlist.json".into()),
            max_upload_bytes,
            jwks_cache_secs,
            require_auth,
            allowed_origins,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Cloudflare Access JWKS endpoint for the configured team domain.
    pub fn certs_url(&self) -> Option<String> {
        self.team_domain
            .as_deref()
            .map(|domain| format!("https://{}/cdn-cgi/access/certs", domain))
    }
}
