use std::env;
use url::Url;

const DEFAULT_PORT: u16 = 7070;
const DEFAULT_DB_PATH: &str = "./weft-upload.db";
const DEFAULT_QUEUE_DB_PATH: &str = "./weft-upload-jobs.db";
const DEFAULT_OBJECT_ROOT: &str = "./weft-objects";

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

const DEFAULT_MAX_ITEM_BYTES: u64 = 10 * GIB;
const DEFAULT_MAX_BUNDLE_BYTES: u64 = 2 * GIB;
const DEFAULT_MAX_ITEMS_PER_BUNDLE: u64 = 10_000;
const DEFAULT_CACHE_MAX_ITEM_BYTES: u64 = 100 * MIB;
const DEFAULT_IN_FLIGHT_TTL_SECS: u64 = 600;
const DEFAULT_MIN_INGEST_BPS: u64 = 100 * 1024;
const DEFAULT_FRAUD_TOLERANCE_PCT: f64 = 1.0;
const DEFAULT_PLAN_CANDIDATES: u64 = 75_000;
const DEFAULT_PLAN_INTERVAL_SECS: u64 = 300;
const DEFAULT_POST_CONFIRM_DELAY_SECS: u64 = 120;
const DEFAULT_VERIFY_DEADLINE_SECS: u64 = 86_400;
const DEFAULT_VERIFY_BACKOFF_CAP_SECS: u64 = 1_800;
const DEFAULT_MIN_CONFIRMATIONS: u64 = 3;
const DEFAULT_GRACE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MULTIPART_TTL_SECS: u64 = 86_400;
const DEFAULT_CHUNK_BYTES: u64 = 4 * MIB;
const DEFAULT_CACHE_ITEM_TTL_SECS: u64 = 3_600;

/// Per-IP rate-limit quota for one scope of the public surface.
#[derive(Debug, Clone, Copy)]
pub struct RateQuota {
    pub max: u32,
    pub window_ms: u64,
}

#[derive(Clone)]
pub struct UploadConfig {
    pub port: u16,
    pub db_path: String,
    pub queue_db_path: String,
    /// Root directory of the filesystem object store.
    pub object_root: String,
    /// Optional local scratch directory for bundle assembly.
    pub scratch_dir: Option<String>,

    pub payment_url: String,
    /// Shared secret for the payment service's private surface.
    pub payment_secret: String,
    /// Storage network (gateway) base URL.
    pub gateway_url: String,
    /// Optical bridge URLs, best-effort hand-off targets.
    pub optical_urls: Vec<String>,
    pub optical_admin_key: Option<String>,
    /// secp256k1 private key (hex) that signs bundle envelopes.
    pub service_key: String,

    pub max_item_bytes: u64,
    pub max_bundle_bytes: u64,
    pub max_items_per_bundle: u64,
    pub cache_max_item_bytes: u64,
    pub cache_item_ttl_secs: u64,
    pub in_flight_ttl_secs: u64,
    pub min_ingest_bps: u64,
    pub fraud_tolerance_pct: f64,

    pub plan_candidates: u64,
    pub plan_interval_secs: u64,
    pub post_confirm_delay_secs: u64,
    pub verify_deadline_secs: u64,
    pub verify_backoff_cap_secs: u64,
    pub min_confirmations: u64,
    pub grace_timeout_secs: u64,
    pub multipart_ttl_secs: u64,
    pub chunk_bytes: u64,
    /// Delete raw objects once the bundle is verified.
    pub delete_raw_after_verify: bool,

    pub rate_limit_upload: RateQuota,
    pub rate_limit_price: RateQuota,
    pub rate_limit_payment: RateQuota,
    /// CORS origins for the public surface; empty = localhost only.
    pub allowed_origins: Vec<String>,
    pub metrics_token: Option<String>,
}

impl std::fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadConfig")
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("queue_db_path", &self.queue_db_path)
            .field("object_root", &self.object_root)
            .field("scratch_dir", &self.scratch_dir)
            .field("payment_url", &self.payment_url)
            .field("payment_secret", &"[REDACTED]")
            .field("gateway_url", &self.gateway_url)
            .field("optical_urls", &self.optical_urls)
            .field(
                "optical_admin_key",
                &self.optical_admin_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("service_key", &"[REDACTED]")
            .field("max_item_bytes", &self.max_item_bytes)
            .field("max_bundle_bytes", &self.max_bundle_bytes)
            .field("max_items_per_bundle", &self.max_items_per_bundle)
            .field("cache_max_item_bytes", &self.cache_max_item_bytes)
            .field("in_flight_ttl_secs", &self.in_flight_ttl_secs)
            .field("min_ingest_bps", &self.min_ingest_bps)
            .field("fraud_tolerance_pct", &self.fraud_tolerance_pct)
            .field("plan_candidates", &self.plan_candidates)
            .field("plan_interval_secs", &self.plan_interval_secs)
            .field("post_confirm_delay_secs", &self.post_confirm_delay_secs)
            .field("verify_deadline_secs", &self.verify_deadline_secs)
            .field("min_confirmations", &self.min_confirmations)
            .field("grace_timeout_secs", &self.grace_timeout_secs)
            .field("delete_raw_after_verify", &self.delete_raw_after_verify)
            .finish()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn rate_quota(scope: &str, default_max: u32, default_window_ms: u64) -> RateQuota {
    RateQuota {
        max: env_parse(&format!("RATE_LIMIT_{scope}_MAX"), default_max),
        window_ms: env_parse(&format!("RATE_LIMIT_{scope}_WINDOW_MS"), default_window_ms),
    }
}

impl UploadConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let payment_url =
            env::var("PAYMENT_URL").map_err(|_| ConfigError::MissingRequired("PAYMENT_URL"))?;
        Url::parse(&payment_url).map_err(|_| ConfigError::InvalidUrl(payment_url.clone()))?;

        let payment_secret = env::var("PAYMENT_SHARED_SECRET")
            .map_err(|_| ConfigError::MissingRequired("PAYMENT_SHARED_SECRET"))?;

        let gateway_url =
            env::var("GATEWAY_URL").map_err(|_| ConfigError::MissingRequired("GATEWAY_URL"))?;
        Url::parse(&gateway_url).map_err(|_| ConfigError::InvalidUrl(gateway_url.clone()))?;

        let service_key =
            env::var("SERVICE_KEY").map_err(|_| ConfigError::MissingRequired("SERVICE_KEY"))?;

        let optical_urls: Vec<String> = env::var("OPTICAL_BRIDGE_URLS")
            .ok()
            .map(|urls| {
                urls.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        for url in &optical_urls {
            Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.clone()))?;
        }

        let max_item_bytes = env_parse("MAX_ITEM_BYTES", DEFAULT_MAX_ITEM_BYTES);
        let max_bundle_bytes = env_parse("MAX_BUNDLE_BYTES", DEFAULT_MAX_BUNDLE_BYTES);
        if max_item_bytes == 0 || max_bundle_bytes == 0 {
            return Err(ConfigError::InvalidValue("MAX_ITEM_BYTES/MAX_BUNDLE_BYTES"));
        }

        Ok(Self {
            port: env_parse("PORT", DEFAULT_PORT),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
            queue_db_path: env::var("QUEUE_DB_PATH")
                .unwrap_or_else(|_| DEFAULT_QUEUE_DB_PATH.to_string()),
            object_root: env::var("OBJECT_STORE_ROOT")
                .unwrap_or_else(|_| DEFAULT_OBJECT_ROOT.to_string()),
            scratch_dir: env::var("SCRATCH_DIR").ok().filter(|s| !s.is_empty()),
            payment_url,
            payment_secret,
            gateway_url,
            optical_urls,
            optical_admin_key: env::var("OPTICAL_ADMIN_KEY").ok().filter(|s| !s.is_empty()),
            service_key,
            max_item_bytes,
            max_bundle_bytes,
            max_items_per_bundle: env_parse("MAX_ITEMS_PER_BUNDLE", DEFAULT_MAX_ITEMS_PER_BUNDLE),
            cache_max_item_bytes: env_parse("CACHE_MAX_ITEM_BYTES", DEFAULT_CACHE_MAX_ITEM_BYTES),
            cache_item_ttl_secs: env_parse("CACHE_ITEM_TTL_SECS", DEFAULT_CACHE_ITEM_TTL_SECS),
            in_flight_ttl_secs: env_parse("IN_FLIGHT_TTL_SECS", DEFAULT_IN_FLIGHT_TTL_SECS),
            min_ingest_bps: env_parse("MIN_INGEST_BPS", DEFAULT_MIN_INGEST_BPS).max(1),
            fraud_tolerance_pct: env_parse("FRAUD_TOLERANCE_PCT", DEFAULT_FRAUD_TOLERANCE_PCT),
            plan_candidates: env_parse("PLAN_CANDIDATES", DEFAULT_PLAN_CANDIDATES),
            plan_interval_secs: env_parse("PLAN_INTERVAL_SECS", DEFAULT_PLAN_INTERVAL_SECS),
            post_confirm_delay_secs: env_parse(
                "POST_CONFIRM_DELAY_SECS",
                DEFAULT_POST_CONFIRM_DELAY_SECS,
            ),
            verify_deadline_secs: env_parse("VERIFY_DEADLINE_SECS", DEFAULT_VERIFY_DEADLINE_SECS),
            verify_backoff_cap_secs: env_parse(
                "VERIFY_BACKOFF_CAP_SECS",
                DEFAULT_VERIFY_BACKOFF_CAP_SECS,
            ),
            min_confirmations: env_parse("MIN_CONFIRMATIONS", DEFAULT_MIN_CONFIRMATIONS),
            grace_timeout_secs: env_parse("GRACE_TIMEOUT_SECS", DEFAULT_GRACE_TIMEOUT_SECS),
            multipart_ttl_secs: env_parse("MULTIPART_TTL_SECS", DEFAULT_MULTIPART_TTL_SECS),
            chunk_bytes: env_parse("CHUNK_BYTES", DEFAULT_CHUNK_BYTES).max(64 * 1024),
            delete_raw_after_verify: env_flag("CLEANUP_DELETE_RAW"),
            rate_limit_upload: rate_quota("UPLOAD", 120, 60_000),
            rate_limit_price: rate_quota("PRICE", 300, 60_000),
            rate_limit_payment: rate_quota("PAYMENT", 60, 60_000),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            metrics_token: env::var("METRICS_TOKEN").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Worker pool size for a pipeline label, overridable per label via
    /// `WORKER_CONCURRENCY_<LABEL>`.
    pub fn worker_concurrency(&self, label: crate::store::queue::JobLabel) -> usize {
        use crate::store::queue::JobLabel::*;
        let default = match label {
            NewDataItem => 8,
            Plan => 5,
            Prepare => 4,
            Post => 2,
            Verify => 4,
            OversizedItem => 1,
            Unbundle => 2,
            OpticalPost => 4,
            PutOffsets => 4,
            CleanupFs => 2,
            FinalizePayment => 4,
        };
        env_parse(
            &format!("WORKER_CONCURRENCY_{}", label.env_suffix()),
            default,
        )
    }

    /// In-flight lock TTL for a declared upload size: generous enough
    /// that a slow but live upload never loses its lock.
    pub fn in_flight_ttl_for(&self, content_length: u64) -> std::time::Duration {
        let floor = self.in_flight_ttl_secs.max(600);
        let paced = (content_length / self.min_ingest_bps) * 2;
        std::time::Duration::from_secs(floor.max(paced))
    }
}

impl UploadConfig {
    /// A config pointing every store at local scratch space, bypassing
    /// the environment. Used by tests; never by `main`.
    #[doc(hidden)]
    pub fn local_defaults(object_root: &str) -> Self {
        Self {
            port: 0,
            db_path: ":memory:".to_string(),
            queue_db_path: ":memory:".to_string(),
            object_root: object_root.to_string(),
            scratch_dir: None,
            payment_url: "http://localhost:1".to_string(),
            payment_secret: "local-secret".to_string(),
            gateway_url: "http://localhost:1".to_string(),
            optical_urls: vec![],
            optical_admin_key: None,
            service_key: String::new(),
            max_item_bytes: DEFAULT_MAX_ITEM_BYTES,
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_BYTES,
            max_items_per_bundle: DEFAULT_MAX_ITEMS_PER_BUNDLE,
            cache_max_item_bytes: DEFAULT_CACHE_MAX_ITEM_BYTES,
            cache_item_ttl_secs: DEFAULT_CACHE_ITEM_TTL_SECS,
            in_flight_ttl_secs: DEFAULT_IN_FLIGHT_TTL_SECS,
            min_ingest_bps: DEFAULT_MIN_INGEST_BPS,
            fraud_tolerance_pct: DEFAULT_FRAUD_TOLERANCE_PCT,
            plan_candidates: DEFAULT_PLAN_CANDIDATES,
            plan_interval_secs: DEFAULT_PLAN_INTERVAL_SECS,
            post_confirm_delay_secs: DEFAULT_POST_CONFIRM_DELAY_SECS,
            verify_deadline_secs: DEFAULT_VERIFY_DEADLINE_SECS,
            verify_backoff_cap_secs: DEFAULT_VERIFY_BACKOFF_CAP_SECS,
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            grace_timeout_secs: DEFAULT_GRACE_TIMEOUT_SECS,
            multipart_ttl_secs: DEFAULT_MULTIPART_TTL_SECS,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            delete_raw_after_verify: false,
            rate_limit_upload: RateQuota {
                max: 1_000,
                window_ms: 60_000,
            },
            rate_limit_price: RateQuota {
                max: 1_000,
                window_ms: 60_000,
            },
            rate_limit_payment: RateQuota {
                max: 1_000,
                window_ms: 60_000,
            },
            allowed_origins: vec![],
            metrics_token: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}
