use alloy::primitives::Address;
use std::env;
use url::Url;
use weft::NetworkConfig;

const DEFAULT_PORT: u16 = 7071;
const DEFAULT_DB_PATH: &str = "./weft-payment.db";
const DEFAULT_FACILITATOR_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PRICING_BUFFER_PCT: u64 = 15;
const DEFAULT_RESERVATION_TTL_SECS: u64 = 3_600;
const DEFAULT_CREDITS_PER_KIB: u64 = 10_000;
const DEFAULT_CREDITS_PER_USD: u64 = 1_000_000_000;
const DEFAULT_FRAUD_TOLERANCE_PCT: f64 = 1.0;
const DEFAULT_FRAUD_WARNING_PCT: f64 = 0.5;
const DEFAULT_FRAUD_MAJOR_PCT: f64 = 5.0;
const DEFAULT_OVERPAYMENT_REFUND_PCT: f64 = 10.0;
const DEFAULT_FRAUD_BAN_COUNT: u32 = 3;
const DEFAULT_FRAUD_BAN_DAYS: i64 = 30;
const DEFAULT_X402_MAX_TIMEOUT_SECS: u64 = 900;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_RPM: u64 = 120;

#[derive(Clone)]
pub struct PaymentConfig {
    pub port: u16,
    pub db_path: String,
    /// Shared secret for the private surface (bearer token).
    pub private_api_secret: String,
    pub facilitator_url: String,
    pub facilitator_fallback_url: Option<String>,
    pub facilitator_timeout_secs: u64,
    /// Recipient of every x402 authorization.
    pub pay_to: Address,
    pub networks: Vec<NetworkConfig>,
    pub pricing_buffer_pct: u64,
    pub reservation_ttl_secs: u64,
    pub credits_per_kib: u64,
    pub credits_per_usd: u64,
    pub fraud_tolerance_pct: f64,
    pub fraud_warning_pct: f64,
    pub fraud_major_pct: f64,
    pub overpayment_refund_pct: f64,
    pub fraud_ban_count: u32,
    /// Ban duration in days; 0 means permanent.
    pub fraud_ban_days: i64,
    /// Upper bound on an authorization's validity window.
    pub x402_max_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub rate_limit_rpm: u64,
    pub metrics_token: Option<String>,
}

impl std::fmt::Debug for PaymentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentConfig")
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("private_api_secret", &"[REDACTED]")
            .field("facilitator_url", &self.facilitator_url)
            .field("facilitator_fallback_url", &self.facilitator_fallback_url)
            .field("facilitator_timeout_secs", &self.facilitator_timeout_secs)
            .field("pay_to", &self.pay_to)
            .field(
                "networks",
                &self.networks.iter().map(|n| &n.network).collect::<Vec<_>>(),
            )
            .field("pricing_buffer_pct", &self.pricing_buffer_pct)
            .field("reservation_ttl_secs", &self.reservation_ttl_secs)
            .field("credits_per_kib", &self.credits_per_kib)
            .field("credits_per_usd", &self.credits_per_usd)
            .field("fraud_tolerance_pct", &self.fraud_tolerance_pct)
            .field("fraud_warning_pct", &self.fraud_warning_pct)
            .field("fraud_major_pct", &self.fraud_major_pct)
            .field("overpayment_refund_pct", &self.overpayment_refund_pct)
            .field("fraud_ban_count", &self.fraud_ban_count)
            .field("fraud_ban_days", &self.fraud_ban_days)
            .field("x402_max_timeout_secs", &self.x402_max_timeout_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl PaymentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let private_api_secret = env::var("PRIVATE_API_SECRET")
            .map_err(|_| ConfigError::MissingRequired("PRIVATE_API_SECRET"))?;
        if private_api_secret.len() < 32 {
            tracing::warn!(
                "PRIVATE_API_SECRET is short ({} bytes, 32+ recommended) — \
                 use `openssl rand -hex 32` to generate one",
                private_api_secret.len()
            );
        }

        let pay_to_str =
            env::var("PAY_TO_ADDRESS").map_err(|_| ConfigError::MissingRequired("PAY_TO_ADDRESS"))?;
        let pay_to: Address = pay_to_str
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(pay_to_str))?;

        let facilitator_url = env::var("FACILITATOR_URL")
            .map_err(|_| ConfigError::MissingRequired("FACILITATOR_URL"))?;
        Url::parse(&facilitator_url)
            .map_err(|_| ConfigError::InvalidUrl(facilitator_url.clone()))?;

        let facilitator_fallback_url = env::var("FACILITATOR_FALLBACK_URL")
            .ok()
            .filter(|s| !s.is_empty());
        if let Some(ref url) = facilitator_fallback_url {
            Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.clone()))?;
        }

        let enabled: Vec<String> = env::var("ENABLED_NETWORKS")
            .map(|s| s.split(',').map(|n| n.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["base-mainnet".to_string(), "base-sepolia".to_string()]);
        let known = NetworkConfig::known();
        let mut networks = Vec::new();
        for name in &enabled {
            match NetworkConfig::lookup(&known, name) {
                Some(n) => networks.push(n.clone()),
                None => return Err(ConfigError::UnknownNetwork(name.clone())),
            }
        }
        if networks.is_empty() {
            return Err(ConfigError::MissingRequired("ENABLED_NETWORKS"));
        }

        let fraud_ban_days = env_parse("FRAUD_BAN_DAYS", DEFAULT_FRAUD_BAN_DAYS);
        if fraud_ban_days < 0 {
            return Err(ConfigError::InvalidValue("FRAUD_BAN_DAYS"));
        }

        Ok(Self {
            port: env_parse("PORT", DEFAULT_PORT),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
            private_api_secret,
            facilitator_url,
            facilitator_fallback_url,
            facilitator_timeout_secs: env_parse(
                "FACILITATOR_TIMEOUT_SECS",
                DEFAULT_FACILITATOR_TIMEOUT_SECS,
            ),
            pay_to,
            networks,
            pricing_buffer_pct: env_parse("PRICING_BUFFER_PCT", DEFAULT_PRICING_BUFFER_PCT),
            reservation_ttl_secs: env_parse("RESERVATION_TTL_SECS", DEFAULT_RESERVATION_TTL_SECS),
            credits_per_kib: env_parse("PRICE_CREDITS_PER_KIB", DEFAULT_CREDITS_PER_KIB),
            credits_per_usd: env_parse("CREDITS_PER_USD", DEFAULT_CREDITS_PER_USD),
            fraud_tolerance_pct: env_parse("FRAUD_TOLERANCE_PCT", DEFAULT_FRAUD_TOLERANCE_PCT),
            fraud_warning_pct: env_parse("FRAUD_WARNING_PCT", DEFAULT_FRAUD_WARNING_PCT),
            fraud_major_pct: env_parse("FRAUD_MAJOR_PCT", DEFAULT_FRAUD_MAJOR_PCT),
            overpayment_refund_pct: env_parse(
                "OVERPAYMENT_REFUND_PCT",
                DEFAULT_OVERPAYMENT_REFUND_PCT,
            ),
            fraud_ban_count: env_parse("FRAUD_BAN_COUNT", DEFAULT_FRAUD_BAN_COUNT),
            fraud_ban_days,
            x402_max_timeout_secs: env_parse(
                "X402_MAX_TIMEOUT_SECS",
                DEFAULT_X402_MAX_TIMEOUT_SECS,
            ),
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
            rate_limit_rpm: env_parse("RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM),
            metrics_token: env::var("METRICS_TOKEN").ok().filter(|s| !s.is_empty()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unknown settlement network: {0}")]
    UnknownNetwork(String),

    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}
