//! The closed error taxonomy shared by both services.
//!
//! Every fallible operation in the platform resolves to one of these
//! tags. HTTP layers translate the tag to a status code and a structured
//! body; workers use [`WeftError::is_transient`] to decide between
//! requeue-with-backoff and permanent failure.

use thiserror::Error;

/// Platform-wide error taxonomy.
#[derive(Debug, Error)]
pub enum WeftError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("data item {0} already exists")]
    Duplicate(String),

    #[error("upload of {0} already in progress")]
    InProgress(String),

    #[error("payload of {actual} bytes exceeds limit of {limit}")]
    TooLarge { limit: u64, actual: u64 },

    #[error("insufficient credit: need {required}, have {available}")]
    InsufficientCredit { required: u64, available: u64 },

    /// Not a failure: the caller must attach an x402 payment. Carries the
    /// serialized 402 quote body when one was produced.
    #[error("payment required")]
    PaymentRequired(Option<String>),

    #[error("payment nonce already used")]
    NonceReplayed,

    #[error("settlement failed: {0}")]
    SettlementFailed(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("user {0} is banned")]
    UserBanned(String),

    #[error("rate limited")]
    RateLimited,

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("content does not hash to the declared item id")]
    ContentMismatch,

    #[error("fraud penalty applied: {0}")]
    FraudPenalty(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WeftError {
    /// Stable machine-readable tag, used in wire error bodies and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            WeftError::BadRequest(_) => "bad_request",
            WeftError::Duplicate(_) => "duplicate",
            WeftError::InProgress(_) => "in_progress",
            WeftError::TooLarge { .. } => "too_large",
            WeftError::InsufficientCredit { .. } => "insufficient_credit",
            WeftError::PaymentRequired(_) => "payment_required",
            WeftError::NonceReplayed => "nonce_replayed",
            WeftError::SettlementFailed(_) => "settlement_failed",
            WeftError::SignatureInvalid(_) => "signature_invalid",
            WeftError::UserBanned(_) => "user_banned",
            WeftError::RateLimited => "rate_limited",
            WeftError::Unavailable(_) => "unavailable",
            WeftError::ContentMismatch => "content_mismatch",
            WeftError::FraudPenalty(_) => "fraud_penalty",
            WeftError::Timeout(_) => "timeout",
            WeftError::Internal(_) => "internal",
        }
    }

    /// HTTP status the tag maps to on the public surfaces.
    pub fn status_code(&self) -> u16 {
        match self {
            WeftError::BadRequest(_) => 400,
            WeftError::Duplicate(_) | WeftError::InProgress(_) => 409,
            WeftError::TooLarge { .. } => 413,
            WeftError::InsufficientCredit { .. }
            | WeftError::PaymentRequired(_)
            | WeftError::NonceReplayed
            | WeftError::SignatureInvalid(_)
            | WeftError::FraudPenalty(_) => 402,
            WeftError::UserBanned(_) => 403,
            WeftError::RateLimited => 429,
            WeftError::SettlementFailed(_) | WeftError::Unavailable(_) => 503,
            WeftError::ContentMismatch => 400,
            WeftError::Timeout(_) => 504,
            WeftError::Internal(_) => 500,
        }
    }

    /// Whether a worker should requeue the failed job with backoff.
    /// Permanent verdicts (mismatched content, rejected signatures,
    /// accounting outcomes) are handled in place, never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WeftError::Unavailable(_)
                | WeftError::Timeout(_)
                | WeftError::RateLimited
                | WeftError::SettlementFailed(_)
                | WeftError::Internal(_)
        )
    }

    /// Retry hint in seconds for 429/503 responses.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            WeftError::RateLimited => Some(1),
            WeftError::Unavailable(_) | WeftError::SettlementFailed(_) => Some(30),
            _ => None,
        }
    }

    /// Build a `reqwest` transport failure into the taxonomy.
    pub fn from_transport(context: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            WeftError::Timeout(format!("{context}: {err}"))
        } else {
            WeftError::Unavailable(format!("{context}: {err}"))
        }
    }
}
