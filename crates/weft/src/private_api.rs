//! Typed bodies for the private Upload→Payment surface.
//!
//! Both services depend on these so the wire contract lives in one
//! place. All bodies are camelCase JSON with fixed field sets.

use serde::{Deserialize, Serialize};

use crate::item::SignatureKind;
use crate::x402::{PaymentMode, PaymentRequirements};
use crate::WeftError;

/// Structured error body returned by every endpoint on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable tag from the platform taxonomy.
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorBody {
    pub fn from_error(err: &WeftError) -> Self {
        Self {
            error: err.tag().to_string(),
            message: err.to_string(),
            detail: None,
            retry_after: err.retry_after(),
        }
    }

    /// Reconstruct the taxonomy variant on the client side of a call.
    pub fn into_error(self) -> WeftError {
        match self.error.as_str() {
            "bad_request" => WeftError::BadRequest(self.message),
            "duplicate" => WeftError::Duplicate(self.message),
            "in_progress" => WeftError::InProgress(self.message),
            "too_large" => WeftError::TooLarge { limit: 0, actual: 0 },
            "insufficient_credit" => WeftError::InsufficientCredit {
                required: 0,
                available: 0,
            },
            "payment_required" => WeftError::PaymentRequired(self.detail),
            "nonce_replayed" => WeftError::NonceReplayed,
            "settlement_failed" => WeftError::SettlementFailed(self.message),
            "signature_invalid" => WeftError::SignatureInvalid(self.message),
            "user_banned" => WeftError::UserBanned(self.message),
            "rate_limited" => WeftError::RateLimited,
            "unavailable" => WeftError::Unavailable(self.message),
            "content_mismatch" => WeftError::ContentMismatch,
            "fraud_penalty" => WeftError::FraudPenalty(self.message),
            "timeout" => WeftError::Timeout(self.message),
            _ => WeftError::Internal(self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub address: String,
    pub address_kind: SignatureKind,
    pub byte_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResponse {
    pub reservation_id: String,
    pub credits_reserved: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub credits_charged: u64,
    pub buffer_released: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustRequest {
    pub address: String,
    pub address_kind: SignatureKind,
    pub delta: i64,
    pub reason: String,
    pub reference_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustResponse {
    pub resulting_balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub byte_count: u64,
}

/// Price quote: credits owed, plus the 402 `accepts` entries for every
/// enabled settlement network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub credits: u64,
    pub accepts: Vec<PaymentRequirements>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X402SettleRequest {
    /// The raw base64 `X-PAYMENT` header value.
    pub payment_header: String,
    pub address: String,
    pub address_kind: SignatureKind,
    pub byte_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub mode: PaymentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X402SettleResponse {
    pub payment_id: String,
    pub tx_hash: String,
    /// Credits equivalent of the settled token value.
    pub credits_paid: u64,
    /// Credits held in the reservation created for this upload (payg/hybrid).
    pub credits_reserved: u64,
    /// Credits added to the user's balance beyond the reservation.
    pub credits_credited: u64,
    pub mode: PaymentMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X402FinalizeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub actual_byte_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X402FinalizeResponse {
    /// Final payment status: `confirmed`, `fraud_penalty`, or `refunded`.
    pub status: String,
    pub actual_byte_count: u64,
    pub refund_credits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraud_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<String>,
}
