//! x402 wire types.
//!
//! The `X-PAYMENT` header carries a base64-encoded JSON envelope holding
//! one EIP-3009 authorization plus its signature. The 402 response body
//! advertises what the server accepts. Field sets are fixed; unknown
//! fields are rejected rather than forwarded.

use alloy::primitives::{Address, FixedBytes};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::WeftError;

/// Protocol version this implementation speaks.
pub const X402_VERSION: u32 = 1;

/// How a settled payment is applied to the payer's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    /// Pay for exactly this upload; excess over the price is credited.
    Payg,
    /// Credit the entire value; no reservation is created.
    Topup,
    /// Reserve the upload price, credit the excess.
    Hybrid,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Payg => "payg",
            PaymentMode::Topup => "topup",
            PaymentMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Result<Self, WeftError> {
        match s {
            "payg" => Ok(PaymentMode::Payg),
            "topup" => Ok(PaymentMode::Topup),
            "hybrid" => Ok(PaymentMode::Hybrid),
            other => Err(WeftError::BadRequest(format!(
                "unknown payment mode: {other}"
            ))),
        }
    }
}

/// The EIP-3009 authorization inside the header envelope.
/// `value` is a decimal string in the token's smallest unit;
/// `valid_after`/`valid_before` are seconds since epoch; `nonce` is a
/// 32-byte hex string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Eip3009Authorization {
    pub from: Address,
    pub to: Address,
    pub value: String,
    pub valid_after: u64,
    pub valid_before: u64,
    pub nonce: String,
}

impl Eip3009Authorization {
    /// Parse the nonce into its fixed 32-byte form.
    pub fn nonce_bytes(&self) -> Result<FixedBytes<32>, WeftError> {
        let hex = self.nonce.strip_prefix("0x").unwrap_or(&self.nonce);
        let raw = alloy::hex::decode(hex)
            .map_err(|_| WeftError::BadRequest("nonce is not valid hex".to_string()))?;
        if raw.len() != 32 {
            return Err(WeftError::BadRequest(format!(
                "nonce must be 32 bytes, got {}",
                raw.len()
            )));
        }
        Ok(FixedBytes::from_slice(&raw))
    }

    /// Parse `value` into a token amount.
    pub fn value_units(&self) -> Result<u128, WeftError> {
        self.value
            .parse::<u128>()
            .map_err(|_| WeftError::BadRequest("value is not a decimal amount".to_string()))
    }
}

/// Authorization plus its detached signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SignedAuthorization {
    pub authorization: Eip3009Authorization,
    /// 65-byte secp256k1 signature, hex with optional 0x prefix.
    pub signature: String,
}

/// The decoded `X-PAYMENT` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PaymentHeader {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: SignedAuthorization,
}

impl PaymentHeader {
    /// Decode the base64 header value. Malformed input is a
    /// [`WeftError::BadRequest`]; a wrong version or scheme is caught
    /// here too so callers only see envelopes they can verify.
    pub fn decode(header: &str) -> Result<Self, WeftError> {
        let raw = BASE64
            .decode(header.trim())
            .map_err(|_| WeftError::BadRequest("payment header is not valid base64".to_string()))?;
        let parsed: PaymentHeader = serde_json::from_slice(&raw)
            .map_err(|e| WeftError::BadRequest(format!("payment header is not valid JSON: {e}")))?;
        if parsed.x402_version != X402_VERSION {
            return Err(WeftError::BadRequest(format!(
                "unsupported x402 version: {}",
                parsed.x402_version
            )));
        }
        if parsed.scheme != crate::network::SCHEME_EIP3009 {
            return Err(WeftError::BadRequest(format!(
                "unsupported payment scheme: {}",
                parsed.scheme
            )));
        }
        Ok(parsed)
    }

    /// Encode back to the base64 header form.
    pub fn encode(&self) -> String {
        // Serialization of a fixed struct cannot fail.
        BASE64.encode(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// One entry of the `accepts` array in a 402 quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Required amount in the token's smallest unit, decimal string.
    pub max_amount_required: String,
    /// What the payment buys, e.g. `upload/2048-bytes`.
    pub resource: String,
    pub asset: Address,
    pub pay_to: Address,
    pub max_timeout_seconds: u64,
    pub extra: PaymentRequirementsExtra,
}

/// EIP-712 domain hints the client needs to sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirementsExtra {
    pub name: String,
    pub version: String,
}

/// The 402 response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub x402_version: u32,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header_json() -> serde_json::Value {
        serde_json::json!({
            "x402Version": 1,
            "scheme": "eip-3009",
            "network": "base-mainnet",
            "payload": {
                "authorization": {
                    "from": "0x1111111111111111111111111111111111111111",
                    "to": "0x2222222222222222222222222222222222222222",
                    "value": "150000",
                    "validAfter": 0,
                    "validBefore": 4102444800u64,
                    "nonce": format!("0x{}", "ab".repeat(32)),
                },
                "signature": format!("0x{}", "cd".repeat(65)),
            },
        })
    }

    #[test]
    fn decode_roundtrip() {
        let b64 = BASE64.encode(serde_json::to_vec(&sample_header_json()).unwrap());
        let header = PaymentHeader::decode(&b64).unwrap();
        assert_eq!(header.network, "base-mainnet");
        assert_eq!(header.payload.authorization.value_units().unwrap(), 150000);
        assert_eq!(header.payload.authorization.nonce_bytes().unwrap().len(), 32);

        let again = PaymentHeader::decode(&header.encode()).unwrap();
        assert_eq!(again.payload.authorization.value, "150000");
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut v = sample_header_json();
        v["payload"]["authorization"]["extraField"] = serde_json::json!(true);
        let b64 = BASE64.encode(serde_json::to_vec(&v).unwrap());
        assert!(PaymentHeader::decode(&b64).is_err());
    }

    #[test]
    fn rejects_wrong_version_and_scheme() {
        let mut v = sample_header_json();
        v["x402Version"] = serde_json::json!(2);
        let b64 = BASE64.encode(serde_json::to_vec(&v).unwrap());
        assert!(PaymentHeader::decode(&b64).is_err());

        let mut v = sample_header_json();
        v["scheme"] = serde_json::json!("eip-2612");
        let b64 = BASE64.encode(serde_json::to_vec(&v).unwrap());
        assert!(PaymentHeader::decode(&b64).is_err());
    }

    #[test]
    fn rejects_bad_nonce() {
        let mut v = sample_header_json();
        v["payload"]["authorization"]["nonce"] = serde_json::json!("0xabcd");
        let b64 = BASE64.encode(serde_json::to_vec(&v).unwrap());
        let header = PaymentHeader::decode(&b64).unwrap();
        assert!(header.payload.authorization.nonce_bytes().is_err());
    }

    #[test]
    fn rejects_garbage_base64() {
        assert!(PaymentHeader::decode("!!not-base64!!").is_err());
    }
}
