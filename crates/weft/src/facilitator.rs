//! HTTP client for the external settlement facilitator.
//!
//! The facilitator accepts a signed EIP-3009 authorization and returns a
//! settled on-chain transaction hash. Calls are bounded by a timeout and
//! retried through at most one fallback facilitator; a rejection from
//! the primary is final (the fallback is for reachability only).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::x402::{PaymentHeader, PaymentRequirements};
use crate::WeftError;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettleRequest<'a> {
    payment_payload: &'a PaymentHeader,
    payment_requirements: &'a PaymentRequirements,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleWireResponse {
    success: bool,
    #[serde(default)]
    error_reason: Option<String>,
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    network: Option<String>,
}

/// A settled payment as reported by the facilitator.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub tx_hash: String,
    pub network: String,
}

pub struct FacilitatorClient {
    client: reqwest::Client,
    primary_url: String,
    fallback_url: Option<String>,
    timeout: Duration,
}

impl FacilitatorClient {
    pub fn new(primary_url: String, fallback_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            primary_url,
            fallback_url,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Settle one authorization. Returns the on-chain transaction hash.
    pub async fn settle(
        &self,
        header: &PaymentHeader,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement, WeftError> {
        match self.settle_at(&self.primary_url, header, requirements).await {
            Ok(settlement) => Ok(settlement),
            // Only transport-level failures fall through to the fallback.
            Err(e @ (WeftError::Timeout(_) | WeftError::Unavailable(_))) => {
                let Some(fallback) = &self.fallback_url else {
                    return Err(e);
                };
                tracing::warn!(
                    error = %e,
                    fallback = %fallback,
                    "primary facilitator unreachable, trying fallback"
                );
                self.settle_at(fallback, header, requirements).await
            }
            Err(e) => Err(e),
        }
    }

    async fn settle_at(
        &self,
        base_url: &str,
        header: &PaymentHeader,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement, WeftError> {
        let url = format!("{}/settle", base_url.trim_end_matches('/'));
        let body = SettleRequest {
            payment_payload: header,
            payment_requirements: requirements,
        };

        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| WeftError::from_transport("facilitator", &e))?;

        if resp.status().is_server_error() {
            return Err(WeftError::Unavailable(format!(
                "facilitator returned {}",
                resp.status()
            )));
        }

        let wire: SettleWireResponse = resp
            .json()
            .await
            .map_err(|e| WeftError::SettlementFailed(format!("unparseable response: {e}")))?;

        if !wire.success {
            return Err(WeftError::SettlementFailed(
                wire.error_reason
                    .unwrap_or_else(|| "facilitator rejected the payment".to_string()),
            ));
        }

        let tx_hash = wire.transaction.ok_or_else(|| {
            WeftError::SettlementFailed("facilitator returned no transaction hash".to_string())
        })?;

        Ok(Settlement {
            tx_hash,
            network: wire
                .network
                .unwrap_or_else(|| header.network.clone()),
        })
    }
}
