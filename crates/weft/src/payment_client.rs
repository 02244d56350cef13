//! HTTP client for the payment service's private surface.
//!
//! Every call authenticates with the shared bearer secret and passes
//! through the circuit breaker: when the breaker is open the call is
//! rejected immediately with `Unavailable` so ingest can answer 503
//! without blocking. Business rejections (402, 403, 409) count as
//! successful calls for the breaker; only transport failures and 5xx
//! trip it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::private_api::*;
use crate::WeftError;

pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 15;

/// The payment operations the upload service depends on. The production
/// implementation is [`PaymentClient`]; tests substitute a stub.
#[async_trait]
pub trait PaymentApi: Send + Sync {
    async fn reserve(&self, req: ReserveRequest) -> Result<ReserveResponse, WeftError>;
    async fn consume(&self, reservation_id: &str) -> Result<ConsumeResponse, WeftError>;
    async fn refund(&self, reservation_id: &str) -> Result<StatusResponse, WeftError>;
    async fn adjust(&self, req: AdjustRequest) -> Result<AdjustResponse, WeftError>;
    async fn quote(&self, byte_count: u64) -> Result<QuoteResponse, WeftError>;
    async fn x402_settle(&self, req: X402SettleRequest) -> Result<X402SettleResponse, WeftError>;
    async fn x402_finalize(
        &self,
        req: X402FinalizeRequest,
    ) -> Result<X402FinalizeResponse, WeftError>;
}

pub struct PaymentClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl PaymentClient {
    pub fn new(base_url: String, secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            secret,
            breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn call<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, WeftError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        if !self.breaker.allow() {
            return Err(WeftError::Unavailable(
                "payment service circuit open".to_string(),
            ));
        }

        let url = format!("{}{path}", self.base_url.trim_end_matches('/'));
        let result = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header("Authorization", auth::bearer_value(&self.secret))
            .json(body)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.breaker.record(false);
                return Err(WeftError::from_transport("payment service", &e));
            }
        };

        let status = resp.status();
        if status.is_server_error() {
            self.breaker.record(false);
            let body = resp.json::<ErrorBody>().await.ok();
            return Err(body.map(ErrorBody::into_error).unwrap_or_else(|| {
                WeftError::Unavailable(format!("payment service returned {status}"))
            }));
        }

        // 4xx rejections are well-formed answers; the dependency is healthy.
        self.breaker.record(true);

        if !status.is_success() {
            let body = resp.json::<ErrorBody>().await.map_err(|e| {
                WeftError::Internal(format!("unparseable payment error body: {e}"))
            })?;
            return Err(body.into_error());
        }

        resp.json::<Resp>()
            .await
            .map_err(|e| WeftError::Internal(format!("unparseable payment response: {e}")))
    }
}

#[async_trait]
impl PaymentApi for PaymentClient {
    async fn reserve(&self, req: ReserveRequest) -> Result<ReserveResponse, WeftError> {
        self.call("/private/reserve", &req).await
    }

    async fn consume(&self, reservation_id: &str) -> Result<ConsumeResponse, WeftError> {
        self.call(
            "/private/consume",
            &ConsumeRequest {
                reservation_id: reservation_id.to_string(),
            },
        )
        .await
    }

    async fn refund(&self, reservation_id: &str) -> Result<StatusResponse, WeftError> {
        self.call(
            "/private/refund",
            &RefundRequest {
                reservation_id: reservation_id.to_string(),
            },
        )
        .await
    }

    async fn adjust(&self, req: AdjustRequest) -> Result<AdjustResponse, WeftError> {
        self.call("/private/adjust", &req).await
    }

    async fn quote(&self, byte_count: u64) -> Result<QuoteResponse, WeftError> {
        self.call("/private/quote", &QuoteRequest { byte_count })
            .await
    }

    async fn x402_settle(&self, req: X402SettleRequest) -> Result<X402SettleResponse, WeftError> {
        self.call("/private/x402/verifyAndSettle", &req).await
    }

    async fn x402_finalize(
        &self,
        req: X402FinalizeRequest,
    ) -> Result<X402FinalizeResponse, WeftError> {
        self.call("/private/x402/finalize", &req).await
    }
}
