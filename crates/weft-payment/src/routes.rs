use actix_web::{get, post, web, HttpRequest, HttpResponse};
use weft::private_api::*;

use crate::db::CreditReason;
use crate::error::PaymentError;
use crate::metrics;
use crate::pricing::requirements_for;
use crate::state::AppState;

/// Validate the bearer token on a private-surface request.
fn private_auth_ok(req: &HttpRequest, state: &AppState) -> bool {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    if weft::auth::verify_bearer(&state.private_secret, header) {
        true
    } else {
        let reason = if header.is_none() { "missing" } else { "invalid" };
        metrics::AUTH_FAILURES.with_label_values(&[reason]).inc();
        tracing::warn!(reason, "private surface authentication failed");
        false
    }
}

/// 401 with the standard error body; distinct from the taxonomy mapping
/// because auth failures are not a ledger outcome.
fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(serde_json::json!({
        "error": "unauthorized",
        "message": "valid bearer token required"
    }))
}

macro_rules! check_auth {
    ($req:expr, $state:expr) => {
        if !private_auth_ok($req, $state) {
            return Ok(unauthorized());
        }
    };
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    // The database is the only hard dependency worth probing here.
    match state.db.expire_reservations() {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "weft-payment",
        })),
        Err(e) => {
            tracing::error!(error = %e, "health probe failed");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "degraded",
                "service": "weft-payment",
            }))
        }
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let Some(token) = &state.metrics_token else {
        return HttpResponse::Forbidden().json(serde_json::json!({
            "error": "forbidden",
            "message": "set METRICS_TOKEN to enable /metrics"
        }));
    };
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| weft::auth::verify_bearer(token.as_bytes(), Some(v)))
        .unwrap_or(false);
    if !authorized {
        return unauthorized();
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

#[post("/private/reserve")]
pub async fn reserve(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ReserveRequest>,
) -> Result<HttpResponse, PaymentError> {
    check_auth!(&req, &state);
    let body = body.into_inner();
    let result = state.ledger.reserve_credit(
        &body.address,
        body.address_kind,
        body.item_id.as_deref(),
        body.byte_count,
    );
    match result {
        Ok(row) => {
            metrics::RESERVE_REQUESTS
                .with_label_values(&["success"])
                .inc();
            Ok(HttpResponse::Ok().json(ReserveResponse {
                reservation_id: row.reservation_id,
                credits_reserved: row.credits_reserved,
            }))
        }
        Err(e) => {
            metrics::RESERVE_REQUESTS
                .with_label_values(&["rejected"])
                .inc();
            Err(e)
        }
    }
}

#[post("/private/consume")]
pub async fn consume(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ConsumeRequest>,
) -> Result<HttpResponse, PaymentError> {
    check_auth!(&req, &state);
    let (credits_charged, buffer_released) =
        state.ledger.consume_reservation(&body.reservation_id)?;
    metrics::LEDGER_OPS
        .with_label_values(&["consume", "success"])
        .inc();
    Ok(HttpResponse::Ok().json(ConsumeResponse {
        credits_charged,
        buffer_released,
    }))
}

#[post("/private/refund")]
pub async fn refund(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<RefundRequest>,
) -> Result<HttpResponse, PaymentError> {
    check_auth!(&req, &state);
    state.ledger.refund_reservation(&body.reservation_id)?;
    metrics::LEDGER_OPS
        .with_label_values(&["refund", "success"])
        .inc();
    Ok(HttpResponse::Ok().json(StatusResponse {
        status: "refunded".to_string(),
    }))
}

#[post("/private/adjust")]
pub async fn adjust(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<AdjustRequest>,
) -> Result<HttpResponse, PaymentError> {
    check_auth!(&req, &state);
    let reason = CreditReason::parse(&body.reason).map_err(PaymentError::Core)?;
    let resulting_balance = state.ledger.adjust_balance(
        &body.address,
        body.address_kind,
        body.delta,
        reason,
        &body.reference_id,
    )?;
    metrics::LEDGER_OPS
        .with_label_values(&["adjust", "success"])
        .inc();
    Ok(HttpResponse::Ok().json(AdjustResponse { resulting_balance }))
}

#[post("/private/quote")]
pub async fn quote(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<QuoteRequest>,
) -> Result<HttpResponse, PaymentError> {
    check_auth!(&req, &state);
    if body.byte_count == 0 {
        return Err(PaymentError::bad_request("byte count must be positive"));
    }
    let (_, buffered) = state.ledger.priced_with_buffer(body.byte_count);
    let accepts = state
        .x402
        .networks()
        .iter()
        .map(|network| {
            requirements_for(
                state.ledger.oracle(),
                network,
                state.x402.pay_to(),
                buffered,
                body.byte_count,
                state.x402.max_timeout_secs(),
            )
        })
        .collect();
    Ok(HttpResponse::Ok().json(QuoteResponse {
        credits: buffered,
        accepts,
    }))
}

#[post("/private/x402/verifyAndSettle")]
pub async fn x402_verify_and_settle(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<X402SettleRequest>,
) -> Result<HttpResponse, PaymentError> {
    check_auth!(&req, &state);
    let start = std::time::Instant::now();
    let result = state.x402.verify_and_settle(body.into_inner()).await;
    let elapsed = start.elapsed().as_secs_f64();
    match result {
        Ok(resp) => {
            metrics::SETTLE_REQUESTS
                .with_label_values(&["success"])
                .inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&["success"])
                .observe(elapsed);
            Ok(HttpResponse::Ok().json(resp))
        }
        Err(e) => {
            let label = if e.status() >= 500 { "error" } else { "rejected" };
            metrics::SETTLE_REQUESTS.with_label_values(&[label]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&[label])
                .observe(elapsed);
            Err(e)
        }
    }
}

#[post("/private/x402/finalize")]
pub async fn x402_finalize(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<X402FinalizeRequest>,
) -> Result<HttpResponse, PaymentError> {
    check_auth!(&req, &state);
    let resp = state.x402.finalize(body.into_inner())?;
    metrics::FINALIZE_VERDICTS
        .with_label_values(&[resp.status.as_str()])
        .inc();
    Ok(HttpResponse::Ok().json(resp))
}
