use actix_web::{get, post, put, web, HttpRequest, HttpResponse};
use futures::StreamExt;
use serde::Deserialize;
use weft::private_api::{X402FinalizeRequest, X402SettleRequest};
use weft::x402::{PaymentMode, PaymentRequiredBody, X402_VERSION};
use weft::{ItemId, SignatureKind, WeftError};

use crate::error::UploadError;
use crate::ingest::{ingest_stream, IngestMeta};
use crate::metrics;
use crate::multipart;
use crate::state::AppState;

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn parse_meta(req: &HttpRequest) -> Result<IngestMeta, UploadError> {
    let content_length = header(req, "content-length")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| UploadError::bad_request("Content-Length header is required"))?;

    let owner = header(req, "x-owner-address")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| UploadError::bad_request("x-owner-address header is required"))?
        .to_string();

    let kind = header(req, "x-signature-kind")
        .ok_or_else(|| UploadError::bad_request("x-signature-kind header is required"))
        .and_then(|v| SignatureKind::parse(v).map_err(UploadError::Core))?;

    let declared_id = match header(req, "x-data-item-id") {
        Some(v) => Some(ItemId::parse(v).map_err(UploadError::Core)?),
        None => None,
    };

    let payment_mode = match header(req, "x-payment-mode") {
        Some(v) => PaymentMode::parse(v).map_err(UploadError::Core)?,
        None => PaymentMode::Hybrid,
    };

    let is_container = header(req, "content-type")
        .map(|v| v.eq_ignore_ascii_case("application/x-bundle"))
        .unwrap_or(false);

    Ok(IngestMeta {
        content_length,
        owner,
        kind,
        declared_id,
        payment_header: header(req, "x-payment").map(str::to_string),
        payment_mode,
        is_container,
    })
}

/// Render an ingest failure: `PaymentRequired` carries the prebuilt 402
/// quote body; everything else uses the standard error mapping.
fn ingest_error_response(err: UploadError) -> Result<HttpResponse, UploadError> {
    if let UploadError::Core(WeftError::PaymentRequired(Some(body))) = &err {
        return Ok(HttpResponse::PaymentRequired()
            .content_type("application/json")
            .body(body.clone()));
    }
    Err(err)
}

#[post("/tx")]
pub async fn post_tx(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, UploadError> {
    let start = std::time::Instant::now();
    let meta = parse_meta(&req)?;
    let stream = payload.map(|chunk| {
        chunk.map_err(|e| WeftError::BadRequest(format!("upload stream error: {e}")))
    });

    match ingest_stream(&state.ctx, meta, stream).await {
        Ok(outcome) => {
            metrics::INGEST_REQUESTS.with_label_values(&["accepted"]).inc();
            metrics::INGEST_LATENCY
                .with_label_values(&["accepted"])
                .observe(start.elapsed().as_secs_f64());
            Ok(HttpResponse::Ok().json(outcome))
        }
        Err(e) => {
            metrics::INGEST_REQUESTS
                .with_label_values(&[e.as_wire().error.as_str()])
                .inc();
            metrics::INGEST_LATENCY
                .with_label_values(&["rejected"])
                .observe(start.elapsed().as_secs_f64());
            ingest_error_response(e)
        }
    }
}

#[post("/uploads")]
pub async fn init_multipart(state: web::Data<AppState>) -> Result<HttpResponse, UploadError> {
    let row = state.ctx.db.create_multipart(state.ctx.cfg.multipart_ttl_secs)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "uploadId": row.upload_id,
        "expiresAt": row.expires_at,
    })))
}

#[put("/uploads/{upload_id}/{part}")]
pub async fn put_part(
    req: HttpRequest,
    path: web::Path<(String, u32)>,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, UploadError> {
    let (upload_id, part) = path.into_inner();
    let content_length = header(&req, "content-length")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| UploadError::bad_request("Content-Length header is required"))?;

    let stream = payload.map(|chunk| {
        chunk.map_err(|e| WeftError::BadRequest(format!("upload stream error: {e}")))
    });
    let etag = multipart::put_part(&state.ctx, &upload_id, part, content_length, stream).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "etag": etag })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeMultipartBody {
    pub parts: Vec<u32>,
}

#[post("/uploads/{upload_id}/finalize")]
pub async fn finalize_multipart(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<FinalizeMultipartBody>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, UploadError> {
    let upload_id = path.into_inner();
    // Content length is resolved from the stored parts.
    let mut meta = parse_meta_lenient(&req)?;
    meta.content_length = 0;

    match multipart::finalize(&state.ctx, &upload_id, &body.parts, meta).await {
        Ok(outcome) => Ok(HttpResponse::Ok().json(outcome)),
        Err(e) => ingest_error_response(e),
    }
}

/// Like [`parse_meta`] but without requiring Content-Length (multipart
/// finalize computes it from the parts).
fn parse_meta_lenient(req: &HttpRequest) -> Result<IngestMeta, UploadError> {
    let owner = header(req, "x-owner-address")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| UploadError::bad_request("x-owner-address header is required"))?
        .to_string();
    let kind = header(req, "x-signature-kind")
        .ok_or_else(|| UploadError::bad_request("x-signature-kind header is required"))
        .and_then(|v| SignatureKind::parse(v).map_err(UploadError::Core))?;
    let declared_id = match header(req, "x-data-item-id") {
        Some(v) => Some(ItemId::parse(v).map_err(UploadError::Core)?),
        None => None,
    };
    let payment_mode = match header(req, "x-payment-mode") {
        Some(v) => PaymentMode::parse(v).map_err(UploadError::Core)?,
        None => PaymentMode::Hybrid,
    };
    Ok(IngestMeta {
        content_length: 0,
        owner,
        kind,
        declared_id,
        payment_header: header(req, "x-payment").map(str::to_string),
        payment_mode,
        is_container: false,
    })
}

#[get("/bytes/{byte_count}")]
pub async fn price_bytes(
    path: web::Path<u64>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, UploadError> {
    let byte_count = path.into_inner();
    if byte_count == 0 {
        return Err(UploadError::bad_request("byte count must be positive"));
    }
    let quote = state.ctx.payment.quote(byte_count).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "credits": quote.credits,
        "adjustments": [],
    })))
}

#[get("/price/{kind}/{address}")]
pub async fn x402_price(
    path: web::Path<(String, String)>,
    query: web::Query<std::collections::HashMap<String, String>>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, UploadError> {
    let (kind, _address) = path.into_inner();
    SignatureKind::parse(&kind).map_err(UploadError::Core)?;
    let byte_count: u64 = query
        .get("bytes")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| UploadError::bad_request("bytes query parameter is required"))?;
    if byte_count == 0 {
        return Err(UploadError::bad_request("byte count must be positive"));
    }

    let quote = state.ctx.payment.quote(byte_count).await?;
    // A quote is, by protocol, a 402 response.
    Ok(HttpResponse::PaymentRequired().json(PaymentRequiredBody {
        x402_version: X402_VERSION,
        accepts: quote.accepts,
        description: Some(format!("upload of {byte_count} bytes")),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X402PaymentBody {
    pub payment_header: String,
    #[serde(default)]
    pub data_item_id: Option<String>,
    #[serde(default)]
    pub byte_count: Option<u64>,
    #[serde(default)]
    pub mode: Option<PaymentMode>,
}

#[post("/payment/{kind}/{address}")]
pub async fn x402_payment(
    path: web::Path<(String, String)>,
    body: web::Json<X402PaymentBody>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, UploadError> {
    let (kind, address) = path.into_inner();
    let kind = SignatureKind::parse(&kind).map_err(UploadError::Core)?;
    let body = body.into_inner();
    let byte_count = body
        .byte_count
        .ok_or_else(|| UploadError::bad_request("byteCount is required"))?;

    let result = state
        .ctx
        .payment
        .x402_settle(X402SettleRequest {
            payment_header: body.payment_header,
            address,
            address_kind: kind,
            byte_count,
            item_id: body.data_item_id,
            mode: body.mode.unwrap_or(PaymentMode::Hybrid),
        })
        .await;

    match result {
        Ok(resp) => Ok(HttpResponse::Ok().json(resp)),
        Err(e) => Ok(x402_rejection(e)),
    }
}

/// §x402 status mapping: bans are 403, settlement/transport trouble is
/// 503, every verification failure is a 402 with a machine-readable
/// reason.
fn x402_rejection(err: WeftError) -> HttpResponse {
    match &err {
        WeftError::UserBanned(_) => HttpResponse::Forbidden().json(serde_json::json!({
            "error": "user_banned",
            "message": err.to_string(),
        })),
        WeftError::SettlementFailed(_) | WeftError::Unavailable(_) | WeftError::Timeout(_) => {
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "settlement_failed",
                "message": err.to_string(),
            }))
        }
        _ => HttpResponse::PaymentRequired().json(serde_json::json!({
            "x402Version": X402_VERSION,
            "invalidReason": err.tag(),
            "message": err.to_string(),
        })),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X402FinalizeBody {
    pub data_item_id: String,
    pub actual_byte_count: u64,
}

/// Internal finalize hook, gated by the shared service secret.
#[post("/finalize")]
pub async fn x402_finalize(
    req: HttpRequest,
    body: web::Json<X402FinalizeBody>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, UploadError> {
    let authorized = weft::auth::verify_bearer(
        &state.internal_secret,
        header(&req, "authorization"),
    );
    if !authorized {
        return Ok(HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "unauthorized",
            "message": "valid bearer token required"
        })));
    }

    let resp = state
        .ctx
        .payment
        .x402_finalize(X402FinalizeRequest {
            payment_id: None,
            item_id: Some(body.data_item_id.clone()),
            actual_byte_count: body.actual_byte_count,
        })
        .await?;
    Ok(HttpResponse::Ok().json(resp))
}

#[get("/v1/tx/{item_id}/status")]
pub async fn tx_status(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, UploadError> {
    let item_id = path.into_inner();
    match state.ctx.db.item_state(&item_id)? {
        Some(state) => {
            let bundle_id = match &state {
                crate::db::ItemState::Planned { bundle_id }
                | crate::db::ItemState::Permanent { bundle_id } => Some(bundle_id.clone()),
                _ => None,
            };
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "status": state.as_str(),
                "bundleId": bundle_id,
            })))
        }
        None => Ok(HttpResponse::NotFound().json(serde_json::json!({
            "error": "not_found",
            "message": format!("unknown data item: {item_id}"),
        }))),
    }
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let db_ok = state.ctx.db.table_count("bundle").is_ok();
    let queue_ok = state.ctx.queue.dead_count().is_ok();
    if db_ok && queue_ok {
        HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "weft-upload",
        }))
    } else {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "degraded",
            "service": "weft-upload",
        }))
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
    let authorized = header(&req, "authorization")
        .map(|v| weft::auth::verify_bearer(token.as_bytes(), Some(v)))
        .unwrap_or(false);
    if !authorized {
        return HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "unauthorized",
            "message": "valid bearer token required"
        }));
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}
