use actix_web::{test, web, App};
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;

use weft::eip3009;
use weft::facilitator::FacilitatorClient;
use weft::x402::Eip3009Authorization;
use weft::NetworkConfig;
use weft_payment::db::PaymentDb;
use weft_payment::ledger::Ledger;
use weft_payment::pricing::FixedRateOracle;
use weft_payment::routes;
use weft_payment::state::AppState;
use weft_payment::x402::{FraudPolicy, X402Processor};

const SECRET: &str = "integration-test-secret";

fn pay_to() -> Address {
    Address::repeat_byte(0x22)
}

/// Build an AppState backed by in-memory storage and an unreachable
/// facilitator (nothing listens on localhost:1).
fn make_state() -> web::Data<AppState> {
    let db = Arc::new(PaymentDb::open(":memory:").unwrap());
    let oracle = Arc::new(FixedRateOracle::new(10_000, 1_000_000_000));
    let ledger = Arc::new(Ledger::new(Arc::clone(&db), oracle, 15, 3_600));
    let facilitator = FacilitatorClient::new("http://localhost:1".to_string(), None)
        .with_timeout(Duration::from_millis(500));
    let x402 = Arc::new(X402Processor::new(
        Arc::clone(&db),
        Arc::clone(&ledger),
        facilitator,
        NetworkConfig::known(),
        pay_to(),
        900,
        FraudPolicy {
            tolerance_pct: 1.0,
            warning_pct: 0.5,
            major_pct: 5.0,
            overpayment_pct: 10.0,
            ban_count: 3,
            ban_days: 30,
            window_days: 30,
        },
    ));
    web::Data::new(AppState {
        db,
        ledger,
        x402,
        private_secret: SECRET.as_bytes().to_vec(),
        metrics_token: None,
    })
}

macro_rules! private_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .app_data(web::JsonConfig::default().limit(65_536))
                .service(routes::reserve)
                .service(routes::consume)
                .service(routes::refund)
                .service(routes::adjust)
                .service(routes::quote)
                .service(routes::x402_verify_and_settle)
                .service(routes::x402_finalize),
        )
        .await
    };
}

fn authed(req: test::TestRequest) -> test::TestRequest {
    req.insert_header(("Authorization", format!("Bearer {SECRET}")))
}

#[actix_rt::test]
async fn private_surface_requires_bearer() {
    let state = make_state();
    let app = private_app!(state);

    let req = test::TestRequest::post()
        .uri("/private/reserve")
        .set_json(serde_json::json!({
            "address": "alice", "addressKind": "arweave", "byteCount": 1024
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::post()
        .uri("/private/reserve")
        .insert_header(("Authorization", "Bearer wrong-secret"))
        .set_json(serde_json::json!({
            "address": "alice", "addressKind": "arweave", "byteCount": 1024
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_rt::test]
async fn reserve_consume_lifecycle_over_http() {
    let state = make_state();
    let app = private_app!(state);

    // Seed balance via the adjust endpoint.
    let req = authed(test::TestRequest::post().uri("/private/adjust").set_json(
        serde_json::json!({
            "address": "alice", "addressKind": "arweave",
            "delta": 1_000_000, "reason": "topup", "referenceId": "seed"
        }),
    ))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let req = authed(test::TestRequest::post().uri("/private/reserve").set_json(
        serde_json::json!({
            "address": "alice", "addressKind": "arweave", "byteCount": 1024
        }),
    ))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    // 10_000 credits/KiB plus the 15% buffer.
    assert_eq!(body["creditsReserved"], 11_500);
    let reservation_id = body["reservationId"].as_str().unwrap().to_string();

    let req = authed(test::TestRequest::post().uri("/private/consume").set_json(
        serde_json::json!({ "reservationId": reservation_id }),
    ))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["creditsCharged"], 10_000);
    assert_eq!(body["bufferReleased"], 1_500);
}

#[actix_rt::test]
async fn reserve_without_funds_is_402() {
    let state = make_state();
    let app = private_app!(state);

    let req = authed(test::TestRequest::post().uri("/private/reserve").set_json(
        serde_json::json!({
            "address": "pauper", "addressKind": "ethereum", "byteCount": 1024
        }),
    ))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 402);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "insufficient_credit");
}

#[actix_rt::test]
async fn quote_advertises_every_network() {
    let state = make_state();
    let app = private_app!(state);

    let req = authed(
        test::TestRequest::post()
            .uri("/private/quote")
            .set_json(serde_json::json!({ "byteCount": 2048 })),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["credits"], 23_000);
    let accepts = body["accepts"].as_array().unwrap();
    assert_eq!(accepts.len(), 2);
    assert_eq!(accepts[0]["scheme"], "eip-3009");
    assert!(accepts[0]["maxAmountRequired"].as_str().is_some());
}

fn signed_payment_header(signer: &PrivateKeySigner, value: &str) -> String {
    let network = NetworkConfig::base_mainnet();
    let auth = Eip3009Authorization {
        from: signer.address(),
        to: pay_to(),
        value: value.to_string(),
        valid_after: chrono_now() - 60,
        valid_before: chrono_now() + 600,
        nonce: format!("0x{}", alloy::hex::encode(eip3009::random_nonce())),
    };
    let typed = eip3009::typed_authorization(&auth).unwrap();
    let hash = eip3009::signing_hash(&typed, &network);
    let sig = signer.sign_hash_sync(&hash).unwrap();

    let envelope = serde_json::json!({
        "x402Version": 1,
        "scheme": "eip-3009",
        "network": "base-mainnet",
        "payload": {
            "authorization": {
                "from": auth.from,
                "to": auth.to,
                "value": auth.value,
                "validAfter": auth.valid_after,
                "validBefore": auth.valid_before,
                "nonce": auth.nonce,
            },
            "signature": format!("0x{}", alloy::hex::encode(sig.as_bytes())),
        },
    });
    BASE64.encode(serde_json::to_vec(&envelope).unwrap())
}

fn chrono_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A valid header reaches the facilitator (unreachable here → 503);
/// replaying the same header is rejected on the nonce before any
/// facilitator traffic, so it answers 402 even though the facilitator
/// is down.
#[actix_rt::test]
async fn replayed_header_is_rejected_without_settlement() {
    let state = make_state();
    let app = private_app!(state);
    let signer = PrivateKeySigner::random();
    let header = signed_payment_header(&signer, "150000");

    let settle_body = serde_json::json!({
        "paymentHeader": header,
        "address": format!("{:#x}", signer.address()),
        "addressKind": "ethereum",
        "byteCount": 2048,
        "mode": "hybrid",
    });

    let req = authed(
        test::TestRequest::post()
            .uri("/private/x402/verifyAndSettle")
            .set_json(settle_body.clone()),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);

    let req = authed(
        test::TestRequest::post()
            .uri("/private/x402/verifyAndSettle")
            .set_json(settle_body),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 402);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "nonce_replayed");
}

#[actix_rt::test]
async fn tampered_signature_is_rejected_before_settlement() {
    let state = make_state();
    let app = private_app!(state);
    let signer = PrivateKeySigner::random();
    let header = signed_payment_header(&signer, "150000");

    // Declare a different payer than the one who signed.
    let other = PrivateKeySigner::random();
    let mut decoded: serde_json::Value =
        serde_json::from_slice(&BASE64.decode(&header).unwrap()).unwrap();
    decoded["payload"]["authorization"]["from"] =
        serde_json::json!(format!("{:#x}", other.address()));
    let tampered = BASE64.encode(serde_json::to_vec(&decoded).unwrap());

    let req = authed(
        test::TestRequest::post()
            .uri("/private/x402/verifyAndSettle")
            .set_json(serde_json::json!({
                "paymentHeader": tampered,
                "address": format!("{:#x}", other.address()),
                "addressKind": "ethereum",
                "byteCount": 2048,
                "mode": "payg",
            })),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 402);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "signature_invalid");
}

#[actix_rt::test]
async fn underpaid_authorization_is_rejected() {
    let state = make_state();
    let app = private_app!(state);
    let signer = PrivateKeySigner::random();
    // 2048 bytes costs 23 token units (23_000 credits at 1e9/USD, 6
    // decimals); offer only 1.
    let header = signed_payment_header(&signer, "1");

    let req = authed(
        test::TestRequest::post()
            .uri("/private/x402/verifyAndSettle")
            .set_json(serde_json::json!({
                "paymentHeader": header,
                "address": format!("{:#x}", signer.address()),
                "addressKind": "ethereum",
                "byteCount": 2048,
                "mode": "payg",
            })),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 402);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "insufficient_credit");
}
