use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use weft::facilitator::FacilitatorClient;
use weft_payment::config::PaymentConfig;
use weft_payment::db::PaymentDb;
use weft_payment::ledger::Ledger;
use weft_payment::pricing::FixedRateOracle;
use weft_payment::routes;
use weft_payment::state::AppState;
use weft_payment::x402::{FraudPolicy, X402Processor};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match PaymentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    tracing::info!(?config, "starting weft-payment");

    let db = match PaymentDb::open(&config.db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!(error = %e, path = %config.db_path, "cannot open payment database");
            std::process::exit(3);
        }
    };

    let oracle = Arc::new(FixedRateOracle::new(
        config.credits_per_kib,
        config.credits_per_usd,
    ));
    let ledger = Arc::new(Ledger::new(
        Arc::clone(&db),
        oracle,
        config.pricing_buffer_pct,
        config.reservation_ttl_secs,
    ));
    ledger.start_sweeper(config.sweep_interval_secs);

    let facilitator = FacilitatorClient::new(
        config.facilitator_url.clone(),
        config.facilitator_fallback_url.clone(),
    )
    .with_timeout(Duration::from_secs(config.facilitator_timeout_secs));

    let x402 = Arc::new(X402Processor::new(
        Arc::clone(&db),
        Arc::clone(&ledger),
        facilitator,
        config.networks.clone(),
        config.pay_to,
        config.x402_max_timeout_secs,
        FraudPolicy {
            tolerance_pct: config.fraud_tolerance_pct,
            warning_pct: config.fraud_warning_pct,
            major_pct: config.fraud_major_pct,
            overpayment_pct: config.overpayment_refund_pct,
            ban_count: config.fraud_ban_count,
            ban_days: config.fraud_ban_days,
            window_days: 30,
        },
    ));

    let state = web::Data::new(AppState {
        db,
        ledger,
        x402,
        private_secret: config.private_api_secret.clone().into_bytes(),
        metrics_token: config.metrics_token.clone(),
    });

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
        .expect("failed to build rate limiter config");

    let port = config.port;
    tracing::info!(port, "weft-payment listening");

    HttpServer::new(move || {
        App::new()
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::reserve)
            .service(routes::consume)
            .service(routes::refund)
            .service(routes::adjust)
            .service(routes::quote)
            .service(routes::x402_verify_and_settle)
            .service(routes::x402_finalize)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
