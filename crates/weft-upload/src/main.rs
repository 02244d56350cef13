use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use weft::payment_client::PaymentClient;
use weft_upload::bundle::BundleSigner;
use weft_upload::config::{RateQuota, UploadConfig};
use weft_upload::db::UploadDb;
use weft_upload::gateway::HttpStorageNetwork;
use weft_upload::optical::OpticalBridge;
use weft_upload::pipeline::{runner, PipelineCtx};
use weft_upload::routes;
use weft_upload::state::AppState;
use weft_upload::store::{queue::QueueConfig, FsObjectStore, JobQueue, MemCacheStore};

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port.
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allow_any_header()
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method().allow_any_header().max_age(3600)
    }
}

fn governor_conf(
    quota: RateQuota,
) -> actix_governor::GovernorConfig<
    actix_governor::PeerIpKeyExtractor,
    actix_governor::governor::middleware::NoOpMiddleware<
        actix_governor::governor::clock::QuantaInstant,
    >,
> {
    let window_ms = quota.window_ms.max(1);
    let rpm = ((quota.max as u64).max(1) * 60_000 / window_ms).max(1);
    GovernorConfigBuilder::default()
        .requests_per_minute(rpm)
        .finish()
        .expect("failed to build rate limiter config")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match UploadConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    tracing::info!(?config, "starting weft-upload");

    let signer = match BundleSigner::from_hex_key(&config.service_key) {
        Ok(signer) => Arc::new(signer),
        Err(e) => {
            tracing::error!(error = %e, "SERVICE_KEY is not a valid secp256k1 key");
            std::process::exit(2);
        }
    };

    let db = match UploadDb::open(&config.db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!(error = %e, path = %config.db_path, "cannot open upload database");
            std::process::exit(3);
        }
    };
    let queue = match JobQueue::open(&config.queue_db_path, QueueConfig::default()) {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            tracing::error!(error = %e, path = %config.queue_db_path, "cannot open job queue");
            std::process::exit(3);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&config.object_root) {
        tracing::error!(error = %e, root = %config.object_root, "cannot create object store root");
        std::process::exit(3);
    }

    let payment = Arc::new(PaymentClient::new(
        config.payment_url.clone(),
        config.payment_secret.clone(),
    ));

    let ctx = Arc::new(PipelineCtx {
        cfg: config.clone(),
        db,
        objects: Arc::new(FsObjectStore::new(config.object_root.clone())),
        cache: Arc::new(MemCacheStore::new()),
        queue,
        payment,
        network: Arc::new(HttpStorageNetwork::new(config.gateway_url.clone())),
        optical: Arc::new(OpticalBridge::new(
            config.optical_urls.clone(),
            config.optical_admin_key.clone(),
        )),
        signer,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = runner::spawn_workers(Arc::clone(&ctx), shutdown_rx);

    let state = web::Data::new(AppState {
        ctx: Arc::clone(&ctx),
        internal_secret: config.payment_secret.clone().into_bytes(),
        metrics_token: config.metrics_token.clone(),
    });

    let upload_governor = governor_conf(config.rate_limit_upload);
    let price_governor = governor_conf(config.rate_limit_price);
    let payment_governor = governor_conf(config.rate_limit_payment);

    let port = config.port;
    tracing::info!(port, "weft-upload listening");

    let allowed_origins = config.allowed_origins.clone();
    let server = HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&allowed_origins))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(262_144))
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::tx_status)
            .service(
                web::scope("/v1/price")
                    .wrap(Governor::new(&price_governor))
                    .service(routes::price_bytes),
            )
            .service(
                web::scope("/v1/x402")
                    .wrap(Governor::new(&payment_governor))
                    .service(routes::x402_price)
                    .service(routes::x402_payment)
                    .service(routes::x402_finalize),
            )
            .service(
                web::scope("/v1")
                    .wrap(Governor::new(&upload_governor))
                    .service(routes::post_tx)
                    .service(routes::init_multipart)
                    .service(routes::put_part)
                    .service(routes::finalize_multipart),
            )
    })
    .bind(("0.0.0.0", port))?
    .run();

    let result = server.await;

    // Server is down; drain the workers within the grace window.
    let _ = shutdown_tx.send(true);
    runner::await_shutdown(
        worker_handles,
        Duration::from_secs(ctx.cfg.grace_timeout_secs),
    )
    .await;
    result
}
