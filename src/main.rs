//! Payments gateway HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server exposing the payments
//! gateway and wallet ledger interface: deposit creation, status/history
//! lookup, webhook ingestion, and admin reconciliation.
//!
//! Endpoints (all under `/api`):
//! - `POST /api/payment/deposit` – create a PENDING deposit and return a provider redirect URL
//! - `GET /api/payment/status/{id}` – look up a transaction (owner or admin)
//! - `POST /api/payment/webhook` – provider webhook ingestion (signature + IP verified)
//! - `POST /api/payment/reconcile/{id}` – admin-only expiry of a stale PENDING transaction
//! - `GET /api/user/deposits` – a caller's own deposit history
//! - `GET /api/health` – liveness and database connectivity
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT`, `DATABASE_URL` control binding and storage
//! - `{JAZZCASH,EASYPAISA,SADAPAY}_HMAC_SECRET` / `_BASE_URL` / `_WEBHOOK_IP_ALLOWLIST` configure providers
//! - `PAYMENTS_MAX_RETRIES`, `PAYMENTS_RETRY_BASE_DELAY_MS`, `PAYMENTS_RETRY_MAX_DELAY_MS` tune the retry queue

mod audit;
mod auth;
mod config;
mod handlers;
mod provider;
mod retry_queue;
mod service;
mod sig_down;
mod signature;
mod telemetry;
mod trace_id;
mod transactions;
mod types;
mod wallet;

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;

use crate::audit::PgAuditLog;
use crate::config::Config;
use crate::service::PaymentsService;
use crate::sig_down::SigDown;
use crate::telemetry::Telemetry;
use crate::trace_id::TraceIdLayer;
use crate::transactions::PgTransactionStore;
use crate::wallet::PgWalletLedger;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let (config, providers) = Config::load()?;
    let providers = Arc::new(providers);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let sig_down = SigDown::try_new()?;
    let cancellation = sig_down.cancellation_token();

    let transactions = Arc::new(PgTransactionStore::new(pool.clone()));
    let wallet = Arc::new(PgWalletLedger::new(pool.clone()));
    let audit = Arc::new(PgAuditLog::new(pool.clone()));

    let service = Arc::new(PaymentsService::new(
        transactions,
        wallet,
        audit,
        providers,
        config.retry,
        cancellation.clone(),
    ));

    let sweep_service = service.clone();
    let sweep_cancellation = cancellation.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep_service.sweep_once().await,
                _ = sweep_cancellation.cancelled() => break,
            }
        }
    });

    let api_routes = handlers::routes().with_state(service.clone());

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(TraceIdLayer)
        .layer(_telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!("failed to bind to {}: {}", addr, e);
        std::process::exit(1);
    });

    let shutdown_cancellation = cancellation.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown_cancellation.cancelled().await })
    .await?;

    service.shutdown().await;
    Ok(())
}
