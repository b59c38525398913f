//! HTTP endpoints implemented by the payments gateway.
//!
//! All routes live under `/api`. Bodies are JSON; caller identity rides on the
//! `x-user-id`/`x-user-role` headers via the [`crate::types::CallerIdentity`]
//! extractor, see [`crate::auth`].

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::provider::Provider;
use crate::service::PaymentsService;
use crate::transactions::TransactionStore;
use crate::types::CallerIdentity;
use crate::wallet::WalletLedger;

impl IntoResponse for crate::service::PaymentsServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.tag() }));
        (status, body).into_response()
    }
}

impl IntoResponse for crate::auth::MissingCallerIdentity {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "UNAUTHENTICATED" })),
        )
            .into_response()
    }
}

pub fn routes<T, W>() -> Router<Arc<PaymentsService<T, W>>>
where
    T: TransactionStore + 'static,
    W: WalletLedger + 'static,
{
    Router::new()
        .route("/payment/deposit", post(post_deposit::<T, W>))
        .route("/payment/status/{id}", get(get_status::<T, W>))
        .route("/payment/webhook", post(post_webhook::<T, W>))
        .route("/payment/reconcile/{id}", post(post_reconcile::<T, W>))
        .route("/user/deposits", get(get_user_deposits::<T, W>))
        .route("/health", get(get_health::<T, W>))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub provider: Provider,
    pub amount: Decimal,
    pub currency: Option<String>,
}

#[instrument(skip_all)]
pub async fn post_deposit<T, W>(
    State(service): State<Arc<PaymentsService<T, W>>>,
    caller: CallerIdentity,
    Json(body): Json<DepositRequest>,
) -> Result<impl IntoResponse, crate::service::PaymentsServiceError>
where
    T: TransactionStore + 'static,
    W: WalletLedger + 'static,
{
    let created = service
        .create_deposit(&caller, body.provider, body.amount, body.currency)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[instrument(skip_all)]
pub async fn get_status<T, W>(
    State(service): State<Arc<PaymentsService<T, W>>>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, crate::service::PaymentsServiceError>
where
    T: TransactionStore + 'static,
    W: WalletLedger + 'static,
{
    let tx = service.get_status(id, &caller).await?;
    Ok((StatusCode::OK, Json(tx)))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListDepositsQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[instrument(skip_all)]
pub async fn get_user_deposits<T, W>(
    State(service): State<Arc<PaymentsService<T, W>>>,
    caller: CallerIdentity,
    Query(query): Query<ListDepositsQuery>,
) -> Result<impl IntoResponse, crate::service::PaymentsServiceError>
where
    T: TransactionStore + 'static,
    W: WalletLedger + 'static,
{
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let page_result = service
        .list_user_deposits(&caller.user_id, &caller, page, limit)
        .await?;
    Ok((StatusCode::OK, Json(page_result)))
}

/// Source IP resolution for the webhook route trusts `ConnectInfo` (the
/// TCP peer address), not a client-supplied header, since the allowlist check
/// exists to authenticate the network path a provider's webhook arrives on.
#[instrument(skip_all)]
pub async fn post_webhook<T, W>(
    State(service): State<Arc<PaymentsService<T, W>>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, crate::service::PaymentsServiceError>
where
    T: TransactionStore + 'static,
    W: WalletLedger + 'static,
{
    let outcome = service.handle_webhook(&body, &addr.ip().to_string()).await?;
    Ok((StatusCode::OK, Json(outcome)))
}

#[instrument(skip_all)]
pub async fn post_reconcile<T, W>(
    State(service): State<Arc<PaymentsService<T, W>>>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, crate::service::PaymentsServiceError>
where
    T: TransactionStore + 'static,
    W: WalletLedger + 'static,
{
    let tx = service.reconcile(id, &caller).await?;
    Ok((StatusCode::OK, Json(json!({ "transaction": tx }))))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
}

#[instrument(skip_all)]
pub async fn get_health<T, W>(
    State(service): State<Arc<PaymentsService<T, W>>>,
) -> impl IntoResponse
where
    T: TransactionStore + 'static,
    W: WalletLedger + 'static,
{
    let database = service.database_health().await;
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            database,
        }),
    )
}
