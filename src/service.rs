//! Payments service (C6): the coordinator. Composes the signature codec,
//! provider registry, wallet ledger, transaction store, retry queue, and audit
//! log into the six public operations described in the data flow overview.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::provider::{Provider, ProviderRegistry};
use crate::retry_queue::{RetryProcessor, RetryQueue};
use crate::signature;
use crate::transactions::{TransactionStore, TransactionStoreError};
use crate::types::{CallerIdentity, Page, PaymentTransaction, TransactionStatus};
use crate::wallet::WalletLedger;

/// How long a PENDING transaction may sit before the sweep (or a manual
/// reconcile) expires it.
const EXPIRY_THRESHOLD_MINUTES: i64 = 30;

const DEFAULT_CURRENCY: &str = "PKR";

#[derive(Debug, thiserror::Error)]
pub enum PaymentsServiceError {
    #[error("no caller identity on an authenticated route")]
    Unauthenticated,
    #[error("caller is not permitted to perform this action")]
    Forbidden,
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    ValidationError(String),
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("request conflicts with stored state: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PaymentsServiceError {
    /// The stable machine-readable tag from the taxonomy (§6/§7). Never
    /// changes across releases even if the human-readable message does.
    pub fn tag(&self) -> &'static str {
        match self {
            PaymentsServiceError::Unauthenticated => "UNAUTHENTICATED",
            PaymentsServiceError::Forbidden => "FORBIDDEN",
            PaymentsServiceError::NotFound => "NOT_FOUND",
            PaymentsServiceError::ValidationError(_) => "VALIDATION_ERROR",
            PaymentsServiceError::BadRequest(_) => "BAD_REQUEST",
            PaymentsServiceError::Conflict(_) => "CONFLICT",
            PaymentsServiceError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            PaymentsServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PaymentsServiceError::Forbidden => StatusCode::FORBIDDEN,
            PaymentsServiceError::NotFound => StatusCode::NOT_FOUND,
            PaymentsServiceError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PaymentsServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PaymentsServiceError::Conflict(_) => StatusCode::CONFLICT,
            PaymentsServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TransactionStoreError> for PaymentsServiceError {
    fn from(err: TransactionStoreError) -> Self {
        match err {
            TransactionStoreError::NotFound(_) => PaymentsServiceError::NotFound,
            TransactionStoreError::InvalidStateTransition { .. } => {
                PaymentsServiceError::Conflict(err.to_string())
            }
            TransactionStoreError::Database(e) => PaymentsServiceError::Internal(e.to_string()),
            TransactionStoreError::WalletCredit(msg) => PaymentsServiceError::Internal(msg),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositCreated {
    pub transaction_id: Uuid,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub credited: bool,
}

/// What a queued retry should redo for a given transaction id. Captured right
/// after signature verification (§4.6 step 3) so any internal failure past
/// that point — including the initial lookup itself — has enough information
/// to retry without needing to re-verify the webhook.
#[derive(Debug, Clone)]
enum PendingWebhook {
    Confirm { provider_txn_id: String },
    Fail,
}

/// The webhook-retry processor. Only `transactions` is needed: crediting and
/// confirming now happen together inside `TransactionStore::confirm_and_credit`,
/// so there is no separate wallet collaborator to coordinate here.
struct WebhookRetryProcessor<T: TransactionStore> {
    transactions: Arc<T>,
    audit: Arc<dyn AuditLog>,
    pending: Arc<DashMap<Uuid, PendingWebhook>>,
}

#[async_trait::async_trait]
impl<T> RetryProcessor for WebhookRetryProcessor<T>
where
    T: TransactionStore + 'static,
{
    async fn process(&self, transaction_id: Uuid, attempt: u32) -> bool {
        let Some((_, pending)) = self.pending.remove(&transaction_id) else {
            return true;
        };

        match pending {
            PendingWebhook::Confirm { provider_txn_id } => {
                match self
                    .transactions
                    .confirm_and_credit(transaction_id, &provider_txn_id)
                    .await
                {
                    Ok(outcome) => {
                        let _ = self
                            .audit
                            .record(
                                "system",
                                "deposit_confirmed",
                                "payment_transaction",
                                &transaction_id.to_string(),
                                json!({ "retried": true, "attempt": attempt, "credited": outcome.credited }),
                            )
                            .await;
                        true
                    }
                    Err(TransactionStoreError::NotFound(_)) => true,
                    Err(TransactionStoreError::InvalidStateTransition { .. }) => {
                        tracing::warn!(transaction_id = %transaction_id, "transaction left PENDING before retry landed, dropping");
                        true
                    }
                    Err(_) => {
                        self.pending
                            .insert(transaction_id, PendingWebhook::Confirm { provider_txn_id });
                        false
                    }
                }
            }
            PendingWebhook::Fail => {
                match self
                    .transactions
                    .mark_failed(transaction_id, "provider reported failure (retried)")
                    .await
                {
                    Ok(_) => {
                        let _ = self
                            .audit
                            .record(
                                "system",
                                "deposit_failed",
                                "payment_transaction",
                                &transaction_id.to_string(),
                                json!({ "retried": true, "attempt": attempt }),
                            )
                            .await;
                        true
                    }
                    Err(TransactionStoreError::NotFound(_)) => true,
                    Err(TransactionStoreError::InvalidStateTransition { .. }) => {
                        tracing::warn!(transaction_id = %transaction_id, "transaction left PENDING before retry landed, dropping");
                        true
                    }
                    Err(_) => {
                        self.pending.insert(transaction_id, PendingWebhook::Fail);
                        false
                    }
                }
            }
        }
    }
}

pub struct PaymentsService<T: TransactionStore, W: WalletLedger> {
    transactions: Arc<T>,
    wallet: Arc<W>,
    audit: Arc<dyn AuditLog>,
    providers: Arc<ProviderRegistry>,
    retry_queue: Arc<RetryQueue>,
    pending_retries: Arc<DashMap<Uuid, PendingWebhook>>,
}

impl<T, W> PaymentsService<T, W>
where
    T: TransactionStore + 'static,
    W: WalletLedger + 'static,
{
    pub fn new(
        transactions: Arc<T>,
        wallet: Arc<W>,
        audit: Arc<dyn AuditLog>,
        providers: Arc<ProviderRegistry>,
        retry_config: crate::config::RetryConfig,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> Self {
        let pending_retries = Arc::new(DashMap::new());
        let processor = Arc::new(WebhookRetryProcessor {
            transactions: transactions.clone(),
            audit: audit.clone(),
            pending: pending_retries.clone(),
        });
        let retry_queue = RetryQueue::new(retry_config, processor, audit.clone(), cancellation);

        Self {
            transactions,
            wallet,
            audit,
            providers,
            retry_queue,
            pending_retries,
        }
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn create_deposit(
        &self,
        caller: &CallerIdentity,
        provider: Provider,
        amount: Decimal,
        currency: Option<String>,
    ) -> Result<DepositCreated, PaymentsServiceError> {
        if amount <= Decimal::ZERO {
            return Err(PaymentsServiceError::ValidationError(
                "amount must be positive".to_string(),
            ));
        }
        // Amounts are fixed-point with two fractional digits end-to-end, so the
        // stored value's string form always matches what a webhook cross-check
        // will declare.
        let amount = amount.round_dp(2);
        let currency = currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        let tx = self
            .transactions
            .create(&caller.user_id, provider, amount, &currency)
            .await?;

        self.audit
            .record(
                &caller.user_id,
                "deposit_created",
                "payment_transaction",
                &tx.id.to_string(),
                json!({ "provider": provider.to_string(), "amount": amount.to_string() }),
            )
            .await
            .map_err(|e| PaymentsServiceError::Internal(e.to_string()))?;

        let provider_config = self
            .providers
            .get(provider)
            .ok_or_else(|| PaymentsServiceError::Internal(format!("no config for {provider}")))?;

        let mut redirect_url = provider_config.redirect_base_url.clone();
        redirect_url
            .query_pairs_mut()
            .append_pair("orderId", &tx.id.to_string())
            .append_pair("amount", &amount.to_string())
            .append_pair("currency", &currency);

        Ok(DepositCreated {
            transaction_id: tx.id,
            redirect_url: redirect_url.to_string(),
        })
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_status(
        &self,
        transaction_id: Uuid,
        caller: &CallerIdentity,
    ) -> Result<PaymentTransaction, PaymentsServiceError> {
        let tx = self
            .transactions
            .find_by_id(transaction_id)
            .await?
            .ok_or(PaymentsServiceError::NotFound)?;

        if !caller.is_admin() && caller.user_id != tx.user_id {
            return Err(PaymentsServiceError::Forbidden);
        }
        Ok(tx)
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn list_user_deposits(
        &self,
        user_id: &str,
        caller: &CallerIdentity,
        page: u32,
        limit: u32,
    ) -> Result<Page<PaymentTransaction>, PaymentsServiceError> {
        if !caller.is_admin() && caller.user_id != user_id {
            return Err(PaymentsServiceError::Forbidden);
        }
        Ok(self.transactions.list_by_user(user_id, page, limit).await?)
    }

    #[tracing::instrument(skip(self, raw), err)]
    pub async fn handle_webhook(
        &self,
        raw: &Value,
        source_ip: &str,
    ) -> Result<WebhookOutcome, PaymentsServiceError> {
        let provider_str = raw
            .get("provider")
            .and_then(Value::as_str)
            .ok_or_else(|| PaymentsServiceError::BadRequest("missing provider".to_string()))?;
        let signature_hex = raw
            .get("signature")
            .and_then(Value::as_str)
            .ok_or_else(|| PaymentsServiceError::BadRequest("missing signature".to_string()))?;
        let provider: Provider = serde_json::from_value(Value::String(provider_str.to_string()))
            .map_err(|_| PaymentsServiceError::BadRequest("unknown provider".to_string()))?;

        let provider_config = self
            .providers
            .get(provider)
            .ok_or_else(|| PaymentsServiceError::Internal(format!("no config for {provider}")))?;

        if !crate::provider::is_ip_allowed(source_ip, &provider_config.ip_allowlist) {
            self.audit
                .record(
                    "system",
                    "webhook_ip_rejected",
                    "provider",
                    &provider.to_string(),
                    json!({ "sourceIp": source_ip }),
                )
                .await
                .map_err(|e| PaymentsServiceError::Internal(e.to_string()))?;
            return Err(PaymentsServiceError::Forbidden);
        }

        let mut subset = serde_json::Map::new();
        for key in [
            "transactionId",
            "providerTransactionId",
            "status",
            "amount",
            "currency",
        ] {
            if let Some(value) = raw.get(key) {
                subset.insert(key.to_string(), value.clone());
            }
        }

        if !signature::verify(&subset, &provider_config.hmac_secret, signature_hex) {
            self.audit
                .record(
                    "system",
                    "webhook_signature_rejected",
                    "provider",
                    &provider.to_string(),
                    json!({}),
                )
                .await
                .map_err(|e| PaymentsServiceError::Internal(e.to_string()))?;
            return Err(PaymentsServiceError::Unauthenticated);
        }

        let transaction_id: Uuid = raw
            .get("transactionId")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PaymentsServiceError::BadRequest("invalid transactionId".to_string()))?;
        let provider_txn_id = raw
            .get("providerTransactionId")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let amount_str = raw
            .get("amount")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let currency_str = raw
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        // Every read below this point hits the database. §4.6 step 7 requires
        // any internal failure past signature verification — including this
        // very lookup — to enqueue a retry at attempt=1, so the `pending`
        // marker is built from what we already parsed before we attempt it.
        let pending = match status.as_str() {
            "CONFIRMED" => Some(PendingWebhook::Confirm {
                provider_txn_id: provider_txn_id.clone(),
            }),
            "FAILED" => Some(PendingWebhook::Fail),
            _ => None,
        };

        let tx = match self.transactions.find_by_id(transaction_id).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return Err(PaymentsServiceError::NotFound),
            Err(e) => {
                if let Some(pending) = pending {
                    self.pending_retries.insert(transaction_id, pending);
                    self.retry_queue.enqueue(transaction_id, 1);
                }
                return Err(PaymentsServiceError::Internal(e.to_string()));
            }
        };

        if provider != tx.provider.into()
            || amount_str != tx.amount.to_string()
            || currency_str != tx.currency
        {
            self.audit
                .record(
                    "system",
                    "webhook_mismatch",
                    "payment_transaction",
                    &tx.id.to_string(),
                    json!({ "declaredAmount": amount_str, "declaredCurrency": currency_str }),
                )
                .await
                .map_err(|e| PaymentsServiceError::Internal(e.to_string()))?;
            return Err(PaymentsServiceError::Conflict(
                "webhook payload disagrees with stored transaction".to_string(),
            ));
        }

        match status.as_str() {
            "CONFIRMED" => self.confirm_deposit(tx, provider_txn_id).await,
            "FAILED" => self.fail_deposit(tx).await,
            other => Err(PaymentsServiceError::BadRequest(format!(
                "unrecognised webhook status {other}"
            ))),
        }
    }

    async fn confirm_deposit(
        &self,
        tx: PaymentTransaction,
        provider_txn_id: String,
    ) -> Result<WebhookOutcome, PaymentsServiceError> {
        if tx.status == TransactionStatus::Confirmed {
            return Ok(WebhookOutcome { credited: false });
        }
        if tx.status.is_terminal() {
            // FAILED/EXPIRED are terminal and not reachable from here; reject
            // before touching the store so a stale CONFIRMED replay can never
            // move money for a transaction the state machine won't confirm.
            return Err(PaymentsServiceError::Conflict(
                "transaction is no longer PENDING".to_string(),
            ));
        }

        // Credit and confirm happen together in one database transaction
        // (§4.6 step 6): there is no commit boundary between them for a
        // concurrent sweep/reconcile to expire the row inside of.
        match self
            .transactions
            .confirm_and_credit(tx.id, &provider_txn_id)
            .await
        {
            Ok(outcome) => {
                self.audit
                    .record(
                        "system",
                        "deposit_confirmed",
                        "payment_transaction",
                        &tx.id.to_string(),
                        json!({ "credited": outcome.credited }),
                    )
                    .await
                    .map_err(|e| PaymentsServiceError::Internal(e.to_string()))?;
                Ok(WebhookOutcome {
                    credited: outcome.credited,
                })
            }
            Err(TransactionStoreError::InvalidStateTransition { .. }) => Err(
                PaymentsServiceError::Conflict("transaction left PENDING concurrently".to_string()),
            ),
            Err(e) => {
                self.pending_retries.insert(
                    tx.id,
                    PendingWebhook::Confirm {
                        provider_txn_id: provider_txn_id.clone(),
                    },
                );
                self.retry_queue.enqueue(tx.id, 1);
                Err(e.into())
            }
        }
    }

    async fn fail_deposit(
        &self,
        tx: PaymentTransaction,
    ) -> Result<WebhookOutcome, PaymentsServiceError> {
        match self
            .transactions
            .mark_failed(tx.id, "provider reported failure")
            .await
        {
            Ok(_) => {
                self.audit
                    .record(
                        "system",
                        "deposit_failed",
                        "payment_transaction",
                        &tx.id.to_string(),
                        json!({}),
                    )
                    .await
                    .map_err(|e| PaymentsServiceError::Internal(e.to_string()))?;
                Ok(WebhookOutcome { credited: false })
            }
            Err(TransactionStoreError::InvalidStateTransition { .. }) => Err(
                PaymentsServiceError::Conflict("transaction is no longer PENDING".to_string()),
            ),
            Err(e) => {
                self.pending_retries.insert(tx.id, PendingWebhook::Fail);
                self.retry_queue.enqueue(tx.id, 1);
                Err(e.into())
            }
        }
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn reconcile(
        &self,
        transaction_id: Uuid,
        caller: &CallerIdentity,
    ) -> Result<PaymentTransaction, PaymentsServiceError> {
        if !caller.is_admin() {
            return Err(PaymentsServiceError::Forbidden);
        }
        let tx = self
            .transactions
            .find_by_id(transaction_id)
            .await?
            .ok_or(PaymentsServiceError::NotFound)?;

        if tx.status != TransactionStatus::Pending {
            return Ok(tx);
        }
        if Utc::now() - tx.created_at < ChronoDuration::minutes(EXPIRY_THRESHOLD_MINUTES) {
            return Ok(tx);
        }

        let expired = self.transactions.mark_expired(tx.id).await?;
        self.audit
            .record(
                &caller.user_id,
                "reconciled_expired",
                "payment_transaction",
                &tx.id.to_string(),
                json!({}),
            )
            .await
            .map_err(|e| PaymentsServiceError::Internal(e.to_string()))?;
        Ok(expired)
    }

    /// The periodic sweep: expires every PENDING transaction older than the
    /// threshold. Safe to run concurrently with webhook handling: the state
    /// machine forbids EXPIRED→CONFIRMED, so a race just means the webhook
    /// loses and reports a conflict.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) {
        let cutoff = Utc::now() - ChronoDuration::minutes(EXPIRY_THRESHOLD_MINUTES);
        let stale = match self.transactions.list_pending_older_than(cutoff).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "sweep failed to list pending transactions");
                return;
            }
        };

        for tx in stale {
            match self.transactions.mark_expired(tx.id).await {
                Ok(_) => {
                    if let Err(e) = self
                        .audit
                        .record(
                            "system",
                            "reconciled_expired",
                            "payment_transaction",
                            &tx.id.to_string(),
                            json!({ "sweep": true }),
                        )
                        .await
                    {
                        tracing::warn!(error = %e, transaction_id = %tx.id, "failed to audit sweep expiry");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, transaction_id = %tx.id, "sweep could not expire transaction");
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.retry_queue.shutdown().await;
    }

    /// Backs `GET /health`. Reports `"ok"`/`"unreachable"` rather than
    /// propagating an error, since a health probe must always answer.
    pub async fn database_health(&self) -> &'static str {
        match self.transactions.health_check().await {
            Ok(()) => "ok",
            Err(_) => "unreachable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::fake::FakeAuditLog;
    use crate::config::RetryConfig;
    use crate::provider::ProviderConfig;
    use crate::transactions::fake::FakeTransactionStore;
    use crate::wallet::fake::FakeWalletLedger;
    use std::collections::HashMap;
    use url::Url;

    fn test_provider_config(ip_allowlist: Vec<String>) -> ProviderConfig {
        ProviderConfig {
            hmac_secret: b"test-secret".to_vec(),
            redirect_base_url: Url::parse("https://pay.example.test/redirect").unwrap(),
            ip_allowlist,
        }
    }

    fn test_service(
        ip_allowlist: Vec<String>,
    ) -> PaymentsService<FakeTransactionStore, FakeWalletLedger> {
        let mut providers = HashMap::new();
        providers.insert(Provider::JazzCash, test_provider_config(ip_allowlist.clone()));
        providers.insert(Provider::Easypaisa, test_provider_config(ip_allowlist.clone()));
        providers.insert(Provider::SadaPay, test_provider_config(ip_allowlist));

        let wallet = Arc::new(FakeWalletLedger::new());
        PaymentsService::new(
            Arc::new(FakeTransactionStore::new(wallet.clone())),
            wallet,
            Arc::new(FakeAuditLog::new()),
            Arc::new(ProviderRegistry::for_test(providers)),
            RetryConfig {
                max_retries: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
            },
            tokio_util::sync::CancellationToken::new(),
        )
    }

    fn admin(user_id: &str) -> CallerIdentity {
        CallerIdentity {
            user_id: user_id.to_string(),
            role: crate::types::Role::Admin,
        }
    }

    fn user(user_id: &str) -> CallerIdentity {
        CallerIdentity {
            user_id: user_id.to_string(),
            role: crate::types::Role::User,
        }
    }

    fn signed_webhook(
        secret: &[u8],
        transaction_id: Uuid,
        provider: Provider,
        provider_txn_id: &str,
        status: &str,
        amount: &str,
        currency: &str,
    ) -> Value {
        let mut subset = serde_json::Map::new();
        subset.insert("transactionId".to_string(), json!(transaction_id.to_string()));
        subset.insert("providerTransactionId".to_string(), json!(provider_txn_id));
        subset.insert("status".to_string(), json!(status));
        subset.insert("amount".to_string(), json!(amount));
        subset.insert("currency".to_string(), json!(currency));
        let signature = signature::hmac_hex(&subset, secret).unwrap();

        json!({
            "provider": provider.to_string(),
            "transactionId": transaction_id.to_string(),
            "providerTransactionId": provider_txn_id,
            "status": status,
            "amount": amount,
            "currency": currency,
            "signature": signature,
        })
    }

    #[tokio::test]
    async fn happy_deposit_is_pending_with_redirect_order_id() {
        let service = test_service(vec![]);
        let created = service
            .create_deposit(
                &user("user_1"),
                Provider::Easypaisa,
                Decimal::new(2550, 2),
                Some("PKR".to_string()),
            )
            .await
            .unwrap();

        assert!(created.redirect_url.contains("orderId="));
        let tx = service.get_status(created.transaction_id, &user("user_1")).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn idempotent_webhook_credits_exactly_once() {
        let service = test_service(vec![]);
        let created = service
            .create_deposit(&user("user_1"), Provider::JazzCash, Decimal::new(1000, 2), None)
            .await
            .unwrap();

        let secret = service.providers.get(Provider::JazzCash).unwrap().hmac_secret.clone();
        let payload = signed_webhook(
            &secret,
            created.transaction_id,
            Provider::JazzCash,
            "ptx_1",
            "CONFIRMED",
            "10.00",
            "PKR",
        );

        let first = service.handle_webhook(&payload, "127.0.0.1").await.unwrap();
        let second = service.handle_webhook(&payload, "127.0.0.1").await.unwrap();

        assert!(first.credited);
        assert!(!second.credited);

        let tx = service.get_status(created.transaction_id, &admin("admin_1")).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert!(tx.credited_at.is_some());
    }

    #[tokio::test]
    async fn webhook_from_unallowlisted_ip_is_forbidden() {
        let service = test_service(vec!["10.0.0.1".to_string()]);
        let created = service
            .create_deposit(&user("user_1"), Provider::SadaPay, Decimal::new(1000, 2), None)
            .await
            .unwrap();

        let secret = service.providers.get(Provider::SadaPay).unwrap().hmac_secret.clone();
        let payload = signed_webhook(
            &secret,
            created.transaction_id,
            Provider::SadaPay,
            "ptx_2",
            "CONFIRMED",
            "10.00",
            "PKR",
        );

        let result = service.handle_webhook(&payload, "10.0.0.2").await;
        assert!(matches!(result, Err(PaymentsServiceError::Forbidden)));
    }

    #[tokio::test]
    async fn non_owner_cannot_read_status() {
        let service = test_service(vec![]);
        let created = service
            .create_deposit(&user("user_1"), Provider::JazzCash, Decimal::new(1000, 2), None)
            .await
            .unwrap();

        let forbidden = service.get_status(created.transaction_id, &user("user_2")).await;
        assert!(matches!(forbidden, Err(PaymentsServiceError::Forbidden)));

        let ok = service.get_status(created.transaction_id, &user("user_1")).await.unwrap();
        assert_eq!(ok.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn reconcile_requires_admin_and_expiry_window() {
        let service = test_service(vec![]);
        let created = service
            .create_deposit(&user("user_1"), Provider::SadaPay, Decimal::new(1000, 2), None)
            .await
            .unwrap();

        let forbidden = service.reconcile(created.transaction_id, &user("user_1")).await;
        assert!(matches!(forbidden, Err(PaymentsServiceError::Forbidden)));

        let too_soon = service.reconcile(created.transaction_id, &admin("admin_1")).await.unwrap();
        assert_eq!(too_soon.status, TransactionStatus::Pending);

        let mut stale = too_soon.clone();
        stale.created_at = Utc::now() - ChronoDuration::minutes(31);
        service.transactions.insert_seed(stale);

        let expired = service.reconcile(created.transaction_id, &admin("admin_1")).await.unwrap();
        assert_eq!(expired.status, TransactionStatus::Expired);

        let secret = service.providers.get(Provider::SadaPay).unwrap().hmac_secret.clone();
        let payload = signed_webhook(
            &secret,
            created.transaction_id,
            Provider::SadaPay,
            "ptx_3",
            "CONFIRMED",
            "10.00",
            "PKR",
        );
        let after_expiry = service.handle_webhook(&payload, "127.0.0.1").await;
        assert!(matches!(after_expiry, Err(PaymentsServiceError::Conflict(_))));

        let balance = service.wallet.balance_of("user_1");
        assert_eq!(balance, Decimal::ZERO);
    }
}
