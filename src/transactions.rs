//! Payment transaction store (C4): CRUD plus the narrow state-transition
//! operations the payments service drives the lifecycle through.
//!
//! Transitions are enforced here, not by the caller: `CONFIRMED`/`FAILED`/
//! `EXPIRED` are terminal, and a transaction never leaves one once reached.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::provider::Provider;
use crate::types::{LedgerDirection, Page, PaymentTransaction, ProviderColumn, TransactionStatus};

#[derive(Debug, thiserror::Error)]
pub enum TransactionStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("transaction {0} not found")]
    NotFound(Uuid),
    #[error("cannot move transaction {id} from {from:?} to {to:?}")]
    InvalidStateTransition {
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("wallet credit failed: {0}")]
    WalletCredit(String),
}

/// Result of [`TransactionStore::confirm_and_credit`].
#[derive(Debug, Clone)]
pub struct ConfirmAndCreditOutcome {
    pub transaction: PaymentTransaction,
    pub credited: bool,
}

#[async_trait::async_trait]
pub trait TransactionStore: Send + Sync {
    async fn create(
        &self,
        user_id: &str,
        provider: Provider,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentTransaction, TransactionStoreError>;

    async fn find_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<PaymentTransaction>, TransactionStoreError>;

    async fn list_by_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Page<PaymentTransaction>, TransactionStoreError>;

    /// Sets status=CONFIRMED, creditedAt=now, stores `provider_txn_id`. Idempotent:
    /// re-issuing on an already-CONFIRMED row is a no-op that returns the row
    /// unchanged rather than erroring.
    async fn mark_confirmed(
        &self,
        id: Uuid,
        provider_txn_id: &str,
    ) -> Result<PaymentTransaction, TransactionStoreError>;

    /// Credits the wallet and marks the transaction CONFIRMED as one atomic
    /// database transaction: either both effects land or neither does. A row
    /// that is no longer PENDING when the transaction begins (a concurrent
    /// sweep/reconcile already expired it, or another webhook already failed
    /// it) is rejected with `InvalidStateTransition` before any credit is
    /// applied — there is no window between crediting and confirming for a
    /// concurrent expiry to land in.
    async fn confirm_and_credit(
        &self,
        id: Uuid,
        provider_txn_id: &str,
    ) -> Result<ConfirmAndCreditOutcome, TransactionStoreError>;

    /// Allowed only from PENDING.
    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<PaymentTransaction, TransactionStoreError>;

    /// Allowed only from PENDING.
    async fn mark_expired(&self, id: Uuid) -> Result<PaymentTransaction, TransactionStoreError>;

    /// PENDING transactions created before `older_than`, the reconciliation
    /// sweep's input set.
    async fn list_pending_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, TransactionStoreError>;

    /// Cheap connectivity probe backing `GET /health`.
    async fn health_check(&self) -> Result<(), TransactionStoreError>;
}

#[derive(Debug, Clone)]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn guard_transition(
        row: &PaymentTransaction,
        to: TransactionStatus,
    ) -> Result<(), TransactionStoreError> {
        let allowed = match (row.status, to) {
            (TransactionStatus::Pending, _) => true,
            (TransactionStatus::Confirmed, TransactionStatus::Confirmed) => true,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(TransactionStoreError::InvalidStateTransition {
                id: row.id,
                from: row.status,
                to,
            })
        }
    }
}

#[async_trait::async_trait]
impl TransactionStore for PgTransactionStore {
    #[tracing::instrument(skip(self), err)]
    async fn create(
        &self,
        user_id: &str,
        provider: Provider,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentTransaction, TransactionStoreError> {
        let row = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            INSERT INTO payment_transactions
                (id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', NULL, now(), now(), NULL)
            RETURNING id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(provider.to_string())
        .bind(amount)
        .bind(currency)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    #[tracing::instrument(skip(self), err)]
    async fn find_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<PaymentTransaction>, TransactionStoreError> {
        let row = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            SELECT id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            FROM payment_transactions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    #[tracing::instrument(skip(self), err)]
    async fn list_by_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Page<PaymentTransaction>, TransactionStoreError> {
        let offset = (page.saturating_sub(1)) as i64 * limit as i64;
        let items = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            SELECT id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            FROM payment_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(Page { items, page, limit })
    }

    #[tracing::instrument(skip(self), err)]
    async fn mark_confirmed(
        &self,
        id: Uuid,
        provider_txn_id: &str,
    ) -> Result<PaymentTransaction, TransactionStoreError> {
        let row = self
            .find_by_id(id)
            .await?
            .ok_or(TransactionStoreError::NotFound(id))?;

        if row.status == TransactionStatus::Confirmed {
            return Ok(row);
        }
        Self::guard_transition(&row, TransactionStatus::Confirmed)?;

        let row = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            UPDATE payment_transactions
            SET status = 'CONFIRMED', provider_transaction_id = $2, credited_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            "#,
        )
        .bind(id)
        .bind(provider_txn_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    #[tracing::instrument(skip(self), err)]
    async fn confirm_and_credit(
        &self,
        id: Uuid,
        provider_txn_id: &str,
    ) -> Result<ConfirmAndCreditOutcome, TransactionStoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            SELECT id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            FROM payment_transactions WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(TransactionStoreError::NotFound(id))?;

        if row.status == TransactionStatus::Confirmed {
            tx.commit().await?;
            return Ok(ConfirmAndCreditOutcome {
                transaction: row,
                credited: false,
            });
        }
        Self::guard_transition(&row, TransactionStatus::Confirmed)?;

        let wallet_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO wallet_accounts (id, user_id, balance, currency, updated_at)
            VALUES ($1, $2, 0, 'PKR', now())
            ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.user_id)
        .fetch_one(&mut *tx)
        .await?;

        let credited = sqlx::query(
            r#"
            INSERT INTO wallet_ledger_entries (id, wallet_id, direction, amount, reference, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (wallet_id, reference) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(wallet_id)
        .bind(LedgerDirection::Credit)
        .bind(row.amount)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if credited {
            sqlx::query(
                "UPDATE wallet_accounts SET balance = balance + $1, updated_at = now() WHERE id = $2",
            )
            .bind(row.amount)
            .bind(wallet_id)
            .execute(&mut *tx)
            .await?;
        }

        let confirmed = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            UPDATE payment_transactions
            SET status = 'CONFIRMED', provider_transaction_id = $2, credited_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            "#,
        )
        .bind(id)
        .bind(provider_txn_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ConfirmAndCreditOutcome {
            transaction: confirmed,
            credited,
        })
    }

    #[tracing::instrument(skip(self), err)]
    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<PaymentTransaction, TransactionStoreError> {
        let row = self
            .find_by_id(id)
            .await?
            .ok_or(TransactionStoreError::NotFound(id))?;
        Self::guard_transition(&row, TransactionStatus::Failed)?;
        tracing::warn!(transaction_id = %id, reason, "marking transaction failed");

        let row = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            UPDATE payment_transactions
            SET status = 'FAILED', updated_at = now()
            WHERE id = $1
            RETURNING id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    #[tracing::instrument(skip(self), err)]
    async fn mark_expired(&self, id: Uuid) -> Result<PaymentTransaction, TransactionStoreError> {
        let row = self
            .find_by_id(id)
            .await?
            .ok_or(TransactionStoreError::NotFound(id))?;
        Self::guard_transition(&row, TransactionStatus::Expired)?;

        let row = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            UPDATE payment_transactions
            SET status = 'EXPIRED', updated_at = now()
            WHERE id = $1
            RETURNING id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    #[tracing::instrument(skip(self), err)]
    async fn list_pending_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, TransactionStoreError> {
        let rows = sqlx::query_as::<_, PaymentTransaction>(
            r#"
            SELECT id, user_id, provider, amount, currency, status, provider_transaction_id, created_at, updated_at, credited_at
            FROM payment_transactions
            WHERE status = 'PENDING' AND created_at < $1
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[tracing::instrument(skip(self), err)]
    async fn health_check(&self) -> Result<(), TransactionStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory double backing [`crate::service::PaymentsService`] tests.
    /// Enforces the same terminal-state guard as [`PgTransactionStore`], and
    /// holds a handle to its companion [`crate::wallet::fake::FakeWalletLedger`]
    /// so `confirm_and_credit` can model the same single-unit credit+confirm
    /// operation the Postgres implementation runs in one transaction.
    pub struct FakeTransactionStore {
        rows: Mutex<HashMap<Uuid, PaymentTransaction>>,
        wallet: std::sync::Arc<crate::wallet::fake::FakeWalletLedger>,
    }

    impl FakeTransactionStore {
        pub fn new(wallet: std::sync::Arc<crate::wallet::fake::FakeWalletLedger>) -> Self {
            Self {
                rows: Mutex::new(HashMap::new()),
                wallet,
            }
        }

        pub fn insert_seed(&self, row: PaymentTransaction) {
            self.rows.lock().unwrap().insert(row.id, row);
        }

        fn guard(
            row: &PaymentTransaction,
            to: TransactionStatus,
        ) -> Result<(), TransactionStoreError> {
            let allowed = match (row.status, to) {
                (TransactionStatus::Pending, _) => true,
                (TransactionStatus::Confirmed, TransactionStatus::Confirmed) => true,
                _ => false,
            };
            if allowed {
                Ok(())
            } else {
                Err(TransactionStoreError::InvalidStateTransition {
                    id: row.id,
                    from: row.status,
                    to,
                })
            }
        }
    }

    #[async_trait::async_trait]
    impl TransactionStore for FakeTransactionStore {
        async fn create(
            &self,
            user_id: &str,
            provider: Provider,
            amount: Decimal,
            currency: &str,
        ) -> Result<PaymentTransaction, TransactionStoreError> {
            let now = chrono::Utc::now();
            let row = PaymentTransaction {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                provider: ProviderColumn(provider),
                amount,
                currency: currency.to_string(),
                status: TransactionStatus::Pending,
                provider_transaction_id: None,
                created_at: now,
                updated_at: now,
                credited_at: None,
            };
            self.rows.lock().unwrap().insert(row.id, row.clone());
            Ok(row)
        }

        async fn find_by_id(
            &self,
            id: Uuid,
        ) -> Result<Option<PaymentTransaction>, TransactionStoreError> {
            Ok(self.rows.lock().unwrap().get(&id).cloned())
        }

        async fn list_by_user(
            &self,
            user_id: &str,
            page: u32,
            limit: u32,
        ) -> Result<Page<PaymentTransaction>, TransactionStoreError> {
            let mut items: Vec<PaymentTransaction> = self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect();
            items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let offset = (page.saturating_sub(1)) as usize * limit as usize;
            let items = items.into_iter().skip(offset).take(limit as usize).collect();
            Ok(Page { items, page, limit })
        }

        async fn mark_confirmed(
            &self,
            id: Uuid,
            provider_txn_id: &str,
        ) -> Result<PaymentTransaction, TransactionStoreError> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(&id).ok_or(TransactionStoreError::NotFound(id))?;
            if row.status == TransactionStatus::Confirmed {
                return Ok(row.clone());
            }
            Self::guard(row, TransactionStatus::Confirmed)?;
            row.status = TransactionStatus::Confirmed;
            row.provider_transaction_id = Some(provider_txn_id.to_string());
            row.credited_at = Some(chrono::Utc::now());
            row.updated_at = chrono::Utc::now();
            Ok(row.clone())
        }

        async fn confirm_and_credit(
            &self,
            id: Uuid,
            provider_txn_id: &str,
        ) -> Result<ConfirmAndCreditOutcome, TransactionStoreError> {
            let row = {
                let rows = self.rows.lock().unwrap();
                rows.get(&id)
                    .cloned()
                    .ok_or(TransactionStoreError::NotFound(id))?
            };

            if row.status == TransactionStatus::Confirmed {
                return Ok(ConfirmAndCreditOutcome {
                    transaction: row,
                    credited: false,
                });
            }
            Self::guard(&row, TransactionStatus::Confirmed)?;

            let credit_outcome = self
                .wallet
                .credit(&row.user_id, row.amount, &id.to_string())
                .await
                .map_err(|e| TransactionStoreError::WalletCredit(e.to_string()))?;

            let mut rows = self.rows.lock().unwrap();
            let stored = rows.get_mut(&id).ok_or(TransactionStoreError::NotFound(id))?;
            stored.status = TransactionStatus::Confirmed;
            stored.provider_transaction_id = Some(provider_txn_id.to_string());
            stored.credited_at = Some(chrono::Utc::now());
            stored.updated_at = chrono::Utc::now();

            Ok(ConfirmAndCreditOutcome {
                transaction: stored.clone(),
                credited: credit_outcome.credited,
            })
        }

        async fn mark_failed(
            &self,
            id: Uuid,
            _reason: &str,
        ) -> Result<PaymentTransaction, TransactionStoreError> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(&id).ok_or(TransactionStoreError::NotFound(id))?;
            Self::guard(row, TransactionStatus::Failed)?;
            row.status = TransactionStatus::Failed;
            row.updated_at = chrono::Utc::now();
            Ok(row.clone())
        }

        async fn mark_expired(&self, id: Uuid) -> Result<PaymentTransaction, TransactionStoreError> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(&id).ok_or(TransactionStoreError::NotFound(id))?;
            Self::guard(row, TransactionStatus::Expired)?;
            row.status = TransactionStatus::Expired;
            row.updated_at = chrono::Utc::now();
            Ok(row.clone())
        }

        async fn list_pending_older_than(
            &self,
            older_than: DateTime<Utc>,
        ) -> Result<Vec<PaymentTransaction>, TransactionStoreError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.status == TransactionStatus::Pending && r.created_at < older_than)
                .cloned()
                .collect())
        }

        async fn health_check(&self) -> Result<(), TransactionStoreError> {
            Ok(())
        }
    }

    fn store_with_wallet() -> (FakeTransactionStore, std::sync::Arc<crate::wallet::fake::FakeWalletLedger>) {
        let wallet = std::sync::Arc::new(crate::wallet::fake::FakeWalletLedger::new());
        let store = FakeTransactionStore::new(wallet.clone());
        (store, wallet)
    }

    #[tokio::test]
    async fn terminal_states_reject_further_transitions() {
        let (store, _wallet) = store_with_wallet();
        let row = store
            .create("user_1", Provider::SadaPay, Decimal::new(1000, 2), "PKR")
            .await
            .unwrap();
        store.mark_expired(row.id).await.unwrap();

        let result = store.mark_confirmed(row.id, "ptx_1").await;
        assert!(matches!(
            result,
            Err(TransactionStoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn confirming_twice_is_a_no_op() {
        let (store, _wallet) = store_with_wallet();
        let row = store
            .create("user_1", Provider::JazzCash, Decimal::new(1000, 2), "PKR")
            .await
            .unwrap();
        let first = store.mark_confirmed(row.id, "ptx_1").await.unwrap();
        let second = store.mark_confirmed(row.id, "ptx_1").await.unwrap();
        assert_eq!(first.credited_at, second.credited_at);
    }

    #[tokio::test]
    async fn confirm_and_credit_rejects_terminal_transaction_without_crediting() {
        let (store, wallet) = store_with_wallet();
        let row = store
            .create("user_1", Provider::SadaPay, Decimal::new(1000, 2), "PKR")
            .await
            .unwrap();
        store.mark_expired(row.id).await.unwrap();

        let result = store.confirm_and_credit(row.id, "ptx_1").await;
        assert!(matches!(
            result,
            Err(TransactionStoreError::InvalidStateTransition { .. })
        ));
        assert_eq!(wallet.balance_of("user_1"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn confirm_and_credit_is_idempotent_and_credits_exactly_once() {
        let (store, wallet) = store_with_wallet();
        let row = store
            .create("user_1", Provider::JazzCash, Decimal::new(1000, 2), "PKR")
            .await
            .unwrap();

        let first = store.confirm_and_credit(row.id, "ptx_1").await.unwrap();
        let second = store.confirm_and_credit(row.id, "ptx_1").await.unwrap();

        assert!(first.credited);
        assert!(!second.credited);
        assert_eq!(second.transaction.status, TransactionStatus::Confirmed);
        assert_eq!(wallet.balance_of("user_1"), Decimal::new(1000, 2));
    }
}
