//! Wallet ledger (C3): atomic balance updates paired with append-only entries.
//!
//! `credit` is the only mutating operation this module exposes. There is
//! deliberately no "set balance" or "add to balance" primitive: every credit
//! flows through the `(wallet_id, reference)` uniqueness constraint, which is
//! what makes double-crediting a transaction structurally impossible rather than
//! something callers have to avoid by discipline.

use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::LedgerDirection;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of a [`WalletLedger::credit`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditOutcome {
    pub wallet_balance: Decimal,
    pub credited: bool,
}

#[async_trait::async_trait]
pub trait WalletLedger: Send + Sync {
    /// Credits `amount` to `user_id`'s wallet, lazily creating the wallet if
    /// absent. `reference` is the idempotency key (the causing transaction id);
    /// a repeat call with the same `(user_id, reference)` pair is a no-op that
    /// reports `credited: false` and the unchanged balance.
    async fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<CreditOutcome, WalletError>;
}

/// Postgres-backed ledger. `credit` runs the upsert, the idempotent ledger
/// insert, and the balance increment inside one transaction so all three
/// effects commit together or none do.
#[derive(Debug, Clone)]
pub struct PgWalletLedger {
    pool: PgPool,
}

impl PgWalletLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WalletLedger for PgWalletLedger {
    #[tracing::instrument(skip(self), err)]
    async fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<CreditOutcome, WalletError> {
        let mut tx = self.pool.begin().await?;

        let wallet_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO wallet_accounts (id, user_id, balance, currency, updated_at)
            VALUES ($1, $2, 0, 'PKR', now())
            ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO wallet_ledger_entries (id, wallet_id, direction, amount, reference, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (wallet_id, reference) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(wallet_id)
        .bind(LedgerDirection::Credit)
        .bind(amount)
        .bind(reference)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let balance: Decimal = if inserted {
            sqlx::query_scalar(
                "UPDATE wallet_accounts SET balance = balance + $1, updated_at = now() WHERE id = $2 RETURNING balance",
            )
            .bind(amount)
            .bind(wallet_id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_scalar("SELECT balance FROM wallet_accounts WHERE id = $1")
                .bind(wallet_id)
                .fetch_one(&mut *tx)
                .await?
        };

        tx.commit().await?;

        Ok(CreditOutcome {
            wallet_balance: balance,
            credited: inserted,
        })
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory double for tests that exercise [`crate::service::PaymentsService`]
    /// without a live database. Mirrors the Postgres implementation's idempotency
    /// semantics exactly: `(user_id, reference)` is the uniqueness key.
    #[derive(Debug, Default)]
    pub struct FakeWalletLedger {
        balances: Mutex<HashMap<String, Decimal>>,
        seen_references: Mutex<HashSet<(String, String)>>,
    }

    impl FakeWalletLedger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn balance_of(&self, user_id: &str) -> Decimal {
            *self
                .balances
                .lock()
                .unwrap()
                .get(user_id)
                .unwrap_or(&Decimal::ZERO)
        }
    }

    #[async_trait::async_trait]
    impl WalletLedger for FakeWalletLedger {
        async fn credit(
            &self,
            user_id: &str,
            amount: Decimal,
            reference: &str,
        ) -> Result<CreditOutcome, WalletError> {
            let key = (user_id.to_string(), reference.to_string());
            let mut seen = self.seen_references.lock().unwrap();
            let mut balances = self.balances.lock().unwrap();
            let entry = balances.entry(user_id.to_string()).or_insert(Decimal::ZERO);

            if seen.contains(&key) {
                return Ok(CreditOutcome {
                    wallet_balance: *entry,
                    credited: false,
                });
            }

            seen.insert(key);
            *entry += amount;
            Ok(CreditOutcome {
                wallet_balance: *entry,
                credited: true,
            })
        }
    }

    #[tokio::test]
    async fn credit_is_idempotent_per_reference() {
        let ledger = FakeWalletLedger::new();
        let first = ledger.credit("user_1", Decimal::new(1000, 2), "tx_1").await.unwrap();
        let second = ledger.credit("user_1", Decimal::new(1000, 2), "tx_1").await.unwrap();

        assert!(first.credited);
        assert!(!second.credited);
        assert_eq!(ledger.balance_of("user_1"), Decimal::new(1000, 2));
    }

    #[tokio::test]
    async fn distinct_references_both_credit() {
        let ledger = FakeWalletLedger::new();
        ledger.credit("user_1", Decimal::new(500, 2), "tx_1").await.unwrap();
        ledger.credit("user_1", Decimal::new(500, 2), "tx_2").await.unwrap();

        assert_eq!(ledger.balance_of("user_1"), Decimal::new(1000, 2));
    }
}
