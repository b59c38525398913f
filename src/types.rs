//! Domain types for the payment lifecycle: transactions, wallets, ledger entries,
//! audit records, and the small set of enums the state machine dispatches on.
//!
//! Money fields are [`rust_decimal::Decimal`] end-to-end, never binary floats,
//! because the webhook signature subset includes the wire-form `amount` string and
//! any lossy conversion would break both signatures and accounting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Provider;

/// Role asserted by the upstream authentication collaborator via `x-user-role`.
/// Anything other than `admin` is treated as an ordinary user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Caller identity established upstream and conveyed via `x-user-id`/`x-user-role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub role: Role,
}

impl CallerIdentity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A user known to the core. The core does not own password or session data; rows
/// are upserted on first observation of a caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
    Expired,
}

impl TransactionStatus {
    /// A transaction never leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed | TransactionStatus::Failed | TransactionStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerDirection {
    Credit,
    Debit,
}

/// A deposit as it is carried from creation through provider settlement to an
/// atomic wallet credit. Mutated only via the narrow transitions in [`crate::transactions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub user_id: String,
    #[sqlx(try_from = "String")]
    pub provider: ProviderColumn,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub provider_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub credited_at: Option<DateTime<Utc>>,
}

/// `Provider` stored as its wire string in the `payment_transactions.provider` column.
/// A thin newtype keeps `sqlx::Type`/`TryFrom<String>` plumbing out of [`Provider`] itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderColumn(pub Provider);

impl From<Provider> for ProviderColumn {
    fn from(p: Provider) -> Self {
        ProviderColumn(p)
    }
}

impl From<ProviderColumn> for Provider {
    fn from(p: ProviderColumn) -> Self {
        p.0
    }
}

impl TryFrom<String> for ProviderColumn {
    type Error = serde_json::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_value(serde_json::Value::String(value))
    }
}

/// One per user, lazily created on first credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    pub id: Uuid,
    pub user_id: String,
    pub balance: Decimal,
    pub currency: String,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of a single directional money movement. `(wallet_id, reference)`
/// is unique and is the sole idempotency key that makes double-credit structurally
/// impossible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WalletLedgerEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub direction: LedgerDirection,
    pub amount: Decimal,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of a state-changing event, for forensic review. No read path
/// is part of the core contract; inserts only, never updates or deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A page of results, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
}
