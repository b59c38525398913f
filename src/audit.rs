//! Audit log (C7): append-only record of state-changing events.
//!
//! No read path is part of the core contract; this module only ever inserts.
//! That asymmetry is the invariant: the audit log is additive, never mutated.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(
        &self,
        actor: &str,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        metadata: Value,
    ) -> Result<(), AuditError>;
}

#[derive(Debug, Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditLog for PgAuditLog {
    #[tracing::instrument(skip(self, metadata), err)]
    async fn record(
        &self,
        actor: &str,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        metadata: Value,
    ) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, actor, action, entity_type, entity_id, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(actor)
        .bind(action)
        .bind(entity_type)
        .bind(entity_id)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
