//! Retry queue (C5): in-process, best-effort delayed retry with exponential
//! backoff for transient webhook-processing failures.
//!
//! Tasks do not survive a process restart. That is acceptable because the
//! reconciliation sweep is the authoritative backstop for anything stuck in
//! PENDING; this queue only shortens the time-to-credit for the common case
//! of a transient database hiccup.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::config::RetryConfig;

/// Supplied at construction; re-invoked at `attempt+1` whenever it reports
/// failure, up to `maxRetries`.
#[async_trait::async_trait]
pub trait RetryProcessor: Send + Sync {
    /// Returns `true` on success, `false` to request a re-enqueue.
    async fn process(&self, transaction_id: Uuid, attempt: u32) -> bool;
}

/// `delay(attempt) = min(maxDelayMs, baseDelayMs * 2^(attempt-1))`.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let millis = config.base_delay_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis.min(config.max_delay_ms))
}

pub struct RetryQueue {
    config: RetryConfig,
    processor: Arc<dyn RetryProcessor>,
    audit: Arc<dyn AuditLog>,
    cancellation: CancellationToken,
    tracker: TaskTracker,
}

impl RetryQueue {
    pub fn new(
        config: RetryConfig,
        processor: Arc<dyn RetryProcessor>,
        audit: Arc<dyn AuditLog>,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            processor,
            audit,
            cancellation,
            tracker: TaskTracker::new(),
        })
    }

    /// Schedules `transaction_id` for reprocessing after `compute_delay(attempt)`,
    /// unless `attempt` has already exceeded `maxRetries`, in which case the task
    /// is dropped with an error-level log and a `retry_exhausted` audit entry.
    pub fn enqueue(self: &Arc<Self>, transaction_id: Uuid, attempt: u32) {
        if attempt > self.config.max_retries {
            tracing::error!(
                transaction_id = %transaction_id,
                attempt,
                "retry attempts exhausted, giving up"
            );
            let this = Arc::clone(self);
            self.tracker.spawn(async move {
                let _ = this
                    .audit
                    .record(
                        "system",
                        "retry_exhausted",
                        "payment_transaction",
                        &transaction_id.to_string(),
                        json!({ "attempt": attempt }),
                    )
                    .await;
            });
            return;
        }

        let delay = compute_delay(&self.config, attempt);
        let this = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let succeeded = this.processor.process(transaction_id, attempt).await;
                    if !succeeded {
                        this.enqueue(transaction_id, attempt + 1);
                    }
                }
                _ = cancellation.cancelled() => {
                    tracing::debug!(transaction_id = %transaction_id, "retry cancelled at shutdown");
                }
            }
        });
    }

    /// Stops accepting new tasks and waits for in-flight callbacks to finish.
    /// In-flight callbacks are allowed to complete; only not-yet-fired sleeps
    /// are cut short by the cancellation token passed at construction.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_matches_spec_example() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 250,
        };
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| compute_delay(&config, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 250, 250, 250]);
    }

    #[test]
    fn delay_never_exceeds_max() {
        let config = RetryConfig {
            max_retries: 20,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        };
        for attempt in 1..=20 {
            assert!(compute_delay(&config, attempt).as_millis() as u64 <= 1_000);
        }
    }
}
