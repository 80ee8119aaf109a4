//! Durable job queue.
//!
//! The queue's contract is load-bearing for the ingestion pipeline:
//!
//! - submitted jobs are persisted before they are visible to consumers;
//! - a job whose idempotency key was already used is not enqueued twice,
//!   so a redelivered HTTP request collapses before it reaches a worker;
//! - a failing job is retried with exponential backoff up to its attempt
//!   ceiling, then parked in a terminal `failed` state for operator
//!   inspection rather than silently dropped;
//! - multiple consumers pull concurrently from the same logical queue, and
//!   a claimed job is visible to exactly one of them.

mod sqlite;

pub use sqlite::SqliteQueue;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
}

impl QueueError {
    pub fn storage(operation: &'static str, message: impl ToString) -> Self {
        Self::Storage {
            operation,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    /// Caller-supplied deduplication key; for webhook jobs, the delivery id.
    pub idempotency_key: &'a str,
    pub kind: &'a str,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The idempotency key was already used; the submission was collapsed.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    /// 1-based attempt number of this claim.
    pub attempt: u32,
    pub max_attempts: u32,
}

/// What [`JobQueue::fail`] decided to do with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Rescheduled; will become claimable again after the delay.
    Retrying { delay: Duration },
    /// Attempt ceiling reached; parked in the terminal failed state.
    Failed,
}

/// Depth counters, surfaced by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persists a job unless its idempotency key was already used.
    async fn enqueue(&self, job: NewJob<'_>) -> Result<EnqueueOutcome, QueueError>;

    /// Atomically claims the oldest runnable job, if any. A claimed job is
    /// invisible to other consumers until completed or failed.
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError>;

    async fn complete(&self, job_id: i64) -> Result<(), QueueError>;

    /// Records a failed attempt: reschedules with backoff below the attempt
    /// ceiling, parks the job as failed at it.
    async fn fail(&self, job_id: i64, error: &str) -> Result<FailDisposition, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Base delay for the first retry; doubles per attempt.
const RETRY_BASE_SECS: u64 = 30;

/// Backoff for the retry after the given (1-based) failed attempt:
/// 30s, 60s, 120s, 240s, ...
pub fn retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    Duration::from_secs(RETRY_BASE_SECS << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(1), Duration::from_secs(30));
        assert_eq!(retry_delay(2), Duration::from_secs(60));
        assert_eq!(retry_delay(3), Duration::from_secs(120));
        assert_eq!(retry_delay(4), Duration::from_secs(240));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        // The shift is clamped so absurd attempt numbers cannot overflow.
        assert_eq!(retry_delay(200), Duration::from_secs(30 << 10));
    }

    proptest! {
        #[test]
        fn prop_retry_delay_is_monotone(a in 1u32..64, b in 1u32..64) {
            if a <= b {
                prop_assert!(retry_delay(a) <= retry_delay(b));
            }
        }
    }
}
