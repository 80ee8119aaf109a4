//! Persistence abstraction for the review service.
//!
//! The [`Store`] trait covers the idempotency ledger, installations,
//! repositories, review sessions and findings. The SQLite implementation is
//! the production backend; the in-memory implementation backs fast worker
//! tests.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{DraftFinding, FindingStatus, SessionStatus, SessionTotals};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt data in {0}")]
    Corruption(&'static str),
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl ToString) -> Self {
        Self::Storage {
            operation,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationStatus {
    Active,
    Suspended,
}

impl InstallationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStatus {
    Active,
    Suspended,
    Inactive,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallationRecord {
    /// Internal row id, referenced by repositories.
    pub id: i64,
    pub provider_installation_id: u64,
    pub account_id: u64,
    pub account_login: String,
    pub account_type: String,
    pub status: InstallationStatus,
    pub encrypted_access_token: Option<Vec<u8>>,
    /// Unix seconds; present iff a token is stored.
    pub token_expires_at: Option<i64>,
    pub user_id: Option<u64>,
}

/// Fields for installation create-or-update. Status is always reset to
/// active by an upsert (the install/unsuspend paths); suspension goes through
/// [`Store::set_installation_status`].
#[derive(Debug, Clone)]
pub struct NewInstallation {
    pub provider_installation_id: u64,
    pub account_id: u64,
    pub account_login: String,
    pub account_type: String,
    pub user_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RepositoryRecord {
    pub id: i64,
    pub provider_repo_id: u64,
    /// Internal installation row id.
    pub installation_id: i64,
    pub name: String,
    pub full_name: String,
    pub is_private: bool,
    pub language: Option<String>,
    pub default_branch: String,
    pub status: RepoStatus,
    pub last_sync_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RepoUpsert {
    pub provider_repo_id: u64,
    pub name: String,
    pub full_name: String,
    pub is_private: bool,
    pub language: Option<String>,
    pub default_branch: String,
}

#[derive(Debug, Clone)]
pub struct NewDelivery<'a> {
    pub delivery_id: &'a str,
    pub event_type: &'a str,
    pub action: Option<&'a str>,
    pub installation_id: Option<u64>,
    pub repository_id: Option<u64>,
    /// Raw payload text, kept for the audit trail.
    pub payload: &'a str,
}

#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub installation_id: Option<u64>,
    pub repository_id: Option<u64>,
    pub processed: bool,
    pub processed_at: Option<i64>,
}

/// Outcome of attempting to insert a ledger row.
///
/// The three-way split is what turns at-least-once delivery into
/// effectively-once processing: only `AlreadyProcessed` short-circuits. A row
/// that exists but is unprocessed belongs to a queue retry of a previously
/// failed attempt and must be processed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// Fresh row inserted; this consumer owns the delivery.
    Inserted,
    /// Row exists with `processed = true`: done, skip as a success.
    AlreadyProcessed,
    /// Row exists with `processed = false`: a retry in flight; process it.
    InFlight,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub repository_id: i64,
    pub pull_request_number: u64,
    pub provider_pr_id: u64,
    pub status: SessionStatus,
    pub title: Option<String>,
    pub author: Option<String>,
    pub total_issues: u32,
    pub critical_issues: u32,
    pub suggestions: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// Create-or-update for the one logically-current session of a PR.
#[derive(Debug, Clone)]
pub struct SessionUpsert {
    pub repository_id: i64,
    pub pull_request_number: u64,
    pub provider_pr_id: u64,
    pub status: SessionStatus,
    pub title: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FindingRecord {
    pub id: i64,
    pub session_id: i64,
    pub kind: String,
    pub severity: String,
    pub title: String,
    pub description: String,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub suggestion: Option<String>,
    pub is_committable: bool,
    pub status: FindingStatus,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ---------------------------------------------------------------------
    // Idempotency ledger
    // ---------------------------------------------------------------------

    /// Attempts to insert a ledger row for a delivery. The unique constraint
    /// on the delivery id is the sole deduplication mechanism; the duplicate
    /// case is reported as an outcome, distinguishable from storage errors.
    async fn insert_delivery(&self, delivery: NewDelivery<'_>)
        -> Result<LedgerOutcome, StoreError>;

    /// Flips `processed` to true. The ledger's only mutation.
    async fn mark_delivery_processed(&self, delivery_id: &str) -> Result<(), StoreError>;

    async fn get_delivery(&self, delivery_id: &str)
        -> Result<Option<DeliveryRecord>, StoreError>;

    // ---------------------------------------------------------------------
    // Installations
    // ---------------------------------------------------------------------

    /// Create-or-update by provider installation id; resets status to active.
    async fn upsert_installation(
        &self,
        installation: NewInstallation,
    ) -> Result<InstallationRecord, StoreError>;

    async fn get_installation_by_provider_id(
        &self,
        provider_installation_id: u64,
    ) -> Result<Option<InstallationRecord>, StoreError>;

    /// Returns false when the installation is unknown.
    async fn set_installation_status(
        &self,
        provider_installation_id: u64,
        status: InstallationStatus,
    ) -> Result<bool, StoreError>;

    async fn store_installation_token(
        &self,
        provider_installation_id: u64,
        encrypted_token: &[u8],
        expires_at: i64,
    ) -> Result<(), StoreError>;

    async fn clear_installation_token(
        &self,
        provider_installation_id: u64,
    ) -> Result<(), StoreError>;

    // ---------------------------------------------------------------------
    // Repositories
    // ---------------------------------------------------------------------

    /// Bulk create-or-update keyed by provider repo id. Existing rows are
    /// updated in place (including `last_sync_at`); new rows are inserted as
    /// active. Rows absent from `repos` are left untouched.
    async fn upsert_repositories(
        &self,
        installation_row_id: i64,
        repos: &[RepoUpsert],
    ) -> Result<(), StoreError>;

    async fn get_repository_by_provider_id(
        &self,
        provider_repo_id: u64,
    ) -> Result<Option<RepositoryRecord>, StoreError>;

    /// Moves every repository of an installation from `from` to `to`
    /// (suspend/unsuspend cascades).
    async fn set_repo_status_for_installation(
        &self,
        installation_row_id: i64,
        from: RepoStatus,
        to: RepoStatus,
    ) -> Result<usize, StoreError>;

    async fn set_repo_status_by_provider_ids(
        &self,
        provider_repo_ids: &[u64],
        status: RepoStatus,
    ) -> Result<usize, StoreError>;

    // ---------------------------------------------------------------------
    // Review sessions and findings
    // ---------------------------------------------------------------------

    /// Create-or-update the session for `(repository, PR number)`.
    async fn upsert_session(&self, upsert: SessionUpsert) -> Result<SessionRecord, StoreError>;

    async fn get_session(
        &self,
        repository_id: i64,
        pull_request_number: u64,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Sets the status (and `completed_at` when terminal).
    async fn set_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
    ) -> Result<(), StoreError>;

    /// Marks a session completed with its aggregate counters.
    async fn complete_session(
        &self,
        session_id: i64,
        totals: SessionTotals,
    ) -> Result<(), StoreError>;

    /// Replaces the findings of a session with a freshly-analyzed set. Used
    /// on first analysis and on re-analysis alike, so a retried delivery
    /// leaves exactly one set of rows.
    async fn replace_findings(
        &self,
        session_id: i64,
        findings: &[DraftFinding],
    ) -> Result<(), StoreError>;

    async fn get_findings(&self, session_id: i64) -> Result<Vec<FindingRecord>, StoreError>;
}

pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
