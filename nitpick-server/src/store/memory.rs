//! In-memory implementation of [`Store`].
//!
//! Mirrors the SQLite backend's semantics (including the three-way ledger
//! outcome) without touching disk. Used by worker and ingress tests; also
//! handy for local experimentation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    now_secs, DeliveryRecord, FindingRecord, InstallationRecord, InstallationStatus,
    LedgerOutcome, NewDelivery, NewInstallation, RepoStatus, RepoUpsert, RepositoryRecord,
    SessionRecord, SessionUpsert, Store, StoreError,
};
use crate::session::{DraftFinding, FindingStatus, SessionStatus, SessionTotals};

#[derive(Default)]
struct Inner {
    deliveries: HashMap<String, DeliveryRecord>,
    installations: HashMap<u64, InstallationRecord>,
    repositories: HashMap<u64, RepositoryRecord>,
    sessions: HashMap<(i64, u64), SessionRecord>,
    findings: HashMap<i64, Vec<FindingRecord>>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_delivery(
        &self,
        delivery: NewDelivery<'_>,
    ) -> Result<LedgerOutcome, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        if let Some(existing) = inner.deliveries.get(delivery.delivery_id) {
            return Ok(if existing.processed {
                LedgerOutcome::AlreadyProcessed
            } else {
                LedgerOutcome::InFlight
            });
        }

        inner.deliveries.insert(
            delivery.delivery_id.to_string(),
            DeliveryRecord {
                delivery_id: delivery.delivery_id.to_string(),
                event_type: delivery.event_type.to_string(),
                action: delivery.action.map(|s| s.to_string()),
                installation_id: delivery.installation_id,
                repository_id: delivery.repository_id,
                processed: false,
                processed_at: None,
            },
        );
        Ok(LedgerOutcome::Inserted)
    }

    async fn mark_delivery_processed(&self, delivery_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(rec) = inner.deliveries.get_mut(delivery_id) {
            rec.processed = true;
            rec.processed_at = Some(now_secs());
        }
        Ok(())
    }

    async fn get_delivery(
        &self,
        delivery_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.deliveries.get(delivery_id).cloned())
    }

    async fn upsert_installation(
        &self,
        installation: NewInstallation,
    ) -> Result<InstallationRecord, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let existing_id = inner
            .installations
            .get(&installation.provider_installation_id)
            .map(|rec| rec.id);
        let id = match existing_id {
            Some(id) => id,
            None => inner.next_id(),
        };

        let record = InstallationRecord {
            id,
            provider_installation_id: installation.provider_installation_id,
            account_id: installation.account_id,
            account_login: installation.account_login,
            account_type: installation.account_type,
            status: InstallationStatus::Active,
            encrypted_access_token: None,
            token_expires_at: None,
            user_id: installation.user_id,
        };
        inner
            .installations
            .insert(installation.provider_installation_id, record.clone());
        Ok(record)
    }

    async fn get_installation_by_provider_id(
        &self,
        provider_installation_id: u64,
    ) -> Result<Option<InstallationRecord>, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.installations.get(&provider_installation_id).cloned())
    }

    async fn set_installation_status(
        &self,
        provider_installation_id: u64,
        status: InstallationStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        match inner.installations.get_mut(&provider_installation_id) {
            Some(rec) => {
                rec.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn store_installation_token(
        &self,
        provider_installation_id: u64,
        encrypted_token: &[u8],
        expires_at: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(rec) = inner.installations.get_mut(&provider_installation_id) {
            rec.encrypted_access_token = Some(encrypted_token.to_vec());
            rec.token_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn clear_installation_token(
        &self,
        provider_installation_id: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(rec) = inner.installations.get_mut(&provider_installation_id) {
            rec.encrypted_access_token = None;
            rec.token_expires_at = None;
        }
        Ok(())
    }

    async fn upsert_repositories(
        &self,
        installation_row_id: i64,
        repos: &[RepoUpsert],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_secs();
        for repo in repos {
            let existing = inner
                .repositories
                .get(&repo.provider_repo_id)
                .map(|rec| (rec.id, rec.status));
            let (id, status) = match existing {
                Some(pair) => pair,
                None => (inner.next_id(), RepoStatus::Active),
            };
            inner.repositories.insert(
                repo.provider_repo_id,
                RepositoryRecord {
                    id,
                    provider_repo_id: repo.provider_repo_id,
                    installation_id: installation_row_id,
                    name: repo.name.clone(),
                    full_name: repo.full_name.clone(),
                    is_private: repo.is_private,
                    language: repo.language.clone(),
                    default_branch: repo.default_branch.clone(),
                    status,
                    last_sync_at: Some(now),
                },
            );
        }
        Ok(())
    }

    async fn get_repository_by_provider_id(
        &self,
        provider_repo_id: u64,
    ) -> Result<Option<RepositoryRecord>, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.repositories.get(&provider_repo_id).cloned())
    }

    async fn set_repo_status_for_installation(
        &self,
        installation_row_id: i64,
        from: RepoStatus,
        to: RepoStatus,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let mut changed = 0;
        for rec in inner.repositories.values_mut() {
            if rec.installation_id == installation_row_id && rec.status == from {
                rec.status = to;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn set_repo_status_by_provider_ids(
        &self,
        provider_repo_ids: &[u64],
        status: RepoStatus,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let mut changed = 0;
        for id in provider_repo_ids {
            if let Some(rec) = inner.repositories.get_mut(id) {
                rec.status = status;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn upsert_session(&self, upsert: SessionUpsert) -> Result<SessionRecord, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_secs();
        let key = (upsert.repository_id, upsert.pull_request_number);

        let existing = inner.sessions.get(&key).cloned();
        let record = match existing {
            Some(existing) => SessionRecord {
                provider_pr_id: upsert.provider_pr_id,
                status: upsert.status,
                title: upsert.title.or_else(|| existing.title.clone()),
                author: upsert.author.or_else(|| existing.author.clone()),
                completed_at: None,
                updated_at: now,
                ..existing
            },
            None => SessionRecord {
                id: inner.next_id(),
                repository_id: upsert.repository_id,
                pull_request_number: upsert.pull_request_number,
                provider_pr_id: upsert.provider_pr_id,
                status: upsert.status,
                title: upsert.title,
                author: upsert.author,
                total_issues: 0,
                critical_issues: 0,
                suggestions: 0,
                created_at: now,
                updated_at: now,
                completed_at: None,
            },
        };
        inner.sessions.insert(key, record.clone());
        Ok(record)
    }

    async fn get_session(
        &self,
        repository_id: i64,
        pull_request_number: u64,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .sessions
            .get(&(repository_id, pull_request_number))
            .cloned())
    }

    async fn set_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_secs();
        for rec in inner.sessions.values_mut() {
            if rec.id == session_id {
                rec.status = status;
                rec.updated_at = now;
                if status.is_terminal() && rec.completed_at.is_none() {
                    rec.completed_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: i64,
        totals: SessionTotals,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_secs();
        for rec in inner.sessions.values_mut() {
            if rec.id == session_id {
                rec.status = SessionStatus::Completed;
                rec.total_issues = totals.total_issues;
                rec.critical_issues = totals.critical_issues;
                rec.suggestions = totals.suggestions;
                rec.updated_at = now;
                rec.completed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn replace_findings(
        &self,
        session_id: i64,
        findings: &[DraftFinding],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let records: Vec<FindingRecord> = findings
            .iter()
            .map(|f| {
                let id = inner.next_id();
                FindingRecord {
                    id,
                    session_id,
                    kind: f.kind.clone(),
                    severity: f.severity.as_str().to_string(),
                    title: f.title.clone(),
                    description: f.description.clone(),
                    file_path: f.file_path.clone(),
                    line_number: f.line_number,
                    suggestion: f.suggestion.clone(),
                    is_committable: f.is_committable,
                    status: FindingStatus::Pending,
                }
            })
            .collect();
        inner.findings.insert(session_id, records);
        Ok(())
    }

    async fn get_findings(&self, session_id: i64) -> Result<Vec<FindingRecord>, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.findings.get(&session_id).cloned().unwrap_or_default())
    }
}
