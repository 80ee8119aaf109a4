//! Tests for the SQLite store.

use std::sync::Arc;

use super::super::{
    InstallationStatus, LedgerOutcome, NewDelivery, NewInstallation, RepoStatus, RepoUpsert,
    SessionUpsert, Store,
};
use super::SqliteStore;
use crate::session::{DraftFinding, FindingSeverity, SessionStatus, SessionTotals};

fn delivery<'a>(id: &'a str, payload: &'a str) -> NewDelivery<'a> {
    NewDelivery {
        delivery_id: id,
        event_type: "pull_request",
        action: Some("opened"),
        installation_id: Some(42),
        repository_id: Some(9),
        payload,
    }
}

fn installation(provider_id: u64) -> NewInstallation {
    NewInstallation {
        provider_installation_id: provider_id,
        account_id: 7,
        account_login: "octo-org".to_string(),
        account_type: "Organization".to_string(),
        user_id: None,
    }
}

fn repo(provider_id: u64, full_name: &str) -> RepoUpsert {
    let name = full_name.split('/').next_back().unwrap().to_string();
    RepoUpsert {
        provider_repo_id: provider_id,
        name,
        full_name: full_name.to_string(),
        is_private: false,
        language: Some("Rust".to_string()),
        default_branch: "main".to_string(),
    }
}

fn finding(title: &str, severity: FindingSeverity) -> DraftFinding {
    DraftFinding {
        kind: "bug".to_string(),
        severity,
        title: title.to_string(),
        description: "description".to_string(),
        file_path: Some("src/lib.rs".to_string()),
        line_number: Some(12),
        suggestion: None,
        is_committable: false,
    }
}

// ---------------------------------------------------------------------------
// Idempotency ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fresh_delivery_is_inserted() {
    let store = SqliteStore::new_in_memory().unwrap();
    let outcome = store.insert_delivery(delivery("d-1", "{}")).await.unwrap();
    assert_eq!(outcome, LedgerOutcome::Inserted);
}

#[tokio::test]
async fn test_unprocessed_duplicate_is_in_flight() {
    // A second insert before processing completes is a queue retry: the
    // caller must process it, not skip it.
    let store = SqliteStore::new_in_memory().unwrap();
    store.insert_delivery(delivery("d-1", "{}")).await.unwrap();

    let outcome = store.insert_delivery(delivery("d-1", "{}")).await.unwrap();
    assert_eq!(outcome, LedgerOutcome::InFlight);
}

#[tokio::test]
async fn test_processed_duplicate_short_circuits() {
    let store = SqliteStore::new_in_memory().unwrap();
    store.insert_delivery(delivery("d-1", "{}")).await.unwrap();
    store.mark_delivery_processed("d-1").await.unwrap();

    let outcome = store.insert_delivery(delivery("d-1", "{}")).await.unwrap();
    assert_eq!(outcome, LedgerOutcome::AlreadyProcessed);
}

#[tokio::test]
async fn test_concurrent_inserts_one_winner() {
    // Two consumers race on the same delivery id: exactly one observes
    // Inserted, the other observes the duplicate condition.
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());

    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.insert_delivery(delivery("d-race", "{}")).await })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.insert_delivery(delivery("d-race", "{}")).await })
    };

    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
    let inserted = [a, b]
        .iter()
        .filter(|o| **o == LedgerOutcome::Inserted)
        .count();
    assert_eq!(inserted, 1, "exactly one insert must win, got {a:?}/{b:?}");
    assert!([a, b].contains(&LedgerOutcome::InFlight));
}

#[tokio::test]
async fn test_delivery_audit_fields_survive() {
    let store = SqliteStore::new_in_memory().unwrap();
    store
        .insert_delivery(delivery("d-1", "{\"action\":\"opened\"}"))
        .await
        .unwrap();

    let rec = store.get_delivery("d-1").await.unwrap().unwrap();
    assert_eq!(rec.event_type, "pull_request");
    assert_eq!(rec.action.as_deref(), Some("opened"));
    assert_eq!(rec.installation_id, Some(42));
    assert!(!rec.processed);
    assert!(rec.processed_at.is_none());

    store.mark_delivery_processed("d-1").await.unwrap();
    let rec = store.get_delivery("d-1").await.unwrap().unwrap();
    assert!(rec.processed);
    assert!(rec.processed_at.is_some());
}

// ---------------------------------------------------------------------------
// Installations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_upsert_installation_creates_active() {
    let store = SqliteStore::new_in_memory().unwrap();
    let rec = store.upsert_installation(installation(42)).await.unwrap();
    assert_eq!(rec.provider_installation_id, 42);
    assert_eq!(rec.status, InstallationStatus::Active);
    assert!(rec.encrypted_access_token.is_none());
}

#[tokio::test]
async fn test_upsert_installation_reactivates_suspended() {
    let store = SqliteStore::new_in_memory().unwrap();
    store.upsert_installation(installation(42)).await.unwrap();
    store
        .set_installation_status(42, InstallationStatus::Suspended)
        .await
        .unwrap();

    let rec = store.upsert_installation(installation(42)).await.unwrap();
    assert_eq!(rec.status, InstallationStatus::Active);
}

#[tokio::test]
async fn test_set_status_unknown_installation_reports_false() {
    let store = SqliteStore::new_in_memory().unwrap();
    let changed = store
        .set_installation_status(999, InstallationStatus::Suspended)
        .await
        .unwrap();
    assert!(!changed);
}

#[tokio::test]
async fn test_token_store_and_clear() {
    let store = SqliteStore::new_in_memory().unwrap();
    store.upsert_installation(installation(42)).await.unwrap();

    store
        .store_installation_token(42, b"opaque-blob", 1_999_999_999)
        .await
        .unwrap();
    let rec = store.get_installation_by_provider_id(42).await.unwrap().unwrap();
    assert_eq!(rec.encrypted_access_token.as_deref(), Some(&b"opaque-blob"[..]));
    assert_eq!(rec.token_expires_at, Some(1_999_999_999));

    store.clear_installation_token(42).await.unwrap();
    let rec = store.get_installation_by_provider_id(42).await.unwrap().unwrap();
    assert!(rec.encrypted_access_token.is_none());
    assert!(rec.token_expires_at.is_none());
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_upsert_repositories_inserts_active() {
    let store = SqliteStore::new_in_memory().unwrap();
    let inst = store.upsert_installation(installation(42)).await.unwrap();

    store
        .upsert_repositories(inst.id, &[repo(1, "octo/alpha"), repo(2, "octo/beta")])
        .await
        .unwrap();

    let rec = store.get_repository_by_provider_id(1).await.unwrap().unwrap();
    assert_eq!(rec.full_name, "octo/alpha");
    assert_eq!(rec.status, RepoStatus::Active);
    assert!(rec.last_sync_at.is_some());
}

#[tokio::test]
async fn test_upsert_repositories_updates_in_place() {
    let store = SqliteStore::new_in_memory().unwrap();
    let inst = store.upsert_installation(installation(42)).await.unwrap();

    store
        .upsert_repositories(inst.id, &[repo(1, "octo/alpha")])
        .await
        .unwrap();
    let before = store.get_repository_by_provider_id(1).await.unwrap().unwrap();

    let mut renamed = repo(1, "octo/alpha-renamed");
    renamed.default_branch = "trunk".to_string();
    store
        .upsert_repositories(inst.id, &[renamed])
        .await
        .unwrap();

    let after = store.get_repository_by_provider_id(1).await.unwrap().unwrap();
    assert_eq!(after.id, before.id, "update in place, not a new row");
    assert_eq!(after.full_name, "octo/alpha-renamed");
    assert_eq!(after.default_branch, "trunk");
}

#[tokio::test]
async fn test_resync_does_not_deactivate_missing_repos() {
    // Documents current behavior: resync is additive-only. A repository
    // present in a prior sync but absent from a fresh one keeps its status;
    // only an explicit `removed` event deactivates it.
    let store = SqliteStore::new_in_memory().unwrap();
    let inst = store.upsert_installation(installation(42)).await.unwrap();

    store
        .upsert_repositories(inst.id, &[repo(1, "octo/alpha"), repo(2, "octo/beta")])
        .await
        .unwrap();

    // Fresh sync no longer lists octo/beta.
    store
        .upsert_repositories(inst.id, &[repo(1, "octo/alpha")])
        .await
        .unwrap();

    let beta = store.get_repository_by_provider_id(2).await.unwrap().unwrap();
    assert_eq!(beta.status, RepoStatus::Active);
}

#[tokio::test]
async fn test_suspend_cascade_and_unsuspend_restore() {
    let store = SqliteStore::new_in_memory().unwrap();
    let inst = store.upsert_installation(installation(42)).await.unwrap();
    store
        .upsert_repositories(inst.id, &[repo(1, "octo/alpha"), repo(2, "octo/beta")])
        .await
        .unwrap();
    // One repo was already explicitly removed; a suspend/unsuspend cycle must
    // not resurrect it.
    store
        .set_repo_status_by_provider_ids(&[2], RepoStatus::Inactive)
        .await
        .unwrap();

    let changed = store
        .set_repo_status_for_installation(inst.id, RepoStatus::Active, RepoStatus::Suspended)
        .await
        .unwrap();
    assert_eq!(changed, 1);
    assert_eq!(
        store.get_repository_by_provider_id(1).await.unwrap().unwrap().status,
        RepoStatus::Suspended
    );

    store
        .set_repo_status_for_installation(inst.id, RepoStatus::Suspended, RepoStatus::Active)
        .await
        .unwrap();
    assert_eq!(
        store.get_repository_by_provider_id(1).await.unwrap().unwrap().status,
        RepoStatus::Active
    );
    assert_eq!(
        store.get_repository_by_provider_id(2).await.unwrap().unwrap().status,
        RepoStatus::Inactive
    );
}

// ---------------------------------------------------------------------------
// Review sessions and findings
// ---------------------------------------------------------------------------

async fn seeded_repo_id(store: &SqliteStore) -> i64 {
    let inst = store.upsert_installation(installation(42)).await.unwrap();
    store
        .upsert_repositories(inst.id, &[repo(1, "octo/alpha")])
        .await
        .unwrap();
    store
        .get_repository_by_provider_id(1)
        .await
        .unwrap()
        .unwrap()
        .id
}

fn session_upsert(repository_id: i64, pr_number: u64) -> SessionUpsert {
    SessionUpsert {
        repository_id,
        pull_request_number: pr_number,
        provider_pr_id: 1000 + pr_number,
        status: SessionStatus::Analyzing,
        title: Some("Add feature".to_string()),
        author: Some("contributor".to_string()),
    }
}

#[tokio::test]
async fn test_upsert_session_updates_not_duplicates() {
    let store = SqliteStore::new_in_memory().unwrap();
    let repo_id = seeded_repo_id(&store).await;

    let first = store.upsert_session(session_upsert(repo_id, 5)).await.unwrap();
    let second = store.upsert_session(session_upsert(repo_id, 5)).await.unwrap();

    assert_eq!(first.id, second.id, "same (repo, PR) must reuse the row");
    assert_eq!(second.status, SessionStatus::Analyzing);

    // A different PR number is a different session.
    let other = store.upsert_session(session_upsert(repo_id, 6)).await.unwrap();
    assert_ne!(other.id, first.id);
}

#[tokio::test]
async fn test_reanalysis_clears_completed_at() {
    let store = SqliteStore::new_in_memory().unwrap();
    let repo_id = seeded_repo_id(&store).await;

    let session = store.upsert_session(session_upsert(repo_id, 5)).await.unwrap();
    store
        .complete_session(session.id, SessionTotals::default())
        .await
        .unwrap();

    // Synchronize after completion re-enters analysis on the same row.
    let reopened = store.upsert_session(session_upsert(repo_id, 5)).await.unwrap();
    assert_eq!(reopened.id, session.id);
    assert_eq!(reopened.status, SessionStatus::Analyzing);
    assert!(reopened.completed_at.is_none());
}

#[tokio::test]
async fn test_terminal_status_stamps_completed_at() {
    let store = SqliteStore::new_in_memory().unwrap();
    let repo_id = seeded_repo_id(&store).await;
    let session = store.upsert_session(session_upsert(repo_id, 5)).await.unwrap();

    store
        .set_session_status(session.id, SessionStatus::Cancelled)
        .await
        .unwrap();

    let rec = store.get_session(repo_id, 5).await.unwrap().unwrap();
    assert_eq!(rec.status, SessionStatus::Cancelled);
    assert!(rec.completed_at.is_some());
}

#[tokio::test]
async fn test_complete_session_stores_totals() {
    let store = SqliteStore::new_in_memory().unwrap();
    let repo_id = seeded_repo_id(&store).await;
    let session = store.upsert_session(session_upsert(repo_id, 5)).await.unwrap();

    store
        .complete_session(
            session.id,
            SessionTotals {
                total_issues: 3,
                critical_issues: 1,
                suggestions: 2,
            },
        )
        .await
        .unwrap();

    let rec = store.get_session(repo_id, 5).await.unwrap().unwrap();
    assert_eq!(rec.status, SessionStatus::Completed);
    assert_eq!(rec.total_issues, 3);
    assert_eq!(rec.critical_issues, 1);
    assert_eq!(rec.suggestions, 2);
    assert!(rec.completed_at.is_some());
}

#[tokio::test]
async fn test_replace_findings_leaves_one_set() {
    let store = SqliteStore::new_in_memory().unwrap();
    let repo_id = seeded_repo_id(&store).await;
    let session = store.upsert_session(session_upsert(repo_id, 5)).await.unwrap();

    store
        .replace_findings(
            session.id,
            &[
                finding("first pass a", FindingSeverity::High),
                finding("first pass b", FindingSeverity::Low),
            ],
        )
        .await
        .unwrap();

    store
        .replace_findings(
            session.id,
            &[finding("second pass", FindingSeverity::Critical)],
        )
        .await
        .unwrap();

    let findings = store.get_findings(session.id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "second pass");
    assert_eq!(findings[0].severity, "critical");
    assert_eq!(
        findings[0].status,
        crate::session::FindingStatus::Pending,
        "new findings start pending"
    );
}

#[tokio::test]
async fn test_store_survives_reopen() {
    // Durability across process restarts: state written through one handle is
    // visible through a fresh one on the same file.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let store = SqliteStore::new(&path).unwrap();
        store.insert_delivery(delivery("d-1", "{}")).await.unwrap();
        store.mark_delivery_processed("d-1").await.unwrap();
    }

    let store = SqliteStore::new(&path).unwrap();
    assert_eq!(
        store.insert_delivery(delivery("d-1", "{}")).await.unwrap(),
        LedgerOutcome::AlreadyProcessed
    );
}
