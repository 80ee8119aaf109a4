//! SQLite implementation of [`Store`].
//!
//! Durable storage for the idempotency ledger, installations, repositories,
//! review sessions and findings.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table tracking the schema version.
//! When the schema changes, increment `CURRENT_SCHEMA_VERSION` and add a
//! migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    now_secs, DeliveryRecord, FindingRecord, InstallationRecord, InstallationStatus,
    LedgerOutcome, NewDelivery, NewInstallation, RepoStatus, RepoUpsert, RepositoryRecord,
    SessionRecord, SessionUpsert, Store, StoreError,
};
use crate::session::{DraftFinding, FindingStatus, SessionStatus, SessionTotals};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed store.
///
/// Uses `Arc<Mutex<Connection>>` because `rusqlite::Connection` is not
/// `Sync`; operations run under `tokio::task::spawn_blocking` so the
/// synchronous rusqlite calls never block the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Creates a store at the given path, creating the database file and
    /// schema if needed and running any pending migrations.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL` for concurrency and crash safety
    /// - `synchronous = FULL` for maximum durability
    /// - `busy_timeout = 5000ms` to ride out concurrent access
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();

        if path_str != ":memory:" && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // Verify WAL was actually enabled: SQLite can silently keep DELETE
        // mode on filesystems without shared-memory support, which would
        // violate our durability/concurrency assumptions. In-memory databases
        // report "memory", which is expected; they are ephemeral anyway.
        let is_in_memory = path_str == ":memory:";
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'. \
                     The database requires WAL mode for durability and concurrency \
                     guarantees.",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS installations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider_installation_id INTEGER NOT NULL UNIQUE,
                    account_id INTEGER NOT NULL,
                    account_login TEXT NOT NULL,
                    account_type TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('active', 'suspended')),
                    encrypted_access_token BLOB,
                    token_expires_at INTEGER,
                    user_id INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider_repo_id INTEGER NOT NULL UNIQUE,
                    installation_id INTEGER NOT NULL REFERENCES installations(id),
                    name TEXT NOT NULL,
                    full_name TEXT NOT NULL UNIQUE,
                    is_private INTEGER NOT NULL,
                    language TEXT,
                    default_branch TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('active', 'suspended', 'inactive')),
                    last_sync_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_repositories_installation
                    ON repositories(installation_id);

                -- The idempotency ledger. Rows are never deleted; the primary
                -- key on delivery_id is the sole deduplication mechanism.
                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    delivery_id TEXT PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    action TEXT,
                    installation_id INTEGER,
                    repository_id INTEGER,
                    payload TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0,
                    processed_at INTEGER,
                    received_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS review_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repository_id INTEGER NOT NULL REFERENCES repositories(id),
                    pull_request_number INTEGER NOT NULL,
                    provider_pr_id INTEGER NOT NULL,
                    status TEXT NOT NULL CHECK(status IN (
                        'pending', 'analyzing', 'completed', 'cancelled', 'error'
                    )),
                    title TEXT,
                    author TEXT,
                    total_issues INTEGER NOT NULL DEFAULT 0,
                    critical_issues INTEGER NOT NULL DEFAULT 0,
                    suggestions INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    UNIQUE (repository_id, pull_request_number)
                );

                CREATE TABLE IF NOT EXISTS findings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL REFERENCES review_sessions(id),
                    kind TEXT NOT NULL,
                    severity TEXT NOT NULL CHECK(severity IN (
                        'low', 'medium', 'high', 'critical'
                    )),
                    title TEXT NOT NULL,
                    description TEXT NOT NULL,
                    file_path TEXT,
                    line_number INTEGER,
                    suggestion TEXT,
                    is_committable INTEGER NOT NULL,
                    status TEXT NOT NULL CHECK(status IN (
                        'pending', 'accepted', 'rejected', 'applied'
                    )),
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_findings_session
                    ON findings(session_id);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Runs a synchronous closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::storage(operation, e.to_string()))?
    }
}

fn read_installation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstallationRecord> {
    let status_str: String = row.get(5)?;
    Ok(InstallationRecord {
        id: row.get(0)?,
        provider_installation_id: row.get(1)?,
        account_id: row.get(2)?,
        account_login: row.get(3)?,
        account_type: row.get(4)?,
        status: InstallationStatus::parse(&status_str).unwrap_or(InstallationStatus::Suspended),
        encrypted_access_token: row.get(6)?,
        token_expires_at: row.get(7)?,
        user_id: row.get(8)?,
    })
}

const INSTALLATION_COLUMNS: &str = "id, provider_installation_id, account_id, account_login, \
     account_type, status, encrypted_access_token, token_expires_at, user_id";

fn read_repository_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepositoryRecord> {
    let status_str: String = row.get(8)?;
    Ok(RepositoryRecord {
        id: row.get(0)?,
        provider_repo_id: row.get(1)?,
        installation_id: row.get(2)?,
        name: row.get(3)?,
        full_name: row.get(4)?,
        is_private: row.get(5)?,
        language: row.get(6)?,
        default_branch: row.get(7)?,
        status: RepoStatus::parse(&status_str).unwrap_or(RepoStatus::Inactive),
        last_sync_at: row.get(9)?,
    })
}

const REPOSITORY_COLUMNS: &str = "id, provider_repo_id, installation_id, name, full_name, \
     is_private, language, default_branch, status, last_sync_at";

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status_str: String = row.get(4)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        pull_request_number: row.get(2)?,
        provider_pr_id: row.get(3)?,
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Error),
        title: row.get(5)?,
        author: row.get(6)?,
        total_issues: row.get(7)?,
        critical_issues: row.get(8)?,
        suggestions: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

const SESSION_COLUMNS: &str = "id, repository_id, pull_request_number, provider_pr_id, status, \
     title, author, total_issues, critical_issues, suggestions, created_at, updated_at, \
     completed_at";

#[async_trait]
impl Store for SqliteStore {
    async fn insert_delivery(
        &self,
        delivery: NewDelivery<'_>,
    ) -> Result<LedgerOutcome, StoreError> {
        let delivery_id = delivery.delivery_id.to_string();
        let event_type = delivery.event_type.to_string();
        let action = delivery.action.map(|s| s.to_string());
        let installation_id = delivery.installation_id;
        let repository_id = delivery.repository_id;
        let payload = delivery.payload.to_string();

        self.with_conn("insert_delivery", move |conn| {
            // Atomic INSERT OR IGNORE avoids the read-then-insert race: when
            // two consumers contend for the same delivery id, the loser's
            // insert is silently ignored and detected via changes() == 0.
            conn.execute(
                "INSERT OR IGNORE INTO webhook_deliveries
                     (delivery_id, event_type, action, installation_id, repository_id,
                      payload, processed, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![
                    delivery_id,
                    event_type,
                    action,
                    installation_id,
                    repository_id,
                    payload,
                    now_secs()
                ],
            )
            .map_err(|e| StoreError::storage("insert_delivery", e.to_string()))?;

            if conn.changes() > 0 {
                return Ok(LedgerOutcome::Inserted);
            }

            let processed: bool = conn
                .query_row(
                    "SELECT processed FROM webhook_deliveries WHERE delivery_id = ?1",
                    params![delivery_id],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::storage("insert_delivery", e.to_string()))?;

            if processed {
                Ok(LedgerOutcome::AlreadyProcessed)
            } else {
                Ok(LedgerOutcome::InFlight)
            }
        })
        .await
    }

    async fn mark_delivery_processed(&self, delivery_id: &str) -> Result<(), StoreError> {
        let delivery_id = delivery_id.to_string();
        self.with_conn("mark_delivery_processed", move |conn| {
            conn.execute(
                "UPDATE webhook_deliveries SET processed = 1, processed_at = ?1
                 WHERE delivery_id = ?2",
                params![now_secs(), delivery_id],
            )
            .map_err(|e| StoreError::storage("mark_delivery_processed", e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_delivery(
        &self,
        delivery_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let delivery_id = delivery_id.to_string();
        self.with_conn("get_delivery", move |conn| {
            conn.query_row(
                "SELECT delivery_id, event_type, action, installation_id, repository_id,
                        processed, processed_at
                 FROM webhook_deliveries WHERE delivery_id = ?1",
                params![delivery_id],
                |row| {
                    Ok(DeliveryRecord {
                        delivery_id: row.get(0)?,
                        event_type: row.get(1)?,
                        action: row.get(2)?,
                        installation_id: row.get(3)?,
                        repository_id: row.get(4)?,
                        processed: row.get(5)?,
                        processed_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::storage("get_delivery", e.to_string()))
        })
        .await
    }

    async fn upsert_installation(
        &self,
        installation: NewInstallation,
    ) -> Result<InstallationRecord, StoreError> {
        self.with_conn("upsert_installation", move |conn| {
            let now = now_secs();
            conn.execute(
                "INSERT INTO installations
                     (provider_installation_id, account_id, account_login, account_type,
                      status, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?6)
                 ON CONFLICT(provider_installation_id) DO UPDATE SET
                     account_id = excluded.account_id,
                     account_login = excluded.account_login,
                     account_type = excluded.account_type,
                     status = 'active',
                     user_id = COALESCE(excluded.user_id, installations.user_id),
                     updated_at = excluded.updated_at",
                params![
                    installation.provider_installation_id,
                    installation.account_id,
                    installation.account_login,
                    installation.account_type,
                    installation.user_id,
                    now
                ],
            )
            .map_err(|e| StoreError::storage("upsert_installation", e.to_string()))?;

            conn.query_row(
                &format!(
                    "SELECT {INSTALLATION_COLUMNS} FROM installations
                     WHERE provider_installation_id = ?1"
                ),
                params![installation.provider_installation_id],
                read_installation_row,
            )
            .map_err(|e| StoreError::storage("upsert_installation", e.to_string()))
        })
        .await
    }

    async fn get_installation_by_provider_id(
        &self,
        provider_installation_id: u64,
    ) -> Result<Option<InstallationRecord>, StoreError> {
        self.with_conn("get_installation", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {INSTALLATION_COLUMNS} FROM installations
                     WHERE provider_installation_id = ?1"
                ),
                params![provider_installation_id],
                read_installation_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get_installation", e.to_string()))
        })
        .await
    }

    async fn set_installation_status(
        &self,
        provider_installation_id: u64,
        status: InstallationStatus,
    ) -> Result<bool, StoreError> {
        self.with_conn("set_installation_status", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE installations SET status = ?1, updated_at = ?2
                     WHERE provider_installation_id = ?3",
                    params![status.as_str(), now_secs(), provider_installation_id],
                )
                .map_err(|e| StoreError::storage("set_installation_status", e.to_string()))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn store_installation_token(
        &self,
        provider_installation_id: u64,
        encrypted_token: &[u8],
        expires_at: i64,
    ) -> Result<(), StoreError> {
        let encrypted_token = encrypted_token.to_vec();
        self.with_conn("store_installation_token", move |conn| {
            conn.execute(
                "UPDATE installations
                 SET encrypted_access_token = ?1, token_expires_at = ?2, updated_at = ?3
                 WHERE provider_installation_id = ?4",
                params![
                    encrypted_token,
                    expires_at,
                    now_secs(),
                    provider_installation_id
                ],
            )
            .map_err(|e| StoreError::storage("store_installation_token", e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn clear_installation_token(
        &self,
        provider_installation_id: u64,
    ) -> Result<(), StoreError> {
        self.with_conn("clear_installation_token", move |conn| {
            conn.execute(
                "UPDATE installations
                 SET encrypted_access_token = NULL, token_expires_at = NULL, updated_at = ?1
                 WHERE provider_installation_id = ?2",
                params![now_secs(), provider_installation_id],
            )
            .map_err(|e| StoreError::storage("clear_installation_token", e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn upsert_repositories(
        &self,
        installation_row_id: i64,
        repos: &[RepoUpsert],
    ) -> Result<(), StoreError> {
        let repos = repos.to_vec();
        self.with_conn("upsert_repositories", move |conn| {
            let now = now_secs();
            for repo in &repos {
                conn.execute(
                    "INSERT INTO repositories
                         (provider_repo_id, installation_id, name, full_name, is_private,
                          language, default_branch, status, last_sync_at, created_at,
                          updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?8, ?8)
                     ON CONFLICT(provider_repo_id) DO UPDATE SET
                         installation_id = excluded.installation_id,
                         name = excluded.name,
                         full_name = excluded.full_name,
                         is_private = excluded.is_private,
                         language = excluded.language,
                         default_branch = excluded.default_branch,
                         last_sync_at = excluded.last_sync_at,
                         updated_at = excluded.updated_at",
                    params![
                        repo.provider_repo_id,
                        installation_row_id,
                        repo.name,
                        repo.full_name,
                        repo.is_private,
                        repo.language,
                        repo.default_branch,
                        now
                    ],
                )
                .map_err(|e| StoreError::storage("upsert_repositories", e.to_string()))?;
            }
            Ok(())
        })
        .await
    }

    async fn get_repository_by_provider_id(
        &self,
        provider_repo_id: u64,
    ) -> Result<Option<RepositoryRecord>, StoreError> {
        self.with_conn("get_repository", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {REPOSITORY_COLUMNS} FROM repositories
                     WHERE provider_repo_id = ?1"
                ),
                params![provider_repo_id],
                read_repository_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get_repository", e.to_string()))
        })
        .await
    }

    async fn set_repo_status_for_installation(
        &self,
        installation_row_id: i64,
        from: RepoStatus,
        to: RepoStatus,
    ) -> Result<usize, StoreError> {
        self.with_conn("set_repo_status_for_installation", move |conn| {
            conn.execute(
                "UPDATE repositories SET status = ?1, updated_at = ?2
                 WHERE installation_id = ?3 AND status = ?4",
                params![to.as_str(), now_secs(), installation_row_id, from.as_str()],
            )
            .map_err(|e| {
                StoreError::storage("set_repo_status_for_installation", e.to_string())
            })
        })
        .await
    }

    async fn set_repo_status_by_provider_ids(
        &self,
        provider_repo_ids: &[u64],
        status: RepoStatus,
    ) -> Result<usize, StoreError> {
        let ids = provider_repo_ids.to_vec();
        self.with_conn("set_repo_status_by_provider_ids", move |conn| {
            let now = now_secs();
            let mut changed = 0;
            for id in &ids {
                changed += conn
                    .execute(
                        "UPDATE repositories SET status = ?1, updated_at = ?2
                         WHERE provider_repo_id = ?3",
                        params![status.as_str(), now, id],
                    )
                    .map_err(|e| {
                        StoreError::storage("set_repo_status_by_provider_ids", e.to_string())
                    })?;
            }
            Ok(changed)
        })
        .await
    }

    async fn upsert_session(&self, upsert: SessionUpsert) -> Result<SessionRecord, StoreError> {
        self.with_conn("upsert_session", move |conn| {
            let now = now_secs();
            conn.execute(
                "INSERT INTO review_sessions
                     (repository_id, pull_request_number, provider_pr_id, status, title,
                      author, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(repository_id, pull_request_number) DO UPDATE SET
                     provider_pr_id = excluded.provider_pr_id,
                     status = excluded.status,
                     title = COALESCE(excluded.title, review_sessions.title),
                     author = COALESCE(excluded.author, review_sessions.author),
                     completed_at = NULL,
                     updated_at = excluded.updated_at",
                params![
                    upsert.repository_id,
                    upsert.pull_request_number,
                    upsert.provider_pr_id,
                    upsert.status.as_str(),
                    upsert.title,
                    upsert.author,
                    now
                ],
            )
            .map_err(|e| StoreError::storage("upsert_session", e.to_string()))?;

            conn.query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM review_sessions
                     WHERE repository_id = ?1 AND pull_request_number = ?2"
                ),
                params![upsert.repository_id, upsert.pull_request_number],
                read_session_row,
            )
            .map_err(|e| StoreError::storage("upsert_session", e.to_string()))
        })
        .await
    }

    async fn get_session(
        &self,
        repository_id: i64,
        pull_request_number: u64,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.with_conn("get_session", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM review_sessions
                     WHERE repository_id = ?1 AND pull_request_number = ?2"
                ),
                params![repository_id, pull_request_number],
                read_session_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get_session", e.to_string()))
        })
        .await
    }

    async fn set_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        self.with_conn("set_session_status", move |conn| {
            let now = now_secs();
            let completed_at: Option<i64> = status.is_terminal().then_some(now);
            conn.execute(
                "UPDATE review_sessions
                 SET status = ?1, updated_at = ?2,
                     completed_at = COALESCE(?3, completed_at)
                 WHERE id = ?4",
                params![status.as_str(), now, completed_at, session_id],
            )
            .map_err(|e| StoreError::storage("set_session_status", e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn complete_session(
        &self,
        session_id: i64,
        totals: SessionTotals,
    ) -> Result<(), StoreError> {
        self.with_conn("complete_session", move |conn| {
            let now = now_secs();
            conn.execute(
                "UPDATE review_sessions
                 SET status = 'completed', total_issues = ?1, critical_issues = ?2,
                     suggestions = ?3, updated_at = ?4, completed_at = ?4
                 WHERE id = ?5",
                params![
                    totals.total_issues,
                    totals.critical_issues,
                    totals.suggestions,
                    now,
                    session_id
                ],
            )
            .map_err(|e| StoreError::storage("complete_session", e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn replace_findings(
        &self,
        session_id: i64,
        findings: &[DraftFinding],
    ) -> Result<(), StoreError> {
        let findings = findings.to_vec();
        self.with_conn("replace_findings", move |conn| {
            let now = now_secs();
            // Delete-then-insert inside one transaction so a retried delivery
            // leaves exactly one set of rows.
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| StoreError::storage("replace_findings", e.to_string()))?;

            let result = (|| -> Result<(), StoreError> {
                conn.execute(
                    "DELETE FROM findings WHERE session_id = ?1",
                    params![session_id],
                )
                .map_err(|e| StoreError::storage("replace_findings", e.to_string()))?;

                for finding in &findings {
                    conn.execute(
                        "INSERT INTO findings
                             (session_id, kind, severity, title, description, file_path,
                              line_number, suggestion, is_committable, status, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)",
                        params![
                            session_id,
                            finding.kind,
                            finding.severity.as_str(),
                            finding.title,
                            finding.description,
                            finding.file_path,
                            finding.line_number,
                            finding.suggestion,
                            finding.is_committable,
                            now
                        ],
                    )
                    .map_err(|e| StoreError::storage("replace_findings", e.to_string()))?;
                }
                Ok(())
            })();

            match result {
                Ok(()) => conn
                    .execute_batch("COMMIT")
                    .map_err(|e| StoreError::storage("replace_findings", e.to_string())),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
        .await
    }

    async fn get_findings(&self, session_id: i64) -> Result<Vec<FindingRecord>, StoreError> {
        self.with_conn("get_findings", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, kind, severity, title, description, file_path,
                            line_number, suggestion, is_committable, status
                     FROM findings WHERE session_id = ?1 ORDER BY id",
                )
                .map_err(|e| StoreError::storage("get_findings", e.to_string()))?;

            let rows = stmt
                .query_map(params![session_id], |row| {
                    let status_str: String = row.get(10)?;
                    Ok(FindingRecord {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        kind: row.get(2)?,
                        severity: row.get(3)?,
                        title: row.get(4)?,
                        description: row.get(5)?,
                        file_path: row.get(6)?,
                        line_number: row.get(7)?,
                        suggestion: row.get(8)?,
                        is_committable: row.get(9)?,
                        status: FindingStatus::parse(&status_str)
                            .unwrap_or(FindingStatus::Pending),
                    })
                })
                .map_err(|e| StoreError::storage("get_findings", e.to_string()))?;

            let mut findings = Vec::new();
            for row in rows {
                findings
                    .push(row.map_err(|e| StoreError::storage("get_findings", e.to_string()))?);
            }
            Ok(findings)
        })
        .await
    }
}

#[cfg(test)]
mod tests;
