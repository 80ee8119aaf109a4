//! Shared fakes for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::analysis::AnalysisEngine;
use crate::github::{InstallationToken, Provider, RemoteRepository};
use crate::session::DraftFinding;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub repo_owner: String,
    pub repo_name: String,
    pub pr_number: u64,
    pub body: String,
}

/// In-memory [`Provider`] with scriptable behavior.
#[derive(Default)]
pub struct FakeProvider {
    repositories: Mutex<Vec<RemoteRepository>>,
    comments: Mutex<Vec<PostedComment>>,
    minted: AtomicUsize,
    fail_minting: AtomicBool,
    fail_comments: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_repositories(&self, repos: Vec<RemoteRepository>) {
        *self.repositories.lock().unwrap() = repos;
    }

    pub fn minted_count(&self) -> usize {
        self.minted.load(Ordering::SeqCst)
    }

    pub fn posted_comments(&self) -> Vec<PostedComment> {
        self.comments.lock().unwrap().clone()
    }

    pub fn fail_comments(&self, fail: bool) {
        self.fail_comments.store(fail, Ordering::SeqCst);
    }

    pub fn fail_minting(&self, fail: bool) {
        self.fail_minting.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn mint_installation_token(&self, installation_id: u64) -> Result<InstallationToken> {
        if self.fail_minting.load(Ordering::SeqCst) {
            return Err(anyhow!("provider unavailable"));
        }
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(InstallationToken {
            token: format!("ghs_test_{installation_id}_{n}"),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn list_installation_repositories(
        &self,
        _token: &str,
    ) -> Result<Vec<RemoteRepository>> {
        Ok(self.repositories.lock().unwrap().clone())
    }

    async fn post_pr_comment(
        &self,
        _token: &str,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<()> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(anyhow!("comment endpoint unavailable"));
        }
        self.comments.lock().unwrap().push(PostedComment {
            repo_owner: repo_owner.to_string(),
            repo_name: repo_name.to_string(),
            pr_number,
            body: body.to_string(),
        });
        Ok(())
    }
}

pub fn remote_repo(id: u64, full_name: &str) -> RemoteRepository {
    let name = full_name.split('/').next_back().unwrap().to_string();
    RemoteRepository {
        id,
        name,
        full_name: full_name.to_string(),
        private: false,
        language: Some("Rust".to_string()),
        default_branch: Some("main".to_string()),
    }
}

/// Engine returning a fixed set of findings, counting invocations.
pub struct FixedEngine {
    findings: Vec<DraftFinding>,
    calls: AtomicUsize,
}

impl FixedEngine {
    pub fn new(findings: Vec<DraftFinding>) -> Self {
        Self {
            findings,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisEngine for FixedEngine {
    async fn analyze(
        &self,
        _installation_id: u64,
        _repo_owner: &str,
        _repo_name: &str,
        _pr_number: u64,
    ) -> Result<Vec<DraftFinding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.findings.clone())
    }
}

/// Engine that always fails.
pub struct FailingEngine;

#[async_trait]
impl AnalysisEngine for FailingEngine {
    async fn analyze(
        &self,
        _installation_id: u64,
        _repo_owner: &str,
        _repo_name: &str,
        _pr_number: u64,
    ) -> Result<Vec<DraftFinding>> {
        Err(anyhow!("analysis engine exploded"))
    }
}
