//! Analysis engine seam.
//!
//! The heuristics that actually inspect a pull request live behind this
//! trait and are replaceable without touching the pipeline. The worker only
//! relies on the contract: given an installation and a PR, produce findings
//! or fail.

use anyhow::Result;
use async_trait::async_trait;

use crate::session::DraftFinding;

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Analyzes one pull request and returns its findings.
    ///
    /// No timeout is enforced here: a slow analysis occupies its worker slot
    /// until it completes or fails.
    async fn analyze(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
    ) -> Result<Vec<DraftFinding>>;
}

/// Default engine: reports no findings.
///
/// Stands in until a real engine is plugged at the composition root; every
/// review completes cleanly with zero issues.
pub struct NullEngine;

#[async_trait]
impl AnalysisEngine for NullEngine {
    async fn analyze(
        &self,
        _installation_id: u64,
        _repo_owner: &str,
        _repo_name: &str,
        _pr_number: u64,
    ) -> Result<Vec<DraftFinding>> {
        Ok(Vec::new())
    }
}
