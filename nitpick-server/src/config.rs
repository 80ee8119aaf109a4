use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use tracing::warn;

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    /// Shared secret for webhook signature verification.
    ///
    /// Deliberately optional: a missing secret is an operational
    /// misconfiguration that must be loud per-request (500
    /// `MISSING_WEBHOOK_SECRET`) and visible in the health endpoint, not a
    /// startup crash loop.
    pub github_webhook_secret: Option<String>,
    /// Master secret for the credential vault (installation tokens at rest).
    pub vault_master_key: String,
    pub port: u16,
    /// Directory for persistent state (SQLite databases).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Number of concurrent queue consumers.
    pub worker_count: usize,
    /// Attempt ceiling for webhook jobs before they park as failed.
    pub job_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = env::var("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable is required")?
            .replace("\\n", "\n");

        let github_webhook_secret = env::var("GITHUB_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if github_webhook_secret.is_none() {
            warn!(
                "GITHUB_WEBHOOK_SECRET is not set: all webhook deliveries will be \
                 rejected with MISSING_WEBHOOK_SECRET until it is configured"
            );
        }

        let vault_master_key = env::var("VAULT_MASTER_KEY")
            .context("VAULT_MASTER_KEY environment variable is required")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let worker_count = env::var("WORKER_COUNT")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<usize>()
            .context("WORKER_COUNT must be a valid number")?;

        let job_max_attempts = env::var("JOB_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()
            .context("JOB_MAX_ATTEMPTS must be a valid number")?;

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            vault_master_key,
            port,
            state_dir,
            worker_count,
            job_max_attempts,
        })
    }
}
