//! GitHub App API client.
//!
//! Authentication follows the installation-auth flow: a short-lived RS256
//! JWT signed with the app's private key authenticates the app itself, and
//! is exchanged for an installation access token scoped to one installation.
//! Minted tokens are not cached here; the installation registry owns token
//! lifetime (encrypted at rest), which is also where the
//! suspended-installations-never-mint invariant is enforced.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("nitpick/", env!("CARGO_PKG_VERSION"));

/// A freshly-minted installation access token.
#[derive(Debug, Clone)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A repository as reported by the provider's installation listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRepository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    pub language: Option<String>,
    pub default_branch: Option<String>,
}

/// Outbound provider operations consumed by the registry and the worker.
///
/// Repository-scoped calls take the access token as an argument; the
/// registry's `get_access_token` is the only token source.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn mint_installation_token(&self, installation_id: u64) -> Result<InstallationToken>;

    async fn list_installation_repositories(&self, token: &str)
        -> Result<Vec<RemoteRepository>>;

    async fn post_pr_comment(
        &self,
        token: &str,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositoriesResponse {
    total_count: u64,
    repositories: Vec<RemoteRepository>,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    app_id: u64,
    private_key: String,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            client,
            app_id,
            private_key,
        }
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }
}

#[async_trait]
impl Provider for GitHubClient {
    async fn mint_installation_token(&self, installation_id: u64) -> Result<InstallationToken> {
        let jwt = self.generate_jwt()?;
        let url = format!("{GITHUB_API_BASE}/app/installations/{installation_id}/access_tokens");

        info!("Requesting new installation access token for {installation_id}");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub token request failed: {} - {}", status, error_text);
            return Err(anyhow!(
                "GitHub token request failed: {} - {}",
                status,
                error_text
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);

        Ok(InstallationToken {
            token: token_response.token,
            expires_at,
        })
    }

    async fn list_installation_repositories(
        &self,
        token: &str,
    ) -> Result<Vec<RemoteRepository>> {
        let mut repositories = Vec::new();
        let mut page = 1u32;

        loop {
            let url = format!(
                "{GITHUB_API_BASE}/installation/repositories?per_page=100&page={page}"
            );

            let response = self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {}", token))
                .header("Accept", "application/vnd.github.v3+json")
                .send()
                .await
                .context("Failed to send repository listing request")?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response
                    .text()
                    .await
                    .context("Failed to read error response body")?;
                error!(
                    "GitHub repository listing failed: {} - {}",
                    status, error_text
                );
                return Err(anyhow!(
                    "GitHub repository listing failed: {} - {}",
                    status,
                    error_text
                ));
            }

            let body: InstallationRepositoriesResponse = response
                .json()
                .await
                .context("Failed to parse repository listing response")?;

            let fetched = body.repositories.len();
            repositories.extend(body.repositories);

            if fetched < 100 || repositories.len() as u64 >= body.total_count {
                break;
            }
            page += 1;
        }

        info!("Listed {} repositories for installation", repositories.len());
        Ok(repositories)
    }

    async fn post_pr_comment(
        &self,
        token: &str,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<()> {
        let url = format!(
            "{GITHUB_API_BASE}/repos/{repo_owner}/{repo_name}/issues/{pr_number}/comments"
        );

        info!(
            "Posting comment to PR #{} in {}/{}",
            pr_number, repo_owner, repo_name
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&CreateCommentRequest { body })
            .send()
            .await
            .context("Failed to send PR comment request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error: {} - {}", status, error_text);
            return Err(anyhow!("GitHub API error: {} - {}", status, error_text));
        }

        Ok(())
    }
}
