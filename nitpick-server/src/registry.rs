//! Installation registry: lifecycle and credentials for app installations.
//!
//! All access tokens flow through [`InstallationRegistry::get_access_token`].
//! Tokens are stored only in encrypted form; plaintext exists for the
//! duration of one call and is never cached. Routing every token request
//! through this one method is what enforces the invariant that a suspended
//! installation never mints (or yields) a token.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use nitpick_core::vault::{Vault, VaultError};

use crate::github::Provider;
use crate::store::{
    InstallationRecord, InstallationStatus, NewInstallation, RepoStatus, RepoUpsert, Store,
    StoreError,
};

/// Stored tokens within this many seconds of expiry are re-minted instead of
/// returned, so callers never receive a token about to lapse mid-request.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("installation {0} is not registered")]
    UnknownInstallation(u64),

    #[error("installation {0} is suspended; refusing to issue an access token")]
    Suspended(u64),

    #[error("stored access token for installation {0} is not valid UTF-8")]
    CorruptToken(u64),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("provider request failed: {0}")]
    Provider(#[source] anyhow::Error),
}

pub struct InstallationRegistry {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    vault: Vault,
}

impl InstallationRegistry {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn Provider>, vault: Vault) -> Self {
        Self {
            store,
            provider,
            vault,
        }
    }

    pub async fn upsert_installation(
        &self,
        installation: NewInstallation,
    ) -> Result<InstallationRecord, RegistryError> {
        let record = self.store.upsert_installation(installation).await?;
        info!(
            "Registered installation {} for {} ({})",
            record.provider_installation_id, record.account_login, record.account_type
        );
        Ok(record)
    }

    pub async fn get_by_provider_id(
        &self,
        provider_installation_id: u64,
    ) -> Result<Option<InstallationRecord>, RegistryError> {
        Ok(self
            .store
            .get_installation_by_provider_id(provider_installation_id)
            .await?)
    }

    /// Suspends an installation: marks it suspended, cascades its active
    /// repositories to suspended, and drops the stored token. Returns false
    /// when the installation is unknown (a safe no-op for out-of-order
    /// deletes).
    pub async fn suspend(&self, provider_installation_id: u64) -> Result<bool, RegistryError> {
        let Some(record) = self
            .store
            .get_installation_by_provider_id(provider_installation_id)
            .await?
        else {
            return Ok(false);
        };

        self.store
            .set_installation_status(provider_installation_id, InstallationStatus::Suspended)
            .await?;
        let cascaded = self
            .store
            .set_repo_status_for_installation(record.id, RepoStatus::Active, RepoStatus::Suspended)
            .await?;
        self.store
            .clear_installation_token(provider_installation_id)
            .await?;

        info!(
            "Suspended installation {} ({} repositories cascaded)",
            provider_installation_id, cascaded
        );
        Ok(true)
    }

    /// Reactivates a suspended installation and its suspended repositories.
    ///
    /// The access token is not restored: it was dropped at suspension and is
    /// re-established through the provider's installation-auth flow on next
    /// use.
    pub async fn reactivate(&self, provider_installation_id: u64) -> Result<bool, RegistryError> {
        let Some(record) = self
            .store
            .get_installation_by_provider_id(provider_installation_id)
            .await?
        else {
            return Ok(false);
        };

        self.store
            .set_installation_status(provider_installation_id, InstallationStatus::Active)
            .await?;
        self.store
            .set_repo_status_for_installation(record.id, RepoStatus::Suspended, RepoStatus::Active)
            .await?;

        info!("Reactivated installation {}", provider_installation_id);
        Ok(true)
    }

    /// Re-fetches the full repository listing for an installation and
    /// upserts it. Existing rows are updated in place; rows absent from the
    /// listing are left untouched (removal happens only via the explicit
    /// `removed` event).
    pub async fn resync_repositories(
        &self,
        provider_installation_id: u64,
    ) -> Result<usize, RegistryError> {
        let record = self
            .store
            .get_installation_by_provider_id(provider_installation_id)
            .await?
            .ok_or(RegistryError::UnknownInstallation(provider_installation_id))?;

        let token = self.get_access_token(provider_installation_id).await?;
        let remote = self
            .provider
            .list_installation_repositories(&token)
            .await
            .map_err(RegistryError::Provider)?;

        let upserts: Vec<RepoUpsert> = remote
            .into_iter()
            .map(|repo| RepoUpsert {
                provider_repo_id: repo.id,
                name: repo.name,
                full_name: repo.full_name,
                is_private: repo.private,
                language: repo.language,
                default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
            })
            .collect();

        self.store
            .upsert_repositories(record.id, &upserts)
            .await?;

        info!(
            "Resynced {} repositories for installation {}",
            upserts.len(),
            provider_installation_id
        );
        Ok(upserts.len())
    }

    pub async fn mark_repositories_inactive(
        &self,
        provider_repo_ids: &[u64],
    ) -> Result<usize, RegistryError> {
        Ok(self
            .store
            .set_repo_status_by_provider_ids(provider_repo_ids, RepoStatus::Inactive)
            .await?)
    }

    /// Returns a usable access token for an installation.
    ///
    /// Decrypts the stored token when one is present and not near expiry;
    /// otherwise mints a fresh one through the provider, stores only its
    /// encrypted form, and returns the plaintext to the caller. Plaintext is
    /// never retained beyond this call.
    pub async fn get_access_token(
        &self,
        provider_installation_id: u64,
    ) -> Result<String, RegistryError> {
        let record = self
            .store
            .get_installation_by_provider_id(provider_installation_id)
            .await?
            .ok_or(RegistryError::UnknownInstallation(provider_installation_id))?;

        if record.status == InstallationStatus::Suspended {
            return Err(RegistryError::Suspended(provider_installation_id));
        }

        let now = chrono::Utc::now().timestamp();
        if let (Some(blob), Some(expires_at)) =
            (&record.encrypted_access_token, record.token_expires_at)
        {
            if expires_at - now > TOKEN_EXPIRY_BUFFER_SECS {
                let plaintext = self.vault.decrypt(blob)?;
                return String::from_utf8(plaintext)
                    .map_err(|_| RegistryError::CorruptToken(provider_installation_id));
            }
        }

        let minted = self
            .provider
            .mint_installation_token(provider_installation_id)
            .await
            .map_err(RegistryError::Provider)?;

        let encrypted = self.vault.encrypt(minted.token.as_bytes())?;
        self.store
            .store_installation_token(
                provider_installation_id,
                &encrypted,
                minted.expires_at.timestamp(),
            )
            .await?;

        Ok(minted.token)
    }
}
