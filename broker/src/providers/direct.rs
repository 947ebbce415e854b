use std::sync::Arc;

use async_trait::async_trait;

use super::{CredentialProvider, ProviderError};
use crate::{
    IdentityRef, IssuedAccessToken, MintingService, Persistence, Scopes, StoredCredential,
};

/// Exchanges the owner's stored long-lived credential for an access token
///
/// Owners without a stored credential have never completed the consent flow
/// and are denied.
pub struct DirectDelegationProvider {
    persistence: Arc<dyn Persistence>,
    minting: Arc<dyn MintingService>,
}

impl DirectDelegationProvider {
    /// Constructs the provider
    pub fn new(persistence: Arc<dyn Persistence>, minting: Arc<dyn MintingService>) -> Self {
        Self {
            persistence,
            minting,
        }
    }
}

#[async_trait]
impl CredentialProvider for DirectDelegationProvider {
    #[tracing::instrument(skip(self, scopes), fields(provider = "direct_delegation"))]
    async fn access_token(
        &self,
        identity: &IdentityRef,
        scopes: &Scopes,
        _target: &str,
    ) -> Result<IssuedAccessToken, ProviderError> {
        let credential = self
            .persistence
            .load::<StoredCredential>(identity.as_str())
            .await?
            .ok_or_else(|| {
                tracing::debug!("no stored credential");
                ProviderError::Denied(format!("No stored credential found for `{identity}`"))
            })?;

        Ok(self
            .minting
            .exchange_stored_credential(&credential, scopes)
            .await?)
    }
}

impl std::fmt::Debug for DirectDelegationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DirectDelegationProvider").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use broker_clock::UnixTime;
    use color_eyre::Result;

    use super::*;
    use crate::{test::FakeMinting, EncryptedCredential, Identity, InMemoryPersistence};

    #[tokio::test]
    async fn exchanges_the_stored_credential() -> Result<()> {
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let minting = Arc::new(FakeMinting::new());
        let alice = Identity::new("alice@example.com".to_string());
        persistence
            .store(&StoredCredential::new(
                alice.clone(),
                EncryptedCredential::new("encrypted-refresh-token".to_string()),
                UnixTime(0),
            ))
            .await?;

        let provider = DirectDelegationProvider::new(persistence, minting.clone());
        let token = provider
            .access_token(&alice, &Scopes::parse(["scope-a"])?, "")
            .await?;

        assert_eq!(token.access_token().as_str(), "exchanged:alice@example.com:1");
        assert_eq!(minting.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_credential_is_denied() -> Result<()> {
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let minting = Arc::new(FakeMinting::new());
        let provider = DirectDelegationProvider::new(persistence, minting.clone());

        let err = provider
            .access_token(&Identity::new("bob@example.com".to_string()), &Scopes::parse(["scope-a"])?, "")
            .await
            .unwrap_err();

        assert!(matches!(&err, ProviderError::Denied(m) if m.contains("bob@example.com")));
        assert_eq!(minting.calls(), 0);
        Ok(())
    }
}
