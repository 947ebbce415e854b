use std::sync::Arc;

use async_trait::async_trait;

use super::{CredentialProvider, ProviderError};
use crate::{IdentityRef, IssuedAccessToken, MintingError, MintingService, Scopes};

/// Trades a server-signed assertion naming the identity for an access token
pub struct DomainDelegationProvider {
    minting: Arc<dyn MintingService>,
}

impl DomainDelegationProvider {
    /// Constructs the provider
    pub fn new(minting: Arc<dyn MintingService>) -> Self {
        Self { minting }
    }
}

#[async_trait]
impl CredentialProvider for DomainDelegationProvider {
    #[tracing::instrument(skip(self, scopes), fields(provider = "domain_delegation"))]
    async fn access_token(
        &self,
        identity: &IdentityRef,
        scopes: &Scopes,
        _target: &str,
    ) -> Result<IssuedAccessToken, ProviderError> {
        match self.minting.delegate_domain(identity, scopes).await {
            Ok(token) => Ok(token),
            Err(MintingError::Forbidden(_)) => Err(ProviderError::Denied(format!(
                "Domain delegation denied for `{identity}`"
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for DomainDelegationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DomainDelegationProvider").finish_non_exhaustive()
    }
}
