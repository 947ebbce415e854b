use std::sync::Arc;

use async_trait::async_trait;

use super::{is_service_account, CredentialProvider, ProviderError};
use crate::{IdentityRef, IssuedAccessToken, MintingService, Scopes};

/// Impersonates service accounts directly
pub struct ImpersonationProvider {
    minting: Arc<dyn MintingService>,
}

impl ImpersonationProvider {
    /// Constructs the provider
    pub fn new(minting: Arc<dyn MintingService>) -> Self {
        Self { minting }
    }
}

#[async_trait]
impl CredentialProvider for ImpersonationProvider {
    #[tracing::instrument(skip(self, scopes), fields(provider = "impersonation"))]
    async fn access_token(
        &self,
        identity: &IdentityRef,
        scopes: &Scopes,
        _target: &str,
    ) -> Result<IssuedAccessToken, ProviderError> {
        if !is_service_account(identity.as_str()) {
            return Err(ProviderError::IllegalArgument(format!(
                "`{identity}` is not a service account"
            )));
        }

        Ok(self.minting.impersonate(identity, scopes).await?)
    }
}

impl std::fmt::Debug for ImpersonationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ImpersonationProvider").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;
    use crate::{test::FakeMinting, Identity};

    #[tokio::test]
    async fn impersonates_service_accounts() -> Result<()> {
        let provider = ImpersonationProvider::new(Arc::new(FakeMinting::new()));
        let sa = Identity::new("etl-job@my-project.iam.gserviceaccount.com".to_string());

        let token = provider.access_token(&sa, &Scopes::parse(["s"])?, "").await?;
        assert_eq!(
            token.access_token().as_str(),
            "impersonated:etl-job@my-project.iam.gserviceaccount.com:1"
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejects_user_identities() -> Result<()> {
        let minting = Arc::new(FakeMinting::new());
        let provider = ImpersonationProvider::new(minting.clone());

        let err = provider
            .access_token(&Identity::new("alice@example.com".to_string()), &Scopes::parse(["s"])?, "")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::IllegalArgument(_)));
        assert_eq!(minting.calls(), 0);
        Ok(())
    }
}
