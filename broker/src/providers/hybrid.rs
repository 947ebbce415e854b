use std::sync::Arc;

use async_trait::async_trait;

use super::{is_service_account, CredentialProvider, ImpersonationProvider, ProviderError};
use crate::{IdentityRef, IssuedAccessToken, Scopes};

/// Impersonates service accounts and defers every other identity to a user
/// credential provider
pub struct HybridProvider {
    impersonation: ImpersonationProvider,
    user: Arc<dyn CredentialProvider>,
}

impl HybridProvider {
    /// Constructs the provider
    pub fn new(impersonation: ImpersonationProvider, user: Arc<dyn CredentialProvider>) -> Self {
        Self {
            impersonation,
            user,
        }
    }
}

#[async_trait]
impl CredentialProvider for HybridProvider {
    async fn access_token(
        &self,
        identity: &IdentityRef,
        scopes: &Scopes,
        target: &str,
    ) -> Result<IssuedAccessToken, ProviderError> {
        if is_service_account(identity.as_str()) {
            tracing::debug!(%identity, "dispatching to impersonation");
            self.impersonation
                .access_token(identity, scopes, target)
                .await
        } else {
            tracing::debug!(%identity, "dispatching to user provider");
            self.user.access_token(identity, scopes, target).await
        }
    }
}

impl std::fmt::Debug for HybridProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HybridProvider")
            .field("impersonation", &self.impersonation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;
    use crate::{providers::DomainDelegationProvider, test::FakeMinting, Identity};

    #[tokio::test]
    async fn dispatches_on_identity_shape() -> Result<()> {
        let minting = Arc::new(FakeMinting::new());
        let provider = HybridProvider::new(
            ImpersonationProvider::new(minting.clone()),
            Arc::new(DomainDelegationProvider::new(minting.clone())),
        );
        let scopes = Scopes::parse(["s"])?;

        let sa = provider
            .access_token(&Identity::new("etl-job@my-project.iam.gserviceaccount.com".to_string()), &scopes, "")
            .await?;
        assert!(sa.access_token().as_str().starts_with("impersonated:"));

        let user = provider
            .access_token(&Identity::new("alice@example.com".to_string()), &scopes, "")
            .await?;
        assert!(user.access_token().as_str().starts_with("delegated:"));
        Ok(())
    }
}
