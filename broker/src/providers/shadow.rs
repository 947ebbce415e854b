use std::sync::Arc;

use async_trait::async_trait;

use super::{CredentialProvider, ImpersonationProvider, ProviderError};
use crate::{
    config::ShadowConfig, AccessBoundary, Identity, IdentityRef, IssuedAccessToken,
    MintingService, Scopes,
};

/// Impersonates a per-user shadow service account instead of the user
///
/// The shadow account's name is derived from the username part of the
/// identity through the configured pattern. When a target is requested, the
/// token is downscoped to that resource.
pub struct ShadowAccountProvider {
    config: ShadowConfig,
    impersonation: ImpersonationProvider,
    minting: Arc<dyn MintingService>,
}

impl ShadowAccountProvider {
    /// Constructs the provider
    pub fn new(config: ShadowConfig, minting: Arc<dyn MintingService>) -> Self {
        Self {
            config,
            impersonation: ImpersonationProvider::new(Arc::clone(&minting)),
            minting,
        }
    }

    /// The shadow service account standing in for `identity`
    pub fn shadow_account(&self, identity: &IdentityRef) -> Identity {
        let username = identity
            .as_str()
            .split('@')
            .next()
            .unwrap_or_default()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect::<String>();

        Identity::from(
            self.config
                .pattern
                .replace("{username}", &username)
                .replace("{project}", &self.config.project),
        )
    }
}

#[async_trait]
impl CredentialProvider for ShadowAccountProvider {
    #[tracing::instrument(skip(self, scopes), fields(provider = "shadow", shadow = tracing::field::Empty))]
    async fn access_token(
        &self,
        identity: &IdentityRef,
        scopes: &Scopes,
        target: &str,
    ) -> Result<IssuedAccessToken, ProviderError> {
        let shadow = self.shadow_account(identity);
        tracing::Span::current().record("shadow", shadow.as_str());

        let token = self
            .impersonation
            .access_token(&shadow, scopes, target)
            .await?;

        if target.is_empty() {
            return Ok(token);
        }

        let boundary = AccessBoundary::for_target(target, &self.config.boundary_permissions);
        tracing::debug!(resource = boundary.resource(), "downscoping shadow token");
        Ok(self.minting.downscope(&token, &boundary).await?)
    }
}

impl std::fmt::Debug for ShadowAccountProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShadowAccountProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
