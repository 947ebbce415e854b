//! Credential provider strategies
//!
//! A provider turns an identity, a set of scopes and an optional target into
//! a fresh access token. Which provider a broker uses is chosen once, from
//! configuration, when the broker is built.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    config::{ProviderSelection, ShadowConfig, UserProviderSelection},
    IdentityRef, IssuedAccessToken, MintingError, MintingService, Persistence, PersistenceError,
    Scopes, Status,
};

mod direct;
mod domain;
mod hybrid;
mod impersonation;
mod shadow;

pub use direct::DirectDelegationProvider;
pub use domain::DomainDelegationProvider;
pub use hybrid::HybridProvider;
pub use impersonation::ImpersonationProvider;
pub use shadow::ShadowAccountProvider;

/// A provider failure
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The identity is not authorized to obtain the requested token
    #[error("{0}")]
    Denied(String),
    /// The request cannot be served by this provider
    #[error("{0}")]
    IllegalArgument(String),
    /// The minting service failed
    #[error("minting service failure")]
    Minting(#[from] MintingError),
    /// Stored credentials could not be read
    #[error("unable to read stored credentials")]
    Persistence(#[from] PersistenceError),
}

impl From<ProviderError> for Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Denied(message) => Self::permission_denied(message),
            ProviderError::IllegalArgument(message) => Self::invalid_argument(message),
            ProviderError::Minting(MintingError::Forbidden(message)) => {
                Self::permission_denied(message)
            }
            ProviderError::Minting(MintingError::Rejected(message)) => {
                Self::invalid_argument(message)
            }
            ProviderError::Minting(err @ MintingError::Unavailable(_)) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, "minting service unavailable");
                Self::unavailable("Credential minting service unavailable")
            }
            ProviderError::Persistence(err) => err.into(),
        }
    }
}

/// Produces access tokens for identities
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Issues a fresh access token
    ///
    /// `target` is empty when the token need not be restricted to a resource.
    async fn access_token(
        &self,
        identity: &IdentityRef,
        scopes: &Scopes,
        target: &str,
    ) -> Result<IssuedAccessToken, ProviderError>;
}

const SERVICE_ACCOUNT_DOMAIN: &str = ".iam.gserviceaccount.com";

/// Whether the identity names a service account
///
/// Service accounts look like `name@project.iam.gserviceaccount.com`, where
/// both `name` and `project` are 6 to 30 lowercase letters, digits or
/// hyphens, starting with a letter and not ending with a hyphen.
pub fn is_service_account(identity: &str) -> bool {
    fn valid_label(label: &str) -> bool {
        let bytes = label.as_bytes();
        (6..=30).contains(&bytes.len())
            && bytes[0].is_ascii_lowercase()
            && bytes[bytes.len() - 1] != b'-'
            && bytes
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
    }

    match identity.split_once('@') {
        Some((name, domain)) => domain
            .strip_suffix(SERVICE_ACCOUNT_DOMAIN)
            .map_or(false, |project| valid_label(name) && valid_label(project)),
        None => false,
    }
}

/// Builds the configured provider
pub fn build_provider(
    selection: &ProviderSelection,
    shadow: &ShadowConfig,
    minting: Arc<dyn MintingService>,
    persistence: Arc<dyn Persistence>,
) -> Arc<dyn CredentialProvider> {
    match selection {
        ProviderSelection::DirectDelegation => {
            Arc::new(DirectDelegationProvider::new(persistence, minting))
        }
        ProviderSelection::DomainDelegation => Arc::new(DomainDelegationProvider::new(minting)),
        ProviderSelection::Impersonation => Arc::new(ImpersonationProvider::new(minting)),
        ProviderSelection::Shadow => Arc::new(ShadowAccountProvider::new(shadow.clone(), minting)),
        ProviderSelection::Hybrid { user_provider } => {
            let user: Arc<dyn CredentialProvider> = match user_provider {
                UserProviderSelection::DirectDelegation => Arc::new(
                    DirectDelegationProvider::new(persistence, Arc::clone(&minting)),
                ),
                UserProviderSelection::DomainDelegation => {
                    Arc::new(DomainDelegationProvider::new(Arc::clone(&minting)))
                }
                UserProviderSelection::Shadow => Arc::new(ShadowAccountProvider::new(
                    shadow.clone(),
                    Arc::clone(&minting),
                )),
            };
            Arc::new(HybridProvider::new(ImpersonationProvider::new(minting), user))
        }
    }
}
