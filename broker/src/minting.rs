//! The credential minting service boundary
//!
//! The minting service is the cloud provider's IAM and STS surface. It issues
//! access tokens from stored credentials, domain-wide delegation assertions or
//! service account impersonation; it downscopes tokens; it signs blobs with
//! the broker's own service account; and it revokes stored credentials.

use std::error::Error as StdError;

use async_trait::async_trait;
use thiserror::Error;

use crate::{IdentityRef, IssuedAccessToken, Scopes, StoredCredential};

/// A failure reported by the minting service
#[derive(Debug, Error)]
pub enum MintingError {
    /// The service refused the request for lack of permission
    #[error("minting service denied the request: {0}")]
    Forbidden(String),
    /// The service rejected the request as malformed
    #[error("minting service rejected the request: {0}")]
    Rejected(String),
    /// The service could not be reached
    #[error("minting service unavailable")]
    Unavailable(#[source] Box<dyn StdError + Send + Sync + 'static>),
}

/// Restricts a token to a single resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessBoundary {
    resource: String,
    permissions: Vec<String>,
}

impl AccessBoundary {
    /// Derives a boundary from a request target
    ///
    /// A `gs://bucket/path` target restricts the token to the whole bucket;
    /// any other target is used as the resource name verbatim.
    pub fn for_target(target: &str, permissions: &[String]) -> Self {
        let resource = match target.strip_prefix("gs://") {
            Some(rest) => {
                let bucket = rest.split('/').next().unwrap_or(rest);
                format!("//storage.googleapis.com/projects/_/buckets/{bucket}")
            }
            None => target.to_owned(),
        };

        Self {
            resource,
            permissions: permissions.to_vec(),
        }
    }

    /// The full resource name the token is limited to
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The permissions available on the resource
    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }
}

/// Issues, restricts and revokes credentials
#[async_trait]
pub trait MintingService: Send + Sync {
    /// Exchanges a stored long-lived credential for an access token
    async fn exchange_stored_credential(
        &self,
        credential: &StoredCredential,
        scopes: &Scopes,
    ) -> Result<IssuedAccessToken, MintingError>;

    /// Trades a server-signed assertion with `subject` for an access token
    async fn delegate_domain(
        &self,
        subject: &IdentityRef,
        scopes: &Scopes,
    ) -> Result<IssuedAccessToken, MintingError>;

    /// Issues an access token for a service account
    async fn impersonate(
        &self,
        service_account: &IdentityRef,
        scopes: &Scopes,
    ) -> Result<IssuedAccessToken, MintingError>;

    /// Restricts an access token with an access boundary
    async fn downscope(
        &self,
        token: &IssuedAccessToken,
        boundary: &AccessBoundary,
    ) -> Result<IssuedAccessToken, MintingError>;

    /// Signs `data` with the broker's own key
    async fn sign_blob(&self, data: &[u8]) -> Result<Vec<u8>, MintingError>;

    /// Invalidates a stored credential at its issuer
    async fn revoke(&self, credential: &StoredCredential) -> Result<(), MintingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_targets_cover_the_whole_bucket() {
        let perms = vec!["inRole:roles/storage.objectViewer".to_owned()];
        let boundary = AccessBoundary::for_target("gs://example/some/path", &perms);
        assert_eq!(
            boundary.resource(),
            "//storage.googleapis.com/projects/_/buckets/example"
        );
        assert_eq!(boundary.permissions(), &perms[..]);
    }

    #[test]
    fn other_targets_are_verbatim() {
        let boundary = AccessBoundary::for_target("//bigquery.googleapis.com/projects/p", &[]);
        assert_eq!(boundary.resource(), "//bigquery.googleapis.com/projects/p");
    }
}
