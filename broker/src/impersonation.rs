//! Proxy user policy
//!
//! A caller may obtain credentials on behalf of another identity only if a
//! proxy rule names the caller and allows the impersonated identity, either
//! explicitly or through membership in a directory group.

use std::{error::Error as StdError, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{config::ProxyRule, Identity, IdentityRef, Status, UserMapper};

const WILDCARD: &str = "*";

/// A directory lookup failure
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The group could not be resolved; other groups may still be checked
    #[error("unable to look up group `{group}`")]
    Lookup {
        /// The group being resolved
        group: String,
        /// The underlying failure
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
    /// The directory itself could not be reached
    #[error("directory unavailable")]
    Io(#[source] Box<dyn StdError + Send + Sync + 'static>),
}

/// Resolves group membership
#[async_trait]
pub trait Directory: Send + Sync {
    /// Whether `identity` belongs to `group`
    async fn is_member(&self, group: &str, identity: &IdentityRef) -> Result<bool, DirectoryError>;
}

/// Enforces the proxy user policy
pub struct ImpersonationValidator {
    rules: Vec<ProxyRule>,
    mapper: UserMapper,
    directory: Arc<dyn Directory>,
}

impl ImpersonationValidator {
    /// Constructs a validator over the configured proxy rules
    pub fn new(rules: Vec<ProxyRule>, mapper: UserMapper, directory: Arc<dyn Directory>) -> Self {
        Self {
            rules,
            mapper,
            directory,
        }
    }

    /// Checks that `impersonator` may act as `impersonated`
    ///
    /// On success, returns the normalized impersonated identity.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if `impersonated` cannot be mapped to an
    /// identity, `PermissionDenied` if no rule allows the impersonation, or
    /// `Unavailable` if the directory cannot be reached.
    #[tracing::instrument(skip(self))]
    pub async fn validate(
        &self,
        impersonator: &IdentityRef,
        impersonated: &str,
    ) -> Result<Identity, Status> {
        let impersonated = self.mapper.map(impersonated)?;

        for rule in self
            .rules
            .iter()
            .filter(|rule| rule.proxy == WILDCARD || rule.proxy == impersonator.as_str())
        {
            if rule
                .users
                .iter()
                .any(|user| user == WILDCARD || user == impersonated.as_str())
            {
                tracing::debug!(proxy = %rule.proxy, "impersonation allowed by user list");
                return Ok(impersonated);
            }

            if rule.groups.iter().any(|group| group == WILDCARD) {
                tracing::debug!(proxy = %rule.proxy, "impersonation allowed by group wildcard");
                return Ok(impersonated);
            }

            for group in &rule.groups {
                match self.directory.is_member(group, &impersonated).await {
                    Ok(true) => {
                        tracing::debug!(proxy = %rule.proxy, group, "impersonation allowed by group");
                        return Ok(impersonated);
                    }
                    Ok(false) => {}
                    Err(err @ DirectoryError::Lookup { .. }) => {
                        let error: &dyn StdError = &err;
                        tracing::warn!(error, group, "group lookup failed; skipping group");
                    }
                    Err(err @ DirectoryError::Io(_)) => {
                        let error: &dyn StdError = &err;
                        tracing::error!(error, "directory unavailable");
                        return Err(Status::unavailable("Directory unavailable"));
                    }
                }
            }
        }

        Err(Status::permission_denied(format!(
            "Impersonation disallowed for `{impersonator}`"
        )))
    }
}

impl std::fmt::Debug for ImpersonationValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ImpersonationValidator")
            .field("rules", &self.rules)
            .field("mapper", &self.mapper)
            .finish_non_exhaustive()
    }
}
