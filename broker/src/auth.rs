//! Caller authentication
//!
//! Callers present either a credential understood by the configured
//! authenticator or, for delegated authentication, a session token with the
//! `BrokerSession` scheme.

use async_trait::async_trait;

use crate::{Identity, SessionToken, Status};

const SESSION_SCHEME: &str = "BrokerSession";

/// Establishes a caller's identity from a presented credential
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticates the credential, returning the caller's principal
    ///
    /// # Errors
    ///
    /// Fails with `Unauthenticated` if the credential is not accepted.
    async fn authenticate(&self, credential: &str) -> Result<Identity, Status>;
}

/// A credential as presented in a request's authorization field
#[derive(Debug, PartialEq, Eq)]
pub enum Credential<'a> {
    /// A session token for delegated authentication
    Session(SessionToken),
    /// Anything else, to be handed to the authenticator
    Authenticator(&'a str),
}

impl<'a> Credential<'a> {
    /// Splits the session scheme off an authorization value
    ///
    /// The scheme is matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Fails with `Unauthenticated` if no credential is present at all.
    pub fn parse(authorization: &'a str) -> Result<Self, Status> {
        let authorization = authorization.trim();
        if authorization.is_empty() {
            return Err(Status::unauthenticated("Missing credentials"));
        }

        match authorization.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case(SESSION_SCHEME) => {
                Ok(Self::Session(SessionToken::new(token.trim_start().to_owned())))
            }
            _ => Ok(Self::Authenticator(authorization)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[test]
    fn session_scheme_is_recognized() -> Result<(), Status> {
        assert_eq!(
            Credential::parse("BrokerSession abc.def")?,
            Credential::Session(SessionToken::new("abc.def".to_string()))
        );
        assert_eq!(
            Credential::parse("brokersession  abc.def")?,
            Credential::Session(SessionToken::new("abc.def".to_string()))
        );
        Ok(())
    }

    #[test]
    fn other_schemes_go_to_the_authenticator() -> Result<(), Status> {
        assert_eq!(
            Credential::parse("Negotiate YIIC...")?,
            Credential::Authenticator("Negotiate YIIC...")
        );
        assert_eq!(
            Credential::parse("BrokerSessionX abc")?,
            Credential::Authenticator("BrokerSessionX abc")
        );
        Ok(())
    }

    #[test]
    fn missing_credentials() {
        let err = Credential::parse("  ").unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }
}
