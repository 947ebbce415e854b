//! Session token encoding and signature checks
//!
//! A session token is `<header>.<signature>`, where the header is the
//! base64url-encoded JSON object `{"session_id": "..."}` and the signature is
//! the base64url-encoded signature over the raw session id bytes. Only the id
//! is signed, so renewing a session never requires a new token, and every use
//! of a token re-reads the live session.

use std::sync::Arc;

use aliri::jwa;
use aliri_base64::Base64Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MintingError, MintingService, PublishedKeys, SessionId, SessionToken, SessionTokenRef, Status};

/// A session token failure
#[derive(Debug, Error)]
pub enum SessionTokenError {
    /// The token is malformed or its signature does not verify
    #[error("invalid session token")]
    InvalidToken,
    /// The token refers to a session that does not exist
    #[error("session token is invalid or refers to a session that no longer exists")]
    ExpiredOrInvalidSession,
    /// The token refers to a session past its expiry
    #[error("session token has expired")]
    ExpiredSession,
    /// The token could not be signed
    #[error("unable to sign session token")]
    Signing(#[from] MintingError),
}

impl From<SessionTokenError> for Status {
    fn from(err: SessionTokenError) -> Self {
        match err {
            SessionTokenError::InvalidToken => Self::unauthenticated("Invalid session token"),
            SessionTokenError::ExpiredOrInvalidSession => {
                Self::unauthenticated("Invalid session token or session has expired")
            }
            SessionTokenError::ExpiredSession => Self::unauthenticated("Expired session token"),
            SessionTokenError::Signing(source) => {
                let error: &dyn std::error::Error = &source;
                tracing::error!(error, "unable to sign session token");
                Self::unavailable("Unable to sign session token")
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Header<'a> {
    #[serde(borrow)]
    session_id: std::borrow::Cow<'a, str>,
}

/// A session token split into its parts but not yet verified
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnverifiedSessionToken {
    session_id: SessionId,
    signature: Vec<u8>,
}

impl UnverifiedSessionToken {
    /// Splits and decodes a raw session token
    ///
    /// # Errors
    ///
    /// Fails with [`SessionTokenError::InvalidToken`] unless the token is
    /// exactly two valid base64url segments separated by a single `.`, the
    /// first decoding to a session header.
    pub fn parse(raw: &SessionTokenRef) -> Result<Self, SessionTokenError> {
        let (header, signature) = raw
            .as_str()
            .split_once('.')
            .ok_or(SessionTokenError::InvalidToken)?;

        if header.is_empty() || signature.is_empty() || signature.contains('.') {
            return Err(SessionTokenError::InvalidToken);
        }

        let header = Base64Url::from_encoded(header).map_err(|_| SessionTokenError::InvalidToken)?;
        let signature =
            Base64Url::from_encoded(signature).map_err(|_| SessionTokenError::InvalidToken)?;

        let header: Header =
            serde_json::from_slice(header.as_slice()).map_err(|_| SessionTokenError::InvalidToken)?;

        if header.session_id.is_empty() {
            return Err(SessionTokenError::InvalidToken);
        }

        Ok(Self {
            session_id: SessionId::new(header.session_id.as_ref().to_owned()),
            signature: signature.into_inner(),
        })
    }

    /// The session the token refers to
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The raw signature bytes
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

/// Signs and verifies session tokens
#[derive(Clone)]
pub struct SessionTokenCodec {
    signer: Arc<dyn MintingService>,
    keys: PublishedKeys,
    algorithm: jwa::Algorithm,
}

impl SessionTokenCodec {
    /// Constructs a codec which signs through the minting service and
    /// verifies against the published keys
    pub fn new(signer: Arc<dyn MintingService>, keys: PublishedKeys, algorithm: jwa::Algorithm) -> Self {
        Self {
            signer,
            keys,
            algorithm,
        }
    }

    /// The published verification keys
    pub fn keys(&self) -> &PublishedKeys {
        &self.keys
    }

    /// Produces the signed token for a session
    ///
    /// # Errors
    ///
    /// Fails if the minting service cannot sign.
    pub async fn marshal(&self, session_id: &SessionId) -> Result<SessionToken, SessionTokenError> {
        let header = serde_json::to_vec(&Header {
            session_id: session_id.as_str().into(),
        })
        .map_err(|_| SessionTokenError::InvalidToken)?;

        let signature = self.signer.sign_blob(session_id.as_str().as_bytes()).await?;

        Ok(SessionToken::from(format!(
            "{}.{}",
            Base64Url::from_raw(header),
            Base64Url::from_raw(signature)
        )))
    }

    /// Checks the token's signature against the published keys
    ///
    /// # Errors
    ///
    /// Fails with [`SessionTokenError::InvalidToken`] if no published key
    /// verifies the signature.
    pub fn verify_signature(&self, token: &UnverifiedSessionToken) -> Result<(), SessionTokenError> {
        if self.keys.verify(
            self.algorithm,
            token.session_id.as_str().as_bytes(),
            &token.signature,
        ) {
            Ok(())
        } else {
            Err(SessionTokenError::InvalidToken)
        }
    }
}

impl std::fmt::Debug for SessionTokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SessionTokenCodec")
            .field("keys", &self.keys)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;
    use crate::test::FakeMinting;

    fn codec() -> (Arc<FakeMinting>, SessionTokenCodec) {
        let minting = Arc::new(FakeMinting::new());
        let codec = SessionTokenCodec::new(minting.clone(), minting.published_keys(), jwa::Algorithm::HS256);
        (minting, codec)
    }

    #[tokio::test]
    async fn marshal_then_parse_recovers_the_id() -> Result<()> {
        let (_, codec) = codec();
        let id = SessionId::new("0123456789abcdef".to_string());

        let token = codec.marshal(&id).await?;
        let parsed = UnverifiedSessionToken::parse(&token)?;

        assert_eq!(parsed.session_id(), &id);
        codec.verify_signature(&parsed)?;
        Ok(())
    }

    #[tokio::test]
    async fn token_has_the_documented_shape() -> Result<()> {
        let (_, codec) = codec();
        let token = codec.marshal(&SessionId::new("abc".to_string())).await?;

        let (header, _) = token.as_str().split_once('.').unwrap_or_default();
        let header = Base64Url::from_encoded(header)?;
        assert_eq!(header.as_slice(), br#"{"session_id":"abc"}"#);
        assert_eq!(token.as_str().matches('.').count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn tampered_id_fails_verification() -> Result<()> {
        let (_, codec) = codec();
        let token = codec.marshal(&SessionId::new("victim".to_string())).await?;
        let (_, signature) = token.as_str().split_once('.').unwrap_or_default();

        let forged_header = Base64Url::from_raw(br#"{"session_id":"attacker"}"#.to_vec());
        let forged = SessionToken::from(format!("{forged_header}.{signature}"));
        let parsed = UnverifiedSessionToken::parse(&forged)?;

        assert!(matches!(
            codec.verify_signature(&parsed),
            Err(SessionTokenError::InvalidToken)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn signatures_from_unpublished_keys_fail() -> Result<()> {
        let (_, codec) = codec();
        let other = FakeMinting::with_secret(b"some other key");
        let other_codec =
            SessionTokenCodec::new(Arc::new(other), codec.keys().clone(), jwa::Algorithm::HS256);

        let token = other_codec.marshal(&SessionId::new("abc".to_string())).await?;
        let parsed = UnverifiedSessionToken::parse(&token)?;
        assert!(codec.verify_signature(&parsed).is_err());
        Ok(())
    }

    #[test]
    fn malformed_tokens_are_invalid() {
        let header = Base64Url::from_raw(br#"{"session_id":"abc"}"#.to_vec()).to_string();
        let not_json = Base64Url::from_raw(b"nope".to_vec()).to_string();

        for raw in [
            String::new(),
            "no-separator".to_owned(),
            format!("{header}."),
            format!(".{header}"),
            format!("{header}.c2ln.c2ln"),
            format!("{header}.!!!"),
            format!("{not_json}.c2ln"),
            format!("{}.c2ln", Base64Url::from_raw(br#"{"session_id":""}"#.to_vec())),
        ] {
            let token = SessionToken::from(raw.clone());
            assert!(
                matches!(
                    UnverifiedSessionToken::parse(&token),
                    Err(SessionTokenError::InvalidToken)
                ),
                "{raw:?} should be rejected"
            );
        }
    }
}
