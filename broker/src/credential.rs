use std::time::Duration;

use broker_clock::UnixTime;
use serde::{Deserialize, Serialize};

use crate::{persistence::Record, AccessToken, EncryptedCredential, Identity};

/// A long-lived credential obtained through a one-time consent flow
///
/// Stored under the owner's identity and exchanged for access tokens by the
/// direct delegation provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    id: Identity,
    value: EncryptedCredential,
    creation_time: UnixTime,
}

impl StoredCredential {
    /// Constructs a stored credential for `id`
    pub fn new(id: Identity, value: EncryptedCredential, creation_time: UnixTime) -> Self {
        Self {
            id,
            value,
            creation_time,
        }
    }

    /// The identity that granted the credential
    pub fn id(&self) -> &Identity {
        &self.id
    }

    /// The encrypted credential value
    pub fn value(&self) -> &EncryptedCredential {
        &self.value
    }

    /// When consent was granted
    pub fn creation_time(&self) -> UnixTime {
        self.creation_time
    }
}

impl Record for StoredCredential {
    const KIND: &'static str = "stored_credential";

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

/// An access token along with its expiry
///
/// Never persisted; only cached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedAccessToken {
    access_token: AccessToken,
    expires_at: UnixTime,
}

impl IssuedAccessToken {
    /// Pairs a token with its expiry
    pub fn new(access_token: AccessToken, expires_at: UnixTime) -> Self {
        Self {
            access_token,
            expires_at,
        }
    }

    /// The bearer credential
    #[inline]
    pub fn access_token(&self) -> &AccessToken {
        &self.access_token
    }

    /// When the token stops being accepted
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// How much longer the token is valid as of `now`
    #[inline]
    pub fn until_expired_at(&self, now: UnixTime) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
