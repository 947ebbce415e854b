//! Sessions and their bounded lifetimes

use std::time::Duration;

use broker_clock::UnixTime;
use serde::{Deserialize, Serialize};

use crate::{persistence::Record, Identity, IdentityRef, Scopes, SessionId, Status};

/// How long sessions live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionLifetime {
    renew_period: Duration,
    max_lifetime: Duration,
}

impl SessionLifetime {
    /// Each renewal extends a session by `renew_period`, but never past
    /// `max_lifetime` after its creation
    pub fn new(renew_period: Duration, max_lifetime: Duration) -> Self {
        Self {
            renew_period,
            max_lifetime,
        }
    }

    /// The extension granted by a renewal
    pub fn renew_period(&self) -> Duration {
        self.renew_period
    }

    /// The hard bound on a session's lifetime
    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }
}

/// A server-side record allowing a renewer to obtain access tokens on behalf
/// of an owner for a bounded period of time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    owner: Identity,
    renewer: Identity,
    #[serde(default)]
    target: String,
    scopes: Scopes,
    creation_time: UnixTime,
    expires_at: UnixTime,
}

impl Session {
    /// Creates a new session at `now` with a fresh random identifier
    pub fn create(
        owner: Identity,
        renewer: Identity,
        target: impl Into<String>,
        scopes: Scopes,
        now: UnixTime,
        lifetime: &SessionLifetime,
    ) -> Self {
        let id = SessionId::from(uuid::Uuid::new_v4().simple().to_string());
        let mut session = Self {
            id,
            owner,
            renewer,
            target: target.into(),
            scopes,
            creation_time: now,
            expires_at: now,
        };
        session.extend_lifetime(now, lifetime);
        session
    }

    /// The session identifier
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The identity on whose behalf tokens are issued
    pub fn owner(&self) -> &IdentityRef {
        &self.owner
    }

    /// The identity allowed to renew and cancel the session
    pub fn renewer(&self) -> &IdentityRef {
        &self.renewer
    }

    /// The resource issued tokens are restricted to, or empty
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The scopes issued tokens carry
    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    /// When the session was created
    pub fn creation_time(&self) -> UnixTime {
        self.creation_time
    }

    /// When the session stops being usable unless renewed
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// The latest time the session may ever be extended to
    pub fn lifetime_cap(&self, lifetime: &SessionLifetime) -> UnixTime {
        self.creation_time + lifetime.max_lifetime
    }

    /// Whether the session has expired as of `now`
    pub fn is_expired_at(&self, now: UnixTime) -> bool {
        self.expires_at <= now
    }

    /// Extends the session by one renew period from `now`, capped by the
    /// maximum lifetime
    ///
    /// The expiry never moves backwards, so repeated or out-of-order
    /// renewals converge on the same result.
    pub fn extend_lifetime(&mut self, now: UnixTime, lifetime: &SessionLifetime) -> UnixTime {
        let candidate = std::cmp::min(now + lifetime.renew_period, self.lifetime_cap(lifetime));
        self.expires_at = std::cmp::max(self.expires_at, candidate);
        self.expires_at
    }

    /// Checks that `caller` may renew or cancel this session
    ///
    /// # Errors
    ///
    /// Fails with `PermissionDenied` for any caller other than the renewer.
    pub fn authorize_renewer(&self, caller: &IdentityRef) -> Result<(), Status> {
        if caller == &*self.renewer {
            Ok(())
        } else {
            Err(Status::permission_denied(format!(
                "Unauthorized renewer: {caller}"
            )))
        }
    }
}

impl Record for Session {
    const KIND: &'static str = "session";

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;
    use crate::Code;

    const T: UnixTime = UnixTime(1_600_000_000_000);

    fn lifetime() -> SessionLifetime {
        SessionLifetime::new(Duration::from_secs(24 * 3600), Duration::from_secs(7 * 24 * 3600))
    }

    fn scenario_session(now: UnixTime, lifetime: &SessionLifetime) -> Result<Session> {
        Ok(Session::create(
            Identity::new("alice@EXAMPLE.COM".to_string()),
            Identity::new("yarn@FOO.BAR".to_string()),
            "gs://example",
            Scopes::parse(["https://www.googleapis.com/auth/devstorage.read_write"])?,
            now,
            lifetime,
        ))
    }

    #[test]
    fn creation_applies_one_renew_period() -> Result<()> {
        let lifetime = lifetime();
        let session = scenario_session(T, &lifetime)?;

        assert_eq!(session.creation_time(), T);
        assert_eq!(session.expires_at(), T + lifetime.renew_period());
        assert!(!session.id().as_str().is_empty());
        Ok(())
    }

    #[test]
    fn creation_is_capped_when_max_lifetime_is_shorter() -> Result<()> {
        let lifetime = SessionLifetime::new(Duration::from_secs(3600), Duration::from_secs(600));
        let session = scenario_session(T, &lifetime)?;

        assert_eq!(session.expires_at(), T + Duration::from_secs(600));
        Ok(())
    }

    #[test]
    fn renewal_extends_then_caps() -> Result<()> {
        let lifetime = lifetime();
        let mut session = scenario_session(T, &lifetime)?;

        let renewed = session.extend_lifetime(T + Duration::from_millis(5000), &lifetime);
        assert_eq!(
            renewed,
            T + Duration::from_millis(5000) + lifetime.renew_period()
        );

        let late = T + lifetime.max_lifetime() - Duration::from_millis(5000);
        let capped = session.extend_lifetime(late, &lifetime);
        assert_eq!(capped, T + lifetime.max_lifetime());
        Ok(())
    }

    #[test]
    fn renewal_never_moves_expiry_backwards() -> Result<()> {
        let lifetime = lifetime();
        let mut session = scenario_session(T, &lifetime)?;
        let cap = session.lifetime_cap(&lifetime);

        let mut previous = session.expires_at();
        for offset_secs in [7200, 3600, 0, 86_400 * 3, 86_400, 86_400 * 10, 60] {
            let now = T + Duration::from_secs(offset_secs);
            let next = session.extend_lifetime(now, &lifetime);
            assert!(next >= previous);
            assert!(next <= cap);
            previous = next;
        }
        assert_eq!(previous, cap);
        Ok(())
    }

    #[test]
    fn only_the_renewer_is_authorized() -> Result<()> {
        let session = scenario_session(T, &lifetime())?;

        assert!(session
            .authorize_renewer(&Identity::new("yarn@FOO.BAR".to_string()))
            .is_ok());

        let err = session
            .authorize_renewer(&Identity::new("alice@EXAMPLE.COM".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(err.message(), "Unauthorized renewer: alice@EXAMPLE.COM");
        Ok(())
    }

    #[test]
    fn expiry_is_inclusive() -> Result<()> {
        let lifetime = lifetime();
        let session = scenario_session(T, &lifetime)?;

        assert!(!session.is_expired_at(session.expires_at() - Duration::from_millis(1)));
        assert!(session.is_expired_at(session.expires_at()));
        Ok(())
    }
}
