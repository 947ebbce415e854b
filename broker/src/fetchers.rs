//! The two cache-aside fetches the handlers perform

use std::time::Duration;

use aliri_base64::Base64Url;
use async_trait::async_trait;
use broker_cache::Fetch;
use broker_clock::Clock;
use ring::digest;

use crate::{
    config::{AccessTokenConfig, SessionConfig},
    token::SessionTokenError,
    CredentialProvider, IdentityRef, IssuedAccessToken, Persistence, Scopes, Session,
    SessionIdRef, Status,
};

/// The cache key for an access token
///
/// A SHA-256 fingerprint over the length-prefixed identity, scopes and
/// target, so no choice of values can make two requests collide.
pub fn access_token_cache_key(identity: &IdentityRef, scopes: &Scopes, target: &str) -> String {
    fn field(ctx: &mut digest::Context, value: &[u8]) {
        ctx.update(&(value.len() as u64).to_be_bytes());
        ctx.update(value);
    }

    let mut ctx = digest::Context::new(&digest::SHA256);
    field(&mut ctx, identity.as_str().as_bytes());
    ctx.update(&(scopes.len() as u64).to_be_bytes());
    for scope in scopes.iter() {
        field(&mut ctx, scope.as_str().as_bytes());
    }
    field(&mut ctx, target.as_bytes());

    format!(
        "access-token:{}",
        Base64Url::from_raw(ctx.finish().as_ref().to_vec())
    )
}

/// The cache key for a session
pub fn session_cache_key(id: &SessionIdRef) -> String {
    format!("session:{id}")
}

/// Issues an access token through the configured provider
///
/// TTLs are measured against the clock when the value is stored, which may
/// be well after the fetch began if it waited on the lock.
pub struct AccessTokenFetch<'a, C> {
    pub(crate) provider: &'a dyn CredentialProvider,
    pub(crate) identity: &'a IdentityRef,
    pub(crate) scopes: &'a Scopes,
    pub(crate) target: &'a str,
    pub(crate) config: &'a AccessTokenConfig,
    pub(crate) clock: &'a C,
}

#[async_trait]
impl<C: Clock + Send + Sync> Fetch for AccessTokenFetch<'_, C> {
    type Value = IssuedAccessToken;
    type Error = Status;

    fn cache_key(&self) -> String {
        access_token_cache_key(self.identity, self.scopes, self.target)
    }

    fn local_ttl(&self, value: &IssuedAccessToken) -> Duration {
        self.config
            .local_cache_ttl()
            .min(value.until_expired_at(self.clock.now()))
    }

    fn remote_ttl(&self, value: &IssuedAccessToken) -> Duration {
        self.config
            .remote_cache_ttl()
            .min(value.until_expired_at(self.clock.now()))
    }

    async fn compute(&self) -> Result<IssuedAccessToken, Status> {
        tracing::debug!(identity = %self.identity, "issuing access token");
        Ok(self
            .provider
            .access_token(self.identity, self.scopes, self.target)
            .await?)
    }
}

impl<C> std::fmt::Debug for AccessTokenFetch<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AccessTokenFetch")
            .field("identity", &self.identity)
            .field("scopes", &self.scopes)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Reads a session from persistence
pub struct SessionFetch<'a> {
    pub(crate) persistence: &'a dyn Persistence,
    pub(crate) id: &'a SessionIdRef,
    pub(crate) config: &'a SessionConfig,
}

#[async_trait]
impl Fetch for SessionFetch<'_> {
    type Value = Session;
    type Error = Status;

    fn cache_key(&self) -> String {
        session_cache_key(self.id)
    }

    fn local_ttl(&self, _: &Session) -> Duration {
        self.config.local_cache_ttl()
    }

    fn remote_ttl(&self, _: &Session) -> Duration {
        self.config.remote_cache_ttl()
    }

    async fn compute(&self) -> Result<Session, Status> {
        self.persistence
            .load::<Session>(self.id.as_str())
            .await?
            .ok_or_else(|| SessionTokenError::ExpiredOrInvalidSession.into())
    }
}

impl std::fmt::Debug for SessionFetch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SessionFetch")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use broker_cache::{CacheAside, DistributedLock, InMemoryRemoteCache, LocalCache, LockConfig};
    use broker_clock::{TestClock, UnixTime};
    use color_eyre::Result;

    use super::*;
    use crate::{
        providers::DomainDelegationProvider, test::FakeMinting, Code, Identity,
        InMemoryPersistence, SessionId,
    };

    fn cache(clock: &TestClock) -> CacheAside<TestClock> {
        let remote = Arc::new(InMemoryRemoteCache::with_clock(clock.clone()));
        CacheAside::new(
            Arc::new(LocalCache::with_clock(clock.clone())),
            remote.clone(),
            DistributedLock::with_clock(remote, LockConfig::default(), clock.clone()),
        )
    }

    #[test]
    fn access_token_keys_do_not_collide_across_fields() -> Result<()> {
        let scopes = Scopes::parse(["b"])?;
        let a = access_token_cache_key(&Identity::new("a".to_string()), &scopes, "");
        let b = access_token_cache_key(&Identity::new("ab".to_string()), &Scopes::empty(), "");
        let c = access_token_cache_key(&Identity::new("a".to_string()), &Scopes::empty(), "b");

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert!(a.starts_with("access-token:"));
        assert_eq!(a, access_token_cache_key(&Identity::new("a".to_string()), &scopes, ""));
        Ok(())
    }

    #[test]
    fn access_token_keys_ignore_scope_order() -> Result<()> {
        let alice = Identity::new("alice@example.com".to_string());
        assert_eq!(
            access_token_cache_key(&alice, &Scopes::parse(["x", "y"])?, "t"),
            access_token_cache_key(&alice, &Scopes::parse(["y", "x"])?, "t"),
        );
        Ok(())
    }

    #[tokio::test]
    async fn token_ttls_never_outlive_the_token() -> Result<()> {
        let clock = TestClock::new(UnixTime(1_000_000));
        let minting = Arc::new(FakeMinting::with_clock(clock.clone()));
        minting.set_token_lifetime(Duration::from_secs(10));
        let provider = DomainDelegationProvider::new(minting);
        let config = AccessTokenConfig::default();
        let scopes = Scopes::parse(["s"])?;
        let alice = Identity::new("alice@example.com".to_string());

        let fetch = AccessTokenFetch {
            provider: &provider,
            identity: &alice,
            scopes: &scopes,
            target: "",
            config: &config,
            clock: &clock,
        };
        let token = cache(&clock).fetch(&fetch).await?;

        assert_eq!(fetch.local_ttl(&token), Duration::from_secs(10));
        assert_eq!(fetch.remote_ttl(&token), Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn token_ttls_follow_the_clock_while_waiting() -> Result<()> {
        let clock = TestClock::new(UnixTime(1_000_000));
        let minting = Arc::new(FakeMinting::with_clock(clock.clone()));
        minting.set_token_lifetime(Duration::from_secs(10));
        let provider = DomainDelegationProvider::new(minting);
        let config = AccessTokenConfig::default();
        let scopes = Scopes::parse(["s"])?;
        let alice = Identity::new("alice@example.com".to_string());

        let fetch = AccessTokenFetch {
            provider: &provider,
            identity: &alice,
            scopes: &scopes,
            target: "",
            config: &config,
            clock: &clock,
        };
        let token = fetch.compute().await?;

        clock.advance(Duration::from_secs(7));
        assert_eq!(fetch.local_ttl(&token), Duration::from_secs(3));
        assert_eq!(fetch.remote_ttl(&token), Duration::from_secs(3));

        clock.advance(Duration::from_secs(5));
        assert_eq!(fetch.local_ttl(&token), Duration::ZERO);
        assert_eq!(fetch.remote_ttl(&token), Duration::ZERO);
        Ok(())
    }

    #[tokio::test]
    async fn missing_sessions_are_not_cached() -> Result<()> {
        let clock = TestClock::new(UnixTime(0));
        let cache = cache(&clock);
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let config = SessionConfig::default();
        let id = SessionId::new("absent".to_string());

        let fetch = SessionFetch {
            persistence: &*persistence,
            id: &id,
            config: &config,
        };
        let err = cache.fetch(&fetch).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert!(cache.local().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn sessions_are_served_from_cache() -> Result<()> {
        let clock = TestClock::new(UnixTime(0));
        let cache = cache(&clock);
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let config = SessionConfig::default();
        let session = Session::create(
            Identity::new("alice@example.com".to_string()),
            Identity::new("yarn@FOO.BAR".to_string()),
            "",
            Scopes::parse(["s"])?,
            UnixTime(0),
            &config.lifetime(),
        );
        persistence.store(&session).await?;

        let fetch = SessionFetch {
            persistence: &*persistence,
            id: session.id(),
            config: &config,
        };
        assert_eq!(cache.fetch(&fetch).await?, session);

        persistence.remove::<Session>(session.id().as_str()).await?;
        assert_eq!(cache.fetch(&fetch).await?, session);

        cache.invalidate(&session_cache_key(session.id())).await?;
        assert!(cache.fetch(&fetch).await.is_err());
        Ok(())
    }
}
