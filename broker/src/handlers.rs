//! The broker's four request handlers
//!
//! A [`Broker`] is built once from a [`BrokerConfig`] and a set of injected
//! collaborators, and is then shared read-only between requests. Each
//! operation takes the caller's raw authorization value and a request, and
//! returns either a response or a [`Status`].

use std::sync::Arc;

use broker_cache::{
    CacheAside, DistributedLock, InMemoryRemoteCache, LocalCache, LockStore, RemoteCache,
};
use broker_clock::{Clock, System, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{
    auth::{Authenticator, Credential},
    config::{Backend, BrokerConfig, ConfigError, LockBackend},
    fetchers::{session_cache_key, AccessTokenFetch, SessionFetch},
    identity::Principal,
    impersonation::{Directory, ImpersonationValidator},
    providers::build_provider,
    sweep::Sweeper,
    token::{SessionTokenError, UnverifiedSessionToken},
    AccessToken, CredentialProvider, Identity, IdentityRef, InMemoryPersistence, KeyRefreshHandle,
    MintingService, Persistence, PersistenceLockStore, PublishedKeys, Scopes, ScopeWhitelist,
    Session, SessionLifetime, SessionToken, SessionTokenCodec, SessionTokenRef, Status,
    UserMapper,
};

/// Parameters for creating a session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetSessionTokenRequest {
    /// The identity tokens will be issued for
    pub owner: String,
    /// The identity allowed to renew and cancel the session
    pub renewer: String,
    /// The scopes issued tokens will carry
    pub scopes: Vec<String>,
    /// The resource issued tokens will be restricted to, if any
    pub target: String,
}

/// Parameters for issuing an access token
///
/// Under delegated authentication every field may be left empty, in which
/// case it is taken from the session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetAccessTokenRequest {
    /// The identity to issue a token for
    pub owner: String,
    /// The scopes the token carries
    pub scopes: Vec<String>,
    /// The resource the token is restricted to, if any
    pub target: String,
}

/// An issued access token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    /// The bearer credential
    pub access_token: AccessToken,
    /// When the token stops being accepted
    pub expires_at: UnixTime,
}

/// A request naming an existing session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokenRequest {
    /// The session's token
    pub session_token: SessionToken,
}

/// The collaborators a broker is built with
///
/// Backends that are supplied here are always used. Backends that are not
/// supplied fall back to the in-memory engines, unless the configuration
/// selects an external engine, in which case building fails.
pub struct Dependencies<C = System> {
    authenticator: Arc<dyn Authenticator>,
    minting: Arc<dyn MintingService>,
    directory: Arc<dyn Directory>,
    persistence: Option<Arc<dyn Persistence>>,
    remote_cache: Option<Arc<dyn RemoteCache>>,
    lock_store: Option<Arc<dyn LockStore>>,
    published_keys: Option<PublishedKeys>,
    clock: C,
}

impl Dependencies<System> {
    /// The required collaborators, using the system clock
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        minting: Arc<dyn MintingService>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self::with_clock(authenticator, minting, directory, System)
    }
}

impl<C> Dependencies<C> {
    /// The required collaborators, using a custom clock
    pub fn with_clock(
        authenticator: Arc<dyn Authenticator>,
        minting: Arc<dyn MintingService>,
        directory: Arc<dyn Directory>,
        clock: C,
    ) -> Self {
        Self {
            authenticator,
            minting,
            directory,
            persistence: None,
            remote_cache: None,
            lock_store: None,
            published_keys: None,
            clock,
        }
    }

    /// Uses the given persistence engine
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Uses the given remote cache
    #[must_use]
    pub fn with_remote_cache(mut self, remote_cache: Arc<dyn RemoteCache>) -> Self {
        self.remote_cache = Some(remote_cache);
        self
    }

    /// Uses the given lock store
    #[must_use]
    pub fn with_lock_store(mut self, lock_store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(lock_store);
        self
    }

    /// Verifies session tokens against the given keys
    #[must_use]
    pub fn with_published_keys(mut self, keys: PublishedKeys) -> Self {
        self.published_keys = Some(keys);
        self
    }
}

impl<C> std::fmt::Debug for Dependencies<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("persistence", &self.persistence.is_some())
            .field("remote_cache", &self.remote_cache.is_some())
            .field("lock_store", &self.lock_store.is_some())
            .field("published_keys", &self.published_keys)
            .finish_non_exhaustive()
    }
}

/// The credential broker's request-processing engine
pub struct Broker<C = System> {
    config: BrokerConfig,
    lifetime: SessionLifetime,
    whitelist: ScopeWhitelist,
    mapper: UserMapper,
    validator: ImpersonationValidator,
    provider: Arc<dyn CredentialProvider>,
    codec: SessionTokenCodec,
    authenticator: Arc<dyn Authenticator>,
    minting: Arc<dyn MintingService>,
    persistence: Arc<dyn Persistence>,
    local: Arc<LocalCache<C>>,
    remote: Arc<dyn RemoteCache>,
    cache: CacheAside<C>,
    clock: C,
}

impl<C> Broker<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Builds a broker
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, names an external backend that
    /// was not supplied, or the published key source cannot be set up.
    pub fn new(config: BrokerConfig, deps: Dependencies<C>) -> Result<Self, ConfigError> {
        config.validate()?;

        let persistence: Arc<dyn Persistence> =
            match (deps.persistence, config.backends.persistence) {
                (Some(persistence), _) => persistence,
                (None, Backend::InMemory) => Arc::new(InMemoryPersistence::new()),
                (None, Backend::External) => {
                    return Err(ConfigError::MissingBackend("persistence"))
                }
            };

        let in_memory_cache = match (&deps.remote_cache, config.backends.cache) {
            (None, Backend::InMemory) => {
                Some(Arc::new(InMemoryRemoteCache::with_clock(deps.clock.clone())))
            }
            (None, Backend::External) => return Err(ConfigError::MissingBackend("cache")),
            (Some(_), _) => None,
        };

        let remote_cache: Arc<dyn RemoteCache> = match (deps.remote_cache, &in_memory_cache) {
            (Some(remote), _) => remote,
            (None, Some(in_memory)) => in_memory.clone(),
            (None, None) => return Err(ConfigError::MissingBackend("cache")),
        };

        let lock_store: Arc<dyn LockStore> = match (deps.lock_store, config.backends.lock) {
            (Some(store), _) => store,
            (None, LockBackend::Persistence) => {
                Arc::new(PersistenceLockStore::new(Arc::clone(&persistence)))
            }
            (None, LockBackend::Cache) => match in_memory_cache {
                Some(in_memory) => in_memory,
                None => return Err(ConfigError::MissingBackend("lock")),
            },
        };

        let keys = match (deps.published_keys, &config.signing.jwks_url) {
            (Some(keys), _) => keys,
            (None, Some(url)) => published_keys_from(url)?,
            (None, None) => return Err(ConfigError::MissingBackend("signing.jwks_url")),
        };

        let mapper = UserMapper::new(&config.user_mapping)?;
        let local = Arc::new(LocalCache::with_clock(deps.clock.clone()));
        let lock = DistributedLock::with_clock(
            lock_store,
            config.lock.lock_config(),
            deps.clock.clone(),
        );

        Ok(Self {
            lifetime: config.session.lifetime(),
            whitelist: ScopeWhitelist::new(config.scopes_whitelist.clone()),
            validator: ImpersonationValidator::new(
                config.proxy_users.clone(),
                mapper.clone(),
                deps.directory,
            ),
            mapper,
            provider: build_provider(
                &config.provider,
                &config.shadow,
                Arc::clone(&deps.minting),
                Arc::clone(&persistence),
            ),
            codec: SessionTokenCodec::new(
                Arc::clone(&deps.minting),
                keys,
                config.signing.algorithm,
            ),
            authenticator: deps.authenticator,
            minting: deps.minting,
            cache: CacheAside::new(Arc::clone(&local), Arc::clone(&remote_cache), lock),
            local,
            remote: remote_cache,
            persistence,
            clock: deps.clock,
            config,
        })
    }

    /// The configuration the broker was built with
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The published keys session tokens are verified against
    pub fn published_keys(&self) -> &PublishedKeys {
        self.codec.keys()
    }

    /// Keeps the published keys current
    ///
    /// The keys are refreshed immediately and then every
    /// `signing.refresh_interval_ms`. Keys fetched from `signing.jwks_url`
    /// start out empty, so session tokens cannot be verified until the first
    /// refresh completes.
    pub fn spawn_key_refresh(&self) -> KeyRefreshHandle {
        self.published_keys()
            .spawn_refresh(self.config.signing.refresh_interval())
    }

    /// A sweeper over this broker's persistence and caches
    pub fn sweeper(&self) -> Sweeper<C> {
        Sweeper::new(
            Arc::clone(&self.persistence),
            Arc::clone(&self.minting),
            Arc::clone(&self.local),
            Arc::clone(&self.remote),
            self.config.sweep.clone(),
            self.clock.clone(),
        )
    }

    /// Creates a session and returns its token
    ///
    /// If the owner differs from the caller, the caller must be allowed to
    /// impersonate the owner.
    #[tracing::instrument(
        skip_all,
        fields(owner = %request.owner, renewer = %request.renewer, caller = tracing::field::Empty),
    )]
    pub async fn get_session_token(
        &self,
        authorization: &str,
        request: GetSessionTokenRequest,
    ) -> Result<SessionToken, Status> {
        require("owner", &request.owner)?;
        require("renewer", &request.renewer)?;
        Principal::parse(&request.renewer)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let scopes = self.whitelist.check(&request.scopes)?;

        let caller = self.authenticate(authorization, "GetSessionToken").await?;
        let owner = self.resolve_owner(&caller, &request.owner).await?;

        let session = Session::create(
            owner,
            Identity::from(request.renewer),
            request.target,
            scopes,
            self.clock.now(),
            &self.lifetime,
        );
        self.persistence.store(&session).await?;

        let token = self.codec.marshal(session.id()).await?;
        tracing::info!(
            session.id = %session.id(),
            session.expires_at = %session.expires_at(),
            "session created",
        );
        Ok(token)
    }

    /// Issues an access token
    ///
    /// With a `BrokerSession` credential the owner, scopes and target come
    /// from the session; any that the request also names must agree with it.
    /// Otherwise the caller authenticates directly and the request names the
    /// owner and scopes.
    #[tracing::instrument(
        skip_all,
        fields(owner = %request.owner, target = %request.target, caller = tracing::field::Empty),
    )]
    pub async fn get_access_token(
        &self,
        authorization: &str,
        request: GetAccessTokenRequest,
    ) -> Result<AccessTokenResponse, Status> {
        let (owner, scopes, target) = match Credential::parse(authorization)? {
            Credential::Session(token) => self.delegated_parameters(&token, request).await?,
            Credential::Authenticator(credential) => {
                require("owner", &request.owner)?;
                let scopes = self.whitelist.check(&request.scopes)?;

                let caller = self.authenticator.authenticate(credential).await?;
                tracing::Span::current().record("caller", caller.as_str());
                let owner = self.resolve_owner(&caller, &request.owner).await?;
                (owner, scopes, request.target)
            }
        };

        let token = self
            .cache
            .fetch(&AccessTokenFetch {
                provider: &*self.provider,
                identity: &owner,
                scopes: &scopes,
                target: &target,
                config: &self.config.access_tokens,
                clock: &self.clock,
            })
            .await?;

        Ok(AccessTokenResponse {
            access_token: token.access_token().clone(),
            expires_at: token.expires_at(),
        })
    }

    /// Extends a session's lifetime, returning its new expiry
    #[tracing::instrument(skip_all, fields(caller = tracing::field::Empty))]
    pub async fn renew_session_token(
        &self,
        authorization: &str,
        request: SessionTokenRequest,
    ) -> Result<UnixTime, Status> {
        let caller = self.authenticate(authorization, "RenewSessionToken").await?;
        let mut session = self
            .renewable_session(&caller, &request.session_token)
            .await?;

        let expires_at = session.extend_lifetime(self.clock.now(), &self.lifetime);
        self.persistence.store(&session).await?;
        self.evict_session(&session).await;

        tracing::info!(session.id = %session.id(), session.expires_at = %expires_at, "session renewed");
        Ok(expires_at)
    }

    /// Deletes a session
    #[tracing::instrument(skip_all, fields(caller = tracing::field::Empty))]
    pub async fn cancel_session_token(
        &self,
        authorization: &str,
        request: SessionTokenRequest,
    ) -> Result<(), Status> {
        let caller = self.authenticate(authorization, "CancelSessionToken").await?;
        let session = self
            .renewable_session(&caller, &request.session_token)
            .await?;

        self.persistence
            .remove::<Session>(session.id().as_str())
            .await?;
        self.evict_session(&session).await;

        tracing::info!(session.id = %session.id(), "session cancelled");
        Ok(())
    }

    async fn authenticate(
        &self,
        authorization: &str,
        operation: &'static str,
    ) -> Result<Identity, Status> {
        let caller = match Credential::parse(authorization)? {
            Credential::Authenticator(credential) => {
                self.authenticator.authenticate(credential).await?
            }
            Credential::Session(_) => {
                return Err(Status::unauthenticated(format!(
                    "Session tokens are not accepted by {operation}"
                )))
            }
        };

        tracing::Span::current().record("caller", caller.as_str());
        Ok(caller)
    }

    async fn resolve_owner(&self, caller: &IdentityRef, owner: &str) -> Result<Identity, Status> {
        if owner == caller.as_str() {
            self.mapper.map(owner)
        } else {
            self.validator.validate(caller, owner).await
        }
    }

    /// Verifies a session token for delegated authentication
    ///
    /// The session is served through the cache, since hot sessions are read
    /// on every delegated request.
    async fn verified_session(&self, raw: &SessionTokenRef) -> Result<Session, Status> {
        let token = UnverifiedSessionToken::parse(raw)?;
        let session = self
            .cache
            .fetch(&SessionFetch {
                persistence: &*self.persistence,
                id: token.session_id(),
                config: &self.config.session,
            })
            .await?;

        self.codec.verify_signature(&token)?;

        if session.is_expired_at(self.clock.now()) {
            return Err(SessionTokenError::ExpiredSession.into());
        }

        Ok(session)
    }

    async fn delegated_parameters(
        &self,
        raw: &SessionTokenRef,
        request: GetAccessTokenRequest,
    ) -> Result<(Identity, Scopes, String), Status> {
        let session = self.verified_session(raw).await?;
        tracing::Span::current().record("caller", session.renewer().as_str());

        if !request.owner.is_empty()
            && self.mapper.map(&request.owner)?.as_str() != session.owner().as_str()
        {
            return Err(Status::permission_denied("Owner mismatch"));
        }

        if !request.scopes.is_empty() {
            let requested = Scopes::parse(&request.scopes)
                .map_err(|err| Status::invalid_argument(err.to_string()))?;
            if &requested != session.scopes() {
                return Err(Status::permission_denied("Scopes mismatch"));
            }
        }

        if !request.target.is_empty() && request.target != session.target() {
            return Err(Status::permission_denied("Target mismatch"));
        }

        tracing::debug!(session.id = %session.id(), "delegated authentication");
        Ok((
            session.owner().to_owned(),
            session.scopes().clone(),
            session.target().to_owned(),
        ))
    }

    /// Loads a session for renewal or cancellation by `caller`
    ///
    /// Reads bypass the cache so a mutation always starts from the stored
    /// record.
    async fn renewable_session(
        &self,
        caller: &IdentityRef,
        raw: &SessionTokenRef,
    ) -> Result<Session, Status> {
        let token = UnverifiedSessionToken::parse(raw)?;
        let session = self
            .persistence
            .load::<Session>(token.session_id().as_str())
            .await?
            .ok_or(SessionTokenError::ExpiredOrInvalidSession)?;

        self.codec.verify_signature(&token)?;
        session.authorize_renewer(caller)?;
        Ok(session)
    }

    async fn evict_session(&self, session: &Session) {
        if let Err(err) = self.cache.invalidate(&session_cache_key(session.id())).await {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(error, session.id = %session.id(), "unable to evict session from remote cache");
        }
    }
}

#[cfg(feature = "reqwest")]
fn published_keys_from(url: &str) -> Result<PublishedKeys, ConfigError> {
    PublishedKeys::from_url(url.to_owned()).map_err(|err| ConfigError::KeySource(Box::new(err)))
}

#[cfg(not(feature = "reqwest"))]
fn published_keys_from(_url: &str) -> Result<PublishedKeys, ConfigError> {
    Err(ConfigError::KeySource(
        "fetching published keys requires the `reqwest` feature".into(),
    ))
}

fn require(field: &'static str, value: &str) -> Result<(), Status> {
    if value.is_empty() {
        Err(Status::invalid_argument(format!(
            "Request must specify the `{field}` parameter"
        )))
    } else {
        Ok(())
    }
}

impl<C> std::fmt::Debug for Broker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
