//! Broker configuration
//!
//! The configuration document is read once at startup. Every option has a
//! default, so an empty JSON object is a valid (if permissive) configuration.
//! Call [`BrokerConfig::validate`] before building backends from it.

use std::time::Duration;

use aliri::jwa;
use broker_cache::LockConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    identity::{InvalidMappingRule, MappingRule},
    Scopes, SessionLifetime,
};

/// A configuration that cannot be used
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid configuration JSON
    #[error("malformed configuration")]
    Malformed(#[from] serde_json::Error),
    /// A setting is out of range or inconsistent with another
    #[error("invalid setting `{setting}`: {reason}")]
    Invalid {
        /// The offending setting
        setting: &'static str,
        /// Why it was rejected
        reason: &'static str,
    },
    /// A user mapping rule does not compile
    #[error("invalid user mapping rule")]
    Mapping(#[from] InvalidMappingRule),
    /// An external backend was selected but none was supplied
    #[error("backend `{0}` is configured as external but no implementation was provided")]
    MissingBackend(&'static str),
    /// The published key source could not be set up
    #[error("unable to set up published key source")]
    KeySource(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

fn invalid(setting: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { setting, reason }
}

/// The complete broker configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Session lifetimes and cache TTLs
    pub session: SessionConfig,
    /// Access token cache TTLs
    pub access_tokens: AccessTokenConfig,
    /// Distributed lock timing
    pub lock: LockSettings,
    /// The only scopes callers may request
    pub scopes_whitelist: Scopes,
    /// Who may act on behalf of whom
    pub proxy_users: Vec<ProxyRule>,
    /// Ordered principal-to-identity mapping rules
    pub user_mapping: Vec<MappingRule>,
    /// The credential provider strategy
    pub provider: ProviderSelection,
    /// Shadow account naming, used by the shadow provider
    pub shadow: ShadowConfig,
    /// Session token signing
    pub signing: SigningConfig,
    /// Backend implementation selection
    pub backends: BackendSelection,
    /// Background sweeps
    pub sweep: SweepConfig,
}

impl BrokerConfig {
    /// Parses and validates a JSON configuration document
    ///
    /// # Errors
    ///
    /// Fails if the document is malformed or [`validate`][Self::validate]
    /// rejects it.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects inconsistent settings
    ///
    /// # Errors
    ///
    /// Names the first setting found to be invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.renew_period_ms == 0 {
            return Err(invalid("session.renew_period_ms", "must be positive"));
        }
        if self.session.max_lifetime_ms == 0 {
            return Err(invalid("session.max_lifetime_ms", "must be positive"));
        }
        if self.session.remote_cache_ttl_ms < self.session.local_cache_ttl_ms {
            return Err(invalid(
                "session.remote_cache_ttl_ms",
                "must not be shorter than the local cache TTL",
            ));
        }
        if self.access_tokens.remote_cache_ttl_ms < self.access_tokens.local_cache_ttl_ms {
            return Err(invalid(
                "access_tokens.remote_cache_ttl_ms",
                "must not be shorter than the local cache TTL",
            ));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(invalid("lock.poll_interval_ms", "must be positive"));
        }
        if self.lock.patience_timeout_ms < self.lock.poll_interval_ms {
            return Err(invalid(
                "lock.patience_timeout_ms",
                "must allow at least one poll",
            ));
        }
        if self.lock.deadlock_timeout_ms < self.lock.poll_interval_ms {
            return Err(invalid(
                "lock.deadlock_timeout_ms",
                "must not be shorter than the poll interval",
            ));
        }
        if self.proxy_users.iter().any(|rule| rule.proxy.is_empty()) {
            return Err(invalid("proxy_users.proxy", "must not be empty"));
        }

        let needs_shadow = match &self.provider {
            ProviderSelection::Shadow => true,
            ProviderSelection::Hybrid { user_provider } => {
                *user_provider == UserProviderSelection::Shadow
            }
            _ => false,
        };
        if needs_shadow && !self.shadow.pattern.contains("{username}") {
            return Err(invalid(
                "shadow.pattern",
                "must contain the `{username}` placeholder",
            ));
        }

        if self.signing.refresh_interval_ms == 0 {
            return Err(invalid("signing.refresh_interval_ms", "must be positive"));
        }
        if self.sweep.interval_ms == 0 {
            return Err(invalid("sweep.interval_ms", "must be positive"));
        }

        Ok(())
    }
}

/// Session lifetimes and cache TTLs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// How far each renewal pushes the expiry
    pub renew_period_ms: u64,
    /// How long after creation a session expires regardless of renewals
    pub max_lifetime_ms: u64,
    /// How long a session may be served from process memory
    pub local_cache_ttl_ms: u64,
    /// How long a session may be served from the shared cache
    pub remote_cache_ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renew_period_ms: 24 * 60 * 60 * 1000,
            max_lifetime_ms: 7 * 24 * 60 * 60 * 1000,
            local_cache_ttl_ms: 30 * 1000,
            remote_cache_ttl_ms: 60 * 1000,
        }
    }
}

impl SessionConfig {
    /// The session lifetime policy
    pub fn lifetime(&self) -> SessionLifetime {
        SessionLifetime::new(
            Duration::from_millis(self.renew_period_ms),
            Duration::from_millis(self.max_lifetime_ms),
        )
    }

    /// The local cache TTL
    pub fn local_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.local_cache_ttl_ms)
    }

    /// The remote cache TTL
    pub fn remote_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.remote_cache_ttl_ms)
    }
}

/// Access token cache TTLs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessTokenConfig {
    /// How long a token may be served from process memory
    pub local_cache_ttl_ms: u64,
    /// How long a token may be served from the shared cache
    pub remote_cache_ttl_ms: u64,
}

impl Default for AccessTokenConfig {
    fn default() -> Self {
        Self {
            local_cache_ttl_ms: 30 * 1000,
            remote_cache_ttl_ms: 30 * 60 * 1000,
        }
    }
}

impl AccessTokenConfig {
    /// The local cache TTL
    pub fn local_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.local_cache_ttl_ms)
    }

    /// The remote cache TTL
    pub fn remote_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.remote_cache_ttl_ms)
    }
}

/// Distributed lock timing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockSettings {
    /// Delay between acquisition attempts
    pub poll_interval_ms: u64,
    /// Age after which a held lock is presumed abandoned
    pub deadlock_timeout_ms: u64,
    /// How long to wait before giving up
    pub patience_timeout_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        let defaults = LockConfig::default();
        Self {
            poll_interval_ms: millis(defaults.poll_interval()),
            deadlock_timeout_ms: millis(defaults.deadlock_timeout()),
            patience_timeout_ms: millis(defaults.patience_timeout()),
        }
    }
}

impl LockSettings {
    /// The lock configuration these settings describe
    pub fn lock_config(&self) -> LockConfig {
        LockConfig::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(self.deadlock_timeout_ms),
            Duration::from_millis(self.patience_timeout_ms),
        )
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A proxy user entry
///
/// `proxy` may obtain credentials on behalf of any identity listed in `users`
/// or belonging to any group in `groups`. Either list may contain `*`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyRule {
    /// The impersonating principal
    pub proxy: String,
    /// Identities that may be impersonated
    pub users: Vec<String>,
    /// Directory groups whose members may be impersonated
    pub groups: Vec<String>,
}

/// The credential provider strategy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSelection {
    /// Exchange stored long-lived credentials
    #[default]
    DirectDelegation,
    /// Trade server-signed assertions
    DomainDelegation,
    /// Impersonate service accounts
    Impersonation,
    /// Impersonate per-user shadow service accounts
    Shadow,
    /// Impersonate service accounts; use `user_provider` for everyone else
    Hybrid {
        /// The strategy for non-service-account identities
        user_provider: UserProviderSelection,
    },
}

/// The strategy a hybrid provider uses for user identities
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserProviderSelection {
    /// Exchange stored long-lived credentials
    DirectDelegation,
    /// Trade server-signed assertions
    DomainDelegation,
    /// Impersonate per-user shadow service accounts
    Shadow,
}

/// Shadow account naming
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShadowConfig {
    /// Account name template with `{username}` and `{project}` placeholders
    pub pattern: String,
    /// The project hosting shadow accounts
    pub project: String,
    /// Permissions granted on a downscoped target
    pub boundary_permissions: Vec<String>,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            pattern: "{username}-shadow@{project}.iam.gserviceaccount.com".to_owned(),
            project: String::new(),
            boundary_permissions: vec!["inRole:roles/storage.objectViewer".to_owned()],
        }
    }
}

/// Session token signing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SigningConfig {
    /// The signature algorithm used by the broker's signing identity
    pub algorithm: jwa::Algorithm,
    /// Where verification keys are published
    pub jwks_url: Option<String>,
    /// How often to refresh published keys
    pub refresh_interval_ms: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            algorithm: jwa::Algorithm::RS256,
            jwks_url: None,
            refresh_interval_ms: 60 * 60 * 1000,
        }
    }
}

impl SigningConfig {
    /// The key refresh interval
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Where a backend comes from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// The in-process implementation shipped with the broker
    #[default]
    InMemory,
    /// An implementation supplied when the broker is built
    External,
}

/// Where distributed lock records are kept
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// Alongside entries in the remote cache
    #[default]
    Cache,
    /// As records in the persistence store
    Persistence,
}

/// Backend implementation selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSelection {
    /// The remote cache
    pub cache: Backend,
    /// The persistence store
    pub persistence: Backend,
    /// The lock store
    pub lock: LockBackend,
}

/// Background sweeps
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    /// Delay between sweeps
    pub interval_ms: u64,
    /// Most records deleted per sweep, if limited
    pub batch_limit: Option<usize>,
    /// Age after which stored credentials are revoked, if ever
    pub credential_max_age_ms: Option<u64>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10 * 60 * 1000,
            batch_limit: Some(1000),
            credential_max_age_ms: None,
        }
    }
}

impl SweepConfig {
    /// The sweep interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// The stored credential age limit
    pub fn credential_max_age(&self) -> Option<Duration> {
        self.credential_max_age_ms.map(Duration::from_millis)
    }
}
