//! The request-processing engine of a short-lived credential broker
//!
//! Clients that must not hold long-lived cloud credentials ask the broker for
//! access tokens instead. A caller authenticates, and the broker issues a
//! token scoped to the requested API permissions and, optionally, to a single
//! target resource. Long-running jobs acting on a user's behalf first obtain a
//! signed *session token*, and later present it in place of re-authenticating.
//!
//! The engine exposes four operations on [`Broker`]:
//!
//! * [`get_session_token`][Broker::get_session_token] creates a session
//! * [`get_access_token`][Broker::get_access_token] issues an access token,
//!   either for a directly authenticated caller or under a session
//! * [`renew_session_token`][Broker::renew_session_token] extends a session
//! * [`cancel_session_token`][Broker::cancel_session_token] deletes a session
//!
//! Access tokens and sessions are served through a two-tier, stampede-safe
//! cache from the `broker_cache` crate. The cloud provider's minting service,
//! the authenticator, the group directory and the storage engines are
//! supplied by the embedding application.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use broker::{
//!     auth::Authenticator, impersonation::Directory, Broker, BrokerConfig, Dependencies,
//!     GetAccessTokenRequest, MintingService,
//! };
//!
//! # async fn run(
//! #     authenticator: Arc<dyn Authenticator>,
//! #     minting: Arc<dyn MintingService>,
//! #     directory: Arc<dyn Directory>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::from_json(r#"{
//!     "scopes_whitelist": ["https://www.googleapis.com/auth/devstorage.read_write"],
//!     "provider": { "kind": "domain_delegation" },
//!     "signing": { "jwks_url": "https://keys.example.com/jwks" }
//! }"#)?;
//!
//! let broker = Broker::new(config, Dependencies::new(authenticator, minting, directory))?;
//! let _key_refresh = broker.spawn_key_refresh();
//! let _sweeps = broker.sweeper().spawn();
//!
//! let token = broker
//!     .get_access_token(
//!         "Negotiate YIIC...",
//!         GetAccessTokenRequest {
//!             owner: "alice@EXAMPLE.COM".into(),
//!             scopes: vec!["https://www.googleapis.com/auth/devstorage.read_write".into()],
//!             target: String::new(),
//!         },
//!     )
//!     .await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod auth;
mod braids;
pub mod config;
mod credential;
mod error;
pub mod fetchers;
mod handlers;
pub mod identity;
pub mod impersonation;
mod keys;
mod minting;
pub mod persistence;
pub mod providers;
mod scope;
mod session;
pub mod sweep;
pub mod token;


pub use braids::{
    AccessToken, AccessTokenRef, EncryptedCredential, EncryptedCredentialRef, Identity,
    IdentityRef, SessionId, SessionIdRef, SessionToken, SessionTokenRef,
};
#[doc(inline)]
pub use config::BrokerConfig;
pub use credential::{IssuedAccessToken, StoredCredential};
pub use error::{Code, Status};
pub use handlers::{
    AccessTokenResponse, Broker, Dependencies, GetAccessTokenRequest, GetSessionTokenRequest,
    SessionTokenRequest,
};
#[doc(inline)]
pub use identity::UserMapper;
pub use keys::{KeyRefreshHandle, PublishedKeys};
pub use minting::{AccessBoundary, MintingError, MintingService};
#[doc(inline)]
pub use persistence::{
    InMemoryPersistence, Persistence, PersistenceError, PersistenceLockStore,
};
#[doc(inline)]
pub use providers::CredentialProvider;
pub use scope::{InvalidScopeToken, ScopeToken, ScopeTokenRef, ScopeWhitelist, Scopes};
pub use session::{Session, SessionLifetime};
#[doc(inline)]
pub use token::SessionTokenCodec;
