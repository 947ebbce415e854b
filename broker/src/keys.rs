use std::{sync::Arc, time::Duration};

use aliri::{jwa, jws::Verifier, Jwks};
use arc_swap::ArcSwap;
#[cfg(feature = "reqwest")]
use reqwest::{
    header::{self, HeaderValue},
    Client, StatusCode,
};

#[derive(Debug)]
struct VolatileData {
    jwks: Jwks,
    #[cfg(feature = "reqwest")]
    etag: Option<HeaderValue>,
    #[cfg(feature = "reqwest")]
    last_modified: Option<HeaderValue>,
}

impl VolatileData {
    fn new(jwks: Jwks) -> Self {
        Self {
            jwks,
            #[cfg(feature = "reqwest")]
            etag: None,
            #[cfg(feature = "reqwest")]
            last_modified: None,
        }
    }
}

#[derive(Debug)]
#[cfg(feature = "reqwest")]
struct RemoteOptions {
    jwks_url: String,
    client: Client,
}

#[derive(Debug)]
struct Inner {
    data: ArcSwap<VolatileData>,
    #[cfg(feature = "reqwest")]
    remote: Option<RemoteOptions>,
}

/// The verification keys currently published for the broker's signing
/// identity
///
/// Keys rotate, so the set may be refreshed from a remote JSON Web Key Set
/// endpoint. A signature is accepted if any key in the current set verifies
/// it.
#[derive(Debug, Clone)]
#[must_use]
pub struct PublishedKeys {
    inner: Arc<Inner>,
}

impl PublishedKeys {
    /// Constructs a key set from an existing JWKS
    pub fn new(jwks: Jwks) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: ArcSwap::from_pointee(VolatileData::new(jwks)),
                #[cfg(feature = "reqwest")]
                remote: None,
            }),
        }
    }

    /// Constructs a key set which will be fetched from a URL
    ///
    /// The set starts out empty, so verification fails until the first
    /// successful [`refresh`][Self::refresh].
    #[cfg(feature = "reqwest")]
    #[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
    pub fn from_url(jwks_url: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("broker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                data: ArcSwap::from_pointee(VolatileData::new(Jwks::default())),
                remote: Some(RemoteOptions { jwks_url, client }),
            }),
        })
    }

    /// Refreshes the key set now and then on every `interval` in a
    /// background task, until the returned handle is dropped
    pub fn spawn_refresh(&self, interval: Duration) -> KeyRefreshHandle {
        let this = self.clone();

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                // Failures are logged by `refresh`; the previous keys remain
                let _ = this.refresh().await;
            }
        });

        KeyRefreshHandle { task }
    }

    /// Refreshes the key set from the remote URL
    ///
    /// No retries are attempted. If the refresh fails, the current key set
    /// is left in place.
    #[cfg(feature = "reqwest")]
    #[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
    #[tracing::instrument(skip(self), fields(jwks.url = tracing::field::Empty))]
    pub async fn refresh(&self) -> Result<(), reqwest::Error> {
        if let Some(remote) = &self.inner.remote {
            let span = tracing::Span::current();
            span.record("jwks.url", &remote.jwks_url);
            tracing::debug!("refreshing published keys");
            let mut request = remote.client.get(&remote.jwks_url);

            {
                let data = self.inner.data.load();
                if let Some(etag) = &data.etag {
                    request = request.header(header::IF_NONE_MATCH, etag)
                } else if let Some(last_modified) = &data.last_modified {
                    request = request.header(header::IF_MODIFIED_SINCE, last_modified)
                }
            }

            let response = request.send().await?;

            if response.status() == StatusCode::NOT_MODIFIED {
                tracing::debug!("published keys not modified");
                return Ok(());
            } else if let Err(err) = response.error_for_status_ref() {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(
                    error,
                    http.status_code = response.status().as_u16(),
                    "key refresh failed; unexpected response status",
                );
                return Err(err);
            }

            let etag = response.headers().get(header::ETAG).map(ToOwned::to_owned);
            let last_modified = response
                .headers()
                .get(header::LAST_MODIFIED)
                .map(ToOwned::to_owned);
            match response.json::<Jwks>().await {
                Ok(jwks) => {
                    let count = jwks.keys().len();
                    self.inner.data.store(Arc::new(VolatileData {
                        jwks,
                        etag,
                        last_modified,
                    }));
                    tracing::info!(keys = count, "published keys refreshed");
                }
                Err(err) => {
                    let error: &dyn std::error::Error = &err;
                    tracing::warn!(error, "key refresh failed; unexpected error");
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Refreshes the key set from the remote URL
    ///
    /// Without remote support this does nothing.
    #[cfg(not(feature = "reqwest"))]
    #[cfg_attr(docsrs, doc(cfg(not(feature = "reqwest"))))]
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), std::convert::Infallible> {
        Ok(())
    }

    /// Replaces the key set
    pub fn set_jwks(&self, jwks: Jwks) {
        self.inner.data.store(Arc::new(VolatileData::new(jwks)));
    }

    /// Whether any current key verifies `signature` over `data`
    pub fn verify(&self, alg: jwa::Algorithm, data: &[u8], signature: &[u8]) -> bool {
        let guard = self.inner.data.load();
        let verified = guard
            .jwks
            .keys()
            .iter()
            .filter(|key| key.can_verify(alg))
            .any(|key| key.verify(alg, data, signature).is_ok());

        if !verified {
            tracing::debug!(%alg, keys = guard.jwks.keys().len(), "no published key verified the signature");
        }

        verified
    }
}

/// Stops the background key refresh when dropped
#[derive(Debug)]
pub struct KeyRefreshHandle {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for KeyRefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
