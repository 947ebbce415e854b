//! Background cleanup of expired sessions and stale stored credentials

use std::{sync::Arc, time::Duration};

use broker_cache::{LocalCache, RemoteCache};
use broker_clock::{Clock, System, UnixTime};

use crate::{
    config::SweepConfig, persistence::Record, MintingService, Persistence, PersistenceError,
    Session, StoredCredential,
};

/// Deletes sessions that expired at or before `now`
///
/// Returns how many were deleted.
///
/// # Errors
///
/// Fails if the persistence engine cannot be reached.
pub async fn sweep_expired_sessions(
    persistence: &dyn Persistence,
    now: UnixTime,
    batch_limit: Option<usize>,
) -> Result<usize, PersistenceError> {
    let deleted = persistence
        .delete_stale(Session::KIND, "expires_at", now.as_millis(), batch_limit)
        .await?;
    if deleted > 0 {
        tracing::info!(deleted, "swept expired sessions");
    }
    Ok(deleted)
}

/// Revokes and deletes stored credentials created at or before `cutoff`
///
/// A credential that cannot be revoked is kept, so it is retried on the next
/// sweep. Returns how many were revoked and deleted.
///
/// # Errors
///
/// Fails only if the stored credentials cannot be listed.
pub async fn revoke_stale_credentials(
    persistence: &dyn Persistence,
    minting: &dyn MintingService,
    cutoff: UnixTime,
    batch_limit: Option<usize>,
) -> Result<usize, PersistenceError> {
    let stale = persistence
        .load_all::<StoredCredential>()
        .await?
        .into_iter()
        .filter(|credential| credential.creation_time() <= cutoff)
        .take(batch_limit.unwrap_or(usize::MAX));

    let mut revoked = 0;
    for credential in stale {
        if let Err(err) = minting.revoke(&credential).await {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(error, credential.id = %credential.id(), "unable to revoke stored credential");
            continue;
        }

        match persistence
            .remove::<StoredCredential>(credential.record_id())
            .await
        {
            Ok(_) => revoked += 1,
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, credential.id = %credential.id(), "unable to delete revoked credential");
            }
        }
    }

    if revoked > 0 {
        tracing::info!(revoked, "revoked stale stored credentials");
    }
    Ok(revoked)
}

/// Periodically runs both sweeps and purges expired cache entries
pub struct Sweeper<C = System> {
    persistence: Arc<dyn Persistence>,
    minting: Arc<dyn MintingService>,
    local: Arc<LocalCache<C>>,
    remote: Arc<dyn RemoteCache>,
    config: SweepConfig,
    clock: C,
}

impl<C> Sweeper<C> {
    /// Constructs a sweeper
    pub fn new(
        persistence: Arc<dyn Persistence>,
        minting: Arc<dyn MintingService>,
        local: Arc<LocalCache<C>>,
        remote: Arc<dyn RemoteCache>,
        config: SweepConfig,
        clock: C,
    ) -> Self {
        Self {
            persistence,
            minting,
            local,
            remote,
            config,
            clock,
        }
    }
}

impl<C> std::fmt::Debug for Sweeper<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: Clock + Send + Sync + 'static> Sweeper<C> {
    /// Runs one round of every sweep
    ///
    /// Failures are logged and do not stop the remaining sweeps.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) {
        let now = self.clock.now();

        if let Err(err) =
            sweep_expired_sessions(&*self.persistence, now, self.config.batch_limit).await
        {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(error, "session sweep failed");
        }

        if let Some(max_age) = self.config.credential_max_age() {
            let cutoff = UnixTime(now.as_millis().saturating_sub(millis(max_age)));
            if let Err(err) = revoke_stale_credentials(
                &*self.persistence,
                &*self.minting,
                cutoff,
                self.config.batch_limit,
            )
            .await
            {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, "credential sweep failed");
            }
        }

        let purged = self.local.purge_expired();
        tracing::trace!(purged, "purged local cache");

        match self.remote.purge_expired().await {
            Ok(purged) => tracing::trace!(purged, "purged remote cache"),
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, "remote cache purge failed");
            }
        }
    }

    /// Runs the sweeps on the configured interval until the returned handle
    /// is dropped
    pub fn spawn(self) -> SweeperHandle {
        let interval = self.config.interval();
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;

            loop {
                timer.tick().await;
                self.run_once().await;
            }
        });

        SweeperHandle { task }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Stops the background sweeps when dropped
#[derive(Debug)]
pub struct SweeperHandle {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
