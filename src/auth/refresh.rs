//! Background certificate refresh.
//!
//! A periodic task re-evaluates whether the live credentials still match
//! the server's local record (expiry minus the 7-day margin, token issue
//! time, configured address list) and calls the identity service's
//! refresh endpoint on drift. The swap is atomic with respect to
//! handshakes reading the store: an exchange sees either the old or the
//! new credentials, never a mix.
//!
//! Refresh failure is fail-soft: it logs a warning and the task cancels
//! itself. Connections keep serving with the stale certificate until
//! restart — continuity over forced downtime.

use crate::auth::certificate::{unix_now, ServerCredentials};
use crate::auth::identity::IdentityService;
use crate::config::RefreshConfig;
use crate::utils::metrics;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Shared, atomically-swappable server credentials.
///
/// Cheap to clone; all clones observe the same swaps. In-flight
/// connections that already snapshotted the old credentials are
/// unaffected — only new handshakes pick up a swap.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<RwLock<Arc<ServerCredentials>>>,
}

impl CredentialStore {
    pub fn new(initial: ServerCredentials) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Coherent snapshot of the current credentials.
    pub fn current(&self) -> Arc<ServerCredentials> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replace the credentials, returning the previous set.
    pub fn swap(&self, next: ServerCredentials) -> Arc<ServerCredentials> {
        let mut slot = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::replace(&mut *slot, Arc::new(next))
    }
}

/// Whether the credentials have drifted from the local record.
pub fn refresh_due(creds: &ServerCredentials, addresses: &[String], now: i64) -> bool {
    creds.certificate.expires_within_margin(now)
        || creds.certificate.addresses != addresses
        || creds.token_issued_at < creds.certificate.last_update
}

/// Spawn the interval refresh task.
///
/// The task re-checks on every tick and calls the refresh endpoint only
/// on drift. The first refresh failure cancels the task permanently.
#[instrument(skip(store, identity, config))]
pub fn spawn_refresh_task(
    store: CredentialStore,
    identity: Arc<dyn IdentityService>,
    config: RefreshConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the task is
        // purely interval-based.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let current = store.current();
            let now = unix_now();
            if !refresh_due(&current, &config.addresses, now) {
                debug!("certificate still current, no refresh needed");
                continue;
            }

            match identity.refresh_server(&config.addresses, &current.token).await {
                Ok(next) => {
                    info!(
                        identity = %next.identity,
                        expiry = next.certificate.expiry,
                        "certificate refreshed"
                    );
                    store.swap(next);
                }
                Err(e) => {
                    metrics::global().refresh_failure();
                    warn!(
                        error = %e,
                        "certificate refresh failed; keeping stale certificate and stopping refresh task"
                    );
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::auth::certificate::Certificate;
    use crate::config::CERT_REFRESH_MARGIN;

    fn creds(expiry: i64, addresses: Vec<String>) -> ServerCredentials {
        ServerCredentials {
            identity: "srv-1".into(),
            token: "tok".into(),
            token_issued_at: 1_000,
            certificate: Certificate {
                game_id: "game-1".into(),
                server_id: "srv-1".into(),
                addresses,
                last_update: 1_000,
                expiry,
                public_key: "pub".into(),
                private_key: None,
            },
        }
    }

    #[test]
    fn drift_detection() {
        let now = 1_000_000;
        let far = now + CERT_REFRESH_MARGIN.as_secs() as i64 + 1_000;
        let addrs = vec!["10.0.0.1:7350".to_string()];

        let healthy = creds(far, addrs.clone());
        assert!(!refresh_due(&healthy, &addrs, now));

        // Expiry inside the margin.
        let expiring = creds(now + 100, addrs.clone());
        assert!(refresh_due(&expiring, &addrs, now));

        // Address list drift.
        assert!(refresh_due(
            &healthy,
            &["10.9.9.9:7350".to_string()],
            now
        ));

        // Token older than the certificate's last refresh.
        let mut stale_token = creds(far, addrs.clone());
        stale_token.certificate.last_update = 2_000;
        assert!(refresh_due(&stale_token, &addrs, now));
    }

    #[test]
    fn swap_is_visible_to_all_clones() {
        let store = CredentialStore::new(creds(10_000, vec![]));
        let clone = store.clone();

        let old = store.swap(creds(20_000, vec![]));
        assert_eq!(old.certificate.expiry, 10_000);
        assert_eq!(clone.current().certificate.expiry, 20_000);
    }

    #[test]
    fn snapshots_survive_swaps() {
        let store = CredentialStore::new(creds(10_000, vec![]));
        let snapshot = store.current();
        store.swap(creds(20_000, vec![]));
        // The snapshot taken before the swap is unchanged.
        assert_eq!(snapshot.certificate.expiry, 10_000);
    }
}
