/*!
Provider-selection controller.

Probes both scraping providers on a fixed interval and caches which one
is active. DataForSEO is preferred; Bright Data is the fallback. A 429
from a health endpoint counts as healthy (rate-limited but up).
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::model::ProviderKind;

/// Result of the most recent probe round.
#[derive(Debug, Clone, Copy)]
pub struct ProviderHealth {
    pub checked_at: DateTime<Utc>,
    pub active: Option<ProviderKind>,
    pub brightdata_healthy: bool,
    pub dataforseo_healthy: bool,
}

/// Pick the active provider from probe results, callback provider first.
pub fn choose_active(dataforseo_healthy: bool, brightdata_healthy: bool) -> Option<ProviderKind> {
    if dataforseo_healthy {
        Some(ProviderKind::Dataforseo)
    } else if brightdata_healthy {
        Some(ProviderKind::Brightdata)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct ProviderSelector {
    state: Arc<RwLock<Option<ProviderHealth>>>,
    first_probe: Arc<Notify>,
    client: Client,
    brightdata_url: String,
    brightdata_configured: bool,
    dataforseo_url: String,
    dataforseo_configured: bool,
    interval: Duration,
}

impl ProviderSelector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            state: Arc::new(RwLock::new(None)),
            first_probe: Arc::new(Notify::new()),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap(),
            brightdata_url: settings.brightdata_health_url.clone(),
            brightdata_configured: settings.brightdata_api_key.is_some(),
            dataforseo_url: settings.dataforseo_health_url.clone(),
            dataforseo_configured: settings.dataforseo_login.is_some()
                && settings.dataforseo_password.is_some(),
            interval: Duration::from_secs(settings.health_probe_interval_secs.max(1)),
        }
    }

    /// Run the probe loop until cancelled.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let selector = self.clone();
        tokio::spawn(async move {
            loop {
                let health = selector.probe_once().await;
                match health.active {
                    Some(provider) => info!(%provider, "provider probe complete"),
                    None => warn!("no scraping provider is healthy"),
                }
                *selector.state.write().await = Some(health);
                selector.first_probe.notify_waiters();

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(selector.interval) => {}
                }
            }
        })
    }

    /// The currently active provider. Blocks until the initial probe
    /// has completed; afterwards it is a cache read.
    pub async fn active(&self) -> Option<ProviderKind> {
        loop {
            if let Some(health) = *self.state.read().await {
                return health.active;
            }
            let notified = self.first_probe.notified();
            // Re-check after registering so a probe completing in the
            // gap cannot be missed.
            if let Some(health) = *self.state.read().await {
                return health.active;
            }
            notified.await;
        }
    }

    pub async fn snapshot(&self) -> Option<ProviderHealth> {
        *self.state.read().await
    }

    async fn probe_once(&self) -> ProviderHealth {
        let dataforseo = async {
            self.dataforseo_configured
                && self
                    .probe_url(&self.dataforseo_url, ProviderKind::Dataforseo)
                    .await
        };
        let brightdata = async {
            self.brightdata_configured
                && self
                    .probe_url(&self.brightdata_url, ProviderKind::Brightdata)
                    .await
        };
        let (dataforseo_healthy, brightdata_healthy) =
            futures::future::join(dataforseo, brightdata).await;

        ProviderHealth {
            checked_at: Utc::now(),
            active: choose_active(dataforseo_healthy, brightdata_healthy),
            brightdata_healthy,
            dataforseo_healthy,
        }
    }

    async fn probe_url(&self, url: &str, provider: ProviderKind) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                let healthy = status.is_success() || status.as_u16() == 429;
                if !healthy {
                    warn!(%provider, %status, "health probe rejected");
                }
                healthy
            }
            Err(e) => {
                warn!(%provider, error = %e, "health probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_provider_is_preferred() {
        assert_eq!(choose_active(true, true), Some(ProviderKind::Dataforseo));
        assert_eq!(choose_active(true, false), Some(ProviderKind::Dataforseo));
        assert_eq!(choose_active(false, true), Some(ProviderKind::Brightdata));
        assert_eq!(choose_active(false, false), None);
    }

    #[tokio::test]
    async fn active_blocks_until_first_probe_lands() {
        let state = Arc::new(RwLock::new(None::<ProviderHealth>));
        let notify = Arc::new(Notify::new());

        // Simulate the probe loop landing its first result.
        let writer_state = state.clone();
        let writer_notify = notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            *writer_state.write().await = Some(ProviderHealth {
                checked_at: Utc::now(),
                active: Some(ProviderKind::Brightdata),
                brightdata_healthy: true,
                dataforseo_healthy: false,
            });
            writer_notify.notify_waiters();
        });

        let reader = async {
            loop {
                if let Some(health) = *state.read().await {
                    return health.active;
                }
                let notified = notify.notified();
                if let Some(health) = *state.read().await {
                    return health.active;
                }
                notified.await;
            }
        };

        let active = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader must unblock after the first probe");
        assert_eq!(active, Some(ProviderKind::Brightdata));
    }
}
