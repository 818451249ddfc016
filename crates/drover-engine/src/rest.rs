//! # REST Fallback
//!
//! The pull side of the sync engine. Both push channels can be down or
//! stale, so the engine seeds its state over plain HTTP at startup and
//! after every reconnect; see the reconciliation pass in [`crate::engine`].
//!
//! The engine talks to [`DispatchApi`] rather than the concrete client so
//! its tests can script dispatch answers without a server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use drover_core::types::{ActiveRide, RideOffer, WorkerId};

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Dispatch API
// =============================================================================

/// Point-in-time dispatch state, fetched to reconcile after an outage.
#[derive(Debug, Clone, Default)]
pub struct RestSnapshot {
    /// The ride the server considers active for this worker, if any.
    pub ride: Option<ActiveRide>,

    /// Offers currently addressed to this worker.
    pub offers: Vec<RideOffer>,
}

/// Read-only dispatch queries the engine needs.
#[async_trait]
pub trait DispatchApi: Send + Sync {
    /// Authoritative active ride for one worker. `None` means no ride.
    async fn get_current_ride(&self, worker: WorkerId) -> EngineResult<Option<ActiveRide>>;

    /// Offers pending for this worker.
    async fn get_pending_offers(&self) -> EngineResult<Vec<RideOffer>>;

    /// Both seeds in one pass.
    async fn fetch_snapshot(&self, worker: WorkerId) -> EngineResult<RestSnapshot> {
        Ok(RestSnapshot {
            ride: self.get_current_ride(worker).await?,
            offers: self.get_pending_offers().await?,
        })
    }
}

// =============================================================================
// REST Client
// =============================================================================

/// HTTP client for the dispatch REST endpoints.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> EngineResult<Self> {
        // Url::join drops the last path segment unless the base ends with
        // a slash, so "https://host/api" must become "https://host/api/".
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::RestRequestFailed(e.to_string()))?;

        Ok(RestClient { http, base_url })
    }

    fn endpoint(&self, path: &str) -> EngineResult<Url> {
        self.base_url.join(path).map_err(EngineError::from)
    }
}

#[async_trait]
impl DispatchApi for RestClient {
    async fn get_current_ride(&self, worker: WorkerId) -> EngineResult<Option<ActiveRide>> {
        let url = self.endpoint(&format!("workers/{worker}/ride"))?;
        debug!(url = %url, "Fetching current ride");

        let response = self.http.get(url).send().await?;
        match response.status() {
            // Both shapes of "no ride" the backend has been seen to produce
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(response.json::<Option<ActiveRide>>().await?),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(EngineError::RestStatus {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn get_pending_offers(&self) -> EngineResult<Vec<RideOffer>> {
        let url = self.endpoint("offers/pending")?;
        debug!(url = %url, "Fetching pending offers");

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::RestStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<Vec<RideOffer>>().await?)
    }
}
