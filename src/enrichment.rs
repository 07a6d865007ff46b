//! Metadata enrichment
//!
//! An in-process job queue keyed by token address. Jobs deduplicate while
//! pending; workers fetch metadata through the provider contract edge with
//! exponential backoff, apply it in one upsert, and emit an event. A hard
//! 4xx marks the token so it is never retried.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EnrichmentSettings;
use crate::errors::{EngineError, ExponentialBackoff};
use crate::events::{EngineEvent, EventBus};
use crate::metrics;
use crate::storage::Store;
use crate::types::TokenMetadata;

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Contract edge for external metadata services
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Provider name for API call logging
    fn name(&self) -> &'static str;

    /// Fetch metadata for one token
    ///
    /// Errors must be classified: `ExternalTransient` retries with
    /// backoff, `ExternalPermanent` marks the token un-enrichable.
    async fn fetch(&self, address: &str) -> Result<TokenMetadata, EngineError>;
}

/// Wire shape of the metadata endpoint
#[derive(Debug, Deserialize)]
struct CoinPayload {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    decimals: Option<u8>,
    #[serde(default)]
    creator: Option<String>,
    #[serde(default)]
    holder_count: Option<u32>,
    #[serde(default)]
    top10_concentration: Option<f64>,
}

/// HTTP-backed provider with an outbound rate cap
pub struct HttpMetadataProvider {
    client: reqwest::Client,
    base_url: String,
    limiter: DirectLimiter,
}

impl HttpMetadataProvider {
    pub fn new(settings: &EnrichmentSettings) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {e}")))?;
        let rps = NonZeroU32::new(settings.requests_per_second.max(1))
            .expect("non-zero after max(1)");
        Ok(Self {
            client,
            base_url: settings.metadata_api_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::direct(Quota::per_second(rps)),
        })
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataProvider {
    fn name(&self) -> &'static str {
        "metadata_api"
    }

    async fn fetch(&self, address: &str) -> Result<TokenMetadata, EngineError> {
        self.limiter.until_ready().await;

        let url = format!("{}/{}", self.base_url, address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExternalTransient(format!("metadata request: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(EngineError::ExternalTransient(format!(
                "metadata endpoint returned {status}"
            )));
        }
        if status.is_client_error() {
            return Err(EngineError::ExternalPermanent(format!(
                "metadata endpoint returned {status}"
            )));
        }

        let payload: CoinPayload = response
            .json()
            .await
            .map_err(|e| EngineError::ExternalTransient(format!("metadata body: {e}")))?;

        Ok(TokenMetadata {
            address: address.to_string(),
            symbol: payload.symbol.unwrap_or_else(|| "UNKNOWN".to_string()),
            name: payload.name.unwrap_or_else(|| "Unknown".to_string()),
            decimals: payload.decimals.unwrap_or(6),
            creator: payload.creator,
            holder_count: payload.holder_count,
            top10_concentration: payload.top10_concentration,
        })
    }
}

/// Owns the dedup set and the worker pool
pub struct Enricher {
    store: Arc<Store>,
    events: EventBus,
    provider: Arc<dyn MetadataProvider>,
    pending: DashSet<String>,
    settings: EnrichmentSettings,
}

impl Enricher {
    pub fn new(
        store: Arc<Store>,
        events: EventBus,
        provider: Arc<dyn MetadataProvider>,
        settings: EnrichmentSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            provider,
            pending: DashSet::new(),
            settings,
        })
    }

    /// Spawn the dispatcher and workers; returns the enqueue sender and
    /// the task handles
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::UnboundedSender<String>, Vec<JoinHandle<()>>) {
        let (enqueue_tx, mut enqueue_rx) = mpsc::unbounded_channel::<String>();
        let (work_tx, work_rx) = mpsc::channel::<String>(1_024);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let mut handles = Vec::new();

        // dispatcher: deduplicate pending jobs by token address
        let enricher = self.clone();
        let mut dispatcher_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = enqueue_rx.recv() => match job {
                        Some(address) => {
                            if !enricher.pending.insert(address.clone()) {
                                continue;
                            }
                            if work_tx.send(address).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = dispatcher_shutdown.changed() => break,
                }
            }
            debug!("enrichment dispatcher stopped");
        }));

        for worker_id in 0..self.settings.workers {
            let enricher = self.clone();
            let work_rx = work_rx.clone();
            let mut worker_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = work_rx.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = worker_shutdown.changed() => None,
                        }
                    };
                    let Some(address) = job else { break };
                    enricher.process(&address).await;
                    enricher.pending.remove(&address);
                }
                debug!(worker_id, "enrichment worker stopped");
            }));
        }

        (enqueue_tx, handles)
    }

    /// Fetch with backoff and apply; classification decides retry vs mark
    async fn process(&self, address: &str) {
        // respect the do-not-retry flag from earlier permanent failures
        match self.store.get_token(address) {
            Ok(Some(token)) if token.metadata_failed => {
                debug!(token = address, "skipping un-enrichable token");
                return;
            }
            Err(e) => {
                warn!(token = address, error = %e, "enrichment pre-check failed");
                return;
            }
            _ => {}
        }

        let mut backoff = ExponentialBackoff::new(250, 15_000);
        for attempt in 0..self.settings.max_retries {
            let timer = metrics::Timer::start();
            match self.provider.fetch(address).await {
                Ok(metadata) => {
                    let _ = self.store.record_api_call(
                        self.provider.name(),
                        "metadata",
                        Some(200),
                        timer.elapsed_ms(),
                    );
                    if let Err(e) = self.store.apply_metadata(&metadata) {
                        warn!(token = address, error = %e, "metadata apply failed");
                        return;
                    }
                    info!(token = address, symbol = %metadata.symbol, "token enriched");
                    self.events.publish(EngineEvent::TokenEnriched {
                        address: address.to_string(),
                        symbol: metadata.symbol,
                    });
                    return;
                }
                Err(e) if e.is_retryable() => {
                    let _ = self.store.record_api_call(
                        self.provider.name(),
                        "metadata",
                        None,
                        timer.elapsed_ms(),
                    );
                    let delay = backoff.next_backoff();
                    debug!(
                        token = address,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "enrichment retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::metrics().enrichment_failures_total.inc();
                    metrics::metrics().record_error(e.class());
                    warn!(token = address, error = %e, "permanent enrichment failure");
                    if let Err(mark_err) = self.store.mark_metadata_failed(address) {
                        warn!(token = address, error = %mark_err, "failure flag write failed");
                    }
                    return;
                }
            }
        }
        warn!(token = address, "enrichment retries exhausted");
    }
}
