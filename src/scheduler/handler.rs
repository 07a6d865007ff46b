//! Default category scan handler
//!
//! Re-queries the external market-data provider, writes the snapshot onto
//! the token row, and — for AIM-band tokens — runs the buy evaluator. The
//! provider itself is a contract edge; scans cache its responses for one
//! scan interval through the `api_cache` table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::buy_engine::{BuySignalEngine, EvaluateError};
use crate::config::ConfigHandle;
use crate::errors::EngineError;
use crate::metrics;
use crate::storage::Store;
use crate::types::{Category, MarketSnapshot};

use super::{ScanHandler, ScanOutcome, ScanTask};

/// Contract edge for third-party market-data and security-score services
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current market snapshot for one token
    async fn snapshot(&self, address: &str) -> Result<MarketSnapshot, EngineError>;
}

/// HTTP-backed provider
pub struct HttpMarketDataProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMarketDataProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
    fn name(&self) -> &'static str {
        "market_data"
    }

    async fn snapshot(&self, address: &str) -> Result<MarketSnapshot, EngineError> {
        let url = format!("{}/{}", self.base_url, address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ExternalTransient(format!("market data request: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(EngineError::ExternalTransient(format!(
                "market data endpoint returned {status}"
            )));
        }
        if status.is_client_error() {
            return Err(EngineError::ExternalPermanent(format!(
                "market data endpoint returned {status}"
            )));
        }

        response
            .json::<MarketSnapshot>()
            .await
            .map_err(|e| EngineError::ExternalTransient(format!("market data body: {e}")))
    }
}

/// Scan implementation shared by every category queue
pub struct CategoryScanHandler {
    config: Arc<ConfigHandle>,
    store: Arc<Store>,
    provider: Arc<dyn MarketDataProvider>,
    buy_engine: Arc<BuySignalEngine>,
}

impl CategoryScanHandler {
    pub fn new(
        config: Arc<ConfigHandle>,
        store: Arc<Store>,
        provider: Arc<dyn MarketDataProvider>,
        buy_engine: Arc<BuySignalEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            provider,
            buy_engine,
        })
    }

    /// Snapshot from cache when fresh, otherwise from the provider
    async fn fetch_snapshot(
        &self,
        address: &str,
        category: Category,
        apis_used: &mut Vec<String>,
    ) -> Result<MarketSnapshot, EngineError> {
        let cache_key = format!("market:{address}");
        let cache_ttl = self
            .config
            .load()
            .scans
            .policy(category)
            .map(|p| p.interval_secs as i64)
            .unwrap_or(60);

        if let Ok(Some(cached)) = self.store.api_cache_get(&cache_key, cache_ttl) {
            if let Ok(snapshot) = serde_json::from_str::<MarketSnapshot>(&cached) {
                apis_used.push("cache".to_string());
                return Ok(snapshot);
            }
        }

        let timer = metrics::Timer::start();
        let result = self.provider.snapshot(address).await;
        let _ = self.store.record_api_call(
            self.provider.name(),
            "snapshot",
            result.as_ref().ok().map(|_| 200),
            timer.elapsed_ms(),
        );
        apis_used.push(self.provider.name().to_string());

        let snapshot = result?;
        if let Ok(serialized) = serde_json::to_string(&snapshot) {
            let _ = self.store.api_cache_put(&cache_key, &serialized);
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl ScanHandler for CategoryScanHandler {
    async fn scan(&self, task: &ScanTask) -> ScanOutcome {
        let timer = metrics::Timer::start();
        let mut apis_used = Vec::new();

        let snapshot = match self
            .fetch_snapshot(&task.token_address, task.category, &mut apis_used)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return ScanOutcome {
                    success: false,
                    market_cap: None,
                    apis_used,
                    error: Some(e.to_string()),
                    duration_ms: timer.elapsed_ms(),
                };
            }
        };

        if let Err(e) = self
            .store
            .update_market_snapshot(&task.token_address, &snapshot, Utc::now())
        {
            warn!(token = %task.token_address, error = %e, "snapshot write failed");
        }

        // AIM scans double as evaluation triggers
        if task.category == Category::Aim {
            match self.buy_engine.evaluate(&task.token_address) {
                Ok(evaluation) => {
                    debug!(
                        token = %task.token_address,
                        passed = evaluation.passed,
                        confidence = evaluation.confidence,
                        "scan evaluation"
                    );
                }
                Err(EvaluateError::NotInAim(_, current)) => {
                    // the queue lags the machine by at most one tick
                    debug!(token = %task.token_address, %current, "evaluation skipped");
                }
                Err(e) => warn!(token = %task.token_address, error = %e, "evaluation failed"),
            }
        }

        ScanOutcome {
            success: true,
            market_cap: snapshot.market_cap,
            apis_used,
            error: None,
            duration_ms: timer.elapsed_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::StoredAnalytics;
    use crate::config::Settings;
    use crate::events::EventBus;
    use crate::types::TokenRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct StubProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }
        async fn snapshot(&self, _address: &str) -> Result<MarketSnapshot, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MarketSnapshot {
                market_cap: Some(42_000.0),
                liquidity: Some(12_000.0),
                volume_24h: Some(30_000.0),
                holder_count: Some(150),
                top10_concentration: Some(18.0),
                safety_score: Some(82.0),
                safety_flags: vec![],
            })
        }
    }

    fn setup() -> (
        TempDir,
        Arc<CategoryScanHandler>,
        Arc<Store>,
        Arc<StubProvider>,
    ) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db"), 4).unwrap();
        let config = ConfigHandle::new(Settings::default());
        let events = EventBus::new(64);
        let analytics = StoredAnalytics::new(store.clone(), Duration::from_secs(10));
        let buy_engine =
            BuySignalEngine::new(config.clone(), store.clone(), analytics, events);
        let provider = Arc::new(StubProvider {
            calls: AtomicUsize::new(0),
        });
        let handler = CategoryScanHandler::new(config, store.clone(), provider.clone(), buy_engine);
        (dir, handler, store, provider)
    }

    fn task(address: &str, category: Category) -> ScanTask {
        let now = Utc::now();
        ScanTask {
            token_address: address.to_string(),
            category,
            scan_number: 0,
            first_scheduled_at: now,
            last_scanned_at: None,
            next_scan_at: now,
            timeout_at: now + chrono::Duration::hours(1),
            priority: 50,
        }
    }

    #[tokio::test]
    async fn scan_updates_snapshot_and_reports_mc() {
        let (_dir, handler, store, _provider) = setup();
        store
            .insert_token(&TokenRecord::placeholder("mintA", Utc::now()))
            .unwrap();

        let outcome = handler.scan(&task("mintA", Category::Medium)).await;
        assert!(outcome.success);
        assert_eq!(outcome.market_cap, Some(42_000.0));
        assert_eq!(outcome.apis_used, vec!["stub".to_string()]);

        let token = store.get_token("mintA").unwrap().unwrap();
        assert_eq!(token.market_cap, 42_000.0);
        assert_eq!(token.holder_count, 150);
        assert_eq!(token.safety_score, Some(82.0));
    }

    #[tokio::test]
    async fn second_scan_within_interval_hits_cache() {
        let (_dir, handler, store, provider) = setup();
        store
            .insert_token(&TokenRecord::placeholder("mintB", Utc::now()))
            .unwrap();

        handler.scan(&task("mintB", Category::Medium)).await;
        let outcome = handler.scan(&task("mintB", Category::Medium)).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.apis_used, vec!["cache".to_string()]);
    }

    #[tokio::test]
    async fn aim_scan_runs_evaluation() {
        let (_dir, handler, store, _provider) = setup();
        let mut token = TokenRecord::placeholder("mintC", Utc::now());
        token.category = Category::Aim;
        store.insert_token(&token).unwrap();

        let outcome = handler.scan(&task("mintC", Category::Aim)).await;
        assert!(outcome.success);
        // evaluation ran and was persisted (it fails the gate on sparse
        // history, which is fine for this test)
        assert_eq!(store.count_buy_evaluations("mintC").unwrap(), 1);
    }
}
