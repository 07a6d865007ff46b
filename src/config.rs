//! Scanner configuration
//!
//! All settings load from environment variables with defaults, are
//! validated once at startup, and live behind an atomically swapped
//! snapshot so a reload never tears a reader. Watchers registered on the
//! handle run after each successful swap.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::types::Category;

/// Market-cap thresholds (USD) separating the categories
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low_max: f64,
    pub medium_max: f64,
    pub high_max: f64,
    pub aim_min: f64,
    pub aim_max: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_max: 8_000.0,
            medium_max: 19_000.0,
            high_max: 35_000.0,
            aim_min: 35_000.0,
            aim_max: 105_000.0,
        }
    }
}

impl Thresholds {
    /// Category implied by a market cap, ignoring duration floors
    ///
    /// Market caps above the AIM band have no bracket of their own; they
    /// report `High` so callers treat them as past the window.
    pub fn bracket(&self, mc: f64) -> Category {
        if mc <= 0.0 {
            Category::Archive
        } else if mc < self.low_max {
            Category::Low
        } else if mc < self.medium_max {
            Category::Medium
        } else if mc < self.high_max {
            Category::High
        } else if mc <= self.aim_max {
            Category::Aim
        } else {
            Category::High
        }
    }

    /// Midpoint of a category's market-cap range, used by rehydrate
    pub fn midpoint(&self, category: Category) -> f64 {
        match category {
            Category::Low => self.low_max / 2.0,
            Category::Medium => (self.low_max + self.medium_max) / 2.0,
            Category::High => (self.medium_max + self.high_max) / 2.0,
            Category::Aim => (self.aim_min + self.aim_max) / 2.0,
            // NEW and ARCHIVE have no bracket; a zero synthetic update keeps
            // them where they are
            _ => 0.0,
        }
    }
}

/// Per-category scan cadence and budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPolicy {
    pub interval_secs: u64,
    pub duration_secs: u64,
    pub max_scans: u32,
    pub batch_size: usize,
    pub base_priority: i32,
}

/// Scan policies for every non-terminal category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTable {
    pub new: ScanPolicy,
    pub low: ScanPolicy,
    pub medium: ScanPolicy,
    pub high: ScanPolicy,
    pub aim: ScanPolicy,
    pub archive: ScanPolicy,
}

impl Default for ScanTable {
    fn default() -> Self {
        Self {
            new: ScanPolicy {
                interval_secs: 60,
                duration_secs: 1_800,
                max_scans: 30,
                batch_size: 20,
                base_priority: 50,
            },
            low: ScanPolicy {
                interval_secs: 600,
                duration_secs: 5_400,
                max_scans: 9,
                batch_size: 10,
                base_priority: 30,
            },
            medium: ScanPolicy {
                interval_secs: 300,
                duration_secs: 3_600,
                max_scans: 12,
                batch_size: 30,
                base_priority: 60,
            },
            high: ScanPolicy {
                interval_secs: 120,
                duration_secs: 1_800,
                max_scans: 15,
                batch_size: 50,
                base_priority: 80,
            },
            aim: ScanPolicy {
                interval_secs: 10,
                duration_secs: 600,
                max_scans: 60,
                batch_size: 20,
                base_priority: 100,
            },
            archive: ScanPolicy {
                interval_secs: 3_600,
                duration_secs: 86_400,
                max_scans: 24,
                batch_size: 5,
                base_priority: 10,
            },
        }
    }
}

impl ScanTable {
    /// Policy for a non-terminal category; `None` for BIN/COMPLETE
    pub fn policy(&self, category: Category) -> Option<&ScanPolicy> {
        match category {
            Category::New => Some(&self.new),
            Category::Low => Some(&self.low),
            Category::Medium => Some(&self.medium),
            Category::High => Some(&self.high),
            Category::Aim => Some(&self.aim),
            Category::Archive => Some(&self.archive),
            Category::Bin | Category::Complete => None,
        }
    }
}

/// Buy-signal gate criteria
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyCriteria {
    pub min_market_cap: f64,
    pub max_market_cap: f64,
    pub min_liquidity: f64,
    pub min_holders: u32,
    pub max_top10_concentration: f64,
    pub min_solsniffer: f64,
    /// Exact score values never accepted regardless of magnitude
    pub solsniffer_blacklist: BTreeSet<u32>,
}

impl Default for BuyCriteria {
    fn default() -> Self {
        Self {
            min_market_cap: 35_000.0,
            max_market_cap: 105_000.0,
            min_liquidity: 7_500.0,
            min_holders: 50,
            max_top10_concentration: 25.0,
            min_solsniffer: 60.0,
            solsniffer_blacklist: BTreeSet::from([90]),
        }
    }
}

/// One tier of the position-cap tables: a half-open value range and the
/// fractional cap it grants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTier {
    pub min: f64,
    pub max: f64,
    pub cap: f64,
}

/// Tiered position caps keyed on safety score and holder count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionTiers {
    pub safety: Vec<PositionTier>,
    pub holders: Vec<PositionTier>,
    /// Cap applied when top-10 concentration exceeds the criteria maximum
    pub concentration_cap: f64,
    /// Fallback when no tier matches
    pub floor: f64,
}

impl Default for PositionTiers {
    fn default() -> Self {
        Self {
            safety: vec![
                PositionTier { min: 85.0, max: 101.0, cap: 1.0 },
                PositionTier { min: 70.0, max: 85.0, cap: 0.75 },
                PositionTier { min: 60.0, max: 70.0, cap: 0.5 },
            ],
            holders: vec![
                PositionTier { min: 200.0, max: f64::MAX, cap: 1.0 },
                PositionTier { min: 100.0, max: 200.0, cap: 0.75 },
                PositionTier { min: 50.0, max: 100.0, cap: 0.5 },
            ],
            concentration_cap: 0.5,
            floor: 0.25,
        }
    }
}

impl PositionTiers {
    /// Cap granted by a tier table for an observed value
    pub fn cap_for(tiers: &[PositionTier], value: f64, floor: f64) -> f64 {
        tiers
            .iter()
            .find(|t| value >= t.min && value < t.max)
            .map(|t| t.cap)
            .unwrap_or(floor)
    }
}

/// Stream ingestion and batching knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSettings {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// SOL→USD reference refresh cadence
    pub price_refresh_interval_ms: u64,
    pub grpc_endpoint: String,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            flush_interval_ms: 1_000,
            price_refresh_interval_ms: 300_000,
            grpc_endpoint: "http://127.0.0.1:10000".to_string(),
        }
    }
}

/// Storage knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub path: String,
    pub pool_max: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: "curvescan.db".to_string(),
            pool_max: 20,
        }
    }
}

/// Metadata enrichment knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentSettings {
    pub workers: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub requests_per_second: u32,
    pub metadata_api_url: String,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            request_timeout_secs: 15,
            max_retries: 5,
            requests_per_second: 10,
            metadata_api_url: "https://frontend-api.pump.fun/coins".to_string(),
        }
    }
}

/// Complete immutable settings snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub thresholds: Thresholds,
    pub scans: ScanTable,
    pub buy: BuyCriteria,
    pub position: PositionTiers,
    pub ingest: IngestSettings,
    pub storage: StorageSettings,
    pub enrichment: EnrichmentSettings,
    /// Startup SOL→USD reference (overridden by price history once loaded)
    pub sol_price_usd: f64,
    pub metrics_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            scans: ScanTable::default(),
            buy: BuyCriteria::default(),
            position: PositionTiers::default(),
            ingest: IngestSettings::default(),
            storage: StorageSettings::default(),
            enrichment: EnrichmentSettings::default(),
            sol_price_usd: 100.0,
            metrics_port: 9090,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, EngineError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Config(format!("invalid {key}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_blacklist(key: &str, default: &BTreeSet<u32>) -> Result<BTreeSet<u32>, EngineError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u32>()
                    .map_err(|_| EngineError::Config(format!("invalid {key} entry: {s:?}")))
            })
            .collect(),
        Err(_) => Ok(default.clone()),
    }
}

fn env_scan_policy(suffix: &str, default: ScanPolicy) -> Result<ScanPolicy, EngineError> {
    Ok(ScanPolicy {
        interval_secs: env_parse(&format!("SCAN_INTERVAL_{suffix}"), default.interval_secs)?,
        duration_secs: env_parse(&format!("SCAN_DURATION_{suffix}"), default.duration_secs)?,
        max_scans: env_parse(&format!("SCAN_MAX_{suffix}"), default.max_scans)?,
        batch_size: default.batch_size,
        base_priority: default.base_priority,
    })
}

impl Settings {
    /// Read the full snapshot from the environment
    pub fn from_env() -> Result<Self, EngineError> {
        let defaults = Settings::default();

        let thresholds = Thresholds {
            low_max: env_parse("CATEGORY_LOW_MAX", defaults.thresholds.low_max)?,
            medium_max: env_parse("CATEGORY_MEDIUM_MAX", defaults.thresholds.medium_max)?,
            high_max: env_parse("CATEGORY_HIGH_MAX", defaults.thresholds.high_max)?,
            aim_min: env_parse("CATEGORY_AIM_MIN", defaults.thresholds.aim_min)?,
            aim_max: env_parse("CATEGORY_AIM_MAX", defaults.thresholds.aim_max)?,
        };

        let scans = ScanTable {
            new: env_scan_policy("NEW", defaults.scans.new)?,
            low: env_scan_policy("LOW", defaults.scans.low)?,
            medium: env_scan_policy("MEDIUM", defaults.scans.medium)?,
            high: env_scan_policy("HIGH", defaults.scans.high)?,
            aim: env_scan_policy("AIM", defaults.scans.aim)?,
            archive: env_scan_policy("ARCHIVE", defaults.scans.archive)?,
        };

        let buy = BuyCriteria {
            min_market_cap: env_parse("BUY_MIN_MARKET_CAP", defaults.buy.min_market_cap)?,
            max_market_cap: env_parse("BUY_MAX_MARKET_CAP", defaults.buy.max_market_cap)?,
            min_liquidity: env_parse("BUY_MIN_LIQUIDITY", defaults.buy.min_liquidity)?,
            min_holders: env_parse("BUY_MIN_HOLDERS", defaults.buy.min_holders)?,
            max_top10_concentration: env_parse(
                "BUY_MAX_TOP10_CONCENTRATION",
                defaults.buy.max_top10_concentration,
            )?,
            min_solsniffer: env_parse("BUY_MIN_SOLSNIFFER", defaults.buy.min_solsniffer)?,
            solsniffer_blacklist: env_blacklist(
                "BUY_SOLSNIFFER_BLACKLIST",
                &defaults.buy.solsniffer_blacklist,
            )?,
        };

        let ingest = IngestSettings {
            batch_size: env_parse("GRPC_BATCH_SIZE", defaults.ingest.batch_size)?,
            flush_interval_ms: env_parse("GRPC_FLUSH_INTERVAL", defaults.ingest.flush_interval_ms)?,
            price_refresh_interval_ms: env_parse(
                "PRICE_CHANGE_INTERVAL",
                defaults.ingest.price_refresh_interval_ms,
            )?,
            grpc_endpoint: env_string("GRPC_ENDPOINT", &defaults.ingest.grpc_endpoint),
        };

        let storage = StorageSettings {
            path: env_string("DATABASE_PATH", &defaults.storage.path),
            pool_max: env_parse("DB_POOL_MAX", defaults.storage.pool_max)?,
        };

        let enrichment = EnrichmentSettings {
            workers: env_parse("ENRICHMENT_WORKERS", defaults.enrichment.workers)?,
            request_timeout_secs: defaults.enrichment.request_timeout_secs,
            max_retries: defaults.enrichment.max_retries,
            requests_per_second: env_parse(
                "ENRICHMENT_RPS",
                defaults.enrichment.requests_per_second,
            )?,
            metadata_api_url: env_string(
                "METADATA_API_URL",
                &defaults.enrichment.metadata_api_url,
            ),
        };

        let settings = Settings {
            thresholds,
            scans,
            buy,
            position: defaults.position,
            ingest,
            storage,
            enrichment,
            sol_price_usd: env_parse("SOL_PRICE_USD", defaults.sol_price_usd)?,
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate cross-field invariants; any failure is fatal at startup
    pub fn validate(&self) -> Result<(), EngineError> {
        let t = &self.thresholds;
        if !(t.low_max < t.medium_max && t.medium_max < t.high_max && t.high_max < t.aim_max) {
            return Err(EngineError::Config(format!(
                "thresholds must be strictly increasing: low={} medium={} high={} aim_max={}",
                t.low_max, t.medium_max, t.high_max, t.aim_max
            )));
        }
        if t.high_max != t.aim_min {
            return Err(EngineError::Config(format!(
                "CATEGORY_HIGH_MAX ({}) must equal CATEGORY_AIM_MIN ({})",
                t.high_max, t.aim_min
            )));
        }

        for category in Category::ACTIVE {
            let policy = self
                .scans
                .policy(category)
                .ok_or_else(|| EngineError::Config(format!("no scan policy for {category}")))?;
            if policy.interval_secs == 0 {
                return Err(EngineError::Config(format!(
                    "SCAN_INTERVAL_{category} must be positive"
                )));
            }
            if policy.duration_secs <= policy.interval_secs {
                return Err(EngineError::Config(format!(
                    "SCAN_DURATION_{category} ({}) must exceed SCAN_INTERVAL_{category} ({})",
                    policy.duration_secs, policy.interval_secs
                )));
            }
            let expected = policy.duration_secs / policy.interval_secs;
            let diff = expected.abs_diff(policy.max_scans as u64);
            if diff > 1 {
                return Err(EngineError::Config(format!(
                    "SCAN_MAX_{category} ({}) inconsistent with duration/interval ({})",
                    policy.max_scans, expected
                )));
            }
        }

        if self.buy.min_market_cap >= self.buy.max_market_cap {
            return Err(EngineError::Config(
                "BUY_MIN_MARKET_CAP must be below BUY_MAX_MARKET_CAP".to_string(),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(EngineError::Config("GRPC_BATCH_SIZE must be > 0".to_string()));
        }
        if self.ingest.flush_interval_ms == 0 {
            return Err(EngineError::Config("GRPC_FLUSH_INTERVAL must be > 0".to_string()));
        }
        if self.storage.pool_max == 0 {
            return Err(EngineError::Config("DB_POOL_MAX must be > 0".to_string()));
        }
        if self.enrichment.workers == 0 {
            return Err(EngineError::Config("ENRICHMENT_WORKERS must be > 0".to_string()));
        }
        Ok(())
    }
}

type Watcher = Box<dyn Fn(&Arc<Settings>) + Send + Sync>;

/// Shared handle over the current settings snapshot
///
/// Readers call [`ConfigHandle::load`] and get a cheap `Arc` clone of the
/// snapshot current at that instant; `reload` re-reads the environment,
/// validates, swaps the pointer, then notifies watchers.
pub struct ConfigHandle {
    current: ArcSwap<Settings>,
    watchers: parking_lot::Mutex<Vec<Watcher>>,
}

impl ConfigHandle {
    pub fn new(settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(settings),
            watchers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    /// Register a callback invoked after every successful reload
    pub fn on_reload<F>(&self, watcher: F)
    where
        F: Fn(&Arc<Settings>) + Send + Sync + 'static,
    {
        self.watchers.lock().push(Box::new(watcher));
    }

    /// Re-read the environment; swap only when the new snapshot validates
    pub fn reload(&self) -> Result<(), EngineError> {
        let fresh = Settings::from_env()?;
        let fresh = Arc::new(fresh);
        self.current.store(fresh.clone());
        tracing::info!("configuration reloaded");
        for watcher in self.watchers.lock().iter() {
            watcher(&fresh);
        }
        Ok(())
    }

    /// Replace the snapshot directly (tests and manual overrides)
    pub fn replace(&self, settings: Settings) -> Result<(), EngineError> {
        settings.validate()?;
        let fresh = Arc::new(settings);
        self.current.store(fresh.clone());
        for watcher in self.watchers.lock().iter() {
            watcher(&fresh);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn thresholds_must_increase() {
        let mut settings = Settings::default();
        settings.thresholds.medium_max = 5_000.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn high_max_must_equal_aim_min() {
        let mut settings = Settings::default();
        settings.thresholds.aim_min = 36_000.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn duration_must_exceed_interval() {
        let mut settings = Settings::default();
        settings.scans.low.duration_secs = settings.scans.low.interval_secs;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn scan_count_consistency_enforced() {
        let mut settings = Settings::default();
        settings.scans.medium.max_scans = 50;
        assert!(settings.validate().is_err());

        // off-by-one is tolerated
        settings.scans.medium.max_scans = 13;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn bracket_routing() {
        let t = Thresholds::default();
        assert_eq!(t.bracket(0.0), Category::Archive);
        assert_eq!(t.bracket(5_000.0), Category::Low);
        assert_eq!(t.bracket(10_000.0), Category::Medium);
        assert_eq!(t.bracket(20_000.0), Category::High);
        assert_eq!(t.bracket(35_000.0), Category::Aim);
        assert_eq!(t.bracket(105_000.0), Category::Aim);
        assert_eq!(t.bracket(150_000.0), Category::High);
    }

    #[test]
    fn midpoints_sit_inside_brackets() {
        let t = Thresholds::default();
        assert_eq!(t.bracket(t.midpoint(Category::Low)), Category::Low);
        assert_eq!(t.bracket(t.midpoint(Category::Medium)), Category::Medium);
        assert_eq!(t.bracket(t.midpoint(Category::High)), Category::High);
        assert_eq!(t.bracket(t.midpoint(Category::Aim)), Category::Aim);
    }

    #[test]
    fn tier_lookup_with_floor() {
        let tiers = PositionTiers::default();
        assert_eq!(PositionTiers::cap_for(&tiers.safety, 90.0, tiers.floor), 1.0);
        assert_eq!(PositionTiers::cap_for(&tiers.safety, 75.0, tiers.floor), 0.75);
        assert_eq!(PositionTiers::cap_for(&tiers.safety, 65.0, tiers.floor), 0.5);
        assert_eq!(PositionTiers::cap_for(&tiers.safety, 10.0, tiers.floor), 0.25);
        assert_eq!(PositionTiers::cap_for(&tiers.holders, 500.0, tiers.floor), 1.0);
    }

    #[test]
    fn replace_notifies_watchers() {
        let handle = ConfigHandle::new(Settings::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_watcher = fired.clone();
        handle.on_reload(move |_| {
            fired_in_watcher.fetch_add(1, Ordering::SeqCst);
        });

        let mut next = Settings::default();
        next.buy.min_holders = 75;
        handle.replace(next).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(handle.load().buy.min_holders, 75);
    }

    #[test]
    fn invalid_replace_keeps_old_snapshot() {
        let handle = ConfigHandle::new(Settings::default());
        let mut bad = Settings::default();
        bad.thresholds.low_max = 1_000_000.0;
        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.load().thresholds.low_max, 8_000.0);
    }
}
