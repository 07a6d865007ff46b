//! Liquidity quality and growth analytics
//!
//! Rolling-window metrics over recent price samples. Both entry points are
//! pure over their input window; the `StoredAnalytics` wrapper adds the
//! storage read and a TTL cache so repeated evaluations inside one scan
//! interval do not recompute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::curve;
use crate::errors::EngineError;
use crate::storage::Store;
use crate::types::{PriceSample, RiskLevel};

/// Samples considered by the quality scorer
pub const DEFAULT_WINDOW: usize = 20;

/// Liquidity drop between consecutive samples that counts as an anomaly
const ANOMALY_DROP_FRACTION: f64 = 0.40;

/// Coefficient of variation below which a price series counts as stable
const STABLE_CV: f64 = 0.15;

/// USD distance to graduation below which a token is "near graduation"
const NEAR_GRADUATION_USD: f64 = 10_000.0;

/// Letter grade for liquidity quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

/// How suitable the book looks for entering a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Suitability {
    Excellent,
    Good,
    Fair,
    Poor,
    Risky,
}

/// Liquidity growth momentum bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Momentum {
    High,
    Medium,
    Low,
    Declining,
}

/// Boolean indicators surfaced alongside the score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityIndicators {
    pub stable_price: bool,
    pub near_graduation: bool,
    pub healthy_liquidity: bool,
    pub anomaly_free: bool,
}

/// Output of the quality scorer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityQuality {
    pub overall_score: f64,
    pub grade: Grade,
    pub trading_suitability: Suitability,
    pub risk_level: RiskLevel,
    pub indicators: QualityIndicators,
    pub warnings: Vec<String>,
}

impl LiquidityQuality {
    /// Conservative result for tokens without enough history
    fn insufficient(sample_count: usize) -> Self {
        Self {
            overall_score: 0.0,
            grade: Grade::F,
            trading_suitability: Suitability::Risky,
            risk_level: RiskLevel::Extreme,
            indicators: QualityIndicators::default(),
            warnings: vec![format!(
                "insufficient price history: {sample_count} samples"
            )],
        }
    }
}

/// Output of the growth analyzer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GrowthMetrics {
    /// SOL liquidity added per hour, linear fit over the last hour
    pub growth_rate_1h: f64,
    pub momentum: Momentum,
    pub accelerating: bool,
}

impl Default for GrowthMetrics {
    fn default() -> Self {
        Self {
            growth_rate_1h: 0.0,
            momentum: Momentum::Low,
            accelerating: false,
        }
    }
}

/// Score liquidity quality over a window of samples, newest first
///
/// Components: price stability 30, liquidity depth 30, curve progress 20,
/// anomaly-free 20.
pub fn score_liquidity_quality(samples: &[PriceSample]) -> LiquidityQuality {
    if samples.len() < 3 {
        return LiquidityQuality::insufficient(samples.len());
    }
    let window = &samples[..samples.len().min(DEFAULT_WINDOW)];
    let mut warnings = Vec::new();

    // Price stability via coefficient of variation
    let prices: Vec<f64> = window.iter().map(|s| s.price_usd).collect();
    let cv = coefficient_of_variation(&prices);
    let stability_score = 30.0 * (1.0 - (cv / 0.5).clamp(0.0, 1.0));
    let stable_price = cv < STABLE_CV;
    if !stable_price {
        warnings.push(format!("price volatility high (cv={cv:.2})"));
    }

    // Absolute liquidity floor
    let liquidity = window.first().map(|s| s.liquidity_usd).unwrap_or(0.0);
    let liquidity_score = 30.0 * (liquidity / 20_000.0).clamp(0.0, 1.0);
    let healthy_liquidity = liquidity >= 5_000.0;
    if !healthy_liquidity {
        warnings.push(format!("liquidity below floor (${liquidity:.0})"));
    }

    // Curve progress toward graduation
    let state = curve::state_at_market_cap(window.first().map(|s| s.market_cap).unwrap_or(0.0));
    let progress_score = 20.0 * state.progress;
    let near_graduation = !state.is_graduated && state.distance_to_graduation <= NEAR_GRADUATION_USD
        || state.is_graduated;

    // Anomaly scan: sudden liquidity drop between consecutive samples
    // (samples arrive newest first, so walk the pairs in reverse)
    let mut anomaly_free = true;
    for pair in window.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        if older.liquidity_usd > 0.0 {
            let drop = (older.liquidity_usd - newer.liquidity_usd) / older.liquidity_usd;
            if drop > ANOMALY_DROP_FRACTION {
                anomaly_free = false;
                warnings.push(format!(
                    "sudden liquidity drop of {:.0}% at {}",
                    drop * 100.0,
                    newer.time
                ));
                break;
            }
        }
    }
    let anomaly_score = if anomaly_free { 20.0 } else { 5.0 };

    let overall_score = stability_score + liquidity_score + progress_score + anomaly_score;

    LiquidityQuality {
        overall_score,
        grade: grade_for(overall_score),
        trading_suitability: suitability_for(overall_score),
        risk_level: risk_for(overall_score),
        indicators: QualityIndicators {
            stable_price,
            near_graduation,
            healthy_liquidity,
            anomaly_free,
        },
        warnings,
    }
}

/// Growth metrics over the trailing hour of samples, newest first
pub fn growth_metrics(samples: &[PriceSample], now: DateTime<Utc>) -> GrowthMetrics {
    let hour_ago = now - ChronoDuration::hours(1);
    let recent: Vec<(f64, f64)> = samples
        .iter()
        .filter(|s| s.time >= hour_ago)
        .map(|s| {
            let hours = (s.time - hour_ago).num_milliseconds() as f64 / 3_600_000.0;
            let liquidity_sol = s.real_sol_reserves as f64 / 1e9;
            (hours, liquidity_sol)
        })
        .collect();

    if recent.len() < 2 {
        return GrowthMetrics::default();
    }

    let growth_rate_1h = linear_slope(&recent);

    let quarter_ago = now - ChronoDuration::minutes(15);
    let last_quarter: Vec<(f64, f64)> = samples
        .iter()
        .filter(|s| s.time >= quarter_ago)
        .map(|s| {
            let hours = (s.time - quarter_ago).num_milliseconds() as f64 / 3_600_000.0;
            (hours, s.real_sol_reserves as f64 / 1e9)
        })
        .collect();
    let accelerating = last_quarter.len() >= 2 && linear_slope(&last_quarter) > growth_rate_1h;

    let momentum = if growth_rate_1h < 0.0 {
        Momentum::Declining
    } else if growth_rate_1h >= 3.0 {
        Momentum::High
    } else if growth_rate_1h >= 1.0 {
        Momentum::Medium
    } else {
        Momentum::Low
    };

    GrowthMetrics {
        growth_rate_1h,
        momentum,
        accelerating,
    }
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

/// Least-squares slope of `(x, y)` pairs; x in hours, y in SOL
fn linear_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}

fn grade_for(score: f64) -> Grade {
    if score >= 85.0 {
        Grade::A
    } else if score >= 70.0 {
        Grade::B
    } else if score >= 55.0 {
        Grade::C
    } else if score >= 40.0 {
        Grade::D
    } else {
        Grade::F
    }
}

fn suitability_for(score: f64) -> Suitability {
    if score >= 85.0 {
        Suitability::Excellent
    } else if score >= 70.0 {
        Suitability::Good
    } else if score >= 55.0 {
        Suitability::Fair
    } else if score >= 40.0 {
        Suitability::Poor
    } else {
        Suitability::Risky
    }
}

fn risk_for(score: f64) -> RiskLevel {
    if score >= 70.0 {
        RiskLevel::Low
    } else if score >= 55.0 {
        RiskLevel::Medium
    } else if score >= 40.0 {
        RiskLevel::High
    } else {
        RiskLevel::Extreme
    }
}

/// Seam the buy evaluator consumes; tests substitute a stub
pub trait MarketAnalytics: Send + Sync {
    fn quality(&self, token: &str) -> Result<LiquidityQuality, EngineError>;
    fn growth(&self, token: &str) -> Result<GrowthMetrics, EngineError>;
}

struct CachedEntry<T> {
    at: Instant,
    value: T,
}

/// Storage-backed analytics with a per-token TTL cache
pub struct StoredAnalytics {
    store: Arc<Store>,
    ttl: Duration,
    quality_cache: DashMap<String, CachedEntry<LiquidityQuality>>,
    growth_cache: DashMap<String, CachedEntry<GrowthMetrics>>,
}

impl StoredAnalytics {
    /// `ttl` should be at least one scan interval for the AIM category
    pub fn new(store: Arc<Store>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            ttl,
            quality_cache: DashMap::new(),
            growth_cache: DashMap::new(),
        })
    }

    fn load_window(&self, token: &str) -> Result<Vec<PriceSample>, EngineError> {
        self.store.recent_prices(token, DEFAULT_WINDOW)
    }
}

impl MarketAnalytics for StoredAnalytics {
    fn quality(&self, token: &str) -> Result<LiquidityQuality, EngineError> {
        if let Some(entry) = self.quality_cache.get(token) {
            if entry.at.elapsed() < self.ttl {
                return Ok(entry.value.clone());
            }
        }
        let samples = self.load_window(token)?;
        let value = score_liquidity_quality(&samples);
        self.quality_cache.insert(
            token.to_string(),
            CachedEntry {
                at: Instant::now(),
                value: value.clone(),
            },
        );
        Ok(value)
    }

    fn growth(&self, token: &str) -> Result<GrowthMetrics, EngineError> {
        if let Some(entry) = self.growth_cache.get(token) {
            if entry.at.elapsed() < self.ttl {
                return Ok(entry.value);
            }
        }
        let samples = self.load_window(token)?;
        let value = growth_metrics(&samples, Utc::now());
        self.growth_cache.insert(
            token.to_string(),
            CachedEntry {
                at: Instant::now(),
                value,
            },
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(minutes_ago: i64, price: f64, liquidity: f64, real_sol: u64, mc: f64) -> PriceSample {
        PriceSample {
            token_address: "mint".into(),
            time: Utc::now() - ChronoDuration::minutes(minutes_ago),
            price_usd: price,
            price_sol: price / 180.0,
            virtual_sol_reserves: 0,
            virtual_token_reserves: 0,
            real_sol_reserves: real_sol,
            real_token_reserves: 0,
            market_cap: mc,
            liquidity_usd: liquidity,
            slot: 1,
            source: "test".into(),
        }
    }

    /// Newest-first series with stable prices and decent liquidity
    fn healthy_window() -> Vec<PriceSample> {
        (0..10)
            .map(|i| {
                sample(
                    i * 3,
                    0.000045 * (1.0 + 0.01 * (i % 2) as f64),
                    15_000.0,
                    80_000_000_000,
                    45_000.0,
                )
            })
            .collect()
    }

    #[test]
    fn healthy_window_scores_good() {
        let quality = score_liquidity_quality(&healthy_window());
        assert!(quality.overall_score >= 70.0, "score={}", quality.overall_score);
        assert!(matches!(quality.grade, Grade::A | Grade::B));
        assert!(matches!(
            quality.trading_suitability,
            Suitability::Excellent | Suitability::Good
        ));
        assert_eq!(quality.risk_level, RiskLevel::Low);
        assert!(quality.indicators.stable_price);
        assert!(quality.indicators.anomaly_free);
    }

    #[test]
    fn insufficient_history_is_risky() {
        let quality = score_liquidity_quality(&healthy_window()[..2]);
        assert_eq!(quality.overall_score, 0.0);
        assert_eq!(quality.trading_suitability, Suitability::Risky);
        assert_eq!(quality.risk_level, RiskLevel::Extreme);
        assert!(!quality.warnings.is_empty());
    }

    #[test]
    fn liquidity_drop_warns() {
        let mut window = healthy_window();
        // newest sample shows a 60% drop against the one before it
        window[0].liquidity_usd = 6_000.0;
        let quality = score_liquidity_quality(&window);
        assert!(!quality.indicators.anomaly_free);
        assert!(quality
            .warnings
            .iter()
            .any(|w| w.contains("liquidity drop")));
    }

    #[test]
    fn volatile_prices_are_flagged() {
        let window: Vec<PriceSample> = (0..10)
            .map(|i| {
                sample(
                    i * 3,
                    if i % 2 == 0 { 0.00002 } else { 0.00009 },
                    15_000.0,
                    80_000_000_000,
                    45_000.0,
                )
            })
            .collect();
        let quality = score_liquidity_quality(&window);
        assert!(!quality.indicators.stable_price);
    }

    #[test]
    fn growth_positive_slope() {
        let now = Utc::now();
        // liquidity rising 1 SOL every 12 minutes → 5 SOL/hour
        let samples: Vec<PriceSample> = (0..6)
            .map(|i| sample(i * 12, 0.00004, 10_000.0, (90 - i as u64 * 1) * 1_000_000_000, 40_000.0))
            .collect();
        let metrics = growth_metrics(&samples, now);
        assert!(metrics.growth_rate_1h > 3.0, "rate={}", metrics.growth_rate_1h);
        assert_eq!(metrics.momentum, Momentum::High);
    }

    #[test]
    fn growth_negative_slope_is_declining() {
        let now = Utc::now();
        let samples: Vec<PriceSample> = (0..6)
            .map(|i| sample(i * 12, 0.00004, 10_000.0, (50 + i as u64 * 5) * 1_000_000_000, 40_000.0))
            .collect();
        let metrics = growth_metrics(&samples, now);
        assert!(metrics.growth_rate_1h < 0.0);
        assert_eq!(metrics.momentum, Momentum::Declining);
    }

    #[test]
    fn growth_needs_two_samples() {
        let now = Utc::now();
        let samples = vec![sample(5, 0.00004, 10_000.0, 50_000_000_000, 40_000.0)];
        let metrics = growth_metrics(&samples, now);
        assert_eq!(metrics.growth_rate_1h, 0.0);
        assert_eq!(metrics.momentum, Momentum::Low);
        assert!(!metrics.accelerating);
    }

    #[test]
    fn slope_of_flat_series_is_zero() {
        let points = vec![(0.0, 5.0), (0.5, 5.0), (1.0, 5.0)];
        assert_eq!(linear_slope(&points), 0.0);
    }
}
