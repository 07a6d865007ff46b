//! Buy-signal evaluation and position sizing
//!
//! Gates AIM-band tokens on the fixed criteria set, scores confidence and
//! risk, and recommends a position size. The only side effects are one
//! `buy_evaluations` row and the buy-attempt increment; a token that has
//! burned its attempts is answered from local state without touching any
//! external data.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::{GrowthMetrics, LiquidityQuality, MarketAnalytics, Momentum, Suitability};
use crate::config::{ConfigHandle, PositionTiers};
use crate::errors::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::metrics;
use crate::storage::Store;
use crate::types::{BuyEvaluationRow, Category, RiskLevel, TokenRecord};

/// Evaluations allowed per token before the gate closes
pub const MAX_BUY_ATTEMPTS: u32 = 3;

/// Safety scores older than this no longer count
const SAFETY_MAX_AGE_SECS: i64 = 3_600;

/// Minimum acceptable growth rate (SOL/hour); mild outflow is tolerated
const MIN_GROWTH_RATE: f64 = -2.0;

/// Quality score floor for the liquidity-quality criterion
const MIN_QUALITY_SCORE: f64 = 70.0;

/// Evaluation refusal
#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("token {0} is in {1}, not AIM")]
    NotInAim(String, Category),
    #[error("token {0} is unknown")]
    UnknownToken(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Per-criterion pass flags, in evaluation order
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CriteriaFlags {
    pub market_cap: bool,
    pub liquidity: bool,
    pub holders: bool,
    pub concentration: bool,
    pub solsniffer: bool,
    pub liquidity_quality: bool,
    pub liquidity_growth: bool,
}

impl CriteriaFlags {
    fn all_passed(&self) -> bool {
        self.market_cap
            && self.liquidity
            && self.holders
            && self.concentration
            && self.solsniffer
            && self.liquidity_quality
            && self.liquidity_growth
    }
}

/// Full evaluation result
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub id: Uuid,
    pub token_address: String,
    pub passed: bool,
    pub criteria: CriteriaFlags,
    pub failure_reasons: Vec<String>,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub recommended_position: f64,
    pub duration_ms: u64,
}

impl Evaluation {
    /// Result returned once the attempt budget is spent; never persisted
    fn max_attempts(token: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            token_address: token.to_string(),
            passed: false,
            criteria: CriteriaFlags::default(),
            failure_reasons: vec!["max_attempts".to_string()],
            confidence: 0.0,
            risk_level: RiskLevel::Extreme,
            recommended_position: 0.0,
            duration_ms: 0,
        }
    }
}

/// Evaluates AIM-band tokens against the criteria gate
pub struct BuySignalEngine {
    config: Arc<ConfigHandle>,
    store: Arc<Store>,
    analytics: Arc<dyn MarketAnalytics>,
    events: EventBus,
}

impl BuySignalEngine {
    pub fn new(
        config: Arc<ConfigHandle>,
        store: Arc<Store>,
        analytics: Arc<dyn MarketAnalytics>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            analytics,
            events,
        })
    }

    /// Evaluate one token currently believed to be in the AIM band
    pub fn evaluate(&self, address: &str) -> Result<Evaluation, EvaluateError> {
        let timer = metrics::Timer::start();
        let token = self
            .store
            .get_token(address)
            .map_err(EvaluateError::Engine)?
            .ok_or_else(|| EvaluateError::UnknownToken(address.to_string()))?;

        if token.category != Category::Aim {
            return Err(EvaluateError::NotInAim(address.to_string(), token.category));
        }

        if token.buy_attempts >= MAX_BUY_ATTEMPTS {
            debug!(token = address, attempts = token.buy_attempts, "attempt budget spent");
            return Ok(Evaluation::max_attempts(address));
        }

        let quality = self.analytics.quality(address)?;
        let growth = self.analytics.growth(address)?;

        let evaluation = self.judge(&token, &quality, &growth, timer.elapsed_ms());

        metrics::metrics().evaluations_total.inc();
        metrics::metrics()
            .evaluation_duration
            .observe(evaluation.duration_ms as f64 / 1_000.0);

        // the evaluation's only side effects
        if let Err(e) = self.store.increment_buy_attempts(address) {
            warn!(token = address, error = %e, "buy attempt increment failed");
        }
        if let Err(e) = self.store.append_buy_evaluation(&to_row(&evaluation, &token)) {
            warn!(token = address, error = %e, "evaluation row append failed");
        }

        if evaluation.passed {
            metrics::metrics().buy_signals_total.inc();
            info!(
                token = address,
                confidence = evaluation.confidence,
                position = evaluation.recommended_position,
                "buy signal"
            );
            self.events.publish(EngineEvent::BuySignal {
                address: address.to_string(),
                confidence: evaluation.confidence,
                recommended_position: evaluation.recommended_position,
            });
        }

        Ok(evaluation)
    }

    /// Pure criteria judgment over one snapshot
    fn judge(
        &self,
        token: &TokenRecord,
        quality: &LiquidityQuality,
        growth: &GrowthMetrics,
        duration_ms: u64,
    ) -> Evaluation {
        let settings = self.config.load();
        let criteria_cfg = &settings.buy;
        let mut flags = CriteriaFlags::default();
        let mut reasons = Vec::new();

        flags.market_cap = token.market_cap >= criteria_cfg.min_market_cap
            && token.market_cap <= criteria_cfg.max_market_cap;
        if !flags.market_cap {
            reasons.push(format!(
                "market cap ${:.0} outside [${:.0}, ${:.0}]",
                token.market_cap, criteria_cfg.min_market_cap, criteria_cfg.max_market_cap
            ));
        }

        flags.liquidity = token.liquidity >= criteria_cfg.min_liquidity;
        if !flags.liquidity {
            reasons.push(format!(
                "liquidity ${:.0} below minimum ${:.0}",
                token.liquidity, criteria_cfg.min_liquidity
            ));
        }

        flags.holders = token.holder_count >= criteria_cfg.min_holders;
        if !flags.holders {
            reasons.push(format!(
                "holder count {} below minimum {}",
                token.holder_count, criteria_cfg.min_holders
            ));
        }

        flags.concentration = token.top10_concentration <= criteria_cfg.max_top10_concentration;
        if !flags.concentration {
            reasons.push(format!(
                "top-10 concentration {:.1}% above maximum {:.1}%",
                token.top10_concentration, criteria_cfg.max_top10_concentration
            ));
        }

        flags.solsniffer = match (token.safety_score, token.safety_checked_at) {
            (Some(score), Some(checked_at)) => {
                let fresh = Utc::now() - checked_at
                    <= ChronoDuration::seconds(SAFETY_MAX_AGE_SECS);
                let blacklisted = criteria_cfg
                    .solsniffer_blacklist
                    .contains(&(score.round() as u32));
                if !fresh {
                    reasons.push(format!("safety score stale (checked {checked_at})"));
                    false
                } else if blacklisted {
                    reasons.push(format!("safety score {score:.0} is blacklisted"));
                    false
                } else if score <= criteria_cfg.min_solsniffer {
                    reasons.push(format!(
                        "safety score {score:.0} not above minimum {:.0}",
                        criteria_cfg.min_solsniffer
                    ));
                    false
                } else {
                    true
                }
            }
            _ => {
                reasons.push("safety score missing".to_string());
                false
            }
        };

        flags.liquidity_quality = quality.overall_score >= MIN_QUALITY_SCORE
            && matches!(
                quality.trading_suitability,
                Suitability::Excellent | Suitability::Good | Suitability::Fair
            )
            && quality.risk_level != RiskLevel::Extreme;
        if !flags.liquidity_quality {
            reasons.push(format!(
                "liquidity quality insufficient (score {:.0}, {:?}, {:?})",
                quality.overall_score, quality.trading_suitability, quality.risk_level
            ));
        }

        flags.liquidity_growth =
            growth.momentum != Momentum::Declining && growth.growth_rate_1h >= MIN_GROWTH_RATE;
        if !flags.liquidity_growth {
            reasons.push(format!(
                "liquidity declining (rate {:.2} SOL/h)",
                growth.growth_rate_1h
            ));
        }

        let passed = flags.all_passed();
        let confidence = confidence_score(token, quality, growth);
        let risk_level = risk_level(&flags, quality, growth, confidence);
        let recommended_position = if passed {
            position_size(quality.trading_suitability, confidence, risk_level)
        } else {
            0.0
        };

        Evaluation {
            id: Uuid::new_v4(),
            token_address: token.address.clone(),
            passed,
            criteria: flags,
            failure_reasons: reasons,
            confidence,
            risk_level,
            recommended_position,
            duration_ms,
        }
    }

    /// Tier-table position cap for callers sizing from hard limits; the
    /// final position is the minimum across every active cap
    pub fn tiered_position_cap(&self, token: &TokenRecord) -> f64 {
        let settings = self.config.load();
        let tiers: &PositionTiers = &settings.position;

        let safety_cap = token
            .safety_score
            .map(|score| PositionTiers::cap_for(&tiers.safety, score, tiers.floor))
            .unwrap_or(tiers.floor);
        let holder_cap =
            PositionTiers::cap_for(&tiers.holders, token.holder_count as f64, tiers.floor);
        let concentration_cap =
            if token.top10_concentration > settings.buy.max_top10_concentration {
                tiers.concentration_cap
            } else {
                1.0
            };

        safety_cap.min(holder_cap).min(concentration_cap)
    }
}

/// Additive confidence model over the observed snapshot
fn confidence_score(token: &TokenRecord, quality: &LiquidityQuality, growth: &GrowthMetrics) -> f64 {
    let mut confidence: f64 = 0.3;

    if token.market_cap >= 35_000.0 && token.market_cap <= 70_000.0 {
        confidence += 0.1;
    }
    if token.liquidity > 15_000.0 {
        confidence += 0.1;
    }
    if token.holder_count > 150 {
        confidence += 0.05;
    }
    if token.top10_concentration < 15.0 {
        confidence += 0.05;
    }
    if let Some(score) = token.safety_score {
        if score > 80.0 && score.round() as u32 != 90 {
            confidence += 0.1;
        }
    }
    confidence += match quality.trading_suitability {
        Suitability::Excellent => 0.15,
        Suitability::Good => 0.10,
        Suitability::Fair => 0.05,
        Suitability::Poor | Suitability::Risky => 0.0,
    };
    if quality.indicators.stable_price {
        confidence += 0.05;
    }
    if quality.indicators.near_graduation {
        confidence += 0.10;
    }
    confidence += match (growth.momentum, growth.accelerating) {
        (Momentum::High, true) => 0.15,
        (Momentum::High, false) => 0.10,
        (Momentum::Medium, _) => 0.05,
        _ => 0.0,
    };
    if growth.growth_rate_1h > 1.0 {
        confidence += 0.05;
    }

    confidence.clamp(0.0, 1.0)
}

/// Risk from the failed-criteria count plus two extra factors
fn risk_level(
    flags: &CriteriaFlags,
    quality: &LiquidityQuality,
    growth: &GrowthMetrics,
    confidence: f64,
) -> RiskLevel {
    let failures = [
        flags.market_cap,
        flags.liquidity,
        flags.holders,
        flags.concentration,
        flags.solsniffer,
        flags.liquidity_quality,
        flags.liquidity_growth,
    ]
    .iter()
    .filter(|passed| !**passed)
    .count();

    let extreme_quality_risk = quality.risk_level == RiskLevel::Extreme;
    let declining_momentum = growth.momentum == Momentum::Declining;
    let factors = failures + extreme_quality_risk as usize + declining_momentum as usize;

    if factors == 0 && confidence > 0.8 {
        RiskLevel::Low
    } else if factors <= 1 && confidence > 0.6 {
        RiskLevel::Medium
    } else if factors <= 3 {
        RiskLevel::High
    } else {
        RiskLevel::Extreme
    }
}

/// Multiplier position model, clamped to [0.1, 3.0]
fn position_size(suitability: Suitability, confidence: f64, risk: RiskLevel) -> f64 {
    let suitability_factor = match suitability {
        Suitability::Excellent => 1.5,
        Suitability::Good => 1.2,
        Suitability::Fair => 1.0,
        Suitability::Poor => 0.5,
        Suitability::Risky => 0.25,
    };
    let risk_factor = match risk {
        RiskLevel::Low => 1.2,
        RiskLevel::Medium => 1.0,
        RiskLevel::High => 0.6,
        RiskLevel::Extreme => 0.3,
    };
    (1.0 * suitability_factor * confidence * risk_factor).clamp(0.1, 3.0)
}

fn to_row(evaluation: &Evaluation, token: &TokenRecord) -> BuyEvaluationRow {
    BuyEvaluationRow {
        id: evaluation.id,
        token_address: evaluation.token_address.clone(),
        evaluated_at: Utc::now(),
        passed: evaluation.passed,
        failure_reasons: evaluation.failure_reasons.clone(),
        criteria: serde_json::to_value(evaluation.criteria).unwrap_or_default(),
        observed: serde_json::json!({
            "market_cap": token.market_cap,
            "liquidity": token.liquidity,
            "holder_count": token.holder_count,
            "top10_concentration": token.top10_concentration,
            "safety_score": token.safety_score,
        }),
        confidence: evaluation.confidence,
        risk_level: evaluation.risk_level,
        recommended_position: evaluation.recommended_position,
        duration_ms: evaluation.duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::QualityIndicators;
    use crate::config::Settings;
    use crate::types::Category;
    use tempfile::TempDir;

    struct StubAnalytics {
        quality: LiquidityQuality,
        growth: GrowthMetrics,
    }

    impl MarketAnalytics for StubAnalytics {
        fn quality(&self, _token: &str) -> Result<LiquidityQuality, EngineError> {
            Ok(self.quality.clone())
        }
        fn growth(&self, _token: &str) -> Result<GrowthMetrics, EngineError> {
            Ok(self.growth)
        }
    }

    fn good_quality() -> LiquidityQuality {
        LiquidityQuality {
            overall_score: 80.0,
            grade: crate::analytics::Grade::B,
            trading_suitability: Suitability::Good,
            risk_level: RiskLevel::Low,
            indicators: QualityIndicators {
                stable_price: true,
                near_graduation: false,
                healthy_liquidity: true,
                anomaly_free: true,
            },
            warnings: vec![],
        }
    }

    fn high_growth() -> GrowthMetrics {
        GrowthMetrics {
            growth_rate_1h: 5.0,
            momentum: Momentum::High,
            accelerating: false,
        }
    }

    fn aim_token(address: &str) -> TokenRecord {
        let mut token = TokenRecord::placeholder(address, Utc::now());
        token.category = Category::Aim;
        token.market_cap = 45_000.0;
        token.liquidity = 15_000.0;
        token.holder_count = 200;
        token.top10_concentration = 20.0;
        token.safety_score = Some(85.0);
        token.safety_checked_at = Some(Utc::now());
        token
    }

    fn setup(
        quality: LiquidityQuality,
        growth: GrowthMetrics,
    ) -> (TempDir, Arc<BuySignalEngine>, Arc<Store>) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db"), 4).unwrap();
        let config = ConfigHandle::new(Settings::default());
        let events = EventBus::new(64);
        let engine = BuySignalEngine::new(
            config,
            store.clone(),
            Arc::new(StubAnalytics { quality, growth }),
            events,
        );
        (dir, engine, store)
    }

    #[test]
    fn happy_path_passes_with_low_risk() {
        let (_dir, engine, store) = setup(good_quality(), high_growth());
        store.insert_token(&aim_token("mintA")).unwrap();

        let evaluation = engine.evaluate("mintA").unwrap();
        assert!(evaluation.passed, "reasons: {:?}", evaluation.failure_reasons);
        assert!(
            (0.75..=0.90).contains(&evaluation.confidence),
            "confidence {}",
            evaluation.confidence
        );
        assert_eq!(evaluation.risk_level, RiskLevel::Low);
        assert!(
            (0.9..=1.5).contains(&evaluation.recommended_position),
            "position {}",
            evaluation.recommended_position
        );

        // side effects: one row, one attempt
        assert_eq!(store.count_buy_evaluations("mintA").unwrap(), 1);
        assert_eq!(store.get_token("mintA").unwrap().unwrap().buy_attempts, 1);
    }

    #[test]
    fn blacklisted_safety_score_fails() {
        let (_dir, engine, store) = setup(good_quality(), high_growth());
        let mut token = aim_token("mintB");
        token.safety_score = Some(90.0);
        store.insert_token(&token).unwrap();

        let evaluation = engine.evaluate("mintB").unwrap();
        assert!(!evaluation.passed);
        assert!(evaluation
            .failure_reasons
            .iter()
            .any(|r| r.contains("blacklisted")));
        assert_eq!(evaluation.recommended_position, 0.0);
    }

    #[test]
    fn stale_safety_score_fails() {
        let (_dir, engine, store) = setup(good_quality(), high_growth());
        let mut token = aim_token("mintC");
        token.safety_checked_at = Some(Utc::now() - ChronoDuration::hours(2));
        store.insert_token(&token).unwrap();

        let evaluation = engine.evaluate("mintC").unwrap();
        assert!(!evaluation.passed);
        assert!(evaluation.failure_reasons.iter().any(|r| r.contains("stale")));
    }

    #[test]
    fn not_in_aim_is_refused() {
        let (_dir, engine, store) = setup(good_quality(), high_growth());
        let mut token = aim_token("mintD");
        token.category = Category::High;
        store.insert_token(&token).unwrap();

        match engine.evaluate("mintD") {
            Err(EvaluateError::NotInAim(_, Category::High)) => {}
            other => panic!("expected NotInAim, got {other:?}"),
        }
        assert_eq!(store.count_buy_evaluations("mintD").unwrap(), 0);
    }

    #[test]
    fn attempt_budget_short_circuits() {
        let (_dir, engine, store) = setup(good_quality(), high_growth());
        let mut token = aim_token("mintE");
        token.buy_attempts = MAX_BUY_ATTEMPTS;
        store.insert_token(&token).unwrap();

        let evaluation = engine.evaluate("mintE").unwrap();
        assert!(!evaluation.passed);
        assert_eq!(evaluation.failure_reasons, vec!["max_attempts".to_string()]);
        assert_eq!(evaluation.recommended_position, 0.0);

        // no persistence, no attempt increment
        assert_eq!(store.count_buy_evaluations("mintE").unwrap(), 0);
        assert_eq!(
            store.get_token("mintE").unwrap().unwrap().buy_attempts,
            MAX_BUY_ATTEMPTS
        );
    }

    #[test]
    fn declining_momentum_fails_growth_criterion() {
        let (_dir, engine, store) = setup(
            good_quality(),
            GrowthMetrics {
                growth_rate_1h: -5.0,
                momentum: Momentum::Declining,
                accelerating: false,
            },
        );
        store.insert_token(&aim_token("mintF")).unwrap();

        let evaluation = engine.evaluate("mintF").unwrap();
        assert!(!evaluation.passed);
        assert!(!evaluation.criteria.liquidity_growth);
        assert!(evaluation
            .failure_reasons
            .iter()
            .any(|r| r.contains("declining")));
    }

    #[test]
    fn failure_reasons_accumulate_in_order() {
        let (_dir, engine, store) = setup(good_quality(), high_growth());
        let mut token = aim_token("mintG");
        token.market_cap = 20_000.0; // out of band
        token.liquidity = 1_000.0; // below minimum
        token.category = Category::Aim;
        store.insert_token(&token).unwrap();

        let evaluation = engine.evaluate("mintG").unwrap();
        assert!(evaluation.failure_reasons.len() >= 2);
        assert!(evaluation.failure_reasons[0].contains("market cap"));
        assert!(evaluation.failure_reasons[1].contains("liquidity"));
    }

    #[test]
    fn tiered_cap_takes_minimum() {
        let (_dir, engine, store) = setup(good_quality(), high_growth());
        let _ = store;

        let mut token = aim_token("mintH");
        token.safety_score = Some(90.0); // tier cap 1.0
        token.holder_count = 120; // tier cap 0.75
        token.top10_concentration = 30.0; // above max → 0.5
        assert_eq!(engine.tiered_position_cap(&token), 0.5);

        token.top10_concentration = 10.0;
        assert_eq!(engine.tiered_position_cap(&token), 0.75);

        token.safety_score = None; // floor 0.25
        assert_eq!(engine.tiered_position_cap(&token), 0.25);
    }

    #[test]
    fn position_size_clamps() {
        assert_eq!(position_size(Suitability::Risky, 0.1, RiskLevel::Extreme), 0.1);
        let high = position_size(Suitability::Excellent, 1.0, RiskLevel::Low);
        assert!(high <= 3.0);
        assert!((high - 1.8).abs() < 1e-9);
    }
}
