//! Bonding-curve math
//!
//! Pure mapping between market capitalization and curve state: price per
//! token, tokens sold, SOL raised, progress toward graduation. The only
//! mutable piece is the module-scoped SOL→USD reference price.

use std::sync::atomic::{AtomicU64, Ordering};

/// Exponential price model coefficient: `price_per_10M = A * exp(B * mc)`
pub const PRICE_MODEL_A: f64 = 0.6015;
/// Exponential price model exponent
pub const PRICE_MODEL_B: f64 = 3.606e-5;

/// Market cap at launch, zero tokens sold
pub const INITIAL_MC: f64 = 4_000.0;
/// Market cap at graduation, full on-curve supply sold
pub const GRADUATION_MC: f64 = 69_000.0;
/// Tokens available on the curve (whole tokens)
pub const CURVE_SUPPLY: f64 = 800_000_000.0;
/// SOL raised (in USD) over the full curve
pub const TOTAL_RAISE_USD: f64 = 12_000.0;

/// Default SOL→USD reference used before any refresh arrives
pub const DEFAULT_SOL_PRICE_USD: f64 = 180.0;

/// Atomic f64 via bit representation, lock-free for the hot path
struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    #[inline(always)]
    fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline(always)]
    fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

static SOL_PRICE_USD: once_cell::sync::Lazy<AtomicF64> =
    once_cell::sync::Lazy::new(|| AtomicF64::new(DEFAULT_SOL_PRICE_USD));

/// Current SOL→USD reference price
pub fn sol_price_usd() -> f64 {
    SOL_PRICE_USD.load()
}

/// Replace the SOL→USD reference price
///
/// Non-positive values are ignored; a zero reference would poison every
/// SOL-denominated price downstream.
pub fn set_sol_price_usd(price: f64) {
    if price > 0.0 && price.is_finite() {
        SOL_PRICE_USD.store(price);
    }
}

/// Price per token at a given market cap
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePrice {
    pub usd_per_token: f64,
    pub sol_per_token: f64,
}

/// Aggregate curve snapshot at a given market cap
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveState {
    pub market_cap_usd: f64,
    pub price: CurvePrice,
    pub tokens_sold: f64,
    pub sol_raised_usd: f64,
    /// Fraction of the curve consumed, in [0, 1]
    pub progress: f64,
    pub is_graduated: bool,
    /// USD market cap still needed to graduate; zero once graduated
    pub distance_to_graduation: f64,
}

/// USD and SOL price per token from the exponential model
pub fn price_at_market_cap(mc_usd: f64) -> CurvePrice {
    let mc = mc_usd.max(0.0);
    let price_per_10m = PRICE_MODEL_A * (PRICE_MODEL_B * mc).exp();
    let usd_per_token = price_per_10m / 10_000_000.0;
    CurvePrice {
        usd_per_token,
        sol_per_token: usd_per_token / sol_price_usd(),
    }
}

/// Linear progress fraction between the initial and graduation market caps
///
/// Clamped to zero below `INITIAL_MC` and to one above `GRADUATION_MC`.
fn progress_at(mc_usd: f64) -> f64 {
    ((mc_usd - INITIAL_MC) / (GRADUATION_MC - INITIAL_MC)).clamp(0.0, 1.0)
}

/// Whole tokens sold off the curve at a given market cap
pub fn tokens_sold_at_market_cap(mc_usd: f64) -> f64 {
    progress_at(mc_usd) * CURVE_SUPPLY
}

/// USD raised by the curve at a given market cap
pub fn raised_at_market_cap(mc_usd: f64) -> f64 {
    progress_at(mc_usd) * TOTAL_RAISE_USD
}

/// Full curve snapshot at a given market cap
pub fn state_at_market_cap(mc_usd: f64) -> CurveState {
    let progress = progress_at(mc_usd);
    let is_graduated = mc_usd >= GRADUATION_MC;
    CurveState {
        market_cap_usd: mc_usd,
        price: price_at_market_cap(mc_usd),
        tokens_sold: progress * CURVE_SUPPLY,
        sol_raised_usd: progress * TOTAL_RAISE_USD,
        progress,
        is_graduated,
        distance_to_graduation: if is_graduated {
            0.0
        } else {
            GRADUATION_MC - mc_usd
        },
    }
}
