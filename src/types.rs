//! Domain types shared across the scanner pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle category of a tracked token
///
/// Driven by market capitalization; `Bin` and `Complete` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    /// Freshly discovered, not yet classified
    New,
    /// Market cap below the LOW threshold
    Low,
    /// Market cap between LOW and MEDIUM thresholds
    Medium,
    /// Market cap between MEDIUM and HIGH thresholds
    High,
    /// Inside the target buy band
    Aim,
    /// Inactive or decayed; may recover
    Archive,
    /// Abandoned, never revisited
    Bin,
    /// A buy was executed; tracking ends
    Complete,
}

impl Category {
    /// All variants in scheduling-priority order
    pub const ALL: [Category; 8] = [
        Category::Aim,
        Category::High,
        Category::Medium,
        Category::New,
        Category::Low,
        Category::Archive,
        Category::Bin,
        Category::Complete,
    ];

    /// Categories that receive scheduled scans
    pub const ACTIVE: [Category; 6] = [
        Category::Aim,
        Category::High,
        Category::Medium,
        Category::New,
        Category::Low,
        Category::Archive,
    ];

    /// Terminal categories never leave their state and are never scanned
    pub fn is_terminal(self) -> bool {
        matches!(self, Category::Bin | Category::Complete)
    }

    /// Storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            Category::New => "NEW",
            Category::Low => "LOW",
            Category::Medium => "MEDIUM",
            Category::High => "HIGH",
            Category::Aim => "AIM",
            Category::Archive => "ARCHIVE",
            Category::Bin => "BIN",
            Category::Complete => "COMPLETE",
        }
    }

    /// Parse the storage representation
    pub fn parse(s: &str) -> Option<Category> {
        match s {
            "NEW" => Some(Category::New),
            "LOW" => Some(Category::Low),
            "MEDIUM" => Some(Category::Medium),
            "HIGH" => Some(Category::High),
            "AIM" => Some(Category::Aim),
            "ARCHIVE" => Some(Category::Archive),
            "BIN" => Some(Category::Bin),
            "COMPLETE" => Some(Category::Complete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted token row
///
/// Field names match the `tokens` table columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Mint address, base58 string form of the 32-byte key
    pub address: String,

    // Human metadata
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub creator: Option<String>,
    pub launch_signature: Option<String>,
    pub launch_slot: Option<u64>,

    // Market snapshot
    pub current_price_sol: f64,
    pub current_price_usd: f64,
    pub market_cap: f64,
    pub liquidity: f64,
    pub volume_24h: f64,
    pub holder_count: u32,
    pub top10_concentration: f64,
    pub curve_progress: f64,

    // Security snapshot
    pub safety_score: Option<f64>,
    pub safety_checked_at: Option<DateTime<Utc>>,
    pub safety_flags: Vec<String>,

    // Lifecycle
    pub category: Category,
    pub previous_category: Option<Category>,
    pub category_updated_at: DateTime<Utc>,
    pub category_scan_count: u32,
    pub aim_attempts: u32,
    pub buy_attempts: u32,
    pub price_update_count: u64,
    pub last_price_update: Option<DateTime<Utc>>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub metadata_failed: bool,
}

impl TokenRecord {
    /// Placeholder row written before metadata enrichment arrives
    pub fn placeholder(address: &str, now: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            symbol: "LOADING...".to_string(),
            name: "LOADING...".to_string(),
            decimals: 6,
            creator: None,
            launch_signature: None,
            launch_slot: None,
            current_price_sol: 0.0,
            current_price_usd: 0.0,
            market_cap: 0.0,
            liquidity: 0.0,
            volume_24h: 0.0,
            holder_count: 0,
            top10_concentration: 0.0,
            curve_progress: 0.0,
            safety_score: None,
            safety_checked_at: None,
            safety_flags: Vec::new(),
            category: Category::New,
            previous_category: None,
            category_updated_at: now,
            category_scan_count: 0,
            aim_attempts: 0,
            buy_attempts: 0,
            price_update_count: 0,
            last_price_update: None,
            last_scan_at: None,
            discovered_at: now,
            metadata_failed: false,
        }
    }
}

/// Minimal record for a token observed for the first time on the stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewToken {
    pub address: String,
    pub creator: Option<String>,
    pub launch_signature: Option<String>,
    pub launch_slot: Option<u64>,
    pub discovered_at: DateTime<Utc>,
}

/// One decoded price observation, unique on `(token_address, time)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSample {
    pub token_address: String,
    pub time: DateTime<Utc>,
    pub price_usd: f64,
    pub price_sol: f64,
    pub virtual_sol_reserves: u64,
    pub virtual_token_reserves: u64,
    pub real_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub market_cap: f64,
    pub liquidity_usd: f64,
    pub slot: u64,
    pub source: String,
}

/// Transaction kind observed on the launchpad program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Create,
    Buy,
    Sell,
}

impl TxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TxKind::Create => "create",
            TxKind::Buy => "buy",
            TxKind::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<TxKind> {
        match s {
            "create" => Some(TxKind::Create),
            "buy" => Some(TxKind::Buy),
            "sell" => Some(TxKind::Sell),
            _ => None,
        }
    }
}

/// One decoded launchpad transaction, unique on `(signature, token, time)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub signature: String,
    pub token_address: String,
    pub time: DateTime<Utc>,
    pub kind: TxKind,
    pub user_address: String,
    pub token_amount: f64,
    pub sol_amount: f64,
    pub price_sol: f64,
    pub price_usd: f64,
    pub slot: u64,
    pub fee_lamports: u64,
}

/// Why a category transition happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum TransitionReason {
    /// Routine re-classification from a market-cap update
    MarketCapChange,
    /// Stream-side threshold crossing detected at ingest time
    MarketCapThreshold,
    /// Market cap dropped to zero
    ZeroMarketCap,
    /// Scan budget for the category exhausted
    ScanLimit,
    /// Category duration elapsed
    DurationTimeout,
    /// Archived token recovered above the LOW threshold
    Recovery,
    /// A buy was executed
    BuyExecuted,
    /// Operator-initiated move
    ManualOverride(String),
    /// Forced archival
    ForceArchive(String),
}

impl TransitionReason {
    /// Short tag persisted in the transitions table
    pub fn tag(&self) -> &'static str {
        match self {
            TransitionReason::MarketCapChange => "market_cap_change",
            TransitionReason::MarketCapThreshold => "market_cap_threshold",
            TransitionReason::ZeroMarketCap => "zero_market_cap",
            TransitionReason::ScanLimit => "scan_limit",
            TransitionReason::DurationTimeout => "duration_timeout",
            TransitionReason::Recovery => "recovery",
            TransitionReason::BuyExecuted => "buy_executed",
            TransitionReason::ManualOverride(_) => "manual_override",
            TransitionReason::ForceArchive(_) => "force_archive",
        }
    }
}

/// Append-only category transition log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryTransition {
    pub token_address: String,
    pub from_category: Category,
    pub to_category: Category,
    pub market_cap_at_transition: f64,
    pub reason: TransitionReason,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Market-data snapshot returned by the external provider during a scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub market_cap: Option<f64>,
    pub liquidity: Option<f64>,
    pub volume_24h: Option<f64>,
    pub holder_count: Option<u32>,
    pub top10_concentration: Option<f64>,
    pub safety_score: Option<f64>,
    pub safety_flags: Vec<String>,
}

/// Risk bucket shared by the quality scorer and the buy evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Extreme,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Extreme => "EXTREME",
        }
    }

    pub fn parse(s: &str) -> Option<RiskLevel> {
        match s {
            "LOW" => Some(RiskLevel::Low),
            "MEDIUM" => Some(RiskLevel::Medium),
            "HIGH" => Some(RiskLevel::High),
            "EXTREME" => Some(RiskLevel::Extreme),
            _ => None,
        }
    }
}

/// One completed (or failed) scan, persisted to `scan_logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanLogEntry {
    pub token_address: String,
    pub category: Category,
    pub scan_number: u32,
    pub duration_ms: u64,
    pub apis_used: Vec<String>,
    pub error: Option<String>,
    /// Whether this scan consumed the category's scan budget
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// Flat persisted form of a buy evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyEvaluationRow {
    pub id: uuid::Uuid,
    pub token_address: String,
    pub evaluated_at: DateTime<Utc>,
    pub passed: bool,
    pub failure_reasons: Vec<String>,
    /// Per-criterion pass flags, keyed by criterion name
    pub criteria: serde_json::Value,
    /// Observed values the criteria were judged against
    pub observed: serde_json::Value,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub recommended_position: f64,
    pub duration_ms: u64,
}

/// Metadata payload produced by the enrichment providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub creator: Option<String>,
    pub holder_count: Option<u32>,
    pub top10_concentration: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trip() {
        for cat in Category::ALL {
            assert_eq!(Category::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(Category::parse("GARBAGE"), None);
    }

    #[test]
    fn terminal_categories() {
        assert!(Category::Bin.is_terminal());
        assert!(Category::Complete.is_terminal());
        for cat in Category::ACTIVE {
            assert!(!cat.is_terminal());
        }
    }

    #[test]
    fn tx_kind_round_trip() {
        for kind in [TxKind::Create, TxKind::Buy, TxKind::Sell] {
            assert_eq!(TxKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn transition_reason_tags() {
        assert_eq!(TransitionReason::MarketCapChange.tag(), "market_cap_change");
        assert_eq!(
            TransitionReason::ManualOverride("ops".into()).tag(),
            "manual_override"
        );
    }

    #[test]
    fn placeholder_has_loading_symbol() {
        let row =
            TokenRecord::placeholder("So11111111111111111111111111111111111111112", Utc::now());
        assert_eq!(row.symbol, "LOADING...");
        assert_eq!(row.category, Category::New);
        assert_eq!(row.buy_attempts, 0);
    }
}
