//! Engine event union and broadcast bus
//!
//! Every cross-component notification travels as one tagged variant so
//! consumers match exhaustively instead of registering string-keyed
//! callbacks. Delivery is best-effort: a bus with no subscribers drops
//! events silently, and lagging subscribers lose the oldest entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Category, TransitionReason};

/// Counts reported by a completed flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushCounts {
    pub new_tokens: usize,
    pub prices: usize,
    pub transactions: usize,
    pub placeholders: usize,
}

/// All cross-component notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A create instruction was observed for an unseen token
    TokenCreated {
        address: String,
        creator: Option<String>,
        signature: Option<String>,
        slot: u64,
    },
    /// Bonding-curve account update with both address forms resolved
    DualAddressUpdate {
        mint: String,
        curve: String,
        slot: u64,
    },
    /// Legacy single-address account update
    AccountUpdate { curve: String, slot: u64 },
    /// A category transition committed
    CategoryChanged {
        address: String,
        from: Category,
        to: Category,
        market_cap: f64,
        reason: TransitionReason,
    },
    /// A token entered the AIM band
    AimEntered {
        address: String,
        market_cap: f64,
        aim_attempts: u32,
    },
    /// A batch flush committed
    Flushed {
        counts: FlushCounts,
        duration_ms: u64,
    },
    /// A batch flush failed and the buffers were discarded
    FlushFailed { error: String, discarded: FlushCounts },
    /// A scheduled scan reported an error
    ScanFailed {
        address: String,
        category: Category,
        error: String,
    },
    /// A token exceeded its category duration and left the scan queues
    TokenTimeout { address: String, category: Category },
    /// Metadata enrichment completed for a token
    TokenEnriched { address: String, symbol: String },
    /// The external price service reported a new SOL→USD reference
    SolPriceUpdated { price_usd: f64, at: DateTime<Utc> },
    /// A buy evaluation passed the gate
    BuySignal {
        address: String,
        confidence: f64,
        recommended_position: f64,
    },
}

impl EngineEvent {
    /// Short name for logging and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenCreated { .. } => "token_created",
            Self::DualAddressUpdate { .. } => "dual_address_update",
            Self::AccountUpdate { .. } => "account_update",
            Self::CategoryChanged { .. } => "category_changed",
            Self::AimEntered { .. } => "aim_entered",
            Self::Flushed { .. } => "flushed",
            Self::FlushFailed { .. } => "flush_failed",
            Self::ScanFailed { .. } => "scan_failed",
            Self::TokenTimeout { .. } => "token_timeout",
            Self::TokenEnriched { .. } => "token_enriched",
            Self::SolPriceUpdated { .. } => "sol_price_updated",
            Self::BuySignal { .. } => "buy_signal",
        }
    }
}

/// Cloneable broadcast handle for engine events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; silently dropped when nobody listens
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(kind = event.kind(), "engine event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::AccountUpdate {
            curve: "curve".into(),
            slot: 42,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::AccountUpdate { curve, slot } => {
                assert_eq!(curve, "curve");
                assert_eq!(slot, 42);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(16);
        bus.publish(EngineEvent::SolPriceUpdated {
            price_usd: 180.0,
            at: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_kinds() {
        let event = EngineEvent::TokenTimeout {
            address: "a".into(),
            category: Category::Low,
        };
        assert_eq!(event.kind(), "token_timeout");
    }
}
