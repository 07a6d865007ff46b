//! Bonding-curve launchpad scanner library
//!
//! Ingests the launchpad firehose, classifies every token into a
//! market-cap-driven lifecycle category, re-scans each category at its own
//! cadence, and emits gated buy signals for tokens in the target band.

pub mod analytics;
pub mod buy_engine;
pub mod category;
pub mod config;
pub mod curve;
pub mod endpoints;
pub mod enrichment;
pub mod errors;
pub mod events;
pub mod ingest;
pub mod metrics;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use config::{ConfigHandle, Settings};
pub use errors::EngineError;
pub use events::{EngineEvent, EventBus};
pub use storage::Store;
pub use types::Category;
