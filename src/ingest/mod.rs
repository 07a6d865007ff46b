//! Stream ingestion
//!
//! Consumes the launchpad firehose through the [`StreamSource`] contract
//! edge, decodes account and transaction updates, and feeds the ingest
//! buffers. The gRPC client library itself lives behind the trait; this
//! module owns everything from decoded bytes to the flush.

pub mod batcher;
pub mod decoder;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::category::CategoryManager;
use crate::config::ConfigHandle;
use crate::curve;
use crate::errors::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::metrics;
use crate::storage::Store;
use crate::types::{NewToken, TokenTransaction, TxKind};

use batcher::IngestBuffers;
use decoder::{BondingCurveAccount, COMPLETE_FLAG_OFFSET, PROGRAM_ID};

/// Pause between redials after a stream error or end
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Poll cadence while ingress is paused on back-pressure
const BACKPRESSURE_POLL: Duration = Duration::from_millis(100);

/// Memcmp filter on raw account bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemcmpFilter {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

/// Account subscription filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountsFilter {
    pub owners: Vec<String>,
    pub filters: Vec<MemcmpFilter>,
}

/// Transaction subscription filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionsFilter {
    pub vote: bool,
    pub failed: bool,
    pub account_include: Vec<String>,
    pub account_exclude: Vec<String>,
    pub account_required: Vec<String>,
}

/// Commitment level requested from the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

/// Full subscription request, re-sent on every connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub accounts: HashMap<String, AccountsFilter>,
    pub transactions: HashMap<String, TransactionsFilter>,
    pub commitment: Commitment,
}

/// The scanner's standing subscription: active bonding curves (complete
/// flag byte zero) plus non-vote, non-failed program transactions at
/// confirmed commitment
pub fn subscription_request() -> SubscriptionRequest {
    SubscriptionRequest {
        accounts: HashMap::from([(
            "pumpBondingCurves".to_string(),
            AccountsFilter {
                owners: vec![PROGRAM_ID.to_string()],
                filters: vec![MemcmpFilter {
                    offset: COMPLETE_FLAG_OFFSET,
                    bytes: vec![0x00],
                }],
            },
        )]),
        transactions: HashMap::from([(
            "pumpFun".to_string(),
            TransactionsFilter {
                vote: false,
                failed: false,
                account_include: vec![PROGRAM_ID.to_string()],
                account_exclude: vec![],
                account_required: vec![],
            },
        )]),
        commitment: Commitment::Confirmed,
    }
}

/// One decoded transaction notification off the stream
///
/// Account keys follow the launchpad convention: token mint first, fee
/// payer second.
#[derive(Debug, Clone)]
pub struct TransactionUpdate {
    pub signature: String,
    pub slot: u64,
    pub logs: Vec<String>,
    pub instruction_data: Bytes,
    pub accounts: SmallVec<[String; 8]>,
    pub sol_amount: f64,
    pub token_amount: f64,
    pub fee_lamports: u64,
}

/// Updates delivered by a stream source
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Account {
        pubkey: String,
        data: Bytes,
        slot: u64,
    },
    Transaction(TransactionUpdate),
    /// External price service emission
    SolPrice(f64),
}

/// Contract edge for the gRPC client library
///
/// Implementations own dialing, authentication, write-ack timeouts, and
/// wire decoding down to [`StreamUpdate`]. `next_update` returning `None`
/// means the stream ended; the manager redials.
#[async_trait]
pub trait StreamSource: Send {
    async fn connect(&mut self, request: &SubscriptionRequest) -> Result<(), EngineError>;
    async fn next_update(&mut self) -> Option<StreamUpdate>;
}

/// Scripted source for tests and local development
pub struct MockStreamSource {
    updates: std::collections::VecDeque<StreamUpdate>,
    connected: bool,
}

impl MockStreamSource {
    pub fn new(updates: Vec<StreamUpdate>) -> Self {
        Self {
            updates: updates.into(),
            connected: false,
        }
    }
}

#[async_trait]
impl StreamSource for MockStreamSource {
    async fn connect(&mut self, _request: &SubscriptionRequest) -> Result<(), EngineError> {
        self.connected = true;
        Ok(())
    }

    async fn next_update(&mut self) -> Option<StreamUpdate> {
        self.updates.pop_front()
    }
}

/// Build a stream source from the configured mode
///
/// `mock` yields a scripted, empty source for development and tests. A
/// production deployment registers its Geyser gRPC adapter here; the
/// adapter owns the tonic channel and converts `SubscribeUpdate` frames
/// into [`StreamUpdate`] values:
///
/// ```ignore
/// let channel = Channel::from_shared(endpoint)?.connect().await?;
/// let mut client = GeyserClient::new(channel);
/// let stream = client.subscribe(request.into_proto()).await?.into_inner();
/// ```
pub fn create_stream_source(
    mode: &str,
    endpoint: &str,
) -> Result<Box<dyn StreamSource>, EngineError> {
    match mode {
        "mock" => {
            warn!(endpoint, "mock stream source selected; no live data will arrive");
            Ok(Box::new(MockStreamSource::new(Vec::new())))
        }
        other => Err(EngineError::Config(format!(
            "unknown stream mode {other:?}; register a geyser adapter or use \"mock\""
        ))),
    }
}

/// Owns stream consumption and the ingest buffers
pub struct StreamManager {
    config: Arc<ConfigHandle>,
    store: Arc<Store>,
    manager: Arc<CategoryManager>,
    events: EventBus,
    buffers: Arc<IngestBuffers>,
    mint_to_curve: DashMap<String, String>,
    curve_to_mint: DashMap<String, String>,
    enrich_tx: mpsc::UnboundedSender<String>,
    eval_tx: mpsc::Sender<String>,
}

impl StreamManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigHandle>,
        store: Arc<Store>,
        manager: Arc<CategoryManager>,
        events: EventBus,
        buffers: Arc<IngestBuffers>,
        enrich_tx: mpsc::UnboundedSender<String>,
        eval_tx: mpsc::Sender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            manager,
            events,
            buffers,
            mint_to_curve: DashMap::new(),
            curve_to_mint: DashMap::new(),
            enrich_tx,
            eval_tx,
        })
    }

    /// Translate a curve account address to its mint, O(1)
    pub fn mint_for_curve(&self, curve: &str) -> Option<String> {
        self.curve_to_mint.get(curve).map(|e| e.value().clone())
    }

    /// Translate a mint to its curve account address, O(1)
    pub fn curve_for_mint(&self, mint: &str) -> Option<String> {
        self.mint_to_curve.get(mint).map(|e| e.value().clone())
    }

    /// Seed the SOL→USD reference from the most recent history row
    pub fn seed_sol_price(&self) {
        match self.store.latest_sol_price() {
            Ok(Some(price)) => {
                curve::set_sol_price_usd(price);
                info!(price, "SOL price seeded from history");
            }
            Ok(None) => {
                let fallback = self.config.load().sol_price_usd;
                curve::set_sol_price_usd(fallback);
                info!(price = fallback, "SOL price seeded from configuration");
            }
            Err(e) => warn!(error = %e, "SOL price seed failed, keeping default"),
        }
    }

    /// Consume the stream until shutdown, redialing on error or end
    pub async fn run(
        self: Arc<Self>,
        mut source: Box<dyn StreamSource>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let request = subscription_request();
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = source.connect(&request).await {
                metrics::metrics().stream_reconnects_total.inc();
                warn!(error = %e, "stream connect failed, redialing in 5s");
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    _ = shutdown.changed() => break,
                }
            }
            info!("stream connected");

            loop {
                // back-pressure: stop pulling while any buffer is past its
                // limit; the flush ticker drains it
                while self.buffers.over_limit() {
                    metrics::metrics().backpressure_pauses_total.inc();
                    tokio::select! {
                        _ = tokio::time::sleep(BACKPRESSURE_POLL) => {}
                        _ = shutdown.changed() => return,
                    }
                }

                tokio::select! {
                    update = source.next_update() => match update {
                        Some(update) => self.handle_update(update).await,
                        None => break,
                    },
                    _ = shutdown.changed() => return,
                }
            }

            metrics::metrics().stream_reconnects_total.inc();
            warn!("stream ended, redialing in 5s");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("stream manager stopped");
    }

    pub async fn handle_update(&self, update: StreamUpdate) {
        metrics::metrics().stream_updates_total.inc();
        match update {
            StreamUpdate::Account { pubkey, data, slot } => {
                self.handle_account(&pubkey, &data, slot).await;
            }
            StreamUpdate::Transaction(tx) => self.handle_transaction(tx).await,
            StreamUpdate::SolPrice(price) => self.handle_sol_price(price),
        }
    }

    async fn handle_account(&self, curve_pubkey: &str, data: &[u8], slot: u64) {
        let account = match BondingCurveAccount::decode(data) {
            Ok(account) => account,
            Err(e) => {
                metrics::metrics().record_error("decode");
                debug!(curve = curve_pubkey, error = %e, "account decode skipped");
                return;
            }
        };
        if account.complete {
            // graduated curves drop off the subscription; ignore stragglers
            return;
        }

        let mint = account.token_mint.to_string();
        self.mint_to_curve
            .insert(mint.clone(), curve_pubkey.to_string());
        self.curve_to_mint
            .insert(curve_pubkey.to_string(), mint.clone());

        self.events.publish(EngineEvent::DualAddressUpdate {
            mint: mint.clone(),
            curve: curve_pubkey.to_string(),
            slot,
        });
        self.events.publish(EngineEvent::AccountUpdate {
            curve: curve_pubkey.to_string(),
            slot,
        });

        let now = Utc::now();
        let sample = account.to_price_sample(slot, now);
        let market_cap = sample.market_cap;

        let should_flush = self.buffers.push_price(sample.clone());
        if should_flush {
            let placeholders = self.flush_now();
            self.enqueue_metadata(placeholders);
        }

        // per-price side effects run outside any flush transaction
        if let Err(e) = self.store.update_token_price(
            &mint,
            sample.price_sol,
            sample.price_usd,
            market_cap,
            sample.liquidity_usd,
            curve::state_at_market_cap(market_cap).progress,
            now,
        ) {
            debug!(token = %mint, error = %e, "direct price upsert failed");
        }

        let settings = self.config.load();
        let persisted = match self.manager.cached_category(&mint) {
            Some(category) => Some(category),
            None => self
                .store
                .get_token(&mint)
                .ok()
                .flatten()
                .map(|row| row.category),
        };
        if let Some(persisted) = persisted {
            let implied = settings.thresholds.bracket(market_cap);
            if implied != persisted {
                self.manager
                    .update_market_cap_from_stream(&mint, market_cap)
                    .await;
            }
        }

        if market_cap >= settings.thresholds.aim_min && market_cap <= settings.thresholds.aim_max {
            if let Err(e) = self.eval_tx.try_send(mint.clone()) {
                debug!(token = %mint, error = %e, "evaluation queue full, skipping");
            }
        }
    }

    async fn handle_transaction(&self, tx: TransactionUpdate) {
        let Some(kind) = decoder::classify(&tx.logs, &tx.instruction_data) else {
            debug!(signature = %tx.signature, "unclassifiable transaction skipped");
            return;
        };
        let Some(mint) = tx.accounts.first().cloned() else {
            debug!(signature = %tx.signature, "transaction without accounts skipped");
            return;
        };
        let user = tx.accounts.get(1).cloned().unwrap_or_default();
        let now = Utc::now();

        match kind {
            TxKind::Create => {
                metrics::metrics().tokens_created_total.inc();
                let should_flush = self.buffers.push_new_token(NewToken {
                    address: mint.clone(),
                    creator: tx.accounts.get(1).cloned(),
                    launch_signature: Some(tx.signature.clone()),
                    launch_slot: Some(tx.slot),
                    discovered_at: now,
                });
                if should_flush {
                    let placeholders = self.flush_now();
                    self.enqueue_metadata(placeholders);
                }
                // symbol and name stay placeholders until enrichment lands
                self.enqueue_metadata(vec![mint.clone()]);
                self.events.publish(EngineEvent::TokenCreated {
                    address: mint,
                    creator: tx.accounts.get(1).cloned(),
                    signature: Some(tx.signature),
                    slot: tx.slot,
                });
            }
            TxKind::Buy | TxKind::Sell => {
                // only transactions for tokens we have seen a curve for
                let known = self.mint_to_curve.contains_key(&mint)
                    || self.manager.cached_category(&mint).is_some();
                if !known {
                    debug!(token = %mint, "transaction for unknown token skipped");
                    return;
                }

                let price_sol = if tx.token_amount > 0.0 {
                    tx.sol_amount / tx.token_amount
                } else {
                    0.0
                };
                let record = TokenTransaction {
                    signature: tx.signature,
                    token_address: mint,
                    time: now,
                    kind,
                    user_address: user,
                    token_amount: tx.token_amount,
                    sol_amount: tx.sol_amount,
                    price_sol,
                    price_usd: price_sol * curve::sol_price_usd(),
                    slot: tx.slot,
                    fee_lamports: tx.fee_lamports,
                };
                if self.buffers.push_transaction(record) {
                    let placeholders = self.flush_now();
                    self.enqueue_metadata(placeholders);
                }
            }
        }
    }

    fn handle_sol_price(&self, price: f64) {
        curve::set_sol_price_usd(price);
        if let Err(e) = self.store.record_sol_price(price, "price_service") {
            warn!(error = %e, "SOL price history append failed");
        }
        self.events.publish(EngineEvent::SolPriceUpdated {
            price_usd: price,
            at: Utc::now(),
        });
    }

    /// Immediate flush on a full buffer; errors were already reported
    fn flush_now(&self) -> Vec<String> {
        self.buffers
            .flush(&self.store, &self.events)
            .unwrap_or_default()
    }

    fn enqueue_metadata(&self, addresses: Vec<String>) {
        for address in addresses {
            if self.enrich_tx.send(address).is_err() {
                debug!("enrichment queue closed");
                return;
            }
        }
    }

    /// Spawn the periodic flush ticker
    pub fn spawn_flush_ticker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let interval = Duration::from_millis(manager.config.load().ingest.flush_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let placeholders = manager.flush_now();
                        manager.enqueue_metadata(placeholders);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("flush ticker stopped");
        })
    }

    /// Drain whatever is buffered; the shutdown sequence's final write
    pub fn final_flush(&self) {
        let placeholders = self.flush_now();
        self.enqueue_metadata(placeholders);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use solana_sdk::pubkey::Pubkey;
    use tempfile::TempDir;

    fn encode_account(account: &BondingCurveAccount) -> Bytes {
        let mut data = Vec::with_capacity(decoder::ACCOUNT_LEN);
        data.extend_from_slice(&account.discriminator.to_le_bytes());
        data.extend_from_slice(&account.virtual_token_reserves.to_le_bytes());
        data.extend_from_slice(&account.virtual_sol_reserves.to_le_bytes());
        data.extend_from_slice(&account.real_token_reserves.to_le_bytes());
        data.extend_from_slice(&account.real_sol_reserves.to_le_bytes());
        data.extend_from_slice(&account.token_total_supply.to_le_bytes());
        data.push(account.complete as u8);
        data.extend_from_slice(account.token_mint.as_ref());
        Bytes::from(data)
    }

    struct Harness {
        _dir: TempDir,
        stream: Arc<StreamManager>,
        store: Arc<Store>,
        enrich_rx: mpsc::UnboundedReceiver<String>,
        _eval_rx: mpsc::Receiver<String>,
    }

    fn setup() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db"), 4).unwrap();
        let config = ConfigHandle::new(Settings::default());
        let events = EventBus::new(256);
        let manager = CategoryManager::new(config.clone(), store.clone(), events.clone());
        let buffers = Arc::new(IngestBuffers::new(100));
        let (enrich_tx, enrich_rx) = mpsc::unbounded_channel();
        let (eval_tx, eval_rx) = mpsc::channel(64);
        let stream = StreamManager::new(
            config,
            store.clone(),
            manager,
            events,
            buffers,
            enrich_tx,
            eval_tx,
        );
        Harness {
            _dir: dir,
            stream,
            store,
            enrich_rx,
            _eval_rx: eval_rx,
        }
    }

    #[test]
    fn subscription_request_shape() {
        let request = subscription_request();
        let accounts = &request.accounts["pumpBondingCurves"];
        assert_eq!(accounts.owners, vec![PROGRAM_ID.to_string()]);
        assert_eq!(accounts.filters[0].offset, COMPLETE_FLAG_OFFSET);
        assert_eq!(accounts.filters[0].bytes, vec![0x00]);

        let transactions = &request.transactions["pumpFun"];
        assert!(!transactions.vote);
        assert!(!transactions.failed);
        assert_eq!(transactions.account_include, vec![PROGRAM_ID.to_string()]);
        assert!(transactions.account_exclude.is_empty());
        assert_eq!(request.commitment, Commitment::Confirmed);
    }

    #[tokio::test]
    async fn account_update_maintains_dual_maps() {
        let harness = setup();
        let mint = Pubkey::new_unique();
        let account = BondingCurveAccount {
            discriminator: 1,
            virtual_token_reserves: 1_000_000_000_000_000,
            virtual_sol_reserves: 30_000_000_000,
            real_token_reserves: 700_000_000_000_000,
            real_sol_reserves: 2_000_000_000,
            token_total_supply: 1_000_000_000_000_000,
            complete: false,
            token_mint: mint,
        };

        harness
            .stream
            .handle_update(StreamUpdate::Account {
                pubkey: "curve111".to_string(),
                data: encode_account(&account),
                slot: 7,
            })
            .await;

        assert_eq!(
            harness.stream.mint_for_curve("curve111"),
            Some(mint.to_string())
        );
        assert_eq!(
            harness.stream.curve_for_mint(&mint.to_string()),
            Some("curve111".to_string())
        );
    }

    #[tokio::test]
    async fn completed_curves_are_ignored() {
        let harness = setup();
        let account = BondingCurveAccount {
            discriminator: 1,
            virtual_token_reserves: 1_000_000_000_000_000,
            virtual_sol_reserves: 30_000_000_000,
            real_token_reserves: 0,
            real_sol_reserves: 0,
            token_total_supply: 1_000_000_000_000_000,
            complete: true,
            token_mint: Pubkey::new_unique(),
        };
        harness
            .stream
            .handle_update(StreamUpdate::Account {
                pubkey: "curve222".to_string(),
                data: encode_account(&account),
                slot: 9,
            })
            .await;
        assert!(harness.stream.mint_for_curve("curve222").is_none());
    }

    #[tokio::test]
    async fn create_transaction_enqueues_metadata() {
        let mut harness = setup();
        let mint = Pubkey::new_unique().to_string();
        harness
            .stream
            .handle_update(StreamUpdate::Transaction(TransactionUpdate {
                signature: "sig-create".to_string(),
                slot: 11,
                logs: vec!["Program log: Instruction: Create".to_string()],
                instruction_data: Bytes::new(),
                accounts: SmallVec::from_vec(vec![mint.clone(), "creator".to_string()]),
                sol_amount: 0.0,
                token_amount: 0.0,
                fee_lamports: 5_000,
            }))
            .await;

        assert_eq!(harness.enrich_rx.try_recv().unwrap(), mint);
    }

    #[tokio::test]
    async fn unknown_token_transactions_are_dropped() {
        let harness = setup();
        harness
            .stream
            .handle_update(StreamUpdate::Transaction(TransactionUpdate {
                signature: "sig-buy".to_string(),
                slot: 12,
                logs: vec!["Program log: Instruction: Buy".to_string()],
                instruction_data: Bytes::new(),
                accounts: SmallVec::from_vec(vec!["unknown-mint".to_string(), "user".to_string()]),
                sol_amount: 0.25,
                token_amount: 10_000.0,
                fee_lamports: 5_000,
            }))
            .await;
        // nothing buffered
        harness.stream.final_flush();
        let stored = harness.store.recent_prices("unknown-mint", 10).unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn sol_price_update_lands_in_history() {
        let harness = setup();
        harness
            .stream
            .handle_update(StreamUpdate::SolPrice(187.5))
            .await;
        assert_eq!(harness.store.latest_sol_price().unwrap(), Some(187.5));
        assert_eq!(curve::sol_price_usd(), 187.5);
        curve::set_sol_price_usd(curve::DEFAULT_SOL_PRICE_USD);
    }
}
