//! Ingest buffers and the transactional flush
//!
//! Three buffers — prices, transactions, new tokens — owned exclusively by
//! the stream manager until flush time. A flush drains all three into one
//! storage transaction; on failure the batch is discarded so the buffers
//! can never grow without bound.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::errors::EngineError;
use crate::events::{EngineEvent, EventBus, FlushCounts};
use crate::metrics;
use crate::storage::Store;
use crate::types::{NewToken, PriceSample, TokenTransaction};

/// Ingress pauses when any buffer exceeds this multiple of the batch size
const BACKPRESSURE_FACTOR: usize = 5;

/// The three ingest buffers behind one lock each
pub struct IngestBuffers {
    batch_size: usize,
    prices: Mutex<Vec<PriceSample>>,
    transactions: Mutex<Vec<TokenTransaction>>,
    new_tokens: Mutex<HashMap<String, NewToken>>,
}

impl IngestBuffers {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            prices: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            new_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer a price; returns true when the buffer hit the batch size
    pub fn push_price(&self, price: PriceSample) -> bool {
        metrics::metrics().prices_buffered_total.inc();
        let mut prices = self.prices.lock();
        prices.push(price);
        metrics::metrics().buffered_prices.set(prices.len() as i64);
        prices.len() >= self.batch_size
    }

    /// Buffer a non-create transaction; returns true at the batch size
    pub fn push_transaction(&self, tx: TokenTransaction) -> bool {
        metrics::metrics().transactions_buffered_total.inc();
        let mut transactions = self.transactions.lock();
        transactions.push(tx);
        metrics::metrics()
            .buffered_transactions
            .set(transactions.len() as i64);
        transactions.len() >= self.batch_size
    }

    /// Buffer a newly created token, keyed so repeats collapse
    pub fn push_new_token(&self, token: NewToken) -> bool {
        let mut new_tokens = self.new_tokens.lock();
        new_tokens.insert(token.address.clone(), token);
        new_tokens.len() >= self.batch_size
    }

    /// Whether ingress should pause until the next flush
    pub fn over_limit(&self) -> bool {
        let limit = self.batch_size * BACKPRESSURE_FACTOR;
        self.prices.lock().len() > limit
            || self.transactions.lock().len() > limit
            || self.new_tokens.lock().len() > limit
    }

    pub fn depths(&self) -> (usize, usize, usize) {
        (
            self.prices.lock().len(),
            self.transactions.lock().len(),
            self.new_tokens.lock().len(),
        )
    }

    /// Drain all buffers, leaving them empty
    fn drain(&self) -> (Vec<NewToken>, Vec<PriceSample>, Vec<TokenTransaction>) {
        let new_tokens: Vec<NewToken> =
            std::mem::take(&mut *self.new_tokens.lock()).into_values().collect();
        let prices = std::mem::take(&mut *self.prices.lock());
        let transactions = std::mem::take(&mut *self.transactions.lock());
        metrics::metrics().buffered_prices.set(0);
        metrics::metrics().buffered_transactions.set(0);
        (new_tokens, prices, transactions)
    }

    /// Flush everything buffered in one storage transaction
    ///
    /// Transient failures get one retry; a second failure discards the
    /// batch. Returns the placeholder addresses inserted so the caller can
    /// enqueue metadata fetches for them.
    pub fn flush(&self, store: &Store, events: &EventBus) -> Result<Vec<String>, EngineError> {
        let (new_tokens, prices, transactions) = self.drain();
        let timer = metrics::Timer::start();

        let attempt = store.flush_batch(&new_tokens, &prices, &transactions);
        let result = match attempt {
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "flush transient failure, retrying once");
                store.flush_batch(&new_tokens, &prices, &transactions)
            }
            other => other,
        };

        match result {
            Ok((counts, placeholders)) => {
                let duration_ms = timer.elapsed_ms();
                metrics::metrics().record_flush(true);
                metrics::metrics()
                    .flush_duration
                    .observe(duration_ms as f64 / 1_000.0);
                if counts != FlushCounts::default() {
                    info!(
                        new_tokens = counts.new_tokens,
                        prices = counts.prices,
                        transactions = counts.transactions,
                        placeholders = counts.placeholders,
                        duration_ms,
                        "batch flushed"
                    );
                }
                events.publish(EngineEvent::Flushed { counts, duration_ms });
                Ok(placeholders)
            }
            Err(e) => {
                // batch is gone; losing it beats unbounded buffers
                let discarded = FlushCounts {
                    new_tokens: new_tokens.len(),
                    prices: prices.len(),
                    transactions: transactions.len(),
                    placeholders: 0,
                };
                metrics::metrics().record_flush(false);
                metrics::metrics().record_error(e.class());
                error!(error = %e, ?discarded, "flush failed, batch discarded");
                events.publish(EngineEvent::FlushFailed {
                    error: e.to_string(),
                    discarded,
                });
                if metrics::metrics().flush_saturated() {
                    error!(
                        rate = metrics::metrics().flush_error_rate(),
                        "flush error rate saturated over the last 5 minutes"
                    );
                }
                Err(e)
            }
        }
    }
}
