//! Category manager
//!
//! Sole owner of the live state machines and the last-observed-category
//! cache. Every event for a token funnels through that token's lock, so
//! transitions stay total-ordered without a global lock. Transition
//! persistence is atomic: the token row update and the transition log row
//! commit together, and the change event fires only after the commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHandle;
use crate::errors::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::storage::Store;
use crate::types::{Category, CategoryTransition, TransitionReason};

use super::state_machine::{CategoryEvent, TokenStateMachine};

/// Rehydrate page size
const REHYDRATE_PAGE: usize = 1_000;
/// Pause between rehydrate pages so startup does not starve the pool
const REHYDRATE_PAGE_DELAY: Duration = Duration::from_millis(100);
/// Tokens older than this are not rehydrated
const REHYDRATE_MAX_AGE_DAYS: i64 = 7;
/// Bulk market-cap updates are processed in chunks of this size
const BULK_CHUNK: usize = 10;
const BULK_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Owns the set of live automata and routes events into them
pub struct CategoryManager {
    config: Arc<ConfigHandle>,
    store: Arc<Store>,
    events: EventBus,
    machines: DashMap<String, Arc<Mutex<TokenStateMachine>>>,
    state_cache: DashMap<String, Category>,
}

impl CategoryManager {
    pub fn new(config: Arc<ConfigHandle>, store: Arc<Store>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            events,
            machines: DashMap::new(),
            state_cache: DashMap::new(),
        })
    }

    /// Number of live machines
    pub fn active_count(&self) -> usize {
        self.machines.len()
    }

    /// Last observed category for a token, if it is live
    pub fn cached_category(&self, token: &str) -> Option<Category> {
        self.state_cache.get(token).map(|entry| *entry.value())
    }

    /// Rebuild machines for every active token persisted within the last
    /// seven days
    ///
    /// Pages of 1000 spaced by a short sleep. Restored machines are settled
    /// with a synthetic market-cap update at their bracket midpoint; the
    /// synthetic event never re-persists a transition. Row errors are
    /// logged and skipped — rehydrate never halts startup.
    pub async fn rehydrate(&self) {
        let mut offset = 0usize;
        let mut restored = 0usize;
        loop {
            let page = match self
                .store
                .load_active_tokens(REHYDRATE_MAX_AGE_DAYS, REHYDRATE_PAGE, offset)
            {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, offset, "rehydrate page failed, continuing startup");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }

            let settings = self.config.load();
            for row in &page {
                let machine = TokenStateMachine::restore(
                    row.address.clone(),
                    row.category,
                    row.market_cap,
                    row.category_scan_count,
                    row.aim_attempts,
                    row.category_updated_at,
                );
                let machine = Arc::new(Mutex::new(machine));
                self.machines.insert(row.address.clone(), machine.clone());
                self.state_cache.insert(row.address.clone(), row.category);
                restored += 1;

                // settle bracketed categories onto their midpoint so guard
                // evaluation has a sane cap even when the row carried none
                if matches!(
                    row.category,
                    Category::Low | Category::Medium | Category::High | Category::Aim
                ) {
                    let midpoint = settings.thresholds.midpoint(row.category);
                    let mut guard = machine.lock().await;
                    let transition = guard.handle_event(
                        &CategoryEvent::UpdateMarketCap(if row.market_cap > 0.0 {
                            row.market_cap
                        } else {
                            midpoint
                        }),
                        &settings.thresholds,
                        &settings.scans,
                        Utc::now(),
                    );
                    if let Some(t) = transition {
                        // persisted cap already drifted out of the persisted
                        // bracket; keep the machine's view but do not write a
                        // synthetic transition row during startup
                        debug!(token = %row.address, from = %t.from, to = %t.to,
                               "rehydrate settled machine into drifted bracket");
                        self.state_cache.insert(row.address.clone(), t.to);
                    }
                }
            }

            offset += page.len();
            tokio::time::sleep(REHYDRATE_PAGE_DELAY).await;
        }
        info!(restored, "category manager rehydrated");
    }

    fn machine_for(&self, token: &str) -> Arc<Mutex<TokenStateMachine>> {
        self.machines
            .entry(token.to_string())
            .or_insert_with(|| {
                debug!(token, "creating state machine");
                self.state_cache.insert(token.to_string(), Category::New);
                Arc::new(Mutex::new(TokenStateMachine::new(token, Utc::now())))
            })
            .clone()
    }

    /// Market-cap ingress from scans and rehydrated flows
    pub async fn update_market_cap(&self, token: &str, market_cap: f64) {
        self.dispatch(token, CategoryEvent::UpdateMarketCap(market_cap), None)
            .await;
    }

    /// Market-cap ingress from the stream's threshold check; transitions
    /// record the `market_cap_threshold` reason
    pub async fn update_market_cap_from_stream(&self, token: &str, market_cap: f64) {
        self.dispatch(
            token,
            CategoryEvent::UpdateMarketCap(market_cap),
            Some(TransitionReason::MarketCapThreshold),
        )
        .await;
    }

    /// Chunked bulk variant of [`Self::update_market_cap`]
    pub async fn bulk_update_market_caps(&self, updates: Vec<(String, f64)>) {
        for chunk in updates.chunks(BULK_CHUNK) {
            for (token, mc) in chunk {
                self.update_market_cap(token, *mc).await;
            }
            tokio::time::sleep(BULK_CHUNK_DELAY).await;
        }
    }

    /// A scheduled scan finished for this token
    pub async fn record_scan_complete(&self, token: &str) {
        self.dispatch(token, CategoryEvent::ScanComplete, None).await;
    }

    /// The token's category duration elapsed
    pub async fn handle_timeout(&self, token: &str) {
        self.dispatch(token, CategoryEvent::Timeout, None).await;
    }

    /// A buy was executed against this token
    pub async fn mark_buy_executed(&self, token: &str) {
        self.dispatch(token, CategoryEvent::BuyExecuted, None).await;
    }

    /// Operator-initiated category move
    pub async fn manual_override(&self, token: &str, category: Category, reason: String) {
        self.dispatch(token, CategoryEvent::ManualOverride { category, reason }, None)
            .await;
    }

    /// Push a token straight to ARCHIVE
    pub async fn force_archive(&self, token: &str, reason: String) {
        self.dispatch(token, CategoryEvent::ForceArchive { reason }, None)
            .await;
    }

    /// Route one event through the token's machine and persist any
    /// resulting transition
    ///
    /// Never propagates: commit failures roll the machine back so the next
    /// event retries the move.
    async fn dispatch(
        &self,
        token: &str,
        event: CategoryEvent,
        reason_override: Option<TransitionReason>,
    ) {
        // only market-cap ingress may create a machine; every other event
        // targets a token that is already live, and a stale scan or sweep
        // for a retired token is logged and skipped
        let machine = match event {
            CategoryEvent::UpdateMarketCap(_) => self.machine_for(token),
            _ => match self.machines.get(token) {
                Some(entry) => entry.value().clone(),
                None => {
                    debug!(token, ?event, "event for token without a machine, skipped");
                    return;
                }
            },
        };
        let settings = self.config.load();
        let now = Utc::now();

        let mut guard = machine.lock().await;
        let pre_entered_at = guard.entered_at();
        let pre_scan_count = guard.scan_count();

        let Some(mut transition) =
            guard.handle_event(&event, &settings.thresholds, &settings.scans, now)
        else {
            return;
        };

        // only the routine bracket reason is overridable; guard-specific
        // reasons (zero cap, recovery) survive stream-side updates
        if let Some(override_reason) = reason_override {
            if transition.reason == TransitionReason::MarketCapChange {
                transition.reason = override_reason;
            }
        }

        let record = CategoryTransition {
            token_address: token.to_string(),
            from_category: transition.from,
            to_category: transition.to,
            market_cap_at_transition: transition.market_cap,
            reason: transition.reason.clone(),
            metadata: serde_json::json!({
                "scan_count_at_transition": pre_scan_count,
                "aim_attempts": guard.aim_attempts(),
            }),
            occurred_at: now,
        };

        if let Err(e) = self.persist_transition(&record, guard.aim_attempts()) {
            crate::metrics::metrics().record_error(e.class());
            warn!(
                token,
                from = %transition.from,
                to = %transition.to,
                error = %e,
                "transition commit failed; rolling machine back"
            );
            guard.rollback(&transition, pre_entered_at, pre_scan_count);
            return;
        }

        let aim_attempts = guard.aim_attempts();
        drop(guard);

        crate::metrics::metrics().transitions_total.inc();
        self.state_cache.insert(token.to_string(), transition.to);
        self.events.publish(EngineEvent::CategoryChanged {
            address: token.to_string(),
            from: transition.from,
            to: transition.to,
            market_cap: transition.market_cap,
            reason: transition.reason.clone(),
        });

        if transition.to == Category::Aim {
            self.events.publish(EngineEvent::AimEntered {
                address: token.to_string(),
                market_cap: transition.market_cap,
                aim_attempts,
            });
        }

        if transition.to.is_terminal() {
            self.machines.remove(token);
            self.state_cache.remove(token);
            debug!(token, category = %transition.to, "terminal category, machine removed");
        }
    }

    /// Commit with a single retry on transient storage failures
    fn persist_transition(
        &self,
        record: &CategoryTransition,
        aim_attempts: u32,
    ) -> Result<(), EngineError> {
        match self.store.apply_transition(record, aim_attempts) {
            Err(e) if e.is_retryable() => {
                debug!(token = %record.token_address, error = %e, "transition retry");
                self.store.apply_transition(record, aim_attempts)
            }
            other => other,
        }
    }

    /// Drop all machines; called during shutdown after the scheduler stops
    pub fn shutdown(&self) {
        let count = self.machines.len();
        self.machines.clear();
        self.state_cache.clear();
        info!(count, "category manager stopped");
    }
}
