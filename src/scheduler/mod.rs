//! Multi-tier scan scheduler
//!
//! One queue per non-terminal category, one dispatch ticker per queue.
//! Each tick takes the due tasks, orders them by priority, and runs up to
//! the category's batch size in parallel, each scan bounded by a wall-clock
//! timeout. Queue mutations are serialized per category behind that
//! queue's mutex.

pub mod handler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::category::CategoryManager;
use crate::config::{ConfigHandle, ScanPolicy};
use crate::events::{EngineEvent, EventBus};
use crate::metrics;
use crate::storage::Store;
use crate::types::{Category, ScanLogEntry};

/// Wall-clock bound for a single scan
const SCAN_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout sweeper cadence
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// One scheduled scan for one token
#[derive(Debug, Clone)]
pub struct ScanTask {
    pub token_address: String,
    pub category: Category,
    pub scan_number: u32,
    pub first_scheduled_at: DateTime<Utc>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub next_scan_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub priority: i32,
}

/// What a category handler reports back for one scan
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub success: bool,
    pub market_cap: Option<f64>,
    pub apis_used: Vec<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Per-category scan implementation
///
/// Handlers must be cancellation-safe; the scheduler aborts them at the
/// scan timeout.
#[async_trait]
pub trait ScanHandler: Send + Sync {
    async fn scan(&self, task: &ScanTask) -> ScanOutcome;
}

type Queue = Arc<Mutex<HashMap<String, ScanTask>>>;

/// Owns the per-category queues and dispatch loops
pub struct ScanScheduler {
    config: Arc<ConfigHandle>,
    store: Arc<Store>,
    manager: Arc<CategoryManager>,
    events: EventBus,
    queues: HashMap<Category, Queue>,
    handlers: DashMap<Category, Arc<dyn ScanHandler>>,
    running: AtomicBool,
}

impl ScanScheduler {
    pub fn new(
        config: Arc<ConfigHandle>,
        store: Arc<Store>,
        manager: Arc<CategoryManager>,
        events: EventBus,
    ) -> Arc<Self> {
        let mut queues = HashMap::new();
        for category in Category::ACTIVE {
            queues.insert(category, Arc::new(Mutex::new(HashMap::new())));
        }
        Arc::new(Self {
            config,
            store,
            manager,
            events,
            queues,
            handlers: DashMap::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Install the scan implementation for a category
    pub fn register_handler(&self, category: Category, handler: Arc<dyn ScanHandler>) {
        self.handlers.insert(category, handler);
    }

    fn queue(&self, category: Category) -> Option<&Queue> {
        self.queues.get(&category)
    }

    /// Current queue depth for a category
    pub fn queue_depth(&self, category: Category) -> usize {
        self.queue(category).map(|q| q.lock().len()).unwrap_or(0)
    }

    /// Remove a token from every queue
    pub fn remove_everywhere(&self, token: &str) {
        for queue in self.queues.values() {
            queue.lock().remove(token);
        }
    }

    /// Place (or replace) the token's task under its current category
    ///
    /// The existing scan count feeds both the scan number and the priority
    /// decay so long-scanned tokens yield to fresh ones.
    pub fn schedule(&self, token: &str, category: Category, existing_scan_count: u32) {
        self.remove_everywhere(token);

        if category.is_terminal() {
            return;
        }
        let settings = self.config.load();
        let Some(policy) = settings.scans.policy(category) else {
            warn!(token, %category, "no scan policy; skipping schedule");
            return;
        };

        let now = Utc::now();
        let task = ScanTask {
            token_address: token.to_string(),
            category,
            scan_number: existing_scan_count,
            first_scheduled_at: now,
            last_scanned_at: None,
            next_scan_at: now + ChronoDuration::seconds(policy.interval_secs as i64),
            timeout_at: now + ChronoDuration::seconds(policy.duration_secs as i64),
            priority: policy.base_priority - existing_scan_count as i32,
        };

        if let Some(queue) = self.queue(category) {
            queue.lock().insert(token.to_string(), task);
        }
        debug!(token, %category, "scan task scheduled");
    }

    /// Move the token's task after a committed category change
    pub fn handle_category_change(&self, token: &str, to: Category) {
        self.remove_everywhere(token);
        if !to.is_terminal() {
            self.schedule(token, to, 0);
        }
    }

    /// Spawn every dispatch loop, the timeout sweeper, and the
    /// category-change listener; returns the handles for shutdown
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.running.store(true, Ordering::Release);
        let mut handles = Vec::new();

        for category in Category::ACTIVE {
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                scheduler.dispatch_loop(category).await;
            }));
        }

        let sweeper = self.clone();
        handles.push(tokio::spawn(async move {
            sweeper.sweep_loop().await;
        }));

        let listener = self.clone();
        handles.push(tokio::spawn(async move {
            listener.category_change_loop().await;
        }));

        info!("scan scheduler started");
        handles
    }

    /// Stop accepting ticks; in-flight scans finish on their own
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        info!("scan scheduler stopping");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn dispatch_loop(self: Arc<Self>, category: Category) {
        let period = {
            let settings = self.config.load();
            match settings.scans.policy(category) {
                Some(policy) => dispatch_period(policy),
                None => return,
            }
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }
            self.dispatch_tick(category).await;
        }
        debug!(%category, "dispatch loop stopped");
    }

    /// One tick: pull due tasks in priority order, bounded by batch size
    async fn dispatch_tick(self: &Arc<Self>, category: Category) {
        let Some(handler) = self.handlers.get(&category).map(|h| h.value().clone()) else {
            return;
        };
        let settings = self.config.load();
        let Some(policy) = settings.scans.policy(category).copied() else {
            return;
        };

        let now = Utc::now();
        let mut due: Vec<ScanTask> = {
            let Some(queue) = self.queue(category) else {
                return;
            };
            let queue = queue.lock();
            queue
                .values()
                .filter(|task| task.next_scan_at <= now)
                .cloned()
                .collect()
        };
        if due.is_empty() {
            return;
        }

        due.sort_by(|a, b| b.priority.cmp(&a.priority));
        due.truncate(policy.batch_size);

        metrics::metrics()
            .scan_queue_depth
            .set(self.queue_depth(category) as i64);

        let scans = due.into_iter().map(|task| {
            let scheduler = self.clone();
            let handler = handler.clone();
            async move {
                // a transition may have re-homed the token between the queue
                // snapshot and now; stale tasks are dropped, the fresh queue
                // entry will run instead
                if let Some(current) = scheduler.manager.cached_category(&task.token_address) {
                    if current != task.category {
                        if let Some(queue) = scheduler.queue(task.category) {
                            queue.lock().remove(&task.token_address);
                        }
                        return;
                    }
                }

                let started = std::time::Instant::now();
                let outcome = match tokio::time::timeout(SCAN_TIMEOUT, handler.scan(&task)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ScanOutcome {
                        success: false,
                        market_cap: None,
                        apis_used: Vec::new(),
                        error: Some("scan timed out".to_string()),
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                };
                scheduler.process_outcome(task, outcome, policy).await;
            }
        });
        join_all(scans).await;
    }

    /// Persist the scan log, advance the task, and notify the manager
    async fn process_outcome(&self, task: ScanTask, outcome: ScanOutcome, policy: ScanPolicy) {
        let now = Utc::now();
        let new_count = task.scan_number + 1;
        let is_final = new_count >= policy.max_scans;

        metrics::metrics().scans_total.inc();
        metrics::metrics()
            .scan_duration
            .observe(outcome.duration_ms as f64 / 1_000.0);

        let entry = ScanLogEntry {
            token_address: task.token_address.clone(),
            category: task.category,
            scan_number: new_count,
            duration_ms: outcome.duration_ms,
            apis_used: outcome.apis_used.clone(),
            error: outcome.error.clone(),
            is_final,
            created_at: now,
        };
        if let Err(e) = self.store.append_scan_log(&entry) {
            warn!(token = %task.token_address, error = %e, "scan log append failed");
        }
        if let Err(e) = self
            .store
            .update_scan_progress(&task.token_address, new_count, now)
        {
            warn!(token = %task.token_address, error = %e, "scan progress update failed");
        }

        if !outcome.success {
            metrics::metrics().scan_failures.inc();
            metrics::metrics().record_error("scan");
            self.events.publish(EngineEvent::ScanFailed {
                address: task.token_address.clone(),
                category: task.category,
                error: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        // requeue or retire before notifying the manager, so a transition
        // triggered by the notification wins any race against this task
        if is_final {
            if let Some(queue) = self.queue(task.category) {
                queue.lock().remove(&task.token_address);
            }
        } else if let Some(queue) = self.queue(task.category) {
            let mut queue = queue.lock();
            if let Some(entry) = queue.get_mut(&task.token_address) {
                entry.scan_number = new_count;
                entry.last_scanned_at = Some(now);
                entry.next_scan_at = now + ChronoDuration::seconds(policy.interval_secs as i64);
            }
        }

        self.manager.record_scan_complete(&task.token_address).await;
        if let Some(market_cap) = outcome.market_cap {
            self.manager
                .update_market_cap(&task.token_address, market_cap)
                .await;
        }
    }

    /// Periodic sweep removing tasks past their category duration
    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        let now = Utc::now();
        let mut expired: Vec<(String, Category)> = Vec::new();
        for (category, queue) in &self.queues {
            let mut queue = queue.lock();
            let timed_out: Vec<String> = queue
                .values()
                .filter(|task| task.timeout_at <= now)
                .map(|task| task.token_address.clone())
                .collect();
            for token in timed_out {
                queue.remove(&token);
                expired.push((token, *category));
            }
        }

        for (token, category) in expired {
            debug!(token = %token, %category, "scan task timed out");
            // the machine decides where the timeout leads; the scheduler
            // only reports it
            self.manager.handle_timeout(&token).await;
            self.events.publish(EngineEvent::TokenTimeout {
                address: token,
                category,
            });
        }
    }

    /// Follow committed category changes coming off the event bus
    async fn category_change_loop(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(EngineEvent::CategoryChanged { address, to, .. }) => {
                    if !self.is_running() {
                        break;
                    }
                    self.handle_category_change(&address, to);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "scheduler lagged on event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Map a scan interval onto a ticker period the way the cron table would
///
/// Sub-minute intervals tick every N seconds (`*/N * * * * *`), sub-hour
/// intervals every whole minute block (`*/M * * * *`), anything larger on
/// the hour block (`0 */H * * *`). The AIM 10-second ticker is the
/// reference case of the seconds mapping.
pub fn dispatch_period(policy: &ScanPolicy) -> Duration {
    let secs = policy.interval_secs;
    if secs < 60 {
        Duration::from_secs(secs.max(1))
    } else if secs < 3_600 {
        Duration::from_secs((secs / 60) * 60)
    } else {
        Duration::from_secs((secs / 3_600) * 3_600)
    }
}
