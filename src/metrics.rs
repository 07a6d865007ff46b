//! Metrics collection and export
//!
//! One prometheus registry for the whole process plus a rolling 5-minute
//! error window used for the flush saturation alert.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

/// Window length for error-rate accounting
const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Flush error rate above this fraction trips the saturation alert
const SATURATION_THRESHOLD: f64 = 0.10;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Ingestion
    pub stream_updates_total: IntCounter,
    pub prices_buffered_total: IntCounter,
    pub transactions_buffered_total: IntCounter,
    pub tokens_created_total: IntCounter,
    pub flushes_total: IntCounter,
    pub flush_failures_total: IntCounter,
    pub stream_reconnects_total: IntCounter,
    pub backpressure_pauses_total: IntCounter,

    // Lifecycle
    pub transitions_total: IntCounter,
    pub scans_total: IntCounter,
    pub scan_failures: IntCounter,
    pub evaluations_total: IntCounter,
    pub buy_signals_total: IntCounter,
    pub enrichment_failures_total: IntCounter,

    // Gauges
    pub active_machines: IntGauge,
    pub scan_queue_depth: IntGauge,
    pub buffered_prices: IntGauge,
    pub buffered_transactions: IntGauge,

    // Histograms
    pub flush_duration: Histogram,
    pub scan_duration: Histogram,
    pub evaluation_duration: Histogram,

    flush_window: ErrorWindow,
    class_windows: Mutex<std::collections::HashMap<&'static str, VecDeque<Instant>>>,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let stream_updates_total = IntCounter::with_opts(Opts::new(
            "stream_updates_total",
            "Raw stream updates received",
        ))?;
        let prices_buffered_total = IntCounter::with_opts(Opts::new(
            "prices_buffered_total",
            "Price samples accepted into the ingest buffer",
        ))?;
        let transactions_buffered_total = IntCounter::with_opts(Opts::new(
            "transactions_buffered_total",
            "Transactions accepted into the ingest buffer",
        ))?;
        let tokens_created_total = IntCounter::with_opts(Opts::new(
            "tokens_created_total",
            "New tokens observed on the stream",
        ))?;
        let flushes_total =
            IntCounter::with_opts(Opts::new("flushes_total", "Committed batch flushes"))?;
        let flush_failures_total = IntCounter::with_opts(Opts::new(
            "flush_failures_total",
            "Batch flushes that failed and were discarded",
        ))?;
        let stream_reconnects_total = IntCounter::with_opts(Opts::new(
            "stream_reconnects_total",
            "Stream reconnection attempts",
        ))?;
        let backpressure_pauses_total = IntCounter::with_opts(Opts::new(
            "backpressure_pauses_total",
            "Times ingress paused on full buffers",
        ))?;

        let transitions_total = IntCounter::with_opts(Opts::new(
            "transitions_total",
            "Committed category transitions",
        ))?;
        let scans_total = IntCounter::with_opts(Opts::new("scans_total", "Completed scans"))?;
        let scan_failures =
            IntCounter::with_opts(Opts::new("scan_failures_total", "Scans reporting errors"))?;
        let evaluations_total =
            IntCounter::with_opts(Opts::new("evaluations_total", "Buy evaluations performed"))?;
        let buy_signals_total = IntCounter::with_opts(Opts::new(
            "buy_signals_total",
            "Evaluations that passed the gate",
        ))?;
        let enrichment_failures_total = IntCounter::with_opts(Opts::new(
            "enrichment_failures_total",
            "Metadata enrichment permanent failures",
        ))?;

        let active_machines = IntGauge::with_opts(Opts::new(
            "active_machines",
            "Live per-token state machines",
        ))?;
        let scan_queue_depth =
            IntGauge::with_opts(Opts::new("scan_queue_depth", "Tasks across scan queues"))?;
        let buffered_prices =
            IntGauge::with_opts(Opts::new("buffered_prices", "Prices awaiting flush"))?;
        let buffered_transactions = IntGauge::with_opts(Opts::new(
            "buffered_transactions",
            "Transactions awaiting flush",
        ))?;

        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Batch flush latency")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let scan_duration = Histogram::with_opts(
            HistogramOpts::new("scan_duration_seconds", "Scan handler latency")
                .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;
        let evaluation_duration = Histogram::with_opts(
            HistogramOpts::new("evaluation_duration_seconds", "Buy evaluation latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(stream_updates_total.clone()))?;
        registry.register(Box::new(prices_buffered_total.clone()))?;
        registry.register(Box::new(transactions_buffered_total.clone()))?;
        registry.register(Box::new(tokens_created_total.clone()))?;
        registry.register(Box::new(flushes_total.clone()))?;
        registry.register(Box::new(flush_failures_total.clone()))?;
        registry.register(Box::new(stream_reconnects_total.clone()))?;
        registry.register(Box::new(backpressure_pauses_total.clone()))?;
        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(scans_total.clone()))?;
        registry.register(Box::new(scan_failures.clone()))?;
        registry.register(Box::new(evaluations_total.clone()))?;
        registry.register(Box::new(buy_signals_total.clone()))?;
        registry.register(Box::new(enrichment_failures_total.clone()))?;
        registry.register(Box::new(active_machines.clone()))?;
        registry.register(Box::new(scan_queue_depth.clone()))?;
        registry.register(Box::new(buffered_prices.clone()))?;
        registry.register(Box::new(buffered_transactions.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(scan_duration.clone()))?;
        registry.register(Box::new(evaluation_duration.clone()))?;

        Ok(Self {
            registry,
            stream_updates_total,
            prices_buffered_total,
            transactions_buffered_total,
            tokens_created_total,
            flushes_total,
            flush_failures_total,
            stream_reconnects_total,
            backpressure_pauses_total,
            transitions_total,
            scans_total,
            scan_failures,
            evaluations_total,
            buy_signals_total,
            enrichment_failures_total,
            active_machines,
            scan_queue_depth,
            buffered_prices,
            buffered_transactions,
            flush_duration,
            scan_duration,
            evaluation_duration,
            flush_window: ErrorWindow::new(ERROR_WINDOW),
            class_windows: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one flush outcome into the rolling window
    pub fn record_flush(&self, success: bool) {
        if success {
            self.flushes_total.inc();
        } else {
            self.flush_failures_total.inc();
        }
        self.flush_window.record(success);
    }

    /// Flush error rate over the trailing window
    pub fn flush_error_rate(&self) -> f64 {
        self.flush_window.error_rate()
    }

    /// Whether the flush error rate has crossed the saturation threshold
    pub fn flush_saturated(&self) -> bool {
        let (attempts, rate) = self.flush_window.snapshot();
        attempts >= 10 && rate > SATURATION_THRESHOLD
    }

    /// Count one error against its class window
    pub fn record_error(&self, class: &'static str) {
        let mut windows = self.class_windows.lock();
        let now = Instant::now();
        let entries = windows.entry(class).or_default();
        entries.push_back(now);
        while let Some(at) = entries.front() {
            if now.duration_since(*at) > ERROR_WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Error counts by class over the trailing window
    pub fn error_counts_by_class(&self) -> Vec<(&'static str, usize)> {
        let windows = self.class_windows.lock();
        let now = Instant::now();
        let mut counts: Vec<(&'static str, usize)> = windows
            .iter()
            .map(|(class, entries)| {
                let live = entries
                    .iter()
                    .filter(|at| now.duration_since(**at) <= ERROR_WINDOW)
                    .count();
                (*class, live)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        counts.sort_by_key(|(class, _)| *class);
        counts
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to create metrics")
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("failed to initialize metrics"));
    &METRICS
}

/// Rolling success/failure window
struct ErrorWindow {
    span: Duration,
    entries: Mutex<VecDeque<(Instant, bool)>>,
}

impl ErrorWindow {
    fn new(span: Duration) -> Self {
        Self {
            span,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, success: bool) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.push_back((now, success));
        while let Some((at, _)) = entries.front() {
            if now.duration_since(*at) > self.span {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> (usize, f64) {
        let entries = self.entries.lock();
        let now = Instant::now();
        let mut attempts = 0usize;
        let mut failures = 0usize;
        for (at, success) in entries.iter() {
            if now.duration_since(*at) <= self.span {
                attempts += 1;
                if !success {
                    failures += 1;
                }
            }
        }
        if attempts == 0 {
            (0, 0.0)
        } else {
            (attempts, failures as f64 / attempts as f64)
        }
    }

    fn error_rate(&self) -> f64 {
        self.snapshot().1
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_registry_registers_everything() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn error_window_tracks_rate() {
        let window = ErrorWindow::new(Duration::from_secs(300));
        for _ in 0..9 {
            window.record(true);
        }
        window.record(false);
        let (attempts, rate) = window.snapshot();
        assert_eq!(attempts, 10);
        assert!((rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn saturation_needs_volume_and_rate() {
        let metrics = Metrics::new().unwrap();
        // two failures out of two: rate 1.0 but below the volume floor
        metrics.record_flush(false);
        metrics.record_flush(false);
        assert!(!metrics.flush_saturated());

        for _ in 0..8 {
            metrics.record_flush(false);
        }
        assert!(metrics.flush_saturated());

        for _ in 0..200 {
            metrics.record_flush(true);
        }
        assert!(!metrics.flush_saturated());
    }

    #[test]
    fn class_windows_accumulate() {
        let metrics = Metrics::new().unwrap();
        metrics.record_error("storage");
        metrics.record_error("storage");
        metrics.record_error("decode");
        let counts = metrics.error_counts_by_class();
        assert_eq!(counts, vec![("decode", 1), ("storage", 2)]);
    }

    #[test]
    fn timer_measures_elapsed() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5);
    }
}
