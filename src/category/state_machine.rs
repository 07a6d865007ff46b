//! Per-token category state machine
//!
//! A pure, CPU-bound automaton: events in, at most one transition out.
//! Guards never raise — an event that matches no rule leaves the machine
//! in place (recording the market cap when one was carried). The manager
//! owns every live machine and is the only caller.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::config::{ScanTable, Thresholds};
use crate::types::{Category, TransitionReason};

/// Floor a token must spend in NEW before promotion (archival is exempt)
pub const MIN_DURATION_IN_NEW_SECS: i64 = 30 * 60;

/// Events the automaton accepts
#[derive(Debug, Clone, PartialEq)]
pub enum CategoryEvent {
    UpdateMarketCap(f64),
    ScanComplete,
    Timeout,
    ManualOverride {
        category: Category,
        reason: String,
    },
    BuyExecuted,
    ForceArchive {
        reason: String,
    },
}

/// One applied transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: Category,
    pub to: Category,
    pub market_cap: f64,
    pub reason: TransitionReason,
}

/// Finite automaton for a single token's lifecycle
#[derive(Debug, Clone)]
pub struct TokenStateMachine {
    address: String,
    category: Category,
    market_cap: f64,
    scan_count: u32,
    aim_attempts: u32,
    entered_at: DateTime<Utc>,
}

impl TokenStateMachine {
    /// Fresh machine for a newly discovered token
    pub fn new(address: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            category: Category::New,
            market_cap: 0.0,
            scan_count: 0,
            aim_attempts: 0,
            entered_at: now,
        }
    }

    /// Rebuild a machine from a persisted token row
    pub fn restore(
        address: impl Into<String>,
        category: Category,
        market_cap: f64,
        scan_count: u32,
        aim_attempts: u32,
        entered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            address: address.into(),
            category,
            market_cap,
            scan_count,
            aim_attempts,
            entered_at,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn market_cap(&self) -> f64 {
        self.market_cap
    }

    pub fn scan_count(&self) -> u32 {
        self.scan_count
    }

    pub fn aim_attempts(&self) -> u32 {
        self.aim_attempts
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    fn has_min_duration_in_new(&self, now: DateTime<Utc>) -> bool {
        (now - self.entered_at).num_seconds() >= MIN_DURATION_IN_NEW_SECS
    }

    fn exceeded_max_scans(&self, scans: &ScanTable) -> bool {
        scans
            .policy(self.category)
            .map(|p| self.scan_count >= p.max_scans)
            .unwrap_or(false)
    }

    /// Route one event through the transition table
    ///
    /// Returns the applied transition, if any. The caller persists it and
    /// emits events; the machine has already moved by the time this
    /// returns.
    pub fn handle_event(
        &mut self,
        event: &CategoryEvent,
        thresholds: &Thresholds,
        scans: &ScanTable,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if self.category.is_terminal() {
            debug!(
                token = %self.address,
                category = %self.category,
                "event ignored in terminal category"
            );
            return None;
        }

        let decision = match event {
            CategoryEvent::UpdateMarketCap(mc) => self.on_market_cap(*mc, thresholds, now),
            CategoryEvent::ScanComplete => {
                self.scan_count += 1;
                if self.exceeded_max_scans(scans) {
                    self.scan_exhaustion_target()
                        .map(|to| (to, TransitionReason::ScanLimit))
                } else {
                    None
                }
            }
            CategoryEvent::Timeout => self.on_timeout(thresholds),
            CategoryEvent::ManualOverride { category, reason } => {
                if *category != self.category {
                    Some((*category, TransitionReason::ManualOverride(reason.clone())))
                } else {
                    None
                }
            }
            CategoryEvent::BuyExecuted => {
                if self.category == Category::Aim {
                    Some((Category::Complete, TransitionReason::BuyExecuted))
                } else {
                    debug!(
                        token = %self.address,
                        category = %self.category,
                        "buy reported outside AIM, ignored"
                    );
                    None
                }
            }
            CategoryEvent::ForceArchive { reason } => {
                if self.category != Category::Archive {
                    Some((Category::Archive, TransitionReason::ForceArchive(reason.clone())))
                } else {
                    None
                }
            }
        };

        decision.map(|(to, reason)| self.apply(to, reason, now))
    }

    /// Market-cap routing rules; first match wins
    fn on_market_cap(
        &mut self,
        mc: f64,
        t: &Thresholds,
        now: DateTime<Utc>,
    ) -> Option<(Category, TransitionReason)> {
        self.market_cap = mc;

        let is_zero = mc <= 0.0;
        let is_low = mc > 0.0 && mc < t.low_max;
        let is_medium = mc >= t.low_max && mc < t.medium_max;
        let is_high = mc >= t.medium_max && mc < t.high_max;
        let is_aim = mc >= t.aim_min && mc <= t.aim_max;

        match self.category {
            Category::New => {
                if is_zero {
                    // zero market cap skips the duration floor
                    return Some((Category::Archive, TransitionReason::ZeroMarketCap));
                }
                if !self.has_min_duration_in_new(now) {
                    return None;
                }
                if is_low {
                    Some((Category::Low, TransitionReason::MarketCapChange))
                } else if is_medium {
                    Some((Category::Medium, TransitionReason::MarketCapChange))
                } else if is_high {
                    Some((Category::High, TransitionReason::MarketCapChange))
                } else if is_aim {
                    Some((Category::Aim, TransitionReason::MarketCapChange))
                } else {
                    None
                }
            }
            Category::Low => {
                if is_medium {
                    Some((Category::Medium, TransitionReason::MarketCapChange))
                } else if is_high {
                    Some((Category::High, TransitionReason::MarketCapChange))
                } else if is_aim {
                    Some((Category::Aim, TransitionReason::MarketCapChange))
                } else {
                    None
                }
            }
            Category::Medium => {
                if is_low {
                    Some((Category::Low, TransitionReason::MarketCapChange))
                } else if is_high {
                    Some((Category::High, TransitionReason::MarketCapChange))
                } else if is_aim {
                    Some((Category::Aim, TransitionReason::MarketCapChange))
                } else {
                    None
                }
            }
            Category::High => {
                if is_medium {
                    Some((Category::Medium, TransitionReason::MarketCapChange))
                } else if is_low {
                    Some((Category::Low, TransitionReason::MarketCapChange))
                } else if is_aim {
                    Some((Category::Aim, TransitionReason::MarketCapChange))
                } else {
                    None
                }
            }
            Category::Aim => {
                if is_high {
                    Some((Category::High, TransitionReason::MarketCapChange))
                } else if is_medium {
                    Some((Category::Medium, TransitionReason::MarketCapChange))
                } else if is_low {
                    Some((Category::Low, TransitionReason::MarketCapChange))
                } else {
                    None
                }
            }
            Category::Archive => {
                if mc >= t.low_max {
                    Some((Category::Low, TransitionReason::Recovery))
                } else {
                    None
                }
            }
            Category::Bin | Category::Complete => None,
        }
    }

    /// Where scan exhaustion demotes each category
    fn scan_exhaustion_target(&self) -> Option<Category> {
        match self.category {
            Category::Low => Some(Category::Archive),
            Category::Medium => Some(Category::Low),
            Category::High => Some(Category::Medium),
            Category::Aim => Some(Category::High),
            Category::Archive => Some(Category::Bin),
            // NEW leaves only on market cap, duration, or force
            Category::New | Category::Bin | Category::Complete => None,
        }
    }

    /// Duration-timeout routing
    fn on_timeout(&self, t: &Thresholds) -> Option<(Category, TransitionReason)> {
        match self.category {
            Category::New | Category::Low => {
                Some((Category::Archive, TransitionReason::DurationTimeout))
            }
            Category::Medium => Some((Category::Low, TransitionReason::DurationTimeout)),
            Category::High => Some((Category::Medium, TransitionReason::DurationTimeout)),
            Category::Aim => {
                // AIM only exits on timeout when the cap has already decayed
                // into the HIGH bracket; otherwise it keeps receiving updates
                let in_high = self.market_cap >= t.medium_max && self.market_cap < t.high_max;
                in_high.then_some((Category::High, TransitionReason::DurationTimeout))
            }
            Category::Archive => Some((Category::Bin, TransitionReason::DurationTimeout)),
            Category::Bin | Category::Complete => None,
        }
    }

    /// Undo a transition whose persistence failed, restoring the captured
    /// pre-event cursor so the next event can retry the move
    pub(crate) fn rollback(
        &mut self,
        transition: &Transition,
        entered_at: DateTime<Utc>,
        scan_count: u32,
    ) {
        self.category = transition.from;
        self.entered_at = entered_at;
        self.scan_count = scan_count;
        if transition.to == Category::Aim {
            self.aim_attempts = self.aim_attempts.saturating_sub(1);
        }
    }

    fn apply(&mut self, to: Category, reason: TransitionReason, now: DateTime<Utc>) -> Transition {
        let from = self.category;
        self.category = to;
        self.entered_at = now;
        self.scan_count = 0;
        if to == Category::Aim {
            self.aim_attempts += 1;
        }
        debug!(
            token = %self.address,
            %from,
            %to,
            market_cap = self.market_cap,
            reason = reason.tag(),
            "category transition"
        );
        Transition {
            from,
            to,
            market_cap: self.market_cap,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn fixtures() -> (Thresholds, ScanTable) {
        let settings = Settings::default();
        (settings.thresholds, settings.scans)
    }

    fn aged_new(minutes: i64) -> TokenStateMachine {
        TokenStateMachine::new("mint", Utc::now() - ChronoDuration::minutes(minutes))
    }

    #[test]
    fn new_promotes_to_aim_after_floor() {
        let (t, s) = fixtures();
        let mut machine = aged_new(31);
        let transition = machine
            .handle_event(&CategoryEvent::UpdateMarketCap(36_000.0), &t, &s, Utc::now())
            .expect("transition");
        assert_eq!(transition.from, Category::New);
        assert_eq!(transition.to, Category::Aim);
        assert_eq!(transition.market_cap, 36_000.0);
        assert_eq!(machine.aim_attempts(), 1);
        assert_eq!(machine.scan_count(), 0);
    }

    #[test]
    fn new_promotion_blocked_before_floor() {
        let (t, s) = fixtures();
        let mut machine = aged_new(10);
        let transition =
            machine.handle_event(&CategoryEvent::UpdateMarketCap(12_000.0), &t, &s, Utc::now());
        assert!(transition.is_none());
        assert_eq!(machine.category(), Category::New);
        assert_eq!(machine.market_cap(), 12_000.0);
    }

    #[test]
    fn new_zero_mc_archives_immediately() {
        let (t, s) = fixtures();
        let mut machine = aged_new(1);
        let transition = machine
            .handle_event(&CategoryEvent::UpdateMarketCap(0.0), &t, &s, Utc::now())
            .expect("transition");
        assert_eq!(transition.to, Category::Archive);
        assert_eq!(transition.reason, TransitionReason::ZeroMarketCap);
    }

    #[test]
    fn same_update_twice_transitions_once() {
        let (t, s) = fixtures();
        let mut machine = aged_new(40);
        let first =
            machine.handle_event(&CategoryEvent::UpdateMarketCap(36_000.0), &t, &s, Utc::now());
        assert!(first.is_some());
        let second =
            machine.handle_event(&CategoryEvent::UpdateMarketCap(36_000.0), &t, &s, Utc::now());
        assert!(second.is_none());
        assert_eq!(machine.category(), Category::Aim);
    }

    #[test]
    fn low_scan_exhaustion_archives() {
        let (t, s) = fixtures();
        let mut machine = TokenStateMachine::restore(
            "mint",
            Category::Low,
            5_000.0,
            0,
            0,
            Utc::now(),
        );
        let mut transition = None;
        for _ in 0..s.low.max_scans {
            transition = machine.handle_event(&CategoryEvent::ScanComplete, &t, &s, Utc::now());
        }
        let transition = transition.expect("final scan triggers archive");
        assert_eq!(transition.to, Category::Archive);
        assert_eq!(transition.reason, TransitionReason::ScanLimit);
        assert_eq!(machine.scan_count(), 0);
    }

    #[test]
    fn medium_exhaustion_demotes_to_low() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::Medium, 10_000.0, 0, 0, Utc::now());
        let mut transition = None;
        for _ in 0..s.medium.max_scans {
            transition = machine.handle_event(&CategoryEvent::ScanComplete, &t, &s, Utc::now());
        }
        assert_eq!(transition.unwrap().to, Category::Low);
    }

    #[test]
    fn aim_buy_executed_completes() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::Aim, 40_000.0, 0, 1, Utc::now());
        let transition = machine
            .handle_event(&CategoryEvent::BuyExecuted, &t, &s, Utc::now())
            .expect("transition");
        assert_eq!(transition.to, Category::Complete);

        // COMPLETE is a sink
        let after =
            machine.handle_event(&CategoryEvent::UpdateMarketCap(50_000.0), &t, &s, Utc::now());
        assert!(after.is_none());
        assert_eq!(machine.category(), Category::Complete);
    }

    #[test]
    fn buy_outside_aim_is_ignored() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::Low, 5_000.0, 0, 0, Utc::now());
        assert!(machine
            .handle_event(&CategoryEvent::BuyExecuted, &t, &s, Utc::now())
            .is_none());
        assert_eq!(machine.category(), Category::Low);
    }

    #[test]
    fn aim_timeout_requires_high_bracket() {
        let (t, s) = fixtures();

        // cap still inside the AIM band: timeout does not exit
        let mut machine =
            TokenStateMachine::restore("mint", Category::Aim, 50_000.0, 0, 1, Utc::now());
        assert!(machine
            .handle_event(&CategoryEvent::Timeout, &t, &s, Utc::now())
            .is_none());
        assert_eq!(machine.category(), Category::Aim);

        // cap decayed into the HIGH bracket: timeout exits to HIGH
        machine.handle_event(&CategoryEvent::UpdateMarketCap(30_000.0), &t, &s, Utc::now());
        assert_eq!(machine.category(), Category::High);
    }

    #[test]
    fn aim_timeout_exits_when_cap_in_high_bracket() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::Aim, 30_000.0, 0, 1, Utc::now());
        let transition = machine
            .handle_event(&CategoryEvent::Timeout, &t, &s, Utc::now())
            .expect("transition");
        assert_eq!(transition.to, Category::High);
        assert_eq!(transition.reason, TransitionReason::DurationTimeout);
    }

    #[test]
    fn archive_recovers_to_low() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::Archive, 0.0, 0, 0, Utc::now());
        let transition = machine
            .handle_event(&CategoryEvent::UpdateMarketCap(9_000.0), &t, &s, Utc::now())
            .expect("transition");
        assert_eq!(transition.to, Category::Low);
        assert_eq!(transition.reason, TransitionReason::Recovery);
    }

    #[test]
    fn archive_exhaustion_bins() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::Archive, 100.0, 0, 0, Utc::now());
        let transition = machine
            .handle_event(&CategoryEvent::Timeout, &t, &s, Utc::now())
            .expect("transition");
        assert_eq!(transition.to, Category::Bin);
    }

    #[test]
    fn manual_override_records_reason() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::Medium, 10_000.0, 0, 0, Utc::now());
        let transition = machine
            .handle_event(
                &CategoryEvent::ManualOverride {
                    category: Category::Archive,
                    reason: "rug suspicion".into(),
                },
                &t,
                &s,
                Utc::now(),
            )
            .expect("transition");
        assert_eq!(transition.to, Category::Archive);
        assert_eq!(
            transition.reason,
            TransitionReason::ManualOverride("rug suspicion".into())
        );
    }

    #[test]
    fn mc_above_aim_band_keeps_state() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::Aim, 50_000.0, 0, 1, Utc::now());
        let transition =
            machine.handle_event(&CategoryEvent::UpdateMarketCap(150_000.0), &t, &s, Utc::now());
        assert!(transition.is_none());
        assert_eq!(machine.category(), Category::Aim);
        assert_eq!(machine.market_cap(), 150_000.0);
    }

    #[test]
    fn high_routes_down_and_up() {
        let (t, s) = fixtures();
        let mut machine =
            TokenStateMachine::restore("mint", Category::High, 25_000.0, 0, 0, Utc::now());
        machine.handle_event(&CategoryEvent::UpdateMarketCap(5_000.0), &t, &s, Utc::now());
        assert_eq!(machine.category(), Category::Low);

        machine.handle_event(&CategoryEvent::UpdateMarketCap(40_000.0), &t, &s, Utc::now());
        assert_eq!(machine.category(), Category::Aim);
        assert_eq!(machine.aim_attempts(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arbitrary_event() -> impl Strategy<Value = CategoryEvent> {
            prop_oneof![
                (-10_000.0..200_000.0f64).prop_map(CategoryEvent::UpdateMarketCap),
                Just(CategoryEvent::ScanComplete),
                Just(CategoryEvent::Timeout),
                Just(CategoryEvent::BuyExecuted),
                Just(CategoryEvent::ForceArchive {
                    reason: "prop".into()
                }),
            ]
        }

        proptest! {
            #[test]
            fn transitions_never_self_loop(events in prop::collection::vec(arbitrary_event(), 1..64)) {
                let (t, s) = fixtures();
                let mut machine = TokenStateMachine::new("mint", Utc::now() - ChronoDuration::hours(2));
                for event in &events {
                    if let Some(transition) = machine.handle_event(event, &t, &s, Utc::now()) {
                        prop_assert_ne!(transition.from, transition.to);
                        prop_assert_eq!(machine.category(), transition.to);
                    }
                }
            }

            #[test]
            fn scan_count_stays_bounded(events in prop::collection::vec(arbitrary_event(), 1..128)) {
                let (t, s) = fixtures();
                let mut machine = TokenStateMachine::new("mint", Utc::now() - ChronoDuration::hours(2));
                for event in &events {
                    machine.handle_event(event, &t, &s, Utc::now());
                    if let Some(policy) = s.policy(machine.category()) {
                        prop_assert!(machine.scan_count() <= policy.max_scans + 1);
                    }
                }
            }

            #[test]
            fn terminal_states_are_sinks(events in prop::collection::vec(arbitrary_event(), 1..64)) {
                let (t, s) = fixtures();
                let mut machine = TokenStateMachine::restore(
                    "mint", Category::Complete, 40_000.0, 0, 1, Utc::now());
                for event in &events {
                    prop_assert!(machine.handle_event(event, &t, &s, Utc::now()).is_none());
                    prop_assert_eq!(machine.category(), Category::Complete);
                }
            }
        }
    }
}
