//! Category lifecycle integration: promotion, duration floors, exhaustion

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use curvescan::category::CategoryManager;
use curvescan::config::{ConfigHandle, Settings};
use curvescan::events::EventBus;
use curvescan::storage::Store;
use curvescan::types::{Category, TokenRecord};

fn setup() -> (TempDir, Arc<CategoryManager>, Arc<Store>) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("lifecycle.db"), 4).unwrap();
    let config = ConfigHandle::new(Settings::default());
    let events = EventBus::new(256);
    let manager = CategoryManager::new(config, store.clone(), events);
    (dir, manager, store)
}

fn seed(store: &Store, address: &str, category: Category, age_minutes: i64) {
    let now = Utc::now();
    let mut row = TokenRecord::placeholder(address, now - ChronoDuration::minutes(age_minutes));
    row.category = category;
    row.category_updated_at = now - ChronoDuration::minutes(age_minutes);
    store.insert_token(&row).unwrap();
}

#[tokio::test]
async fn graduation_threshold_promotes_to_aim() {
    let (_dir, manager, store) = setup();
    seed(&store, "token-aim", Category::New, 31);
    manager.rehydrate().await;

    manager.update_market_cap("token-aim", 36_000.0).await;

    let token = store.get_token("token-aim").unwrap().unwrap();
    assert_eq!(token.category, Category::Aim);
    assert_eq!(token.aim_attempts, 1);

    let transitions = store.transitions_for("token-aim").unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to_category, Category::Aim);
    assert_eq!(transitions[0].market_cap_at_transition, 36_000.0);
}

#[tokio::test]
async fn premature_promotion_is_blocked() {
    let (_dir, manager, store) = setup();
    seed(&store, "token-young", Category::New, 10);
    manager.rehydrate().await;

    manager.update_market_cap("token-young", 12_000.0).await;

    let token = store.get_token("token-young").unwrap().unwrap();
    assert_eq!(token.category, Category::New);
    assert!(store.transitions_for("token-young").unwrap().is_empty());
    // the market cap still lands on the machine
    assert_eq!(manager.cached_category("token-young"), Some(Category::New));
}

#[tokio::test]
async fn scan_exhaustion_archives_low_tokens() {
    let (_dir, manager, store) = setup();
    seed(&store, "token-low", Category::Low, 120);
    manager.rehydrate().await;

    let max = Settings::default().scans.low.max_scans;
    assert_eq!(max, 9);
    for _ in 0..max {
        manager.record_scan_complete("token-low").await;
    }

    let token = store.get_token("token-low").unwrap().unwrap();
    assert_eq!(token.category, Category::Archive);
    assert_eq!(token.category_scan_count, 0);

    let transitions = store.transitions_for("token-low").unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].reason.tag(), "scan_limit");
}

#[tokio::test]
async fn archive_recovery_and_binning() {
    let (_dir, manager, store) = setup();
    seed(&store, "token-arch", Category::Low, 120);
    manager.rehydrate().await;

    manager.force_archive("token-arch", "test".into()).await;
    assert_eq!(
        store.get_token("token-arch").unwrap().unwrap().category,
        Category::Archive
    );

    // recovery above LOW_MAX routes back to LOW
    manager.update_market_cap("token-arch", 9_000.0).await;
    assert_eq!(
        store.get_token("token-arch").unwrap().unwrap().category,
        Category::Low
    );
}

#[tokio::test]
async fn every_persisted_transition_changes_category() {
    let (_dir, manager, store) = setup();
    seed(&store, "token-walk", Category::New, 45);
    manager.rehydrate().await;

    for mc in [12_000.0, 12_000.0, 25_000.0, 40_000.0, 5_000.0, 0.0] {
        manager.update_market_cap("token-walk", mc).await;
    }

    let transitions = store.transitions_for("token-walk").unwrap();
    assert!(!transitions.is_empty());
    for transition in &transitions {
        assert_ne!(transition.from_category, transition.to_category);
    }
}
