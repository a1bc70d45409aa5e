//! Lifecycle tests for the position watcher: the end-to-end scenarios from
//! entry fill to OCO resolution, recovery after restart, the kill switch
//! and the emergency-close path.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{entry_order, exit_order, MemoryStore, MockBroker, RecordingNotifier};
use supervisor::domain::ports::{StopOrderKind, StopOrderState};
use supervisor::infrastructure::config::FreeTradingConfig;
use supervisor::{
    BotMode, OrderKind, OrderStatus, OrderValidator, PollOutcome, PositionWatcher, WatcherConfig,
};

struct Harness {
    broker: Arc<MockBroker>,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    validator: Arc<OrderValidator>,
    watcher: Arc<PositionWatcher>,
}

fn harness(store: MemoryStore, sl_timeout: Duration) -> Harness {
    let broker = Arc::new(MockBroker::new());
    let store = Arc::new(store);
    let notifier = Arc::new(RecordingNotifier::new());
    let validator = Arc::new(OrderValidator::new(
        &supervisor::infrastructure::config::TradingConfig {
            deposit_rub: 1_000_000.0,
            risk_per_trade_pct: 0.01,
            max_position_pct: 0.25,
        },
        FreeTradingConfig::default(),
    ));
    let watcher = PositionWatcher::new(
        broker.clone(),
        store.clone(),
        notifier.clone(),
        validator.clone(),
        WatcherConfig {
            poll_interval: Duration::from_millis(10),
            sl_timeout,
        },
    );
    Harness { broker, store, notifier, validator, watcher }
}

fn auto_harness() -> Harness {
    harness(MemoryStore::active(BotMode::Auto), Duration::from_secs(10))
}

// =============================================================================
// S1: happy path in auto mode
// =============================================================================

#[tokio::test]
async fn s1_happy_path_entry_to_take_profit() {
    let h = auto_harness();

    // Entry accepted by the broker and registered for tracking
    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    h.broker.add_listed("E1", "F1", StopOrderState::Active, 250.0);

    // Poll 1: still parked
    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(h.watcher.tracked_count(), 1);

    // Poll 2: the entry fills at 250
    h.broker.set_state("E1", StopOrderState::Executed);
    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);

    // SL @ 245 and TP @ 265 went out, derived from the fill price
    let sls = h.broker.placed_of_kind(StopOrderKind::StopLoss);
    let tps = h.broker.placed_of_kind(StopOrderKind::TakeProfit);
    assert_eq!(sls.len(), 1);
    assert_eq!(sls[0].trigger_price, 245.0);
    assert_eq!(tps.len(), 1);
    assert_eq!(tps[0].trigger_price, 265.0);

    // The entry row is executed and linked to its siblings
    let entry = h.store.order("E1").unwrap();
    assert_eq!(entry.status, OrderStatus::Executed);
    assert_eq!(entry.executed_price, Some(250.0));
    let sl_id = entry.sl_order_id.clone().unwrap();
    let tp_id = entry.tp_order_id.clone().unwrap();

    // Siblings own the lifecycle now; the guard is disarmed
    assert_eq!(h.watcher.tracked_count(), 2);
    assert_eq!(h.watcher.active_guard_count(), 0);
    let sl_row = h.store.order(&sl_id).unwrap();
    assert_eq!(sl_row.kind, OrderKind::StopLoss);
    assert_eq!(sl_row.parent_order_id.as_deref(), Some("E1"));

    // Poll 3: both exits alive, nothing changes
    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(h.watcher.tracked_count(), 2);

    // Poll 4: TP fires at 265, SL must be cancelled in the same iteration
    h.broker.set_state_and_price(&tp_id, StopOrderState::Executed, 265.0);
    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);

    assert!(h.broker.cancelled.lock().contains(&sl_id));
    assert_eq!(h.watcher.tracked_count(), 0);

    let tp_row = h.store.order(&tp_id).unwrap();
    assert_eq!(tp_row.status, OrderStatus::Executed);
    assert_eq!(tp_row.pnl_rub, Some(1500.0));
    let sl_row = h.store.order(&sl_id).unwrap();
    assert_eq!(sl_row.status, OrderStatus::Cancelled);
    assert_eq!(sl_row.cancel_reason.as_deref(), Some("opposite_triggered"));

    // Stats: +2 orders (SL, TP), one TP fired, +1500 RUB
    let settings = h.store.settings_snapshot();
    assert_eq!(settings.total_orders_placed, 2);
    assert_eq!(settings.total_tp_triggered, 1);
    assert_eq!(settings.total_sl_triggered, 0);
    assert_eq!(settings.total_pnl_rub, 1500.0);
}

#[tokio::test]
async fn stop_loss_fill_records_loss_and_feeds_daily_counter() {
    let h = auto_harness();

    let sl = exit_order("S1", OrderKind::StopLoss, "E1");
    h.store.insert_order(sl.clone());
    h.watcher.track_order(sl).await;
    let tp = exit_order("T1", OrderKind::TakeProfit, "E1");
    h.store.insert_order(tp.clone());
    h.watcher.track_order(tp).await;

    h.broker.add_listed("S1", "F1", StopOrderState::Executed, 245.0);
    h.broker.add_listed("T1", "F1", StopOrderState::Active, 265.0);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);

    let sl_row = h.store.order("S1").unwrap();
    assert_eq!(sl_row.status, OrderStatus::Executed);
    assert_eq!(sl_row.pnl_rub, Some(-500.0));

    // OCO: the TP sibling went away with the SL fill
    assert!(h.broker.cancelled.lock().contains(&"T1".to_string()));
    assert_eq!(h.store.order("T1").unwrap().status, OrderStatus::Cancelled);

    // The realised loss feeds the validator's daily cap
    assert_eq!(h.validator.daily_loss(), 500.0);

    let settings = h.store.settings_snapshot();
    assert_eq!(settings.total_sl_triggered, 1);
    assert_eq!(settings.total_pnl_rub, -500.0);
}

// =============================================================================
// S2: SL placement failure -> emergency close
// =============================================================================

#[tokio::test]
async fn s2_sl_failure_triggers_emergency_close() {
    let h = harness(MemoryStore::active(BotMode::Auto), Duration::from_millis(50));
    h.broker.fail_sl_placement.store(true, Ordering::SeqCst);

    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    h.broker.add_listed("E1", "F1", StopOrderState::Executed, 250.0);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);

    // SL rejected, guard armed, TP attempted regardless
    assert!(h.broker.placed_of_kind(StopOrderKind::StopLoss).is_empty());
    assert_eq!(h.broker.placed_of_kind(StopOrderKind::TakeProfit).len(), 1);
    assert_eq!(h.watcher.active_guard_count(), 1);
    assert!(h.notifier.contains("CRITICAL: SL not placed"));

    // Guard deadline passes: market sell goes out
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.broker.market_orders.lock().as_slice(), &[("F1".to_string(), 10)]);
    assert!(h.notifier.contains("EMERGENCY CLOSE"));
    assert_eq!(h.watcher.active_guard_count(), 0);

    // Entry recorded as executed; no stop-loss row exists
    let entry = h.store.order("E1").unwrap();
    assert_eq!(entry.status, OrderStatus::Executed);
    assert!(entry.sl_order_id.is_none());

    // The TP child is gone from tracking, and the operator is told it may
    // still be live on the exchange
    assert_eq!(h.watcher.tracked_count(), 0);
    assert!(h.notifier.contains("may still be live"));
    assert!(h.broker.cancelled.lock().is_empty());
}

#[tokio::test]
async fn emergency_close_failure_escalates_without_retry() {
    let h = harness(MemoryStore::active(BotMode::Auto), Duration::from_millis(50));
    h.broker.fail_sl_placement.store(true, Ordering::SeqCst);
    h.broker.fail_market_orders.store(true, Ordering::SeqCst);

    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    h.broker.add_listed("E1", "F1", StopOrderState::Executed, 250.0);

    h.watcher.poll_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(h.broker.market_orders.lock().is_empty());
    assert!(h.notifier.contains("CLOSE IT MANUALLY"));
    // one attempt only
    assert_eq!(h.watcher.active_guard_count(), 0);
}

#[tokio::test]
async fn sl_success_disarms_guard_before_it_fires() {
    let h = harness(MemoryStore::active(BotMode::Auto), Duration::from_millis(50));

    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    h.broker.add_listed("E1", "F1", StopOrderState::Executed, 250.0);

    h.watcher.poll_once().await.unwrap();
    assert_eq!(h.watcher.active_guard_count(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.broker.market_orders.lock().is_empty());
}

// =============================================================================
// S3: kill switch mid-iteration
// =============================================================================

#[tokio::test]
async fn s3_kill_switch_aborts_the_iteration() {
    let h = auto_harness();

    for id in ["A1", "B1", "C1"] {
        h.store.insert_order(entry_order(id));
        h.watcher.track_order(entry_order(id)).await;
        h.broker.add_listed(id, "F1", StopOrderState::Active, 250.0);
    }

    // Loop head + first per-order check succeed, then the switch is off
    h.store.deactivate_after_reads(2);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Aborted);

    // Nothing was mutated; the tracked set survives for the next poll
    assert_eq!(h.watcher.tracked_count(), 3);
    assert!(h.broker.placed_stops.lock().is_empty());
    assert!(h.broker.cancelled.lock().is_empty());
}

// =============================================================================
// P4: inactive bot initiates nothing
// =============================================================================

#[tokio::test]
async fn p4_inactive_bot_never_touches_the_broker() {
    let h = harness(MemoryStore::new(), Duration::from_secs(10));

    h.store.insert_order(entry_order("E1"));
    {
        // bypass track_order (it refuses while inactive) to simulate state
        // left over from before the switch flipped
        h.store.set_active_now(true);
        h.watcher.track_order(entry_order("E1")).await;
        h.store.set_active_now(false);
    }
    h.broker.add_listed("E1", "F1", StopOrderState::Executed, 250.0);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Inactive);
    assert_eq!(h.broker.list_calls.load(Ordering::SeqCst), 0);
    assert!(h.broker.placed_stops.lock().is_empty());
}

#[tokio::test]
async fn pause_until_in_future_idles_the_watcher() {
    let h = auto_harness();
    h.store.set_pause_until(chrono::Utc::now() + chrono::Duration::minutes(10));

    h.store.insert_order(entry_order("E1"));
    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Inactive);
}

#[tokio::test]
async fn store_failure_reads_as_inactive() {
    let h = auto_harness();
    h.store.insert_order(entry_order("E1"));
    h.store.fail_all.store(true, Ordering::SeqCst);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Inactive);
    assert_eq!(h.broker.list_calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// S4: restart recovery must not duplicate the SL
// =============================================================================

#[tokio::test]
async fn s4_recovery_skips_sl_placement_when_sibling_exists() {
    let h = auto_harness();

    // Store state from the previous run: pending entry + its pending SL
    h.store.insert_order(entry_order("E2"));
    h.store.insert_order(exit_order("S2", OrderKind::StopLoss, "E2"));

    h.watcher.hydrate().await;
    assert_eq!(h.watcher.tracked_count(), 2);
    assert!(h.notifier.contains("Restored 2 order(s)"));

    // First poll after restart: the entry filled during downtime
    h.broker.add_listed("E2", "F1", StopOrderState::Executed, 300.0);
    h.broker.add_listed("S2", "F1", StopOrderState::Active, 245.0);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);

    // No second SL, no guard, entry settled, the SL keeps the lifecycle
    assert!(h.broker.placed_stops.lock().is_empty());
    assert_eq!(h.watcher.active_guard_count(), 0);
    assert_eq!(h.store.order("E2").unwrap().status, OrderStatus::Executed);
    assert_eq!(h.watcher.tracked_count(), 1);
    assert!(h.watcher.tracked_orders().iter().any(|o| o.order_id == "S2"));
}

// =============================================================================
// Missing-order resolution
// =============================================================================

#[tokio::test]
async fn missing_entry_with_position_resolves_to_executed() {
    let h = auto_harness();

    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    // Not listed any more, but the shares are in the portfolio
    h.broker.add_position("F1", 100.0, 251.0);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);

    let entry = h.store.order("E1").unwrap();
    assert_eq!(entry.status, OrderStatus::Executed);
    // the portfolio average is the executed price
    assert_eq!(entry.executed_price, Some(251.0));

    // Exits follow the reconstructed fill price
    let sls = h.broker.placed_of_kind(StopOrderKind::StopLoss);
    assert_eq!(sls[0].trigger_price, 246.0);
}

#[tokio::test]
async fn missing_entry_without_position_resolves_to_cancelled() {
    let h = auto_harness();

    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    // listing empty, portfolio empty

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);

    let entry = h.store.order("E1").unwrap();
    assert_eq!(entry.status, OrderStatus::Cancelled);
    assert_eq!(entry.cancel_reason.as_deref(), Some("cancelled_on_exchange"));
    assert_eq!(h.watcher.tracked_count(), 0);
    assert!(h.broker.placed_stops.lock().is_empty());
}

#[tokio::test]
async fn missing_exit_resolves_to_cancelled_without_portfolio_lookup() {
    let h = auto_harness();

    let sl = exit_order("S1", OrderKind::StopLoss, "E1");
    h.store.insert_order(sl.clone());
    h.watcher.track_order(sl).await;
    // a position exists, but exits never consult the portfolio
    h.broker.add_position("F1", 100.0, 250.0);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(h.store.order("S1").unwrap().status, OrderStatus::Cancelled);
}

// =============================================================================
// Modes
// =============================================================================

#[tokio::test]
async fn manual_mode_fill_notifies_and_places_nothing() {
    let h = harness(MemoryStore::active(BotMode::Manual), Duration::from_secs(10));

    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    h.broker.add_listed("E1", "F1", StopOrderState::Executed, 250.0);

    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Completed);

    assert!(h.broker.placed_stops.lock().is_empty());
    assert_eq!(h.watcher.active_guard_count(), 0);
    assert_eq!(h.watcher.tracked_count(), 0);
    assert_eq!(h.store.order("E1").unwrap().status, OrderStatus::Executed);
    assert!(h.notifier.contains("Mode: MANUAL"));
}

#[tokio::test]
async fn monitor_only_mode_stays_silent_about_actions() {
    let h = harness(MemoryStore::active(BotMode::MonitorOnly), Duration::from_secs(10));

    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    h.broker.add_listed("E1", "F1", StopOrderState::Executed, 250.0);

    h.watcher.poll_once().await.unwrap();

    assert!(h.broker.placed_stops.lock().is_empty());
    assert!(!h.notifier.contains("Position opened"));
    assert_eq!(h.store.order("E1").unwrap().status, OrderStatus::Executed);
}

// =============================================================================
// OCO sibling lookup fallback
// =============================================================================

#[tokio::test]
async fn sibling_cancel_falls_back_to_ticker_lookup() {
    let h = auto_harness();

    // Sibling rows whose parent ids diverged (degraded recovery state)
    let sl = exit_order("S1", OrderKind::StopLoss, "E-old");
    let tp = exit_order("T1", OrderKind::TakeProfit, "E-new");
    h.store.insert_order(sl.clone());
    h.store.insert_order(tp.clone());
    h.watcher.track_order(sl).await;
    h.watcher.track_order(tp).await;

    h.broker.add_listed("S1", "F1", StopOrderState::Executed, 245.0);
    h.broker.add_listed("T1", "F1", StopOrderState::Active, 265.0);

    h.watcher.poll_once().await.unwrap();

    assert!(h.broker.cancelled.lock().contains(&"T1".to_string()));
    assert_eq!(h.watcher.tracked_count(), 0);
}

// =============================================================================
// Misc
// =============================================================================

#[tokio::test]
async fn track_order_is_blocked_while_inactive() {
    let h = harness(MemoryStore::new(), Duration::from_secs(10));
    h.watcher.track_order(entry_order("E1")).await;
    assert_eq!(h.watcher.tracked_count(), 0);
}

#[tokio::test]
async fn listing_failure_bubbles_up_for_the_streak_counter() {
    let h = auto_harness();
    h.store.insert_order(entry_order("E1"));
    h.watcher.track_order(entry_order("E1")).await;
    h.broker.fail_listing.store(true, Ordering::SeqCst);

    assert!(h.watcher.poll_once().await.is_err());
    // tracked state untouched by the failed iteration
    assert_eq!(h.watcher.tracked_count(), 1);
}

#[tokio::test]
async fn empty_tracked_set_idles() {
    let h = auto_harness();
    assert_eq!(h.watcher.poll_once().await.unwrap(), PollOutcome::Idle);
    assert_eq!(h.broker.list_calls.load(Ordering::SeqCst), 0);
}
