//! Shared test doubles: a scriptable broker, an in-memory store and a
//! recording notifier.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use supervisor::domain::ports::{
    BrokerPort, BrokerStopOrder, Notifier, OrderStats, PortfolioPosition, StatsDelta,
    StopOrderKind, StopOrderRequest, StopOrderState, Store, TrackedOrderPatch,
};
use supervisor::{
    BotMode, BotSettings, BrokerError, OrderKind, OrderStatus, ShareSnapshot, StoreError,
    TrackedOrder,
};

// =============================================================================
// MockBroker
// =============================================================================

/// Broker double. The test scripts the listing/portfolio/prices and reads
/// back every mutation the supervisor attempted.
#[derive(Default)]
pub struct MockBroker {
    pub listing: Mutex<HashMap<String, BrokerStopOrder>>,
    pub portfolio: Mutex<Vec<PortfolioPosition>>,
    pub last_prices: Mutex<HashMap<String, f64>>,

    /// Reject every stop-loss placement while set.
    pub fail_sl_placement: AtomicBool,
    /// Reject every buy-side placement while set.
    pub fail_buy_placement: AtomicBool,
    /// Make buy-side failures transient (Unavailable) instead of rejections.
    pub fail_buy_transient: AtomicBool,
    /// Fail every market order while set.
    pub fail_market_orders: AtomicBool,
    /// Fail the listing call while set.
    pub fail_listing: AtomicBool,

    pub placed_stops: Mutex<Vec<(String, StopOrderRequest)>>,
    pub market_orders: Mutex<Vec<(String, i32)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub list_calls: AtomicU64,

    next_id: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listed(&self, order_id: &str, figi: &str, state: StopOrderState, trigger_price: f64) {
        self.listing.lock().insert(
            order_id.to_string(),
            BrokerStopOrder {
                order_id: order_id.to_string(),
                figi: figi.to_string(),
                side: supervisor::OrderSide::Buy,
                kind: StopOrderKind::TakeProfit,
                trigger_price,
                quantity: 10,
                state,
            },
        );
    }

    pub fn set_state(&self, order_id: &str, state: StopOrderState) {
        if let Some(order) = self.listing.lock().get_mut(order_id) {
            order.state = state;
        }
    }

    pub fn set_state_and_price(&self, order_id: &str, state: StopOrderState, trigger_price: f64) {
        if let Some(order) = self.listing.lock().get_mut(order_id) {
            order.state = state;
            order.trigger_price = trigger_price;
        }
    }

    pub fn remove_listed(&self, order_id: &str) {
        self.listing.lock().remove(order_id);
    }

    pub fn add_position(&self, figi: &str, quantity: f64, average_price: f64) {
        self.portfolio.lock().push(PortfolioPosition {
            figi: figi.to_string(),
            quantity,
            average_price,
        });
    }

    pub fn placed_of_kind(&self, kind: StopOrderKind) -> Vec<StopOrderRequest> {
        self.placed_stops
            .lock()
            .iter()
            .filter(|(_, req)| req.kind == kind)
            .map(|(_, req)| req.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerPort for MockBroker {
    async fn place_stop_order(&self, req: StopOrderRequest) -> Result<String, BrokerError> {
        if req.kind == StopOrderKind::StopLoss && self.fail_sl_placement.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected("insufficient margin".to_string()));
        }
        if req.side == supervisor::OrderSide::Buy && self.fail_buy_placement.load(Ordering::SeqCst)
        {
            if self.fail_buy_transient.load(Ordering::SeqCst) {
                return Err(BrokerError::Unavailable("gateway timeout".to_string()));
            }
            return Err(BrokerError::Rejected("instrument unavailable".to_string()));
        }

        let order_id = format!("M{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listing.lock().insert(
            order_id.clone(),
            BrokerStopOrder {
                order_id: order_id.clone(),
                figi: req.figi.clone(),
                side: req.side,
                kind: req.kind,
                trigger_price: req.trigger_price,
                quantity: req.quantity_lots,
                state: StopOrderState::Active,
            },
        );
        self.placed_stops.lock().push((order_id.clone(), req));
        Ok(order_id)
    }

    async fn cancel_stop_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.cancelled.lock().push(order_id.to_string());
        if let Some(order) = self.listing.lock().get_mut(order_id) {
            order.state = StopOrderState::Cancelled;
        }
        Ok(())
    }

    async fn list_stop_orders(&self) -> Result<Vec<BrokerStopOrder>, BrokerError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("listing down".to_string()));
        }
        Ok(self.listing.lock().values().cloned().collect())
    }

    async fn get_portfolio(&self) -> Result<Vec<PortfolioPosition>, BrokerError> {
        Ok(self.portfolio.lock().clone())
    }

    async fn place_market_order(
        &self,
        figi: &str,
        quantity_lots: i32,
        _side: supervisor::OrderSide,
    ) -> Result<String, BrokerError> {
        if self.fail_market_orders.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("orders service down".to_string()));
        }
        self.market_orders.lock().push((figi.to_string(), quantity_lots));
        Ok(format!("MKT{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn get_last_price(&self, figi: &str) -> Result<f64, BrokerError> {
        self.last_prices
            .lock()
            .get(figi)
            .copied()
            .ok_or_else(|| BrokerError::Unavailable(format!("no price for {figi}")))
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

struct StoreInner {
    settings: BotSettings,
    orders: HashMap<String, TrackedOrder>,
    snapshots: Vec<ShareSnapshot>,
}

/// In-memory [`Store`] with scriptable failure and kill-switch behaviour.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    /// Every read/write fails while set (fail-closed paths).
    pub fail_all: AtomicBool,
    /// When >= 0: that many further settings reads succeed with the
    /// current state, then `is_active` flips to false.
    deactivate_after_reads: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                settings: BotSettings::defaults(),
                orders: HashMap::new(),
                snapshots: Vec::new(),
            }),
            fail_all: AtomicBool::new(false),
            deactivate_after_reads: AtomicI64::new(-1),
        }
    }

    /// Active in the given mode.
    pub fn active(mode: BotMode) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            inner.settings.is_active = true;
            inner.settings.mode = mode;
        }
        store
    }

    pub fn set_active_now(&self, active: bool) {
        self.inner.lock().settings.is_active = active;
    }

    pub fn set_mode_now(&self, mode: BotMode) {
        self.inner.lock().settings.mode = mode;
    }

    pub fn set_pause_until(&self, until: DateTime<Utc>) {
        self.inner.lock().settings.pause_until = Some(until);
    }

    /// Let `reads` settings reads succeed, then flip the kill switch off.
    pub fn deactivate_after_reads(&self, reads: i64) {
        self.deactivate_after_reads.store(reads, Ordering::SeqCst);
    }

    pub fn insert_order(&self, order: TrackedOrder) {
        self.inner.lock().orders.insert(order.order_id.clone(), order);
    }

    pub fn order(&self, order_id: &str) -> Option<TrackedOrder> {
        self.inner.lock().orders.get(order_id).cloned()
    }

    pub fn set_snapshots(&self, snapshots: Vec<ShareSnapshot>) {
        self.inner.lock().snapshots = snapshots;
    }

    pub fn settings_snapshot(&self) -> BotSettings {
        self.inner.lock().settings.clone()
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_settings(&self) -> Result<BotSettings, StoreError> {
        self.check_failure()?;

        let remaining = self.deactivate_after_reads.load(Ordering::SeqCst);
        if remaining >= 0 {
            if remaining == 0 {
                self.inner.lock().settings.is_active = false;
            } else {
                self.deactivate_after_reads.store(remaining - 1, Ordering::SeqCst);
            }
        }

        Ok(self.inner.lock().settings.clone())
    }

    async fn set_active(
        &self,
        active: bool,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError> {
        self.check_failure()?;
        let mut inner = self.inner.lock();
        inner.settings.is_active = active;
        if active {
            inner.settings.pause_until = None;
        }
        inner.settings.last_change_reason = Some(reason.to_string());
        inner.settings.last_change_by = Some(by.to_string());
        inner.settings.last_change_at = Some(Utc::now());
        Ok(inner.settings.clone())
    }

    async fn set_mode(
        &self,
        mode: BotMode,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError> {
        self.check_failure()?;
        let mut inner = self.inner.lock();
        inner.settings.mode = mode;
        inner.settings.last_change_reason = Some(reason.to_string());
        inner.settings.last_change_by = Some(by.to_string());
        inner.settings.last_change_at = Some(Utc::now());
        Ok(inner.settings.clone())
    }

    async fn pause_until(
        &self,
        until: DateTime<Utc>,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError> {
        self.check_failure()?;
        let mut inner = self.inner.lock();
        inner.settings.is_active = false;
        inner.settings.pause_until = Some(until);
        inner.settings.last_change_reason = Some(reason.to_string());
        inner.settings.last_change_by = Some(by.to_string());
        Ok(inner.settings.clone())
    }

    async fn save_tracked(&self, order: &TrackedOrder) -> Result<(), StoreError> {
        self.check_failure()?;
        self.inner.lock().orders.insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    async fn update_tracked(
        &self,
        order_id: &str,
        patch: TrackedOrderPatch,
    ) -> Result<bool, StoreError> {
        self.check_failure()?;
        let mut inner = self.inner.lock();
        let Some(order) = inner.orders.get_mut(order_id) else {
            return Ok(false);
        };
        if let Some(status) = patch.status {
            order.status = status;
        }
        if let Some(is_executed) = patch.is_executed {
            order.is_executed = is_executed;
        }
        if patch.executed_price.is_some() {
            order.executed_price = patch.executed_price;
        }
        if patch.executed_at.is_some() {
            order.executed_at = patch.executed_at;
        }
        if patch.pnl_rub.is_some() {
            order.pnl_rub = patch.pnl_rub;
        }
        if patch.pnl_pct.is_some() {
            order.pnl_pct = patch.pnl_pct;
        }
        if patch.sl_order_id.is_some() {
            order.sl_order_id = patch.sl_order_id;
        }
        if patch.tp_order_id.is_some() {
            order.tp_order_id = patch.tp_order_id;
        }
        if patch.cancel_reason.is_some() {
            order.cancel_reason = patch.cancel_reason;
        }
        order.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_executed(
        &self,
        order_id: &str,
        executed_price: f64,
        _reason: &str,
        pnl_rub: Option<f64>,
        pnl_pct: Option<f64>,
    ) -> Result<bool, StoreError> {
        self.update_tracked(
            order_id,
            TrackedOrderPatch {
                status: Some(OrderStatus::Executed),
                is_executed: Some(true),
                executed_price: Some(executed_price),
                executed_at: Some(Utc::now()),
                pnl_rub,
                pnl_pct,
                ..TrackedOrderPatch::default()
            },
        )
        .await
    }

    async fn mark_cancelled(&self, order_id: &str, reason: &str) -> Result<bool, StoreError> {
        self.update_tracked(
            order_id,
            TrackedOrderPatch {
                status: Some(OrderStatus::Cancelled),
                cancel_reason: Some(reason.to_string()),
                ..TrackedOrderPatch::default()
            },
        )
        .await
    }

    async fn link_siblings(
        &self,
        entry_id: &str,
        sl_id: Option<&str>,
        tp_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.update_tracked(
            entry_id,
            TrackedOrderPatch {
                sl_order_id: sl_id.map(str::to_string),
                tp_order_id: tp_id.map(str::to_string),
                ..TrackedOrderPatch::default()
            },
        )
        .await
    }

    async fn get_tracked(&self, order_id: &str) -> Result<Option<TrackedOrder>, StoreError> {
        self.check_failure()?;
        Ok(self.inner.lock().orders.get(order_id).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<TrackedOrder>, StoreError> {
        self.check_failure()?;
        let mut orders: Vec<TrackedOrder> = self
            .inner
            .lock()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<TrackedOrder>, StoreError> {
        self.check_failure()?;
        Ok(self
            .inner
            .lock()
            .orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect())
    }

    async fn list_by_ticker(&self, ticker: &str) -> Result<Vec<TrackedOrder>, StoreError> {
        self.check_failure()?;
        Ok(self
            .inner
            .lock()
            .orders
            .values()
            .filter(|o| o.ticker == ticker)
            .cloned()
            .collect())
    }

    async fn increment_stats(&self, delta: StatsDelta) -> Result<(), StoreError> {
        self.check_failure()?;
        let mut inner = self.inner.lock();
        inner.settings.total_orders_placed += delta.orders;
        inner.settings.total_sl_triggered += delta.sl_triggered;
        inner.settings.total_tp_triggered += delta.tp_triggered;
        inner.settings.total_pnl_rub += delta.pnl_rub;
        Ok(())
    }

    async fn order_stats(&self) -> Result<OrderStats, StoreError> {
        self.check_failure()?;
        let inner = self.inner.lock();
        let mut stats = OrderStats::default();
        for order in inner.orders.values() {
            match order.status {
                OrderStatus::Pending => stats.pending += 1,
                OrderStatus::Executed => {
                    stats.executed += 1;
                    stats.total_pnl_rub += order.pnl_rub.unwrap_or(0.0);
                }
                OrderStatus::Cancelled => stats.cancelled += 1,
            }
            match order.kind {
                OrderKind::EntryBuy => stats.entries += 1,
                OrderKind::StopLoss => stats.stop_losses += 1,
                OrderKind::TakeProfit => stats.take_profits += 1,
            }
        }
        Ok(stats)
    }

    async fn cleanup_old_orders(&self, days: i64) -> Result<u64, StoreError> {
        self.check_failure()?;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut inner = self.inner.lock();
        let before = inner.orders.len();
        inner
            .orders
            .retain(|_, o| o.status == OrderStatus::Pending || o.updated_at >= cutoff);
        Ok((before - inner.orders.len()) as u64)
    }

    async fn load_snapshots(&self) -> Result<Vec<ShareSnapshot>, StoreError> {
        self.check_failure()?;
        Ok(self.inner.lock().snapshots.clone())
    }
}

// =============================================================================
// RecordingNotifier
// =============================================================================

/// Captures every notification for later assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(needle))
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// The S1 fixture: SBER, figi F1, lot 10, ATR 5.
pub fn sber_snapshot() -> ShareSnapshot {
    ShareSnapshot {
        ticker: "SBER".to_string(),
        figi: "F1".to_string(),
        lot_size: 10,
        entry_price: 250.0,
        stop_price: 245.0,
        take_price: 265.0,
        stop_offset: 5.0,
        take_offset: 15.0,
        atr: 5.0,
        position_size: 100,
        last_price: 252.0,
    }
}

/// A pending entry order matching [`sber_snapshot`].
pub fn entry_order(order_id: &str) -> TrackedOrder {
    TrackedOrder::new_pending(order_id, "SBER", "F1", OrderKind::EntryBuy, 10, 10, 250.0, 245.0, 265.0)
        .with_offsets(5.0, 15.0, 5.0)
        .with_created_by("test")
}

/// A pending exit order for the given parent entry.
pub fn exit_order(order_id: &str, kind: OrderKind, parent: &str) -> TrackedOrder {
    TrackedOrder::new_pending(order_id, "SBER", "F1", kind, 10, 10, 250.0, 245.0, 265.0)
        .with_offsets(5.0, 15.0, 5.0)
        .with_parent(parent)
        .with_created_by("auto")
}
