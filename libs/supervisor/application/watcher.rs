//! Position watcher: closes the loop between intent and exchange reality.
//!
//! The watcher polls the stop-order listing, classifies what happened to
//! every tracked order and drives the lifecycle: entry fill -> SL/TP
//! placement under the guard -> sibling cancellation -> bookkeeping. All
//! tracked-set mutations happen on the watcher task; the one external
//! entry point is [`PositionWatcher::track_order`].
//!
//! Safety rules, in order of precedence:
//! - a store read failure means the bot is OFF (fail closed);
//! - the kill switch is re-checked before every per-order action;
//! - an entry fill in auto mode either gets a live SL within the guard
//!   deadline or the position is closed at market.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::guard::SlPlacementGuard;
use crate::application::validator::OrderValidator;
use crate::domain::error::BrokerError;
use crate::domain::models::{BotMode, OrderKind, TrackedOrder};
use crate::domain::ports::{
    BrokerPort, BrokerStopOrder, Notifier, OrderSide, StatsDelta, StopOrderKind, StopOrderRequest,
    StopOrderState, Store,
};
use crate::infrastructure::shutdown::sleep_unless_stopped;

/// How many consecutive failed iterations trigger the long back-off.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Back-off after the error streak is exhausted.
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub sl_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            sl_timeout: Duration::from_secs(10),
        }
    }
}

/// What one iteration of the control loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Kill switch off (or settings unreadable): nothing was touched.
    Inactive,
    /// Nothing tracked, nothing to do.
    Idle,
    /// Every tracked order was classified.
    Completed,
    /// The kill switch flipped mid-iteration; the rest was skipped.
    Aborted,
}

pub struct PositionWatcher {
    broker: Arc<dyn BrokerPort>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    validator: Arc<OrderValidator>,
    cfg: WatcherConfig,
    tracked: Mutex<HashMap<String, TrackedOrder>>,
    /// Executed order ids, so one fill is never processed twice.
    settled: Mutex<HashSet<String>>,
    guard: SlPlacementGuard,
    running: AtomicBool,
}

impl PositionWatcher {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        validator: Arc<OrderValidator>,
        cfg: WatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            store,
            notifier,
            validator,
            cfg,
            tracked: Mutex::new(HashMap::new()),
            settled: Mutex::new(HashSet::new()),
            guard: SlPlacementGuard::new(),
            running: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Safety checks
    // =========================================================================

    /// Kill switch read; a store failure reads as OFF.
    async fn bot_active(&self) -> bool {
        match self.store.get_settings().await {
            Ok(settings) => settings.effectively_active(Utc::now()),
            Err(e) => {
                error!(error = %e, "settings read failed, treating bot as inactive");
                false
            }
        }
    }

    /// Mode read; a store failure reads as manual.
    async fn bot_mode(&self) -> BotMode {
        match self.store.get_settings().await {
            Ok(settings) => settings.mode,
            Err(e) => {
                error!(error = %e, "mode read failed, falling back to manual");
                BotMode::Manual
            }
        }
    }

    // =========================================================================
    // Tracking
    // =========================================================================

    /// Register a freshly accepted order. The one mutation point outside
    /// the watcher task; blocked while the kill switch is off.
    pub async fn track_order(&self, order: TrackedOrder) {
        if !self.bot_active().await {
            warn!(order_id = %order.order_id, "track_order blocked: bot inactive");
            return;
        }

        info!(
            order_id = %order.order_id,
            ticker = %order.ticker,
            kind = %order.kind,
            "order tracked"
        );
        self.tracked.lock().insert(order.order_id.clone(), order.clone());

        if let Err(e) = self.store.save_tracked(&order).await {
            error!(order_id = %order.order_id, error = %e, "failed to persist tracked order");
        }
    }

    async fn untrack_order(&self, order_id: &str, reason: &str) {
        self.tracked.lock().remove(order_id);
        if let Err(e) = self.store.mark_cancelled(order_id, reason).await {
            error!(order_id, error = %e, "failed to persist cancellation");
        }
        info!(order_id, reason, "order untracked");
    }

    /// Re-hydrate the tracked set from the store. Called once at startup;
    /// fills that happened during downtime reconcile on the first poll.
    pub async fn hydrate(&self) {
        match self.store.list_pending().await {
            Ok(pending) => {
                let count = pending.len();
                {
                    let mut tracked = self.tracked.lock();
                    for order in pending {
                        tracked.insert(order.order_id.clone(), order);
                    }
                }
                info!(count, "pending orders loaded");
                if count > 0 {
                    self.notifier
                        .send(&format!(
                            "🔄 <b>Restored {count} order(s)</b>\nTracked orders reloaded after restart."
                        ))
                        .await;
                }
            }
            Err(e) => error!(error = %e, "failed to load pending orders"),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn tracked_orders(&self) -> Vec<TrackedOrder> {
        let mut orders: Vec<TrackedOrder> = self.tracked.lock().values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    /// Distinct tickers in flight, the "concurrent positions" figure.
    pub fn concurrent_positions(&self) -> usize {
        let tracked = self.tracked.lock();
        let tickers: HashSet<&str> = tracked.values().map(|o| o.ticker.as_str()).collect();
        tickers.len()
    }

    pub fn active_guard_count(&self) -> usize {
        self.guard.active_count()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.guard.cancel_all();
        info!("position watcher stop requested");
    }

    // =========================================================================
    // Control loop
    // =========================================================================

    /// Run until the shutdown flag drops. Hydrates first, then polls at
    /// `poll_interval`, backing off while inactive or after error streaks.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        self.running.store(true, Ordering::Release);
        info!("position watcher starting");

        self.hydrate().await;

        let mut consecutive_errors: u32 = 0;

        while self.is_running() && shutdown.load(Ordering::Acquire) {
            let sleep_for = match self.poll_once().await {
                Ok(PollOutcome::Inactive) => {
                    debug!("watcher idle: bot inactive");
                    consecutive_errors = 0;
                    // check less often while switched off
                    self.cfg.poll_interval * 2
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    self.cfg.poll_interval
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(error = %e, consecutive = consecutive_errors, "watcher iteration failed");

                    if consecutive_errors == 1 {
                        self.notifier
                            .send(&format!(
                                "⚠️ <b>Watcher: error</b>\n📛 {}\n🔄 Continuing...",
                                truncate_chars(&e.to_string(), 200)
                            ))
                            .await;
                    }
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.notifier
                            .send(&format!(
                                "🔴 <b>Watcher: {consecutive_errors} consecutive errors!</b>\n⏳ Backing off for 60 seconds..."
                            ))
                            .await;
                        consecutive_errors = 0;
                        ERROR_BACKOFF
                    } else {
                        self.cfg.poll_interval
                    }
                }
            };

            sleep_unless_stopped(&shutdown, sleep_for).await;
        }

        self.running.store(false, Ordering::Release);
        self.guard.cancel_all();
        info!("position watcher stopped");
    }

    /// One control-loop iteration. Broker listing failures bubble up so
    /// the caller can count the error streak.
    pub async fn poll_once(self: &Arc<Self>) -> Result<PollOutcome, BrokerError> {
        if !self.bot_active().await {
            return Ok(PollOutcome::Inactive);
        }

        if self.tracked.lock().is_empty() {
            return Ok(PollOutcome::Idle);
        }

        let listing = self.broker.list_stop_orders().await?;
        let observed: HashMap<String, BrokerStopOrder> = listing
            .into_iter()
            .map(|order| (order.order_id.clone(), order))
            .collect();

        // Snapshot of keys: handlers add and remove entries while we walk.
        let mut order_ids: Vec<String> = self.tracked.lock().keys().cloned().collect();
        order_ids.sort();

        debug!(count = order_ids.len(), "checking tracked orders");

        for order_id in order_ids {
            // Activity may flip mid-iteration; honour it before each order.
            if !self.bot_active().await {
                info!("iteration interrupted: bot became inactive");
                return Ok(PollOutcome::Aborted);
            }

            let tracked = { self.tracked.lock().get(&order_id).cloned() };
            let Some(tracked) = tracked else { continue };

            if let Err(e) = self.process_order(&tracked, &observed).await {
                // One bad order never stops the loop
                error!(order_id = %tracked.order_id, error = %e, "failed to process order");
            }
        }

        Ok(PollOutcome::Completed)
    }

    // =========================================================================
    // Classification
    // =========================================================================

    async fn process_order(
        self: &Arc<Self>,
        tracked: &TrackedOrder,
        observed: &HashMap<String, BrokerStopOrder>,
    ) -> Result<(), anyhow::Error> {
        if self.settled.lock().contains(&tracked.order_id) {
            return Ok(());
        }

        match observed.get(&tracked.order_id) {
            Some(row) => match row.state {
                StopOrderState::Active => Ok(()),
                StopOrderState::Executed => self.handle_executed(tracked, row.trigger_price).await,
                StopOrderState::Cancelled => {
                    self.handle_cancelled(tracked).await;
                    Ok(())
                }
            },
            None => self.resolve_missing(tracked).await,
        }
    }

    /// The broker no longer lists the order. For entries the portfolio
    /// decides: a live position means the entry filled, otherwise the
    /// order is gone for good.
    async fn resolve_missing(self: &Arc<Self>, tracked: &TrackedOrder) -> Result<(), anyhow::Error> {
        info!(order_id = %tracked.order_id, ticker = %tracked.ticker, "order missing from listing");

        if tracked.kind == OrderKind::EntryBuy {
            let portfolio = self.broker.get_portfolio().await?;
            let position = portfolio
                .iter()
                .find(|p| p.figi == tracked.figi && p.quantity > 0.0);
            if let Some(position) = position {
                return self.handle_executed(tracked, position.average_price).await;
            }
        }

        self.handle_cancelled(tracked).await;
        Ok(())
    }

    async fn handle_executed(
        self: &Arc<Self>,
        tracked: &TrackedOrder,
        executed_price: f64,
    ) -> Result<(), anyhow::Error> {
        self.settled.lock().insert(tracked.order_id.clone());

        {
            let mut map = self.tracked.lock();
            if let Some(entry) = map.get_mut(&tracked.order_id) {
                entry.is_executed = true;
                entry.executed_price = Some(executed_price);
                entry.executed_at = Some(Utc::now());
            }
        }

        info!(
            order_id = %tracked.order_id,
            ticker = %tracked.ticker,
            kind = %tracked.kind,
            price = executed_price,
            "order executed"
        );

        match tracked.kind {
            OrderKind::EntryBuy => {
                self.store
                    .mark_executed(&tracked.order_id, executed_price, "filled", None, None)
                    .await?;
                self.on_entry_executed(tracked, executed_price).await
            }
            OrderKind::StopLoss => self.on_exit_executed(tracked, executed_price).await,
            OrderKind::TakeProfit => self.on_exit_executed(tracked, executed_price).await,
        }
    }

    async fn handle_cancelled(&self, tracked: &TrackedOrder) {
        info!(order_id = %tracked.order_id, ticker = %tracked.ticker, "order cancelled");
        self.notifier
            .send(&format!(
                "⚪ <b>Order cancelled</b>\n📌 {}\n📋 Kind: {}",
                tracked.ticker, tracked.kind
            ))
            .await;
        self.untrack_order(&tracked.order_id, "cancelled_on_exchange").await;
    }

    // =========================================================================
    // Entry fill
    // =========================================================================

    async fn on_entry_executed(
        self: &Arc<Self>,
        tracked: &TrackedOrder,
        executed_price: f64,
    ) -> Result<(), anyhow::Error> {
        let mode = self.bot_mode().await;

        // Exit prices follow the actual fill, not the planned entry
        let sl_price = executed_price - tracked.stop_offset;
        let tp_price = executed_price + tracked.take_offset;

        let sl_pct = if executed_price > 0.0 { tracked.stop_offset / executed_price * 100.0 } else { 0.0 };
        let tp_pct = if executed_price > 0.0 { tracked.take_offset / executed_price * 100.0 } else { 0.0 };
        let potential_loss = tracked.stop_offset * tracked.shares() as f64;
        let potential_profit = tracked.take_offset * tracked.shares() as f64;

        info!(ticker = %tracked.ticker, price = executed_price, mode = %mode, "entry executed");

        if mode != BotMode::MonitorOnly {
            self.notifier
                .send(&format!(
                    "✅ <b>Position opened!</b>\n📌 {}\n💰 Entry: {:.2} RUB\n📦 Size: {} lot(s)\n\n\
                     🛑 SL: {:.2} RUB ({:.2}%)\n🎯 TP: {:.2} RUB ({:.2}%)\n\n\
                     💸 Max loss: {:.0} RUB\n💰 Potential profit: {:.0} RUB",
                    tracked.ticker,
                    executed_price,
                    tracked.quantity,
                    sl_price,
                    sl_pct,
                    tp_price,
                    tp_pct,
                    potential_loss,
                    potential_profit
                ))
                .await;
        }

        if mode != BotMode::Auto {
            if mode == BotMode::Manual {
                self.notifier
                    .send(&format!(
                        "⚠️ <b>Mode: {}</b>\nSL and TP were NOT placed automatically.\n\
                         Place them yourself or switch with /auto",
                        mode.as_str().to_uppercase()
                    ))
                    .await;
            }
            // Position is open but automation ends here
            self.tracked.lock().remove(&tracked.order_id);
            return Ok(());
        }

        // Recovery case: the SL may already exist from a previous run
        let existing_sl = {
            self.tracked
                .lock()
                .values()
                .find(|o| {
                    o.kind == OrderKind::StopLoss
                        && o.parent_order_id.as_deref() == Some(tracked.order_id.as_str())
                })
                .map(|o| o.order_id.clone())
        };
        if let Some(sl_id) = existing_sl {
            info!(
                entry_id = %tracked.order_id,
                sl_id = %sl_id,
                "stop-loss already tracked for this entry, skipping placement"
            );
            self.guard.notify_sl_placed(&tracked.order_id);
            self.tracked.lock().remove(&tracked.order_id);
            return Ok(());
        }

        // Arm the guard BEFORE the placement attempt: if the SL does not
        // register within the deadline the position is closed at market.
        let guard_self = Arc::clone(self);
        let guard_entry = tracked.clone();
        self.guard.start(&tracked.order_id, self.cfg.sl_timeout, async move {
            guard_self.emergency_close(guard_entry, executed_price).await;
        });

        self.place_exits(tracked, executed_price, sl_price, tp_price).await;
        Ok(())
    }

    /// Place the SL, then the TP. The TP is attempted even when the SL
    /// failed; its outcome never affects the emergency path.
    async fn place_exits(
        self: &Arc<Self>,
        entry: &TrackedOrder,
        executed_price: f64,
        sl_price: f64,
        tp_price: f64,
    ) {
        let mut sl_order_id: Option<String> = None;
        let mut tp_order_id: Option<String> = None;

        // Stop-loss first: the position must not stay naked.
        match self
            .broker
            .place_stop_order(StopOrderRequest {
                figi: entry.figi.clone(),
                quantity_lots: entry.quantity,
                trigger_price: sl_price,
                side: OrderSide::Sell,
                kind: StopOrderKind::StopLoss,
            })
            .await
        {
            Ok(new_id) => {
                let sl_order = self.exit_order(entry, OrderKind::StopLoss, &new_id, executed_price, sl_price, tp_price);

                // Durable sibling linkage must exist before the guard is
                // disarmed; a crash in between leaves the guard to expire
                // harmlessly against an already-live SL.
                match self.store.save_tracked(&sl_order).await {
                    Ok(()) => {
                        self.guard.notify_sl_placed(&entry.order_id);
                        info!(order_id = %new_id, ticker = %entry.ticker, price = sl_price, "stop-loss placed");
                        self.tracked.lock().insert(new_id.clone(), sl_order);
                        if let Err(e) = self.store.increment_stats(StatsDelta::orders(1)).await {
                            error!(error = %e, "failed to bump order counter");
                        }
                        sl_order_id = Some(new_id);
                    }
                    Err(e) => {
                        // Unconfirmed durability: leave the guard armed.
                        error!(order_id = %new_id, error = %e, "failed to persist stop-loss");
                    }
                }
            }
            Err(e) => {
                error!(ticker = %entry.ticker, error = %e, "stop-loss placement failed");
                self.notifier
                    .send(&format!(
                        "🚨 <b>CRITICAL: SL not placed!</b>\n📌 {}\n❌ {}\n\n⏳ Emergency close in {} seconds...",
                        entry.ticker,
                        truncate_chars(&e.to_string(), 100),
                        self.cfg.sl_timeout.as_secs()
                    ))
                    .await;
                // The guard keeps ticking and will fire the emergency path.
            }
        }

        // Take-profit second; an un-TP'd position is not life-threatening.
        match self
            .broker
            .place_stop_order(StopOrderRequest {
                figi: entry.figi.clone(),
                quantity_lots: entry.quantity,
                trigger_price: tp_price,
                side: OrderSide::Sell,
                kind: StopOrderKind::TakeProfit,
            })
            .await
        {
            Ok(new_id) => {
                let tp_order = self.exit_order(entry, OrderKind::TakeProfit, &new_id, executed_price, sl_price, tp_price);
                info!(order_id = %new_id, ticker = %entry.ticker, price = tp_price, "take-profit placed");
                if let Err(e) = self.store.save_tracked(&tp_order).await {
                    error!(order_id = %new_id, error = %e, "failed to persist take-profit");
                }
                self.tracked.lock().insert(new_id.clone(), tp_order);
                if let Err(e) = self.store.increment_stats(StatsDelta::orders(1)).await {
                    error!(error = %e, "failed to bump order counter");
                }
                tp_order_id = Some(new_id);
            }
            Err(e) => {
                error!(ticker = %entry.ticker, error = %e, "take-profit placement failed");
                self.notifier
                    .send(&format!("❌ TP not placed for {}: {}", entry.ticker, truncate_chars(&e.to_string(), 100)))
                    .await;
            }
        }

        if sl_order_id.is_some() || tp_order_id.is_some() {
            if let Err(e) = self
                .store
                .link_siblings(&entry.order_id, sl_order_id.as_deref(), tp_order_id.as_deref())
                .await
            {
                error!(entry_id = %entry.order_id, error = %e, "failed to link siblings");
            }
            let mut map = self.tracked.lock();
            if let Some(row) = map.get_mut(&entry.order_id) {
                row.sl_order_id = sl_order_id.clone();
                row.tp_order_id = tp_order_id.clone();
            }
        }

        match (&sl_order_id, &tp_order_id) {
            (Some(_), Some(_)) => {
                self.notifier
                    .send(&format!(
                        "🎯 <b>SL and TP placed!</b>\n📌 {}\n🛑 SL: {:.2} RUB\n🎯 TP: {:.2} RUB",
                        entry.ticker, sl_price, tp_price
                    ))
                    .await;
            }
            (Some(_), None) => {
                self.notifier
                    .send(&format!(
                        "⚠️ <b>Only SL placed!</b>\n📌 {}\n🛑 SL: {:.2} RUB\n❌ TP missing, place it manually",
                        entry.ticker, sl_price
                    ))
                    .await;
            }
            // Without an SL the guard owns the position now.
            (None, _) => {}
        }

        // The siblings own the lifecycle from here.
        if sl_order_id.is_some() {
            self.tracked.lock().remove(&entry.order_id);
        }
    }

    fn exit_order(
        &self,
        entry: &TrackedOrder,
        kind: OrderKind,
        order_id: &str,
        executed_price: f64,
        sl_price: f64,
        tp_price: f64,
    ) -> TrackedOrder {
        TrackedOrder::new_pending(
            order_id,
            entry.ticker.clone(),
            entry.figi.clone(),
            kind,
            entry.quantity,
            entry.lot_size,
            executed_price,
            sl_price,
            tp_price,
        )
        .with_offsets(entry.stop_offset, entry.take_offset, entry.atr)
        .with_parent(entry.order_id.clone())
        .with_created_by("auto")
    }

    // =========================================================================
    // Exit fill
    // =========================================================================

    async fn on_exit_executed(
        self: &Arc<Self>,
        tracked: &TrackedOrder,
        exit_price: f64,
    ) -> Result<(), anyhow::Error> {
        let (pnl_rub, pnl_pct) = tracked.pnl_at(exit_price);
        let is_stop = tracked.kind == OrderKind::StopLoss;
        let reason = if is_stop { "sl_triggered" } else { "tp_triggered" };

        self.store
            .mark_executed(&tracked.order_id, exit_price, reason, Some(pnl_rub), Some(pnl_pct))
            .await?;

        let delta = if is_stop { StatsDelta::sl(pnl_rub) } else { StatsDelta::tp(pnl_rub) };
        if let Err(e) = self.store.increment_stats(delta).await {
            error!(error = %e, "failed to update stats");
        }
        if pnl_rub < 0.0 {
            self.validator.add_daily_loss(-pnl_rub);
        }

        let title = if is_stop { "🛑 <b>STOP-LOSS triggered!</b>" } else { "🎯 <b>TAKE-PROFIT triggered!</b>" };
        self.notifier
            .send(&format!(
                "{title}\n📌 {}\n💰 Entry: {:.2} RUB\n📤 Exit: {:.2} RUB\n📦 Size: {} lot(s)\n💸 P&L: <b>{:+.0} RUB</b> ({:+.2}%)",
                tracked.ticker, tracked.entry_price, exit_price, tracked.quantity, pnl_rub, pnl_pct
            ))
            .await;

        self.cancel_sibling(tracked).await;
        self.tracked.lock().remove(&tracked.order_id);
        Ok(())
    }

    /// OCO: the fill of one exit cancels the other within the same
    /// iteration. Lookup by parent first, ticker+kind as a fallback.
    async fn cancel_sibling(&self, fired: &TrackedOrder) {
        let Some(sibling_kind) = fired.kind.sibling() else { return };

        let sibling = {
            let map = self.tracked.lock();
            map.values()
                .find(|o| {
                    o.kind == sibling_kind
                        && !o.is_executed
                        && o.parent_order_id.is_some()
                        && o.parent_order_id == fired.parent_order_id
                })
                .or_else(|| {
                    map.values()
                        .find(|o| o.kind == sibling_kind && o.ticker == fired.ticker && !o.is_executed)
                })
                .map(|o| o.order_id.clone())
        };

        let Some(sibling_id) = sibling else {
            debug!(ticker = %fired.ticker, kind = %sibling_kind, "no live sibling to cancel");
            return;
        };

        match self.broker.cancel_stop_order(&sibling_id).await {
            Ok(()) => {
                info!(order_id = %sibling_id, kind = %sibling_kind, "sibling order cancelled");
                self.untrack_order(&sibling_id, "opposite_triggered").await;
                self.notifier
                    .send(&format!("🗑 Paired {} order cancelled", sibling_kind))
                    .await;
            }
            Err(e) => {
                error!(order_id = %sibling_id, error = %e, "failed to cancel sibling order");
            }
        }
    }

    // =========================================================================
    // Emergency close
    // =========================================================================

    /// Last resort when the SL never registered: close the position at
    /// market. Runs from the guard timer, once.
    async fn emergency_close(self: Arc<Self>, entry: TrackedOrder, executed_price: f64) {
        error!(
            ticker = %entry.ticker,
            order_id = %entry.order_id,
            executed_price,
            "EMERGENCY CLOSE: SL placement failed"
        );

        self.notifier
            .send(&format!(
                "🚨🚨🚨 <b>EMERGENCY CLOSE!</b> 🚨🚨🚨\n\n📌 {}\n💰 Entry: {:.2} RUB\n📦 Size: {} lot(s)\n\n\
                 ⚠️ <b>SL was NOT placed within {} seconds!</b>\n\n🔄 Closing the position at market...",
                entry.ticker,
                executed_price,
                entry.quantity,
                self.cfg.sl_timeout.as_secs()
            ))
            .await;

        match self
            .broker
            .place_market_order(&entry.figi, entry.quantity, OrderSide::Sell)
            .await
        {
            Ok(order_id) => {
                info!(order_id = %order_id, ticker = %entry.ticker, "emergency close submitted");
                self.notifier
                    .send(&format!(
                        "✅ <b>Position closed at market</b>\n\n📌 {}\n🔍 Order ID: <code>{order_id}</code>\n\n\
                         ⚠️ Check the fill in your terminal!",
                        entry.ticker
                    ))
                    .await;
                if let Err(e) = self
                    .store
                    .mark_executed(&entry.order_id, executed_price, "emergency_close", None, None)
                    .await
                {
                    error!(order_id = %entry.order_id, error = %e, "failed to persist emergency close");
                }
            }
            Err(e) => {
                error!(ticker = %entry.ticker, error = %e, "emergency close failed");
                // No automatic retry: compounding a broker failure with
                // more orders makes things worse.
                self.notifier
                    .send(&format!(
                        "❌❌❌ <b>FAILED TO CLOSE THE POSITION!</b> ❌❌❌\n\n📌 {}\n📦 Size: {} lot(s)\n💥 {}\n\n\
                         ⚠️⚠️⚠️ <b>CLOSE IT MANUALLY IN THE TERMINAL NOW!</b> ⚠️⚠️⚠️",
                        entry.ticker,
                        entry.quantity,
                        truncate_chars(&e.to_string(), 200)
                    ))
                    .await;
            }
        }

        // Clear the entry and any TP child from tracking. A TP that made
        // it to the exchange stays live there; the operator reconciles.
        let dropped_tp = {
            let mut map = self.tracked.lock();
            map.remove(&entry.order_id);
            let tp_ids: Vec<String> = map
                .values()
                .filter(|o| {
                    o.kind == OrderKind::TakeProfit
                        && o.parent_order_id.as_deref() == Some(entry.order_id.as_str())
                })
                .map(|o| o.order_id.clone())
                .collect();
            for id in &tp_ids {
                map.remove(id);
            }
            tp_ids
        };
        if !dropped_tp.is_empty() {
            warn!(
                entry_id = %entry.order_id,
                tp_ids = ?dropped_tp,
                "take-profit left live on the exchange after emergency close"
            );
            self.notifier
                .send(&format!(
                    "⚠️ A take-profit order for {} may still be live on the exchange. Cancel it manually.",
                    entry.ticker
                ))
                .await;
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
