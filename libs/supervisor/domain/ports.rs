//! Ports: capability sets the orchestration layer depends on.
//!
//! The broker gateway and the database implement these traits in the
//! infrastructure layer; tests supply in-memory doubles. Dependencies flow
//! one way only - an implementation never knows about the watcher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::error::{BrokerError, StoreError};
use crate::domain::models::{BotMode, BotSettings, OrderStatus, ShareSnapshot, TrackedOrder};

// =============================================================================
// Broker vocabulary
// =============================================================================

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Exchange-side stop-order flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOrderKind {
    /// Triggers when the market reaches a favourable price.
    TakeProfit,
    /// Triggers when the market reaches an unfavourable price.
    StopLoss,
}

/// State of a stop-order as reported by the exchange listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOrderState {
    Active,
    Executed,
    Cancelled,
}

/// Request to park a stop-order on the exchange.
///
/// Time-in-force is always good-till-cancel; the entry orders this
/// supervisor places live until filled or explicitly cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct StopOrderRequest {
    pub figi: String,
    pub quantity_lots: i32,
    pub trigger_price: f64,
    pub side: OrderSide,
    pub kind: StopOrderKind,
}

/// One row of the exchange stop-order listing.
#[derive(Debug, Clone)]
pub struct BrokerStopOrder {
    pub order_id: String,
    pub figi: String,
    pub side: OrderSide,
    pub kind: StopOrderKind,
    pub trigger_price: f64,
    pub quantity: i32,
    pub state: StopOrderState,
}

/// One open portfolio position.
#[derive(Debug, Clone)]
pub struct PortfolioPosition {
    pub figi: String,
    /// Quantity in shares; zero rows may be reported after a close.
    pub quantity: f64,
    pub average_price: f64,
}

/// Capability set of the brokerage account.
///
/// All operations are async and may block arbitrarily; every failure is a
/// typed [`BrokerError`] - callers never observe partial success.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Park a stop-order; returns the broker-assigned order id.
    async fn place_stop_order(&self, req: StopOrderRequest) -> Result<String, BrokerError>;

    /// Cancel a stop-order. Idempotent: cancelling an unknown or already
    /// cancelled order is not an error.
    async fn cancel_stop_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// Snapshot of all stop-orders known to the exchange for this account.
    async fn list_stop_orders(&self) -> Result<Vec<BrokerStopOrder>, BrokerError>;

    /// Open positions of the account.
    async fn get_portfolio(&self) -> Result<Vec<PortfolioPosition>, BrokerError>;

    /// Immediate market order. Used only for emergency closes.
    async fn place_market_order(
        &self,
        figi: &str,
        quantity_lots: i32,
        side: OrderSide,
    ) -> Result<String, BrokerError>;

    /// Last traded price of the instrument.
    async fn get_last_price(&self, figi: &str) -> Result<f64, BrokerError>;
}

// =============================================================================
// Store vocabulary
// =============================================================================

/// Field-wise patch for `update_tracked`. `None` leaves the column alone.
#[derive(Debug, Clone, Default)]
pub struct TrackedOrderPatch {
    pub status: Option<OrderStatus>,
    pub is_executed: Option<bool>,
    pub executed_price: Option<f64>,
    pub executed_at: Option<DateTime<Utc>>,
    pub pnl_rub: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub cancel_reason: Option<String>,
}

/// Additive delta applied to the [`BotSettings`] running counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsDelta {
    pub orders: i64,
    pub sl_triggered: i64,
    pub tp_triggered: i64,
    pub pnl_rub: f64,
}

impl StatsDelta {
    pub fn orders(n: i64) -> Self {
        Self { orders: n, ..Self::default() }
    }

    pub fn sl(pnl_rub: f64) -> Self {
        Self { sl_triggered: 1, pnl_rub, ..Self::default() }
    }

    pub fn tp(pnl_rub: f64) -> Self {
        Self { tp_triggered: 1, pnl_rub, ..Self::default() }
    }
}

/// Per-status / per-kind order counts plus realised PnL.
#[derive(Debug, Clone, Default)]
pub struct OrderStats {
    pub pending: i64,
    pub executed: i64,
    pub cancelled: i64,
    pub entries: i64,
    pub stop_losses: i64,
    pub take_profits: i64,
    pub total_pnl_rub: f64,
}

/// Durable repository for settings, tracked orders and statistics.
///
/// Every operation is a single atomic unit. Writes either confirm
/// durability or error; there is no partially applied state for callers
/// to reason about.
#[async_trait]
pub trait Store: Send + Sync {
    /// Settings singleton; created with safe defaults on first call.
    async fn get_settings(&self) -> Result<BotSettings, StoreError>;

    async fn set_active(&self, active: bool, reason: &str, by: &str)
        -> Result<BotSettings, StoreError>;

    async fn set_mode(&self, mode: BotMode, reason: &str, by: &str)
        -> Result<BotSettings, StoreError>;

    async fn pause_until(
        &self,
        until: DateTime<Utc>,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError>;

    /// Upsert by `order_id`.
    async fn save_tracked(&self, order: &TrackedOrder) -> Result<(), StoreError>;

    /// Returns false when the row is missing. Always bumps `updated_at`.
    async fn update_tracked(
        &self,
        order_id: &str,
        patch: TrackedOrderPatch,
    ) -> Result<bool, StoreError>;

    async fn mark_executed(
        &self,
        order_id: &str,
        executed_price: f64,
        reason: &str,
        pnl_rub: Option<f64>,
        pnl_pct: Option<f64>,
    ) -> Result<bool, StoreError>;

    async fn mark_cancelled(&self, order_id: &str, reason: &str) -> Result<bool, StoreError>;

    /// Record exit-order back-references on the entry row.
    async fn link_siblings(
        &self,
        entry_id: &str,
        sl_id: Option<&str>,
        tp_id: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn get_tracked(&self, order_id: &str) -> Result<Option<TrackedOrder>, StoreError>;

    /// All pending rows ordered by `created_at`; the recovery set.
    async fn list_pending(&self) -> Result<Vec<TrackedOrder>, StoreError>;

    async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<TrackedOrder>, StoreError>;

    async fn list_by_ticker(&self, ticker: &str) -> Result<Vec<TrackedOrder>, StoreError>;

    /// Atomic read-modify-write on the settings counters.
    async fn increment_stats(&self, delta: StatsDelta) -> Result<(), StoreError>;

    async fn order_stats(&self) -> Result<OrderStats, StoreError>;

    /// Delete terminal rows older than `days`. Returns the rows removed.
    async fn cleanup_old_orders(&self, days: i64) -> Result<u64, StoreError>;

    /// Read-only view over the externally produced snapshot table.
    async fn load_snapshots(&self) -> Result<Vec<ShareSnapshot>, StoreError>;
}

// =============================================================================
// Notifications
// =============================================================================

/// Outbound operator notifications. Best-effort: implementations log and
/// swallow transport failures so a dead chat never stalls the watcher.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);
}
