//! Core domain models: tracked orders, bot settings, share snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of an order the supervisor is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Entry into a position: a take-profit buy parked below the market.
    EntryBuy,
    /// Stop-loss sell guarding an open position.
    StopLoss,
    /// Take-profit sell guarding an open position.
    TakeProfit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::EntryBuy => "entry_buy",
            OrderKind::StopLoss => "stop_loss",
            OrderKind::TakeProfit => "take_profit",
        }
    }

    /// The exit kind that guards the same position from the other side.
    pub fn sibling(&self) -> Option<OrderKind> {
        match self {
            OrderKind::EntryBuy => None,
            OrderKind::StopLoss => Some(OrderKind::TakeProfit),
            OrderKind::TakeProfit => Some(OrderKind::StopLoss),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, OrderKind::StopLoss | OrderKind::TakeProfit)
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry_buy" => Ok(OrderKind::EntryBuy),
            "stop_loss" => Ok(OrderKind::StopLoss),
            "take_profit" => Ok(OrderKind::TakeProfit),
            other => Err(format!("unknown order kind: {other}")),
        }
    }
}

/// Durable status of a tracked order.
///
/// Transitions form a DAG: `pending -> executed` or `pending -> cancelled`,
/// both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Executed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Executed => "executed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "executed" => Ok(OrderStatus::Executed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Operating mode of the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotMode {
    /// Full automation: SL/TP placed automatically after entry fills.
    Auto,
    /// Notifications only; exits are the operator's job.
    Manual,
    /// Observe and persist, no notifications about actions.
    MonitorOnly,
}

impl BotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotMode::Auto => "auto",
            BotMode::Manual => "manual",
            BotMode::MonitorOnly => "monitor_only",
        }
    }
}

impl fmt::Display for BotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BotMode::Auto),
            "manual" => Ok(BotMode::Manual),
            "monitor_only" => Ok(BotMode::MonitorOnly),
            other => Err(format!("unknown bot mode: {other}")),
        }
    }
}

/// Singleton process-wide settings row (id = 1).
///
/// `is_active = false` is the kill switch: no mutating broker call may be
/// initiated while it is off, except emergency closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSettings {
    pub is_active: bool,
    pub mode: BotMode,
    pub pause_until: Option<DateTime<Utc>>,
    pub last_change_reason: Option<String>,
    pub last_change_by: Option<String>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub total_orders_placed: i64,
    pub total_sl_triggered: i64,
    pub total_tp_triggered: i64,
    pub total_pnl_rub: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BotSettings {
    /// Safe defaults for first boot: switched OFF, manual mode.
    pub fn defaults() -> Self {
        Self {
            is_active: false,
            mode: BotMode::Manual,
            pause_until: None,
            last_change_reason: Some("Initial setup".to_string()),
            last_change_by: Some("system".to_string()),
            last_change_at: Some(Utc::now()),
            total_orders_placed: 0,
            total_sl_triggered: 0,
            total_tp_triggered: 0,
            total_pnl_rub: 0.0,
            updated_at: None,
        }
    }

    /// Kill switch plus pause window in one read.
    pub fn effectively_active(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match self.pause_until {
            Some(until) => until <= now,
            None => true,
        }
    }
}

/// Aggregated statistics derived from [`BotSettings`] counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStats {
    pub total_orders_placed: i64,
    pub total_sl_triggered: i64,
    pub total_tp_triggered: i64,
    pub total_pnl_rub: f64,
    pub win_rate_pct: f64,
}

impl From<&BotSettings> for BotStats {
    fn from(s: &BotSettings) -> Self {
        let closed = s.total_sl_triggered + s.total_tp_triggered;
        let win_rate_pct = if closed > 0 {
            s.total_tp_triggered as f64 / closed as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total_orders_placed: s.total_orders_placed,
            total_sl_triggered: s.total_sl_triggered,
            total_tp_triggered: s.total_tp_triggered,
            total_pnl_rub: s.total_pnl_rub,
            win_rate_pct,
        }
    }
}

/// An order the supervisor observes until it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    /// Broker-assigned id, the primary external key.
    pub order_id: String,
    pub ticker: String,
    pub figi: String,
    pub kind: OrderKind,
    /// Quantity in lots.
    pub quantity: i32,
    pub lot_size: i32,

    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub stop_offset: f64,
    pub take_offset: f64,
    pub atr: f64,

    pub status: OrderStatus,
    pub is_executed: bool,
    pub executed_price: Option<f64>,
    pub executed_at: Option<DateTime<Utc>>,

    /// For SL/TP rows: the entry that opened the position.
    pub parent_order_id: Option<String>,
    /// On entry rows: back-references to the exit siblings.
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,

    pub pnl_rub: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub cancel_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl TrackedOrder {
    /// Fresh pending order as registered right after broker acceptance.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        order_id: impl Into<String>,
        ticker: impl Into<String>,
        figi: impl Into<String>,
        kind: OrderKind,
        quantity: i32,
        lot_size: i32,
        entry_price: f64,
        stop_price: f64,
        target_price: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.into(),
            ticker: ticker.into(),
            figi: figi.into(),
            kind,
            quantity,
            lot_size,
            entry_price,
            stop_price,
            target_price,
            stop_offset: 0.0,
            take_offset: 0.0,
            atr: 0.0,
            status: OrderStatus::Pending,
            is_executed: false,
            executed_price: None,
            executed_at: None,
            parent_order_id: None,
            sl_order_id: None,
            tp_order_id: None,
            pnl_rub: None,
            pnl_pct: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            created_by: None,
        }
    }

    pub fn with_offsets(mut self, stop_offset: f64, take_offset: f64, atr: f64) -> Self {
        self.stop_offset = stop_offset;
        self.take_offset = take_offset;
        self.atr = atr;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_order_id = Some(parent.into());
        self
    }

    pub fn with_created_by(mut self, by: impl Into<String>) -> Self {
        self.created_by = Some(by.into());
        self
    }

    /// Total shares in the order.
    pub fn shares(&self) -> i64 {
        self.quantity as i64 * self.lot_size as i64
    }

    /// Realised PnL for an exit at `exit_price` against the recorded entry.
    pub fn pnl_at(&self, exit_price: f64) -> (f64, f64) {
        let per_share = exit_price - self.entry_price;
        let pnl_rub = per_share * self.shares() as f64;
        let pnl_pct = if self.entry_price > 0.0 {
            per_share / self.entry_price * 100.0
        } else {
            0.0
        };
        (pnl_rub, pnl_pct)
    }
}

/// Per-ticker record produced by the daily analytics pipeline.
///
/// The supervisor treats it as read-only input: it never writes the
/// `share_snapshots` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareSnapshot {
    pub ticker: String,
    pub figi: String,
    pub lot_size: i32,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_price: f64,
    pub stop_offset: f64,
    pub take_offset: f64,
    pub atr: f64,
    /// Suggested position size in shares.
    pub position_size: i32,
    pub last_price: f64,
}

/// A validated buy request awaiting operator confirmation. In-memory only.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub callback_id: String,
    pub ticker: String,
    pub figi: String,
    pub entry_price: f64,
    pub quantity_lots: i32,
    pub lot_size: i32,
    pub sl_price: f64,
    pub tp_price: f64,
    pub risk_rub: f64,
    pub reward_rub: f64,
    pub atr: f64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingConfirmation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
