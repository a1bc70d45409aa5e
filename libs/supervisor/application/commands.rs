//! Operator command surface: parsing, authorisation, dispatch.
//!
//! Transport-agnostic: the chat adapter feeds raw text in and sends the
//! returned reply back. Sensitive commands are gated by the authorised
//! user set; an empty set means any caller may use them.

use std::sync::Arc;

use crate::application::controller::ModeController;
use crate::application::intake::{BuyOutcome, ConfirmOutcome, OrderIntake};
use crate::application::snapshot::SnapshotCache;
use crate::application::watcher::PositionWatcher;
use crate::domain::models::{BotMode, OrderKind, PendingConfirmation};
use crate::domain::ports::Store;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    /// Switch off, optionally for a bounded number of minutes.
    Pause(Option<i64>),
    Resume,
    Auto,
    Manual,
    Monitor,
    Kill,
    Buy {
        ticker: String,
        price: Option<f64>,
        lots: Option<i32>,
    },
    Orders,
    Stats,
    Confirm(String),
    CancelConfirm(String),
    Help,
}

impl Command {
    /// Parse a chat line. The leading slash and a `@botname` suffix on the
    /// command word are both optional.
    pub fn parse(text: &str) -> Option<Command> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?;
        let head = head.strip_prefix('/').unwrap_or(head);
        let head = head.split('@').next().unwrap_or(head).to_lowercase();

        match head.as_str() {
            "status" => Some(Command::Status),
            "pause" => {
                let minutes = parts.next().and_then(|m| m.parse::<i64>().ok()).filter(|m| *m > 0);
                Some(Command::Pause(minutes))
            }
            "resume" => Some(Command::Resume),
            "auto" => Some(Command::Auto),
            "manual" => Some(Command::Manual),
            "monitor" => Some(Command::Monitor),
            "kill" => Some(Command::Kill),
            "orders" => Some(Command::Orders),
            "stats" => Some(Command::Stats),
            "help" | "start" => Some(Command::Help),
            "confirm" => Some(Command::Confirm(parts.next()?.to_string())),
            "cancel" => Some(Command::CancelConfirm(parts.next()?.to_string())),
            "buy" => {
                let ticker = parts.next()?.to_uppercase();
                let price = parts.next().and_then(|p| p.parse::<f64>().ok());
                let lots = parts.next().and_then(|l| l.parse::<i32>().ok());
                Some(Command::Buy { ticker, price, lots })
            }
            _ => None,
        }
    }

    /// Commands that mutate state or reach the broker.
    pub fn is_sensitive(&self) -> bool {
        !matches!(
            self,
            Command::Status | Command::Orders | Command::Stats | Command::Help
        )
    }
}

pub struct CommandHandler {
    controller: Arc<ModeController>,
    intake: Arc<OrderIntake>,
    watcher: Arc<PositionWatcher>,
    snapshots: Arc<SnapshotCache>,
    store: Arc<dyn Store>,
    authorized_users: Vec<i64>,
}

impl CommandHandler {
    pub fn new(
        controller: Arc<ModeController>,
        intake: Arc<OrderIntake>,
        watcher: Arc<PositionWatcher>,
        snapshots: Arc<SnapshotCache>,
        store: Arc<dyn Store>,
        authorized_users: Vec<i64>,
    ) -> Self {
        Self {
            controller,
            intake,
            watcher,
            snapshots,
            store,
            authorized_users,
        }
    }

    fn is_authorized(&self, user_id: i64) -> bool {
        self.authorized_users.is_empty() || self.authorized_users.contains(&user_id)
    }

    /// Handle one chat line and produce the reply text.
    pub async fn handle(&self, user_id: i64, text: &str) -> String {
        let Some(command) = Command::parse(text) else {
            return "❓ Unknown command. Try /help".to_string();
        };

        if command.is_sensitive() && !self.is_authorized(user_id) {
            return "🚫 You are not authorised to run this command".to_string();
        }

        let by = user_id.to_string();
        match command {
            Command::Help => self.help(),
            Command::Status => self.status().await,
            Command::Orders => self.orders(),
            Command::Stats => self.stats().await,
            Command::Pause(None) => match self.controller.pause("paused", &by).await {
                Ok(_) => "⏸ <b>Bot paused</b>\nNo new actions until /resume".to_string(),
                Err(e) => format!("❌ Failed to pause: {e}"),
            },
            Command::Pause(Some(minutes)) => {
                let until = chrono::Utc::now() + chrono::Duration::minutes(minutes);
                match self
                    .controller
                    .pause_until(until, &format!("paused for {minutes} min"), &by)
                    .await
                {
                    Ok(_) => format!(
                        "⏸ <b>Bot paused for {minutes} min</b>\nInactive until {} UTC (or /resume)",
                        until.format("%H:%M")
                    ),
                    Err(e) => format!("❌ Failed to pause: {e}"),
                }
            }
            Command::Resume => match self.controller.resume("resumed", &by).await {
                Ok(_) => "▶️ <b>Bot resumed</b>".to_string(),
                Err(e) => format!("❌ Failed to resume: {e}"),
            },
            Command::Auto => match self.controller.set_auto("mode switch", &by).await {
                Ok(_) => "🤖 <b>Mode: AUTO</b>\nSL/TP will be placed automatically".to_string(),
                Err(e) => format!("❌ Failed to switch mode: {e}"),
            },
            Command::Manual => match self.controller.set_manual("mode switch", &by).await {
                Ok(_) => "✋ <b>Mode: MANUAL</b>\nExits are your job now".to_string(),
                Err(e) => format!("❌ Failed to switch mode: {e}"),
            },
            Command::Monitor => {
                match self.controller.set_mode(BotMode::MonitorOnly, "mode switch", &by).await {
                    Ok(_) => "👁 <b>Mode: MONITOR ONLY</b>\nObserving and recording, no action notifications".to_string(),
                    Err(e) => format!("❌ Failed to switch mode: {e}"),
                }
            }
            Command::Kill => self.kill(&by).await,
            Command::Buy { ticker, price, lots } => {
                self.buy(&ticker, price, lots, user_id).await
            }
            Command::Confirm(id) => self.confirm(&id, user_id).await,
            Command::CancelConfirm(id) => {
                if self.intake.cancel(&id) {
                    "🗑 Order request cancelled".to_string()
                } else {
                    "❓ No such pending confirmation (it may have expired)".to_string()
                }
            }
        }
    }

    fn help(&self) -> String {
        "🤖 <b>Trading Bot</b>\n\n\
         /status - bot, watcher and cache state\n\
         /buy TICKER [PRICE] [LOTS] - request an entry order\n\
         /confirm ID - confirm a pending order\n\
         /cancel ID - drop a pending order\n\
         /orders - tracked orders\n\
         /stats - trading statistics\n\
         /pause [MINUTES], /resume - kill switch\n\
         /auto, /manual, /monitor - SL/TP automation mode\n\
         /kill - hard stop (exchange orders stay live!)\n\
         /help - this message"
            .to_string()
    }

    async fn status(&self) -> String {
        let (bot_line, mode_line) = match self.controller.get_settings().await {
            Ok(settings) => (
                if settings.is_active { "🟢 Active".to_string() } else { "🔴 Stopped".to_string() },
                settings.mode.as_str().to_uppercase(),
            ),
            Err(_) => ("⚪ Settings unavailable (treated as stopped)".to_string(), "?".to_string()),
        };
        let watcher_line = if self.watcher.is_running() { "🟢 Running" } else { "🔴 Stopped" };
        let tickers = self.snapshots.tickers();
        let shown: Vec<&str> = tickers.iter().take(10).map(String::as_str).collect();
        let suffix = if tickers.len() > 10 { "..." } else { "" };

        format!(
            "📊 <b>Bot status</b>\n\n\
             🤖 Bot: {bot_line}\n\
             ⚙️ Mode: {mode_line}\n\
             🔍 Watcher: {watcher_line}\n\
             🛡 Active SL guards: {}\n\n\
             📋 Cache: {} ticker(s)\n📌 {}{}\n\n\
             🎯 Tracked orders: {}\n\
             ⏳ Pending confirmations: {}",
            self.watcher.active_guard_count(),
            tickers.len(),
            shown.join(", "),
            suffix,
            self.watcher.tracked_count(),
            self.intake.pending_count(),
        )
    }

    fn orders(&self) -> String {
        let orders = self.watcher.tracked_orders();
        if orders.is_empty() {
            return "📋 No tracked orders".to_string();
        }

        let mut lines = vec!["📋 <b>Tracked orders:</b>".to_string(), String::new()];
        for order in orders {
            let emoji = match order.kind {
                OrderKind::EntryBuy => "📥",
                OrderKind::StopLoss => "🛑",
                OrderKind::TakeProfit => "🎯",
            };
            lines.push(format!(
                "{emoji} {} — {}\n   Entry: {:.2} | SL: {:.2} | TP: {:.2}",
                order.ticker, order.kind, order.entry_price, order.stop_price, order.target_price
            ));
        }
        lines.join("\n")
    }

    async fn stats(&self) -> String {
        let bot_stats = match self.controller.get_stats().await {
            Ok(stats) => stats,
            Err(e) => return format!("❌ Stats unavailable: {e}"),
        };
        let order_stats = self.store.order_stats().await.unwrap_or_default();

        format!(
            "📈 <b>Statistics</b>\n\n\
             📦 Orders placed: {}\n\
             🛑 SL triggered: {}\n\
             🎯 TP triggered: {}\n\
             🏆 Win rate: {:.0}%\n\
             💰 Total P&L: {:+.0} RUB\n\n\
             📋 Rows: {} pending / {} executed / {} cancelled",
            bot_stats.total_orders_placed,
            bot_stats.total_sl_triggered,
            bot_stats.total_tp_triggered,
            bot_stats.win_rate_pct,
            bot_stats.total_pnl_rub,
            order_stats.pending,
            order_stats.executed,
            order_stats.cancelled,
        )
    }

    async fn kill(&self, by: &str) -> String {
        match self.controller.kill_switch(by).await {
            Ok(_) => {
                let evicted = self.snapshots.clear();
                let tracked = self.watcher.tracked_count();
                format!(
                    "🔴 <b>KILL SWITCH engaged</b>\n\n\
                     📋 Cache cleared: {evicted} ticker(s)\n\
                     🔍 Still tracked: {tracked} order(s)\n\n\
                     ⚠️ New orders will not be accepted\n\
                     ⚠️ Orders already on the exchange are NOT cancelled!\n\n\
                     To restart: /resume"
                )
            }
            Err(e) => format!("❌ Kill switch failed: {e}"),
        }
    }

    async fn buy(&self, ticker: &str, price: Option<f64>, lots: Option<i32>, user_id: i64) -> String {
        match self.intake.request_buy(ticker, price, lots, user_id).await {
            BuyOutcome::Inactive => {
                "🔴 Bot is stopped, orders are not accepted.\nStart it with /resume".to_string()
            }
            BuyOutcome::UnknownTicker(ticker) => {
                let available = self.snapshots.tickers().join(", ");
                let available = if available.is_empty() { "none".to_string() } else { available };
                format!("❌ No snapshot for {ticker}.\nAvailable: {available}")
            }
            BuyOutcome::PriceUnavailable(reason) => {
                format!("❌ Market price unavailable: {reason}\nTry again in a moment")
            }
            BuyOutcome::Invalid { errors, .. } => {
                let mut lines = vec![format!("❌ <b>Order rejected: {}</b>", ticker.to_uppercase()), String::new()];
                lines.extend(errors);
                lines.join("\n")
            }
            BuyOutcome::NeedsConfirmation { confirmation, warnings } => {
                format_confirmation(&confirmation, &warnings)
            }
        }
    }

    async fn confirm(&self, callback_id: &str, user_id: i64) -> String {
        match self.intake.confirm(callback_id, user_id).await {
            ConfirmOutcome::NotFound => {
                "❓ Nothing to confirm: the request expired or never existed".to_string()
            }
            ConfirmOutcome::WrongUser => "🚫 This confirmation belongs to another user".to_string(),
            ConfirmOutcome::Inactive => "🔴 Bot is stopped, order not placed".to_string(),
            ConfirmOutcome::Rejected(reason) => format!("❌ Order not placed: {reason}"),
            ConfirmOutcome::Placed { order_id, ticker } => format!(
                "✅ <b>Order placed: {ticker}</b>\n🆔 ID: <code>{order_id}</code>\n\n\
                 ⏳ Fills when the market reaches the entry price\n🔍 Tracking is active"
            ),
        }
    }
}

/// Confirmation card shown to the operator before an order goes out.
pub fn format_confirmation(confirmation: &PendingConfirmation, warnings: &[String]) -> String {
    let shares = confirmation.quantity_lots as i64 * confirmation.lot_size as i64;
    let risk_reward = if confirmation.risk_rub > 0.0 {
        confirmation.reward_rub / confirmation.risk_rub
    } else {
        0.0
    };

    let mut lines = vec![
        "📋 <b>Confirm the order</b>".to_string(),
        String::new(),
        format!("📌 <b>{}</b>", confirmation.ticker),
        format!("📥 Entry: <b>{:.2} RUB</b>", confirmation.entry_price),
        format!("📦 Size: {} lot(s) ({} shares)", confirmation.quantity_lots, shares),
        String::new(),
        format!("🛑 Stop-loss: <b>{:.2} RUB</b>", confirmation.sl_price),
        format!("🎯 Take-profit: <b>{:.2} RUB</b>", confirmation.tp_price),
        String::new(),
        format!("💸 Risk: <b>{:.0} RUB</b>", confirmation.risk_rub),
        format!("💰 Potential profit: {:.0} RUB", confirmation.reward_rub),
        format!("📊 R:R = 1:{risk_reward:.1}"),
    ];

    if !warnings.is_empty() {
        lines.push(String::new());
        lines.extend(warnings.iter().cloned());
    }

    lines.push(String::new());
    lines.push(format!(
        "👉 /confirm {id}  or  /cancel {id}",
        id = confirmation.callback_id
    ));
    lines.join("\n")
}
