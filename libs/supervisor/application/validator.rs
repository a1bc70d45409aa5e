//! Pre-trade validation for operator-initiated buys.
//!
//! All checks run even after the first failure so the caller sees every
//! problem at once. Daily trade/loss counters are in-process and keyed by
//! the MSK calendar date; Moscow has been fixed at UTC+3 since 2014, so a
//! constant offset is enough.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::infrastructure::config::{parse_hh_mm, FreeTradingConfig, TradingConfig};

fn msk() -> FixedOffset {
    FixedOffset::east_opt(3 * 3600).expect("MSK offset")
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Input of one buy validation.
#[derive(Debug, Clone)]
pub struct BuyCheck {
    pub ticker: String,
    pub entry_price: f64,
    pub quantity_lots: i32,
    pub current_price: f64,
    pub atr: f64,
    pub lot_size: i32,
    pub current_positions: usize,
}

/// Figures derived from a valid request.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFigures {
    pub sl_price: f64,
    pub tp_price: f64,
    pub risk_rub: f64,
    pub risk_pct: f64,
    pub reward_rub: f64,
    pub risk_reward_ratio: f64,
    pub position_value: f64,
}

/// Outcome: either an ordered error list, or derived figures plus warnings.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub figures: Option<DerivedFigures>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.figures.is_some()
    }
}

#[derive(Default)]
struct DailyCounters {
    trades: HashMap<String, u32>,
    loss_rub: HashMap<String, f64>,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct OrderValidator {
    deposit_rub: f64,
    risk_per_trade_pct: f64,
    max_position_pct: f64,
    ft: FreeTradingConfig,
    daily: Mutex<DailyCounters>,
    clock: Clock,
}

impl OrderValidator {
    pub fn new(trading: &TradingConfig, ft: FreeTradingConfig) -> Self {
        Self::with_clock(trading, ft, Box::new(Utc::now))
    }

    /// Injected clock; the trading-window check and the daily-counter
    /// buckets follow it.
    pub fn with_clock(trading: &TradingConfig, ft: FreeTradingConfig, clock: Clock) -> Self {
        Self {
            deposit_rub: trading.deposit_rub,
            risk_per_trade_pct: trading.risk_per_trade_pct,
            max_position_pct: trading.max_position_pct,
            ft,
            daily: Mutex::new(DailyCounters::default()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn today_key(now: DateTime<Utc>) -> String {
        now.with_timezone(&msk()).format("%Y-%m-%d").to_string()
    }

    pub fn daily_trades(&self) -> u32 {
        let key = Self::today_key(self.now());
        self.daily.lock().trades.get(&key).copied().unwrap_or(0)
    }

    pub fn daily_loss(&self) -> f64 {
        let key = Self::today_key(self.now());
        self.daily.lock().loss_rub.get(&key).copied().unwrap_or(0.0)
    }

    /// Called by the intake after the broker accepts an entry order.
    pub fn increment_daily_trades(&self) {
        let key = Self::today_key(self.now());
        *self.daily.lock().trades.entry(key).or_insert(0) += 1;
    }

    /// Called by the watcher when a loss is realised.
    pub fn add_daily_loss(&self, loss_rub: f64) {
        if loss_rub <= 0.0 {
            return;
        }
        let key = Self::today_key(self.now());
        *self.daily.lock().loss_rub.entry(key).or_insert(0.0) += loss_rub;
    }

    /// Drop every key except today's. Run around midnight MSK.
    pub fn reset_daily_counters(&self) {
        let key = Self::today_key(self.now());
        let mut daily = self.daily.lock();
        daily.trades.retain(|k, _| k == &key);
        daily.loss_rub.retain(|k, _| k == &key);
    }

    /// Full validation against the validator's clock.
    pub fn validate_buy(&self, check: &BuyCheck) -> Validation {
        self.validate_buy_at(check, self.now())
    }

    /// Clock-injected variant; `now` decides the trading window and the
    /// daily-counter bucket.
    pub fn validate_buy_at(&self, check: &BuyCheck, now: DateTime<Utc>) -> Validation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        info!(
            ticker = %check.ticker,
            entry_price = check.entry_price,
            quantity_lots = check.quantity_lots,
            current_price = check.current_price,
            atr = check.atr,
            "validating buy order"
        );

        // 1. Trading window
        if let Err(reason) = self.check_trading_hours(now) {
            errors.push(format!("⏰ {reason}"));
        }

        // 2. Concurrent positions
        if check.current_positions >= self.ft.max_concurrent_positions {
            errors.push(format!(
                "📊 Limit of {} concurrent positions reached",
                self.ft.max_concurrent_positions
            ));
        }

        // 3. Daily limits
        if let Err(reason) = self.check_daily_limits(now) {
            errors.push(format!("📅 {reason}"));
        }

        // 4. Price bounds
        if let Err(reason) = self.check_price(check.entry_price, check.current_price) {
            errors.push(format!("💰 {reason}"));
        }

        // 5. Quantity bounds
        if let Err(reason) =
            self.check_quantity(check.quantity_lots, check.entry_price, check.lot_size)
        {
            errors.push(format!("📦 {reason}"));
        }

        if !errors.is_empty() {
            warn!(ticker = %check.ticker, ?errors, "validation failed");
            return Validation { errors, warnings, figures: None };
        }

        // Derived SL/TP from ATR
        let sl_price = round2(check.entry_price - check.atr * self.ft.sl_atr_multiplier);
        let tp_price = round2(check.entry_price + check.atr * self.ft.tp_atr_multiplier);

        if sl_price <= 0.0 {
            errors.push(format!("🛑 Derived stop-loss is not positive: {sl_price:.2}"));
            return Validation { errors, warnings, figures: None };
        }

        let shares = check.quantity_lots as f64 * check.lot_size as f64;
        let position_value = shares * check.entry_price;
        let risk_rub = (check.entry_price - sl_price) * shares;
        let reward_rub = (tp_price - check.entry_price) * shares;
        let risk_pct = risk_rub / self.deposit_rub * 100.0;
        let risk_reward_ratio = if risk_rub > 0.0 { reward_rub / risk_rub } else { 0.0 };

        let recommended_risk_pct = self.risk_per_trade_pct * 100.0;
        if risk_pct > recommended_risk_pct * 1.5 {
            warnings.push(format!(
                "⚠️ Risk {risk_pct:.2}% is above the recommended {recommended_risk_pct:.1}%"
            ));
        }
        if risk_reward_ratio < 2.0 {
            warnings.push(format!(
                "⚠️ Risk/Reward 1:{risk_reward_ratio:.1} is below the recommended 1:3"
            ));
        }
        if tp_price <= check.current_price {
            warnings.push(format!(
                "⚠️ TP ({tp_price:.2}) is not above the current price ({:.2}) and may trigger immediately",
                check.current_price
            ));
        }

        info!(
            ticker = %check.ticker,
            sl_price,
            tp_price,
            risk_rub = risk_rub.round(),
            risk_pct = round2(risk_pct),
            "validation passed"
        );

        Validation {
            errors,
            warnings,
            figures: Some(DerivedFigures {
                sl_price,
                tp_price,
                risk_rub,
                risk_pct: round2(risk_pct),
                reward_rub,
                risk_reward_ratio: (risk_reward_ratio * 10.0).round() / 10.0,
                position_value: position_value.round(),
            }),
        }
    }

    fn check_trading_hours(&self, now: DateTime<Utc>) -> Result<(), String> {
        let local = now.with_timezone(&msk());

        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return Err("Market is closed on weekends".to_string());
        }

        // Config is validated at load time; defaults on a parse failure here
        let (start_h, start_m) =
            parse_hh_mm(&self.ft.trading_start).unwrap_or((10, 5));
        let (end_h, end_m) = parse_hh_mm(&self.ft.trading_end).unwrap_or((18, 40));

        let minutes = local.hour() * 60 + local.minute();
        if minutes < start_h * 60 + start_m {
            return Err(format!("Trading starts at {} MSK", self.ft.trading_start));
        }
        if minutes > end_h * 60 + end_m {
            return Err(format!("Trading ends at {} MSK", self.ft.trading_end));
        }
        Ok(())
    }

    fn check_daily_limits(&self, now: DateTime<Utc>) -> Result<(), String> {
        let key = Self::today_key(now);
        let daily = self.daily.lock();

        let trades = daily.trades.get(&key).copied().unwrap_or(0);
        if trades >= self.ft.max_daily_trades {
            return Err(format!(
                "Daily limit of {} trades reached",
                self.ft.max_daily_trades
            ));
        }

        let loss = daily.loss_rub.get(&key).copied().unwrap_or(0.0);
        if loss >= self.ft.max_daily_loss_rub {
            return Err(format!(
                "Daily loss limit of {:.0} RUB reached (current: {:.0} RUB)",
                self.ft.max_daily_loss_rub, loss
            ));
        }
        Ok(())
    }

    fn check_price(&self, entry_price: f64, current_price: f64) -> Result<(), String> {
        if entry_price <= 0.0 {
            return Err("Entry price must be positive".to_string());
        }
        if current_price <= 0.0 {
            return Err("Current price is unavailable".to_string());
        }
        // A take-profit buy parks below the market and fills on a dip
        if entry_price >= current_price {
            return Err(format!(
                "Entry price ({entry_price:.2}) must be BELOW the current price ({current_price:.2})"
            ));
        }

        let deviation_pct = (entry_price - current_price).abs() / current_price * 100.0;
        if deviation_pct > self.ft.max_price_deviation_pct {
            return Err(format!(
                "Deviation {deviation_pct:.1}% exceeds the {:.1}% limit",
                self.ft.max_price_deviation_pct
            ));
        }
        Ok(())
    }

    fn check_quantity(&self, quantity_lots: i32, entry_price: f64, lot_size: i32) -> Result<(), String> {
        if quantity_lots <= 0 {
            return Err("Quantity must be at least 1 lot".to_string());
        }

        let position_value = quantity_lots as f64 * lot_size as f64 * entry_price;
        let max_position_value = self.deposit_rub * self.max_position_pct;
        if position_value > max_position_value {
            return Err(format!(
                "Position {position_value:.0} RUB exceeds the {max_position_value:.0} RUB limit \
                 ({:.0}% of the deposit)",
                self.max_position_pct * 100.0
            ));
        }
        Ok(())
    }
}
