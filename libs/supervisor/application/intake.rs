//! Order intake: operator-initiated buys with explicit confirmation.
//!
//! A `buy` request is validated and parked as a pending confirmation with
//! a short expiry; only an explicit confirm by the same user reaches the
//! broker. Expired entries are swept whenever the map is touched.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::controller::ModeController;
use crate::application::snapshot::SnapshotCache;
use crate::application::validator::{BuyCheck, OrderValidator};
use crate::application::watcher::PositionWatcher;
use crate::domain::error::BrokerError;
use crate::domain::models::{OrderKind, PendingConfirmation, TrackedOrder};
use crate::domain::ports::{BrokerPort, OrderSide, StatsDelta, StopOrderKind, StopOrderRequest};
use crate::infrastructure::config::{FreeTradingConfig, TradingConfig};

/// Outcome of a buy request.
#[derive(Debug)]
pub enum BuyOutcome {
    /// Kill switch is off; nothing was validated.
    Inactive,
    /// No snapshot for the ticker: the analytics pipeline has not seen it.
    UnknownTicker(String),
    /// The market price could not be read; try again.
    PriceUnavailable(String),
    /// Validation failed with the full, ordered error list.
    Invalid { errors: Vec<String>, warnings: Vec<String> },
    /// Validated; waiting for the operator to confirm.
    NeedsConfirmation { confirmation: PendingConfirmation, warnings: Vec<String> },
}

/// Outcome of a confirmation.
#[derive(Debug)]
pub enum ConfirmOutcome {
    /// Unknown id, or the confirmation expired.
    NotFound,
    /// Someone other than the requester tried to confirm.
    WrongUser,
    /// Kill switch flipped between request and confirm.
    Inactive,
    /// The exchange refused the order.
    Rejected(String),
    /// The entry order is live and tracked.
    Placed { order_id: String, ticker: String },
}

pub struct OrderIntake {
    broker: Arc<dyn BrokerPort>,
    controller: Arc<ModeController>,
    validator: Arc<OrderValidator>,
    snapshots: Arc<SnapshotCache>,
    watcher: Arc<PositionWatcher>,
    trading: TradingConfig,
    ft: FreeTradingConfig,
    pending: Mutex<HashMap<String, PendingConfirmation>>,
    seq: AtomicU64,
}

impl OrderIntake {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        controller: Arc<ModeController>,
        validator: Arc<OrderValidator>,
        snapshots: Arc<SnapshotCache>,
        watcher: Arc<PositionWatcher>,
        trading: TradingConfig,
        ft: FreeTradingConfig,
    ) -> Self {
        Self {
            broker,
            controller,
            validator,
            snapshots,
            watcher,
            trading,
            ft,
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Validate a buy and park it for confirmation.
    ///
    /// Omitted price/quantity fall back to the snapshot: the planned entry
    /// price, and a risk-derived lot count floored to one lot.
    pub async fn request_buy(
        &self,
        ticker: &str,
        entry_price: Option<f64>,
        quantity_lots: Option<i32>,
        user_id: i64,
    ) -> BuyOutcome {
        self.sweep_expired();

        if !self.controller.is_active().await {
            warn!(ticker, "buy refused: bot inactive");
            return BuyOutcome::Inactive;
        }

        let Some(snapshot) = self.snapshots.get(ticker) else {
            return BuyOutcome::UnknownTicker(ticker.to_string());
        };

        // Snapshot-driven buys are always allowed; overriding the planned
        // price or size is the free-trading feature and must be enabled.
        if (entry_price.is_some() || quantity_lots.is_some()) && !self.ft.enabled {
            return BuyOutcome::Invalid {
                errors: vec![
                    "⚙️ Custom price/size is disabled (free_trading.enabled = false)".to_string(),
                ],
                warnings: Vec::new(),
            };
        }

        let entry_price = entry_price.unwrap_or(snapshot.entry_price);
        let quantity_lots =
            quantity_lots.unwrap_or_else(|| self.derive_quantity_lots(snapshot.atr, snapshot.lot_size, snapshot.position_size));

        let current_price = match self.broker.get_last_price(&snapshot.figi).await {
            Ok(price) => price,
            Err(e) => {
                warn!(ticker = %snapshot.ticker, error = %e, "last price unavailable");
                return BuyOutcome::PriceUnavailable(e.to_string());
            }
        };

        let validation = self.validator.validate_buy(&BuyCheck {
            ticker: snapshot.ticker.clone(),
            entry_price,
            quantity_lots,
            current_price,
            atr: snapshot.atr,
            lot_size: snapshot.lot_size,
            current_positions: self.watcher.concurrent_positions(),
        });

        let Some(figures) = validation.figures else {
            return BuyOutcome::Invalid {
                errors: validation.errors,
                warnings: validation.warnings,
            };
        };

        let now = Utc::now();
        let confirmation = PendingConfirmation {
            callback_id: format!("cfm-{}", self.seq.fetch_add(1, Ordering::Relaxed)),
            ticker: snapshot.ticker.clone(),
            figi: snapshot.figi.clone(),
            entry_price,
            quantity_lots,
            lot_size: snapshot.lot_size,
            sl_price: figures.sl_price,
            tp_price: figures.tp_price,
            risk_rub: figures.risk_rub,
            reward_rub: figures.reward_rub,
            atr: snapshot.atr,
            user_id,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(self.ft.confirmation_timeout_sec as i64),
        };

        info!(
            callback_id = %confirmation.callback_id,
            ticker = %confirmation.ticker,
            entry_price,
            quantity_lots,
            "buy validated, awaiting confirmation"
        );
        self.pending
            .lock()
            .insert(confirmation.callback_id.clone(), confirmation.clone());

        BuyOutcome::NeedsConfirmation {
            confirmation,
            warnings: validation.warnings,
        }
    }

    /// Confirm a parked buy: the only path that reaches the broker.
    pub async fn confirm(&self, callback_id: &str, user_id: i64) -> ConfirmOutcome {
        self.sweep_expired();

        let pending = {
            let mut map = self.pending.lock();
            match map.remove(callback_id) {
                Some(pending) if pending.is_expired(Utc::now()) => None,
                other => other,
            }
        };
        let Some(pending) = pending else {
            return ConfirmOutcome::NotFound;
        };

        if pending.user_id != user_id {
            warn!(callback_id, user_id, owner = pending.user_id, "confirm by wrong user");
            // Hand it back to its rightful owner
            self.pending
                .lock()
                .insert(pending.callback_id.clone(), pending);
            return ConfirmOutcome::WrongUser;
        }

        if !self.controller.is_active().await {
            warn!(callback_id, "confirm refused: bot inactive");
            return ConfirmOutcome::Inactive;
        }

        let order_id = match self
            .broker
            .place_stop_order(StopOrderRequest {
                figi: pending.figi.clone(),
                quantity_lots: pending.quantity_lots,
                trigger_price: pending.entry_price,
                side: OrderSide::Buy,
                kind: StopOrderKind::TakeProfit,
            })
            .await
        {
            Ok(order_id) => order_id,
            Err(e) if e.is_transient() => {
                // The exchange said nothing definitive; keep the parked
                // request so the operator can retry within the expiry.
                warn!(ticker = %pending.ticker, error = %e, "entry order attempt failed, keeping confirmation");
                let callback_id = pending.callback_id.clone();
                self.pending.lock().insert(callback_id.clone(), pending);
                return ConfirmOutcome::Rejected(format!(
                    "{e}; order not sent, try /confirm {callback_id} again"
                ));
            }
            Err(e @ BrokerError::Rejected(_)) => {
                warn!(ticker = %pending.ticker, error = %e, "entry order rejected");
                return ConfirmOutcome::Rejected(e.to_string());
            }
            Err(e) => {
                error!(ticker = %pending.ticker, error = %e, "entry order failed");
                return ConfirmOutcome::Rejected(e.to_string());
            }
        };

        info!(order_id = %order_id, ticker = %pending.ticker, "entry order placed");

        let order = TrackedOrder::new_pending(
            order_id.clone(),
            pending.ticker.clone(),
            pending.figi.clone(),
            OrderKind::EntryBuy,
            pending.quantity_lots,
            pending.lot_size,
            pending.entry_price,
            pending.sl_price,
            pending.tp_price,
        )
        .with_offsets(
            pending.entry_price - pending.sl_price,
            pending.tp_price - pending.entry_price,
            pending.atr,
        )
        .with_created_by(user_id.to_string());

        self.watcher.track_order(order).await;

        if let Err(e) = self.controller.increment_stats(StatsDelta::orders(1)).await {
            error!(error = %e, "failed to bump order counter");
        }
        self.validator.increment_daily_trades();

        ConfirmOutcome::Placed {
            order_id,
            ticker: pending.ticker,
        }
    }

    /// Drop a parked buy. Returns false for an unknown id.
    pub fn cancel(&self, callback_id: &str) -> bool {
        self.sweep_expired();
        let removed = self.pending.lock().remove(callback_id).is_some();
        if removed {
            info!(callback_id, "pending confirmation cancelled");
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Risk-derived default size: the lots whose SL distance costs one
    /// risk budget, floored to at least one lot.
    fn derive_quantity_lots(&self, atr: f64, lot_size: i32, position_size: i32) -> i32 {
        let risk_budget = self.trading.deposit_rub * self.trading.risk_per_trade_pct;
        let risk_per_lot = atr * self.ft.sl_atr_multiplier * lot_size as f64;

        let lots = if risk_per_lot > 0.0 {
            (risk_budget / risk_per_lot).floor() as i32
        } else if lot_size > 0 {
            position_size / lot_size
        } else {
            0
        };
        lots.max(1)
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        let mut map = self.pending.lock();
        let before = map.len();
        map.retain(|_, pending| !pending.is_expired(now));
        let dropped = before - map.len();
        if dropped > 0 {
            debug!(dropped, "expired confirmations swept");
        }
    }
}
