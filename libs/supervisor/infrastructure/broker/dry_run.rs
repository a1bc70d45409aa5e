//! Dry-run broker: synthetic success without touching the exchange.
//!
//! Every placed order is assigned a local id and kept in an in-memory
//! listing so the watcher sees a coherent exchange picture. Last prices
//! are seeded from the snapshot table at startup.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::domain::error::BrokerError;
use crate::domain::ports::{
    BrokerPort, BrokerStopOrder, OrderSide, PortfolioPosition, StopOrderRequest, StopOrderState,
};

#[derive(Default)]
pub struct DryRunBroker {
    next_id: AtomicU64,
    stop_orders: Mutex<HashMap<String, BrokerStopOrder>>,
    last_prices: Mutex<HashMap<String, f64>>,
}

impl DryRunBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last_price(&self, figi: impl Into<String>, price: f64) {
        self.last_prices.lock().insert(figi.into(), price);
    }

    fn assign_id(&self, prefix: &str) -> String {
        format!("dry-{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl BrokerPort for DryRunBroker {
    async fn place_stop_order(&self, req: StopOrderRequest) -> Result<String, BrokerError> {
        let order_id = self.assign_id("stop");
        info!(
            order_id,
            figi = %req.figi,
            side = %req.side,
            trigger_price = req.trigger_price,
            "DRY RUN: stop-order accepted"
        );
        self.stop_orders.lock().insert(
            order_id.clone(),
            BrokerStopOrder {
                order_id: order_id.clone(),
                figi: req.figi,
                side: req.side,
                kind: req.kind,
                trigger_price: req.trigger_price,
                quantity: req.quantity_lots,
                state: StopOrderState::Active,
            },
        );
        Ok(order_id)
    }

    async fn cancel_stop_order(&self, order_id: &str) -> Result<(), BrokerError> {
        if let Some(order) = self.stop_orders.lock().get_mut(order_id) {
            order.state = StopOrderState::Cancelled;
        }
        info!(order_id, "DRY RUN: stop-order cancelled");
        Ok(())
    }

    async fn list_stop_orders(&self) -> Result<Vec<BrokerStopOrder>, BrokerError> {
        Ok(self.stop_orders.lock().values().cloned().collect())
    }

    async fn get_portfolio(&self) -> Result<Vec<PortfolioPosition>, BrokerError> {
        Ok(Vec::new())
    }

    async fn place_market_order(
        &self,
        figi: &str,
        quantity_lots: i32,
        side: OrderSide,
    ) -> Result<String, BrokerError> {
        let order_id = self.assign_id("market");
        info!(order_id, figi, quantity_lots, side = %side, "DRY RUN: market order accepted");
        Ok(order_id)
    }

    async fn get_last_price(&self, figi: &str) -> Result<f64, BrokerError> {
        self.last_prices
            .lock()
            .get(figi)
            .copied()
            .ok_or_else(|| BrokerError::Unavailable(format!("DRY RUN: no last price for {figi}")))
    }
}
