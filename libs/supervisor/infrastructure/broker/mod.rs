//! Invest REST gateway client.
//!
//! The exchange is reached through the gRPC-gateway of the Invest API: one
//! POST per service method, protobuf-JSON bodies. Money travels as a
//! quotation `{units, nano}` pair; `units` is an int64 serialised as a JSON
//! string.

mod dry_run;

pub use dry_run::DryRunBroker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::error::BrokerError;
use crate::domain::ports::{
    BrokerPort, BrokerStopOrder, OrderSide, PortfolioPosition, StopOrderKind, StopOrderRequest,
    StopOrderState,
};
use crate::infrastructure::config::TinkoffConfig;

/// Per-request deadline; a timeout is a transient error.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const STOP_ORDERS_SERVICE: &str = "tinkoff.public.invest.api.contract.v1.StopOrdersService";
const ORDERS_SERVICE: &str = "tinkoff.public.invest.api.contract.v1.OrdersService";
const OPERATIONS_SERVICE: &str = "tinkoff.public.invest.api.contract.v1.OperationsService";
const MARKET_DATA_SERVICE: &str = "tinkoff.public.invest.api.contract.v1.MarketDataService";

// =============================================================================
// Wire types
// =============================================================================

/// Protobuf-JSON quotation: integer units plus nine-digit nano part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quotation {
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub nano: i32,
}

impl Quotation {
    pub fn from_f64(value: f64) -> Self {
        let units = value.trunc() as i64;
        let nano = ((value - value.trunc()) * 1e9).round() as i32;
        Self {
            units: units.to_string(),
            nano,
        }
    }

    pub fn to_f64(&self) -> f64 {
        let units: i64 = self.units.parse().unwrap_or(0);
        units as f64 + self.nano as f64 / 1e9
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostStopOrderResponse {
    stop_order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopOrderRow {
    stop_order_id: String,
    #[serde(default)]
    figi: String,
    #[serde(default)]
    direction: String,
    #[serde(default)]
    order_type: String,
    #[serde(default)]
    stop_price: Quotation,
    #[serde(default)]
    lots_requested: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetStopOrdersResponse {
    #[serde(default)]
    stop_orders: Vec<StopOrderRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortfolioRow {
    #[serde(default)]
    figi: String,
    #[serde(default)]
    quantity: Quotation,
    #[serde(default)]
    average_position_price: Quotation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetPortfolioResponse {
    #[serde(default)]
    positions: Vec<PortfolioRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostOrderResponse {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastPriceRow {
    #[serde(default)]
    figi: String,
    #[serde(default)]
    price: Quotation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetLastPricesResponse {
    #[serde(default)]
    last_prices: Vec<LastPriceRow>,
}

fn direction_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "STOP_ORDER_DIRECTION_BUY",
        OrderSide::Sell => "STOP_ORDER_DIRECTION_SELL",
    }
}

fn stop_order_type_str(kind: StopOrderKind) -> &'static str {
    match kind {
        StopOrderKind::TakeProfit => "STOP_ORDER_TYPE_TAKE_PROFIT",
        StopOrderKind::StopLoss => "STOP_ORDER_TYPE_STOP_LOSS",
    }
}

fn parse_direction(raw: &str) -> Option<OrderSide> {
    match raw {
        "STOP_ORDER_DIRECTION_BUY" => Some(OrderSide::Buy),
        "STOP_ORDER_DIRECTION_SELL" => Some(OrderSide::Sell),
        _ => None,
    }
}

fn parse_stop_order_kind(raw: &str) -> Option<StopOrderKind> {
    match raw {
        "STOP_ORDER_TYPE_TAKE_PROFIT" => Some(StopOrderKind::TakeProfit),
        "STOP_ORDER_TYPE_STOP_LOSS" => Some(StopOrderKind::StopLoss),
        _ => None,
    }
}

fn parse_stop_order_state(raw: &str) -> StopOrderState {
    match raw {
        "STOP_ORDER_STATUS_EXECUTED" => StopOrderState::Executed,
        "STOP_ORDER_STATUS_CANCELLED" => StopOrderState::Cancelled,
        "STOP_ORDER_STATUS_ACTIVE" => StopOrderState::Active,
        other => {
            warn!(status = other, "unknown stop-order status, treating as active");
            StopOrderState::Active
        }
    }
}

// =============================================================================
// Gateway client
// =============================================================================

/// [`BrokerPort`] implementation over the Invest REST gateway.
pub struct InvestGateway {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    /// Monotonic part of market-order idempotency keys.
    order_seq: AtomicU64,
}

impl InvestGateway {
    pub fn new(cfg: &TinkoffConfig) -> Result<Self, BrokerError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", cfg.token);
        headers.insert(
            reqwest::header::AUTHORIZATION,
            auth.parse()
                .map_err(|_| BrokerError::Rejected("invalid API token".to_string()))?,
        );

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            account_id: cfg.account_id.clone(),
            order_seq: AtomicU64::new(0),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, BrokerError> {
        let url = format!("{}/{}/{}", self.base_url, service, method);
        debug!(%method, "invest gateway call");

        let response = self.http.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout(REQUEST_TIMEOUT)
            } else {
                BrokerError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| BrokerError::Unavailable(format!("bad response body: {e}")));
        }

        let api_error: Option<ApiError> = response.json().await.ok();
        let message = api_error
            .as_ref()
            .map(|e| format!("{} (code {})", e.message, e.code))
            .unwrap_or_else(|| format!("HTTP {status}"));

        if status.is_client_error() {
            Err(BrokerError::Rejected(message))
        } else {
            Err(BrokerError::Unavailable(message))
        }
    }

    fn next_order_key(&self) -> String {
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed);
        format!("tbot-{}-{}", chrono::Utc::now().timestamp_millis(), seq)
    }
}

#[async_trait]
impl BrokerPort for InvestGateway {
    async fn place_stop_order(&self, req: StopOrderRequest) -> Result<String, BrokerError> {
        let body = json!({
            "figi": req.figi,
            "quantity": req.quantity_lots.to_string(),
            "stopPrice": Quotation::from_f64(req.trigger_price),
            "direction": direction_str(req.side),
            "accountId": self.account_id,
            "stopOrderType": stop_order_type_str(req.kind),
            "expirationType": "STOP_ORDER_EXPIRATION_TYPE_GOOD_TILL_CANCEL",
        });

        let response: PostStopOrderResponse =
            self.call(STOP_ORDERS_SERVICE, "PostStopOrder", body).await?;
        Ok(response.stop_order_id)
    }

    async fn cancel_stop_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let body = json!({
            "accountId": self.account_id,
            "stopOrderId": order_id,
        });

        match self
            .call::<serde_json::Value>(STOP_ORDERS_SERVICE, "CancelStopOrder", body)
            .await
        {
            Ok(_) => Ok(()),
            // Cancelling an order the exchange no longer knows is a no-op.
            Err(BrokerError::Rejected(message))
                if message.contains("code 5") || message.to_lowercase().contains("not found") =>
            {
                debug!(order_id, "cancel of unknown stop-order, treating as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_stop_orders(&self) -> Result<Vec<BrokerStopOrder>, BrokerError> {
        let body = json!({ "accountId": self.account_id });
        let response: GetStopOrdersResponse =
            self.call(STOP_ORDERS_SERVICE, "GetStopOrders", body).await?;

        let mut orders = Vec::with_capacity(response.stop_orders.len());
        for row in response.stop_orders {
            let (Some(side), Some(kind)) =
                (parse_direction(&row.direction), parse_stop_order_kind(&row.order_type))
            else {
                warn!(
                    order_id = %row.stop_order_id,
                    direction = %row.direction,
                    order_type = %row.order_type,
                    "skipping stop-order with unknown direction/type"
                );
                continue;
            };
            orders.push(BrokerStopOrder {
                order_id: row.stop_order_id,
                figi: row.figi,
                side,
                kind,
                trigger_price: row.stop_price.to_f64(),
                quantity: row.lots_requested.parse().unwrap_or(0),
                state: parse_stop_order_state(&row.status),
            });
        }
        Ok(orders)
    }

    async fn get_portfolio(&self) -> Result<Vec<PortfolioPosition>, BrokerError> {
        let body = json!({ "accountId": self.account_id });
        let response: GetPortfolioResponse =
            self.call(OPERATIONS_SERVICE, "GetPortfolio", body).await?;

        Ok(response
            .positions
            .into_iter()
            .map(|row| PortfolioPosition {
                figi: row.figi,
                quantity: row.quantity.to_f64(),
                average_price: row.average_position_price.to_f64(),
            })
            .collect())
    }

    async fn place_market_order(
        &self,
        figi: &str,
        quantity_lots: i32,
        side: OrderSide,
    ) -> Result<String, BrokerError> {
        let direction = match side {
            OrderSide::Buy => "ORDER_DIRECTION_BUY",
            OrderSide::Sell => "ORDER_DIRECTION_SELL",
        };
        let body = json!({
            "figi": figi,
            "quantity": quantity_lots.to_string(),
            "direction": direction,
            "accountId": self.account_id,
            "orderType": "ORDER_TYPE_MARKET",
            "orderId": self.next_order_key(),
        });

        let response: PostOrderResponse = self.call(ORDERS_SERVICE, "PostOrder", body).await?;
        Ok(response.order_id)
    }

    async fn get_last_price(&self, figi: &str) -> Result<f64, BrokerError> {
        let body = json!({ "figi": [figi] });
        let response: GetLastPricesResponse =
            self.call(MARKET_DATA_SERVICE, "GetLastPrices", body).await?;

        response
            .last_prices
            .into_iter()
            .find(|row| row.figi == figi)
            .map(|row| row.price.to_f64())
            .ok_or_else(|| BrokerError::Unavailable(format!("no last price for {figi}")))
    }
}
