//! Domain Layer
//!
//! Pure types and port definitions. This layer has no knowledge of the
//! exchange gateway, the database or the chat surface; upper layers depend
//! on it, never the other way around.

pub mod error;
pub mod models;
pub mod ports;

pub use error::{BrokerError, StoreError};
pub use models::{
    BotMode, BotSettings, BotStats, OrderKind, OrderStatus, PendingConfirmation, ShareSnapshot,
    TrackedOrder,
};
pub use ports::{
    BrokerPort, BrokerStopOrder, Notifier, OrderSide, OrderStats, PortfolioPosition, StatsDelta,
    StopOrderKind, StopOrderRequest, StopOrderState, Store, TrackedOrderPatch,
};
