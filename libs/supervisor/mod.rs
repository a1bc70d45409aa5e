//! MOEX order-lifecycle supervisor.
//!
//! Turns daily pre-market analytics into pending entry orders and shepherds
//! every accepted order through its lifecycle: entry fill, paired SL/TP
//! placement under a timeout guard, exit fill, bookkeeping.

// Core layers (Clean Architecture)
pub mod application;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used items from the domain layer
pub use domain::{
    BotMode, BotSettings, BotStats, BrokerError, BrokerPort, Notifier, OrderKind, OrderSide,
    OrderStatus, PendingConfirmation, ShareSnapshot, StatsDelta, StopOrderKind, StopOrderRequest,
    StopOrderState, Store, StoreError, TrackedOrder,
};

// Re-export from the application layer
pub use application::{
    CommandHandler, ModeController, OrderIntake, OrderValidator, PollOutcome, PositionWatcher,
    SlPlacementGuard, SnapshotCache, WatcherConfig,
};

// Re-export from the infrastructure layer
pub use infrastructure::{
    Config, DryRunBroker, InvestGateway, PgStore, ShutdownManager, TelegramBot, TelegramNotifier,
};
