//! Infrastructure Layer
//!
//! Implementations of the domain ports (broker gateway, Postgres store,
//! Telegram transport) plus process plumbing: configuration and shutdown.
//! Depends on the domain layer, never on the application layer.

pub mod broker;
pub mod config;
pub mod database;
pub mod shutdown;
pub mod telegram;

pub use broker::{DryRunBroker, InvestGateway};
pub use config::{Config, ConfigError, FreeTradingConfig, TradingConfig};
pub use database::PgStore;
pub use shutdown::{sleep_unless_stopped, ShutdownManager};
pub use telegram::{NullNotifier, TelegramBot, TelegramNotifier};
