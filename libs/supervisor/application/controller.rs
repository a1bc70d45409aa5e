//! Mode controller: the only write path to the bot settings.
//!
//! Every mutation records who changed what and why. Reads on the safety
//! path fail closed: when the store cannot answer, the bot is OFF and the
//! mode is manual.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::error;

use crate::domain::error::StoreError;
use crate::domain::models::{BotMode, BotSettings, BotStats};
use crate::domain::ports::{StatsDelta, Store};

pub struct ModeController {
    store: Arc<dyn Store>,
}

impl ModeController {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Kill switch + pause window. A store failure reads as "not active".
    pub async fn is_active(&self) -> bool {
        match self.store.get_settings().await {
            Ok(settings) => settings.effectively_active(Utc::now()),
            Err(e) => {
                error!(error = %e, "is_active read failed, treating bot as inactive");
                false
            }
        }
    }

    /// Current mode; manual on read failure.
    pub async fn get_mode(&self) -> BotMode {
        match self.store.get_settings().await {
            Ok(settings) => settings.mode,
            Err(e) => {
                error!(error = %e, "get_mode read failed, falling back to manual");
                BotMode::Manual
            }
        }
    }

    pub async fn get_settings(&self) -> Result<BotSettings, StoreError> {
        self.store.get_settings().await
    }

    pub async fn pause(&self, reason: &str, by: &str) -> Result<BotSettings, StoreError> {
        self.store.set_active(false, reason, by).await
    }

    pub async fn pause_until(
        &self,
        until: DateTime<Utc>,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError> {
        self.store.pause_until(until, reason, by).await
    }

    pub async fn resume(&self, reason: &str, by: &str) -> Result<BotSettings, StoreError> {
        self.store.set_active(true, reason, by).await
    }

    pub async fn set_auto(&self, reason: &str, by: &str) -> Result<BotSettings, StoreError> {
        self.store.set_mode(BotMode::Auto, reason, by).await
    }

    pub async fn set_manual(&self, reason: &str, by: &str) -> Result<BotSettings, StoreError> {
        self.store.set_mode(BotMode::Manual, reason, by).await
    }

    pub async fn set_mode(
        &self,
        mode: BotMode,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError> {
        self.store.set_mode(mode, reason, by).await
    }

    /// Hard stop. Tracked orders stay live on the exchange, as documented.
    pub async fn kill_switch(&self, by: &str) -> Result<BotSettings, StoreError> {
        self.store.set_active(false, "KILL SWITCH", by).await
    }

    pub async fn increment_stats(&self, delta: StatsDelta) -> Result<(), StoreError> {
        self.store.increment_stats(delta).await
    }

    pub async fn get_stats(&self) -> Result<BotStats, StoreError> {
        let settings = self.store.get_settings().await?;
        Ok(BotStats::from(&settings))
    }
}
