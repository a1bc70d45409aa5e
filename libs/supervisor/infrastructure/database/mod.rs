//! Postgres-backed [`Store`] implementation.
//!
//! Every operation is one SQL statement (or an ensure-then-update pair on
//! the settings singleton), so callers observe each of them atomically.

pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::domain::error::StoreError;
use crate::domain::models::{BotMode, BotSettings, OrderStatus, ShareSnapshot, TrackedOrder};
use crate::domain::ports::{OrderStats, StatsDelta, Store, TrackedOrderPatch};

pub use schema::initialize_schema;

const TRACKED_COLUMNS: &str = "order_id, ticker, figi, order_type, quantity, lot_size, \
     entry_price, stop_price, target_price, stop_offset, take_offset, atr, \
     status, is_executed, executed_price, executed_at, parent_order_id, \
     sl_order_id, tp_order_id, pnl_rub, pnl_pct, cancel_reason, \
     created_at, updated_at, created_by";

#[derive(Debug, sqlx::FromRow)]
struct SettingsRow {
    is_active: bool,
    mode: String,
    pause_until: Option<DateTime<Utc>>,
    last_change_reason: Option<String>,
    last_change_by: Option<String>,
    last_change_at: Option<DateTime<Utc>>,
    total_orders_placed: i64,
    total_sl_triggered: i64,
    total_tp_triggered: i64,
    total_pnl_rub: f64,
    updated_at: Option<DateTime<Utc>>,
}

impl SettingsRow {
    fn into_settings(self) -> BotSettings {
        let mode = self.mode.parse().unwrap_or_else(|_| {
            warn!(mode = %self.mode, "unknown mode in bot_settings, falling back to manual");
            BotMode::Manual
        });
        BotSettings {
            is_active: self.is_active,
            mode,
            pause_until: self.pause_until,
            last_change_reason: self.last_change_reason,
            last_change_by: self.last_change_by,
            last_change_at: self.last_change_at,
            total_orders_placed: self.total_orders_placed,
            total_sl_triggered: self.total_sl_triggered,
            total_tp_triggered: self.total_tp_triggered,
            total_pnl_rub: self.total_pnl_rub,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    order_id: String,
    ticker: String,
    figi: String,
    order_type: String,
    quantity: i32,
    lot_size: i32,
    entry_price: f64,
    stop_price: f64,
    target_price: f64,
    stop_offset: f64,
    take_offset: f64,
    atr: f64,
    status: String,
    is_executed: bool,
    executed_price: Option<f64>,
    executed_at: Option<DateTime<Utc>>,
    parent_order_id: Option<String>,
    sl_order_id: Option<String>,
    tp_order_id: Option<String>,
    pnl_rub: Option<f64>,
    pnl_pct: Option<f64>,
    cancel_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_by: Option<String>,
}

impl TryFrom<OrderRow> for TrackedOrder {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, StoreError> {
        let kind = row.order_type.parse().map_err(|detail| StoreError::Corrupt {
            order_id: row.order_id.clone(),
            detail,
        })?;
        let status = row.status.parse().map_err(|detail| StoreError::Corrupt {
            order_id: row.order_id.clone(),
            detail,
        })?;
        Ok(TrackedOrder {
            order_id: row.order_id,
            ticker: row.ticker,
            figi: row.figi,
            kind,
            quantity: row.quantity,
            lot_size: row.lot_size,
            entry_price: row.entry_price,
            stop_price: row.stop_price,
            target_price: row.target_price,
            stop_offset: row.stop_offset,
            take_offset: row.take_offset,
            atr: row.atr,
            status,
            is_executed: row.is_executed,
            executed_price: row.executed_price,
            executed_at: row.executed_at,
            parent_order_id: row.parent_order_id,
            sl_order_id: row.sl_order_id,
            tp_order_id: row.tp_order_id,
            pnl_rub: row.pnl_rub,
            pnl_pct: row.pnl_pct,
            cancel_reason: row.cancel_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    ticker: String,
    figi: String,
    lot_size: i32,
    entry_price: f64,
    stop_price: f64,
    take_price: f64,
    stop_offset: f64,
    take_offset: f64,
    atr: f64,
    position_size: i32,
    last_price: f64,
}

/// Store over a Postgres pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and make sure the schema exists.
    pub async fn new(db_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to database");

        let pool = PgPoolOptions::new().max_connections(10).connect(db_url).await?;

        schema::initialize_schema(&pool).await.map_err(|e| match e {
            schema::SchemaError::DatabaseError(e) => StoreError::Database(e),
        })?;

        info!("Database initialized successfully");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_settings(&self) -> Result<Option<BotSettings>, StoreError> {
        let row: Option<SettingsRow> =
            sqlx::query_as("SELECT * FROM bot_settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(SettingsRow::into_settings))
    }

    /// Insert the singleton with safe defaults unless it already exists.
    async fn ensure_settings(&self) -> Result<BotSettings, StoreError> {
        if let Some(settings) = self.fetch_settings().await? {
            return Ok(settings);
        }

        sqlx::query(
            "INSERT INTO bot_settings (id, is_active, mode, last_change_reason, last_change_by, last_change_at) \
             VALUES (1, false, 'manual', 'Initial setup', 'system', now()) \
             ON CONFLICT (id) DO NOTHING",
        )
        .execute(&self.pool)
        .await?;
        info!(is_active = false, mode = "manual", "bot_settings created");

        self.fetch_settings()
            .await?
            .ok_or_else(|| StoreError::Corrupt {
                order_id: "bot_settings".to_string(),
                detail: "singleton row missing after insert".to_string(),
            })
    }

    async fn audit_update(
        &self,
        assignment: &str,
        reason: &str,
        by: &str,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE bot_settings SET {assignment}, \
             last_change_reason = $1, last_change_by = $2, last_change_at = now(), \
             updated_at = now() WHERE id = 1"
        );
        sqlx::query(&sql)
            .bind(truncate(reason, 200))
            .bind(truncate(by, 50))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_settings(&self) -> Result<BotSettings, StoreError> {
        self.ensure_settings().await
    }

    async fn set_active(
        &self,
        active: bool,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError> {
        self.ensure_settings().await?;
        let assignment = if active {
            // Switching on clears a leftover pause window
            "is_active = true, pause_until = NULL"
        } else {
            "is_active = false"
        };
        self.audit_update(assignment, reason, by).await?;
        info!(is_active = active, reason, by, "bot active changed");
        self.ensure_settings().await
    }

    async fn set_mode(
        &self,
        mode: BotMode,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError> {
        self.ensure_settings().await?;
        sqlx::query(
            "UPDATE bot_settings SET mode = $1, \
             last_change_reason = $2, last_change_by = $3, last_change_at = now(), \
             updated_at = now() WHERE id = 1",
        )
        .bind(mode.as_str())
        .bind(truncate(reason, 200))
        .bind(truncate(by, 50))
        .execute(&self.pool)
        .await?;
        info!(mode = %mode, reason, by, "bot mode changed");
        self.ensure_settings().await
    }

    async fn pause_until(
        &self,
        until: DateTime<Utc>,
        reason: &str,
        by: &str,
    ) -> Result<BotSettings, StoreError> {
        self.ensure_settings().await?;
        sqlx::query(
            "UPDATE bot_settings SET is_active = false, pause_until = $1, \
             last_change_reason = $2, last_change_by = $3, last_change_at = now(), \
             updated_at = now() WHERE id = 1",
        )
        .bind(until)
        .bind(truncate(reason, 200))
        .bind(truncate(by, 50))
        .execute(&self.pool)
        .await?;
        info!(until = %until, by, "bot paused");
        self.ensure_settings().await
    }

    async fn save_tracked(&self, order: &TrackedOrder) -> Result<(), StoreError> {
        debug!(order_id = %order.order_id, ticker = %order.ticker, kind = %order.kind, "saving tracked order");
        sqlx::query(
            r#"
            INSERT INTO tracked_orders (
                order_id, ticker, figi, order_type, quantity, lot_size,
                entry_price, stop_price, target_price, stop_offset, take_offset, atr,
                status, is_executed, executed_price, executed_at, parent_order_id,
                sl_order_id, tp_order_id, pnl_rub, pnl_pct, cancel_reason,
                created_at, updated_at, created_by
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                      $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
            ON CONFLICT (order_id) DO UPDATE SET
                ticker = EXCLUDED.ticker,
                figi = EXCLUDED.figi,
                order_type = EXCLUDED.order_type,
                quantity = EXCLUDED.quantity,
                lot_size = EXCLUDED.lot_size,
                entry_price = EXCLUDED.entry_price,
                stop_price = EXCLUDED.stop_price,
                target_price = EXCLUDED.target_price,
                stop_offset = EXCLUDED.stop_offset,
                take_offset = EXCLUDED.take_offset,
                atr = EXCLUDED.atr,
                status = EXCLUDED.status,
                is_executed = EXCLUDED.is_executed,
                executed_price = EXCLUDED.executed_price,
                executed_at = EXCLUDED.executed_at,
                parent_order_id = EXCLUDED.parent_order_id,
                sl_order_id = EXCLUDED.sl_order_id,
                tp_order_id = EXCLUDED.tp_order_id,
                pnl_rub = EXCLUDED.pnl_rub,
                pnl_pct = EXCLUDED.pnl_pct,
                cancel_reason = EXCLUDED.cancel_reason,
                updated_at = now(),
                created_by = EXCLUDED.created_by
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.ticker)
        .bind(&order.figi)
        .bind(order.kind.as_str())
        .bind(order.quantity)
        .bind(order.lot_size)
        .bind(order.entry_price)
        .bind(order.stop_price)
        .bind(order.target_price)
        .bind(order.stop_offset)
        .bind(order.take_offset)
        .bind(order.atr)
        .bind(order.status.as_str())
        .bind(order.is_executed)
        .bind(order.executed_price)
        .bind(order.executed_at)
        .bind(&order.parent_order_id)
        .bind(&order.sl_order_id)
        .bind(&order.tp_order_id)
        .bind(order.pnl_rub)
        .bind(order.pnl_pct)
        .bind(&order.cancel_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(&order.created_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_tracked(
        &self,
        order_id: &str,
        patch: TrackedOrderPatch,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tracked_orders SET
                status = COALESCE($2, status),
                is_executed = COALESCE($3, is_executed),
                executed_price = COALESCE($4, executed_price),
                executed_at = COALESCE($5, executed_at),
                pnl_rub = COALESCE($6, pnl_rub),
                pnl_pct = COALESCE($7, pnl_pct),
                sl_order_id = COALESCE($8, sl_order_id),
                tp_order_id = COALESCE($9, tp_order_id),
                cancel_reason = COALESCE($10, cancel_reason),
                updated_at = now()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.is_executed)
        .bind(patch.executed_price)
        .bind(patch.executed_at)
        .bind(patch.pnl_rub)
        .bind(patch.pnl_pct)
        .bind(patch.sl_order_id)
        .bind(patch.tp_order_id)
        .bind(patch.cancel_reason)
        .execute(&self.pool)
        .await?;

        let found = result.rows_affected() > 0;
        if !found {
            warn!(order_id, "update_tracked: row not found");
        }
        Ok(found)
    }

    async fn mark_executed(
        &self,
        order_id: &str,
        executed_price: f64,
        reason: &str,
        pnl_rub: Option<f64>,
        pnl_pct: Option<f64>,
    ) -> Result<bool, StoreError> {
        info!(order_id, executed_price, reason, "marking order executed");
        self.update_tracked(
            order_id,
            TrackedOrderPatch {
                status: Some(OrderStatus::Executed),
                is_executed: Some(true),
                executed_price: Some(executed_price),
                executed_at: Some(Utc::now()),
                pnl_rub,
                pnl_pct,
                ..TrackedOrderPatch::default()
            },
        )
        .await
    }

    async fn mark_cancelled(&self, order_id: &str, reason: &str) -> Result<bool, StoreError> {
        info!(order_id, reason, "marking order cancelled");
        self.update_tracked(
            order_id,
            TrackedOrderPatch {
                status: Some(OrderStatus::Cancelled),
                cancel_reason: Some(reason.to_string()),
                ..TrackedOrderPatch::default()
            },
        )
        .await
    }

    async fn link_siblings(
        &self,
        entry_id: &str,
        sl_id: Option<&str>,
        tp_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        if sl_id.is_none() && tp_id.is_none() {
            return Ok(false);
        }
        self.update_tracked(
            entry_id,
            TrackedOrderPatch {
                sl_order_id: sl_id.map(str::to_string),
                tp_order_id: tp_id.map(str::to_string),
                ..TrackedOrderPatch::default()
            },
        )
        .await
    }

    async fn get_tracked(&self, order_id: &str) -> Result<Option<TrackedOrder>, StoreError> {
        let sql = format!("SELECT {TRACKED_COLUMNS} FROM tracked_orders WHERE order_id = $1");
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TrackedOrder::try_from).transpose()
    }

    async fn list_pending(&self) -> Result<Vec<TrackedOrder>, StoreError> {
        let sql = format!(
            "SELECT {TRACKED_COLUMNS} FROM tracked_orders \
             WHERE status = 'pending' ORDER BY created_at"
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(TrackedOrder::try_from).collect()
    }

    async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<TrackedOrder>, StoreError> {
        let sql = format!(
            "SELECT {TRACKED_COLUMNS} FROM tracked_orders \
             WHERE status = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TrackedOrder::try_from).collect()
    }

    async fn list_by_ticker(&self, ticker: &str) -> Result<Vec<TrackedOrder>, StoreError> {
        let sql = format!(
            "SELECT {TRACKED_COLUMNS} FROM tracked_orders \
             WHERE ticker = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(ticker)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TrackedOrder::try_from).collect()
    }

    async fn increment_stats(&self, delta: StatsDelta) -> Result<(), StoreError> {
        self.ensure_settings().await?;
        sqlx::query(
            "UPDATE bot_settings SET \
             total_orders_placed = total_orders_placed + $1, \
             total_sl_triggered = total_sl_triggered + $2, \
             total_tp_triggered = total_tp_triggered + $3, \
             total_pnl_rub = total_pnl_rub + $4, \
             updated_at = now() WHERE id = 1",
        )
        .bind(delta.orders)
        .bind(delta.sl_triggered)
        .bind(delta.tp_triggered)
        .bind(delta.pnl_rub)
        .execute(&self.pool)
        .await?;
        debug!(
            orders = delta.orders,
            sl = delta.sl_triggered,
            tp = delta.tp_triggered,
            pnl = delta.pnl_rub,
            "bot stats updated"
        );
        Ok(())
    }

    async fn order_stats(&self) -> Result<OrderStats, StoreError> {
        let mut stats = OrderStats::default();

        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM tracked_orders GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for (status, count) in by_status {
            match status.as_str() {
                "pending" => stats.pending = count,
                "executed" => stats.executed = count,
                "cancelled" => stats.cancelled = count,
                _ => {}
            }
        }

        let by_kind: Vec<(String, i64)> =
            sqlx::query_as("SELECT order_type, count(*) FROM tracked_orders GROUP BY order_type")
                .fetch_all(&self.pool)
                .await?;
        for (kind, count) in by_kind {
            match kind.as_str() {
                "entry_buy" => stats.entries = count,
                "stop_loss" => stats.stop_losses = count,
                "take_profit" => stats.take_profits = count,
                _ => {}
            }
        }

        let pnl: (Option<f64>,) = sqlx::query_as(
            "SELECT sum(pnl_rub) FROM tracked_orders WHERE status = 'executed'",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.total_pnl_rub = pnl.0.unwrap_or(0.0);

        Ok(stats)
    }

    async fn cleanup_old_orders(&self, days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query(
            "DELETE FROM tracked_orders \
             WHERE status IN ('executed', 'cancelled') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            info!(count, days, "old orders cleaned");
        }
        Ok(count)
    }

    async fn load_snapshots(&self) -> Result<Vec<ShareSnapshot>, StoreError> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT ticker, figi, lot_size, entry_price, stop_price, take_price, \
             stop_offset, take_offset, atr, position_size, last_price \
             FROM share_snapshots ORDER BY ticker",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ShareSnapshot {
                ticker: row.ticker,
                figi: row.figi,
                lot_size: row.lot_size,
                entry_price: row.entry_price,
                stop_price: row.stop_price,
                take_price: row.take_price,
                stop_offset: row.stop_offset,
                take_offset: row.take_offset,
                atr: row.atr,
                position_size: row.position_size,
                last_price: row.last_price,
            })
            .collect())
    }
}
