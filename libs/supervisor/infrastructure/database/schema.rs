use sqlx::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Database schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize database schema
pub async fn initialize_schema(pool: &PgPool) -> Result<()> {
    // Singleton settings row: the kill switch, mode and running counters
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bot_settings (
            id INTEGER PRIMARY KEY,
            is_active BOOLEAN NOT NULL DEFAULT false,
            mode TEXT NOT NULL DEFAULT 'manual',
            pause_until TIMESTAMPTZ,
            last_change_reason TEXT,
            last_change_by TEXT,
            last_change_at TIMESTAMPTZ,
            total_orders_placed BIGINT NOT NULL DEFAULT 0,
            total_sl_triggered BIGINT NOT NULL DEFAULT 0,
            total_tp_triggered BIGINT NOT NULL DEFAULT 0,
            total_pnl_rub DOUBLE PRECISION NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Bot is OFF until an operator switches it on
    sqlx::query(
        "INSERT INTO bot_settings (id, is_active, mode, last_change_reason, last_change_by, last_change_at) \
         VALUES (1, false, 'manual', 'Initial setup', 'system', now()) \
         ON CONFLICT (id) DO NOTHING",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracked_orders (
            order_id TEXT PRIMARY KEY,
            ticker TEXT NOT NULL,
            figi TEXT NOT NULL,
            order_type TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            lot_size INTEGER NOT NULL DEFAULT 1,
            entry_price DOUBLE PRECISION NOT NULL,
            stop_price DOUBLE PRECISION NOT NULL,
            target_price DOUBLE PRECISION NOT NULL,
            stop_offset DOUBLE PRECISION NOT NULL DEFAULT 0,
            take_offset DOUBLE PRECISION NOT NULL DEFAULT 0,
            atr DOUBLE PRECISION NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            is_executed BOOLEAN NOT NULL DEFAULT false,
            executed_price DOUBLE PRECISION,
            executed_at TIMESTAMPTZ,
            parent_order_id TEXT,
            sl_order_id TEXT,
            tp_order_id TEXT,
            pnl_rub DOUBLE PRECISION,
            pnl_pct DOUBLE PRECISION,
            cancel_reason TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            created_by TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracked_orders_status ON tracked_orders(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracked_orders_ticker ON tracked_orders(ticker)")
        .execute(pool)
        .await?;

    // Produced by the daily analytics pipeline; this process only reads it.
    // Created here so a fresh database boots without the pipeline.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS share_snapshots (
            ticker TEXT PRIMARY KEY,
            figi TEXT NOT NULL,
            lot_size INTEGER NOT NULL DEFAULT 1,
            entry_price DOUBLE PRECISION NOT NULL,
            stop_price DOUBLE PRECISION NOT NULL,
            take_price DOUBLE PRECISION NOT NULL,
            stop_offset DOUBLE PRECISION NOT NULL DEFAULT 0,
            take_offset DOUBLE PRECISION NOT NULL DEFAULT 0,
            atr DOUBLE PRECISION NOT NULL DEFAULT 0,
            position_size INTEGER NOT NULL DEFAULT 0,
            last_price DOUBLE PRECISION NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
