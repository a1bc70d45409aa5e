//! Trading bot entry point.
//!
//! Wires configuration, the Postgres store, the broker gateway and the
//! supervisor components into one process: the position watcher loop, the
//! daily snapshot refresh and the Telegram command loop.
//!
//! Usage:
//!     tbot [config.yaml]

use anyhow::Context;
use chrono::{FixedOffset, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use supervisor::infrastructure::config::parse_hh_mm;
use supervisor::infrastructure::sleep_unless_stopped;
use supervisor::{
    BrokerPort, CommandHandler, Config, DryRunBroker, InvestGateway, ModeController, Notifier,
    OrderIntake, OrderValidator, PgStore, PositionWatcher, ShutdownManager, SnapshotCache, Store,
    TelegramBot, TelegramNotifier, WatcherConfig,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Terminal rows older than this are purged at startup.
const CLEANUP_AFTER_DAYS: i64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;

    init_tracing(&config.log_level);
    info!(version = VERSION, "bot starting");
    config.log();

    // Durable state
    let store: Arc<dyn Store> = Arc::new(
        PgStore::new(&config.database.url)
            .await
            .context("connecting to the database")?,
    );
    match store.cleanup_old_orders(CLEANUP_AFTER_DAYS).await {
        Ok(count) if count > 0 => info!(count, "purged old terminal orders"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "startup cleanup failed"),
    }

    // Snapshots produced by the analytics pipeline
    let snapshots = Arc::new(SnapshotCache::new());
    let loaded = match store.load_snapshots().await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "snapshot table unavailable, starting with an empty cache");
            Vec::new()
        }
    };
    info!(count = loaded.len(), "share snapshots loaded");

    // Broker: real gateway or the dry-run double
    let broker: Arc<dyn BrokerPort> = if config.safety.dry_run {
        warn!("DRY RUN enabled: no order will reach the exchange");
        let dry = DryRunBroker::new();
        for snapshot in &loaded {
            dry.set_last_price(snapshot.figi.clone(), snapshot.last_price);
        }
        Arc::new(dry)
    } else {
        Arc::new(InvestGateway::new(&config.tinkoff).context("building the invest gateway")?)
    };
    snapshots.replace_all(loaded);

    // Notifications
    let telegram_notifier = TelegramNotifier::new(&config.telegram);
    let notifier: Arc<dyn Notifier> = Arc::new(telegram_notifier.clone());

    // Supervisor components
    let validator = Arc::new(OrderValidator::new(&config.trading, config.free_trading.clone()));
    let controller = Arc::new(ModeController::new(Arc::clone(&store)));
    let watcher = PositionWatcher::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::clone(&notifier),
        Arc::clone(&validator),
        WatcherConfig {
            poll_interval: Duration::from_secs(config.schedule.poll_interval_secs),
            sl_timeout: Duration::from_secs(config.free_trading.sl_placement_timeout_sec),
        },
    );
    let intake = Arc::new(OrderIntake::new(
        Arc::clone(&broker),
        Arc::clone(&controller),
        Arc::clone(&validator),
        Arc::clone(&snapshots),
        Arc::clone(&watcher),
        config.trading.clone(),
        config.free_trading.clone(),
    ));
    let handler = Arc::new(CommandHandler::new(
        controller,
        intake,
        Arc::clone(&watcher),
        Arc::clone(&snapshots),
        Arc::clone(&store),
        config.telegram.authorized_users.clone(),
    ));

    let shutdown = ShutdownManager::new();
    shutdown.spawn_signal_handler();

    telegram_notifier.send_startup(VERSION).await;

    // Watcher loop
    let watcher_task = tokio::spawn(Arc::clone(&watcher).run(shutdown.flag()));

    // Daily snapshot refresh + counter reset around the analytics run
    let (calc_hour, calc_minute) =
        parse_hh_mm(&config.schedule.daily_calc_time).expect("validated at load time");
    {
        let store = Arc::clone(&store);
        let snapshots = Arc::clone(&snapshots);
        let validator = Arc::clone(&validator);
        let flag = shutdown.flag();
        tokio::spawn(async move {
            loop {
                let wait = seconds_until_msk(calc_hour, calc_minute);
                if !sleep_unless_stopped(&flag, Duration::from_secs(wait)).await {
                    break;
                }
                validator.reset_daily_counters();
                match store.load_snapshots().await {
                    Ok(rows) => {
                        info!(count = rows.len(), "daily snapshot refresh");
                        snapshots.replace_all(rows);
                    }
                    Err(e) => error!(error = %e, "daily snapshot refresh failed"),
                }
            }
        });
    }

    // Command loop; each command runs as its own task
    let mut bot = TelegramBot::new(&config.telegram);
    bot.flush_backlog().await;
    info!("command loop started");

    while shutdown.is_running() {
        for message in bot.poll().await {
            let handler = Arc::clone(&handler);
            let notifier = Arc::clone(&notifier);
            tokio::spawn(async move {
                let reply = handler.handle(message.user_id, &message.text).await;
                notifier.send(&reply).await;
            });
        }
    }

    info!("bot stopping");
    watcher.stop();
    if let Err(e) = watcher_task.await {
        error!(error = %e, "watcher task join failed");
    }
    info!("bot stopped");
    Ok(())
}

/// Configured level for everything, RUST_LOG wins when set. sqlx is
/// pinned to warn so query logging never floods a debug run.
fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("sqlx=warn,{level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Seconds until the next occurrence of `HH:MM` Moscow time.
fn seconds_until_msk(hour: u32, minute: u32) -> u64 {
    let msk = FixedOffset::east_opt(3 * 3600).expect("MSK offset");
    let now = Utc::now().with_timezone(&msk);
    let target_time = NaiveTime::from_hms_opt(hour, minute, 0).expect("valid HH:MM");

    let today_target = now.date_naive().and_time(target_time);
    let target = if now.naive_local() < today_target {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    };
    (target - now.naive_local()).num_seconds().max(1) as u64
}
