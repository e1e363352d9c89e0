use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use table_reader::appconfig::TableReaderConfig;
use table_reader::backfill_registry::PgBackfillRegistry;
use table_reader::cli::Cli;
use table_reader::cursor::Cursor;
use table_reader::error::AppResult;
use table_reader::prometheus_server;
use table_reader::sms::http::HttpSms;
use table_reader::source_db::sqlx_impl::PgSourceDb;
use table_reader::watermark::pg_impl::PgWatermarkEmitter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TableReaderConfig::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        backfill_id = %config.backfill_id,
        table_oid = %config.table_oid,
        workers = cli.workers,
        "table reader starting"
    );

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "table reader exited with an error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config: TableReaderConfig) -> AppResult<()> {
    let source_dsn = std::env::var(&config.database.source_dsn_env)
        .map_err(|_| table_reader::error::AppError::MissingConfig("source_dsn_env"))?;
    let registry_dsn = std::env::var(&config.database.registry_dsn_env)
        .map_err(|_| table_reader::error::AppError::MissingConfig("registry_dsn_env"))?;

    let source_db = Arc::new(
        PgSourceDb::connect(
            &source_dsn,
            config.database.pool_min,
            config.database.pool_max,
            Duration::from_millis(config.database.connect_timeout_ms),
            Duration::from_secs(config.database.idle_timeout_sec),
            Duration::from_millis(config.max_timeout_ms),
            config.database.sort_columns.clone(),
            config.database.pk_columns.clone(),
        )
        .await?,
    );

    let registry_pool = sqlx::postgres::PgPoolOptions::new()
        .min_connections(config.database.pool_min)
        .max_connections(config.database.pool_max)
        .acquire_timeout(Duration::from_millis(config.database.connect_timeout_ms))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_sec))
        .connect(&registry_dsn)
        .await
        .map_err(table_reader::error::AppError::Sqlx)?;

    let backfill_registry = Arc::new(PgBackfillRegistry::new(registry_pool.clone()));
    let watermark_emitter = Arc::new(PgWatermarkEmitter::new(registry_pool));
    let sms = Arc::new(HttpSms::from_env(&config.sms.endpoint_env)?);

    let metrics_cfg = config.metrics.clone();
    let initial_min_cursor = Cursor::new(vec![serde_json::json!(0)]);

    let (handle, owner_join) = table_reader::spawn(
        config,
        initial_min_cursor,
        source_db,
        watermark_emitter,
        sms,
        backfill_registry,
    )
    .await?;

    let metrics_handle = handle.clone();
    let metrics_server = tokio::spawn(async move {
        if metrics_cfg.enabled {
            if let Err(e) =
                prometheus_server::run_metrics_server(metrics_cfg, move || metrics_handle.gather_metrics())
                    .await
            {
                tracing::error!(error = %e, "metrics server stopped");
            }
        }
    });

    let stop_reason = owner_join
        .await
        .map_err(table_reader::error::AppError::TaskJoin)?;
    metrics_server.abort();

    tracing::info!(stop_reason = stop_reason.as_str(), "table reader stopped");

    if stop_reason.is_restartable() {
        return Err(table_reader::error::AppError::Internal(format!(
            "worker stopped for a restartable reason: {}",
            stop_reason.as_str()
        )));
    }

    Ok(())
}
