use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use site_incidents::clock::SystemClock;
use site_incidents::config::AppConfig;
use site_incidents::db::{self, PgIncidentRepository};
use site_incidents::metrics::FacadeMetrics;
use site_incidents::orchestrator::IncidentOrchestrator;
use site_incidents::{kafka, sweeper};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config
    let config = AppConfig::load()?;

    // Init logging
    let filter = EnvFilter::new(&config.log_level);
    if config.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting Site Incidents Service...");

    if let Some(addr) = &config.metrics_listen_addr {
        let addr: SocketAddr = addr.parse().context("METRICS_LISTEN_ADDR")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        info!("Serving metrics on {}", addr);
    }

    // Init DB
    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;
    info!("Connected to database");
    if config.db_run_migrations {
        db::run_migrations(&pool).await?;
        info!("Migrations applied");
    }

    let clock = Arc::new(SystemClock);
    let repo = Arc::new(PgIncidentRepository::new(pool, clock.clone()));
    let orchestrator = Arc::new(IncidentOrchestrator::new(
        repo,
        clock,
        Arc::new(FacadeMetrics),
        config.incident_settings(),
    ));

    let sweep = tokio::spawn(sweeper::run_sweeper(
        Arc::clone(&orchestrator),
        Duration::from_secs(config.incident_sweep_interval_secs),
    ));

    tokio::select! {
        result = kafka::start_kafka_consumer(&config, orchestrator) => {
            if let Err(e) = &result {
                error!("Kafka consumer stopped: {}", e);
            }
            sweep.abort();
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            sweep.abort();
            Ok(())
        }
    }
}
