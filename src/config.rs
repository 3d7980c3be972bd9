use crate::db::ActivityBasis;
use crate::orchestrator::IncidentSettings;
use anyhow::{Context, Result};
use chrono::Duration;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub kafka_bootstrap_servers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_auto_offset_reset: String,
    pub kafka_sasl_mechanism: String,
    pub kafka_username: String,
    pub kafka_password: String,
    pub kafka_security_protocol: String,
    pub kafka_max_retries: u32,
    pub kafka_circuit_breaker_cooldown: u64,
    pub kafka_max_in_flight: usize,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_run_migrations: bool,
    pub incident_inactive_hours: i64,
    pub incident_sweep_interval_secs: u64,
    pub incident_sweep_basis: ActivityBasis,
    pub incident_conflict_retries: u32,
    pub log_level: String,
    pub log_format: String,
    pub metrics_listen_addr: Option<String>,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let kafka_bootstrap_servers = var_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092");
        let kafka_topic = var_or("KAFKA_TOPIC", "site-alerts");
        let kafka_group_id = var_or("KAFKA_GROUP_ID", "site-incidents");
        let kafka_auto_offset_reset = var_or("KAFKA_AUTO_OFFSET_RESET", "latest");
        let kafka_sasl_mechanism = var_or("KAFKA_SASL_MECHANISM", "SCRAM-SHA-256");
        let kafka_username = env::var("KAFKA_USERNAME").unwrap_or_default();
        let kafka_password = env::var("KAFKA_PASSWORD").unwrap_or_default();
        let kafka_security_protocol = var_or("KAFKA_SECURITY_PROTOCOL", "SASL_PLAINTEXT");
        let kafka_max_retries = parsed_or("KAFKA_MAX_RETRIES", 5);
        let kafka_circuit_breaker_cooldown = parsed_or("KAFKA_CIRCUIT_BREAKER_COOLDOWN", 300);
        let kafka_max_in_flight = parsed_or("KAFKA_MAX_IN_FLIGHT", 64usize).max(1);

        let db_host = var_or("DB_HOST", "localhost");
        let db_port = var_or("DB_PORT", "5432");
        let db_name = var_or("DB_DATABASE", "site_incidents");
        let db_user = var_or("DB_USER", "incidents");
        let db_pwd = var_or("DB_PWD", "incidents");

        let database_url = format!(
            "postgres://{}:{}@{}:{}/{}",
            db_user, db_pwd, db_host, db_port, db_name
        );
        let db_max_connections = parsed_or("DB_MAX_CONNECTIONS", 20);
        let db_run_migrations = parsed_or("DB_RUN_MIGRATIONS", false);

        let incident_inactive_hours = parsed_or("INCIDENT_INACTIVE_HOURS", 6i64).max(1);
        let incident_sweep_interval_secs = parsed_or("INCIDENT_SWEEP_INTERVAL_SECS", 900u64).max(1);
        let incident_sweep_basis = var_or("INCIDENT_SWEEP_BASIS", "started_at")
            .parse::<ActivityBasis>()
            .context("INCIDENT_SWEEP_BASIS")?;
        let incident_conflict_retries = parsed_or("INCIDENT_CONFLICT_RETRIES", 3);

        let log_level = var_or("LOG_LEVEL", "info");
        let log_format = var_or("LOG_FORMAT", "text");
        let metrics_listen_addr = env::var("METRICS_LISTEN_ADDR")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(Self {
            kafka_bootstrap_servers,
            kafka_topic,
            kafka_group_id,
            kafka_auto_offset_reset,
            kafka_sasl_mechanism,
            kafka_username,
            kafka_password,
            kafka_security_protocol,
            kafka_max_retries,
            kafka_circuit_breaker_cooldown,
            kafka_max_in_flight,
            database_url,
            db_max_connections,
            db_run_migrations,
            incident_inactive_hours,
            incident_sweep_interval_secs,
            incident_sweep_basis,
            incident_conflict_retries,
            log_level,
            log_format,
            metrics_listen_addr,
        })
    }

    pub fn incident_settings(&self) -> IncidentSettings {
        IncidentSettings {
            inactivity: Duration::hours(self.incident_inactive_hours),
            sweep_basis: self.incident_sweep_basis,
            max_conflict_retries: self.incident_conflict_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global, so every assertion on them lives in this one test.
    #[test]
    fn test_load_defaults_and_overrides() {
        for key in [
            "INCIDENT_INACTIVE_HOURS",
            "INCIDENT_SWEEP_BASIS",
            "KAFKA_MAX_RETRIES",
            "KAFKA_MAX_IN_FLIGHT",
            "METRICS_LISTEN_ADDR",
        ] {
            env::remove_var(key);
        }

        let config = AppConfig::load().unwrap();
        assert_eq!(config.incident_settings(), IncidentSettings::default());
        assert_eq!(config.kafka_max_retries, 5);
        assert_eq!(config.kafka_max_in_flight, 64);
        assert!(config.metrics_listen_addr.is_none());

        env::set_var("INCIDENT_INACTIVE_HOURS", "12");
        env::set_var("INCIDENT_SWEEP_BASIS", "updated_at");
        env::set_var("KAFKA_MAX_RETRIES", "not-a-number");
        env::set_var("KAFKA_MAX_IN_FLIGHT", "0");
        let config = AppConfig::load().unwrap();
        assert_eq!(config.kafka_max_in_flight, 1);
        assert_eq!(config.incident_settings().inactivity, Duration::hours(12));
        assert_eq!(config.incident_sweep_basis, ActivityBasis::UpdatedAt);
        assert_eq!(config.kafka_max_retries, 5);

        env::set_var("INCIDENT_SWEEP_BASIS", "last_alert");
        assert!(AppConfig::load().is_err());

        for key in [
            "INCIDENT_INACTIVE_HOURS",
            "INCIDENT_SWEEP_BASIS",
            "KAFKA_MAX_RETRIES",
            "KAFKA_MAX_IN_FLIGHT",
        ] {
            env::remove_var(key);
        }
    }
}
