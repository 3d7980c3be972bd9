use crate::config::AppConfig;
use crate::orchestrator::IncidentOrchestrator;
use crate::processor::alert_processor;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Consumes site alerts from Kafka with SASL authentication and a circuit breaker.
///
/// Alerts are handled on spawned tasks, at most `kafka_max_in_flight` at once;
/// once that many are pending the consumer stops reading. Alerts for the same
/// site are serialized by the orchestrator's site units, so tasks for one site
/// simply queue behind each other.
pub async fn start_kafka_consumer(
    config: &AppConfig,
    orchestrator: Arc<IncidentOrchestrator>,
) -> anyhow::Result<()> {
    info!("Initializing Kafka consumer for topic: {}", config.kafka_topic);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_bootstrap_servers)
        .set("group.id", &config.kafka_group_id)
        .set("auto.offset.reset", &config.kafka_auto_offset_reset)
        .set("security.protocol", &config.kafka_security_protocol)
        .set("sasl.mechanism", &config.kafka_sasl_mechanism)
        .set("sasl.username", &config.kafka_username)
        .set("sasl.password", &config.kafka_password);

    let consumer: StreamConsumer = client_config.create()?;
    consumer.subscribe(&[&config.kafka_topic])?;
    info!(
        max_in_flight = config.kafka_max_in_flight,
        "Subscribed to topic: {}", config.kafka_topic
    );

    let in_flight = Arc::new(Semaphore::new(config.kafka_max_in_flight));
    let mut consecutive_failures = 0;
    let max_retries = config.kafka_max_retries;
    let cooldown = Duration::from_secs(config.kafka_circuit_breaker_cooldown);

    loop {
        if consecutive_failures >= max_retries {
            warn!(
                "Circuit breaker open after {} consecutive failures, pausing alert intake for {}s",
                consecutive_failures, config.kafka_circuit_breaker_cooldown
            );
            tokio::time::sleep(cooldown).await;
            consecutive_failures = 0;
            info!("Circuit breaker closed, resuming alert intake");
        }

        let permit = Arc::clone(&in_flight).acquire_owned().await?;

        match consumer.recv().await {
            Ok(m) => {
                consecutive_failures = 0;

                let site_key = site_key(m.key());
                let Some(payload) = m.payload().map(<[u8]>::to_vec) else {
                    warn!(
                        site = %site_key,
                        partition = m.partition(),
                        offset = m.offset(),
                        "Received alert without payload"
                    );
                    continue;
                };
                debug!(
                    site = %site_key,
                    partition = m.partition(),
                    offset = m.offset(),
                    "Received alert"
                );

                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    if let Err(e) = alert_processor::process_message(&orchestrator, &payload).await
                    {
                        error!(site = %site_key, "Error processing alert message: {}", e);
                    }
                    drop(permit);
                });
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    "Kafka error: {}. Consecutive failures: {} / {}",
                    e, consecutive_failures, max_retries
                );
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// The ingestion job keys alert records by site id.
fn site_key(key: Option<&[u8]>) -> String {
    match key {
        Some(bytes) if !bytes.is_empty() => String::from_utf8_lossy(bytes).into_owned(),
        _ => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_key() {
        assert_eq!(site_key(Some(b"site-42")), "site-42");
        assert_eq!(site_key(Some(b"")), "-");
        assert_eq!(site_key(None), "-");
    }
}
