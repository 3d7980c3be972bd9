use crate::models::AlertMessage;
use crate::orchestrator::IncidentOrchestrator;
use tracing::{info, warn};

/// Handles one raw alert payload from the bus.
///
/// Malformed payloads are logged and dropped; orchestration failures are returned.
pub async fn process_message(
    orchestrator: &IncidentOrchestrator,
    payload: &[u8],
) -> anyhow::Result<()> {
    // 1. Parse JSON
    let message: AlertMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to parse alert message: {}", e);
            return Ok(());
        }
    };

    // 2. Validate
    let alert = match message.into_site_alert() {
        Ok(alert) => alert,
        Err(e) => {
            warn!("Skipping alert message: {}", e);
            return Ok(());
        }
    };

    // 3. Attach to an incident
    let incident = orchestrator.process_new_alert(&alert).await?;
    info!(
        site_id = %alert.site_id,
        alert_id = %alert.id,
        incident_id = %incident.id,
        "Alert processed"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{IncidentStore, InMemoryIncidentRepository};
    use crate::metrics::RecordingMetrics;
    use crate::models::SiteAlert;
    use crate::orchestrator::IncidentSettings;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (InMemoryIncidentRepository, IncidentOrchestrator) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 8, 1, 6, 0, 0).unwrap(),
        ));
        let repo = InMemoryIncidentRepository::new(clock.clone());
        let orchestrator = IncidentOrchestrator::new(
            Arc::new(repo.clone()),
            clock,
            RecordingMetrics::new(),
            IncidentSettings::default(),
        );
        (repo, orchestrator)
    }

    #[tokio::test]
    async fn test_payload_opens_incident() {
        let (repo, orchestrator) = setup();
        repo.insert_alert(SiteAlert {
            id: "a1".into(),
            site_id: "s1".into(),
            event_date: Utc.with_ymd_and_hms(2025, 8, 1, 5, 58, 0).unwrap(),
            latitude: 20.65,
            longitude: -100.39,
            confidence: Some("high".into()),
            detected_by: Some("VIIRS_NOAA20".into()),
            site_incident_id: None,
            is_processed: false,
        });

        let payload = br#"{"id":"a1","siteId":"s1","eventDate":"2025-08-01 05:58:00","latitude":"20.65","longitude":"-100.39","confidence":"high","detectedBy":"VIIRS_NOAA20"}"#;
        process_message(&orchestrator, payload).await.unwrap();

        let active = repo.find_active_by_site_id("s1").await.unwrap().unwrap();
        assert_eq!(active.start_alert_id, "a1");
    }

    #[tokio::test]
    async fn test_bad_payloads_are_skipped() {
        let (repo, orchestrator) = setup();

        process_message(&orchestrator, b"not json").await.unwrap();
        process_message(&orchestrator, br#"{"id":"a1","eventDate":"2025-08-01 05:58:00"}"#)
            .await
            .unwrap();
        process_message(
            &orchestrator,
            br#"{"id":"a1","siteId":"s1","eventDate":"2025-08-01 05:58:00"}"#,
        )
        .await
        .unwrap();

        assert_eq!(repo.count_active_by_site("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_alert_is_an_error() {
        let (_, orchestrator) = setup();
        let payload = br#"{"id":"ghost","siteId":"s1","eventDate":"2025-08-01 05:58:00","latitude":20.65,"longitude":-100.39}"#;
        assert!(process_message(&orchestrator, payload).await.is_err());
    }
}
