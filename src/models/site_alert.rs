use crate::error::{IncidentError, StoreResult};
use crate::models::incident::require_id;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

/// One fire detection at a site, as persisted by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteAlert {
    pub id: String,
    pub site_id: String,
    pub event_date: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub confidence: Option<String>,
    pub detected_by: Option<String>,
    pub site_incident_id: Option<String>,
    pub is_processed: bool,
}

impl SiteAlert {
    pub fn validate(&self) -> StoreResult<()> {
        require_id("alert id", &self.id)?;
        require_id("site_id", &self.site_id)?;
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(IncidentError::invalid(format!(
                "alert '{}' has coordinates out of range ({}, {})",
                self.id, self.latitude, self.longitude
            )));
        }
        Ok(())
    }

    pub fn is_linked(&self) -> bool {
        self.is_processed && self.site_incident_id.is_some()
    }
}

/// Alert notification as published on Kafka by the ingestion job.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub id: Option<String>,
    pub site_id: Option<String>,
    pub event_date: Option<String>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "parse_confidence")]
    pub confidence: Option<String>,
    pub detected_by: Option<String>,
}

impl AlertMessage {
    pub fn into_site_alert(self) -> StoreResult<SiteAlert> {
        let id = self
            .id
            .ok_or_else(|| IncidentError::invalid("alert message missing id"))?;
        let site_id = self
            .site_id
            .ok_or_else(|| IncidentError::invalid("alert message missing siteId"))?;
        let event_date = self
            .event_date
            .as_deref()
            .map(parse_event_date)
            .transpose()?
            .ok_or_else(|| IncidentError::invalid("alert message missing eventDate"))?;

        let alert = SiteAlert {
            id,
            site_id,
            event_date,
            latitude: self
                .latitude
                .ok_or_else(|| IncidentError::invalid("alert message missing latitude"))?,
            longitude: self
                .longitude
                .ok_or_else(|| IncidentError::invalid("alert message missing longitude"))?,
            confidence: self.confidence,
            detected_by: self.detected_by,
            site_incident_id: None,
            is_processed: false,
        };
        alert.validate()?;
        Ok(alert)
    }
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DD HH:MM:SS` timestamp taken as UTC.
fn parse_event_date(raw: &str) -> StoreResult<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .map(|t| t.and_utc())
        .map_err(|_| IncidentError::invalid(format!("invalid eventDate '{}'", raw)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrFloat {
    String(String),
    Float(f64),
}

fn parse_f64_option<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<StringOrFloat> = Option::deserialize(deserializer)?;
    match v {
        Some(StringOrFloat::Float(f)) => Ok(Some(f)),
        Some(StringOrFloat::String(s)) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                s.trim()
                    .parse::<f64>()
                    .map(Some)
                    .map_err(serde::de::Error::custom)
            }
        }
        None => Ok(None),
    }
}

// VIIRS reports "high"/"nominal"/"low", MODIS a 0-100 percentage.
fn parse_confidence<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<StringOrFloat> = Option::deserialize(deserializer)?;
    Ok(match v {
        Some(StringOrFloat::String(s)) if !s.trim().is_empty() => Some(s.trim().to_lowercase()),
        Some(StringOrFloat::Float(f)) => Some(format!("{}", f)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parsing_mixed_payload() {
        let payload = r#"
        {
            "id": "alert-9f2c",
            "siteId": "site-42",
            "eventDate": "2025-08-01 06:15:15",
            "latitude": "+20.652494",
            "longitude": -100.391404,
            "confidence": "High",
            "detectedBy": "VIIRS_NOAA20",
            "frp": "3.41"
        }
        "#;

        let msg: AlertMessage = serde_json::from_str(payload).unwrap();
        assert_eq!(msg.latitude, Some(20.652494));
        assert_eq!(msg.longitude, Some(-100.391404));
        assert_eq!(msg.confidence.as_deref(), Some("high"));

        let alert = msg.into_site_alert().unwrap();
        assert_eq!(alert.site_id, "site-42");
        assert_eq!(
            alert.event_date,
            Utc.with_ymd_and_hms(2025, 8, 1, 6, 15, 15).unwrap()
        );
        assert!(!alert.is_processed);
        assert!(alert.site_incident_id.is_none());
    }

    #[test]
    fn test_numeric_confidence_and_rfc3339() {
        let payload = r#"{"id":"a1","siteId":"s1","eventDate":"2025-08-01T06:15:15+02:00","confidence":87,"latitude":"-33.9","longitude":18.4}"#;
        let msg: AlertMessage = serde_json::from_str(payload).unwrap();
        assert_eq!(msg.confidence.as_deref(), Some("87"));

        let alert = msg.into_site_alert().unwrap();
        assert_eq!(
            alert.event_date,
            Utc.with_ymd_and_hms(2025, 8, 1, 4, 15, 15).unwrap()
        );
    }

    #[test]
    fn test_missing_site_is_rejected() {
        let payload = r#"{"id":"a1","eventDate":"2025-08-01 06:15:15"}"#;
        let msg: AlertMessage = serde_json::from_str(payload).unwrap();
        assert!(matches!(
            msg.into_site_alert(),
            Err(IncidentError::InvalidArgument { .. })
        ));

        let payload = r#"{"id":"a1","siteId":"s1","eventDate":"yesterday","latitude":1.0,"longitude":2.0}"#;
        let msg: AlertMessage = serde_json::from_str(payload).unwrap();
        assert!(msg.into_site_alert().is_err());
    }

    #[test]
    fn test_missing_coordinates_are_rejected() {
        let payload = r#"{"id":"a1","siteId":"s1","eventDate":"2025-08-01 06:15:15","latitude":"","longitude":null}"#;
        let msg: AlertMessage = serde_json::from_str(payload).unwrap();
        assert_eq!(msg.latitude, None);
        assert!(matches!(
            msg.into_site_alert(),
            Err(IncidentError::InvalidArgument { .. })
        ));

        let payload = r#"{"id":"a1","siteId":"s1","eventDate":"2025-08-01 06:15:15","latitude":20.6}"#;
        let msg: AlertMessage = serde_json::from_str(payload).unwrap();
        assert!(matches!(
            msg.into_site_alert(),
            Err(IncidentError::InvalidArgument { .. })
        ));

        let payload = r#"{"id":"a1","siteId":"s1","eventDate":"2025-08-01 06:15:15","latitude":"120.5","longitude":-100.4}"#;
        let msg: AlertMessage = serde_json::from_str(payload).unwrap();
        assert!(matches!(
            msg.into_site_alert(),
            Err(IncidentError::InvalidArgument { .. })
        ));
    }
}
