use crate::error::{IncidentError, StoreResult};
use crate::models::site_alert::SiteAlert;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// A grouping of temporally-correlated alerts at one site.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub site_id: String,
    pub start_alert_id: String,
    pub latest_alert_id: String,
    pub end_alert_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_processed: bool,
    pub review_status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    pub fn is_closed(&self) -> bool {
        !self.is_active
    }
}

/// Human-review workflow tag. Owned outside the engine but persisted with the incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "site_incident_review_status", rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    ToReview,
    InReview,
    Reviewed,
    Archived,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::ToReview => "to_review",
            ReviewStatus::InReview => "in_review",
            ReviewStatus::Reviewed => "reviewed",
            ReviewStatus::Archived => "archived",
        }
    }

    /// Setting the current status again is always allowed.
    pub fn can_transition_to(self, next: ReviewStatus) -> bool {
        use ReviewStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (ToReview, InReview)
                | (ToReview, Archived)
                | (InReview, ToReview)
                | (InReview, Reviewed)
                | (InReview, Archived)
                | (Reviewed, InReview)
                | (Reviewed, Archived)
                | (Archived, ToReview)
        )
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = IncidentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to_review" => Ok(ReviewStatus::ToReview),
            "in_review" => Ok(ReviewStatus::InReview),
            "reviewed" => Ok(ReviewStatus::Reviewed),
            "archived" => Ok(ReviewStatus::Archived),
            other => Err(IncidentError::invalid(format!(
                "unknown review status '{}'",
                other
            ))),
        }
    }
}

/// Fields required to open an incident.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIncident {
    pub site_id: String,
    pub start_alert_id: String,
    pub latest_alert_id: String,
    pub started_at: DateTime<Utc>,
}

impl NewIncident {
    /// An incident seeded by a single alert: it is both the start and the latest.
    pub fn seeded_by(alert: &SiteAlert, started_at: DateTime<Utc>) -> Self {
        Self {
            site_id: alert.site_id.clone(),
            start_alert_id: alert.id.clone(),
            latest_alert_id: alert.id.clone(),
            started_at,
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        require_id("site_id", &self.site_id)?;
        require_id("start_alert_id", &self.start_alert_id)?;
        require_id("latest_alert_id", &self.latest_alert_id)?;
        Ok(())
    }
}

/// Partial update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentPatch {
    pub latest_alert_id: Option<String>,
    pub end_alert_id: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
    pub is_processed: Option<bool>,
    pub review_status: Option<ReviewStatus>,
}

impl IncidentPatch {
    pub fn review_status(status: ReviewStatus) -> Self {
        Self {
            review_status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == IncidentPatch::default()
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.is_empty() {
            return Err(IncidentError::invalid("incident patch has no fields"));
        }
        if let Some(id) = &self.latest_alert_id {
            require_id("latest_alert_id", id)?;
        }
        if let Some(id) = &self.end_alert_id {
            require_id("end_alert_id", id)?;
        }
        match self.is_active {
            Some(true) => Err(IncidentError::invalid("a closed incident cannot be reopened")),
            Some(false) if self.ended_at.is_none() => Err(IncidentError::invalid(
                "closing an incident requires ended_at",
            )),
            _ => Ok(()),
        }
    }

    /// Applies the patch in place. Used by the in-memory store.
    pub fn apply_to(&self, incident: &mut Incident) {
        if let Some(id) = &self.latest_alert_id {
            incident.latest_alert_id = id.clone();
        }
        if let Some(id) = &self.end_alert_id {
            incident.end_alert_id = Some(id.clone());
        }
        if let Some(at) = self.ended_at {
            incident.ended_at = Some(at);
        }
        if let Some(active) = self.is_active {
            incident.is_active = active;
        }
        if let Some(processed) = self.is_processed {
            incident.is_processed = processed;
        }
        if let Some(status) = self.review_status {
            incident.review_status = status;
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
}

/// Read model returned to front-ends: the incident and everything linked to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentDetail {
    pub incident: Incident,
    pub site: Option<Site>,
    pub start_alert: Option<SiteAlert>,
    pub latest_alert: Option<SiteAlert>,
    pub alerts: Vec<SiteAlert>,
}

pub(crate) fn require_id(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(IncidentError::invalid(format!("{} is empty", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_review_status_transitions() {
        use ReviewStatus::*;
        assert!(ToReview.can_transition_to(InReview));
        assert!(InReview.can_transition_to(Reviewed));
        assert!(Reviewed.can_transition_to(Archived));
        assert!(Archived.can_transition_to(ToReview));
        assert!(Reviewed.can_transition_to(Reviewed));

        assert!(!ToReview.can_transition_to(Reviewed));
        assert!(!Archived.can_transition_to(Reviewed));
        assert!(!Reviewed.can_transition_to(ToReview));
    }

    #[test]
    fn test_review_status_parse() {
        assert_eq!("in_review".parse::<ReviewStatus>().unwrap(), ReviewStatus::InReview);
        assert!("pending".parse::<ReviewStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&ReviewStatus::ToReview).unwrap(),
            "\"to_review\""
        );
    }

    #[test]
    fn test_new_incident_requires_ids() {
        let started_at = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let mut new = NewIncident {
            site_id: "site-1".into(),
            start_alert_id: "a1".into(),
            latest_alert_id: "a1".into(),
            started_at,
        };
        assert!(new.validate().is_ok());

        new.site_id = "  ".into();
        assert!(matches!(
            new.validate(),
            Err(IncidentError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_patch_cannot_reopen_or_close_without_end() {
        assert!(IncidentPatch::default().validate().is_err());

        let reopen = IncidentPatch {
            is_active: Some(true),
            ..Default::default()
        };
        assert!(reopen.validate().is_err());

        let close = IncidentPatch {
            is_active: Some(false),
            ..Default::default()
        };
        assert!(close.validate().is_err());

        assert!(IncidentPatch::review_status(ReviewStatus::Archived)
            .validate()
            .is_ok());
    }
}
