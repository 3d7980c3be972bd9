//! Storage port for incidents and their alert linkage.
//!
//! No business rules live here: callers decide *when* an incident is opened,
//! extended or closed, the store only makes those writes durable.

use crate::error::{IncidentError, StoreResult};
use crate::models::{Incident, IncidentDetail, IncidentPatch, NewIncident, SiteAlert};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which timestamp the sweep treats as "last activity" when picking candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityBasis {
    #[default]
    StartedAt,
    UpdatedAt,
}

impl ActivityBasis {
    pub fn timestamp_of(&self, incident: &Incident) -> DateTime<Utc> {
        match self {
            ActivityBasis::StartedAt => incident.started_at,
            ActivityBasis::UpdatedAt => incident.updated_at,
        }
    }
}

impl fmt::Display for ActivityBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityBasis::StartedAt => f.write_str("started_at"),
            ActivityBasis::UpdatedAt => f.write_str("updated_at"),
        }
    }
}

impl FromStr for ActivityBasis {
    type Err = IncidentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "started_at" => Ok(ActivityBasis::StartedAt),
            "updated_at" => Ok(ActivityBasis::UpdatedAt),
            other => Err(IncidentError::invalid(format!(
                "unknown activity basis '{}'",
                other
            ))),
        }
    }
}

/// The closing write applied to each incident of a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionUpdate {
    pub ended_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_processed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemError {
    pub incident_id: String,
    pub error: IncidentError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMetrics {
    pub batch_size: usize,
    pub duration_ms: u64,
}

/// Outcome of a batch close. Per-item failures are reported here, never raised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResolveResult {
    pub resolved_count: usize,
    /// Incidents that were already closed when their turn came.
    pub skipped_count: usize,
    pub errors: Vec<BatchItemError>,
    pub metrics: BatchMetrics,
}

impl BatchResolveResult {
    pub fn is_partial_failure(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Typed CRUD over incidents and the alert rows they reference.
///
/// Every operation validates its identifiers first and fails with
/// `InvalidArgument` on an empty one. Nothing here retries.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// The single active incident of a site, if any.
    async fn find_active_by_site_id(&self, site_id: &str) -> StoreResult<Option<Incident>>;

    /// Opens an incident: active, unprocessed, `to_review`.
    async fn create_incident(&self, new: NewIncident) -> StoreResult<Incident>;

    /// Applies a partial update and stamps `updated_at`.
    async fn update_incident(&self, id: &str, patch: &IncidentPatch) -> StoreResult<Incident>;

    /// Moves `latest_alert_id` forward and stamps `updated_at`.
    async fn associate_alert(&self, incident_id: &str, alert_id: &str) -> StoreResult<Incident>;

    /// Active, unprocessed incidents whose `basis` timestamp is older than `now - inactivity`.
    async fn find_inactive_incidents(
        &self,
        inactivity: Duration,
        basis: ActivityBasis,
    ) -> StoreResult<Vec<Incident>>;

    /// Closes each incident independently. `Err` only when the batch could not run at all.
    async fn resolve_incidents_batch(
        &self,
        incidents: &[Incident],
        update: &ResolutionUpdate,
    ) -> StoreResult<BatchResolveResult>;

    async fn get_incident_by_id(&self, id: &str) -> StoreResult<Option<Incident>>;

    async fn count_active_by_site(&self, site_id: &str) -> StoreResult<i64>;

    /// Incidents of a site started within `[start, end]`, newest first.
    async fn find_incidents_by_date_range(
        &self,
        site_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Incident>>;

    async fn get_alert(&self, alert_id: &str) -> StoreResult<Option<SiteAlert>>;

    /// Links an alert to an incident and flags it processed.
    async fn mark_alert_processed(&self, alert_id: &str, incident_id: &str) -> StoreResult<()>;

    async fn get_incident_detail(&self, id: &str) -> StoreResult<Option<IncidentDetail>>;
}

/// A store that can hand out atomic units of work scoped to one site.
#[async_trait]
pub trait IncidentRepository: IncidentStore {
    /// Blocks until no other unit holds `site_id`, then opens a unit. Dropping
    /// the unit without `commit` discards its writes.
    async fn begin_site(&self, site_id: &str) -> StoreResult<Box<dyn SiteUnit>>;
}

#[async_trait]
pub trait SiteUnit: IncidentStore {
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Constraint named by `Conflict` when a second active incident would exist for a site.
pub(crate) const ONE_ACTIVE_PER_SITE: &str = "site_incidents_one_active_per_site";
/// Constraint named by `Conflict` when an alert is attached to an incident that closed meanwhile.
pub(crate) const INCIDENT_NOT_ACTIVE: &str = "site_incidents_active_for_association";

pub(crate) fn require_range(start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<()> {
    if start > end {
        return Err(IncidentError::invalid(format!(
            "date range start {} is after end {}",
            start, end
        )));
    }
    Ok(())
}

pub(crate) fn require_positive(inactivity: Duration) -> StoreResult<()> {
    if inactivity <= Duration::zero() {
        return Err(IncidentError::invalid("inactivity window must be positive"));
    }
    Ok(())
}
