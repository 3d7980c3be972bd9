//! Staleness decisions and batch closure.
//!
//! Everything here is pure apart from `batch_resolve`, which delegates the
//! writes to the store and records how the batch went.

use crate::clock::Clock;
use crate::db::store::{ActivityBasis, BatchResolveResult, IncidentStore, ResolutionUpdate};
use crate::error::{IncidentError, StoreResult};
use crate::metrics::{MetricsSink, StepTimer};
use crate::models::incident::require_id;
use crate::models::Incident;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Derived view of an incident's staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionState {
    pub inactive_minutes: i64,
    pub should_resolve: bool,
}

pub struct ResolutionPolicy {
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    basis: ActivityBasis,
}

impl ResolutionPolicy {
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>, basis: ActivityBasis) -> Self {
        Self {
            clock,
            metrics,
            basis,
        }
    }

    pub fn basis(&self) -> ActivityBasis {
        self.basis
    }

    /// True iff the incident is still open and has been quiet for at least `inactivity`.
    /// A closed incident is never resolved again.
    pub fn should_resolve(
        &self,
        incident: &Incident,
        last_alert_time: DateTime<Utc>,
        inactivity: Duration,
    ) -> bool {
        incident.is_active && self.clock.now() - last_alert_time >= inactivity
    }

    pub fn calculate_state(
        &self,
        incident: &Incident,
        last_alert_time: DateTime<Utc>,
        inactivity: Duration,
    ) -> ResolutionState {
        ResolutionState {
            inactive_minutes: (self.clock.now() - last_alert_time).num_minutes(),
            should_resolve: self.should_resolve(incident, last_alert_time, inactivity),
        }
    }

    /// Sweep pre-filter: open, not yet handed to the notification pipeline,
    /// and old enough by the configured basis.
    pub fn is_in_resolution_window(&self, incident: &Incident, inactivity: Duration) -> bool {
        incident.is_active
            && !incident.is_processed
            && self.clock.now() - self.basis.timestamp_of(incident) >= inactivity
    }

    /// The closing write. Leaves `is_processed` false so the notification
    /// pipeline sees the closure exactly once.
    pub fn prepare_for_resolution(&self) -> ResolutionUpdate {
        ResolutionUpdate {
            ended_at: self.clock.now(),
            is_active: false,
            is_processed: false,
        }
    }

    /// Structural sanity check so one malformed row cannot poison a batch.
    pub fn validate(&self, incident: &Incident) -> StoreResult<()> {
        require_id("incident id", &incident.id)?;
        require_id("site_id", &incident.site_id)?;
        require_id("start_alert_id", &incident.start_alert_id)?;
        require_id("latest_alert_id", &incident.latest_alert_id)?;
        if incident.started_at.timestamp() <= 0 {
            return Err(IncidentError::invalid(format!(
                "incident '{}' has no started_at",
                incident.id
            )));
        }
        if !incident.is_active && incident.ended_at.is_none() {
            return Err(IncidentError::invalid(format!(
                "closed incident '{}' has no ended_at",
                incident.id
            )));
        }
        Ok(())
    }

    /// Closes `incidents` through the store. Per-item failures come back in the
    /// result; only a failure of the whole call is returned as `Err`.
    pub async fn batch_resolve<S>(
        &self,
        store: &S,
        incidents: &[Incident],
    ) -> StoreResult<BatchResolveResult>
    where
        S: IncidentStore + ?Sized,
    {
        if incidents.is_empty() {
            debug!("nothing to resolve");
            return Ok(BatchResolveResult::default());
        }

        let update = self.prepare_for_resolution();
        let timer = StepTimer::start(&self.metrics, "batch_resolve");
        let result = match store.resolve_incidents_batch(incidents, &update).await {
            Ok(result) => result,
            Err(e) => {
                error!("Batch resolution of {} incidents failed: {}", incidents.len(), e);
                return Err(e);
            }
        };
        let elapsed = timer.stop();

        self.metrics
            .record_value("resolved_count", result.resolved_count as f64);
        self.metrics
            .record_value("error_count", result.errors.len() as f64);
        self.metrics
            .record_value("batch_size", incidents.len() as f64);
        self.metrics
            .record_value("total_duration_ms", elapsed.as_millis() as f64);
        self.metrics
            .increment("incident_closed", result.resolved_count as u64);

        if result.is_partial_failure() {
            for item in &result.errors {
                warn!(incident_id = %item.incident_id, "Incident not closed: {}", item.error);
            }
        }
        info!(
            resolved = result.resolved_count,
            skipped = result.skipped_count,
            errors = result.errors.len(),
            "Resolved incident batch in {}ms",
            elapsed.as_millis()
        );

        Ok(result)
    }
}
