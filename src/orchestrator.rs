//! Incident lifecycle: turns a stream of site alerts into open/extend/close
//! decisions and runs the inactivity sweep.
//!
//! ```text
//!   ∅ ──create──▶ Active ──extend──▶ Active
//!                   │
//!                   ├── close-on-stale-arrival ──▶ Closed  (+ create for the same alert)
//!                   └── close-on-sweep ──────────▶ Closed
//! ```
//! Closed is terminal.

use crate::clock::Clock;
use crate::db::store::{
    ActivityBasis, BatchResolveResult, IncidentRepository, IncidentStore, SiteUnit,
};
use crate::error::{IncidentError, StoreResult};
use crate::metrics::{MetricsSink, StepTimer};
use crate::models::incident::require_id;
use crate::models::{
    Incident, IncidentDetail, IncidentPatch, NewIncident, ReviewStatus, SiteAlert,
};
use crate::resolution::ResolutionPolicy;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct IncidentSettings {
    /// Silence after which an open incident is stale.
    pub inactivity: Duration,
    /// Timestamp the sweep measures silence from.
    pub sweep_basis: ActivityBasis,
    /// How many times a lost race on the one-active-per-site constraint is retried.
    pub max_conflict_retries: u32,
}

impl Default for IncidentSettings {
    fn default() -> Self {
        Self {
            inactivity: Duration::hours(6),
            sweep_basis: ActivityBasis::StartedAt,
            max_conflict_retries: 3,
        }
    }
}

pub struct IncidentOrchestrator {
    repo: Arc<dyn IncidentRepository>,
    policy: ResolutionPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    settings: IncidentSettings,
}

impl IncidentOrchestrator {
    pub fn new(
        repo: Arc<dyn IncidentRepository>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        settings: IncidentSettings,
    ) -> Self {
        let policy = ResolutionPolicy::new(clock.clone(), metrics.clone(), settings.sweep_basis);
        Self {
            repo,
            policy,
            clock,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &IncidentSettings {
        &self.settings
    }

    /// Attaches `alert` to its site's open incident, or opens one.
    ///
    /// Lookup, decision and writes happen inside one site unit. Calling this
    /// again for an alert that is already linked returns the linked incident.
    pub async fn process_new_alert(&self, alert: &SiteAlert) -> StoreResult<Incident> {
        alert.validate()?;
        let timer = StepTimer::start(&self.metrics, "process_new_alert");
        let mut attempt = 0;

        loop {
            match self.try_process_alert(alert).await {
                Ok(incident) => {
                    timer.stop();
                    self.metrics.increment("alert_processed", 1);
                    return Ok(incident);
                }
                Err(e) if e.is_retryable() && attempt < self.settings.max_conflict_retries => {
                    attempt += 1;
                    self.metrics.increment("alert_conflict_retry", 1);
                    warn!(
                        site_id = %alert.site_id,
                        alert_id = %alert.id,
                        "Concurrent incident write, retrying ({}/{}): {}",
                        attempt,
                        self.settings.max_conflict_retries,
                        e
                    );
                }
                Err(e) => {
                    error!(
                        site_id = %alert.site_id,
                        alert_id = %alert.id,
                        "Failed to process alert: {}",
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn try_process_alert(&self, alert: &SiteAlert) -> StoreResult<Incident> {
        let unit = self.repo.begin_site(&alert.site_id).await?;

        if let Some(linked) = self.linked_incident(unit.as_ref(), alert).await? {
            debug!(alert_id = %alert.id, incident_id = %linked.id, "Alert already linked");
            return Ok(linked);
        }

        let timer = StepTimer::start(&self.metrics, "find_active_incident");
        let active = unit.find_active_by_site_id(&alert.site_id).await?;
        timer.stop();

        let incident = match active {
            None => {
                debug!(site_id = %alert.site_id, "No active incident");
                self.open_incident(unit.as_ref(), alert).await?
            }
            Some(incident) => {
                let state = self.policy.calculate_state(
                    &incident,
                    incident.updated_at,
                    self.settings.inactivity,
                );
                debug!(
                    incident_id = %incident.id,
                    inactive_minutes = state.inactive_minutes,
                    "Found active incident"
                );
                if state.should_resolve {
                    self.close_stale_and_reopen(unit.as_ref(), incident, alert)
                        .await?
                } else {
                    self.extend_incident(unit.as_ref(), &incident, alert).await?
                }
            }
        };

        unit.commit().await?;
        Ok(incident)
    }

    async fn linked_incident(
        &self,
        unit: &dyn SiteUnit,
        alert: &SiteAlert,
    ) -> StoreResult<Option<Incident>> {
        let stored = unit
            .get_alert(&alert.id)
            .await?
            .ok_or_else(|| IncidentError::not_found("site alert", &alert.id))?;
        if stored.site_id != alert.site_id {
            return Err(IncidentError::invalid(format!(
                "alert '{}' belongs to site '{}', not '{}'",
                alert.id, stored.site_id, alert.site_id
            )));
        }
        if !stored.is_linked() {
            return Ok(None);
        }
        match stored.site_incident_id.as_deref() {
            Some(incident_id) => unit.get_incident_by_id(incident_id).await,
            None => Ok(None),
        }
    }

    async fn open_incident(&self, unit: &dyn SiteUnit, alert: &SiteAlert) -> StoreResult<Incident> {
        let timer = StepTimer::start(&self.metrics, "create_incident");
        let incident = unit
            .create_incident(NewIncident::seeded_by(alert, self.clock.now()))
            .await?;
        timer.stop();

        self.link_alert(unit, alert, &incident).await?;
        self.metrics.increment("incident_opened", 1);
        info!(
            site_id = %incident.site_id,
            incident_id = %incident.id,
            alert_id = %alert.id,
            "Opened incident"
        );
        Ok(incident)
    }

    async fn extend_incident(
        &self,
        unit: &dyn SiteUnit,
        incident: &Incident,
        alert: &SiteAlert,
    ) -> StoreResult<Incident> {
        let timer = StepTimer::start(&self.metrics, "associate_alert");
        let extended = unit.associate_alert(&incident.id, &alert.id).await?;
        timer.stop();

        self.link_alert(unit, alert, &extended).await?;
        info!(
            incident_id = %extended.id,
            alert_id = %alert.id,
            "Extended incident"
        );
        Ok(extended)
    }

    /// The incoming alert is recorded as the stale incident's last alert before
    /// it closes, then seeds a fresh incident for the same site. One alert ends
    /// up as both the closing event of the old incident and the start of the new.
    async fn close_stale_and_reopen(
        &self,
        unit: &dyn SiteUnit,
        stale: Incident,
        alert: &SiteAlert,
    ) -> StoreResult<Incident> {
        let timer = StepTimer::start(&self.metrics, "associate_alert");
        let stale = unit.associate_alert(&stale.id, &alert.id).await?;
        timer.stop();

        let result = self
            .policy
            .batch_resolve(unit, std::slice::from_ref(&stale))
            .await?;
        if let Some(failed) = result.errors.into_iter().next() {
            return Err(failed.error);
        }
        info!(
            site_id = %stale.site_id,
            incident_id = %stale.id,
            alert_id = %alert.id,
            "Closed stale incident on new alert"
        );

        self.open_incident(unit, alert).await
    }

    async fn link_alert(
        &self,
        unit: &dyn SiteUnit,
        alert: &SiteAlert,
        incident: &Incident,
    ) -> StoreResult<()> {
        let timer = StepTimer::start(&self.metrics, "mark_alert_processed");
        unit.mark_alert_processed(&alert.id, &incident.id).await?;
        timer.stop();
        Ok(())
    }

    /// Scheduled sweep. Returns how many incidents were actually closed.
    ///
    /// Candidates are grouped by site and each group is closed inside that
    /// site's unit, so the sweep never interleaves with an alert being
    /// processed for the same site. Each candidate is re-read in the unit and
    /// skipped if it no longer qualifies.
    pub async fn resolve_inactive_incidents(&self) -> StoreResult<usize> {
        let sweep = StepTimer::start(&self.metrics, "resolve_inactive_incidents");

        let timer = StepTimer::start(&self.metrics, "find_inactive_incidents");
        let candidates = match self
            .repo
            .find_inactive_incidents(self.settings.inactivity, self.settings.sweep_basis)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Failed to fetch inactive incidents: {}", e);
                return Err(e);
            }
        };
        timer.stop();

        if candidates.is_empty() {
            debug!("No inactive incidents");
            return Ok(0);
        }

        let found = candidates.len();
        let mut by_site: BTreeMap<String, Vec<Incident>> = BTreeMap::new();
        for incident in candidates {
            match self.policy.validate(&incident) {
                Ok(()) => by_site
                    .entry(incident.site_id.clone())
                    .or_default()
                    .push(incident),
                Err(e) => warn!(incident_id = %incident.id, "Skipping malformed incident: {}", e),
            }
        }

        if by_site.is_empty() {
            warn!("None of {} inactive incidents passed validation", found);
            return Ok(0);
        }

        let mut resolved = 0;
        let mut failed = 0;
        for (site_id, incidents) in &by_site {
            match self.sweep_site(site_id, incidents).await {
                Ok(result) => {
                    resolved += result.resolved_count;
                    failed += result.errors.len();
                }
                Err(e) if e.is_retryable() => {
                    warn!(site_id = %site_id, "Site changed during sweep, deferring: {}", e);
                }
                Err(e) => {
                    error!(site_id = %site_id, "Inactive incident sweep aborted: {}", e);
                    return Err(e);
                }
            }
        }

        self.metrics.record_value("sweep_resolved_count", resolved as f64);
        self.metrics.record_value("sweep_error_count", failed as f64);
        sweep.stop();
        info!(
            candidates = found,
            sites = by_site.len(),
            resolved,
            failed,
            "Inactive incident sweep finished"
        );
        Ok(resolved)
    }

    async fn sweep_site(
        &self,
        site_id: &str,
        candidates: &[Incident],
    ) -> StoreResult<BatchResolveResult> {
        let unit = self.repo.begin_site(site_id).await?;

        let mut current = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match unit.get_incident_by_id(&candidate.id).await? {
                Some(incident)
                    if self
                        .policy
                        .is_in_resolution_window(&incident, self.settings.inactivity) =>
                {
                    current.push(incident)
                }
                _ => debug!(incident_id = %candidate.id, "Incident no longer inactive, skipping"),
            }
        }
        if current.is_empty() {
            return Ok(BatchResolveResult::default());
        }

        let result = self.policy.batch_resolve(unit.as_ref(), &current).await?;
        unit.commit().await?;
        Ok(result)
    }

    /// Links an alert to an open incident outside the streaming path.
    pub async fn associate_alert_with_incident(
        &self,
        incident_id: &str,
        alert_id: &str,
    ) -> StoreResult<Incident> {
        require_id("incident id", incident_id)?;
        require_id("alert id", alert_id)?;
        let incident = self.get_incident_by_id(incident_id).await?;

        let unit = self.repo.begin_site(&incident.site_id).await?;
        let current = unit
            .get_incident_by_id(incident_id)
            .await?
            .ok_or_else(|| IncidentError::not_found("incident", incident_id))?;
        if !current.is_active {
            return Err(IncidentError::invalid(format!(
                "incident '{}' is closed",
                incident_id
            )));
        }
        let alert = unit
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| IncidentError::not_found("site alert", alert_id))?;
        if alert.site_id != current.site_id {
            return Err(IncidentError::invalid(format!(
                "alert '{}' belongs to site '{}', not '{}'",
                alert_id, alert.site_id, current.site_id
            )));
        }

        let extended = self.extend_incident(unit.as_ref(), &current, &alert).await?;
        unit.commit().await?;
        Ok(extended)
    }

    pub async fn get_incident_by_id(&self, id: &str) -> StoreResult<Incident> {
        self.repo
            .get_incident_by_id(id)
            .await?
            .ok_or_else(|| IncidentError::not_found("incident", id))
    }

    /// Read model for front-ends. Unknown ids are `NotFound`.
    pub async fn get_incident_detail(&self, id: &str) -> StoreResult<IncidentDetail> {
        self.repo
            .get_incident_detail(id)
            .await?
            .ok_or_else(|| IncidentError::not_found("incident", id))
    }

    pub async fn get_active_incident_for_site(&self, site_id: &str) -> StoreResult<Option<Incident>> {
        self.repo.find_active_by_site_id(site_id).await
    }

    pub async fn count_active_by_site(&self, site_id: &str) -> StoreResult<i64> {
        self.repo.count_active_by_site(site_id).await
    }

    pub async fn get_incidents_by_date_range(
        &self,
        site_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Incident>> {
        self.repo
            .find_incidents_by_date_range(site_id, start, end)
            .await
    }

    pub async fn update_review_status(
        &self,
        id: &str,
        status: ReviewStatus,
    ) -> StoreResult<Incident> {
        let incident = self.get_incident_by_id(id).await?;
        if incident.review_status == status {
            return Ok(incident);
        }
        if !incident.review_status.can_transition_to(status) {
            return Err(IncidentError::InvalidTransition {
                from: incident.review_status.to_string(),
                to: status.to_string(),
            });
        }

        let updated = self
            .repo
            .update_incident(id, &IncidentPatch::review_status(status))
            .await?;
        info!(
            incident_id = %id,
            "Review status {} -> {}",
            incident.review_status,
            status
        );
        Ok(updated)
    }
}
