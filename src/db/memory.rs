//! In-process incident store.
//!
//! Mirrors the Postgres adapter's semantics closely enough to exercise the
//! orchestrator without a database. A site unit serializes on a per-site lock
//! and works on a private copy of the tables. `commit` publishes the rows the
//! unit changed and is rejected as a `Conflict` if any of them moved since the
//! unit read them. Dropping a unit discards its copy.

use crate::clock::Clock;
use crate::db::store::{
    require_positive, require_range, ActivityBasis, BatchItemError, BatchMetrics,
    BatchResolveResult, IncidentRepository, IncidentStore, ResolutionUpdate, SiteUnit,
    INCIDENT_NOT_ACTIVE, ONE_ACTIVE_PER_SITE,
};
use crate::error::{IncidentError, StoreResult};
use crate::models::incident::require_id;
use crate::models::{Incident, IncidentDetail, IncidentPatch, NewIncident, ReviewStatus, Site, SiteAlert};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

const ROW_VERSION: &str = "site_incidents_row_version";

#[derive(Debug, Default, Clone)]
struct MemoryState {
    incidents: HashMap<String, Incident>,
    alerts: HashMap<String, SiteAlert>,
    sites: HashMap<String, Site>,
}

impl MemoryState {
    fn find_active(&self, site_id: &str) -> Option<Incident> {
        self.incidents
            .values()
            .filter(|i| i.site_id == site_id && i.is_active)
            .max_by_key(|i| i.started_at)
            .cloned()
    }

    fn create(&mut self, new: NewIncident, now: DateTime<Utc>) -> StoreResult<Incident> {
        if self
            .incidents
            .values()
            .any(|i| i.site_id == new.site_id && i.is_active)
        {
            return Err(IncidentError::conflict(ONE_ACTIVE_PER_SITE));
        }

        let incident = Incident {
            id: Uuid::new_v4().to_string(),
            site_id: new.site_id,
            start_alert_id: new.start_alert_id,
            latest_alert_id: new.latest_alert_id,
            end_alert_id: None,
            started_at: new.started_at,
            ended_at: None,
            is_active: true,
            is_processed: false,
            review_status: ReviewStatus::ToReview,
            created_at: now,
            updated_at: now,
        };
        self.incidents.insert(incident.id.clone(), incident.clone());
        Ok(incident)
    }

    fn modify(
        &mut self,
        id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Incident) -> StoreResult<()>,
    ) -> StoreResult<Incident> {
        let incident = self
            .incidents
            .get_mut(id)
            .ok_or_else(|| IncidentError::not_found("incident", id))?;
        let mut next = incident.clone();
        f(&mut next)?;
        next.updated_at = now;
        *incident = next.clone();
        Ok(next)
    }

    fn find_inactive(&self, cutoff: DateTime<Utc>, basis: ActivityBasis) -> Vec<Incident> {
        let mut found: Vec<Incident> = self
            .incidents
            .values()
            .filter(|i| i.is_active && !i.is_processed && basis.timestamp_of(i) < cutoff)
            .cloned()
            .collect();
        found.sort_by_key(|i| basis.timestamp_of(i));
        found
    }

    fn resolve_one(&mut self, id: &str, update: &ResolutionUpdate) -> StoreResult<bool> {
        let incident = self
            .incidents
            .get_mut(id)
            .ok_or_else(|| IncidentError::not_found("incident", id))?;
        if !incident.is_active {
            return Ok(false);
        }
        incident.is_active = update.is_active;
        incident.is_processed = update.is_processed;
        incident.ended_at = Some(update.ended_at);
        incident.end_alert_id = Some(incident.latest_alert_id.clone());
        incident.updated_at = update.ended_at;
        Ok(true)
    }

    fn count_active(&self, site_id: &str) -> i64 {
        self.incidents
            .values()
            .filter(|i| i.site_id == site_id && i.is_active)
            .count() as i64
    }

    fn by_date_range(&self, site_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Incident> {
        let mut found: Vec<Incident> = self
            .incidents
            .values()
            .filter(|i| i.site_id == site_id && i.started_at >= start && i.started_at <= end)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        found
    }

    fn mark_processed(&mut self, alert_id: &str, incident_id: &str) -> StoreResult<()> {
        let alert = self
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| IncidentError::not_found("site alert", alert_id))?;
        alert.site_incident_id = Some(incident_id.to_string());
        alert.is_processed = true;
        Ok(())
    }

    fn detail(&self, id: &str) -> Option<IncidentDetail> {
        let incident = self.incidents.get(id).cloned()?;
        let mut alerts: Vec<SiteAlert> = self
            .alerts
            .values()
            .filter(|a| a.site_incident_id.as_deref() == Some(id))
            .cloned()
            .collect();
        alerts.sort_by_key(|a| a.event_date);

        Some(IncidentDetail {
            site: self.sites.get(&incident.site_id).cloned(),
            start_alert: self.alerts.get(&incident.start_alert_id).cloned(),
            latest_alert: self.alerts.get(&incident.latest_alert_id).cloned(),
            incident,
            alerts,
        })
    }
}

struct Shared {
    state: Mutex<MemoryState>,
    failing: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    injected_conflicts: AtomicU32,
    site_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    clock: Arc<dyn Clock>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Validation and failure injection shared by the repository and its units.
/// Each method runs against whichever copy of the tables the caller holds.
impl Shared {
    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IncidentError::storage("store unavailable"));
        }
        Ok(())
    }

    fn check_writable(&self, incident_id: &str) -> StoreResult<()> {
        if guard(&self.failing).contains(incident_id) {
            return Err(IncidentError::storage(format!(
                "write to incident '{}' failed",
                incident_id
            )));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> StoreResult<()> {
        let taken = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            return Err(IncidentError::conflict(ONE_ACTIVE_PER_SITE));
        }
        Ok(())
    }

    fn find_active(&self, state: &MemoryState, site_id: &str) -> StoreResult<Option<Incident>> {
        require_id("site_id", site_id)?;
        self.check_available()?;
        Ok(state.find_active(site_id))
    }

    fn create(&self, state: &mut MemoryState, new: NewIncident) -> StoreResult<Incident> {
        new.validate()?;
        self.take_injected_conflict()?;
        state.create(new, self.clock.now())
    }

    fn update(&self, state: &mut MemoryState, id: &str, patch: &IncidentPatch) -> StoreResult<Incident> {
        require_id("incident id", id)?;
        patch.validate()?;
        self.check_writable(id)?;
        state.modify(id, self.clock.now(), |incident| {
            patch.apply_to(incident);
            Ok(())
        })
    }

    fn associate(
        &self,
        state: &mut MemoryState,
        incident_id: &str,
        alert_id: &str,
    ) -> StoreResult<Incident> {
        require_id("incident id", incident_id)?;
        require_id("alert id", alert_id)?;
        self.check_writable(incident_id)?;
        state.modify(incident_id, self.clock.now(), |incident| {
            if !incident.is_active {
                return Err(IncidentError::conflict(INCIDENT_NOT_ACTIVE));
            }
            incident.latest_alert_id = alert_id.to_string();
            Ok(())
        })
    }

    fn find_inactive(
        &self,
        state: &MemoryState,
        inactivity: Duration,
        basis: ActivityBasis,
    ) -> StoreResult<Vec<Incident>> {
        require_positive(inactivity)?;
        self.check_available()?;
        Ok(state.find_inactive(self.clock.now() - inactivity, basis))
    }

    fn resolve_batch(
        &self,
        state: &mut MemoryState,
        incidents: &[Incident],
        update: &ResolutionUpdate,
    ) -> StoreResult<BatchResolveResult> {
        self.check_available()?;
        let started = Instant::now();
        let mut result = BatchResolveResult {
            metrics: BatchMetrics {
                batch_size: incidents.len(),
                duration_ms: 0,
            },
            ..Default::default()
        };

        for incident in incidents {
            let closed = require_id("incident id", &incident.id)
                .and_then(|_| self.check_writable(&incident.id))
                .and_then(|_| state.resolve_one(&incident.id, update));
            match closed {
                Ok(true) => result.resolved_count += 1,
                Ok(false) => {
                    debug!(incident_id = %incident.id, "incident already closed, skipping");
                    result.skipped_count += 1;
                }
                Err(error) => {
                    warn!(incident_id = %incident.id, "failed to close incident: {}", error);
                    result.errors.push(BatchItemError {
                        incident_id: incident.id.clone(),
                        error,
                    });
                }
            }
        }

        result.metrics.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    fn get_by_id(&self, state: &MemoryState, id: &str) -> StoreResult<Option<Incident>> {
        require_id("incident id", id)?;
        Ok(state.incidents.get(id).cloned())
    }

    fn count_active(&self, state: &MemoryState, site_id: &str) -> StoreResult<i64> {
        require_id("site_id", site_id)?;
        Ok(state.count_active(site_id))
    }

    fn by_date_range(
        &self,
        state: &MemoryState,
        site_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Incident>> {
        require_id("site_id", site_id)?;
        require_range(start, end)?;
        Ok(state.by_date_range(site_id, start, end))
    }

    fn get_alert(&self, state: &MemoryState, alert_id: &str) -> StoreResult<Option<SiteAlert>> {
        require_id("alert id", alert_id)?;
        Ok(state.alerts.get(alert_id).cloned())
    }

    fn mark_processed(
        &self,
        state: &mut MemoryState,
        alert_id: &str,
        incident_id: &str,
    ) -> StoreResult<()> {
        require_id("alert id", alert_id)?;
        require_id("incident id", incident_id)?;
        state.mark_processed(alert_id, incident_id)
    }

    fn detail(&self, state: &MemoryState, id: &str) -> StoreResult<Option<IncidentDetail>> {
        require_id("incident id", id)?;
        Ok(state.detail(id))
    }

    /// Applies a unit's changed rows, provided none of them moved since the
    /// unit first read them and the one-active-per-site rule still holds.
    fn publish(&self, staged: Staged) -> StoreResult<usize> {
        let Staged {
            view,
            base_incidents,
            base_alerts,
        } = staged;

        let incidents: Vec<(Option<Incident>, Incident)> = base_incidents
            .into_iter()
            .filter_map(|(id, base)| {
                let current = view.incidents.get(&id)?;
                (base.as_ref() != Some(current)).then(|| (base, current.clone()))
            })
            .collect();
        let alerts: Vec<(Option<SiteAlert>, SiteAlert)> = base_alerts
            .into_iter()
            .filter_map(|(id, base)| {
                let current = view.alerts.get(&id)?;
                (base.as_ref() != Some(current)).then(|| (base, current.clone()))
            })
            .collect();

        let mut state = guard(&self.state);
        let moved = incidents
            .iter()
            .any(|(base, staged)| state.incidents.get(&staged.id) != base.as_ref())
            || alerts
                .iter()
                .any(|(base, staged)| state.alerts.get(&staged.id) != base.as_ref());
        if moved {
            return Err(IncidentError::conflict(ROW_VERSION));
        }

        let closing: HashSet<&str> = incidents
            .iter()
            .filter(|(_, staged)| !staged.is_active)
            .map(|(_, staged)| staged.id.as_str())
            .collect();
        for (_, staged) in incidents.iter().filter(|(_, staged)| staged.is_active) {
            let clash = state.incidents.values().any(|other| {
                other.id != staged.id
                    && other.site_id == staged.site_id
                    && other.is_active
                    && !closing.contains(other.id.as_str())
            });
            if clash {
                return Err(IncidentError::conflict(ONE_ACTIVE_PER_SITE));
            }
        }

        let written = incidents.len() + alerts.len();
        for (_, incident) in incidents {
            state.incidents.insert(incident.id.clone(), incident);
        }
        for (_, alert) in alerts {
            state.alerts.insert(alert.id.clone(), alert);
        }
        Ok(written)
    }
}

#[derive(Clone)]
pub struct InMemoryIncidentRepository {
    shared: Arc<Shared>,
}

impl InMemoryIncidentRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryState::default()),
                failing: Mutex::new(HashSet::new()),
                unavailable: AtomicBool::new(false),
                injected_conflicts: AtomicU32::new(0),
                site_locks: Mutex::new(HashMap::new()),
                clock,
            }),
        }
    }

    pub fn insert_site(&self, site: Site) {
        guard(&self.shared.state).sites.insert(site.id.clone(), site);
    }

    /// Stores an alert the way the ingestion job would before publishing it.
    pub fn insert_alert(&self, alert: SiteAlert) {
        guard(&self.shared.state).alerts.insert(alert.id.clone(), alert);
    }

    /// Stores an incident row as-is, bypassing validation.
    pub fn insert_incident(&self, incident: Incident) {
        guard(&self.shared.state)
            .incidents
            .insert(incident.id.clone(), incident);
    }

    /// Every later write touching this incident fails with `Storage`.
    pub fn fail_writes_for(&self, incident_id: &str) {
        guard(&self.shared.failing).insert(incident_id.to_string());
    }

    pub fn clear_failures(&self) {
        guard(&self.shared.failing).clear();
    }

    /// The next `times` incident creations lose the one-active-per-site race.
    pub fn conflict_on_next_creates(&self, times: u32) {
        self.shared.injected_conflicts.store(times, Ordering::SeqCst);
    }

    /// Simulates an outage: lookups and batch closes fail outright.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn incidents_for_site(&self, site_id: &str) -> Vec<Incident> {
        let mut found: Vec<Incident> = guard(&self.shared.state)
            .incidents
            .values()
            .filter(|i| i.site_id == site_id)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.started_at);
        found
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        guard(&self.shared.state)
    }

    fn site_lock(&self, site_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = guard(&self.shared.site_locks);
        Arc::clone(locks.entry(site_id.to_string()).or_default())
    }
}

#[async_trait]
impl IncidentStore for InMemoryIncidentRepository {
    async fn find_active_by_site_id(&self, site_id: &str) -> StoreResult<Option<Incident>> {
        self.shared.find_active(&self.state(), site_id)
    }

    async fn create_incident(&self, new: NewIncident) -> StoreResult<Incident> {
        self.shared.create(&mut self.state(), new)
    }

    async fn update_incident(&self, id: &str, patch: &IncidentPatch) -> StoreResult<Incident> {
        self.shared.update(&mut self.state(), id, patch)
    }

    async fn associate_alert(&self, incident_id: &str, alert_id: &str) -> StoreResult<Incident> {
        self.shared
            .associate(&mut self.state(), incident_id, alert_id)
    }

    async fn find_inactive_incidents(
        &self,
        inactivity: Duration,
        basis: ActivityBasis,
    ) -> StoreResult<Vec<Incident>> {
        self.shared.find_inactive(&self.state(), inactivity, basis)
    }

    async fn resolve_incidents_batch(
        &self,
        incidents: &[Incident],
        update: &ResolutionUpdate,
    ) -> StoreResult<BatchResolveResult> {
        self.shared
            .resolve_batch(&mut self.state(), incidents, update)
    }

    async fn get_incident_by_id(&self, id: &str) -> StoreResult<Option<Incident>> {
        self.shared.get_by_id(&self.state(), id)
    }

    async fn count_active_by_site(&self, site_id: &str) -> StoreResult<i64> {
        self.shared.count_active(&self.state(), site_id)
    }

    async fn find_incidents_by_date_range(
        &self,
        site_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Incident>> {
        self.shared
            .by_date_range(&self.state(), site_id, start, end)
    }

    async fn get_alert(&self, alert_id: &str) -> StoreResult<Option<SiteAlert>> {
        self.shared.get_alert(&self.state(), alert_id)
    }

    async fn mark_alert_processed(&self, alert_id: &str, incident_id: &str) -> StoreResult<()> {
        self.shared
            .mark_processed(&mut self.state(), alert_id, incident_id)
    }

    async fn get_incident_detail(&self, id: &str) -> StoreResult<Option<IncidentDetail>> {
        self.shared.detail(&self.state(), id)
    }
}

#[async_trait]
impl IncidentRepository for InMemoryIncidentRepository {
    async fn begin_site(&self, site_id: &str) -> StoreResult<Box<dyn SiteUnit>> {
        require_id("site_id", site_id)?;
        let lock = self.site_lock(site_id).lock_owned().await;
        let view = self.state().clone();
        Ok(Box::new(MemorySiteUnit {
            shared: Arc::clone(&self.shared),
            staged: Mutex::new(Staged {
                view,
                base_incidents: HashMap::new(),
                base_alerts: HashMap::new(),
            }),
            _site_lock: lock,
        }))
    }
}

/// A unit's private copy of the tables, plus each touched row as it was
/// before the unit's first write to it.
struct Staged {
    view: MemoryState,
    base_incidents: HashMap<String, Option<Incident>>,
    base_alerts: HashMap<String, Option<SiteAlert>>,
}

impl Staged {
    fn remember_incident(&mut self, id: &str) {
        if !self.base_incidents.contains_key(id) {
            let prior = self.view.incidents.get(id).cloned();
            self.base_incidents.insert(id.to_string(), prior);
        }
    }

    fn remember_alert(&mut self, id: &str) {
        if !self.base_alerts.contains_key(id) {
            let prior = self.view.alerts.get(id).cloned();
            self.base_alerts.insert(id.to_string(), prior);
        }
    }
}

pub struct MemorySiteUnit {
    shared: Arc<Shared>,
    staged: Mutex<Staged>,
    _site_lock: OwnedMutexGuard<()>,
}

impl MemorySiteUnit {
    fn staged(&self) -> MutexGuard<'_, Staged> {
        guard(&self.staged)
    }
}

#[async_trait]
impl IncidentStore for MemorySiteUnit {
    async fn find_active_by_site_id(&self, site_id: &str) -> StoreResult<Option<Incident>> {
        self.shared.find_active(&self.staged().view, site_id)
    }

    async fn create_incident(&self, new: NewIncident) -> StoreResult<Incident> {
        let mut staged = self.staged();
        let incident = self.shared.create(&mut staged.view, new)?;
        staged.base_incidents.insert(incident.id.clone(), None);
        Ok(incident)
    }

    async fn update_incident(&self, id: &str, patch: &IncidentPatch) -> StoreResult<Incident> {
        let mut staged = self.staged();
        staged.remember_incident(id);
        self.shared.update(&mut staged.view, id, patch)
    }

    async fn associate_alert(&self, incident_id: &str, alert_id: &str) -> StoreResult<Incident> {
        let mut staged = self.staged();
        staged.remember_incident(incident_id);
        self.shared
            .associate(&mut staged.view, incident_id, alert_id)
    }

    async fn find_inactive_incidents(
        &self,
        inactivity: Duration,
        basis: ActivityBasis,
    ) -> StoreResult<Vec<Incident>> {
        self.shared
            .find_inactive(&self.staged().view, inactivity, basis)
    }

    async fn resolve_incidents_batch(
        &self,
        incidents: &[Incident],
        update: &ResolutionUpdate,
    ) -> StoreResult<BatchResolveResult> {
        let mut staged = self.staged();
        for incident in incidents {
            staged.remember_incident(&incident.id);
        }
        self.shared
            .resolve_batch(&mut staged.view, incidents, update)
    }

    async fn get_incident_by_id(&self, id: &str) -> StoreResult<Option<Incident>> {
        self.shared.get_by_id(&self.staged().view, id)
    }

    async fn count_active_by_site(&self, site_id: &str) -> StoreResult<i64> {
        self.shared.count_active(&self.staged().view, site_id)
    }

    async fn find_incidents_by_date_range(
        &self,
        site_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Incident>> {
        self.shared
            .by_date_range(&self.staged().view, site_id, start, end)
    }

    async fn get_alert(&self, alert_id: &str) -> StoreResult<Option<SiteAlert>> {
        self.shared.get_alert(&self.staged().view, alert_id)
    }

    async fn mark_alert_processed(&self, alert_id: &str, incident_id: &str) -> StoreResult<()> {
        let mut staged = self.staged();
        staged.remember_alert(alert_id);
        self.shared
            .mark_processed(&mut staged.view, alert_id, incident_id)
    }

    async fn get_incident_detail(&self, id: &str) -> StoreResult<Option<IncidentDetail>> {
        self.shared.detail(&self.staged().view, id)
    }
}

#[async_trait]
impl SiteUnit for MemorySiteUnit {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemorySiteUnit {
            shared,
            staged,
            _site_lock,
        } = *self;
        let staged = staged.into_inner().unwrap_or_else(|p| p.into_inner());
        let written = shared.publish(staged)?;
        debug!(rows = written, "published site unit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, InMemoryIncidentRepository) {
        let clock = Arc::new(ManualClock::new(t0()));
        let repo = InMemoryIncidentRepository::new(clock.clone());
        (clock, repo)
    }

    fn alert(id: &str, site_id: &str, at: DateTime<Utc>) -> SiteAlert {
        SiteAlert {
            id: id.to_string(),
            site_id: site_id.to_string(),
            event_date: at,
            latitude: 38.5,
            longitude: -121.4,
            confidence: Some("high".into()),
            detected_by: Some("MODIS".into()),
            site_incident_id: None,
            is_processed: false,
        }
    }

    fn new_incident(site_id: &str, alert_id: &str, started_at: DateTime<Utc>) -> NewIncident {
        NewIncident {
            site_id: site_id.into(),
            start_alert_id: alert_id.into(),
            latest_alert_id: alert_id.into(),
            started_at,
        }
    }

    fn close_at(at: DateTime<Utc>) -> ResolutionUpdate {
        ResolutionUpdate {
            ended_at: at,
            is_active: false,
            is_processed: false,
        }
    }

    #[tokio::test]
    async fn test_create_sets_initial_state() {
        let (_, repo) = setup();
        let incident = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();

        assert!(incident.is_active);
        assert!(!incident.is_processed);
        assert_eq!(incident.review_status, ReviewStatus::ToReview);
        assert_eq!(incident.start_alert_id, "a1");
        assert_eq!(incident.latest_alert_id, "a1");
        assert!(incident.ended_at.is_none());

        let found = repo.find_active_by_site_id("s1").await.unwrap();
        assert_eq!(found, Some(incident));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (_, repo) = setup();
        assert!(matches!(
            repo.find_active_by_site_id("").await,
            Err(IncidentError::InvalidArgument { .. })
        ));
        assert!(matches!(
            repo.create_incident(new_incident("s1", "", t0())).await,
            Err(IncidentError::InvalidArgument { .. })
        ));
        assert!(matches!(
            repo.update_incident("missing", &IncidentPatch::review_status(ReviewStatus::InReview))
                .await,
            Err(IncidentError::NotFound { .. })
        ));
        assert!(matches!(
            repo.update_incident("", &IncidentPatch::review_status(ReviewStatus::InReview))
                .await,
            Err(IncidentError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_active_incident_conflicts() {
        let (_, repo) = setup();
        repo.create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();
        let err = repo
            .create_incident(new_incident("s1", "a2", t0()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(repo.count_active_by_site("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_associate_moves_latest_and_stamps_updated_at() {
        let (clock, repo) = setup();
        let incident = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();

        clock.advance(Duration::hours(1));
        let extended = repo.associate_alert(&incident.id, "a2").await.unwrap();
        assert_eq!(extended.latest_alert_id, "a2");
        assert_eq!(extended.start_alert_id, "a1");
        assert_eq!(extended.updated_at, t0() + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_find_inactive_uses_started_at_cutoff() {
        let (clock, repo) = setup();
        let old = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();
        let fresh = repo
            .create_incident(new_incident("s2", "b1", t0() + Duration::hours(3)))
            .await
            .unwrap();
        let boundary = repo
            .create_incident(new_incident("s3", "c1", t0() + Duration::hours(1)))
            .await
            .unwrap();
        let processed = repo
            .create_incident(new_incident("s4", "d1", t0()))
            .await
            .unwrap();
        repo.update_incident(
            &processed.id,
            &IncidentPatch {
                is_processed: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        clock.set(t0() + Duration::hours(7));
        let found = repo
            .find_inactive_incidents(Duration::hours(6), ActivityBasis::StartedAt)
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();

        assert_eq!(ids, vec![old.id.as_str()]);
        assert!(!ids.contains(&fresh.id.as_str()));
        // started exactly at T - 6h is not older than the cutoff
        assert!(!ids.contains(&boundary.id.as_str()));
    }

    #[tokio::test]
    async fn test_batch_isolates_failures_and_skips_closed() {
        let (clock, repo) = setup();
        let mut incidents = Vec::new();
        for n in 0..5 {
            let site = format!("s{}", n);
            let alert_id = format!("a{}", n);
            incidents.push(
                repo.create_incident(new_incident(&site, &alert_id, t0()))
                    .await
                    .unwrap(),
            );
        }
        repo.fail_writes_for(&incidents[2].id);

        clock.advance(Duration::hours(8));
        let result = repo
            .resolve_incidents_batch(&incidents, &close_at(clock.now()))
            .await
            .unwrap();

        assert_eq!(result.resolved_count, 4);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].incident_id, incidents[2].id);
        assert_eq!(result.metrics.batch_size, 5);

        for (n, incident) in incidents.iter().enumerate() {
            let stored = repo.get_incident_by_id(&incident.id).await.unwrap().unwrap();
            assert_eq!(stored.is_active, n == 2);
            if n != 2 {
                assert_eq!(stored.ended_at, Some(clock.now()));
                assert_eq!(stored.end_alert_id.as_deref(), Some(stored.latest_alert_id.as_str()));
                assert!(!stored.is_processed);
            }
        }

        repo.clear_failures();
        let again = repo
            .resolve_incidents_batch(&incidents, &close_at(clock.now()))
            .await
            .unwrap();
        assert_eq!(again.resolved_count, 1);
        assert_eq!(again.skipped_count, 4);
        assert!(again.errors.is_empty());
    }

    #[tokio::test]
    async fn test_associate_requires_active_incident() {
        let (clock, repo) = setup();
        let incident = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();
        clock.advance(Duration::hours(7));
        repo.resolve_incidents_batch(std::slice::from_ref(&incident), &close_at(clock.now()))
            .await
            .unwrap();

        let err = repo.associate_alert(&incident.id, "a2").await.unwrap_err();
        assert!(err.is_retryable());
        let stored = repo.get_incident_by_id(&incident.id).await.unwrap().unwrap();
        assert_eq!(stored.latest_alert_id, "a1");
        assert_eq!(stored.end_alert_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_unit_writes_hidden_until_commit() {
        let (_, repo) = setup();
        repo.insert_alert(alert("a1", "s1", t0()));
        repo.insert_alert(alert("a2", "s1", t0()));
        let incident = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();

        let unit = repo.begin_site("s1").await.unwrap();
        unit.associate_alert(&incident.id, "a2").await.unwrap();
        unit.mark_alert_processed("a2", &incident.id).await.unwrap();

        let outside = repo.get_incident_by_id(&incident.id).await.unwrap().unwrap();
        assert_eq!(outside.latest_alert_id, "a1");
        assert!(!repo.get_alert("a2").await.unwrap().unwrap().is_processed);
        let inside = unit.get_incident_by_id(&incident.id).await.unwrap().unwrap();
        assert_eq!(inside.latest_alert_id, "a2");

        unit.commit().await.unwrap();
        let published = repo.get_incident_by_id(&incident.id).await.unwrap().unwrap();
        assert_eq!(published.latest_alert_id, "a2");
        assert!(repo.get_alert("a2").await.unwrap().unwrap().is_linked());
    }

    #[tokio::test]
    async fn test_discarded_unit_never_reopens_closed_incident() {
        let (clock, repo) = setup();
        let incident = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();

        let unit = repo.begin_site("s1").await.unwrap();
        unit.associate_alert(&incident.id, "a2").await.unwrap();

        clock.advance(Duration::hours(7));
        let closed = repo
            .resolve_incidents_batch(std::slice::from_ref(&incident), &close_at(clock.now()))
            .await
            .unwrap();
        assert_eq!(closed.resolved_count, 1);
        drop(unit);

        let stored = repo.get_incident_by_id(&incident.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.ended_at, Some(clock.now()));
        assert_eq!(repo.count_active_by_site("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_over_moved_row_conflicts() {
        let (clock, repo) = setup();
        let incident = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();

        let unit = repo.begin_site("s1").await.unwrap();
        unit.associate_alert(&incident.id, "a2").await.unwrap();

        clock.advance(Duration::hours(7));
        repo.resolve_incidents_batch(std::slice::from_ref(&incident), &close_at(clock.now()))
            .await
            .unwrap();

        let err = unit.commit().await.unwrap_err();
        assert!(err.is_retryable());
        let stored = repo.get_incident_by_id(&incident.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.latest_alert_id, "a1");
    }

    #[tokio::test]
    async fn test_injected_create_conflicts_run_out() {
        let (_, repo) = setup();
        repo.conflict_on_next_creates(2);
        for _ in 0..2 {
            let err = repo
                .create_incident(new_incident("s1", "a1", t0()))
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(repo.create_incident(new_incident("s1", "a1", t0())).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_unit_discards_writes() {
        let (_, repo) = setup();
        repo.insert_alert(alert("a1", "s1", t0()));

        {
            let unit = repo.begin_site("s1").await.unwrap();
            let incident = unit
                .create_incident(new_incident("s1", "a1", t0()))
                .await
                .unwrap();
            unit.mark_alert_processed("a1", &incident.id).await.unwrap();
        }

        assert_eq!(repo.count_active_by_site("s1").await.unwrap(), 0);
        let stored = repo.get_alert("a1").await.unwrap().unwrap();
        assert!(!stored.is_processed);
        assert!(stored.site_incident_id.is_none());

        let unit = repo.begin_site("s1").await.unwrap();
        let incident = unit
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();
        unit.mark_alert_processed("a1", &incident.id).await.unwrap();
        unit.commit().await.unwrap();

        assert_eq!(repo.count_active_by_site("s1").await.unwrap(), 1);
        assert!(repo.get_alert("a1").await.unwrap().unwrap().is_linked());
    }

    #[tokio::test]
    async fn test_detail_collects_linked_alerts() {
        let (_, repo) = setup();
        repo.insert_site(Site {
            id: "s1".into(),
            name: "Ridge Tower".into(),
        });
        repo.insert_alert(alert("a2", "s1", t0() + Duration::hours(1)));
        repo.insert_alert(alert("a1", "s1", t0()));

        let incident = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();
        repo.mark_alert_processed("a1", &incident.id).await.unwrap();
        repo.associate_alert(&incident.id, "a2").await.unwrap();
        repo.mark_alert_processed("a2", &incident.id).await.unwrap();

        let detail = repo.get_incident_detail(&incident.id).await.unwrap().unwrap();
        assert_eq!(detail.site.unwrap().name, "Ridge Tower");
        assert_eq!(detail.start_alert.unwrap().id, "a1");
        assert_eq!(detail.latest_alert.unwrap().id, "a2");
        let ids: Vec<&str> = detail.alerts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);

        assert!(repo.get_incident_detail("nope").await.unwrap().is_none());
        assert!(matches!(
            repo.mark_alert_processed("ghost", &incident.id).await,
            Err(IncidentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_date_range_newest_first() {
        let (_, repo) = setup();
        let first = repo
            .create_incident(new_incident("s1", "a1", t0()))
            .await
            .unwrap();
        repo.resolve_incidents_batch(std::slice::from_ref(&first), &close_at(t0() + Duration::hours(7)))
            .await
            .unwrap();
        let second = repo
            .create_incident(new_incident("s1", "a9", t0() + Duration::hours(8)))
            .await
            .unwrap();

        let found = repo
            .find_incidents_by_date_range("s1", t0(), t0() + Duration::days(1))
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);

        assert!(repo
            .find_incidents_by_date_range("s1", t0() + Duration::days(1), t0())
            .await
            .is_err());
    }
}
