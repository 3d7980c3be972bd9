//! Postgres adapter for the incident store.
//!
//! Units of work are transactions holding a per-site advisory lock, so
//! "find active incident, decide, write" is serialized per site. The partial
//! unique index on `(site_id) WHERE is_active` backs this up; a violation
//! surfaces as `IncidentError::Conflict`, as does attaching an alert to an
//! incident that closed in the meantime.

use crate::clock::Clock;
use crate::db::queries;
use crate::db::store::{
    require_positive, require_range, ActivityBasis, BatchItemError, BatchMetrics,
    BatchResolveResult, IncidentRepository, IncidentStore, ResolutionUpdate, SiteUnit,
    INCIDENT_NOT_ACTIVE,
};
use crate::db::DbPool;
use crate::error::{IncidentError, StoreResult};
use crate::models::incident::require_id;
use crate::models::{Incident, IncidentDetail, IncidentPatch, NewIncident, Site, SiteAlert};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Connection, PgConnection, Postgres, Transaction};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgIncidentRepository {
    pool: DbPool,
    clock: Arc<dyn Clock>,
}

impl PgIncidentRepository {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

async fn find_active(conn: &mut PgConnection, site_id: &str) -> StoreResult<Option<Incident>> {
    require_id("site_id", site_id)?;
    let incident = sqlx::query_as::<_, Incident>(queries::SELECT_ACTIVE_INCIDENT)
        .bind(site_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(incident)
}

async fn create(
    conn: &mut PgConnection,
    new: NewIncident,
    now: DateTime<Utc>,
) -> StoreResult<Incident> {
    new.validate()?;
    let id = Uuid::new_v4().to_string();
    let incident = sqlx::query_as::<_, Incident>(queries::INSERT_INCIDENT)
        .bind(&id)
        .bind(&new.site_id)
        .bind(&new.start_alert_id)
        .bind(&new.latest_alert_id)
        .bind(new.started_at)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
    debug!(incident_id = %incident.id, site_id = %incident.site_id, "inserted incident");
    Ok(incident)
}

async fn update(
    conn: &mut PgConnection,
    id: &str,
    patch: &IncidentPatch,
    now: DateTime<Utc>,
) -> StoreResult<Incident> {
    require_id("incident id", id)?;
    patch.validate()?;
    sqlx::query_as::<_, Incident>(queries::UPDATE_INCIDENT)
        .bind(id)
        .bind(patch.latest_alert_id.as_deref())
        .bind(patch.end_alert_id.as_deref())
        .bind(patch.ended_at)
        .bind(patch.is_active)
        .bind(patch.is_processed)
        .bind(patch.review_status)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| IncidentError::not_found("incident", id))
}

async fn associate(
    conn: &mut PgConnection,
    incident_id: &str,
    alert_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<Incident> {
    require_id("incident id", incident_id)?;
    require_id("alert id", alert_id)?;
    let updated = sqlx::query_as::<_, Incident>(queries::ASSOCIATE_ALERT)
        .bind(incident_id)
        .bind(alert_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(incident) = updated {
        return Ok(incident);
    }

    let exists = sqlx::query_scalar::<_, bool>(queries::INCIDENT_EXISTS)
        .bind(incident_id)
        .fetch_one(&mut *conn)
        .await?;
    if exists {
        Err(IncidentError::conflict(INCIDENT_NOT_ACTIVE))
    } else {
        Err(IncidentError::not_found("incident", incident_id))
    }
}

async fn find_inactive(
    conn: &mut PgConnection,
    inactivity: Duration,
    basis: ActivityBasis,
    now: DateTime<Utc>,
) -> StoreResult<Vec<Incident>> {
    require_positive(inactivity)?;
    let query = match basis {
        ActivityBasis::StartedAt => queries::SELECT_INACTIVE_BY_STARTED_AT,
        ActivityBasis::UpdatedAt => queries::SELECT_INACTIVE_BY_UPDATED_AT,
    };
    let incidents = sqlx::query_as::<_, Incident>(query)
        .bind(now - inactivity)
        .fetch_all(&mut *conn)
        .await?;
    Ok(incidents)
}

/// Closes one incident inside a savepoint so a failure does not poison the
/// surrounding transaction. `Ok(false)` means it was already closed.
async fn resolve_one(
    conn: &mut PgConnection,
    id: &str,
    update: &ResolutionUpdate,
) -> StoreResult<bool> {
    require_id("incident id", id)?;
    let mut savepoint = conn.begin().await?;

    let rows = sqlx::query(queries::RESOLVE_INCIDENT)
        .bind(id)
        .bind(update.is_active)
        .bind(update.is_processed)
        .bind(update.ended_at)
        .execute(&mut *savepoint)
        .await?
        .rows_affected();

    if rows == 0 {
        let exists = sqlx::query_scalar::<_, bool>(queries::INCIDENT_EXISTS)
            .bind(id)
            .fetch_one(&mut *savepoint)
            .await?;
        savepoint.commit().await?;
        if !exists {
            return Err(IncidentError::not_found("incident", id));
        }
        return Ok(false);
    }

    savepoint.commit().await?;
    Ok(true)
}

async fn resolve_batch(
    conn: &mut PgConnection,
    incidents: &[Incident],
    update: &ResolutionUpdate,
) -> BatchResolveResult {
    let started = Instant::now();
    let mut result = BatchResolveResult {
        metrics: BatchMetrics {
            batch_size: incidents.len(),
            duration_ms: 0,
        },
        ..Default::default()
    };

    for incident in incidents {
        match resolve_one(conn, &incident.id, update).await {
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
    result
}

async fn get_by_id(conn: &mut PgConnection, id: &str) -> StoreResult<Option<Incident>> {
    require_id("incident id", id)?;
    let incident = sqlx::query_as::<_, Incident>(queries::SELECT_INCIDENT_BY_ID)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(incident)
}

async fn count_active(conn: &mut PgConnection, site_id: &str) -> StoreResult<i64> {
    require_id("site_id", site_id)?;
    let count = sqlx::query_scalar::<_, i64>(queries::COUNT_ACTIVE_BY_SITE)
        .bind(site_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

async fn by_date_range(
    conn: &mut PgConnection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> StoreResult<Vec<Incident>> {
    require_id("site_id", site_id)?;
    require_range(start, end)?;
    let incidents = sqlx::query_as::<_, Incident>(queries::SELECT_INCIDENTS_BY_DATE_RANGE)
        .bind(site_id)
        .bind(start)
        .bind(end)
        .fetch_all(&mut *conn)
        .await?;
    Ok(incidents)
}

async fn get_alert(conn: &mut PgConnection, alert_id: &str) -> StoreResult<Option<SiteAlert>> {
    require_id("alert id", alert_id)?;
    let alert = sqlx::query_as::<_, SiteAlert>(queries::SELECT_ALERT_BY_ID)
        .bind(alert_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(alert)
}

async fn mark_processed(
    conn: &mut PgConnection,
    alert_id: &str,
    incident_id: &str,
) -> StoreResult<()> {
    require_id("alert id", alert_id)?;
    require_id("incident id", incident_id)?;
    let rows = sqlx::query(queries::MARK_ALERT_PROCESSED)
        .bind(alert_id)
        .bind(incident_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if rows == 0 {
        return Err(IncidentError::not_found("site alert", alert_id));
    }
    Ok(())
}

async fn detail(conn: &mut PgConnection, id: &str) -> StoreResult<Option<IncidentDetail>> {
    let Some(incident) = get_by_id(conn, id).await? else {
        return Ok(None);
    };

    let site = sqlx::query_as::<_, Site>(queries::SELECT_SITE_BY_ID)
        .bind(&incident.site_id)
        .fetch_optional(&mut *conn)
        .await?;
    let start_alert = get_alert(conn, &incident.start_alert_id).await?;
    let latest_alert = if incident.latest_alert_id == incident.start_alert_id {
        start_alert.clone()
    } else {
        get_alert(conn, &incident.latest_alert_id).await?
    };
    let alerts = sqlx::query_as::<_, SiteAlert>(queries::SELECT_ALERTS_BY_INCIDENT)
        .bind(&incident.id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(Some(IncidentDetail {
        incident,
        site,
        start_alert,
        latest_alert,
        alerts,
    }))
}

#[async_trait]
impl IncidentStore for PgIncidentRepository {
    async fn find_active_by_site_id(&self, site_id: &str) -> StoreResult<Option<Incident>> {
        let mut conn = self.pool.acquire().await?;
        find_active(&mut conn, site_id).await
    }

    async fn create_incident(&self, new: NewIncident) -> StoreResult<Incident> {
        let mut conn = self.pool.acquire().await?;
        create(&mut conn, new, self.clock.now()).await
    }

    async fn update_incident(&self, id: &str, patch: &IncidentPatch) -> StoreResult<Incident> {
        let mut conn = self.pool.acquire().await?;
        update(&mut conn, id, patch, self.clock.now()).await
    }

    async fn associate_alert(&self, incident_id: &str, alert_id: &str) -> StoreResult<Incident> {
        let mut conn = self.pool.acquire().await?;
        associate(&mut conn, incident_id, alert_id, self.clock.now()).await
    }

    async fn find_inactive_incidents(
        &self,
        inactivity: Duration,
        basis: ActivityBasis,
    ) -> StoreResult<Vec<Incident>> {
        let mut conn = self.pool.acquire().await?;
        find_inactive(&mut conn, inactivity, basis, self.clock.now()).await
    }

    async fn resolve_incidents_batch(
        &self,
        incidents: &[Incident],
        update: &ResolutionUpdate,
    ) -> StoreResult<BatchResolveResult> {
        let mut conn = self.pool.acquire().await?;
        Ok(resolve_batch(&mut conn, incidents, update).await)
    }

    async fn get_incident_by_id(&self, id: &str) -> StoreResult<Option<Incident>> {
        let mut conn = self.pool.acquire().await?;
        get_by_id(&mut conn, id).await
    }

    async fn count_active_by_site(&self, site_id: &str) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        count_active(&mut conn, site_id).await
    }

    async fn find_incidents_by_date_range(
        &self,
        site_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Incident>> {
        let mut conn = self.pool.acquire().await?;
        by_date_range(&mut conn, site_id, start, end).await
    }

    async fn get_alert(&self, alert_id: &str) -> StoreResult<Option<SiteAlert>> {
        let mut conn = self.pool.acquire().await?;
        get_alert(&mut conn, alert_id).await
    }

    async fn mark_alert_processed(&self, alert_id: &str, incident_id: &str) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        mark_processed(&mut conn, alert_id, incident_id).await
    }

    async fn get_incident_detail(&self, id: &str) -> StoreResult<Option<IncidentDetail>> {
        let mut conn = self.pool.acquire().await?;
        detail(&mut conn, id).await
    }
}

#[async_trait]
impl IncidentRepository for PgIncidentRepository {
    async fn begin_site(&self, site_id: &str) -> StoreResult<Box<dyn SiteUnit>> {
        require_id("site_id", site_id)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(queries::LOCK_SITE)
            .bind(site_id)
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgSiteUnit {
            tx: Mutex::new(Some(tx)),
            clock: Arc::clone(&self.clock),
        }))
    }
}

/// A transaction holding one site's advisory lock until commit or drop.
pub struct PgSiteUnit {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
    clock: Arc<dyn Clock>,
}

fn open<'a>(
    tx: &'a mut Option<Transaction<'static, Postgres>>,
) -> StoreResult<&'a mut PgConnection> {
    tx.as_deref_mut()
        .ok_or_else(|| IncidentError::storage("site unit already finished"))
}

#[async_trait]
impl IncidentStore for PgSiteUnit {
    async fn find_active_by_site_id(&self, site_id: &str) -> StoreResult<Option<Incident>> {
        let mut tx = self.tx.lock().await;
        find_active(open(&mut tx)?, site_id).await
    }

    async fn create_incident(&self, new: NewIncident) -> StoreResult<Incident> {
        let mut tx = self.tx.lock().await;
        create(open(&mut tx)?, new, self.clock.now()).await
    }

    async fn update_incident(&self, id: &str, patch: &IncidentPatch) -> StoreResult<Incident> {
        let mut tx = self.tx.lock().await;
        update(open(&mut tx)?, id, patch, self.clock.now()).await
    }

    async fn associate_alert(&self, incident_id: &str, alert_id: &str) -> StoreResult<Incident> {
        let mut tx = self.tx.lock().await;
        associate(open(&mut tx)?, incident_id, alert_id, self.clock.now()).await
    }

    async fn find_inactive_incidents(
        &self,
        inactivity: Duration,
        basis: ActivityBasis,
    ) -> StoreResult<Vec<Incident>> {
        let mut tx = self.tx.lock().await;
        find_inactive(open(&mut tx)?, inactivity, basis, self.clock.now()).await
    }

    async fn resolve_incidents_batch(
        &self,
        incidents: &[Incident],
        update: &ResolutionUpdate,
    ) -> StoreResult<BatchResolveResult> {
        let mut tx = self.tx.lock().await;
        Ok(resolve_batch(open(&mut tx)?, incidents, update).await)
    }

    async fn get_incident_by_id(&self, id: &str) -> StoreResult<Option<Incident>> {
        let mut tx = self.tx.lock().await;
        get_by_id(open(&mut tx)?, id).await
    }

    async fn count_active_by_site(&self, site_id: &str) -> StoreResult<i64> {
        let mut tx = self.tx.lock().await;
        count_active(open(&mut tx)?, site_id).await
    }

    async fn find_incidents_by_date_range(
        &self,
        site_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Incident>> {
        let mut tx = self.tx.lock().await;
        by_date_range(open(&mut tx)?, site_id, start, end).await
    }

    async fn get_alert(&self, alert_id: &str) -> StoreResult<Option<SiteAlert>> {
        let mut tx = self.tx.lock().await;
        get_alert(open(&mut tx)?, alert_id).await
    }

    async fn mark_alert_processed(&self, alert_id: &str, incident_id: &str) -> StoreResult<()> {
        let mut tx = self.tx.lock().await;
        mark_processed(open(&mut tx)?, alert_id, incident_id).await
    }

    async fn get_incident_detail(&self, id: &str) -> StoreResult<Option<IncidentDetail>> {
        let mut tx = self.tx.lock().await;
        detail(open(&mut tx)?, id).await
    }
}

#[async_trait]
impl SiteUnit for PgSiteUnit {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        match self.tx.into_inner() {
            Some(tx) => {
                tx.commit().await?;
                Ok(())
            }
            None => Err(IncidentError::storage("site unit already finished")),
        }
    }
}
