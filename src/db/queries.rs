pub const LOCK_SITE: &str = r#"
SELECT pg_advisory_xact_lock(hashtext($1));
"#;

pub const SELECT_ACTIVE_INCIDENT: &str = r#"
SELECT id, site_id, start_alert_id, latest_alert_id, end_alert_id, started_at, ended_at,
       is_active, is_processed, review_status, created_at, updated_at
FROM site_incidents
WHERE site_id = $1 AND is_active
ORDER BY started_at DESC
LIMIT 1;
"#;

pub const SELECT_INCIDENT_BY_ID: &str = r#"
SELECT id, site_id, start_alert_id, latest_alert_id, end_alert_id, started_at, ended_at,
       is_active, is_processed, review_status, created_at, updated_at
FROM site_incidents
WHERE id = $1;
"#;

pub const INSERT_INCIDENT: &str = r#"
INSERT INTO site_incidents (
    id, site_id, start_alert_id, latest_alert_id, started_at,
    is_active, is_processed, review_status, created_at, updated_at
) VALUES ($1, $2, $3, $4, $5, true, false, 'to_review', $6, $6)
RETURNING id, site_id, start_alert_id, latest_alert_id, end_alert_id, started_at, ended_at,
          is_active, is_processed, review_status, created_at, updated_at;
"#;

pub const UPDATE_INCIDENT: &str = r#"
UPDATE site_incidents
SET latest_alert_id = COALESCE($2, latest_alert_id),
    end_alert_id = COALESCE($3, end_alert_id),
    ended_at = COALESCE($4, ended_at),
    is_active = COALESCE($5, is_active),
    is_processed = COALESCE($6, is_processed),
    review_status = COALESCE($7, review_status),
    updated_at = $8
WHERE id = $1
RETURNING id, site_id, start_alert_id, latest_alert_id, end_alert_id, started_at, ended_at,
          is_active, is_processed, review_status, created_at, updated_at;
"#;

// Only an open incident accepts alerts; a closed one matches no row.
pub const ASSOCIATE_ALERT: &str = r#"
UPDATE site_incidents
SET latest_alert_id = $2,
    updated_at = $3
WHERE id = $1 AND is_active
RETURNING id, site_id, start_alert_id, latest_alert_id, end_alert_id, started_at, ended_at,
          is_active, is_processed, review_status, created_at, updated_at;
"#;

pub const SELECT_INACTIVE_BY_STARTED_AT: &str = r#"
SELECT id, site_id, start_alert_id, latest_alert_id, end_alert_id, started_at, ended_at,
       is_active, is_processed, review_status, created_at, updated_at
FROM site_incidents
WHERE is_active AND NOT is_processed AND started_at < $1
ORDER BY started_at;
"#;

pub const SELECT_INACTIVE_BY_UPDATED_AT: &str = r#"
SELECT id, site_id, start_alert_id, latest_alert_id, end_alert_id, started_at, ended_at,
       is_active, is_processed, review_status, created_at, updated_at
FROM site_incidents
WHERE is_active AND NOT is_processed AND updated_at < $1
ORDER BY updated_at;
"#;

// Conditional on is_active so a second close is a no-op.
pub const RESOLVE_INCIDENT: &str = r#"
UPDATE site_incidents
SET is_active = $2,
    is_processed = $3,
    ended_at = $4,
    end_alert_id = latest_alert_id,
    updated_at = $4
WHERE id = $1 AND is_active;
"#;

pub const INCIDENT_EXISTS: &str = r#"
SELECT EXISTS (SELECT 1 FROM site_incidents WHERE id = $1);
"#;

pub const COUNT_ACTIVE_BY_SITE: &str = r#"
SELECT COUNT(*) FROM site_incidents WHERE site_id = $1 AND is_active;
"#;

pub const SELECT_INCIDENTS_BY_DATE_RANGE: &str = r#"
SELECT id, site_id, start_alert_id, latest_alert_id, end_alert_id, started_at, ended_at,
       is_active, is_processed, review_status, created_at, updated_at
FROM site_incidents
WHERE site_id = $1 AND started_at >= $2 AND started_at <= $3
ORDER BY started_at DESC;
"#;

pub const SELECT_ALERT_BY_ID: &str = r#"
SELECT id, site_id, event_date, latitude, longitude, confidence, detected_by,
       site_incident_id, is_processed
FROM site_alerts
WHERE id = $1;
"#;

pub const SELECT_ALERTS_BY_INCIDENT: &str = r#"
SELECT id, site_id, event_date, latitude, longitude, confidence, detected_by,
       site_incident_id, is_processed
FROM site_alerts
WHERE site_incident_id = $1
ORDER BY event_date;
"#;

pub const MARK_ALERT_PROCESSED: &str = r#"
UPDATE site_alerts
SET site_incident_id = $2,
    is_processed = true
WHERE id = $1;
"#;

pub const SELECT_SITE_BY_ID: &str = r#"
SELECT id, name FROM sites WHERE id = $1;
"#;
