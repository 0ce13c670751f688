use super::{EventStore, StoreError};
use crate::config::DatabaseConfig;
use crate::models::{
    BoundingBox, Detection, DetectionRecord, Device, EventQuery, EventRecord, InferenceJob,
    InferenceJobState, Landmark, NewEvent, WriteTarget,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const EVENT_COLUMNS: &str = r#"
    event_id, device_id, state, client_job_id, created_at, finalize_deadline,
    object_key, write_url, write_url_expires_at, snapshot_ref, finalized_at, expired_at
"#;

const JOB_COLUMNS: &str = r#"
    job_id, event_id, snapshot_ref, state, attempts, created_at, updated_at, last_error
"#;

#[derive(Debug, FromRow)]
struct DeviceRow {
    device_id: String,
    name: Option<String>,
    api_key_hash: String,
    created_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Self {
            device_id: row.device_id,
            name: row.name,
            api_key_hash: row.api_key_hash,
            created_at: row.created_at,
            revoked_at: row.revoked_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    event_id: Uuid,
    device_id: String,
    state: String,
    client_job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    finalize_deadline: DateTime<Utc>,
    object_key: String,
    write_url: Option<String>,
    write_url_expires_at: Option<DateTime<Utc>>,
    snapshot_ref: Option<String>,
    finalized_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let write_target = match (row.write_url, row.write_url_expires_at) {
            (Some(url), Some(expires_at)) => Some(WriteTarget {
                url,
                object_key: row.object_key.clone(),
                expires_at,
            }),
            _ => None,
        };

        Ok(Self {
            event_id: row.event_id,
            device_id: row.device_id,
            state: row.state.parse().map_err(StoreError::Corrupt)?,
            client_job_id: row.client_job_id,
            created_at: row.created_at,
            finalize_deadline: row.finalize_deadline,
            object_key: row.object_key,
            write_target,
            snapshot_ref: row.snapshot_ref,
            finalized_at: row.finalized_at,
            expired_at: row.expired_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: Uuid,
    event_id: Uuid,
    snapshot_ref: String,
    state: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for InferenceJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: row.job_id,
            event_id: row.event_id,
            snapshot_ref: row.snapshot_ref,
            state: row.state.parse().map_err(StoreError::Corrupt)?,
            attempts: row.attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, FromRow)]
struct DetectionRow {
    detection_id: Uuid,
    event_id: Uuid,
    run_id: Uuid,
    ordinal: i32,
    detection_type: String,
    label: Option<String>,
    confidence: f32,
    bbox: Option<Json<BoundingBox>>,
    landmarks: Json<Vec<Landmark>>,
    embedding: Option<Vec<f32>>,
    extra: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<DetectionRow> for DetectionRecord {
    fn from(row: DetectionRow) -> Self {
        Self {
            detection_id: row.detection_id,
            event_id: row.event_id,
            run_id: row.run_id,
            ordinal: row.ordinal,
            detection: Detection {
                detection_type: row.detection_type,
                label: row.label,
                confidence: row.confidence,
                bbox: row.bbox.map(|b| b.0),
                landmarks: row.landmarks.0,
                embedding: row.embedding,
                extra: row.extra,
            },
            created_at: row.created_at,
        }
    }
}

/// Event store backed by PostgreSQL
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_event_by_job(&self, client_job_id: Uuid) -> Result<EventRecord, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM events WHERE client_job_id = $1",
            EVENT_COLUMNS
        ))
        .bind(client_job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            StoreError::Corrupt(format!("event for job {} vanished after conflict", client_job_id))
        })?;

        row.try_into()
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, api_key_hash))]
    async fn upsert_device(
        &self,
        device_id: &str,
        name: Option<&str>,
        api_key_hash: &str,
    ) -> Result<Device, StoreError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            INSERT INTO devices (device_id, name, api_key_hash, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (device_id) DO UPDATE
                SET name = EXCLUDED.name,
                    api_key_hash = EXCLUDED.api_key_hash
            RETURNING device_id, name, api_key_hash, created_at, revoked_at
            "#,
        )
        .bind(device_id)
        .bind(name)
        .bind(api_key_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, name, api_key_hash, created_at, revoked_at
            FROM devices
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, api_key_hash))]
    async fn find_devices_by_key_hash(
        &self,
        api_key_hash: &str,
    ) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, name, api_key_hash, created_at, revoked_at
            FROM devices
            WHERE lower(api_key_hash) = $1
            "#,
        )
        .bind(api_key_hash)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, event), fields(client_job_id = %event.client_job_id, device_id = %event.device_id))]
    async fn insert_event(&self, event: NewEvent) -> Result<(EventRecord, bool), StoreError> {
        let inserted = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            INSERT INTO events (
                event_id, device_id, state, client_job_id,
                created_at, finalize_deadline, object_key
            ) VALUES ($1, $2, 'created', $3, $4, $5, $6)
            ON CONFLICT (client_job_id) DO NOTHING
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(event.event_id)
        .bind(&event.device_id)
        .bind(event.client_job_id)
        .bind(event.created_at)
        .bind(event.finalize_deadline)
        .bind(&event.object_key)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok((row.try_into()?, true)),
            None => {
                debug!("Event already exists for job");
                Ok((self.fetch_event_by_job(event.client_job_id).await?, false))
            }
        }
    }

    async fn issue_write_target(
        &self,
        event_id: Uuid,
        target: &WriteTarget,
    ) -> Result<Option<EventRecord>, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET state = 'awaiting_media', write_url = $2, write_url_expires_at = $3
            WHERE event_id = $1 AND state = 'created'
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(event_id)
        .bind(&target.url)
        .bind(target.expires_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventRecord>, StoreError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM events WHERE event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    #[instrument(skip(self))]
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {}
            FROM events
            WHERE ($1::timestamptz IS NULL OR created_at >= $1)
            ORDER BY created_at DESC, event_id DESC
            LIMIT $2
            "#,
            EVENT_COLUMNS
        ))
        .bind(query.since)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self))]
    async fn finalize_event(
        &self,
        event_id: Uuid,
        snapshot_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<EventRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET state = 'finalized', snapshot_ref = $2, finalized_at = $3
            WHERE event_id = $1 AND state = 'awaiting_media'
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(event_id)
        .bind(snapshot_ref)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            INSERT INTO inference_jobs (job_id, event_id, snapshot_ref, state, created_at, updated_at)
            VALUES ($1, $2, $3, 'queued', $4, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(snapshot_ref)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(row.try_into()?))
    }

    #[instrument(skip(self))]
    async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET state = 'expired', expired_at = $1
            WHERE event_id IN (
                SELECT event_id FROM events
                WHERE state IN ('created', 'awaiting_media')
                  AND finalize_deadline < $1
                ORDER BY finalize_deadline
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            AND state IN ('created', 'awaiting_media')
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn claim_inference_jobs(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<InferenceJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE inference_jobs
            SET state = 'running', attempts = attempts + 1, updated_at = NOW()
            WHERE job_id IN (
                SELECT job_id FROM inference_jobs
                WHERE state = 'queued'
                   OR (state = 'running' AND updated_at < $2)
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(limit)
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self, detections), fields(count = detections.len()))]
    async fn complete_inference_job(
        &self,
        job_id: Uuid,
        detections: &[Detection],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        let event_id: Uuid = sqlx::query_scalar("SELECT event_id FROM inference_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("inference job {} not found", job_id)))?;

        let mut inserted = 0usize;
        for (ordinal, detection) in detections.iter().enumerate() {
            let result = sqlx::query(
                r#"
                INSERT INTO detections (
                    detection_id, event_id, run_id, ordinal, detection_type, label,
                    confidence, bbox, landmarks, embedding, extra, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
                ON CONFLICT (event_id, run_id, ordinal) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(event_id)
            .bind(job_id)
            .bind(ordinal as i32)
            .bind(&detection.detection_type)
            .bind(&detection.label)
            .bind(detection.confidence)
            .bind(detection.bbox.map(Json))
            .bind(Json(&detection.landmarks))
            .bind(&detection.embedding)
            .bind(&detection.extra)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected() as usize;
        }

        sqlx::query(
            "UPDATE inference_jobs SET state = 'done', updated_at = NOW(), last_error = NULL WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(inserted)
    }

    async fn fail_inference_job(
        &self,
        job_id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> Result<InferenceJobState, StoreError> {
        let state: String = sqlx::query_scalar(
            r#"
            UPDATE inference_jobs
            SET state = CASE WHEN attempts >= $3 THEN 'failed' ELSE 'queued' END,
                last_error = $2,
                updated_at = NOW()
            WHERE job_id = $1
            RETURNING state
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::Corrupt(format!("inference job {} not found", job_id)))?;

        state.parse().map_err(StoreError::Corrupt)
    }

    async fn list_detections(&self, event_id: Uuid) -> Result<Vec<DetectionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DetectionRow>(
            r#"
            SELECT detection_id, event_id, run_id, ordinal, detection_type, label,
                   confidence, bbox, landmarks, embedding, extra, created_at
            FROM detections
            WHERE event_id = $1
            ORDER BY run_id, ordinal
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
