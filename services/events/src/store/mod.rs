//! Event persistence.
//!
//! Every state change is a single conditional statement (or one transaction)
//! so concurrent requests for the same job or event serialize in the store.

use crate::models::{
    Detection, DetectionRecord, Device, EventQuery, EventRecord, InferenceJob, InferenceJobState,
    NewEvent, WriteTarget,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod postgres;

pub use postgres::PgEventStore;

/// Errors raised by an event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence operations used by the lifecycle, the sweeper and the
/// inference worker.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Register a device or update its name and key hash.
    async fn upsert_device(
        &self,
        device_id: &str,
        name: Option<&str>,
        api_key_hash: &str,
    ) -> Result<Device, StoreError>;

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    /// Devices registered with `api_key_hash` (lowercase hex).
    async fn find_devices_by_key_hash(&self, api_key_hash: &str)
        -> Result<Vec<Device>, StoreError>;

    /// Insert a CREATED event unless one exists for `client_job_id`.
    /// Returns the stored event and whether this call created it.
    async fn insert_event(&self, event: NewEvent) -> Result<(EventRecord, bool), StoreError>;

    /// Attach the write target and move CREATED to AWAITING_MEDIA.
    /// `None` when the event is no longer CREATED.
    async fn issue_write_target(
        &self,
        event_id: Uuid,
        target: &WriteTarget,
    ) -> Result<Option<EventRecord>, StoreError>;

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventRecord>, StoreError>;

    /// Events newest first.
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError>;

    /// Move AWAITING_MEDIA to FINALIZED and queue its inference job in the
    /// same transaction. `None` when the event was not AWAITING_MEDIA.
    async fn finalize_event(
        &self,
        event_id: Uuid,
        snapshot_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<EventRecord>, StoreError>;

    /// Expire up to `limit` unfinalized events whose deadline has passed.
    /// Returns the events this call expired.
    async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Claim queued jobs, and running jobs not touched since `stale_before`.
    async fn claim_inference_jobs(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<InferenceJob>, StoreError>;

    /// Store a run's detections and mark the job done. Detections already
    /// written for this run are skipped. Returns how many were inserted.
    async fn complete_inference_job(
        &self,
        job_id: Uuid,
        detections: &[Detection],
    ) -> Result<usize, StoreError>;

    /// Record a failed run; the job is requeued until `max_attempts`.
    async fn fail_inference_job(
        &self,
        job_id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> Result<InferenceJobState, StoreError>;

    async fn list_detections(&self, event_id: Uuid) -> Result<Vec<DetectionRecord>, StoreError>;
}
