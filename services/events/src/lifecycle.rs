//! Event lifecycle: CREATED -> AWAITING_MEDIA -> FINALIZED | EXPIRED.
//!
//! `start` is idempotent on the device's job id and `finalize` is idempotent
//! on the snapshot reference. Both lean on conditional store updates, so two
//! racing retries of the same request observe one outcome.

use crate::auth::{self, AuthError};
use crate::config::Config;
use crate::models::{
    DetectionRecord, EventQuery, EventRecord, EventState, NewEvent, WriteTarget,
};
use crate::object_storage::{snapshot_key, ObjectStorage, ReadUrl, StorageError};
use crate::store::{EventStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_LIST_LIMIT: i64 = 10;
pub const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Invalid or revoked device credential")]
    Unauthorized,

    #[error("Event {0} not found")]
    NotFound(Uuid),

    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),

    #[error("Event {0} has expired")]
    Expired(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<AuthError> for LifecycleError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => LifecycleError::Unauthorized,
            AuthError::Store(e) => LifecycleError::Store(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub finalize_deadline: Duration,
    pub write_url_expiry: Duration,
    pub read_url_expiry: Duration,
}

impl From<&Config> for LifecycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            finalize_deadline: config.finalize_deadline(),
            write_url_expiry: config.write_url_expiry(),
            read_url_expiry: config.read_url_expiry(),
        }
    }
}

/// Result of `start`
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub event: EventRecord,
    pub write_target: Option<WriteTarget>,
    /// The job id had already opened this event
    pub replayed: bool,
}

/// Result of `finalize`
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub event: EventRecord,
    /// The event was already finalized with the same reference
    pub replayed: bool,
}

/// Event with its detections and a read URL for the snapshot
#[derive(Debug, Clone)]
pub struct EventDetail {
    pub event: EventRecord,
    pub detections: Vec<DetectionRecord>,
    pub snapshot_url: Option<ReadUrl>,
}

pub struct EventLifecycle {
    store: Arc<dyn EventStore>,
    storage: Arc<dyn ObjectStorage>,
    settings: LifecycleSettings,
}

impl EventLifecycle {
    pub fn new(
        store: Arc<dyn EventStore>,
        storage: Arc<dyn ObjectStorage>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            storage,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Open an event for `job_id`, or return the one it already opened.
    #[instrument(skip(self, api_key))]
    pub async fn start(
        &self,
        job_id: Uuid,
        device_id: &str,
        api_key: &str,
    ) -> Result<StartOutcome, LifecycleError> {
        auth::authenticate(self.store.as_ref(), device_id, api_key).await?;

        let now = Utc::now();
        let event_id = Uuid::new_v4();
        let (mut event, created) = self
            .store
            .insert_event(NewEvent {
                event_id,
                device_id: device_id.to_string(),
                client_job_id: job_id,
                created_at: now,
                finalize_deadline: now + to_chrono(self.settings.finalize_deadline),
                object_key: snapshot_key(device_id, event_id, now),
            })
            .await?;

        if event.device_id != device_id {
            metrics::counter!("events.conflicts").increment(1);
            warn!(
                job_id = %job_id,
                owner = %event.device_id,
                "Job id already used by another device"
            );
            return Err(LifecycleError::IdempotencyConflict(format!(
                "job {} belongs to another device",
                job_id
            )));
        }

        // A CREATED event on replay means an earlier start died before the
        // write target was stored; finish that step now.
        if event.state == EventState::Created {
            let target = self
                .storage
                .presign_put(&event.object_key, self.settings.write_url_expiry)
                .await?;
            event = match self.store.issue_write_target(event.event_id, &target).await? {
                Some(updated) => updated,
                None => self
                    .store
                    .get_event(event.event_id)
                    .await?
                    .ok_or(LifecycleError::NotFound(event.event_id))?,
            };
        }

        if created {
            metrics::counter!("events.started").increment(1);
            info!(
                event_id = %event.event_id,
                job_id = %job_id,
                object_key = %event.object_key,
                "Event started"
            );
        } else {
            metrics::counter!("events.replayed").increment(1);
            debug!(event_id = %event.event_id, state = %event.state, "Start replayed");
        }

        Ok(StartOutcome {
            write_target: event.write_target.clone(),
            event,
            replayed: !created,
        })
    }

    /// Commit the uploaded snapshot to the event.
    #[instrument(skip(self, api_key))]
    pub async fn finalize(
        &self,
        event_id: Uuid,
        api_key: &str,
        snapshot_ref: &str,
    ) -> Result<FinalizeOutcome, LifecycleError> {
        let devices = auth::devices_for_key(self.store.as_ref(), api_key).await?;

        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(LifecycleError::NotFound(event_id))?;

        if !devices.iter().any(|d| d.device_id == event.device_id) {
            warn!(event_id = %event_id, "Credential does not belong to the event's device");
            return Err(LifecycleError::Unauthorized);
        }

        if snapshot_ref.trim().is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "snapshot_ref must not be empty".to_string(),
            ));
        }

        if let Some(settled) = self.settled(&event, snapshot_ref) {
            return settled;
        }

        if snapshot_ref != event.object_key {
            return Err(LifecycleError::InvalidRequest(format!(
                "snapshot_ref must be the issued object key {}",
                event.object_key
            )));
        }

        match self
            .store
            .finalize_event(event_id, snapshot_ref, Utc::now())
            .await?
        {
            Some(event) => {
                metrics::counter!("events.finalized").increment(1);
                info!(event_id = %event_id, snapshot_ref = %snapshot_ref, "Event finalized");
                Ok(FinalizeOutcome {
                    event,
                    replayed: false,
                })
            }
            None => {
                // Lost the conditional update to a concurrent finalize or the sweep.
                let current = self
                    .store
                    .get_event(event_id)
                    .await?
                    .ok_or(LifecycleError::NotFound(event_id))?;
                self.settled(&current, snapshot_ref).unwrap_or_else(|| {
                    Err(LifecycleError::Store(StoreError::Corrupt(format!(
                        "event {} stayed {} after a failed finalize",
                        event_id, current.state
                    ))))
                })
            }
        }
    }

    /// Outcome for an event that is not open for finalize, if any.
    fn settled(
        &self,
        event: &EventRecord,
        snapshot_ref: &str,
    ) -> Option<Result<FinalizeOutcome, LifecycleError>> {
        match event.state {
            EventState::Finalized if event.snapshot_ref.as_deref() == Some(snapshot_ref) => {
                debug!(event_id = %event.event_id, "Finalize replayed");
                Some(Ok(FinalizeOutcome {
                    event: event.clone(),
                    replayed: true,
                }))
            }
            EventState::Finalized => {
                metrics::counter!("events.conflicts").increment(1);
                warn!(
                    event_id = %event.event_id,
                    stored = ?event.snapshot_ref,
                    offered = %snapshot_ref,
                    "Finalize conflicts with stored snapshot"
                );
                Some(Err(LifecycleError::IdempotencyConflict(format!(
                    "event {} is already finalized with a different snapshot",
                    event.event_id
                ))))
            }
            EventState::Expired => Some(Err(LifecycleError::Expired(event.event_id))),
            EventState::Created => Some(Err(LifecycleError::InvalidRequest(format!(
                "event {} has no write target yet",
                event.event_id
            )))),
            EventState::AwaitingMedia => None,
        }
    }

    pub async fn get_event(&self, event_id: Uuid) -> Result<EventDetail, LifecycleError> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(LifecycleError::NotFound(event_id))?;
        let detections = self.store.list_detections(event_id).await?;

        let snapshot_url = match (&event.state, &event.snapshot_ref) {
            (EventState::Finalized, Some(key)) => {
                match self
                    .storage
                    .presign_get(key, self.settings.read_url_expiry)
                    .await
                {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!(event_id = %event_id, error = %e, "Failed to presign snapshot URL");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(EventDetail {
            event,
            detections,
            snapshot_url,
        })
    }

    /// Newest events first. `limit` is clamped to 1..=100.
    pub async fn list_events(
        &self,
        limit: Option<i64>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, LifecycleError> {
        let query = EventQuery {
            since,
            limit: limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT),
        };
        Ok(self.store.list_events(&query).await?)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
