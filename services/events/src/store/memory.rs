//! In-process event store for tests and local runs.
//!
//! A single mutex guards all tables, so every operation is atomic in the same
//! way the conditional statements of the Postgres store are.

use super::{EventStore, StoreError};
use crate::models::{
    Detection, DetectionRecord, Device, EventQuery, EventRecord, EventState, InferenceJob,
    InferenceJobState, NewEvent, WriteTarget,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    devices: HashMap<String, Device>,
    events: HashMap<Uuid, EventRecord>,
    events_by_job: HashMap<Uuid, Uuid>,
    jobs: HashMap<Uuid, InferenceJob>,
    detections: Vec<DetectionRecord>,
    detection_keys: HashSet<(Uuid, Uuid, i32)>,
}

#[derive(Default)]
pub struct InMemoryEventStore {
    tables: Mutex<Tables>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke_device(&self, device_id: &str, at: DateTime<Utc>) {
        if let Some(device) = self.tables.lock().devices.get_mut(device_id) {
            device.revoked_at = Some(at);
        }
    }

    /// All inference jobs, oldest first.
    pub fn inference_jobs(&self) -> Vec<InferenceJob> {
        let mut jobs: Vec<_> = self.tables.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Move an event's deadline, for driving the sweeper in tests.
    pub fn set_finalize_deadline(&self, event_id: Uuid, deadline: DateTime<Utc>) {
        if let Some(event) = self.tables.lock().events.get_mut(&event_id) {
            event.finalize_deadline = deadline;
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_device(
        &self,
        device_id: &str,
        name: Option<&str>,
        api_key_hash: &str,
    ) -> Result<Device, StoreError> {
        let mut tables = self.tables.lock();
        let device = tables
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| Device {
                device_id: device_id.to_string(),
                name: None,
                api_key_hash: String::new(),
                created_at: Utc::now(),
                revoked_at: None,
            });
        device.name = name.map(str::to_string);
        device.api_key_hash = api_key_hash.to_string();
        Ok(device.clone())
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.tables.lock().devices.get(device_id).cloned())
    }

    async fn find_devices_by_key_hash(
        &self,
        api_key_hash: &str,
    ) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .tables
            .lock()
            .devices
            .values()
            .filter(|d| d.api_key_hash.eq_ignore_ascii_case(api_key_hash))
            .cloned()
            .collect())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<(EventRecord, bool), StoreError> {
        let mut tables = self.tables.lock();

        if let Some(existing) = tables.events_by_job.get(&event.client_job_id) {
            let record = tables.events.get(existing).cloned().ok_or_else(|| {
                StoreError::Corrupt(format!("dangling job index for {}", event.client_job_id))
            })?;
            return Ok((record, false));
        }

        let record = EventRecord {
            event_id: event.event_id,
            device_id: event.device_id,
            state: EventState::Created,
            client_job_id: Some(event.client_job_id),
            created_at: event.created_at,
            finalize_deadline: event.finalize_deadline,
            object_key: event.object_key,
            write_target: None,
            snapshot_ref: None,
            finalized_at: None,
            expired_at: None,
        };
        tables.events_by_job.insert(event.client_job_id, record.event_id);
        tables.events.insert(record.event_id, record.clone());
        Ok((record, true))
    }

    async fn issue_write_target(
        &self,
        event_id: Uuid,
        target: &WriteTarget,
    ) -> Result<Option<EventRecord>, StoreError> {
        let mut tables = self.tables.lock();
        match tables.events.get_mut(&event_id) {
            Some(event) if event.state == EventState::Created => {
                event.state = EventState::AwaitingMedia;
                event.write_target = Some(target.clone());
                Ok(Some(event.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.tables.lock().events.get(&event_id).cloned())
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError> {
        let tables = self.tables.lock();
        let mut events: Vec<_> = tables
            .events
            .values()
            .filter(|e| query.since.map_or(true, |since| e.created_at >= since))
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });
        events.truncate(query.limit.max(0) as usize);
        Ok(events)
    }

    async fn finalize_event(
        &self,
        event_id: Uuid,
        snapshot_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<EventRecord>, StoreError> {
        let mut tables = self.tables.lock();
        let record = match tables.events.get_mut(&event_id) {
            Some(event) if event.state == EventState::AwaitingMedia => {
                event.state = EventState::Finalized;
                event.snapshot_ref = Some(snapshot_ref.to_string());
                event.finalized_at = Some(at);
                event.clone()
            }
            _ => return Ok(None),
        };

        if !tables.jobs.values().any(|j| j.event_id == event_id) {
            let job = InferenceJob {
                job_id: Uuid::new_v4(),
                event_id,
                snapshot_ref: snapshot_ref.to_string(),
                state: InferenceJobState::Queued,
                attempts: 0,
                created_at: at,
                updated_at: at,
                last_error: None,
            };
            tables.jobs.insert(job.job_id, job);
        }

        Ok(Some(record))
    }

    async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut tables = self.tables.lock();
        let mut overdue: Vec<_> = tables
            .events
            .values()
            .filter(|e| {
                matches!(e.state, EventState::Created | EventState::AwaitingMedia)
                    && e.finalize_deadline < now
            })
            .map(|e| (e.finalize_deadline, e.event_id))
            .collect();
        overdue.sort();
        overdue.truncate(limit.max(0) as usize);

        let mut expired = Vec::with_capacity(overdue.len());
        for (_, event_id) in overdue {
            if let Some(event) = tables.events.get_mut(&event_id) {
                event.state = EventState::Expired;
                event.expired_at = Some(now);
                expired.push(event.clone());
            }
        }
        Ok(expired)
    }

    async fn claim_inference_jobs(
        &self,
        limit: i64,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<InferenceJob>, StoreError> {
        let mut tables = self.tables.lock();
        let mut claimable: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| match j.state {
                InferenceJobState::Queued => true,
                InferenceJobState::Running => j.updated_at < stale_before,
                _ => false,
            })
            .map(|j| (j.created_at, j.job_id))
            .collect();
        claimable.sort();
        claimable.truncate(limit.max(0) as usize);

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(claimable.len());
        for (_, job_id) in claimable {
            if let Some(job) = tables.jobs.get_mut(&job_id) {
                job.state = InferenceJobState::Running;
                job.attempts += 1;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_inference_job(
        &self,
        job_id: Uuid,
        detections: &[Detection],
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();
        let event_id = tables
            .jobs
            .get(&job_id)
            .map(|j| j.event_id)
            .ok_or_else(|| StoreError::Corrupt(format!("inference job {} not found", job_id)))?;

        let now = Utc::now();
        let mut inserted = 0;
        for (ordinal, detection) in detections.iter().enumerate() {
            let ordinal = ordinal as i32;
            if !tables.detection_keys.insert((event_id, job_id, ordinal)) {
                continue;
            }
            tables.detections.push(DetectionRecord {
                detection_id: Uuid::new_v4(),
                event_id,
                run_id: job_id,
                ordinal,
                detection: detection.clone(),
                created_at: now,
            });
            inserted += 1;
        }

        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.state = InferenceJobState::Done;
            job.updated_at = now;
            job.last_error = None;
        }

        Ok(inserted)
    }

    async fn fail_inference_job(
        &self,
        job_id: Uuid,
        error: &str,
        max_attempts: i32,
    ) -> Result<InferenceJobState, StoreError> {
        let mut tables = self.tables.lock();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::Corrupt(format!("inference job {} not found", job_id)))?;

        job.state = if job.attempts >= max_attempts {
            InferenceJobState::Failed
        } else {
            InferenceJobState::Queued
        };
        job.last_error = Some(error.to_string());
        job.updated_at = Utc::now();
        Ok(job.state)
    }

    async fn list_detections(&self, event_id: Uuid) -> Result<Vec<DetectionRecord>, StoreError> {
        let tables = self.tables.lock();
        let mut detections: Vec<_> = tables
            .detections
            .iter()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect();
        detections.sort_by_key(|d| (d.run_id, d.ordinal));
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_event(job_id: Uuid, now: DateTime<Utc>) -> NewEvent {
        let event_id = Uuid::new_v4();
        NewEvent {
            event_id,
            device_id: "doorcam-01".to_string(),
            client_job_id: job_id,
            created_at: now,
            finalize_deadline: now + Duration::seconds(60),
            object_key: format!("snapshots/doorcam-01/{}.jpg", event_id),
        }
    }

    fn target(key: &str, now: DateTime<Utc>) -> WriteTarget {
        WriteTarget {
            url: format!("memory://media/{}", key),
            object_key: key.to_string(),
            expires_at: now + Duration::minutes(15),
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_job() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let job_id = Uuid::new_v4();

        let (first, created) = store.insert_event(new_event(job_id, now)).await.unwrap();
        assert!(created);
        let (second, created) = store.insert_event(new_event(job_id, now)).await.unwrap();
        assert!(!created);
        assert_eq!(first.event_id, second.event_id);
    }

    #[tokio::test]
    async fn test_finalize_requires_awaiting_media() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let (event, _) = store.insert_event(new_event(Uuid::new_v4(), now)).await.unwrap();

        assert!(store
            .finalize_event(event.event_id, &event.object_key, now)
            .await
            .unwrap()
            .is_none());

        store
            .issue_write_target(event.event_id, &target(&event.object_key, now))
            .await
            .unwrap()
            .unwrap();
        let finalized = store
            .finalize_event(event.event_id, &event.object_key, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finalized.state, EventState::Finalized);
        assert_eq!(store.inference_jobs().len(), 1);

        // Second finalize loses the conditional update and queues nothing.
        assert!(store
            .finalize_event(event.event_id, &event.object_key, now)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.inference_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_expire_overdue_once() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let (event, _) = store.insert_event(new_event(Uuid::new_v4(), now)).await.unwrap();
        store
            .issue_write_target(event.event_id, &target(&event.object_key, now))
            .await
            .unwrap();

        assert!(store.expire_overdue(now, 10).await.unwrap().is_empty());

        let later = now + Duration::seconds(61);
        let expired = store.expire_overdue(later, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].state, EventState::Expired);
        assert!(store.expire_overdue(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detection_writes_are_deduplicated() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let (event, _) = store.insert_event(new_event(Uuid::new_v4(), now)).await.unwrap();
        store
            .issue_write_target(event.event_id, &target(&event.object_key, now))
            .await
            .unwrap();
        store
            .finalize_event(event.event_id, &event.object_key, now)
            .await
            .unwrap();

        let job = store
            .claim_inference_jobs(10, now)
            .await
            .unwrap()
            .pop()
            .unwrap();
        let detections: Vec<Detection> = serde_json::from_value(serde_json::json!([
            {"type": "person", "confidence": 0.9},
            {"type": "face", "confidence": 0.7}
        ]))
        .unwrap();

        assert_eq!(store.complete_inference_job(job.job_id, &detections).await.unwrap(), 2);
        assert_eq!(store.complete_inference_job(job.job_id, &detections).await.unwrap(), 0);
        assert_eq!(store.list_detections(event.event_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_job_requeues_until_limit() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let (event, _) = store.insert_event(new_event(Uuid::new_v4(), now)).await.unwrap();
        store
            .issue_write_target(event.event_id, &target(&event.object_key, now))
            .await
            .unwrap();
        store
            .finalize_event(event.event_id, &event.object_key, now)
            .await
            .unwrap();

        let job = store.claim_inference_jobs(1, now).await.unwrap().pop().unwrap();
        assert_eq!(
            store.fail_inference_job(job.job_id, "timeout", 2).await.unwrap(),
            InferenceJobState::Queued
        );
        let job = store.claim_inference_jobs(1, now).await.unwrap().pop().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(
            store.fail_inference_job(job.job_id, "timeout", 2).await.unwrap(),
            InferenceJobState::Failed
        );
        assert!(store.claim_inference_jobs(1, now).await.unwrap().is_empty());
    }
}
