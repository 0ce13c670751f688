//! Upload client draining the spool into the event API.
//!
//! ```text
//! Spool --lease--> start(job_id) --> PUT media --> finalize(event_id, key) --> complete
//!                       |                |                 |
//!                       +--- transient --+--> fail (backoff, maybe DEAD)
//!                       +--- permanent / conflict --> dead_letter
//! ```

use crate::api_client::{DeliveryError, EventApi, RemoteEventState};
use crate::scheduler::RecurringTask;
use crate::spool::{Spool, SpoolError, SpoolRecord};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What happened to one leased job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Event finalized with our media
    Delivered { event_id: Uuid },
    /// A previous attempt had already finalized the event
    AlreadyFinalized { event_id: Uuid },
    /// Retry scheduled
    Retrying { attempts: u32 },
    /// Moved to the dead-letter set
    DeadLettered { reason: String },
}

/// Upload statistics.
#[derive(Debug, Default, Clone)]
pub struct UploadStats {
    pub delivered: u64,
    pub already_finalized: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub bytes_uploaded: u64,
}

/// Drains the spool, one leased job at a time per worker slot.
#[derive(Clone)]
pub struct UploadClient {
    spool: Arc<Spool>,
    api: Arc<dyn EventApi>,
    concurrency: usize,
    stats: Arc<RwLock<UploadStats>>,
}

impl UploadClient {
    pub fn new(spool: Arc<Spool>, api: Arc<dyn EventApi>, concurrency: usize) -> Self {
        Self {
            spool,
            api,
            concurrency: concurrency.max(1),
            stats: Arc::new(RwLock::new(UploadStats::default())),
        }
    }

    pub fn stats(&self) -> UploadStats {
        self.stats.read().clone()
    }

    /// Start the periodic drain.
    pub fn spawn(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let client = self.clone();
        RecurringTask::new("spool-drain", interval, cancel).spawn(move || {
            let client = client.clone();
            async move {
                if let Err(e) = client.drain_once().await {
                    error!(error = %e, "Spool drain failed");
                }
            }
        })
    }

    /// Lease and deliver eligible jobs until none are left. Returns the
    /// outcome of every job processed.
    pub async fn drain_once(&self) -> Result<Vec<DeliveryOutcome>, SpoolError> {
        let mut outcomes = Vec::new();

        loop {
            let mut batch = Vec::with_capacity(self.concurrency);
            let now = Utc::now();
            for _ in 0..self.concurrency {
                match self.spool.lease_async(now).await? {
                    Some(record) => batch.push(record),
                    None => break,
                }
            }

            if batch.is_empty() {
                break;
            }

            let results: Vec<Result<DeliveryOutcome, SpoolError>> = stream::iter(batch)
                .map(|record| self.process(record))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            let mut progressed = false;
            for result in results {
                let outcome = result?;
                if !matches!(outcome, DeliveryOutcome::Retrying { .. }) {
                    progressed = true;
                }
                outcomes.push(outcome);
            }

            // Retries are backed off; stop here and let the next tick pick them up
            if !progressed {
                break;
            }
        }

        Ok(outcomes)
    }

    /// Deliver one leased job and record the result in the spool.
    #[instrument(skip(self, record), fields(job_id = %record.job_id, attempt = record.attempt_count))]
    pub async fn process(&self, record: SpoolRecord) -> Result<DeliveryOutcome, SpoolError> {
        let job_id = record.job_id;

        match self.deliver(&record).await {
            Ok(outcome) => {
                self.spool.complete_async(job_id).await?;
                let mut stats = self.stats.write();
                match &outcome {
                    DeliveryOutcome::AlreadyFinalized { event_id } => {
                        stats.already_finalized += 1;
                        info!(event_id = %event_id, "Event was already finalized");
                    }
                    DeliveryOutcome::Delivered { event_id } => {
                        stats.delivered += 1;
                        info!(event_id = %event_id, "Event delivered");
                    }
                    _ => {}
                }
                Ok(outcome)
            }
            Err(DeliveryError::Transient(reason)) => {
                let updated = self
                    .spool
                    .fail_async(job_id, reason.clone(), Utc::now())
                    .await?;
                let mut stats = self.stats.write();
                if updated.status == crate::spool::JobStatus::Dead {
                    stats.dead_lettered += 1;
                    Ok(DeliveryOutcome::DeadLettered { reason })
                } else {
                    stats.retries += 1;
                    Ok(DeliveryOutcome::Retrying {
                        attempts: updated.attempt_count,
                    })
                }
            }
            Err(e @ (DeliveryError::Permanent(_) | DeliveryError::Conflict(_))) => {
                let reason = e.to_string();
                self.spool.dead_letter_async(job_id, reason.clone()).await?;
                self.stats.write().dead_lettered += 1;
                Ok(DeliveryOutcome::DeadLettered { reason })
            }
        }
    }

    async fn deliver(&self, record: &SpoolRecord) -> Result<DeliveryOutcome, DeliveryError> {
        let started = self.api.start_event(record.job_id).await?;

        match started.state {
            RemoteEventState::Finalized => {
                return Ok(DeliveryOutcome::AlreadyFinalized {
                    event_id: started.event_id,
                })
            }
            RemoteEventState::Expired => {
                return Err(DeliveryError::Permanent(format!(
                    "event {} expired before finalize",
                    started.event_id
                )))
            }
            RemoteEventState::Created | RemoteEventState::AwaitingMedia => {}
        }

        let target = started.write_target.ok_or_else(|| {
            DeliveryError::Transient(format!("event {} has no write target yet", started.event_id))
        })?;

        let media_path = record.media_paths.first().ok_or_else(|| {
            DeliveryError::Permanent("spool record has no media".to_string())
        })?;
        let data = tokio::fs::read(media_path).await.map_err(|e| {
            DeliveryError::Permanent(format!("media {} unreadable: {}", media_path.display(), e))
        })?;
        let size = data.len() as u64;

        debug!(object_key = %target.object_key, bytes = size, "Uploading media");
        self.api
            .upload_media(&target, Bytes::from(data), content_type_for(media_path))
            .await?;
        self.stats.write().bytes_uploaded += size;

        let finalized = self
            .api
            .finalize_event(started.event_id, &target.object_key)
            .await?;

        if finalized.state != RemoteEventState::Finalized {
            warn!(state = ?finalized.state, "Finalize returned unexpected state");
            return Err(DeliveryError::Transient(format!(
                "event {} not finalized: {:?}",
                started.event_id, finalized.state
            )));
        }

        Ok(DeliveryOutcome::Delivered {
            event_id: started.event_id,
        })
    }
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{
        FinalizeEventResponse, MockEventApi, StartEventResponse, WriteTarget,
    };
    use crate::spool::{JobStatus, MediaArtifact, NewCapture, NoJitter, RetryPolicy};
    use mockall::predicate::eq;

    fn spool(dir: &std::path::Path) -> Arc<Spool> {
        let policy = RetryPolicy {
            max_attempts: 2,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            jitter_ratio: 0.0,
        };
        Arc::new(
            Spool::open_with_jitter(dir, policy, Duration::from_secs(60), Box::new(NoJitter))
                .unwrap(),
        )
    }

    fn enqueue(spool: &Spool) -> SpoolRecord {
        spool
            .enqueue(NewCapture {
                device_id: "doorcam-01".to_string(),
                captured_at: Utc::now(),
                media: vec![MediaArtifact {
                    data: Bytes::from_static(b"jpeg"),
                    extension: "jpg".to_string(),
                }],
            })
            .unwrap()
    }

    fn target() -> WriteTarget {
        WriteTarget {
            url: "http://storage/doorcam/key?sig=1".to_string(),
            object_key: "snapshots/2024-01-01/doorcam-01/e.jpg".to_string(),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
        }
    }

    fn started(event_id: Uuid, state: RemoteEventState) -> StartEventResponse {
        StartEventResponse {
            event_id,
            state,
            write_target: Some(target()),
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes_job() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let record = enqueue(&spool);
        let event_id = Uuid::new_v4();

        let mut api = MockEventApi::new();
        api.expect_start_event()
            .with(eq(record.job_id))
            .times(1)
            .returning(move |_| Ok(started(event_id, RemoteEventState::AwaitingMedia)));
        api.expect_upload_media()
            .times(1)
            .returning(|_, data, content_type| {
                assert_eq!(&data[..], b"jpeg");
                assert_eq!(content_type, "image/jpeg");
                Ok(())
            });
        api.expect_finalize_event()
            .times(1)
            .returning(|event_id, snapshot_ref| {
                assert_eq!(snapshot_ref, "snapshots/2024-01-01/doorcam-01/e.jpg");
                Ok(FinalizeEventResponse {
                    event_id,
                    state: RemoteEventState::Finalized,
                    snapshot_ref: Some(snapshot_ref.to_string()),
                })
            });

        let client = UploadClient::new(spool.clone(), Arc::new(api), 2);
        let outcomes = client.drain_once().await.unwrap();

        assert_eq!(outcomes, vec![DeliveryOutcome::Delivered { event_id }]);
        assert_eq!(spool.get(record.job_id).unwrap().status, JobStatus::Done);
        assert_eq!(client.stats().delivered, 1);
        assert_eq!(client.stats().bytes_uploaded, 4);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let record = enqueue(&spool);

        let mut api = MockEventApi::new();
        api.expect_start_event()
            .times(1)
            .returning(|_| Err(DeliveryError::Transient("connection refused".to_string())));

        let client = UploadClient::new(spool.clone(), Arc::new(api), 1);
        let outcomes = client.drain_once().await.unwrap();

        assert_eq!(outcomes, vec![DeliveryOutcome::Retrying { attempts: 1 }]);
        let stored = spool.get(record.job_id).unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.last_error.as_deref(), Some("connection refused"));
        assert!(stored.next_attempt_at > Utc::now());
    }

    #[tokio::test]
    async fn test_finalize_conflict_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let record = enqueue(&spool);
        let event_id = Uuid::new_v4();

        let mut api = MockEventApi::new();
        api.expect_start_event()
            .returning(move |_| Ok(started(event_id, RemoteEventState::AwaitingMedia)));
        api.expect_upload_media().returning(|_, _, _| Ok(()));
        api.expect_finalize_event()
            .returning(|_, _| Err(DeliveryError::Conflict("different snapshot".to_string())));

        let client = UploadClient::new(spool.clone(), Arc::new(api), 1);
        let outcomes = client.drain_once().await.unwrap();

        assert!(matches!(outcomes[0], DeliveryOutcome::DeadLettered { .. }));
        assert_eq!(spool.dead_letters()[0].job_id, record.job_id);
    }

    #[tokio::test]
    async fn test_replay_of_finalized_event_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let record = enqueue(&spool);
        let event_id = Uuid::new_v4();

        let mut api = MockEventApi::new();
        api.expect_start_event()
            .returning(move |_| Ok(started(event_id, RemoteEventState::Finalized)));
        api.expect_upload_media().never();
        api.expect_finalize_event().never();

        let client = UploadClient::new(spool.clone(), Arc::new(api), 1);
        let outcomes = client.drain_once().await.unwrap();

        assert_eq!(outcomes, vec![DeliveryOutcome::AlreadyFinalized { event_id }]);
        assert_eq!(spool.get(record.job_id).unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_expired_event_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        enqueue(&spool);

        let mut api = MockEventApi::new();
        api.expect_start_event()
            .returning(|_| Ok(started(Uuid::new_v4(), RemoteEventState::Expired)));
        api.expect_upload_media().never();

        let client = UploadClient::new(spool.clone(), Arc::new(api), 1);
        let outcomes = client.drain_once().await.unwrap();

        assert!(matches!(outcomes[0], DeliveryOutcome::DeadLettered { .. }));
        assert_eq!(client.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let record = enqueue(&spool);

        let mut api = MockEventApi::new();
        api.expect_start_event()
            .returning(|_| Err(DeliveryError::Transient("503".to_string())));
        let client = UploadClient::new(spool.clone(), Arc::new(api), 1);

        // max_attempts = 2: the third failure is fatal
        for expected in [1, 2] {
            let leased = spool.lease(Utc::now() + chrono::Duration::hours(1)).unwrap().unwrap();
            let outcome = client.process(leased).await.unwrap();
            assert_eq!(outcome, DeliveryOutcome::Retrying { attempts: expected });
        }
        let leased = spool.lease(Utc::now() + chrono::Duration::hours(2)).unwrap().unwrap();
        let outcome = client.process(leased).await.unwrap();

        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { .. }));
        assert_eq!(spool.get(record.job_id).unwrap().status, JobStatus::Dead);
    }

    #[tokio::test]
    async fn test_concurrent_drain_delivers_each_job_once() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        for _ in 0..5 {
            enqueue(&spool);
        }

        let mut api = MockEventApi::new();
        api.expect_start_event()
            .times(5)
            .returning(|_| Ok(started(Uuid::new_v4(), RemoteEventState::AwaitingMedia)));
        api.expect_upload_media().times(5).returning(|_, _, _| Ok(()));
        api.expect_finalize_event().times(5).returning(|event_id, key| {
            Ok(FinalizeEventResponse {
                event_id,
                state: RemoteEventState::Finalized,
                snapshot_ref: Some(key.to_string()),
            })
        });

        let client = UploadClient::new(spool.clone(), Arc::new(api), 3);
        let outcomes = client.drain_once().await.unwrap();

        assert_eq!(outcomes.len(), 5);
        assert_eq!(spool.stats().done, 5);
    }
}
