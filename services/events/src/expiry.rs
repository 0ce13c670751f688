//! Expiry sweep: events that never received a finalize before their deadline
//! move to EXPIRED.

use crate::config::Config;
use crate::object_storage::ObjectStorage;
use crate::scheduler::RecurringTask;
use crate::store::{EventStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ExpirySweeper {
    store: Arc<dyn EventStore>,
    storage: Arc<dyn ObjectStorage>,
    batch_size: i64,
    delete_orphaned_media: bool,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn EventStore>,
        storage: Arc<dyn ObjectStorage>,
        batch_size: i64,
        delete_orphaned_media: bool,
    ) -> Self {
        Self {
            store,
            storage,
            batch_size: batch_size.max(1),
            delete_orphaned_media,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn EventStore>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self::new(
            store,
            storage,
            config.lifecycle.sweep_batch_size,
            config.lifecycle.delete_orphaned_media,
        )
    }

    /// Expire every overdue event, one batch at a time. Returns how many
    /// events this call expired.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut total = 0;

        loop {
            let expired = self.store.expire_overdue(now, self.batch_size).await?;
            let count = expired.len();
            total += count;

            for event in &expired {
                info!(
                    event_id = %event.event_id,
                    device_id = %event.device_id,
                    deadline = %event.finalize_deadline,
                    "Event expired without finalize"
                );

                // Media may or may not have been uploaded; deleting is best-effort.
                if self.delete_orphaned_media {
                    if let Err(e) = self.storage.delete_object(&event.object_key).await {
                        warn!(event_id = %event.event_id, error = %e, "Orphan cleanup failed");
                    }
                }
            }

            if (count as i64) < self.batch_size {
                break;
            }
        }

        if total > 0 {
            metrics::counter!("events.expired").increment(total as u64);
        } else {
            debug!("No overdue events");
        }

        Ok(total)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        RecurringTask::new("expiry-sweep", interval, cancel).spawn(move || {
            let sweeper = self.clone();
            async move { sweeper.sweep_once(Utc::now()).await.map(|_| ()) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_api_key;
    use crate::lifecycle::{EventLifecycle, LifecycleError, LifecycleSettings};
    use crate::models::EventState;
    use crate::object_storage::MemoryObjectStorage;
    use crate::store::memory::InMemoryEventStore;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<InMemoryEventStore>,
        storage: Arc<MemoryObjectStorage>,
        lifecycle: EventLifecycle,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .upsert_device("doorcam-01", None, &hash_api_key("key"))
            .await
            .unwrap();
        let storage = Arc::new(MemoryObjectStorage::new("media"));
        let lifecycle = EventLifecycle::new(
            store.clone(),
            storage.clone(),
            LifecycleSettings {
                finalize_deadline: Duration::from_secs(60),
                write_url_expiry: Duration::from_secs(900),
                read_url_expiry: Duration::from_secs(3600),
            },
        );
        Fixture {
            store,
            storage,
            lifecycle,
        }
    }

    #[tokio::test]
    async fn test_sweep_expires_only_overdue_events() {
        let f = fixture().await;
        let overdue = f.lifecycle.start(Uuid::new_v4(), "doorcam-01", "key").await.unwrap();
        let fresh = f.lifecycle.start(Uuid::new_v4(), "doorcam-01", "key").await.unwrap();
        f.store.set_finalize_deadline(
            overdue.event.event_id,
            Utc::now() - chrono::Duration::seconds(1),
        );

        let sweeper = ExpirySweeper::new(f.store.clone(), f.storage.clone(), 10, false);
        assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap(), 1);
        assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap(), 0);

        let expired = f.lifecycle.get_event(overdue.event.event_id).await.unwrap();
        assert_eq!(expired.event.state, EventState::Expired);
        let open = f.lifecycle.get_event(fresh.event.event_id).await.unwrap();
        assert_eq!(open.event.state, EventState::AwaitingMedia);

        assert!(matches!(
            f.lifecycle
                .finalize(overdue.event.event_id, "key", &overdue.event.object_key)
                .await,
            Err(LifecycleError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_skips_finalized_events() {
        let f = fixture().await;
        let started = f.lifecycle.start(Uuid::new_v4(), "doorcam-01", "key").await.unwrap();
        f.lifecycle
            .finalize(started.event.event_id, "key", &started.event.object_key)
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(f.store.clone(), f.storage.clone(), 10, false);
        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(sweeper.sweep_once(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_drains_in_batches() {
        let f = fixture().await;
        for _ in 0..5 {
            f.lifecycle.start(Uuid::new_v4(), "doorcam-01", "key").await.unwrap();
        }

        let sweeper = ExpirySweeper::new(f.store.clone(), f.storage.clone(), 2, false);
        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(sweeper.sweep_once(later).await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_finalize_racing_sweep_settles_once() {
        let f = fixture().await;
        let lifecycle = Arc::new(f.lifecycle);
        let sweeper = Arc::new(ExpirySweeper::new(
            f.store.clone(),
            f.storage.clone(),
            10,
            false,
        ));

        for _ in 0..50 {
            let started = lifecycle.start(Uuid::new_v4(), "doorcam-01", "key").await.unwrap();
            let event_id = started.event.event_id;
            let object_key = started.event.object_key.clone();
            let jobs_before = f.store.inference_jobs().len();

            let finalize = tokio::spawn({
                let lifecycle = lifecycle.clone();
                async move { lifecycle.finalize(event_id, "key", &object_key).await }
            });
            let sweep = tokio::spawn({
                let sweeper = sweeper.clone();
                async move {
                    sweeper
                        .sweep_once(Utc::now() + chrono::Duration::minutes(5))
                        .await
                }
            });
            let (finalized, swept) = tokio::join!(finalize, sweep);
            let finalized = finalized.unwrap();
            let swept = swept.unwrap().unwrap();

            let state = lifecycle.get_event(event_id).await.unwrap().event.state;
            let new_jobs = f.store.inference_jobs().len() - jobs_before;
            match state {
                EventState::Finalized => {
                    assert!(finalized.is_ok());
                    assert_eq!(swept, 0);
                    assert_eq!(new_jobs, 1);
                }
                EventState::Expired => {
                    assert!(matches!(finalized, Err(LifecycleError::Expired(id)) if id == event_id));
                    assert_eq!(swept, 1);
                    assert_eq!(new_jobs, 0);
                }
                other => panic!("event left in {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_orphaned_media_deleted_when_enabled() {
        let f = fixture().await;
        let started = f.lifecycle.start(Uuid::new_v4(), "doorcam-01", "key").await.unwrap();
        f.storage.put(&started.event.object_key, b"partial".to_vec());

        let sweeper = ExpirySweeper::new(f.store.clone(), f.storage.clone(), 10, true);
        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(sweeper.sweep_once(later).await.unwrap(), 1);
        assert!(f.storage.get(&started.event.object_key).is_none());
    }
}
