//! Durable local spool of upload jobs.
//!
//! Every captured event becomes one [`SpoolRecord`] persisted as
//! `<root>/jobs/<job_id>.json`, with its media under
//! `<root>/media/<job_id>/`. Records are rewritten through a temp file and an
//! atomic rename, so a crash leaves either the old or the new version on disk.
//!
//! The in-memory index is the single writer; all transitions go through the
//! methods below while holding its lock.

use crate::config::SpoolConfig;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors raised by the spool.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("Spool I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Spool record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Spool job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {job_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Spool worker thread failed: {0}")]
    Worker(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SpoolError + '_ {
    move |source| SpoolError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Lifecycle of a spooled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Uploading,
    Done,
    Dead,
}

/// One captured event awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolRecord {
    /// Idempotency key sent to the backend; never changes
    pub job_id: Uuid,
    pub device_id: String,
    /// Media files in capture order
    pub media_paths: Vec<PathBuf>,
    pub captured_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A media artifact handed over by the capture controller.
#[derive(Debug, Clone)]
pub struct MediaArtifact {
    pub data: Bytes,
    /// File extension (e.g. "jpg")
    pub extension: String,
}

/// A new capture to enqueue.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub device_id: String,
    pub captured_at: DateTime<Utc>,
    pub media: Vec<MediaArtifact>,
}

/// Retry schedule for failed deliveries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failures tolerated; the job is dead once `attempt_count` exceeds this
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Un-jittered delay after `failures` previous failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl From<&SpoolConfig> for RetryPolicy {
    fn from(config: &SpoolConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: config.backoff_base(),
            cap: config.backoff_cap(),
            jitter_ratio: config.jitter_ratio,
        }
    }
}

/// Randomisation applied to retry delays.
pub trait BackoffJitter: Send + Sync {
    fn jittered_delay(&self, delay: Duration, ratio: f64) -> Duration;
}

/// Uniform jitter within `delay * (1 ± ratio)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl BackoffJitter for RandomJitter {
    fn jittered_delay(&self, delay: Duration, ratio: f64) -> Duration {
        if ratio <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
        delay.mul_f64(factor.max(0.0))
    }
}

/// No jitter; used where schedules must be exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl BackoffJitter for NoJitter {
    fn jittered_delay(&self, delay: Duration, _ratio: f64) -> Duration {
        delay
    }
}

/// Counts of records by status.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpoolStats {
    pub pending: usize,
    pub uploading: usize,
    pub done: usize,
    pub dead: usize,
}

impl SpoolStats {
    /// Jobs not yet delivered or dead-lettered.
    pub fn depth(&self) -> usize {
        self.pending + self.uploading
    }
}

/// Durable, crash-recoverable job queue.
pub struct Spool {
    root: PathBuf,
    policy: RetryPolicy,
    lease_timeout: chrono::Duration,
    jitter: Box<dyn BackoffJitter>,
    records: Mutex<BTreeMap<Uuid, SpoolRecord>>,
}

impl Spool {
    /// Open (or create) a spool at `root` with random jitter.
    pub fn open(
        root: impl Into<PathBuf>,
        policy: RetryPolicy,
        lease_timeout: Duration,
    ) -> Result<Self, SpoolError> {
        Self::open_with_jitter(root, policy, lease_timeout, Box::new(RandomJitter))
    }

    /// Open a spool, recovering any state left by a previous process.
    ///
    /// Records found in UPLOADING are reset to PENDING: the lease they held
    /// belonged to a process that no longer exists.
    pub fn open_with_jitter(
        root: impl Into<PathBuf>,
        policy: RetryPolicy,
        lease_timeout: Duration,
        jitter: Box<dyn BackoffJitter>,
    ) -> Result<Self, SpoolError> {
        let root = root.into();
        let jobs_dir = root.join("jobs");
        fs::create_dir_all(&jobs_dir).map_err(io_err(&jobs_dir))?;
        let media_dir = root.join("media");
        fs::create_dir_all(&media_dir).map_err(io_err(&media_dir))?;

        let spool = Self {
            root,
            policy,
            lease_timeout: chrono::Duration::from_std(lease_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
            jitter,
            records: Mutex::new(BTreeMap::new()),
        };

        let recovered = spool.recover()?;
        let stats = spool.stats();
        info!(
            root = %spool.root.display(),
            pending = stats.pending,
            done = stats.done,
            dead = stats.dead,
            recovered,
            "Spool opened"
        );

        Ok(spool)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist a new PENDING job and its media.
    #[instrument(skip(self, capture), fields(device_id = %capture.device_id, media = capture.media.len()))]
    pub fn enqueue(&self, capture: NewCapture) -> Result<SpoolRecord, SpoolError> {
        let job_id = Uuid::new_v4();
        let media_dir = self.root.join("media").join(job_id.to_string());
        fs::create_dir_all(&media_dir).map_err(io_err(&media_dir))?;

        let mut media_paths = Vec::with_capacity(capture.media.len());
        for (index, artifact) in capture.media.iter().enumerate() {
            let path = media_dir.join(format!("{}.{}", index, artifact.extension));
            write_durably(&path, &artifact.data)?;
            media_paths.push(path);
        }

        let now = Utc::now();
        let record = SpoolRecord {
            job_id,
            device_id: capture.device_id,
            media_paths,
            captured_at: capture.captured_at,
            created_at: now,
            attempt_count: 0,
            next_attempt_at: now,
            status: JobStatus::Pending,
            lease_expires_at: None,
            last_error: None,
            finished_at: None,
        };

        let mut records = self.records.lock();
        self.persist(&record)?;
        records.insert(job_id, record.clone());

        info!(job_id = %job_id, "Job enqueued");
        Ok(record)
    }

    /// Lease the earliest eligible job, marking it UPLOADING.
    ///
    /// Eligible: PENDING with `next_attempt_at <= now`, or UPLOADING whose
    /// lease has expired.
    pub fn lease(&self, now: DateTime<Utc>) -> Result<Option<SpoolRecord>, SpoolError> {
        let mut records = self.records.lock();

        let candidate = records
            .values()
            .filter(|r| match r.status {
                JobStatus::Pending => r.next_attempt_at <= now,
                JobStatus::Uploading => r.lease_expires_at.map_or(true, |exp| exp <= now),
                JobStatus::Done | JobStatus::Dead => false,
            })
            .min_by_key(|r| (r.next_attempt_at, r.created_at))
            .map(|r| r.job_id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let mut leased = records[&job_id].clone();
        if leased.status == JobStatus::Uploading {
            warn!(job_id = %job_id, "Re-leasing job with expired lease");
        }
        leased.status = JobStatus::Uploading;
        leased.lease_expires_at = Some(now + self.lease_timeout);

        self.persist(&leased)?;
        records.insert(job_id, leased.clone());

        debug!(job_id = %job_id, attempt = leased.attempt_count, "Job leased");
        Ok(Some(leased))
    }

    /// Mark a leased job delivered.
    pub fn complete(&self, job_id: Uuid) -> Result<SpoolRecord, SpoolError> {
        self.transition(job_id, JobStatus::Done, |record| {
            record.status = JobStatus::Done;
            record.lease_expires_at = None;
            record.finished_at = Some(Utc::now());
        })
    }

    /// Record a failed attempt and schedule the retry, or dead-letter the
    /// job once its failures exceed the policy.
    pub fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<SpoolRecord, SpoolError> {
        let max_attempts = self.policy.max_attempts;

        let record = self.transition(job_id, JobStatus::Pending, |record| {
            let delay = self.policy.delay_for(record.attempt_count);
            let jittered = self.jitter.jittered_delay(delay, self.policy.jitter_ratio);
            let jittered = chrono::Duration::from_std(jittered).unwrap_or(chrono::Duration::MAX);

            record.attempt_count += 1;
            record.last_error = Some(error.to_string());
            record.lease_expires_at = None;

            if record.attempt_count > max_attempts {
                record.status = JobStatus::Dead;
                record.finished_at = Some(now);
                return;
            }

            let floor = now + chrono::Duration::milliseconds(1);
            let scheduled = now.checked_add_signed(jittered).unwrap_or(DateTime::<Utc>::MAX_UTC);
            record.next_attempt_at = scheduled.max(floor).max(record.next_attempt_at);
            record.status = JobStatus::Pending;
        })?;

        match record.status {
            JobStatus::Dead => error!(
                job_id = %job_id,
                attempts = record.attempt_count,
                error = %error,
                "Job dead-lettered after exhausting retries"
            ),
            _ => warn!(
                job_id = %job_id,
                attempts = record.attempt_count,
                next_attempt_at = %record.next_attempt_at,
                error = %error,
                "Delivery failed, retry scheduled"
            ),
        }

        Ok(record)
    }

    /// Move a job straight to DEAD after a permanent failure.
    pub fn dead_letter(&self, job_id: Uuid, error: &str) -> Result<SpoolRecord, SpoolError> {
        let record = self.transition(job_id, JobStatus::Dead, |record| {
            record.status = JobStatus::Dead;
            record.lease_expires_at = None;
            record.last_error = Some(error.to_string());
            record.finished_at = Some(Utc::now());
        })?;

        error!(job_id = %job_id, error = %error, "Job dead-lettered");
        Ok(record)
    }

    /// Delete DONE jobs finished more than `retention` ago. Returns how many
    /// were purged.
    pub fn purge_done(&self, retention: Duration, now: DateTime<Utc>) -> Result<usize, SpoolError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut records = self.records.lock();
        let expired: Vec<Uuid> = records
            .values()
            .filter(|r| r.status == JobStatus::Done && r.finished_at.map_or(false, |t| t <= cutoff))
            .map(|r| r.job_id)
            .collect();

        for job_id in &expired {
            self.delete_files(*job_id)?;
            records.remove(job_id);
        }

        if !expired.is_empty() {
            info!(purged = expired.len(), "Purged delivered jobs");
        }
        Ok(expired.len())
    }

    /// Operator removal of a dead-lettered job.
    pub fn remove(&self, job_id: Uuid) -> Result<(), SpoolError> {
        let mut records = self.records.lock();
        let record = records.get(&job_id).ok_or(SpoolError::NotFound(job_id))?;
        if record.status != JobStatus::Dead {
            return Err(SpoolError::InvalidTransition {
                job_id,
                from: record.status,
                to: JobStatus::Dead,
            });
        }

        self.delete_files(job_id)?;
        records.remove(&job_id);
        info!(job_id = %job_id, "Dead-lettered job removed");
        Ok(())
    }

    pub fn get(&self, job_id: Uuid) -> Option<SpoolRecord> {
        self.records.lock().get(&job_id).cloned()
    }

    /// All dead-lettered jobs, oldest first.
    pub fn dead_letters(&self) -> Vec<SpoolRecord> {
        let mut dead: Vec<SpoolRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.status == JobStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by_key(|r| r.created_at);
        dead
    }

    pub fn stats(&self) -> SpoolStats {
        let records = self.records.lock();
        let mut stats = SpoolStats::default();
        for record in records.values() {
            match record.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Uploading => stats.uploading += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Dead => stats.dead += 1,
            }
        }
        stats
    }

    /// Apply `mutate` to a leased job and persist it. Only UPLOADING jobs
    /// may be completed, failed or dead-lettered.
    fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        mutate: impl FnOnce(&mut SpoolRecord),
    ) -> Result<SpoolRecord, SpoolError> {
        let mut records = self.records.lock();
        let current = records.get(&job_id).ok_or(SpoolError::NotFound(job_id))?;
        if current.status != JobStatus::Uploading {
            return Err(SpoolError::InvalidTransition {
                job_id,
                from: current.status,
                to,
            });
        }

        let mut updated = current.clone();
        mutate(&mut updated);
        self.persist(&updated)?;
        records.insert(job_id, updated.clone());
        Ok(updated)
    }

    fn recover(&self) -> Result<usize, SpoolError> {
        let jobs_dir = self.root.join("jobs");
        let entries = fs::read_dir(&jobs_dir).map_err(io_err(&jobs_dir))?;

        let mut records = self.records.lock();
        let mut recovered = 0;

        for entry in entries {
            let path = entry.map_err(io_err(&jobs_dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                // Leftover temp file from an interrupted write
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    let _ = fs::remove_file(&path);
                }
                continue;
            }

            let raw = fs::read(&path).map_err(io_err(&path))?;
            let mut record: SpoolRecord = match serde_json::from_slice(&raw) {
                Ok(record) => record,
                Err(e) => {
                    let quarantine = path.with_extension("corrupt");
                    warn!(path = %path.display(), error = %e, "Unreadable spool record quarantined");
                    fs::rename(&path, &quarantine).map_err(io_err(&path))?;
                    continue;
                }
            };

            if record.status == JobStatus::Uploading {
                record.status = JobStatus::Pending;
                record.lease_expires_at = None;
                self.persist(&record)?;
                recovered += 1;
                info!(job_id = %record.job_id, "Recovered interrupted upload");
            }

            records.insert(record.job_id, record);
        }

        Ok(recovered)
    }

    fn record_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join("jobs").join(format!("{}.json", job_id))
    }

    fn persist(&self, record: &SpoolRecord) -> Result<(), SpoolError> {
        let body = serde_json::to_vec_pretty(record)?;
        write_durably(&self.record_path(record.job_id), &body)
    }

    fn delete_files(&self, job_id: Uuid) -> Result<(), SpoolError> {
        let media_dir = self.root.join("media").join(job_id.to_string());
        match fs::remove_dir_all(&media_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&media_dir)(e)),
        }

        let path = self.record_path(job_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}

// Async entry points for callers on the runtime. Disk writes and fsync run
// on the blocking pool.
impl Spool {
    pub async fn enqueue_async(
        self: &Arc<Self>,
        capture: NewCapture,
    ) -> Result<SpoolRecord, SpoolError> {
        let spool = Arc::clone(self);
        run_blocking(move || spool.enqueue(capture)).await
    }

    pub async fn lease_async(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Result<Option<SpoolRecord>, SpoolError> {
        let spool = Arc::clone(self);
        run_blocking(move || spool.lease(now)).await
    }

    pub async fn complete_async(self: &Arc<Self>, job_id: Uuid) -> Result<SpoolRecord, SpoolError> {
        let spool = Arc::clone(self);
        run_blocking(move || spool.complete(job_id)).await
    }

    pub async fn fail_async(
        self: &Arc<Self>,
        job_id: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<SpoolRecord, SpoolError> {
        let spool = Arc::clone(self);
        run_blocking(move || spool.fail(job_id, &error, now)).await
    }

    pub async fn dead_letter_async(
        self: &Arc<Self>,
        job_id: Uuid,
        error: String,
    ) -> Result<SpoolRecord, SpoolError> {
        let spool = Arc::clone(self);
        run_blocking(move || spool.dead_letter(job_id, &error)).await
    }

    pub async fn purge_done_async(
        self: &Arc<Self>,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, SpoolError> {
        let spool = Arc::clone(self);
        run_blocking(move || spool.purge_done(retention, now)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, SpoolError>
where
    F: FnOnce() -> Result<T, SpoolError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SpoolError::Worker(e.to_string()))?
}

/// Write `data` to `path` via a synced temp file and rename.
fn write_durably(path: &Path, data: &[u8]) -> Result<(), SpoolError> {
    let tmp = path.with_extension("tmp");

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)
        .map_err(io_err(&tmp))?;
    file.write_all(data).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err(path))?;

    if let Some(parent) = path.parent() {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(io_err(parent))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_ratio: 0.0,
        }
    }

    fn open(dir: &Path) -> Spool {
        Spool::open_with_jitter(dir, policy(), Duration::from_secs(60), Box::new(NoJitter)).unwrap()
    }

    fn capture() -> NewCapture {
        NewCapture {
            device_id: "doorcam-01".to_string(),
            captured_at: Utc::now(),
            media: vec![MediaArtifact {
                data: Bytes::from_static(b"jpeg"),
                extension: "jpg".to_string(),
            }],
        }
    }

    #[test]
    fn test_enqueue_persists_record_and_media() {
        let dir = tempfile::tempdir().unwrap();
        let spool = open(dir.path());

        let record = spool.enqueue(capture()).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(fs::read(&record.media_paths[0]).unwrap(), b"jpeg");
        assert!(dir
            .path()
            .join("jobs")
            .join(format!("{}.json", record.job_id))
            .exists());
    }

    #[tokio::test]
    async fn test_async_operations_persist() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(open(dir.path()));

        let first = spool.enqueue_async(capture()).await.unwrap();
        let second = spool.enqueue_async(capture()).await.unwrap();

        let leased = spool.lease_async(Utc::now()).await.unwrap().unwrap();
        assert_eq!(leased.job_id, first.job_id);
        spool.complete_async(first.job_id).await.unwrap();

        let leased = spool.lease_async(Utc::now()).await.unwrap().unwrap();
        assert_eq!(leased.job_id, second.job_id);
        let failed = spool
            .fail_async(second.job_id, "timeout".to_string(), Utc::now())
            .await
            .unwrap();
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.status, JobStatus::Pending);
        drop(spool);

        let reopened = open(dir.path());
        assert_eq!(reopened.get(first.job_id).unwrap().status, JobStatus::Done);
        assert_eq!(reopened.get(second.job_id).unwrap().attempt_count, 1);
    }

    #[test]
    fn test_lease_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let spool = open(dir.path());
        let record = spool.enqueue(capture()).unwrap();

        let now = Utc::now();
        let leased = spool.lease(now).unwrap().unwrap();
        assert_eq!(leased.job_id, record.job_id);
        assert_eq!(leased.status, JobStatus::Uploading);
        assert!(spool.lease(now).unwrap().is_none());
    }

    #[test]
    fn test_lease_picks_earliest_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let spool = open(dir.path());
        let first = spool.enqueue(capture()).unwrap();
        let second = spool.enqueue(capture()).unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        let leased = spool.lease(now).unwrap().unwrap();
        assert_eq!(leased.job_id, first.job_id);
        spool.fail(first.job_id, "timeout", now).unwrap();

        // The failed job is backed off, so the second one comes next
        assert_eq!(spool.lease(now).unwrap().unwrap().job_id, second.job_id);
        assert!(spool.lease(now).unwrap().is_none());
    }

    #[test]
    fn test_expired_lease_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let spool = open(dir.path());
        spool.enqueue(capture()).unwrap();

        let now = Utc::now();
        spool.lease(now).unwrap().unwrap();
        assert!(spool
            .lease(now + chrono::Duration::seconds(59))
            .unwrap()
            .is_none());
        assert!(spool
            .lease(now + chrono::Duration::seconds(60))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_fail_backs_off_monotonically_then_dies() {
        let dir = tempfile::tempdir().unwrap();
        let spool = open(dir.path());
        let job_id = spool.enqueue(capture()).unwrap().job_id;

        let mut now = Utc::now();
        let mut last_attempts = 0;
        let mut last_next = now;
        let mut delays = Vec::new();

        for _ in 0..3 {
            spool.lease(now).unwrap().unwrap();
            let record = spool.fail(job_id, "connection refused", now).unwrap();

            assert_eq!(record.status, JobStatus::Pending);
            assert!(record.attempt_count > last_attempts);
            assert!(record.next_attempt_at > now);
            assert!(record.next_attempt_at >= last_next);
            delays.push((record.next_attempt_at - now).num_seconds());

            last_attempts = record.attempt_count;
            last_next = record.next_attempt_at;
            now = record.next_attempt_at;
        }
        assert_eq!(delays, vec![1, 2, 4]);

        spool.lease(now).unwrap().unwrap();
        let record = spool.fail(job_id, "connection refused", now).unwrap();
        assert_eq!(record.attempt_count, 4);
        assert_eq!(record.status, JobStatus::Dead);
        assert_eq!(spool.dead_letters().len(), 1);
        assert!(spool.lease(now + chrono::Duration::days(1)).unwrap().is_none());
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_random_jitter_stays_in_band() {
        let jitter = RandomJitter;
        for _ in 0..100 {
            let d = jitter.jittered_delay(Duration::from_secs(10), 0.2);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12));
        }
    }

    #[test]
    fn test_crash_recovery_resets_uploading_once() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = {
            let spool = open(dir.path());
            let job_id = spool.enqueue(capture()).unwrap().job_id;
            spool.lease(Utc::now()).unwrap().unwrap();
            job_id
        };

        let spool = open(dir.path());
        let record = spool.get(job_id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.lease_expires_at, None);

        let now = Utc::now();
        assert_eq!(spool.lease(now).unwrap().unwrap().job_id, job_id);
        assert!(spool.lease(now).unwrap().is_none());
    }

    #[test]
    fn test_complete_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let spool = open(dir.path());
        let record = spool.enqueue(capture()).unwrap();

        spool.lease(Utc::now()).unwrap().unwrap();
        let done = spool.complete(record.job_id).unwrap();
        assert_eq!(done.status, JobStatus::Done);

        let finished = done.finished_at.unwrap();
        assert_eq!(spool.purge_done(Duration::from_secs(60), finished).unwrap(), 0);
        assert_eq!(
            spool
                .purge_done(Duration::from_secs(60), finished + chrono::Duration::seconds(61))
                .unwrap(),
            1
        );
        assert!(spool.get(record.job_id).is_none());
        assert!(!record.media_paths[0].exists());
    }

    #[test]
    fn test_complete_requires_lease() {
        let dir = tempfile::tempdir().unwrap();
        let spool = open(dir.path());
        let record = spool.enqueue(capture()).unwrap();

        assert!(matches!(
            spool.complete(record.job_id),
            Err(SpoolError::InvalidTransition { .. })
        ));
        assert!(matches!(
            spool.complete(Uuid::new_v4()),
            Err(SpoolError::NotFound(_))
        ));
    }

    #[test]
    fn test_dead_letter_survives_restart_until_removed() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = {
            let spool = open(dir.path());
            let job_id = spool.enqueue(capture()).unwrap().job_id;
            spool.lease(Utc::now()).unwrap().unwrap();
            spool.dead_letter(job_id, "event expired").unwrap();
            job_id
        };

        let spool = open(dir.path());
        let dead = spool.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("event expired"));

        spool.remove(job_id).unwrap();
        assert!(spool.dead_letters().is_empty());
        assert!(spool.get(job_id).is_none());
    }

    #[test]
    fn test_corrupt_record_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        open(dir.path());
        let bad = dir.path().join("jobs").join("garbage.json");
        fs::write(&bad, b"{not json").unwrap();

        let spool = open(dir.path());
        assert_eq!(spool.stats(), SpoolStats::default());
        assert!(dir.path().join("jobs").join("garbage.corrupt").exists());
    }
}
