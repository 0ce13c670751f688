//! Inference dispatch.
//!
//! Finalize writes an inference job in the same transaction that finalizes
//! the event. This worker claims queued jobs, hands the snapshot to the
//! detector and writes the detections back. Delivery is at-least-once;
//! detection rows are keyed by (event, run, ordinal) so a repeated run
//! writes nothing new.

use crate::config::InferenceConfig;
use crate::models::{Detection, InferenceJob, InferenceJobState};
use crate::object_storage::ObjectStorage;
use crate::scheduler::RecurringTask;
use crate::store::{EventStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Detector request failed: {0}")]
    Request(String),

    #[error("Detector returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid detector response: {0}")]
    Decode(String),
}

/// Payload sent to the detector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRequest {
    pub event_id: Uuid,
    pub run_id: Uuid,
    pub media_url: String,
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, request: &DetectionRequest) -> Result<Vec<Detection>, DetectorError>;
}

/// Detector reached over HTTP.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
}

impl HttpDetector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    #[instrument(skip(self, request), fields(event_id = %request.event_id))]
    async fn detect(&self, request: &DetectionRequest) -> Result<Vec<Detection>, DetectorError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| DetectorError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Status {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }

        let parsed: DetectionResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::Decode(e.to_string()))?;
        Ok(parsed.detections)
    }
}

#[cfg(any(test, feature = "test-support"))]
/// Detector that answers every request with the same detections.
pub struct StaticDetector {
    detections: Vec<Detection>,
}

#[cfg(any(test, feature = "test-support"))]
impl StaticDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl Detector for StaticDetector {
    async fn detect(&self, _request: &DetectionRequest) -> Result<Vec<Detection>, DetectorError> {
        Ok(self.detections.clone())
    }
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub batch_size: i64,
    pub max_attempts: i32,
    /// A RUNNING job untouched for this long is claimed again
    pub stale_after: Duration,
    pub media_url_expiry: Duration,
}

impl InferenceSettings {
    pub fn from_config(config: &InferenceConfig, media_url_expiry: Duration) -> Self {
        Self {
            batch_size: config.batch_size,
            max_attempts: config.max_attempts,
            stale_after: Duration::from_secs(config.stale_after_secs),
            media_url_expiry,
        }
    }
}

pub struct InferenceWorker {
    store: Arc<dyn EventStore>,
    storage: Arc<dyn ObjectStorage>,
    detector: Arc<dyn Detector>,
    settings: InferenceSettings,
}

impl InferenceWorker {
    pub fn new(
        store: Arc<dyn EventStore>,
        storage: Arc<dyn ObjectStorage>,
        detector: Arc<dyn Detector>,
        settings: InferenceSettings,
    ) -> Self {
        Self {
            store,
            storage,
            detector,
            settings,
        }
    }

    /// Claim one batch of jobs and run them. Returns how many completed.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.settings.stale_after)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let jobs = self
            .store
            .claim_inference_jobs(self.settings.batch_size, stale_before)
            .await?;

        if jobs.is_empty() {
            return Ok(0);
        }
        debug!(count = jobs.len(), "Claimed inference jobs");

        let concurrency = jobs.len();
        let results: Vec<Result<bool, StoreError>> = stream::iter(jobs)
            .map(|job| self.run_job(job))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut completed = 0;
        for result in results {
            if result? {
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Run one job; `Ok(false)` when the detector failed and the job was
    /// requeued or given up.
    async fn run_job(&self, job: InferenceJob) -> Result<bool, StoreError> {
        match self.detect(&job).await {
            Ok(detections) => {
                let written = self
                    .store
                    .complete_inference_job(job.job_id, &detections)
                    .await?;
                metrics::counter!("inference.jobs.completed").increment(1);
                metrics::counter!("inference.detections.written").increment(written as u64);
                info!(
                    event_id = %job.event_id,
                    run_id = %job.job_id,
                    detections = detections.len(),
                    written,
                    "Inference job completed"
                );
                Ok(true)
            }
            Err(e) => {
                let state = self
                    .store
                    .fail_inference_job(job.job_id, &e.to_string(), self.settings.max_attempts)
                    .await?;
                if state == InferenceJobState::Failed {
                    error!(
                        event_id = %job.event_id,
                        attempts = job.attempts,
                        error = %e,
                        "Inference job failed permanently"
                    );
                } else {
                    warn!(
                        event_id = %job.event_id,
                        attempts = job.attempts,
                        error = %e,
                        "Inference job failed, requeued"
                    );
                }
                Ok(false)
            }
        }
    }

    async fn detect(&self, job: &InferenceJob) -> Result<Vec<Detection>, DetectorError> {
        let media = self
            .storage
            .presign_get(&job.snapshot_ref, self.settings.media_url_expiry)
            .await
            .map_err(|e| DetectorError::Request(e.to_string()))?;

        let request = DetectionRequest {
            event_id: job.event_id,
            run_id: job.job_id,
            media_url: media.url,
        };
        let detections = self.detector.detect(&request).await?;

        let (valid, invalid): (Vec<_>, Vec<_>) =
            detections.into_iter().partition(Detection::is_valid);
        if !invalid.is_empty() {
            warn!(
                event_id = %job.event_id,
                dropped = invalid.len(),
                "Dropped detections with confidence outside [0, 1]"
            );
        }
        Ok(valid)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        RecurringTask::new("inference-dispatch", interval, cancel).spawn(move || {
            let worker = self.clone();
            async move { worker.run_once().await.map(|_| ()) }
        })
    }
}
