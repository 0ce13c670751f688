//! Client for the backend event API.
//!
//! The [`EventApi`] trait is the seam the upload client talks through;
//! [`HttpEventApi`] is the production implementation over `reqwest`.
//! Every failure is classified so the caller knows whether to retry.

use crate::config::{DeviceConfig, UploadConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Delivery failures, by how the caller should react.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network trouble, timeouts, 5xx, 408 or 429: retry later
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// Rejected in a way retrying cannot fix
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    /// The backend holds different data for this event
    #[error("Idempotency conflict: {0}")]
    Conflict(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Event state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteEventState {
    Created,
    AwaitingMedia,
    Finalized,
    Expired,
}

/// Pre-authorised upload location for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTarget {
    pub url: String,
    pub object_key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct StartEventRequest<'a> {
    job_id: Uuid,
    device_id: &'a str,
}

/// Response to `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartEventResponse {
    pub event_id: Uuid,
    pub state: RemoteEventState,
    #[serde(default)]
    pub write_target: Option<WriteTarget>,
}

#[derive(Debug, Clone, Serialize)]
struct FinalizeEventRequest<'a> {
    snapshot_ref: &'a str,
}

/// Response to `finalize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeEventResponse {
    pub event_id: Uuid,
    pub state: RemoteEventState,
    #[serde(default)]
    pub snapshot_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

/// Operations the upload client needs from the backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventApi: Send + Sync {
    /// Open (or replay) the event for `job_id`.
    async fn start_event(&self, job_id: Uuid) -> Result<StartEventResponse, DeliveryError>;

    /// Upload media bytes to a write target.
    async fn upload_media(
        &self,
        target: &WriteTarget,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), DeliveryError>;

    /// Commit the uploaded media to the event.
    async fn finalize_event(
        &self,
        event_id: Uuid,
        snapshot_ref: &str,
    ) -> Result<FinalizeEventResponse, DeliveryError>;
}

/// `reqwest` implementation of [`EventApi`].
pub struct HttpEventApi {
    api: Client,
    uploads: Client,
    base_url: String,
    device_id: String,
    api_key: String,
}

impl HttpEventApi {
    /// Build the client. API calls and media uploads get separate timeouts.
    pub fn new(upload: &UploadConfig, device: &DeviceConfig) -> Result<Self, reqwest::Error> {
        let api = Client::builder()
            .timeout(upload.request_timeout())
            .build()?;
        let uploads = Client::builder()
            .timeout(upload.upload_timeout())
            .build()?;

        Ok(Self {
            api,
            uploads,
            base_url: upload.backend_url.trim_end_matches('/').to_string(),
            device_id: device.device_id.clone(),
            api_key: device.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl EventApi for HttpEventApi {
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    async fn start_event(&self, job_id: Uuid) -> Result<StartEventResponse, DeliveryError> {
        let response = self
            .api
            .post(self.url("/v1/events/start"))
            .bearer_auth(&self.api_key)
            .json(&StartEventRequest {
                job_id,
                device_id: &self.device_id,
            })
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }

        let parsed: StartEventResponse = serde_json::from_slice(&body)
            .map_err(|e| DeliveryError::Transient(format!("invalid start response: {}", e)))?;
        debug!(event_id = %parsed.event_id, state = ?parsed.state, "Event started");
        Ok(parsed)
    }

    #[instrument(skip(self, target, data), fields(object_key = %target.object_key, bytes = data.len()))]
    async fn upload_media(
        &self,
        target: &WriteTarget,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), DeliveryError> {
        let response = self
            .uploads
            .put(&target.url)
            .header(header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.bytes().await.unwrap_or_default();
        match status {
            // An expired or rejected signature is fixed by asking start again
            StatusCode::FORBIDDEN => Err(DeliveryError::Transient(format!(
                "write target rejected upload: {}",
                body_preview(&body)
            ))),
            _ => Err(map_status_error(status, &body)),
        }
    }

    #[instrument(skip(self))]
    async fn finalize_event(
        &self,
        event_id: Uuid,
        snapshot_ref: &str,
    ) -> Result<FinalizeEventResponse, DeliveryError> {
        let response = self
            .api
            .post(self.url(&format!("/v1/events/{}/finalize", event_id)))
            .bearer_auth(&self.api_key)
            .json(&FinalizeEventRequest { snapshot_ref })
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }

        serde_json::from_slice(&body)
            .map_err(|e| DeliveryError::Transient(format!("invalid finalize response: {}", e)))
    }
}

fn map_transport_error(error: reqwest::Error) -> DeliveryError {
    DeliveryError::Transient(error.to_string())
}

fn map_status_error(status: StatusCode, body: &[u8]) -> DeliveryError {
    let detail = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => format!("status {} {}: {}", status.as_u16(), parsed.code, parsed.error),
        Err(_) => format!("status {}: {}", status.as_u16(), body_preview(body)),
    };

    match status {
        StatusCode::CONFLICT => DeliveryError::Conflict(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            DeliveryError::Transient(detail)
        }
        _ if status.is_server_error() => DeliveryError::Transient(detail),
        _ if status.is_client_error() => DeliveryError::Permanent(detail),
        _ => DeliveryError::Transient(detail),
    }
}

fn body_preview(body: &[u8]) -> String {
    const PREVIEW_LIMIT: usize = 160;
    String::from_utf8_lossy(body).chars().take(PREVIEW_LIMIT).collect()
}
