//! Domain types shared by the store, the lifecycle and the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A registered capture device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub name: Option<String>,
    /// Hex SHA-256 of the device API key
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Event lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    Created,
    AwaitingMedia,
    Finalized,
    Expired,
}

impl EventState {
    /// Column value in the events table
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Created => "created",
            EventState::AwaitingMedia => "awaiting_media",
            EventState::Finalized => "finalized",
            EventState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventState::Finalized | EventState::Expired)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventState::Created),
            "awaiting_media" => Ok(EventState::AwaitingMedia),
            "finalized" => Ok(EventState::Finalized),
            "expired" => Ok(EventState::Expired),
            other => Err(format!("unknown event state: {}", other)),
        }
    }
}

/// Pre-authorised upload location for exactly one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTarget {
    pub url: String,
    pub object_key: String,
    pub expires_at: DateTime<Utc>,
}

/// A stored door event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub device_id: String,
    pub state: EventState,
    /// Idempotency key supplied by the device
    pub client_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub finalize_deadline: DateTime<Utc>,
    /// Object the write target is scoped to
    pub object_key: String,
    pub write_target: Option<WriteTarget>,
    pub snapshot_ref: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

/// Insert payload for a new event
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub device_id: String,
    pub client_job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub finalize_deadline: DateTime<Utc>,
    pub object_key: String,
}

/// Bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// A landmark point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
}

/// Detector output for one finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "type")]
    pub detection_type: String,
    #[serde(default)]
    pub label: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default = "empty_object")]
    pub extra: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Detection {
    /// Confidence must be a number in [0, 1]
    pub fn is_valid(&self) -> bool {
        self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)
    }
}

/// A stored detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub detection_id: Uuid,
    pub event_id: Uuid,
    /// Inference job that produced it
    pub run_id: Uuid,
    /// Position within that run's output
    pub ordinal: i32,
    #[serde(flatten)]
    pub detection: Detection,
    pub created_at: DateTime<Utc>,
}

/// Inference job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceJobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl InferenceJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceJobState::Queued => "queued",
            InferenceJobState::Running => "running",
            InferenceJobState::Done => "done",
            InferenceJobState::Failed => "failed",
        }
    }
}

impl FromStr for InferenceJobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(InferenceJobState::Queued),
            "running" => Ok(InferenceJobState::Running),
            "done" => Ok(InferenceJobState::Done),
            "failed" => Ok(InferenceJobState::Failed),
            other => Err(format!("unknown inference job state: {}", other)),
        }
    }
}

/// Queued work for the detector, written in the finalize transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceJob {
    pub job_id: Uuid,
    pub event_id: Uuid,
    pub snapshot_ref: String,
    pub state: InferenceJobState,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Query parameters for event listing
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of results
    pub limit: i64,
}
