//! Doorcam Edge Agent
//!
//! Runs on the door camera. Motion scores from the sensor drive a debounced
//! trigger; each trigger schedules one snapshot, which is written to a local
//! durable spool and then delivered to the backend event API with retries.
//!
//! ## Features
//!
//! - **Debounced Triggering**: contiguous-motion debounce, fixed display
//!   session, cooldown and operator pause
//! - **Crash-Safe Spool**: every capture is persisted before upload and
//!   survives reboots; interrupted uploads are retried
//! - **Idempotent Delivery**: each spooled job carries a stable id that the
//!   backend uses to deduplicate replays
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Motion       │──▶│ Trigger      │──▶│ Capture      │──▶│ Spool        │
//! │ Sensor       │   │ Detector     │   │ Controller   │   │ (disk)       │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//!                           │                                     │
//!                           ▼                                     ▼
//!                    ┌──────────────┐                      ┌──────────────┐
//!                    │ Alert Sink   │                      │ Upload       │──▶ Event API
//!                    └──────────────┘                      │ Client       │
//!                                                          └──────────────┘
//! ```

pub mod agent;
pub mod api_client;
pub mod capture;
pub mod config;
pub mod scheduler;
pub mod sources;
pub mod spool;
pub mod trigger;
pub mod uploader;

pub use agent::{AgentStats, EdgeAgent, EdgeComponents, OperatorCommand};
pub use api_client::{DeliveryError, EventApi, HttpEventApi, RemoteEventState, WriteTarget};
pub use config::EdgeConfig;
pub use spool::{JobStatus, Spool, SpoolRecord};
pub use trigger::{MotionPhase, TriggerDetector, TriggerSignal};
pub use uploader::{DeliveryOutcome, UploadClient};
