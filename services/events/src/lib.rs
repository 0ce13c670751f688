//! Doorcam Event Service
//!
//! Backend for door events. Devices open an event, upload the snapshot to a
//! presigned URL and finalize the event; events that are never finalized are
//! expired by a background sweep. Finalized snapshots are handed to a
//! detector and the detections are stored with the event.
//!
//! ## Features
//!
//! - **Idempotent Lifecycle**: `start` deduplicates on the device's job id,
//!   `finalize` on the snapshot reference; divergent replays are rejected
//! - **Scoped Write Credentials**: devices receive a presigned PUT for one
//!   object key and never hold storage or database credentials
//! - **Expiry Sweep**: unfinalized events past their deadline move to EXPIRED
//!   exactly once
//! - **Inference Outbox**: finalize queues an inference job in the same
//!   transaction; detections are written at-least-once without duplicates
//!
//! ## Architecture
//!
//! ```text
//!   Device                 Event API               PostgreSQL
//! ┌──────────────┐       ┌──────────────┐        ┌──────────────┐
//! │ start        │──────▶│ Event        │───────▶│ events       │
//! │ PUT media    │──┐    │ Lifecycle    │        │ inference_   │
//! │ finalize     │  │    └──────────────┘        │   jobs       │
//! └──────────────┘  │           │                │ detections   │
//!                   │           ▼                └──────────────┘
//!                   │    ┌──────────────┐          ▲        ▲
//!                   └───▶│ S3 Bucket    │          │        │
//!                        │ snapshots/   │   ┌──────────┐ ┌──────────┐
//!                        └──────────────┘   │ Expiry   │ │ Inference│──▶ Detector
//!                                           │ Sweeper  │ │ Worker   │
//!                                           └──────────┘ └──────────┘
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod expiry;
pub mod inference;
pub mod lifecycle;
pub mod models;
pub mod object_storage;
pub mod scheduler;
pub mod store;

pub use api::{create_router, AppState};
pub use config::Config;
pub use expiry::ExpirySweeper;
pub use inference::{Detector, HttpDetector, InferenceWorker};
pub use lifecycle::{EventLifecycle, LifecycleError, LifecycleSettings};
pub use models::{Detection, EventRecord, EventState};
pub use object_storage::{ObjectStorage, S3ObjectStorage};
pub use store::{EventStore, PgEventStore};
