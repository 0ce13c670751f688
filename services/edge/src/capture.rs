//! Capture session controller.
//!
//! Each trigger schedules one snapshot at `trigger + snapshot_delay`. The
//! scheduled capture runs as its own task and can be cancelled in bulk by an
//! operator pause. A successful capture becomes a PENDING spool record; a
//! capture that keeps faulting is abandoned without touching the spool.

use crate::sources::{CaptureFault, FrameSource};
use crate::spool::{MediaArtifact, NewCapture, Spool, SpoolError, SpoolRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors from a capture session.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture abandoned after {attempts} attempts: {last_fault}")]
    Abandoned {
        attempts: u32,
        last_fault: CaptureFault,
    },

    #[error("Failed to spool capture: {0}")]
    Spool(#[from] SpoolError),
}

/// Capture statistics.
#[derive(Debug, Default, Clone)]
pub struct CaptureStats {
    pub scheduled: u64,
    pub captured: u64,
    pub abandoned: u64,
    pub cancelled: u64,
    pub faults: u64,
}

/// Capture timing and retry settings.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device_id: String,
    pub snapshot_delay: Duration,
    pub max_attempts: u32,
}

struct Inner {
    settings: CaptureSettings,
    frame_source: Arc<dyn FrameSource>,
    spool: Arc<Spool>,
    /// Cancelled to stop the whole agent after a fatal spool error
    shutdown: CancellationToken,
    /// Parent of every pending session; swapped out on pause
    pending: Mutex<CancellationToken>,
    sessions: Mutex<HashMap<u64, Instant>>,
    next_session: AtomicU64,
    stats: RwLock<CaptureStats>,
}

/// Schedules and runs snapshot captures.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<Inner>,
}

impl CaptureController {
    pub fn new(
        settings: CaptureSettings,
        frame_source: Arc<dyn FrameSource>,
        spool: Arc<Spool>,
        shutdown: CancellationToken,
    ) -> Self {
        let pending = shutdown.child_token();
        Self {
            inner: Arc::new(Inner {
                settings,
                frame_source,
                spool,
                shutdown,
                pending: Mutex::new(pending),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                stats: RwLock::new(CaptureStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> CaptureStats {
        self.inner.stats.read().clone()
    }

    /// Capture instants of sessions still waiting, by session id.
    pub fn pending_sessions(&self) -> Vec<(u64, Instant)> {
        let mut sessions: Vec<(u64, Instant)> = self
            .inner
            .sessions
            .lock()
            .iter()
            .map(|(id, at)| (*id, *at))
            .collect();
        sessions.sort_by_key(|(id, _)| *id);
        sessions
    }

    /// Schedule the snapshot for a trigger fired at `trigger_at`. Returns the
    /// session id.
    pub fn schedule(&self, trigger_at: Instant) -> u64 {
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let capture_at = trigger_at + self.inner.settings.snapshot_delay;
        let token = self.inner.pending.lock().child_token();

        self.inner.sessions.lock().insert(session_id, capture_at);
        self.inner.stats.write().scheduled += 1;

        debug!(
            session_id,
            delay_ms = self.inner.settings.snapshot_delay.as_millis() as u64,
            "Capture scheduled"
        );

        let controller = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    controller.inner.sessions.lock().remove(&session_id);
                    controller.inner.stats.write().cancelled += 1;
                    info!(session_id, "Pending capture cancelled");
                }
                _ = tokio::time::sleep_until(capture_at) => {
                    controller.inner.sessions.lock().remove(&session_id);
                    controller.run_session(session_id).await;
                }
            }
        });

        session_id
    }

    /// Cancel every capture that has not started yet.
    pub fn cancel_pending(&self) -> usize {
        let fresh = self.inner.shutdown.child_token();
        let previous = std::mem::replace(&mut *self.inner.pending.lock(), fresh);
        let waiting = self.inner.sessions.lock().len();
        previous.cancel();
        waiting
    }

    async fn run_session(&self, session_id: u64) {
        match self.capture_now().await {
            Ok(record) => {
                info!(session_id, job_id = %record.job_id, "Snapshot captured and spooled");
            }
            Err(CaptureError::Abandoned {
                attempts,
                last_fault,
            }) => {
                error!(session_id, attempts, fault = %last_fault, "Capture session abandoned");
            }
            Err(CaptureError::Spool(e)) => {
                error!(session_id, error = %e, "Spool write failed, stopping agent");
                self.inner.shutdown.cancel();
            }
        }
    }

    /// Take a snapshot now, retrying immediately on frame-source faults, and
    /// spool it.
    pub async fn capture_now(&self) -> Result<SpoolRecord, CaptureError> {
        let settings = &self.inner.settings;
        let mut last_fault = CaptureFault::Disconnected;

        for attempt in 1..=settings.max_attempts {
            match self.inner.frame_source.capture_frame().await {
                Ok(frame) => {
                    let record = self
                        .inner
                        .spool
                        .enqueue_async(NewCapture {
                            device_id: settings.device_id.clone(),
                            captured_at: frame.captured_at,
                            media: vec![MediaArtifact {
                                data: frame.data,
                                extension: frame.format,
                            }],
                        })
                        .await?;
                    self.inner.stats.write().captured += 1;
                    return Ok(record);
                }
                Err(fault) => {
                    warn!(attempt, max_attempts = settings.max_attempts, fault = %fault, "Capture attempt failed");
                    self.inner.stats.write().faults += 1;
                    last_fault = fault;
                }
            }
        }

        self.inner.stats.write().abandoned += 1;
        Err(CaptureError::Abandoned {
            attempts: settings.max_attempts,
            last_fault,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MemoryFrameSource;
    use crate::spool::{NoJitter, RetryPolicy};

    fn spool(dir: &std::path::Path) -> Arc<Spool> {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            jitter_ratio: 0.0,
        };
        Arc::new(
            Spool::open_with_jitter(dir, policy, Duration::from_secs(60), Box::new(NoJitter))
                .unwrap(),
        )
    }

    fn settings(delay_secs: u64) -> CaptureSettings {
        CaptureSettings {
            device_id: "doorcam-01".to_string(),
            snapshot_delay: Duration::from_secs(delay_secs),
            max_attempts: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_fires_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let source = Arc::new(MemoryFrameSource::new(vec![0xFFu8, 0xD8]));
        let controller = CaptureController::new(
            settings(3),
            source.clone(),
            spool.clone(),
            CancellationToken::new(),
        );

        let t0 = Instant::now();
        controller.schedule(t0);
        assert_eq!(controller.pending_sessions().len(), 1);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(source.attempts().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.attempts(), vec![t0 + Duration::from_secs(3)]);
        assert_eq!(spool.stats().pending, 1);
        assert!(controller.pending_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_drops_scheduled_capture() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let source = Arc::new(MemoryFrameSource::new(vec![1u8]));
        let controller = CaptureController::new(
            settings(5),
            source.clone(),
            spool.clone(),
            CancellationToken::new(),
        );

        controller.schedule(Instant::now());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.cancel_pending(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(source.attempts().is_empty());
        assert_eq!(spool.stats().pending, 0);
        assert_eq!(controller.stats().cancelled, 1);

        // New sessions after the pause are unaffected
        controller.schedule(Instant::now());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(source.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_fault_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let source = Arc::new(
            MemoryFrameSource::new(vec![1u8, 2]).with_faults(vec![
                CaptureFault::ReadFailed("timeout".to_string()),
                CaptureFault::Disconnected,
            ]),
        );
        let controller =
            CaptureController::new(settings(0), source.clone(), spool.clone(), CancellationToken::new());

        let record = controller.capture_now().await.unwrap();
        assert_eq!(source.attempts().len(), 3);
        assert_eq!(record.device_id, "doorcam-01");
        assert_eq!(controller.stats().faults, 2);
    }

    #[tokio::test]
    async fn test_persistent_fault_abandons_without_spooling() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        let source = Arc::new(
            MemoryFrameSource::new(vec![1u8])
                .with_faults(std::iter::repeat(CaptureFault::Disconnected).take(3)),
        );
        let controller =
            CaptureController::new(settings(0), source.clone(), spool.clone(), CancellationToken::new());

        let result = controller.capture_now().await;
        assert!(matches!(
            result,
            Err(CaptureError::Abandoned { attempts: 3, .. })
        ));
        assert_eq!(spool.stats(), crate::spool::SpoolStats::default());
        assert_eq!(controller.stats().abandoned, 1);
    }
}
