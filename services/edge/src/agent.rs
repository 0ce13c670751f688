//! Edge agent runtime: motion loop, alert fan-out and background tasks.
//!
//! # Architecture
//!
//! ```text
//! MotionSensor -> MotionLoop(TriggerDetector) --broadcast--> alert task -> AlertSink
//!                        |
//!                        +--> CaptureController -> Spool <- UploadClient -> EventApi
//! ```

use crate::api_client::EventApi;
use crate::capture::{CaptureController, CaptureSettings, CaptureStats};
use crate::config::EdgeConfig;
use crate::scheduler::RecurringTask;
use crate::sources::{AlertSink, FrameSource, MotionSensor};
use crate::spool::{RetryPolicy, Spool, SpoolError, SpoolStats};
use crate::trigger::{TriggerDetector, TriggerSettings, TriggerSignal, TriggerStats};
use crate::uploader::{UploadClient, UploadStats};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands an operator can send to a running agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Start a pause, or end the current one early
    Pause,
}

/// The single cooperative loop advancing the trigger detector.
pub struct MotionLoop {
    detector: TriggerDetector,
    sensor: Box<dyn MotionSensor>,
    capture: CaptureController,
    signals: broadcast::Sender<TriggerSignal>,
    commands: mpsc::Receiver<OperatorCommand>,
    stats: Arc<RwLock<TriggerStats>>,
}

impl MotionLoop {
    pub fn new(
        detector: TriggerDetector,
        sensor: Box<dyn MotionSensor>,
        capture: CaptureController,
        signals: broadcast::Sender<TriggerSignal>,
        commands: mpsc::Receiver<OperatorCommand>,
    ) -> Self {
        Self {
            detector,
            sensor,
            capture,
            signals,
            commands,
            stats: Arc::new(RwLock::new(TriggerStats::default())),
        }
    }

    /// Shared view of the detector statistics, updated every iteration.
    pub fn stats_handle(&self) -> Arc<RwLock<TriggerStats>> {
        self.stats.clone()
    }

    /// Run until cancelled or until the sensor closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Motion loop started");

        loop {
            let deadline = self.detector.next_deadline();

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = self.commands.recv() => match command {
                    OperatorCommand::Pause => {
                        let signals = self.detector.pause(Instant::now());
                        self.dispatch(signals);
                    }
                },
                sample = self.sensor.next_score() => match sample {
                    Some(sample) => {
                        let signals = self.detector.observe(sample, Instant::now());
                        self.dispatch(signals);
                    }
                    None => {
                        info!("Motion sensor closed");
                        break;
                    }
                },
                _ = sleep_until_deadline(deadline) => {
                    let signals = self.detector.tick(Instant::now());
                    self.dispatch(signals);
                }
            }

            *self.stats.write() = self.detector.stats();
        }

        *self.stats.write() = self.detector.stats();
        info!("Motion loop stopped");
    }

    fn dispatch(&self, signals: Vec<TriggerSignal>) {
        for signal in signals {
            match signal {
                TriggerSignal::Triggered { at } => {
                    self.capture.schedule(at);
                }
                TriggerSignal::Paused { .. } => {
                    let cancelled = self.capture.cancel_pending();
                    if cancelled > 0 {
                        info!(cancelled, "Pause cancelled pending captures");
                    }
                }
                TriggerSignal::Cleared { .. } | TriggerSignal::Resumed { .. } => {}
            }

            // No subscribers is fine
            let _ = self.signals.send(signal);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Forward trigger signals to an alert sink until cancelled.
pub fn spawn_alerts(
    sink: Arc<dyn AlertSink>,
    mut signals: broadcast::Receiver<TriggerSignal>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = signals.recv() => match received {
                    Ok(signal) => sink.play_alert(&signal).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Alert task lagging, signals skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Alert task stopped");
    })
}

/// External collaborators the agent is wired to.
pub struct EdgeComponents {
    pub sensor: Box<dyn MotionSensor>,
    pub frame_source: Arc<dyn FrameSource>,
    pub alert_sink: Arc<dyn AlertSink>,
    pub api: Arc<dyn EventApi>,
}

/// Point-in-time statistics of a running agent.
#[derive(Debug, Clone)]
pub struct AgentStats {
    pub trigger: TriggerStats,
    pub capture: CaptureStats,
    pub upload: UploadStats,
    pub spool: SpoolStats,
}

/// A running edge agent.
pub struct EdgeAgent {
    spool: Arc<Spool>,
    capture: CaptureController,
    uploader: UploadClient,
    trigger_stats: Arc<RwLock<TriggerStats>>,
    commands: mpsc::Sender<OperatorCommand>,
    signals: broadcast::Sender<TriggerSignal>,
    cancel: CancellationToken,
    motion_handle: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl EdgeAgent {
    /// Open the spool and start every task.
    ///
    /// `cancel` stops the agent; it is also cancelled by the agent itself if
    /// the spool becomes unwritable.
    pub fn start(
        config: &EdgeConfig,
        components: EdgeComponents,
        cancel: CancellationToken,
    ) -> Result<Self, SpoolError> {
        let spool = Arc::new(Spool::open(
            &config.spool.dir,
            RetryPolicy::from(&config.spool),
            config.spool.lease_timeout(),
        )?);

        let capture = CaptureController::new(
            CaptureSettings {
                device_id: config.device.device_id.clone(),
                snapshot_delay: config.snapshot_delay(),
                max_attempts: config.capture.max_attempts,
            },
            components.frame_source,
            spool.clone(),
            cancel.clone(),
        );

        let (signals, _) = broadcast::channel(64);
        let (commands, command_rx) = mpsc::channel(8);

        let motion = MotionLoop::new(
            TriggerDetector::new(TriggerSettings::from(&config.motion)),
            components.sensor,
            capture.clone(),
            signals.clone(),
            command_rx,
        );
        let trigger_stats = motion.stats_handle();
        let motion_handle = tokio::spawn(motion.run(cancel.clone()));

        let alerts = spawn_alerts(components.alert_sink, signals.subscribe(), cancel.clone());

        let uploader = UploadClient::new(spool.clone(), components.api, config.upload.concurrency);
        let drain = uploader.spawn(config.upload.poll_interval(), cancel.clone());

        let purge = RecurringTask::new("spool-purge", Duration::from_secs(3600), cancel.clone())
            .spawn({
                let spool = spool.clone();
                let retention = config.spool.retention();
                move || {
                    let spool = spool.clone();
                    async move {
                        if let Err(e) = spool.purge_done_async(retention, Utc::now()).await {
                            error!(error = %e, "Spool purge failed");
                        }
                    }
                }
            });

        info!(
            device_id = %config.device.device_id,
            spool_dir = %config.spool.dir,
            "Edge agent started"
        );

        Ok(Self {
            spool,
            capture,
            uploader,
            trigger_stats,
            commands,
            signals,
            cancel,
            motion_handle,
            background: vec![alerts, drain, purge],
        })
    }

    pub fn spool(&self) -> &Arc<Spool> {
        &self.spool
    }

    /// Sender for operator commands.
    pub fn commands(&self) -> mpsc::Sender<OperatorCommand> {
        self.commands.clone()
    }

    /// Subscribe to trigger signals.
    pub fn subscribe(&self) -> broadcast::Receiver<TriggerSignal> {
        self.signals.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> AgentStats {
        (self.stats_probe())()
    }

    /// Closure reading a stats snapshot without borrowing the agent.
    pub fn stats_probe(&self) -> impl Fn() -> AgentStats + Send + Sync + 'static {
        let trigger = self.trigger_stats.clone();
        let capture = self.capture.clone();
        let uploader = self.uploader.clone();
        let spool = self.spool.clone();
        move || AgentStats {
            trigger: trigger.read().clone(),
            capture: capture.stats(),
            upload: uploader.stats(),
            spool: spool.stats(),
        }
    }

    /// Wait until the motion loop exits (sensor closed or cancellation).
    pub async fn wait_motion(&mut self) {
        if let Err(e) = (&mut self.motion_handle).await {
            error!(error = %e, "Motion loop task failed");
        }
    }

    /// Cancel every task and wait for them to stop. In-flight uploads finish
    /// their current request before the drain task exits.
    pub async fn shutdown(self) -> AgentStats {
        let stats_probe = self.stats_probe();
        self.cancel.cancel();

        if !self.motion_handle.is_finished() {
            let _ = self.motion_handle.await;
        }
        for handle in self.background {
            let _ = handle.await;
        }

        let stats = stats_probe();
        info!("Edge agent stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{MemoryFrameSource, MotionSample, ScriptedSensor};
    use crate::spool::{NoJitter, RetryPolicy};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<TriggerSignal>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn play_alert(&self, signal: &TriggerSignal) {
            self.seen.lock().push(*signal);
        }
    }

    fn motion_loop(
        sensor: ScriptedSensor,
        source: Arc<MemoryFrameSource>,
        dir: &std::path::Path,
    ) -> (
        MotionLoop,
        broadcast::Sender<TriggerSignal>,
        mpsc::Sender<OperatorCommand>,
    ) {
        let spool = Arc::new(
            Spool::open_with_jitter(
                dir,
                RetryPolicy {
                    max_attempts: 3,
                    base: Duration::from_secs(1),
                    cap: Duration::from_secs(10),
                    jitter_ratio: 0.0,
                },
                Duration::from_secs(60),
                Box::new(NoJitter),
            )
            .unwrap(),
        );
        let capture = CaptureController::new(
            CaptureSettings {
                device_id: "doorcam-01".to_string(),
                snapshot_delay: Duration::from_secs(3),
                max_attempts: 3,
            },
            source,
            spool,
            CancellationToken::new(),
        );
        let detector = TriggerDetector::new(TriggerSettings {
            sensitivity: 25.0,
            min_area: 5000,
            debounce: Duration::ZERO,
            duration: Duration::from_secs(15),
            cooldown: Duration::from_secs(5),
            pause_window: Duration::from_secs(60),
        });
        let (signals, _) = broadcast::channel(16);
        let (commands, command_rx) = mpsc::channel(4);
        (
            MotionLoop::new(detector, Box::new(sensor), capture, signals.clone(), command_rx),
            signals,
            commands,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_reaches_capture_and_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemoryFrameSource::new(vec![1u8]));
        let mut steps = vec![(Duration::ZERO, MotionSample::new(50.0, 9000))];
        steps.extend(std::iter::repeat((Duration::from_millis(500), MotionSample::still())).take(40));
        let (motion, signals, _commands) =
            motion_loop(ScriptedSensor::new(steps), source.clone(), dir.path());

        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let alerts = spawn_alerts(sink.clone(), signals.subscribe(), cancel.clone());

        let t0 = Instant::now();
        motion.run(cancel.clone()).await;
        cancel.cancel();
        alerts.await.unwrap();

        assert_eq!(source.attempts(), vec![t0 + Duration::from_secs(3)]);
        let seen = sink.seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                TriggerSignal::Triggered { at: t0 },
                TriggerSignal::Cleared {
                    at: t0 + Duration::from_secs(15)
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_command_cancels_pending_capture() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemoryFrameSource::new(vec![1u8]));
        let mut steps = vec![(Duration::ZERO, MotionSample::new(50.0, 9000))];
        steps.extend(std::iter::repeat((Duration::from_millis(500), MotionSample::new(50.0, 9000))).take(20));
        let (motion, _signals, commands) =
            motion_loop(ScriptedSensor::new(steps), source.clone(), dir.path());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(motion.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        commands.send(OperatorCommand::Pause).await.unwrap();

        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Still paused for the whole script, so nothing is captured
        assert!(source.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_final_stats() {
        let dir = tempfile::tempdir().unwrap();
        let config: EdgeConfig = serde_json::from_value(serde_json::json!({
            "device": {"device_id": "doorcam-01", "api_key": "key"},
            "spool": {"dir": dir.path().to_string_lossy(), "jitter_ratio": 0.0},
            "upload": {"backend_url": "http://backend.invalid", "poll_interval_ms": 250}
        }))
        .unwrap();

        let agent = EdgeAgent::start(
            &config,
            EdgeComponents {
                sensor: Box::new(ScriptedSensor::new(vec![(
                    Duration::ZERO,
                    MotionSample::still(),
                )])),
                frame_source: Arc::new(MemoryFrameSource::new(vec![1u8])),
                alert_sink: Arc::new(RecordingSink::default()),
                api: Arc::new(crate::api_client::MockEventApi::new()),
            },
            CancellationToken::new(),
        )
        .unwrap();
        let probe = agent.stats_probe();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = agent.shutdown().await;
        assert!(stats.trigger.frames_observed >= 1);
        assert_eq!(stats.trigger.triggers, 0);
        assert_eq!(stats.spool.depth(), 0);
        assert_eq!(probe().trigger.frames_observed, stats.trigger.frames_observed);
    }
}
