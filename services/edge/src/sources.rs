//! Hardware seams: motion sensor, frame source and alert sink.
//!
//! The agent only talks to the camera and the speaker through these narrow
//! traits. The implementations here cover local development (simulated motion,
//! a snapshot file on disk) and tests (scripted samples, in-memory frames with
//! injectable faults).

use crate::trigger::TriggerSignal;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Faults reported by a frame source.
#[derive(Debug, Clone, Error)]
pub enum CaptureFault {
    #[error("Frame source disconnected")]
    Disconnected,

    #[error("Frame read failed: {0}")]
    ReadFailed(String),
}

/// One motion measurement for a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    /// Motion score produced by the external difference function
    pub score: f64,

    /// Changed area in pixels
    pub area: u32,
}

impl MotionSample {
    pub fn new(score: f64, area: u32) -> Self {
        Self { score, area }
    }

    /// A sample with no motion.
    pub fn still() -> Self {
        Self {
            score: 0.0,
            area: 0,
        }
    }
}

/// A captured still image.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Encoded image bytes
    pub data: Bytes,

    /// File extension for the encoding (e.g. "jpg")
    pub format: String,

    /// Wall-clock capture time
    pub captured_at: DateTime<Utc>,
}

/// Source of per-frame motion scores.
#[async_trait]
pub trait MotionSensor: Send {
    /// Wait for the next frame's score. `None` means the sensor is closed.
    async fn next_score(&mut self) -> Option<MotionSample>;
}

/// Source of still frames.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture_frame(&self) -> Result<CapturedFrame, CaptureFault>;
}

/// Side-effect sink for trigger signals (chime, relay).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn play_alert(&self, signal: &TriggerSignal);
}

/// Sensor replaying a fixed script of `(delay, sample)` steps.
///
/// Cancel-safe: a dropped `next_score` call keeps its deadline, so the step
/// is delivered on schedule by the next call.
pub struct ScriptedSensor {
    steps: VecDeque<(Duration, MotionSample)>,
    due_at: Option<Instant>,
}

impl ScriptedSensor {
    pub fn new(steps: impl IntoIterator<Item = (Duration, MotionSample)>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            due_at: None,
        }
    }

    /// Constant-rate script: `frames` samples `interval` apart, all equal to `sample`.
    pub fn steady(sample: MotionSample, interval: Duration, frames: usize) -> Self {
        Self::new(std::iter::repeat((interval, sample)).take(frames))
    }
}

#[async_trait]
impl MotionSensor for ScriptedSensor {
    async fn next_score(&mut self) -> Option<MotionSample> {
        let (delay, _) = *self.steps.front()?;
        let due_at = *self.due_at.get_or_insert_with(|| Instant::now() + delay);
        tokio::time::sleep_until(due_at).await;

        self.due_at = None;
        self.steps.pop_front().map(|(_, sample)| sample)
    }
}

/// Sensor producing background noise with a burst of strong motion every
/// `burst_interval`.
pub struct SimulatedSensor {
    frame_interval: Duration,
    burst_interval: Duration,
    burst_length: Duration,
    burst_sample: MotionSample,
    noise_ceiling: f64,
    started: Instant,
}

impl SimulatedSensor {
    pub fn new(frame_interval: Duration, burst_interval: Duration, sensitivity: f64, min_area: u32) -> Self {
        Self {
            frame_interval,
            burst_interval,
            burst_length: Duration::from_secs(1),
            burst_sample: MotionSample::new(sensitivity * 2.0 + 1.0, min_area.saturating_mul(4)),
            noise_ceiling: sensitivity / 2.0,
            started: Instant::now(),
        }
    }

    fn in_burst(&self, now: Instant) -> bool {
        if self.burst_interval.is_zero() {
            return false;
        }
        let elapsed = now.duration_since(self.started).as_millis();
        let phase = elapsed % self.burst_interval.as_millis();
        // First burst lands one full interval after start
        elapsed >= self.burst_interval.as_millis() && phase < self.burst_length.as_millis()
    }
}

#[async_trait]
impl MotionSensor for SimulatedSensor {
    async fn next_score(&mut self) -> Option<MotionSample> {
        tokio::time::sleep(self.frame_interval).await;

        if self.in_burst(Instant::now()) {
            return Some(self.burst_sample);
        }

        let mut rng = rand::thread_rng();
        let score = rng.gen_range(0.0..=self.noise_ceiling.max(f64::EPSILON));
        let area = rng.gen_range(0..1_000);
        Some(MotionSample::new(score, area))
    }
}

/// Frame source serving a fixed image file from disk.
pub struct FileFrameSource {
    path: PathBuf,
    format: String,
}

impl FileFrameSource {
    pub fn new(path: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format: format.into(),
        }
    }
}

#[async_trait]
impl FrameSource for FileFrameSource {
    async fn capture_frame(&self) -> Result<CapturedFrame, CaptureFault> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CaptureFault::Disconnected,
            _ => CaptureFault::ReadFailed(format!("{}: {}", self.path.display(), e)),
        })?;

        debug!(path = %self.path.display(), bytes = data.len(), "Read snapshot file");

        Ok(CapturedFrame {
            data: Bytes::from(data),
            format: self.format.clone(),
            captured_at: Utc::now(),
        })
    }
}

/// Frame source synthesising a small JPEG-framed payload.
#[derive(Debug, Default)]
pub struct SimulatedFrameSource;

#[async_trait]
impl FrameSource for SimulatedFrameSource {
    async fn capture_frame(&self) -> Result<CapturedFrame, CaptureFault> {
        let mut rng = rand::thread_rng();
        let mut data = Vec::with_capacity(4096);
        data.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
        data.extend((0..4088).map(|_| rng.gen::<u8>()));
        data.extend_from_slice(&[0xFF, 0xD9]);

        Ok(CapturedFrame {
            data: Bytes::from(data),
            format: "jpg".to_string(),
            captured_at: Utc::now(),
        })
    }
}

/// In-memory frame source with scripted faults. Records when each capture
/// attempt happened.
pub struct MemoryFrameSource {
    frame: Bytes,
    faults: Mutex<VecDeque<CaptureFault>>,
    attempts: Mutex<Vec<Instant>>,
}

impl MemoryFrameSource {
    pub fn new(frame: impl Into<Bytes>) -> Self {
        Self {
            frame: frame.into(),
            faults: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Queue faults returned by the next capture attempts, in order.
    pub fn with_faults(self, faults: impl IntoIterator<Item = CaptureFault>) -> Self {
        self.faults.lock().extend(faults);
        self
    }

    /// Instants of every capture attempt so far.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl FrameSource for MemoryFrameSource {
    async fn capture_frame(&self) -> Result<CapturedFrame, CaptureFault> {
        self.attempts.lock().push(Instant::now());

        if let Some(fault) = self.faults.lock().pop_front() {
            return Err(fault);
        }

        Ok(CapturedFrame {
            data: self.frame.clone(),
            format: "jpg".to_string(),
            captured_at: Utc::now(),
        })
    }
}

/// Alert sink that only logs.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn play_alert(&self, signal: &TriggerSignal) {
        match signal {
            TriggerSignal::Triggered { .. } => info!("Doorbell chime"),
            TriggerSignal::Cleared { .. } => debug!("Display session cleared"),
            TriggerSignal::Paused { .. } => info!("Alerts paused"),
            TriggerSignal::Resumed { .. } => info!("Alerts resumed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scripted_sensor_replays_in_order() {
        let mut sensor = ScriptedSensor::new(vec![
            (Duration::from_millis(10), MotionSample::new(1.0, 10)),
            (Duration::from_millis(10), MotionSample::new(2.0, 20)),
        ]);

        let start = Instant::now();
        assert_eq!(sensor.next_score().await, Some(MotionSample::new(1.0, 10)));
        assert_eq!(sensor.next_score().await, Some(MotionSample::new(2.0, 20)));
        assert_eq!(sensor.next_score().await, None);
        assert_eq!(start.elapsed(), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_sensor_bursts_after_interval() {
        let mut sensor = SimulatedSensor::new(
            Duration::from_millis(100),
            Duration::from_secs(2),
            25.0,
            5000,
        );

        let mut strong = 0;
        for _ in 0..30 {
            let sample = sensor.next_score().await.unwrap();
            if sample.score > 25.0 && sample.area >= 5000 {
                strong += 1;
            }
        }

        // 3s of frames: only the burst at 2s..3s is strong
        assert!(strong >= 9 && strong <= 10, "strong = {}", strong);
    }

    #[tokio::test]
    async fn test_memory_source_faults_then_frames() {
        let source = MemoryFrameSource::new(vec![1u8, 2, 3])
            .with_faults(vec![CaptureFault::Disconnected]);

        assert!(matches!(
            source.capture_frame().await,
            Err(CaptureFault::Disconnected)
        ));
        let frame = source.capture_frame().await.unwrap();
        assert_eq!(&frame.data[..], &[1, 2, 3]);
        assert_eq!(source.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let source = FileFrameSource::new("/nonexistent/doorcam/snapshot.jpg", "jpg");
        assert!(matches!(
            source.capture_frame().await,
            Err(CaptureFault::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_file_source_reads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.jpg");
        std::fs::write(&path, b"jpeg-bytes").unwrap();

        let frame = FileFrameSource::new(&path, "jpg").capture_frame().await.unwrap();
        assert_eq!(&frame.data[..], b"jpeg-bytes");
        assert_eq!(frame.format, "jpg");
    }
}
