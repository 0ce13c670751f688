//! Motion trigger state machine.
//!
//! The detector is advanced once per frame by [`TriggerDetector::observe`]
//! and, between frames, by [`TriggerDetector::tick`] so that timed phases end
//! on schedule even when the sensor goes quiet.
//!
//! ```text
//! IDLE --above--> ARMED --above for debounce--> DISPLAY --duration--> COOLDOWN --cooldown--> IDLE
//!                   \--below--> IDLE
//! any --pause--> PAUSED --window or second pause--> IDLE
//!                                                 \--> COOLDOWN (inside the last trigger's window)
//! ```

use crate::config::MotionConfig;
use crate::sources::MotionSample;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Phase of the trigger state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionPhase {
    Idle,
    Armed,
    Display,
    Cooldown,
    Paused,
}

/// Snapshot of the detector state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionState {
    pub phase: MotionPhase,
    pub last_trigger_at: Option<Instant>,
    pub pause_until: Option<Instant>,
}

/// Signals emitted by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSignal {
    /// A display session started
    Triggered { at: Instant },

    /// The display session ended; cooldown begins
    Cleared { at: Instant },

    /// Operator pause started
    Paused { until: Instant },

    /// Pause ended, either by timeout or by a second pause
    Resumed { at: Instant },
}

/// Thresholds and timings used by the detector.
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub sensitivity: f64,
    pub min_area: u32,
    pub debounce: Duration,
    pub duration: Duration,
    pub cooldown: Duration,
    pub pause_window: Duration,
}

impl From<&MotionConfig> for TriggerSettings {
    fn from(config: &MotionConfig) -> Self {
        Self {
            sensitivity: config.sensitivity,
            min_area: config.min_area,
            debounce: config.debounce(),
            duration: config.duration(),
            cooldown: config.cooldown(),
            pause_window: config.pause_window(),
        }
    }
}

/// Detector statistics.
#[derive(Debug, Default, Clone)]
pub struct TriggerStats {
    pub frames_observed: u64,
    pub triggers: u64,
    /// Above-threshold frames ignored because of display, cooldown or pause
    pub suppressed: u64,
    pub pauses: u64,
}

/// Debounced, cooldown-limited motion trigger.
pub struct TriggerDetector {
    settings: TriggerSettings,
    state: MotionState,
    armed_since: Option<Instant>,
    display_until: Option<Instant>,
    cooldown_until: Option<Instant>,
    stats: TriggerStats,
}

impl TriggerDetector {
    pub fn new(settings: TriggerSettings) -> Self {
        Self {
            settings,
            state: MotionState {
                phase: MotionPhase::Idle,
                last_trigger_at: None,
                pause_until: None,
            },
            armed_since: None,
            display_until: None,
            cooldown_until: None,
            stats: TriggerStats::default(),
        }
    }

    pub fn phase(&self) -> MotionPhase {
        self.state.phase
    }

    pub fn state(&self) -> MotionState {
        self.state.clone()
    }

    pub fn stats(&self) -> TriggerStats {
        self.stats.clone()
    }

    /// Next instant at which [`tick`](Self::tick) would change the phase.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state.phase {
            MotionPhase::Display => self.display_until,
            MotionPhase::Cooldown => self.cooldown_until,
            MotionPhase::Paused => self.state.pause_until,
            MotionPhase::Idle | MotionPhase::Armed => None,
        }
    }

    /// Feed one frame's motion sample.
    pub fn observe(&mut self, sample: MotionSample, now: Instant) -> Vec<TriggerSignal> {
        let mut signals = self.tick(now);
        self.stats.frames_observed += 1;

        let above = self.is_above(&sample);

        match self.state.phase {
            MotionPhase::Idle => {
                if above {
                    self.armed_since = Some(now);
                    self.state.phase = MotionPhase::Armed;
                    if self.settings.debounce.is_zero() {
                        signals.push(self.fire(now));
                    }
                }
            }
            MotionPhase::Armed => {
                if above {
                    let since = self.armed_since.unwrap_or(now);
                    if now.duration_since(since) >= self.settings.debounce {
                        signals.push(self.fire(now));
                    }
                } else {
                    debug!("Motion dropped below threshold before debounce elapsed");
                    self.armed_since = None;
                    self.state.phase = MotionPhase::Idle;
                }
            }
            MotionPhase::Display | MotionPhase::Cooldown | MotionPhase::Paused => {
                if above {
                    self.stats.suppressed += 1;
                }
            }
        }

        signals
    }

    /// Advance timed phases up to `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<TriggerSignal> {
        let mut signals = Vec::new();

        loop {
            match self.state.phase {
                MotionPhase::Display => match self.display_until {
                    Some(until) if now >= until => {
                        self.display_until = None;
                        self.cooldown_until = Some(until + self.settings.cooldown);
                        self.state.phase = MotionPhase::Cooldown;
                        signals.push(TriggerSignal::Cleared { at: until });
                    }
                    _ => break,
                },
                MotionPhase::Cooldown => match self.cooldown_until {
                    Some(until) if now >= until => {
                        self.cooldown_until = None;
                        self.state.phase = MotionPhase::Idle;
                    }
                    _ => break,
                },
                MotionPhase::Paused => match self.state.pause_until {
                    Some(until) if now >= until => {
                        info!("Pause window elapsed, motion detection resumed");
                        self.resume(until);
                        signals.push(TriggerSignal::Resumed { at: until });
                    }
                    _ => break,
                },
                MotionPhase::Idle | MotionPhase::Armed => break,
            }
        }

        signals
    }

    /// Operator pause. Pausing while already paused resumes immediately.
    pub fn pause(&mut self, now: Instant) -> Vec<TriggerSignal> {
        let mut signals = self.tick(now);

        if self.state.phase == MotionPhase::Paused {
            info!("Pause cancelled by operator");
            self.resume(now);
            signals.push(TriggerSignal::Resumed { at: now });
            return signals;
        }

        if self.state.phase == MotionPhase::Display {
            signals.push(TriggerSignal::Cleared { at: now });
        }

        let until = now + self.settings.pause_window;
        self.armed_since = None;
        self.display_until = None;
        self.cooldown_until = None;
        self.state.phase = MotionPhase::Paused;
        self.state.pause_until = Some(until);
        self.stats.pauses += 1;

        info!(
            pause_secs = self.settings.pause_window.as_secs(),
            "Motion detection paused"
        );
        signals.push(TriggerSignal::Paused { until });
        signals
    }

    /// Leave PAUSED. The last trigger's duration plus cooldown still holds,
    /// so resuming inside it lands in COOLDOWN rather than IDLE.
    fn resume(&mut self, at: Instant) {
        self.state.pause_until = None;
        let window_end = self
            .state
            .last_trigger_at
            .map(|t| t + self.settings.duration + self.settings.cooldown);

        match window_end {
            Some(end) if end > at => {
                self.cooldown_until = Some(end);
                self.state.phase = MotionPhase::Cooldown;
            }
            _ => {
                self.cooldown_until = None;
                self.state.phase = MotionPhase::Idle;
            }
        }
    }

    fn is_above(&self, sample: &MotionSample) -> bool {
        sample.score > self.settings.sensitivity && sample.area >= self.settings.min_area
    }

    fn fire(&mut self, now: Instant) -> TriggerSignal {
        self.armed_since = None;
        self.display_until = Some(now + self.settings.duration);
        self.state.phase = MotionPhase::Display;
        self.state.last_trigger_at = Some(now);
        self.stats.triggers += 1;

        info!(triggers = self.stats.triggers, "Motion trigger");
        TriggerSignal::Triggered { at: now }
    }
}
