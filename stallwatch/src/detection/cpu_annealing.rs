//! CPU annealing: sustained-overload detection with hysteresis
//!
//! ```text
//!          cpu > limit                 avg > limit over a full window
//!   Idle ──────────────▶ Tracking ───────────────────────────────▶ Cooldown
//!    ▲                      │                                          │
//!    └──── avg < limit/2 ───┘                                          │
//!    └──────────────────────── cooldown elapsed ───────────────────────┘
//! ```
//!
//! Short spikes fall back to Idle through the half-zone abort; a detection is
//! followed by a cooldown so one sustained condition is reported once.
//! Everything here is a pure function of the state and the input tick.

use crate::domain::CpuPercent;

/// Ticks reporting a longer elapsed time are measurement glitches
pub const MAX_TICK_SECONDS: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealingConfig {
    /// Average CPU above which a whole window counts as overload
    pub limit_percent: f32,
    pub tracking_window_seconds: f32,
    pub cooldown_seconds: f32,
    /// Length of one background averaging window
    pub background_window_seconds: f32,
    /// Background window average under which the scope counts as starved
    pub background_low_percent: f32,
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        Self {
            limit_percent: 80.0,
            tracking_window_seconds: 60.0,
            cooldown_seconds: 60.0,
            background_window_seconds: 5.0,
            background_low_percent: 6.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerMode {
    #[default]
    Idle,
    Tracking,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuTrackerState {
    pub mode: TrackerMode,
    pub accumulated_cpu_seconds: f32,
    pub tracking_elapsed_seconds: f32,
    pub cooldown_remaining: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BackgroundCpuState {
    pub accumulated_cpu_seconds: f32,
    pub accumulated_seconds: f32,
    pub is_too_low: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    None,
    SustainedOverload,
    BackgroundStarved,
}

/// Per-scope CPU tracker
#[derive(Debug, Clone)]
pub struct CpuAnnealingDetector {
    config: AnnealingConfig,
    state: CpuTrackerState,
    background: BackgroundCpuState,
    is_background: bool,
}

impl CpuAnnealingDetector {
    #[must_use]
    pub fn new(config: AnnealingConfig) -> Self {
        Self {
            config,
            state: CpuTrackerState::default(),
            background: BackgroundCpuState::default(),
            is_background: false,
        }
    }

    /// Feed one check tick.
    ///
    /// A sustained overload takes precedence when both conditions fire on the
    /// same tick.
    pub fn check(&mut self, cpu: CpuPercent, elapsed_seconds: f32) -> Detection {
        // Also rejects NaN
        if !(elapsed_seconds > 0.0 && elapsed_seconds <= MAX_TICK_SECONDS) {
            return Detection::None;
        }
        let overload = self.check_overload(cpu, elapsed_seconds);
        let starved = self.is_background && self.check_background(cpu, elapsed_seconds);
        if overload {
            Detection::SustainedOverload
        } else if starved {
            Detection::BackgroundStarved
        } else {
            Detection::None
        }
    }

    fn check_overload(&mut self, cpu: CpuPercent, elapsed: f32) -> bool {
        let limit = self.config.limit_percent;
        let state = &mut self.state;
        match state.mode {
            TrackerMode::Cooldown => {
                state.cooldown_remaining -= elapsed;
                if state.cooldown_remaining <= 0.0 {
                    *state = CpuTrackerState::default();
                }
                return false;
            }
            TrackerMode::Idle => {
                if cpu.0 <= limit {
                    return false;
                }
                *state = CpuTrackerState { mode: TrackerMode::Tracking, ..Default::default() };
            }
            TrackerMode::Tracking => {}
        }

        state.tracking_elapsed_seconds += elapsed;
        state.accumulated_cpu_seconds += cpu.cpu_seconds(elapsed);
        let t = state.tracking_elapsed_seconds;

        // Running average fell under half the limit: a spike, not a trend
        if state.accumulated_cpu_seconds < limit * t / 2.0 {
            *state = CpuTrackerState::default();
            return false;
        }
        if t >= self.config.tracking_window_seconds && state.accumulated_cpu_seconds > limit * t {
            *state = CpuTrackerState {
                mode: TrackerMode::Cooldown,
                cooldown_remaining: self.config.cooldown_seconds,
                ..Default::default()
            };
            return true;
        }
        false
    }

    fn check_background(&mut self, cpu: CpuPercent, elapsed: f32) -> bool {
        let bg = &mut self.background;
        if bg.is_too_low {
            return false;
        }
        bg.accumulated_cpu_seconds += cpu.cpu_seconds(elapsed);
        bg.accumulated_seconds += elapsed;
        if bg.accumulated_seconds < self.config.background_window_seconds {
            return false;
        }
        let average = bg.accumulated_cpu_seconds / bg.accumulated_seconds;
        bg.accumulated_cpu_seconds = 0.0;
        bg.accumulated_seconds = 0.0;
        if average < self.config.background_low_percent {
            bg.is_too_low = true;
            return true;
        }
        false
    }

    /// Enter or leave the background. Returning to the foreground re-arms the
    /// starvation check.
    pub fn set_background(&mut self, is_background: bool) {
        if self.is_background && !is_background {
            self.background = BackgroundCpuState::default();
        }
        self.is_background = is_background;
    }

    #[must_use]
    pub fn is_background(&self) -> bool {
        self.is_background
    }

    #[must_use]
    pub fn state(&self) -> CpuTrackerState {
        self.state
    }

    #[must_use]
    pub fn background_state(&self) -> BackgroundCpuState {
        self.background
    }

    #[must_use]
    pub fn config(&self) -> &AnnealingConfig {
        &self.config
    }
}
