//! Engine configuration
//!
//! Defaults mirror a mobile block monitor: a 2 s hang threshold sampled every
//! 50 ms, checked once per second, with an 80% CPU limit. Every component
//! takes its parameters from here; the binary maps CLI flags onto it.

use std::time::Duration;

use crate::detection::{AnnealingConfig, MAX_TICK_SECONDS};
use crate::domain::{ConfigError, CpuPercent};
use crate::stack::{DEFAULT_STACK_DEPTH, MAX_STACK_DEPTH};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How long the watched thread may go without a heartbeat
    pub hang_threshold: Duration,
    /// Sampling interval of the watched thread's stack
    pub per_stack_interval: Duration,
    /// Period of the checker thread; also the CPU measurement interval
    pub check_period: Duration,
    /// Attach a merged profile of all buffered samples to hang reports
    pub main_thread_profile: bool,
    /// Process CPU above which a hang is reported as a CPU block
    pub cpu_limit_percent: f32,
    /// Pool stacks of hot threads while the process is over
    /// `power_consume_cpu_limit`
    pub capture_power_consume_stacks: bool,
    pub power_consume_cpu_limit: f32,
    pub tracking_window: Duration,
    pub cooldown: Duration,
    pub background_window: Duration,
    pub background_low_percent: f32,
    /// CPU percent per unit of call-tree weight
    pub call_tree_weight_divisor: f32,
    pub stack_pool_capacity: usize,
    pub max_stack_depth: usize,
    /// Threads under this CPU are not worth a stack in the call tree
    pub hot_thread_cpu_percent: f32,
    pub dump_daily_limit: u32,
    /// Hangs with fewer executing frames than this carry no information
    pub min_meaningful_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hang_threshold: Duration::from_secs(2),
            per_stack_interval: Duration::from_millis(50),
            check_period: Duration::from_secs(1),
            main_thread_profile: false,
            cpu_limit_percent: 80.0,
            capture_power_consume_stacks: true,
            power_consume_cpu_limit: 80.0,
            tracking_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            background_window: Duration::from_secs(5),
            background_low_percent: 6.0,
            call_tree_weight_divisor: 5.0,
            stack_pool_capacity: 100,
            max_stack_depth: DEFAULT_STACK_DEPTH,
            hot_thread_cpu_percent: 5.0,
            dump_daily_limit: 100,
            min_meaningful_depth: 3,
        }
    }
}

impl EngineConfig {
    /// Check every value is one the engine can run with.
    ///
    /// # Errors
    /// Returns the first offending field as a [`ConfigError`]
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("hang_threshold", self.hang_threshold),
            ("per_stack_interval", self.per_stack_interval),
            ("check_period", self.check_period),
            ("tracking_window", self.tracking_window),
            ("background_window", self.background_window),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if self.per_stack_interval > self.hang_threshold {
            return Err(ConfigError::IntervalExceedsThreshold {
                interval_ms: self.per_stack_interval.as_millis(),
                threshold_ms: self.hang_threshold.as_millis(),
            });
        }
        // Longer ticks are discarded by the annealing detector
        check_range("check_period", self.check_period.as_secs_f32(), 0.0, MAX_TICK_SECONDS)?;

        check_range("cpu_limit_percent", self.cpu_limit_percent, 1.0, 10_000.0)?;
        check_range("power_consume_cpu_limit", self.power_consume_cpu_limit, 1.0, 10_000.0)?;
        check_range("background_low_percent", self.background_low_percent, 0.0, 100.0)?;
        check_range("hot_thread_cpu_percent", self.hot_thread_cpu_percent, 0.0, 100.0)?;
        if self.call_tree_weight_divisor.is_nan() || self.call_tree_weight_divisor <= 0.0 {
            return Err(ConfigError::NotPositive { field: "call_tree_weight_divisor" });
        }

        #[allow(clippy::cast_precision_loss)]
        let max_depth = MAX_STACK_DEPTH as f32;
        #[allow(clippy::cast_precision_loss)]
        check_range("max_stack_depth", self.max_stack_depth as f32, 1.0, max_depth)?;
        if self.stack_pool_capacity == 0 {
            return Err(ConfigError::NotPositive { field: "stack_pool_capacity" });
        }
        if self.dump_daily_limit == 0 {
            return Err(ConfigError::NotPositive { field: "dump_daily_limit" });
        }
        Ok(())
    }

    /// Number of samples covering one hang threshold, at least 1
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn sample_capacity(&self) -> usize {
        let interval = self.per_stack_interval.as_millis();
        if interval == 0 {
            return 1;
        }
        ((self.hang_threshold.as_millis() / interval) as usize).max(1)
    }

    #[must_use]
    pub fn annealing(&self) -> AnnealingConfig {
        AnnealingConfig {
            limit_percent: self.power_consume_cpu_limit,
            tracking_window_seconds: self.tracking_window.as_secs_f32(),
            cooldown_seconds: self.cooldown.as_secs_f32(),
            background_window_seconds: self.background_window.as_secs_f32(),
            background_low_percent: self.background_low_percent,
        }
    }

    #[must_use]
    pub fn hot_thread_threshold(&self) -> CpuPercent {
        CpuPercent(self.hot_thread_cpu_percent)
    }
}

fn check_range(field: &'static str, value: f32, min: f32, max: f32) -> Result<(), ConfigError> {
    // NaN fails both comparisons
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: f64::from(value),
            min: f64::from(min),
            max: f64::from(max),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.sample_capacity(), 40);
        assert_eq!(config.annealing(), AnnealingConfig::default());
    }

    #[test]
    fn test_sample_capacity_at_least_one() {
        let config = EngineConfig {
            hang_threshold: Duration::from_millis(30),
            per_stack_interval: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(config.sample_capacity(), 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IntervalExceedsThreshold { interval_ms: 50, threshold_ms: 30 })
        ));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = EngineConfig { check_period: Duration::ZERO, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::NotPositive { field: "check_period" }));
    }

    #[test]
    fn test_long_check_period_rejected() {
        let config = EngineConfig { check_period: Duration::from_secs(10), ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "check_period", .. })
        ));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let bad = [
            EngineConfig { cpu_limit_percent: 0.0, ..Default::default() },
            EngineConfig { background_low_percent: f32::NAN, ..Default::default() },
            EngineConfig { call_tree_weight_divisor: 0.0, ..Default::default() },
            EngineConfig { max_stack_depth: MAX_STACK_DEPTH + 1, ..Default::default() },
            EngineConfig { stack_pool_capacity: 0, ..Default::default() },
            EngineConfig { dump_daily_limit: 0, ..Default::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }
}
