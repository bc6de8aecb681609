//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::EngineConfig;

#[derive(Parser, Debug)]
#[command(
    name = "stallwatch",
    about = "Watch a synthetic workload for main-thread hangs and CPU stalls",
    after_help = "\
EXAMPLES:
    stallwatch                               Stall every 3s, report hangs for 10s
    stallwatch --burn 2 --duration 90        Add two CPU-burning async tasks
    stallwatch --profile --dwarf             Merged profile, DWARF symbol names
    stallwatch --export trees.json           Write call trees to a file"
)]
pub struct Args {
    /// Stop after N seconds
    #[arg(long, default_value = "10")]
    pub duration: u64,

    /// Heartbeat gap reported as a hang (ms)
    #[arg(long, default_value = "2000")]
    pub hang_threshold_ms: u64,

    /// Stack sampling interval of the watched thread (ms)
    #[arg(long, default_value = "50")]
    pub interval_ms: u64,

    /// Checker period (ms)
    #[arg(long, default_value = "1000")]
    pub check_period_ms: u64,

    /// Process CPU percent counted as overload
    #[arg(long, default_value = "80")]
    pub cpu_limit: f32,

    /// Seconds of normal work between stalls
    #[arg(long, default_value = "3")]
    pub stall_every: u64,

    /// Length of each stall (ms)
    #[arg(long, default_value = "2500")]
    pub stall_ms: u64,

    /// Number of async tasks that burn CPU on runtime workers
    #[arg(long, default_value = "0")]
    pub burn: usize,

    /// Attach a merged profile of the watched thread to each hang
    #[arg(long)]
    pub profile: bool,

    /// Resolve frames with DWARF debug info instead of the dynamic loader
    #[arg(long)]
    pub dwarf: bool,

    /// Write call trees to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Engine configuration for these arguments
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            hang_threshold: Duration::from_millis(self.hang_threshold_ms),
            per_stack_interval: Duration::from_millis(self.interval_ms),
            check_period: Duration::from_millis(self.check_period_ms),
            main_thread_profile: self.profile,
            cpu_limit_percent: self.cpu_limit,
            power_consume_cpu_limit: self.cpu_limit,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_default_config() {
        let args = Args::parse_from(["stallwatch"]);
        assert_eq!(args.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_flags_map_onto_config() {
        let args = Args::parse_from([
            "stallwatch",
            "--hang-threshold-ms",
            "500",
            "--interval-ms",
            "10",
            "--cpu-limit",
            "50",
            "--profile",
        ]);
        let config = args.engine_config();
        assert_eq!(config.sample_capacity(), 50);
        assert!(config.main_thread_profile);
        assert!((config.power_consume_cpu_limit - 50.0).abs() < f32::EPSILON);
    }
}
