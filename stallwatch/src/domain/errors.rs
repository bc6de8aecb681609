//! Structured error types for stallwatch
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these cross a component boundary as a panic: callers turn them into
//! dropped samples, partial stacks or a disabled feature.

use std::collections::TryReserveError;

use super::types::Tid;
use thiserror::Error;

/// Failure to capture a foreign thread's stack. The sample is dropped.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Sampler is already suspending another thread")]
    SamplerBusy,

    #[error("Failed to signal thread {tid}: {source}")]
    SignalFailed { tid: Tid, source: std::io::Error },

    #[error("Thread {0} did not acknowledge suspension")]
    SuspendTimeout(Tid),

    #[error("Failed to install sampling signal handler: {0}")]
    HandlerInstall(std::io::Error),

    #[error("Live thread capture is not supported on this platform")]
    Unsupported,

    #[error("Failed to reserve stack buffer: {0}")]
    Allocation(#[from] TryReserveError),
}

/// A stack walk that was cut short. The frames walked so far are kept.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAbort {
    #[error("Stack walk exceeded depth ceiling of {0} frames")]
    DepthCeiling(usize),

    #[error("Frame pointer chain broken at depth {depth} (fp = 0x{frame_pointer:x})")]
    BrokenChain { depth: usize, frame_pointer: usize },
}

/// Asynchronous submission interception could not be installed.
#[derive(Error, Debug)]
pub enum HookInstallError {
    #[error("Asynchronous submission interception is not supported on this platform")]
    Unsupported,

    #[error("Same-thread stack capture returned no frames")]
    CaptureUnavailable,
}

/// A configuration value the engine cannot run with
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("{field} must lie in {min}..={max}, got {value}")]
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },

    #[error("per-stack interval ({interval_ms} ms) must be shorter than the hang threshold ({threshold_ms} ms)")]
    IntervalExceedsThreshold { interval_ms: u128, threshold_ms: u128 },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to reserve {what} buffer: {source}")]
    Allocation { what: &'static str, source: TryReserveError },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn {name} thread: {source}")]
    SpawnFailed { name: &'static str, source: std::io::Error },
}
