//! Hang and CPU-stall detection
//!
//! - **`hang_point`**: ring of watched-thread samples and Point Stack selection
//! - **`cpu_annealing`**: sustained-overload and background-starvation checks
//! - **`dump_filter`**: suppresses meaningless, repeated, or excess reports
//! - **`thread_cpu`**: CPU usage per thread from `/proc`
//! - **`ring_buffer`**: the fixed-capacity buffer behind the sample ring and
//!   the call-tree pool

pub mod cpu_annealing;
pub mod dump_filter;
pub mod hang_point;
pub mod ring_buffer;
pub mod thread_cpu;

pub use cpu_annealing::{
    AnnealingConfig, BackgroundCpuState, CpuAnnealingDetector, CpuTrackerState, Detection,
    TrackerMode, MAX_TICK_SECONDS,
};
pub use dump_filter::{DumpFilter, FilterVerdict};
pub use hang_point::{HangPointDetector, HangPointResult, SampleSlot};
pub use ring_buffer::RingBuffer;
pub use thread_cpu::{CpuSnapshot, ThreadCpuSampler};
