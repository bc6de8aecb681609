//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a raw CPU reading
//! where a thread id is expected, and make function signatures more expressive.

use std::fmt;

/// Kernel thread ID
///
/// The value returned by `gettid()`, which is also the directory name under
/// `/proc/self/task`. This is the join key between a sampled thread and the
/// asynchronous origin recorded for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

impl From<i32> for Tid {
    #[allow(clippy::cast_sign_loss)]
    fn from(tid: i32) -> Self {
        Tid(tid as u32)
    }
}

impl From<Tid> for i32 {
    #[allow(clippy::cast_possible_wrap)]
    fn from(tid: Tid) -> Self {
        tid.0 as i32
    }
}

/// CPU usage in percent of one core
///
/// 100.0 means one core fully busy; multi-threaded processes can exceed 100.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct CpuPercent(pub f32);

impl CpuPercent {
    /// CPU-seconds consumed over `elapsed_seconds` at this usage
    #[must_use]
    pub fn cpu_seconds(self, elapsed_seconds: f32) -> f32 {
        self.0 * elapsed_seconds
    }
}

impl fmt::Display for CpuPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.0)
    }
}

/// Kind of stall a report describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumpType {
    /// Watched thread stopped beating while the app is in the foreground
    MainThreadBlock,
    /// Watched thread stopped beating while the app is backgrounded
    BackgroundMainThreadBlock,
    /// Watched thread is stalled and the process is burning CPU
    CpuBlock,
    /// Average CPU stayed above the limit for a whole tracking window
    PowerConsume,
}

impl fmt::Display for DumpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DumpType::MainThreadBlock => "main-thread-block",
            DumpType::BackgroundMainThreadBlock => "background-main-thread-block",
            DumpType::CpuBlock => "cpu-block",
            DumpType::PowerConsume => "power-consume",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_display() {
        assert_eq!(Tid(4242).to_string(), "TID:4242");
    }

    #[test]
    fn test_tid_conversion() {
        let tid = Tid::from(1234i32);
        assert_eq!(tid.0, 1234);
        let back: i32 = tid.into();
        assert_eq!(back, 1234);
    }

    #[test]
    fn test_cpu_seconds() {
        assert!((CpuPercent(90.0).cpu_seconds(2.0) - 180.0).abs() < f32::EPSILON);
        assert_eq!(CpuPercent(12.34).to_string(), "12.3%");
    }

    #[test]
    fn test_dump_type_display() {
        assert_eq!(DumpType::PowerConsume.to_string(), "power-consume");
        assert_eq!(DumpType::MainThreadBlock.to_string(), "main-thread-block");
    }
}
