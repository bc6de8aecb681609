//! Thread identity and liveness for the current process.
//!
//! Everything here reads `/proc/self/task`, so it only answers questions about
//! threads of the monitored process itself.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::domain::Tid;

/// Kernel thread id of the calling thread.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[must_use]
pub fn current_tid() -> Tid {
    // SAFETY: gettid takes no arguments and cannot fail
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    Tid(tid as u32)
}

/// Kernel thread id of the calling thread.
///
/// Without `gettid` we fall back to a per-thread counter so ids stay unique
/// within the process.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn current_tid() -> Tid {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static TID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    Tid(TID.with(|tid| *tid))
}

/// Whether `tid` is still a live thread of this process.
#[cfg(target_os = "linux")]
#[must_use]
pub fn thread_exists(tid: Tid) -> bool {
    Path::new(&format!("/proc/self/task/{}", tid.0)).exists()
}

/// Whether `tid` is still a live thread of this process.
///
/// No liveness query is available, so records are kept.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn thread_exists(_tid: Tid) -> bool {
    true
}

/// A thread of the current process
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub comm: String,
}

/// List threads of the current process by reading `/proc/self/task/*/comm`
///
/// # Errors
/// Returns an error if `/proc/self/task` cannot be read
pub fn list_threads() -> Result<Vec<ThreadInfo>> {
    let task_dir = "/proc/self/task";
    let entries = fs::read_dir(task_dir).context(format!("Failed to read {task_dir}"))?;

    let mut threads: Vec<ThreadInfo> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_string_lossy().parse::<u32>().ok()?;
            // Thread may exit between readdir and this read
            let comm = fs::read_to_string(format!("{task_dir}/{tid}/comm")).ok()?;
            Some(ThreadInfo { tid: Tid(tid), comm: comm.trim().to_string() })
        })
        .collect();

    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

/// Cumulative CPU time of one thread, in clock ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadCpuTime {
    pub tid: Tid,
    pub user_ticks: u64,
    pub system_ticks: u64,
}

impl ThreadCpuTime {
    #[must_use]
    pub fn total_ticks(&self) -> u64 {
        self.user_ticks + self.system_ticks
    }
}

/// Read utime/stime for every thread of the current process
///
/// Threads that exit while the directory is being walked are skipped.
///
/// # Errors
/// Returns an error if `/proc/self/task` cannot be read
pub fn thread_cpu_times() -> Result<Vec<ThreadCpuTime>> {
    let task_dir = "/proc/self/task";
    let entries = fs::read_dir(task_dir).context(format!("Failed to read {task_dir}"))?;

    Ok(entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_string_lossy().parse::<u32>().ok()?;
            let stat = fs::read_to_string(format!("{task_dir}/{tid}/stat")).ok()?;
            parse_cpu_ticks(&stat).ok().map(|(user_ticks, system_ticks)| ThreadCpuTime {
                tid: Tid(tid),
                user_ticks,
                system_ticks,
            })
        })
        .collect())
}

/// Clock ticks per second used by `/proc/*/stat` time fields
#[cfg(unix)]
#[allow(unsafe_code)]
#[allow(clippy::cast_sign_loss)]
#[must_use]
pub fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// Clock ticks per second used by `/proc/*/stat` time fields
#[cfg(not(unix))]
#[must_use]
pub fn clock_ticks_per_second() -> u64 {
    100
}

/// Extract (utime, stime) from a `/proc/<pid>/task/<tid>/stat` line.
///
/// Format: "tid (comm) state ppid ... utime stime ...", where utime and stime
/// are fields 14 and 15. The comm may itself contain spaces and parentheses,
/// so fields are counted from the last ')'.
fn parse_cpu_ticks(stat_line: &str) -> Result<(u64, u64)> {
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    let fields: Vec<&str> = stat_line[close + 1..].split_whitespace().collect();
    // fields[0] is the state (field 3), so utime (field 14) is fields[11]
    if fields.len() < 13 {
        bail!("Invalid stat format: only {} fields after comm", fields.len());
    }
    let user = fields[11].parse::<u64>().context("Failed to parse utime")?;
    let system = fields[12].parse::<u64>().context("Failed to parse stime")?;
    Ok((user, system))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_ticks() {
        let stat = "1234 (my-app) S 1 1234 1234 0 -1 4194304 100 0 0 0 42 7 0 0 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat).unwrap(), (42, 7));
    }

    #[test]
    fn test_parse_cpu_ticks_with_parens() {
        // Thread names can contain parentheses and spaces
        let stat = "1234 (app (v2) x) R 1 1 1 0 -1 0 0 0 0 0 5 6 0 0 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat).unwrap(), (5, 6));
    }

    #[test]
    fn test_parse_cpu_ticks_truncated() {
        assert!(parse_cpu_ticks("1234 (x) S 1 2").is_err());
        assert!(parse_cpu_ticks("garbage").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_thread_is_listed() {
        let me = current_tid();
        assert!(thread_exists(me));

        let threads = list_threads().unwrap();
        assert!(threads.iter().any(|t| t.tid == me));

        let times = thread_cpu_times().unwrap();
        assert!(times.iter().any(|t| t.tid == me));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_exited_thread_is_not_alive() {
        let tid = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(tid, current_tid());
        assert!(!thread_exists(tid));
    }

    #[test]
    fn test_clock_ticks_positive() {
        assert!(clock_ticks_per_second() > 0);
    }
}
