//! Per-thread and whole-process CPU usage between two checks

use anyhow::Result;
use std::collections::HashMap;
use std::time::Instant;

use crate::domain::{CpuPercent, Tid};
use crate::process::{clock_ticks_per_second, thread_cpu_times, ThreadCpuTime};

/// CPU usage over one interval
#[derive(Debug, Clone, Default)]
pub struct CpuSnapshot {
    pub elapsed_seconds: f32,
    /// Sum over all threads; may exceed 100 on several cores
    pub process: CpuPercent,
    /// Busiest first
    pub threads: Vec<(Tid, CpuPercent)>,
}

impl CpuSnapshot {
    #[must_use]
    pub fn thread(&self, tid: Tid) -> Option<CpuPercent> {
        self.threads.iter().find(|(t, _)| *t == tid).map(|(_, cpu)| *cpu)
    }

    /// Threads at or above `threshold`, busiest first
    pub fn hot_threads(&self, threshold: CpuPercent) -> impl Iterator<Item = (Tid, CpuPercent)> + '_ {
        self.threads.iter().copied().take_while(move |(_, cpu)| *cpu >= threshold)
    }
}

/// Differences `/proc/self/task/*/stat` readings between calls
pub struct ThreadCpuSampler {
    previous: HashMap<Tid, u64>,
    previous_at: Instant,
    ticks_per_second: f32,
}

impl ThreadCpuSampler {
    /// Take the baseline reading
    ///
    /// # Errors
    /// Returns an error if `/proc/self/task` cannot be read
    #[allow(clippy::cast_precision_loss)]
    pub fn new() -> Result<Self> {
        Ok(Self {
            previous: Self::totals(&thread_cpu_times()?),
            previous_at: Instant::now(),
            ticks_per_second: clock_ticks_per_second() as f32,
        })
    }

    fn totals(times: &[ThreadCpuTime]) -> HashMap<Tid, u64> {
        times.iter().map(|t| (t.tid, t.total_ticks())).collect()
    }

    /// Usage since the previous call (or since construction)
    ///
    /// # Errors
    /// Returns an error if `/proc/self/task` cannot be read
    pub fn sample(&mut self) -> Result<CpuSnapshot> {
        let now = Instant::now();
        let current = Self::totals(&thread_cpu_times()?);
        let elapsed = now.duration_since(self.previous_at).as_secs_f32();
        let snapshot = self.diff(&current, elapsed);
        self.previous = current;
        self.previous_at = now;
        Ok(snapshot)
    }

    /// Threads absent from the previous reading were born during the interval,
    /// so their whole total counts.
    #[allow(clippy::cast_precision_loss)]
    fn diff(&self, current: &HashMap<Tid, u64>, elapsed_seconds: f32) -> CpuSnapshot {
        if elapsed_seconds <= 0.0 {
            return CpuSnapshot::default();
        }
        let mut threads: Vec<(Tid, CpuPercent)> = current
            .iter()
            .map(|(&tid, &ticks)| {
                let before = self.previous.get(&tid).copied().unwrap_or(0);
                let delta = ticks.saturating_sub(before) as f32;
                (tid, CpuPercent(delta / self.ticks_per_second / elapsed_seconds * 100.0))
            })
            .collect();
        threads.sort_by(|a, b| b.1 .0.total_cmp(&a.1 .0).then(a.0.cmp(&b.0)));
        let process = CpuPercent(threads.iter().map(|(_, cpu)| cpu.0).sum());
        CpuSnapshot { elapsed_seconds, process, threads }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(previous: &[(u32, u64)]) -> ThreadCpuSampler {
        ThreadCpuSampler {
            previous: previous.iter().map(|&(t, ticks)| (Tid(t), ticks)).collect(),
            previous_at: Instant::now(),
            ticks_per_second: 100.0,
        }
    }

    #[test]
    fn test_diff_computes_percent() {
        let s = sampler(&[(1, 100), (2, 50)]);
        let current = HashMap::from([(Tid(1), 180), (Tid(2), 55), (Tid(3), 10)]);
        let snapshot = s.diff(&current, 1.0);

        let approx = |tid: u32, expected: f32| {
            let cpu = snapshot.thread(Tid(tid)).unwrap();
            assert!((cpu.0 - expected).abs() < 1e-3, "{tid}: {cpu}");
        };
        approx(1, 80.0);
        approx(2, 5.0);
        // Newly born thread
        approx(3, 10.0);
        assert!((snapshot.process.0 - 95.0).abs() < 1e-3);
        assert_eq!(snapshot.threads[0].0, Tid(1));
    }

    #[test]
    fn test_hot_threads() {
        let s = sampler(&[]);
        let current = HashMap::from([(Tid(1), 50), (Tid(2), 3), (Tid(3), 20)]);
        let snapshot = s.diff(&current, 1.0);
        let hot: Vec<Tid> = snapshot.hot_threads(CpuPercent(5.0)).map(|(t, _)| t).collect();
        assert_eq!(hot, vec![Tid(1), Tid(3)]);
    }

    #[test]
    fn test_zero_elapsed_is_empty() {
        let s = sampler(&[]);
        let snapshot = s.diff(&HashMap::from([(Tid(1), 50)]), 0.0);
        assert!(snapshot.threads.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_live_sample() {
        let mut sampler = ThreadCpuSampler::new().unwrap();
        let mut x = 0u64;
        for i in 0..2_000_000u64 {
            x = std::hint::black_box(x ^ i);
        }
        let snapshot = sampler.sample().unwrap();
        assert!(snapshot.elapsed_seconds > 0.0);
        assert!(snapshot.process.0 >= 0.0);
        assert!(snapshot.thread(crate::process::current_tid()).is_some());
    }
}
