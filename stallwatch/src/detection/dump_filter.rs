//! Decides whether a detected hang is worth reporting
//!
//! A thread stuck on the same stack keeps being detected every check period.
//! The first detection is reported; repeats of the same hang are skipped for
//! a Fibonacci-growing number of checks (1, 1, 2, 3, 5, ...) until the stack
//! changes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use super::hang_point::HangPointResult;

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Report,
    /// Stack too shallow to attribute anything
    Meaningless,
    /// Same hang as the last report, still backing off
    Annealing,
    /// Daily report limit reached
    TooManyToday,
}

impl FilterVerdict {
    #[must_use]
    pub fn should_report(self) -> bool {
        self == FilterVerdict::Report
    }
}

#[derive(Debug, Clone)]
pub struct DumpFilter {
    min_meaningful_depth: usize,
    daily_limit: u32,
    last_key: Option<u64>,
    skips_remaining: u64,
    /// Consecutive Fibonacci terms; `fib_next` is the next skip budget
    fib_current: u64,
    fib_next: u64,
    day: u64,
    reports_today: u32,
}

impl DumpFilter {
    #[must_use]
    pub fn new(min_meaningful_depth: usize, daily_limit: u32) -> Self {
        Self {
            min_meaningful_depth,
            daily_limit,
            last_key: None,
            skips_remaining: 0,
            fib_current: 0,
            fib_next: 1,
            day: 0,
            reports_today: 0,
        }
    }

    /// Classify a hang candidate observed at `now`
    pub fn check(&mut self, result: &HangPointResult, now: SystemTime) -> FilterVerdict {
        let executing = result.selected_stack.executing_part();
        if executing.len() < self.min_meaningful_depth {
            return FilterVerdict::Meaningless;
        }

        let key = hang_key(executing);
        let repeat = self.last_key == Some(key);
        if repeat && self.skips_remaining > 0 {
            self.skips_remaining -= 1;
            return FilterVerdict::Annealing;
        }

        // A suppressed report leaves the back-off where it was
        let day = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() / SECONDS_PER_DAY);
        if day != self.day {
            self.day = day;
            self.reports_today = 0;
        }
        if self.reports_today >= self.daily_limit {
            return FilterVerdict::TooManyToday;
        }

        if repeat {
            // Back-off exhausted: report again and lengthen the next one
            let next = self.fib_current + self.fib_next;
            self.fib_current = self.fib_next;
            self.fib_next = next;
        } else {
            self.last_key = Some(key);
            self.fib_current = 0;
            self.fib_next = 1;
        }
        self.skips_remaining = self.fib_next;
        self.reports_today += 1;
        FilterVerdict::Report
    }

    /// The watched thread made progress; the next hang starts fresh
    pub fn reset_annealing(&mut self) {
        self.last_key = None;
        self.skips_remaining = 0;
        self.fib_current = 0;
        self.fib_next = 1;
    }

    #[must_use]
    pub fn reports_today(&self) -> u32 {
        self.reports_today
    }
}

fn hang_key(addresses: &[usize]) -> u64 {
    let mut hasher = DefaultHasher::new();
    addresses.hash(&mut hasher);
    hasher.finish()
}
