//! Point Stack selection over the watched thread's recent samples
//!
//! ```text
//!  time ──▶   A    A    A    B    B        innermost address
//!  streak     0    1    2    0    1
//!                       ▲
//!                       └── longest streak, most recent on ties
//! ```
//!
//! The slot with the longest run of identical innermost addresses is where the
//! thread sat still the longest, so it is the best hang candidate. Once the
//! ring has wrapped, slot index order no longer matches time order; streaks
//! and tie-breaking always follow time order.

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::analysis::call_tree::{build_forest, Forest, WeightedStack};
use crate::domain::{CpuPercent, EngineError};
use crate::stack::{CapturedStack, ASYNC_BOUNDARY};
use crate::symbolization::{LoaderSymbolizer, SymbolResolver};

use super::ring_buffer::RingBuffer;

/// One periodic sample of the watched thread
#[derive(Debug, Clone)]
pub struct SampleSlot {
    pub stack: Arc<CapturedStack>,
    pub cpu_percent: CpuPercent,
    pub is_background: bool,
    /// Consecutive preceding-in-time samples sharing this innermost address
    pub top_repeat_streak: u32,
    pub captured_at: Instant,
}

/// The sample chosen as the hang location
#[derive(Debug, Clone)]
pub struct HangPointResult {
    pub selected_stack: Arc<CapturedStack>,
    /// For each address of `selected_stack`, how often it appears across every
    /// address of every stored sample
    pub per_address_total_occurrence: Vec<u32>,
    pub top_repeat_streak: u32,
    pub cpu_percent: CpuPercent,
    pub is_background: bool,
}

impl HangPointResult {
    /// Index of the frame present in the most samples, innermost on ties
    #[must_use]
    pub fn most_consistent_frame(&self) -> Option<usize> {
        let max = *self.per_address_total_occurrence.iter().max()?;
        self.per_address_total_occurrence.iter().position(|&c| c == max)
    }
}

/// Ring of the last N stack samples of one watched thread
pub struct HangPointDetector {
    ring: Mutex<RingBuffer<SampleSlot>>,
}

impl HangPointDetector {
    /// # Errors
    /// Fails if `capacity` is zero or the ring cannot be allocated
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        Ok(Self { ring: Mutex::new(RingBuffer::try_new(capacity)?) })
    }

    fn lock(&self) -> MutexGuard<'_, RingBuffer<SampleSlot>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sample, overwriting the oldest once full
    pub fn add_sample(&self, stack: CapturedStack, cpu_percent: CpuPercent, is_background: bool) {
        self.add_shared_sample(Arc::new(stack), cpu_percent, is_background);
    }

    pub fn add_shared_sample(
        &self,
        stack: Arc<CapturedStack>,
        cpu_percent: CpuPercent,
        is_background: bool,
    ) {
        let captured_at = Instant::now();
        let mut ring = self.lock();
        let top_repeat_streak = match (ring.newest(), stack.innermost()) {
            (Some(previous), Some(top)) if previous.stack.innermost() == Some(top) => {
                previous.top_repeat_streak + 1
            }
            _ => 0,
        };
        ring.push_overwriting(SampleSlot {
            stack,
            cpu_percent,
            is_background,
            top_repeat_streak,
            captured_at,
        });
    }

    /// Pick the sample most likely to be the hang.
    ///
    /// Returns `None` when no sample has been added. Calling it repeatedly on
    /// an unchanged buffer returns the same sample.
    #[must_use]
    pub fn select_hang_point(&self) -> Option<HangPointResult> {
        let (selected, stacks) = {
            let ring = self.lock();
            let max_streak = ring.iter_by_index().map(|s| s.top_repeat_streak).max()?;
            let selected =
                ring.iter_newest_to_oldest().find(|s| s.top_repeat_streak == max_streak)?.clone();
            let stacks: Vec<Arc<CapturedStack>> =
                ring.iter_by_index().map(|s| Arc::clone(&s.stack)).collect();
            (selected, stacks)
        };

        let mut occurrences: HashMap<usize, u32> = HashMap::new();
        for stack in &stacks {
            for &address in stack.addresses() {
                *occurrences.entry(address).or_insert(0) += 1;
            }
        }
        let per_address_total_occurrence = selected
            .stack
            .addresses()
            .iter()
            .map(|address| {
                if *address == ASYNC_BOUNDARY {
                    0
                } else {
                    occurrences.get(address).copied().unwrap_or(0)
                }
            })
            .collect();

        debug!(
            "Hang point: streak {} at depth {}, {} samples buffered",
            selected.top_repeat_streak,
            selected.stack.depth(),
            stacks.len()
        );

        Some(HangPointResult {
            selected_stack: selected.stack,
            per_address_total_occurrence,
            top_repeat_streak: selected.top_repeat_streak,
            cpu_percent: selected.cpu_percent,
            is_background: selected.is_background,
        })
    }

    /// Up to `limit` most recent stacks, newest first
    #[must_use]
    pub fn recent_stacks(&self, limit: usize) -> Vec<Arc<CapturedStack>> {
        self.lock().iter_newest_to_oldest().take(limit).map(|s| Arc::clone(&s.stack)).collect()
    }

    #[must_use]
    pub fn last_sample(&self) -> Option<SampleSlot> {
        self.lock().newest().cloned()
    }

    /// Deepest stack currently buffered
    #[must_use]
    pub fn max_stack_depth(&self) -> usize {
        self.lock().iter_by_index().map(|s| s.stack.depth()).max().unwrap_or(0)
    }

    /// Merge every buffered sample, each with weight 1, into a call tree
    #[must_use]
    pub fn profile(&self) -> Forest {
        self.profile_with(LoaderSymbolizer::global())
    }

    #[must_use]
    pub fn profile_with(&self, resolver: &dyn SymbolResolver) -> Forest {
        let stacks: Vec<WeightedStack> = self
            .lock()
            .iter_newest_to_oldest()
            .map(|s| WeightedStack::with_weight(Arc::clone(&s.stack), 1, s.is_background))
            .collect();
        build_forest(&stacks, resolver)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Forget every sample, e.g. once a hang has been reported
    pub fn clear(&self) {
        self.lock().clear();
    }
}
