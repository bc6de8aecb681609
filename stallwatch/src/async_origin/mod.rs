//! # Asynchronous origin tracking
//!
//! A worker thread that hangs inside a task tells you *what* is running but
//! not *who asked for it*. The tracker remembers, per worker thread, the stack
//! of the thread that submitted the work it is currently executing, and can
//! stitch that issuer stack under the executing one.
//!
//! ```text
//! submitting thread T1                 worker thread T2
//!   wrap(work) ── capture T1 stack ──▶ first action: origins[T2] = T1 stack
//!                                      work()
//!
//! sampler:  stitch(T2 stack, T2)
//!           ┌─────────────┬──────────────────┬──────────────┐
//!           │ T2 frames   │  ASYNC_BOUNDARY  │  T1 frames   │
//!           └─────────────┴──────────────────┴──────────────┘
//!            innermost                            outermost
//! ```
//!
//! The most recent submission executed on a thread wins. Records of threads
//! that have exited are dropped by [`AsyncOriginTracker::sweep_stale`].

pub mod hook;

pub use hook::{InProcessHook, SubmissionHook, UnsupportedHook};

use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll};

use crate::domain::{Tid, WalkAbort};
use crate::process::{current_tid, thread_exists};
use crate::stack::{
    capture_current_thread, CapturedStack, ASYNC_BOUNDARY, DEFAULT_STACK_DEPTH, MAX_STACK_DEPTH,
};

/// Issuer stack per executing thread
#[derive(Debug, Default)]
struct OriginTable {
    origins: Mutex<HashMap<Tid, Arc<CapturedStack>>>,
}

impl OriginTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Tid, Arc<CapturedStack>>> {
        self.origins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, tid: Tid, issuer: Arc<CapturedStack>) {
        self.lock().insert(tid, issuer);
    }
}

/// What a wrapper carries from the submitting thread to the executing one
#[derive(Debug, Clone)]
struct Origin {
    table: Arc<OriginTable>,
    issuer: Arc<CapturedStack>,
}

impl Origin {
    fn record_on_current_thread(&self) {
        self.table.record(current_tid(), Arc::clone(&self.issuer));
    }
}

pub struct AsyncOriginTracker {
    table: Arc<OriginTable>,
    hook: Box<dyn SubmissionHook>,
    installed: AtomicBool,
    failure_reported: AtomicBool,
    max_depth: usize,
}

impl AsyncOriginTracker {
    #[must_use]
    pub fn new(hook: Box<dyn SubmissionHook>, max_depth: usize) -> Self {
        Self {
            table: Arc::default(),
            hook,
            installed: AtomicBool::new(false),
            failure_reported: AtomicBool::new(false),
            max_depth,
        }
    }

    /// Process-wide tracker using [`InProcessHook`]
    pub fn global() -> &'static AsyncOriginTracker {
        static GLOBAL: OnceLock<AsyncOriginTracker> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(Box::new(InProcessHook), DEFAULT_STACK_DEPTH))
    }

    /// Install submission interception. Returns false when the platform hook
    /// fails; the tracker then records nothing and the failure is logged once.
    pub fn install(&self) -> bool {
        if self.installed.load(Ordering::Acquire) {
            return true;
        }
        match self.hook.install() {
            Ok(()) => {
                self.installed.store(true, Ordering::Release);
                info!("Async origin tracking installed ({} hook)", self.hook.name());
                true
            }
            Err(e) => {
                if !self.failure_reported.swap(true, Ordering::Relaxed) {
                    warn!("Async origin tracking disabled: {e}");
                }
                false
            }
        }
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Capture the submitting thread's stack. Skips this frame and the
    /// `wrap`/`wrap_future` frame that called it, so the issuer stack starts
    /// at the submitter's own code.
    #[inline(never)]
    fn capture_origin(&self) -> Option<Origin> {
        if !self.is_installed() {
            return None;
        }
        let issuer = capture_current_thread(2, self.max_depth);
        if issuer.is_empty() {
            return None;
        }
        Some(Origin { table: Arc::clone(&self.table), issuer: Arc::new(issuer) })
    }

    /// Wrap `work` before handing it to another thread.
    ///
    /// The submitting thread's stack is captured now. The first thing the
    /// returned closure does on whichever thread runs it is record that
    /// stack as the thread's origin.
    #[inline(never)]
    pub fn wrap<F, R>(&self, work: F) -> impl FnOnce() -> R + Send + 'static
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let origin = self.capture_origin();
        move || {
            if let Some(origin) = origin {
                origin.record_on_current_thread();
            }
            work()
        }
    }

    /// Wrap a future before spawning it. The origin is recorded on every poll,
    /// since a task can move between worker threads.
    #[inline(never)]
    pub fn wrap_future<F: Future>(&self, future: F) -> TracedFuture<F> {
        let origin = self.capture_origin();
        TracedFuture { inner: Box::pin(future), origin }
    }

    /// Issuer stack of the work `tid` is executing, if any was recorded
    #[must_use]
    pub fn lookup_origin(&self, tid: Tid) -> Option<Arc<CapturedStack>> {
        self.table.lock().get(&tid).cloned()
    }

    /// Append the issuer stack recorded for `tid` below `executing`,
    /// separated by [`ASYNC_BOUNDARY`].
    ///
    /// The result never exceeds [`MAX_STACK_DEPTH`]. Without a record, when
    /// `executing` is empty or already stitched, or when there is no room for
    /// the boundary plus at least one issuer frame, it is returned as is.
    #[must_use]
    pub fn stitch(&self, executing: &CapturedStack, tid: Tid) -> CapturedStack {
        if executing.is_empty()
            || executing.contains_async_boundary()
            || executing.depth() + 2 > MAX_STACK_DEPTH
        {
            return executing.clone();
        }
        let Some(issuer) = self.lookup_origin(tid).filter(|issuer| !issuer.is_empty()) else {
            return executing.clone();
        };

        let wanted = executing.depth() + 1 + issuer.depth();
        let mut addresses = Vec::new();
        if let Err(e) = addresses.try_reserve_exact(wanted.min(MAX_STACK_DEPTH)) {
            warn!("Skipping origin stitch for {tid}: {e}");
            return executing.clone();
        }
        addresses.extend_from_slice(executing.addresses());
        addresses.push(ASYNC_BOUNDARY);
        let room = MAX_STACK_DEPTH - addresses.len();
        addresses.extend(issuer.addresses().iter().take(room));

        let abort = if wanted > MAX_STACK_DEPTH {
            Some(WalkAbort::DepthCeiling(MAX_STACK_DEPTH))
        } else {
            executing.abort_reason()
        };
        CapturedStack::from_walk(addresses, executing.leading_pc(), abort)
    }

    /// Drop records of threads that no longer exist. Returns how many went.
    pub fn sweep_stale(&self) -> usize {
        let mut origins = self.table.lock();
        let before = origins.len();
        origins.retain(|&tid, _| thread_exists(tid));
        let removed = before - origins.len();
        if removed > 0 {
            debug!("Swept {removed} stale async origins, {} remain", origins.len());
        }
        removed
    }

    /// Forget the origin of `tid`, e.g. once it finished the wrapped work
    pub fn forget(&self, tid: Tid) {
        self.table.lock().remove(&tid);
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.table.lock().len()
    }
}

/// Future returned by [`AsyncOriginTracker::wrap_future`]
pub struct TracedFuture<F> {
    inner: Pin<Box<F>>,
    origin: Option<Origin>,
}

impl<F: Future> Future for TracedFuture<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(origin) = &self.origin {
            origin.record_on_current_thread();
        }
        self.inner.as_mut().poll(cx)
    }
}
