//! # Block monitor
//!
//! Drives the detectors from two background threads.
//!
//! ```text
//!  watched thread ──beat()──▶ Heartbeat
//!                                │
//!  sampler (per_stack_interval)  │         checker (check_period)
//!    capture_thread(watched)     │           /proc CPU snapshot
//!    stitch async origin         │           annealing.check ──▶ PowerConsume build
//!    HangPointDetector.add ◀─────┼────────── hot threads ──▶ CallTreeAggregator
//!                                └─────────▶ stalled? select_hang_point
//!                                            DumpFilter ──▶ Hang / Filtered
//!                                            sweep stale origins
//!                                                 │
//!                                                 ▼
//!                                  crossbeam channel of MonitorEvent
//! ```
//!
//! Both threads stop when the [`BlockMonitor`] is dropped.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::analysis::{CallTreeAggregator, Forest};
use crate::async_origin::AsyncOriginTracker;
use crate::config::EngineConfig;
use crate::detection::{
    CpuAnnealingDetector, CpuSnapshot, Detection, DumpFilter, FilterVerdict, HangPointDetector,
    HangPointResult, ThreadCpuSampler,
};
use crate::domain::{CaptureError, CpuPercent, DumpType, EngineError, Tid};
use crate::process::{current_tid, thread_exists};
use crate::stack::capture_thread;

/// Events buffered before the checker starts dropping them
const EVENT_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// HEARTBEAT
// =============================================================================

/// Liveness signal of the watched thread.
///
/// The watched thread calls [`Heartbeat::beat`] whenever it finishes a unit of
/// work; the monitor reports a hang once no beat arrived for the hang
/// threshold.
#[derive(Debug)]
pub struct Heartbeat {
    tid: Tid,
    epoch: Instant,
    last_beat_nanos: AtomicU64,
}

impl Heartbeat {
    /// Heartbeat of the calling thread, beaten once already
    #[must_use]
    pub fn for_current_thread() -> Arc<Self> {
        Arc::new(Self::for_thread(current_tid()))
    }

    #[must_use]
    pub fn for_thread(tid: Tid) -> Self {
        Self { tid, epoch: Instant::now(), last_beat_nanos: AtomicU64::new(0) }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn beat(&self) {
        let now = self.epoch.elapsed().as_nanos() as u64;
        self.last_beat_nanos.store(now, Ordering::Release);
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Time since the last beat
    #[must_use]
    pub fn stalled_for(&self) -> Duration {
        let last = Duration::from_nanos(self.last_beat_nanos.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone)]
pub struct HangReport {
    pub dump_type: DumpType,
    pub stalled_for: Duration,
    pub hang_point: HangPointResult,
    /// Every buffered sample merged, when `main_thread_profile` is on
    pub profile: Option<Forest>,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Hang(HangReport),
    /// Average process CPU stayed over the limit for a whole tracking window
    PowerConsume { cpu_percent: CpuPercent, forest: Forest },
    BackgroundStarved { cpu_percent: CpuPercent },
    /// A hang the dump filter decided not to report
    Filtered { dump_type: DumpType, verdict: FilterVerdict },
}

impl MonitorEvent {
    /// Kind of report this event carries, if any
    #[must_use]
    pub fn dump_type(&self) -> Option<DumpType> {
        match self {
            MonitorEvent::Hang(report) => Some(report.dump_type),
            MonitorEvent::PowerConsume { .. } => Some(DumpType::PowerConsume),
            MonitorEvent::BackgroundStarved { .. } | MonitorEvent::Filtered { .. } => None,
        }
    }
}

// =============================================================================
// MONITOR
// =============================================================================

/// State both monitor threads read
struct Shared {
    config: EngineConfig,
    heartbeat: Arc<Heartbeat>,
    detector: HangPointDetector,
    aggregator: CallTreeAggregator,
    origins: &'static AsyncOriginTracker,
    background: AtomicBool,
    /// `f32` bits of the watched thread's CPU over the last check
    watched_cpu_bits: AtomicU32,
    sampler_tid: AtomicU32,
    events: Sender<MonitorEvent>,
}

impl Shared {
    fn is_background(&self) -> bool {
        self.background.load(Ordering::Relaxed)
    }

    fn watched_cpu(&self) -> CpuPercent {
        CpuPercent(f32::from_bits(self.watched_cpu_bits.load(Ordering::Relaxed)))
    }

    fn emit(&self, event: MonitorEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            warn!("Monitor event queue full, dropping {:?} event", event.dump_type());
        }
    }
}

/// Watches one thread for hangs and the process for CPU stalls
pub struct BlockMonitor {
    shared: Arc<Shared>,
    events: Receiver<MonitorEvent>,
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl BlockMonitor {
    /// Start monitoring the thread `heartbeat` belongs to, using the global
    /// [`AsyncOriginTracker`]
    ///
    /// # Errors
    /// Returns [`EngineError`] if the configuration is invalid, a buffer
    /// cannot be allocated, or a monitor thread cannot be spawned
    pub fn start(config: EngineConfig, heartbeat: Arc<Heartbeat>) -> Result<Self, EngineError> {
        Self::start_with_origins(config, heartbeat, AsyncOriginTracker::global())
    }

    /// # Errors
    /// Same as [`BlockMonitor::start`]
    pub fn start_with_origins(
        config: EngineConfig,
        heartbeat: Arc<Heartbeat>,
        origins: &'static AsyncOriginTracker,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let detector = HangPointDetector::new(config.sample_capacity())?;
        let aggregator =
            CallTreeAggregator::new(config.stack_pool_capacity, config.call_tree_weight_divisor)?;
        origins.install();

        let (event_tx, event_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let shared = Arc::new(Shared {
            config,
            heartbeat,
            detector,
            aggregator,
            origins,
            background: AtomicBool::new(false),
            watched_cpu_bits: AtomicU32::new(0),
            sampler_tid: AtomicU32::new(0),
            events: event_tx,
        });

        let mut threads = Vec::with_capacity(2);
        let (s, stop) = (Arc::clone(&shared), stop_rx.clone());
        threads.push(
            std::thread::Builder::new()
                .name("stallwatch-sampler".into())
                .spawn(move || run_sampler(&s, &stop))
                .map_err(|source| EngineError::SpawnFailed { name: "sampler", source })?,
        );
        let (s, stop) = (Arc::clone(&shared), stop_rx);
        threads.push(
            std::thread::Builder::new()
                .name("stallwatch-checker".into())
                .spawn(move || Checker::new(s).run(&stop))
                .map_err(|source| EngineError::SpawnFailed { name: "checker", source })?,
        );

        info!(
            "Monitoring {} (hang threshold {:?}, {} samples)",
            shared.heartbeat.tid(),
            shared.config.hang_threshold,
            shared.config.sample_capacity()
        );
        Ok(Self { shared, events: event_rx, stop: Some(stop_tx), threads })
    }

    #[must_use]
    pub fn events(&self) -> &Receiver<MonitorEvent> {
        &self.events
    }

    /// Tell the monitor whether the application is in the background
    pub fn set_background(&self, is_background: bool) {
        self.shared.background.store(is_background, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_background(&self) -> bool {
        self.shared.is_background()
    }

    #[must_use]
    pub fn detector(&self) -> &HangPointDetector {
        &self.shared.detector
    }

    #[must_use]
    pub fn aggregator(&self) -> &CallTreeAggregator {
        &self.shared.aggregator
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Stop both threads and wait for them
    pub fn stop(self) {}
}

impl Drop for BlockMonitor {
    fn drop(&mut self) {
        // Disconnecting the stop channel wakes both threads
        drop(self.stop.take());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Monitor thread panicked");
            }
        }
        debug!("Block monitor stopped");
    }
}

/// Wait `period`; true once the monitor is shutting down
fn should_stop(stop: &Receiver<()>, period: Duration) -> bool {
    !matches!(stop.recv_timeout(period), Err(RecvTimeoutError::Timeout))
}

// =============================================================================
// SAMPLER
// =============================================================================

fn run_sampler(shared: &Shared, stop: &Receiver<()>) {
    shared.sampler_tid.store(current_tid().0, Ordering::Relaxed);
    let tid = shared.heartbeat.tid();
    let depth = shared.config.max_stack_depth;
    debug!("Sampling {tid} every {:?}", shared.config.per_stack_interval);

    while !should_stop(stop, shared.config.per_stack_interval) {
        match capture_thread(tid, depth) {
            Ok(stack) => {
                let stack = shared.origins.stitch(&stack, tid);
                shared.detector.add_sample(stack, shared.watched_cpu(), shared.is_background());
            }
            Err(CaptureError::Unsupported) => {
                warn!("Live stack capture unsupported here, hang detection disabled");
                return;
            }
            Err(e) => {
                if !thread_exists(tid) {
                    info!("Watched thread {tid} exited, sampler stopping");
                    return;
                }
                debug!("Dropped sample of {tid}: {e}");
            }
        }
    }
}

// =============================================================================
// CHECKER
// =============================================================================

struct Checker {
    shared: Arc<Shared>,
    annealing: CpuAnnealingDetector,
    filter: DumpFilter,
    cpu: Option<ThreadCpuSampler>,
    pending_build: Option<(Receiver<Forest>, CpuPercent)>,
    was_stalled: bool,
}

impl Checker {
    fn new(shared: Arc<Shared>) -> Self {
        let cpu = ThreadCpuSampler::new()
            .map_err(|e| warn!("CPU sampling unavailable, CPU checks disabled: {e:#}"))
            .ok();
        let config = &shared.config;
        Self {
            annealing: CpuAnnealingDetector::new(config.annealing()),
            filter: DumpFilter::new(config.min_meaningful_depth, config.dump_daily_limit),
            shared,
            cpu,
            pending_build: None,
            was_stalled: false,
        }
    }

    fn run(mut self, stop: &Receiver<()>) {
        while !should_stop(stop, self.shared.config.check_period) {
            self.tick();
        }
    }

    fn tick(&mut self) {
        let background = self.shared.is_background();
        let snapshot = self.sample_cpu();
        if let Some(snapshot) = &snapshot {
            let watched = snapshot.thread(self.shared.heartbeat.tid()).unwrap_or_default();
            self.shared.watched_cpu_bits.store(watched.0.to_bits(), Ordering::Relaxed);
            self.check_cpu(snapshot, background);
        }
        self.poll_pending_build();
        self.check_hang(snapshot.map(|s| s.process), background);
        self.shared.origins.sweep_stale();
    }

    fn sample_cpu(&mut self) -> Option<CpuSnapshot> {
        let sampler = self.cpu.as_mut()?;
        match sampler.sample() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!("CPU sample failed: {e:#}");
                None
            }
        }
    }

    fn check_cpu(&mut self, snapshot: &CpuSnapshot, background: bool) {
        let config = &self.shared.config;
        self.annealing.set_background(background);
        if config.capture_power_consume_stacks && snapshot.process.0 > config.power_consume_cpu_limit
        {
            self.pool_hot_threads(snapshot, background);
        }
        match self.annealing.check(snapshot.process, snapshot.elapsed_seconds) {
            Detection::SustainedOverload => self.start_power_build(snapshot.process),
            Detection::BackgroundStarved => {
                info!("Background CPU starved at {}", snapshot.process);
                self.shared.emit(MonitorEvent::BackgroundStarved { cpu_percent: snapshot.process });
            }
            Detection::None => {}
        }
    }

    /// Capture every hot thread except the monitor's own into the call-tree pool
    fn pool_hot_threads(&self, snapshot: &CpuSnapshot, background: bool) {
        let shared = &self.shared;
        let own = [current_tid(), Tid(shared.sampler_tid.load(Ordering::Relaxed))];
        for (tid, cpu) in snapshot.hot_threads(shared.config.hot_thread_threshold()) {
            if own.contains(&tid) {
                continue;
            }
            match capture_thread(tid, shared.config.max_stack_depth) {
                Ok(stack) => {
                    let stack = shared.origins.stitch(&stack, tid);
                    shared.aggregator.add_stack(Arc::new(stack), cpu, background);
                }
                Err(e) => debug!("Skipped hot thread {tid}: {e}"),
            }
        }
    }

    fn start_power_build(&mut self, cpu_percent: CpuPercent) {
        if self.pending_build.is_some() {
            debug!("Power-consume tree already building");
            return;
        }
        let aggregator = &self.shared.aggregator;
        let handle = match aggregator.snapshot_and_reset() {
            Ok(handle) if handle.is_empty() => {
                debug!("Sustained overload at {cpu_percent} but no stacks pooled");
                return;
            }
            Ok(handle) => handle,
            Err(e) => {
                warn!("Skipping power-consume tree: {e}");
                return;
            }
        };
        info!("Sustained overload at {cpu_percent}, building call tree of {} stacks", handle.len());
        match aggregator.spawn_build(handle) {
            Ok(rx) => self.pending_build = Some((rx, cpu_percent)),
            Err(e) => warn!("Skipping power-consume tree: {e}"),
        }
    }

    fn poll_pending_build(&mut self) {
        let Some((rx, cpu_percent)) = self.pending_build.take() else {
            return;
        };
        match rx.try_recv() {
            Ok(forest) => self.shared.emit(MonitorEvent::PowerConsume { cpu_percent, forest }),
            Err(TryRecvError::Empty) => self.pending_build = Some((rx, cpu_percent)),
            Err(TryRecvError::Disconnected) => warn!("Call tree build ended without a result"),
        }
    }

    fn check_hang(&mut self, process_cpu: Option<CpuPercent>, background: bool) {
        let shared = &self.shared;
        let stalled_for = shared.heartbeat.stalled_for();
        if stalled_for < shared.config.hang_threshold {
            if self.was_stalled {
                debug!("{} made progress again", shared.heartbeat.tid());
                self.filter.reset_annealing();
                self.was_stalled = false;
            }
            return;
        }
        self.was_stalled = true;

        let Some(hang_point) = shared.detector.select_hang_point() else {
            debug!("Stall of {stalled_for:?} but no samples buffered");
            return;
        };
        let dump_type = classify_hang(process_cpu, background, shared.config.cpu_limit_percent);

        match self.filter.check(&hang_point, SystemTime::now()) {
            FilterVerdict::Report => {
                info!(
                    "{dump_type}: {} stalled for {stalled_for:?} (depth {}, streak {})",
                    shared.heartbeat.tid(),
                    hang_point.selected_stack.depth(),
                    hang_point.top_repeat_streak
                );
                let profile = shared.config.main_thread_profile.then(|| shared.detector.profile());
                shared.emit(MonitorEvent::Hang(HangReport {
                    dump_type,
                    stalled_for,
                    hang_point,
                    profile,
                }));
            }
            verdict => {
                debug!("{dump_type} filtered: {verdict:?}");
                shared.emit(MonitorEvent::Filtered { dump_type, verdict });
            }
        }
    }
}

fn classify_hang(process_cpu: Option<CpuPercent>, background: bool, cpu_limit: f32) -> DumpType {
    if background {
        DumpType::BackgroundMainThreadBlock
    } else if process_cpu.is_some_and(|cpu| cpu.0 > cpu_limit) {
        DumpType::CpuBlock
    } else {
        DumpType::MainThreadBlock
    }
}
