//! # stallwatch - In-process Hang and CPU-Stall Detection
//!
//! stallwatch watches one thread of the running process (typically the main
//! or event-loop thread) for hangs, and the whole process for sustained CPU
//! overload. When either happens it explains *where* the time went: the stack
//! the watched thread sat on, or a CPU-weighted call tree of the hot threads.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Application Threads                          │
//! │   watched thread ──beat()──▶ Heartbeat     workers ◀── wrap()   │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ SIGPROF suspend + frame-pointer walk
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   stallwatch (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │    Stack     │──▶│  Detection   │──▶│   Monitor    │──▶ events
//! │  │  (capture)   │   │ (hang, CPU)  │   │  (threads)   │        │
//! │  └──────────────┘   └──────────────┘   └──────────────┘        │
//! │         │                   │                                   │
//! │         ▼                   ▼                                   │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │ Async Origin │   │   Analysis   │──▶│    Export    │        │
//! │  │  (stitching) │   │ (call tree)  │   │   (JSON)     │        │
//! │  └──────────────┘   └──────────────┘   └──────────────┘        │
//! │                             │                                   │
//! │                             ▼                                   │
//! │                     ┌──────────────┐                           │
//! │                     │ Symbolization│                           │
//! │                     │ (dladdr/DWARF)│                          │
//! │                     └──────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`stack`]: owned [`stack::CapturedStack`]s, the [`stack::StackCursor`]
//!   trait, live capture of other threads and self capture
//! - [`detection`]: Point Stack selection over the sample ring, CPU annealing,
//!   the dump filter and per-thread CPU from `/proc`
//! - [`analysis`]: merging weighted stacks into a ranked call tree
//! - [`async_origin`]: remembering who submitted the work a worker runs
//! - [`symbolization`]: `dladdr` and DWARF (`addr2line`) resolvers
//! - [`monitor`]: sampler and checker threads emitting [`monitor::MonitorEvent`]s
//! - [`export`]: call-tree JSON
//! - [`config`], [`domain`], [`process`], [`cli`]
//!
//! ## Detection Methods
//!
//! ### 1. Hang (Heartbeat-Based)
//! - The watched thread beats a [`monitor::Heartbeat`]; a gap longer than the
//!   hang threshold is a hang
//! - The sample with the longest run of identical innermost frames is
//!   reported as the hang point
//!
//! ### 2. Power Consume (Annealing)
//! - Process CPU averaged over a tracking window above the limit
//! - Spikes abort tracking; a detection is followed by a cooldown
//!
//! ### 3. Background Starvation
//! - Average CPU in the background below a floor for a whole window
//!
//! ## Typical Usage
//!
//! ```no_run
//! use stallwatch::config::EngineConfig;
//! use stallwatch::monitor::{BlockMonitor, Heartbeat, MonitorEvent};
//!
//! let heartbeat = Heartbeat::for_current_thread();
//! let monitor = BlockMonitor::start(EngineConfig::default(), heartbeat.clone())?;
//! loop {
//!     heartbeat.beat();
//!     // ... one unit of work ...
//!     while let Ok(MonitorEvent::Hang(report)) = monitor.events().try_recv() {
//!         println!("{} for {:?}", report.dump_type, report.stalled_for);
//!     }
//! #   break;
//! }
//! # Ok::<(), stallwatch::domain::EngineError>(())
//! ```
//!
//! ## Key Concepts
//!
//! - **Point Stack**: the sample the watched thread stayed on the longest
//! - **Async boundary**: sentinel frame separating a worker's stack from the
//!   stack of the thread that submitted its work
//! - **Lookup address**: return addresses minus one, so they resolve inside
//!   the call instruction
//! - **Frame pointers**: live capture walks the `fp` chain; build with
//!   `-C force-frame-pointers=yes` for complete stacks

pub mod analysis;
pub mod async_origin;
pub mod cli;
pub mod config;
pub mod detection;
pub mod domain;
pub mod export;
pub mod monitor;
pub mod process;
pub mod stack;
pub mod symbolization;
