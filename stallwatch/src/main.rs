//! # stallwatch - Demo Entry Point
//!
//! Runs a synthetic workload on the main thread and watches it with a
//! [`BlockMonitor`]:
//! - The main thread beats its heartbeat every ~10 ms and stalls every
//!   `--stall-every` seconds, alternating a CPU-spinning stall and a sleeping one
//! - `--burn N` spawns N CPU-burning tasks on an async runtime; their stacks
//!   are stitched to the stack that spawned them
//!
//! Hang points are printed as symbolized frames; call trees (power-consume
//! trees and `--profile` merges) are written as JSON.

#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stallwatch::analysis::Forest;
use stallwatch::async_origin::AsyncOriginTracker;
use stallwatch::cli::Args;
use stallwatch::domain::EngineError;
use stallwatch::export::CallTreeExporter;
use stallwatch::monitor::{BlockMonitor, HangReport, Heartbeat, MonitorEvent};
use stallwatch::stack::symbolize_all;
use stallwatch::symbolization::{DwarfResolver, LoaderSymbolizer, SymbolResolver};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let bad_config = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<EngineError>(),
            Some(EngineError::Config(_) | EngineError::InvalidConfig(_))
        )
    });
    if bad_config {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    if !quiet {
        println!("stallwatch v{}", env!("CARGO_PKG_VERSION"));
    }

    let resolver = build_resolver(args.dwarf);
    let mut out = open_output(args.export.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("demo-worker")
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let heartbeat = Heartbeat::for_current_thread();
    let monitor = BlockMonitor::start(args.engine_config(), Arc::clone(&heartbeat))
        .context("Failed to start block monitor")?;

    // Spawned after the monitor installed origin tracking
    let stop = Arc::new(AtomicBool::new(false));
    let origins = AsyncOriginTracker::global();
    for task in 0..args.burn {
        runtime.spawn(origins.wrap_future(burn_cpu(task, Arc::clone(&stop))));
    }

    if !quiet {
        println!(
            "Watching main thread for {}s: stall of {}ms every {}s, {} burner task(s)",
            args.duration, args.stall_ms, args.stall_every, args.burn
        );
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let stall_every = Duration::from_secs(args.stall_every);
    let stall_for = Duration::from_millis(args.stall_ms);
    let mut next_stall = Instant::now() + stall_every;
    let mut stalls = 0u32;

    while Instant::now() < deadline {
        heartbeat.beat();
        if Instant::now() >= next_stall {
            stalls += 1;
            if stalls % 2 == 1 {
                spin_stall(stall_for);
            } else {
                sleep_stall(stall_for);
            }
            heartbeat.beat();
            next_stall = Instant::now() + stall_every;
        } else {
            std::thread::sleep(Duration::from_millis(10));
        }

        for event in monitor.events().try_iter() {
            report(&event, resolver.as_ref(), &mut *out, quiet)?;
        }
    }

    stop.store(true, Ordering::Relaxed);
    drop(monitor);
    runtime.shutdown_timeout(Duration::from_secs(1));
    out.flush().context("Failed to flush output")?;

    if !quiet {
        println!("Done after {stalls} stall(s)");
    }
    Ok(())
}

fn build_resolver(dwarf: bool) -> Box<dyn SymbolResolver> {
    if dwarf {
        match DwarfResolver::for_current_exe() {
            Ok(resolver) => return Box::new(resolver),
            Err(e) => warn!("DWARF symbolization unavailable, falling back to dladdr: {e:#}"),
        }
    }
    Box::new(LoaderSymbolizer::new())
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stdout()),
    })
}

// ===== Workload =====

/// Busy stall: the watched thread keeps burning CPU on one frame
#[inline(never)]
fn spin_stall(duration: Duration) {
    let start = Instant::now();
    let mut x = 0u64;
    while start.elapsed() < duration {
        x = std::hint::black_box(x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1));
    }
}

/// Blocked stall: the watched thread sleeps in the kernel
#[inline(never)]
fn sleep_stall(duration: Duration) {
    std::thread::sleep(duration);
}

async fn burn_cpu(task: usize, stop: Arc<AtomicBool>) {
    log::debug!("Burner task {task} started");
    while !stop.load(Ordering::Relaxed) {
        spin_stall(Duration::from_millis(20));
        tokio::task::yield_now().await;
    }
}

// ===== Reporting =====

fn report(
    event: &MonitorEvent,
    resolver: &dyn SymbolResolver,
    out: &mut dyn Write,
    quiet: bool,
) -> Result<()> {
    match event {
        MonitorEvent::Hang(hang) => {
            print_hang(hang, resolver);
            if let Some(profile) = &hang.profile {
                println!("  merged profile of the watched thread:");
                write_tree(out, profile)?;
            }
        }
        MonitorEvent::PowerConsume { cpu_percent, forest } => {
            println!("[power-consume] process CPU at {cpu_percent} for a whole tracking window");
            write_tree(out, forest)?;
        }
        MonitorEvent::BackgroundStarved { cpu_percent } => {
            println!("[background-starved] average CPU {cpu_percent}");
        }
        MonitorEvent::Filtered { dump_type, verdict } => {
            if !quiet {
                println!("[{dump_type}] not reported ({verdict:?})");
            }
        }
    }
    Ok(())
}

fn print_hang(hang: &HangReport, resolver: &dyn SymbolResolver) {
    let point = &hang.hang_point;
    let stack = &point.selected_stack;
    println!(
        "[{}] watched thread stalled for {:.2}s, Point Stack held for {} samples at {}",
        hang.dump_type,
        hang.stalled_for.as_secs_f64(),
        point.top_repeat_streak + 1,
        point.cpu_percent
    );

    let frames = symbolize_all(stack.addresses(), stack.leading_pc(), resolver);
    for (i, (frame, seen)) in frames.iter().zip(&point.per_address_total_occurrence).enumerate() {
        if frame.is_async_boundary() {
            println!("        ---- submitted from ----");
        } else {
            println!("  #{i:<3} {frame}  (in {seen} samples)");
        }
    }
    if let Some(reason) = stack.abort_reason() {
        println!("        ... {reason}");
    }
}

fn write_tree(out: &mut dyn Write, forest: &Forest) -> Result<()> {
    CallTreeExporter::new(forest).export(&mut *out)
}
