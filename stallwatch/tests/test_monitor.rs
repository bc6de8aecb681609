#![cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]

use std::sync::mpsc;
use std::time::{Duration, Instant};

use stallwatch::config::EngineConfig;
use stallwatch::domain::DumpType;
use stallwatch::monitor::{BlockMonitor, Heartbeat, MonitorEvent};

#[inline(never)]
fn stall(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

#[test]
fn test_stalled_thread_reported_as_hang() {
    let (tx, rx) = mpsc::channel();
    let watched = std::thread::spawn(move || {
        let heartbeat = Heartbeat::for_current_thread();
        tx.send(heartbeat.clone()).unwrap();
        stall(Duration::from_millis(1500));
        heartbeat.beat();
    });
    let heartbeat = rx.recv().unwrap();

    let config = EngineConfig {
        hang_threshold: Duration::from_millis(300),
        per_stack_interval: Duration::from_millis(20),
        check_period: Duration::from_millis(100),
        main_thread_profile: true,
        min_meaningful_depth: 1,
        ..Default::default()
    };
    let monitor = BlockMonitor::start(config, heartbeat).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut report = None;
    while report.is_none() && Instant::now() < deadline {
        if let Ok(MonitorEvent::Hang(hang)) = monitor.events().recv_timeout(Duration::from_millis(200)) {
            report = Some(hang);
        }
    }
    watched.join().unwrap();

    let report = report.expect("no hang reported");
    assert!(matches!(report.dump_type, DumpType::MainThreadBlock | DumpType::CpuBlock));
    assert!(report.stalled_for >= Duration::from_millis(300));
    assert!(!report.hang_point.selected_stack.is_empty());
    assert!(report.profile.is_some_and(|forest| !forest.is_empty()));
}
