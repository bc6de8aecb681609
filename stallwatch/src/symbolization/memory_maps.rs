//! Memory mapping utilities for the monitored process
//!
//! Parses `/proc/<pid>/maps` to find where a binary is loaded, which is what
//! turns a runtime address into the file-relative address DWARF expects for a
//! position-independent executable (PIE).

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;

/// Memory range of a loaded binary in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Parse `/proc/<pid>/maps` to find the memory range of a specific binary
///
/// Returns the range from the lowest start to the highest end over every
/// mapping of `binary_path`.
///
/// # Errors
/// Returns an error if the maps file cannot be read or the binary is not mapped
pub fn parse_memory_maps(pid: u32, binary_path: &str) -> Result<MemoryRange> {
    parse_maps_file(format!("/proc/{pid}/maps"), binary_path)
}

/// Same as [`parse_memory_maps`] for an explicit maps file
///
/// # Errors
/// Returns an error if the file cannot be read or the binary is not mapped
pub fn parse_maps_file<P: AsRef<Path>>(maps_path: P, binary_path: &str) -> Result<MemoryRange> {
    let maps_path = maps_path.as_ref();
    let maps = fs::read_to_string(maps_path)
        .with_context(|| format!("Failed to read {}", maps_path.display()))?;

    let mut start_addr = None;
    let mut end_addr = None;

    for line in maps.lines() {
        // "start-end perms offset dev inode pathname"
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 || parts[5] != binary_path {
            continue;
        }
        let Some((start, end)) = parts[0].split_once('-') else {
            continue;
        };
        let start = u64::from_str_radix(start, 16).context("Failed to parse range start")?;
        let end = u64::from_str_radix(end, 16).context("Failed to parse range end")?;

        start_addr = Some(start_addr.map_or(start, |s: u64| s.min(start)));
        end_addr = Some(end_addr.map_or(end, |e: u64| e.max(end)));
    }

    match (start_addr, end_addr) {
        (Some(start), Some(end)) => {
            info!(
                "Executable memory range: 0x{:x} - 0x{:x} (size: {} KB)",
                start,
                end,
                (end - start) / 1024
            );
            Ok(MemoryRange { start, end })
        }
        _ => Err(anyhow::anyhow!("Could not find memory range for {binary_path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1500));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn test_parse_maps_file() {
        let mut maps = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            maps,
            "55d0c0a00000-55d0c0a10000 r--p 00000000 08:01 1234 /opt/app/server\n\
             55d0c0a10000-55d0c0a50000 r-xp 00010000 08:01 1234 /opt/app/server\n\
             55d0c0a50000-55d0c0a60000 rw-p 00050000 08:01 1234 /opt/app/server\n\
             7f1e2c000000-7f1e2c200000 r-xp 00000000 08:01 99 /opt/app/server-helper.so\n\
             7ffd1e000000-7ffd1e021000 rw-p 00000000 00:00 0 [stack]"
        )
        .unwrap();

        let range = parse_maps_file(maps.path(), "/opt/app/server").unwrap();
        assert_eq!(range, MemoryRange { start: 0x55d0_c0a0_0000, end: 0x55d0_c0a6_0000 });
        assert!(!range.contains(0x7f1e_2c00_0100));
    }

    #[test]
    fn test_parse_maps_file_missing_binary() {
        let mut maps = tempfile::NamedTempFile::new().unwrap();
        writeln!(maps, "7ffd1e000000-7ffd1e021000 rw-p 00000000 00:00 0 [stack]").unwrap();
        assert!(parse_maps_file(maps.path(), "/opt/app/server").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_memory_maps_self() {
        let exe = std::fs::canonicalize(std::env::current_exe().unwrap()).unwrap();
        let range = parse_memory_maps(std::process::id(), exe.to_str().unwrap()).unwrap();
        let here = test_parse_memory_maps_self as *const () as u64;
        assert!(range.contains(here));
    }
}
