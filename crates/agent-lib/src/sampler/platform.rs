//! Default platform adapter backed by the `sysinfo` crate
//!
//! CPU, memory, swap, process count, network counters, and temperature
//! come from `sysinfo`. Cumulative disk byte counters are not exposed by
//! `sysinfo`, so on Linux they are parsed from `/proc/diskstats`; on
//! other platforms the disk fields read as absent and their rates stay
//! at zero.

use super::{PlatformAdapter, SamplerError};
use crate::models::RawCounters;
use sysinfo::{Components, Networks, System};
use tracing::debug;

/// Sector size used by the kernel for `/proc/diskstats` accounting.
const SECTOR_SIZE: u64 = 512;

/// Sensor labels probed for a CPU temperature, in order of preference.
const TEMP_LABELS: &[&str] = &["coretemp", "k10temp", "zenpower", "cpu_thermal", "Package"];

pub struct SysinfoAdapter {
    sys: System,
    networks: Networks,
    components: Components,
}

impl SysinfoAdapter {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            networks: Networks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
        }
    }

    /// Hostname used as the `host` field of every sample.
    pub fn hostname() -> String {
        System::host_name().unwrap_or_else(|| "unknown".to_string())
    }

    fn mem_pct(&self) -> Option<f64> {
        let total = self.sys.total_memory();
        if total == 0 {
            return None;
        }
        Some(self.sys.used_memory() as f64 / total as f64 * 100.0)
    }

    fn swap_pct(&self) -> Option<f64> {
        let total = self.sys.total_swap();
        if total == 0 {
            // No swap configured reads as 0% used, not as missing.
            return Some(0.0);
        }
        Some(self.sys.used_swap() as f64 / total as f64 * 100.0)
    }

    fn cpu_temp(&mut self) -> Option<f64> {
        self.components.refresh();
        for label in TEMP_LABELS {
            if let Some(component) = self
                .components
                .iter()
                .find(|c| c.label().contains(label))
            {
                return Some(f64::from(component.temperature()));
            }
        }
        None
    }

    fn net_totals(&mut self) -> (Option<u64>, Option<u64>) {
        self.networks.refresh();
        let mut up = 0u64;
        let mut down = 0u64;
        let mut seen = false;
        for (_name, data) in &self.networks {
            seen = true;
            up = up.saturating_add(data.total_transmitted());
            down = down.saturating_add(data.total_received());
        }
        if seen {
            (Some(up), Some(down))
        } else {
            (None, None)
        }
    }
}

impl Default for SysinfoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformAdapter for SysinfoAdapter {
    fn read_counters(&mut self, _now: i64) -> Result<RawCounters, SamplerError> {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.sys.refresh_processes();

        let (net_up_bytes, net_down_bytes) = self.net_totals();
        let (disk_read_bytes, disk_write_bytes) = match read_disk_counters() {
            Some((read, write)) => (Some(read), Some(write)),
            None => {
                debug!("disk byte counters unavailable on this platform");
                (None, None)
            }
        };

        Ok(RawCounters {
            cpu_pct: Some(f64::from(self.sys.global_cpu_info().cpu_usage())),
            mem_pct: self.mem_pct(),
            swap_pct: self.swap_pct(),
            proc_count: u32::try_from(self.sys.processes().len()).ok(),
            disk_read_bytes,
            disk_write_bytes,
            net_up_bytes,
            net_down_bytes,
            cpu_temp: self.cpu_temp(),
        })
    }
}

/// Cumulative (read, write) bytes across physical disks.
#[cfg(target_os = "linux")]
fn read_disk_counters() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/diskstats").ok()?;
    Some(parse_diskstats(&content))
}

#[cfg(not(target_os = "linux"))]
fn read_disk_counters() -> Option<(u64, u64)> {
    None
}

/// Sum sector counters over whole physical disks in `/proc/diskstats`
/// format, converting sectors to bytes.
fn parse_diskstats(content: &str) -> (u64, u64) {
    let mut read_bytes = 0u64;
    let mut write_bytes = 0u64;
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if !is_physical_disk(name) {
            continue;
        }
        let sectors_read: u64 = fields[5].parse().unwrap_or(0);
        let sectors_written: u64 = fields[9].parse().unwrap_or(0);
        read_bytes = read_bytes.saturating_add(sectors_read.saturating_mul(SECTOR_SIZE));
        write_bytes = write_bytes.saturating_add(sectors_written.saturating_mul(SECTOR_SIZE));
    }
    (read_bytes, write_bytes)
}

/// Whole-disk device names only: partitions and virtual devices would
/// double-count or inflate the totals.
fn is_physical_disk(name: &str) -> bool {
    for virt in ["loop", "ram", "zram", "dm-", "md", "sr", "fd"] {
        if name.starts_with(virt) {
            return false;
        }
    }
    if let Some(rest) = name
        .strip_prefix("nvme")
        .or_else(|| name.strip_prefix("mmcblk"))
    {
        // nvme0n1 is a disk, nvme0n1p1 a partition.
        return !rest.contains('p');
    }
    for prefix in ["sd", "hd", "vd", "xvd"] {
        if name.starts_with(prefix) {
            return name.chars().last().is_some_and(|c| c.is_ascii_alphabetic());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_physical_disk() {
        assert!(is_physical_disk("sda"));
        assert!(is_physical_disk("nvme0n1"));
        assert!(is_physical_disk("mmcblk0"));
        assert!(is_physical_disk("vdb"));
        assert!(!is_physical_disk("sda1"));
        assert!(!is_physical_disk("nvme0n1p2"));
        assert!(!is_physical_disk("mmcblk0p1"));
        assert!(!is_physical_disk("loop0"));
        assert!(!is_physical_disk("dm-0"));
        assert!(!is_physical_disk("md127"));
        assert!(!is_physical_disk("ram0"));
    }

    #[test]
    fn test_parse_diskstats() {
        let content = "\
   8       0 sda 1000 0 2048 500 2000 0 4096 800 0 0 0\n\
   8       1 sda1 900 0 1024 400 1900 0 2048 700 0 0 0\n\
   7       0 loop0 10 0 80 1 0 0 0 0 0 0 0\n\
 259       0 nvme0n1 500 0 1000 100 600 0 3000 200 0 0 0\n";
        let (read, write) = parse_diskstats(content);
        // sda + nvme0n1 only: (2048 + 1000) and (4096 + 3000) sectors.
        assert_eq!(read, 3048 * SECTOR_SIZE);
        assert_eq!(write, 7096 * SECTOR_SIZE);
    }

    #[test]
    fn test_parse_diskstats_ignores_short_lines() {
        let (read, write) = parse_diskstats("8 0 sda 1 2 3\n");
        assert_eq!((read, write), (0, 0));
    }
}
