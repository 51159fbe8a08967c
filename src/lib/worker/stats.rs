use serde::Serializer;
use sysinfo::{Disks, System};

use crate::lib::worker::types::{HostStats, MemoryUsage, SystemStats, Workload};

const MIB: u64 = 1024 * 1024;

pub fn percent<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:.2}%", value))
}

pub fn megabytes<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{} MB", value))
}

impl MemoryUsage {
    fn from_bytes(total: u64, used: u64) -> Self {
        MemoryUsage {
            total: total / MIB,
            used: used / MIB,
        }
    }
}

/// Used share of all mounted disks, in percent.
fn disk_usage(disks: &Disks) -> f32 {
    let (used, total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
        (
            used + disk.total_space().saturating_sub(disk.available_space()),
            total + disk.total_space(),
        )
    });
    if total == 0 {
        return 0.0;
    }
    used as f32 / total as f32 * 100.0
}

impl HostStats {
    /// Read a host snapshot. CPU usage is only meaningful once `sys` has been
    /// refreshed twice.
    pub fn collect(sys: &System, disks: &Disks) -> Self {
        HostStats {
            system_name: System::name().unwrap_or_else(|| "Unknown".to_string()),
            hostname: System::host_name().unwrap_or_else(|| "Unknown".to_string()),
            total_cpus: sys.cpus().len(),
            cpu_usage: (sys.global_cpu_usage() * 100.0).round() / 100.0,
            memory: MemoryUsage::from_bytes(sys.total_memory(), sys.used_memory()),
            swap: MemoryUsage::from_bytes(sys.total_swap(), sys.used_swap()),
            disk_usage: disk_usage(disks),
        }
    }
}

impl SystemStats {
    pub fn new(host: HostStats, workload: Workload) -> Self {
        SystemStats {
            host,
            active_tasks: workload.active_tasks(),
            workload,
        }
    }
}
