// Resource sampling for the heartbeat emitter.
use std::path::Path;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use crate::protocol::NodeStats;

pub struct StatsSampler {
    system: System,
}

impl Default for StatsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSampler {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self { system }
    }

    /// Sample cpu/ram/disk usage. Disk figures come from the mount point
    /// holding `storage_path`.
    pub fn sample(&mut self, storage_path: &Path) -> NodeStats {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        let cpu = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64
        };

        let ram_used = self.system.used_memory();
        let total_mem = self.system.total_memory();
        let ram_percent = if total_mem > 0 {
            ram_used as f64 / total_mem as f64 * 100.0
        } else {
            0.0
        };

        let (disk_total, disk_free) = disk_usage_for(storage_path);
        let disk_percent = if disk_total > 0 {
            (disk_total - disk_free) as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        NodeStats {
            cpu,
            ram_percent,
            ram_used,
            disk_percent,
            disk_free,
        }
    }
}

fn disk_usage_for(storage_path: &Path) -> (u64, u64) {
    let resolved = storage_path
        .canonicalize()
        .unwrap_or_else(|_| storage_path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    // Longest mount point that is a prefix of the storage path wins.
    let mut best: Option<&sysinfo::Disk> = None;
    for disk in disks.list() {
        if resolved.starts_with(disk.mount_point()) {
            let better = match best {
                Some(current) => {
                    disk.mount_point().as_os_str().len() > current.mount_point().as_os_str().len()
                }
                None => true,
            };
            if better {
                best = Some(disk);
            }
        }
    }

    match best.or_else(|| disks.list().first()) {
        Some(disk) => (disk.total_space(), disk.available_space()),
        None => (0, 0),
    }
}
