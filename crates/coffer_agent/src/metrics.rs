//! Best-effort host metrics for heartbeats.
//!
//! The values only feed live dashboards through the server's event bus;
//! nothing here needs to be precise.

use coffer_protocol::AgentMetrics;
use sysinfo::{Disks, System};

pub struct Sampler {
    system: System,
    disks: Disks,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    pub fn sample(&mut self) -> AgentMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh();

        let cpu_percent = self.system.global_cpu_info().cpu_usage() as f64;

        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory > 0 {
            self.system.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        let (mut total, mut available) = (0u64, 0u64);
        for disk in self.disks.list() {
            total += disk.total_space();
            available += disk.available_space();
        }
        let disk_percent = if total > 0 {
            (total - available) as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        AgentMetrics {
            cpu_percent,
            memory_percent,
            disk_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_percentages() {
        let mut sampler = Sampler::new();
        let metrics = sampler.sample();
        assert!(metrics.memory_percent >= 0.0 && metrics.memory_percent <= 100.0);
        assert!(metrics.disk_percent >= 0.0 && metrics.disk_percent <= 100.0);
        assert!(metrics.cpu_percent >= 0.0);
    }
}
