use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use sysinfo::{Disks, Networks, System};
use thiserror::Error;

use super::connections::ConnectionCounter;
use super::platform;
use super::snapshot::{NetworkTotals, Usage};

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("{0} is not available on this host")]
    Unavailable(&'static str),
    #[error("no disk mounted at {}", .0.display())]
    MountNotFound(PathBuf),
}

/// Synchronous host metric sources. Calls may block; the collector runs
/// each one on its own blocking task under a deadline.
pub trait HostMetrics: Send + Sync + 'static {
    fn cpu_percent(&self) -> Result<f64, MetricError>;
    fn uptime(&self) -> Result<u64, MetricError>;
    fn memory(&self) -> Result<Usage, MetricError>;
    fn swap(&self) -> Result<Usage, MetricError>;
    fn disk(&self) -> Result<Usage, MetricError>;
    /// `[1m, 5m, 15m]`.
    fn load_averages(&self) -> Result<Vec<f64>, MetricError>;
    fn network_counters(&self) -> Result<NetworkTotals, MetricError>;
    fn tcp_count(&self) -> Result<u64, MetricError>;
    fn udp_count(&self) -> Result<u64, MetricError>;
}

pub struct SysinfoHost {
    sys: Mutex<System>,
    disk_mount: PathBuf,
    connections: ConnectionCounter,
}

impl SysinfoHost {
    pub fn new(disk_mount: impl Into<PathBuf>, connections: ConnectionCounter) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        // CPU usage is a delta between refreshes; prime the first sample.
        sys.refresh_cpu_usage();
        SysinfoHost {
            sys: Mutex::new(sys),
            disk_mount: disk_mount.into(),
            connections,
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> T) -> T {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut sys)
    }
}

impl HostMetrics for SysinfoHost {
    fn cpu_percent(&self) -> Result<f64, MetricError> {
        self.with_system(|sys| {
            sys.refresh_cpu_usage();
            if sys.cpus().is_empty() {
                return Err(MetricError::Unavailable("cpu usage"));
            }
            Ok(f64::from(sys.global_cpu_usage()))
        })
    }

    fn uptime(&self) -> Result<u64, MetricError> {
        Ok(System::uptime())
    }

    fn memory(&self) -> Result<Usage, MetricError> {
        self.with_system(|sys| {
            sys.refresh_memory();
            let total = sys.total_memory();
            if total == 0 {
                return Err(MetricError::Unavailable("virtual memory"));
            }
            Ok(Usage {
                used: sys.used_memory(),
                total,
            })
        })
    }

    fn swap(&self) -> Result<Usage, MetricError> {
        self.with_system(|sys| {
            sys.refresh_memory();
            Ok(Usage {
                used: sys.used_swap(),
                total: sys.total_swap(),
            })
        })
    }

    fn disk(&self) -> Result<Usage, MetricError> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == self.disk_mount.as_path())
            .ok_or_else(|| MetricError::MountNotFound(self.disk_mount.clone()))?;
        let total = disk.total_space();
        Ok(Usage {
            used: total.saturating_sub(disk.available_space()),
            total,
        })
    }

    fn load_averages(&self) -> Result<Vec<f64>, MetricError> {
        if !platform::load_average_supported() {
            return Err(MetricError::Unavailable("load average"));
        }
        let load = System::load_average();
        Ok(vec![load.one, load.five, load.fifteen])
    }

    fn network_counters(&self) -> Result<NetworkTotals, MetricError> {
        let networks = Networks::new_with_refreshed_list();
        if networks.is_empty() {
            return Err(MetricError::Unavailable("network interfaces"));
        }
        Ok(networks
            .iter()
            .fold(NetworkTotals::default(), |acc, (_, data)| NetworkTotals {
                sent: acc.sent.saturating_add(data.total_transmitted()),
                recv: acc.recv.saturating_add(data.total_received()),
            }))
    }

    fn tcp_count(&self) -> Result<u64, MetricError> {
        Ok(self.connections.count_tcp())
    }

    fn udp_count(&self) -> Result<u64, MetricError> {
        Ok(self.connections.count_udp())
    }
}
