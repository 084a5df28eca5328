use std::time::Instant;

use serde::Serialize;

use crate::supervisor::Supervisor;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    #[serde(rename = "current")]
    pub used: u64,
    pub total: u64,
}

/// Cumulative interface byte counters since boot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetworkTotals {
    pub sent: u64,
    pub recv: u64,
}

/// Bytes per second, derived from two consecutive [`NetworkTotals`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetworkRate {
    pub up: u64,
    pub down: u64,
}

impl NetworkRate {
    /// Zero when `current_at` is not strictly after `previous_at`. A counter
    /// that went backwards (host reset) yields zero for that direction.
    pub fn derive(
        previous: NetworkTotals,
        previous_at: Instant,
        current: NetworkTotals,
        current_at: Instant,
    ) -> Self {
        let Some(elapsed) = current_at.checked_duration_since(previous_at) else {
            return Self::default();
        };
        let seconds = elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return Self::default();
        }
        NetworkRate {
            up: (current.sent.saturating_sub(previous.sent) as f64 / seconds) as u64,
            down: (current.recv.saturating_sub(previous.recv) as f64 / seconds) as u64,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    #[serde(rename = "running")]
    Running,
    #[default]
    #[serde(rename = "stop")]
    Stopped,
    #[serde(rename = "error")]
    Errored,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    #[serde(rename = "errorMsg")]
    pub error_message: String,
    pub version: String,
}

impl ProcessStatus {
    pub fn observe<S: Supervisor + ?Sized>(supervisor: &S) -> Self {
        let (state, error_message) = if supervisor.is_running() {
            (ProcessState::Running, String::new())
        } else {
            let state = if supervisor.last_error().is_some() {
                ProcessState::Errored
            } else {
                ProcessState::Stopped
            };
            (state, supervisor.last_result_text())
        };
        ProcessStatus {
            state,
            error_message,
            version: supervisor.version(),
        }
    }
}

/// One best-effort, fully populated telemetry record. Fields whose source
/// failed or timed out hold their zero value.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    #[serde(skip)]
    pub captured_at: Instant,
    #[serde(rename = "cpu")]
    pub cpu_percent: f64,
    #[serde(rename = "mem")]
    pub memory: Usage,
    pub swap: Usage,
    pub disk: Usage,
    #[serde(rename = "xray")]
    pub process: ProcessStatus,
    #[serde(rename = "uptime")]
    pub uptime_seconds: u64,
    #[serde(rename = "loads")]
    pub load_averages: Vec<f64>,
    #[serde(rename = "tcpCount")]
    pub tcp_count: u64,
    #[serde(rename = "udpCount")]
    pub udp_count: u64,
    #[serde(rename = "netIO")]
    pub network_rate: NetworkRate,
    #[serde(rename = "netTraffic")]
    pub network_cumulative: NetworkTotals,
    // Set only when the interface counters were actually read.
    #[serde(skip)]
    network_sample: Option<NetworkTotals>,
}

impl Snapshot {
    pub fn empty(captured_at: Instant) -> Self {
        Snapshot {
            captured_at,
            cpu_percent: 0.0,
            memory: Usage::default(),
            swap: Usage::default(),
            disk: Usage::default(),
            process: ProcessStatus::default(),
            uptime_seconds: 0,
            load_averages: Vec::new(),
            tcp_count: 0,
            udp_count: 0,
            network_rate: NetworkRate::default(),
            network_cumulative: NetworkTotals::default(),
            network_sample: None,
        }
    }

    /// Stores a successful interface counter read.
    pub fn record_network(&mut self, totals: NetworkTotals) {
        self.network_cumulative = totals;
        self.network_sample = Some(totals);
    }

    /// `None` when the counters could not be read for this snapshot, even
    /// though `network_cumulative` then holds zeros.
    pub fn network_sample(&self) -> Option<NetworkTotals> {
        self.network_sample
    }

    /// Rate against `previous`, or zero when either side has no sample.
    pub fn rate_since(&self, previous: &Snapshot) -> NetworkRate {
        match (previous.network_sample, self.network_sample) {
            (Some(prev), Some(cur)) => {
                NetworkRate::derive(prev, previous.captured_at, cur, self.captured_at)
            }
            _ => NetworkRate::default(),
        }
    }
}
