use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use super::host::{HostMetrics, MetricError};
use super::snapshot::{ProcessStatus, Snapshot};
use crate::diagnostics::DiagnosticSink;
use crate::supervisor::Supervisor;

pub const CPU_DEADLINE: Duration = Duration::from_secs(3);
pub const METRIC_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadlines {
    pub cpu: Duration,
    /// Every source other than CPU.
    pub metric: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Deadlines {
            cpu: CPU_DEADLINE,
            metric: METRIC_DEADLINE,
        }
    }
}

impl Deadlines {
    pub fn longest(&self) -> Duration {
        self.cpu.max(self.metric)
    }
}

type MetricTask<T> = JoinHandle<Result<T, MetricError>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Cpu,
    Uptime,
    Memory,
    Swap,
    Disk,
    Loads,
    Network,
    Tcp,
    Udp,
    Process,
}

impl Source {
    const COUNT: usize = 10;

    fn metric(self) -> &'static str {
        match self {
            Source::Cpu => "cpu percent",
            Source::Uptime => "uptime",
            Source::Memory => "virtual memory",
            Source::Swap => "swap memory",
            Source::Disk => "disk usage",
            Source::Loads => "load avg",
            Source::Network => "io counters",
            Source::Tcp => "tcp connections",
            Source::Udp => "udp connections",
            Source::Process => "xray state",
        }
    }
}

/// One flag per source, set while a task for it is still running. A source
/// whose previous task has not returned is not spawned again, so a wedged
/// source pins at most one blocking thread.
#[derive(Debug, Default)]
struct InFlight([AtomicBool; Source::COUNT]);

struct InFlightSlot {
    flags: Arc<InFlight>,
    source: Source,
}

impl InFlightSlot {
    fn claim(flags: &Arc<InFlight>, source: Source) -> Option<Self> {
        flags.0[source as usize]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(InFlightSlot {
            flags: Arc::clone(flags),
            source,
        })
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.flags.0[self.source as usize].store(false, Ordering::Release);
    }
}

/// Builds [`Snapshot`]s. Every source runs concurrently against its own
/// deadline, so one call takes at most [`Deadlines::longest`].
pub struct Collector<H, S: ?Sized> {
    host: Arc<H>,
    supervisor: Arc<S>,
    sink: DiagnosticSink,
    deadlines: Deadlines,
    in_flight: Arc<InFlight>,
}

impl<H, S> Collector<H, S>
where
    H: HostMetrics,
    S: Supervisor + ?Sized + 'static,
{
    pub fn new(host: Arc<H>, supervisor: Arc<S>, sink: DiagnosticSink) -> Self {
        Collector {
            host,
            supervisor,
            sink,
            deadlines: Deadlines::default(),
            in_flight: Arc::default(),
        }
    }

    pub fn with_deadlines(mut self, deadlines: Deadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    pub fn deadlines(&self) -> Deadlines {
        self.deadlines
    }

    /// Never fails. Sources that error or miss their deadline leave their
    /// field at zero and are reported through the diagnostic sink.
    pub async fn collect(&self, previous: Option<&Snapshot>) -> Snapshot {
        let captured_at = Instant::now();

        // Spawn everything before awaiting anything.
        let cpu = self.spawn(Source::Cpu, |h| h.cpu_percent());
        let uptime = self.spawn(Source::Uptime, |h| h.uptime());
        let memory = self.spawn(Source::Memory, |h| h.memory());
        let swap = self.spawn(Source::Swap, |h| h.swap());
        let disk = self.spawn(Source::Disk, |h| h.disk());
        let loads = self.spawn(Source::Loads, |h| h.load_averages());
        let network = self.spawn(Source::Network, |h| h.network_counters());
        let tcp = self.spawn(Source::Tcp, |h| h.tcp_count());
        let udp = self.spawn(Source::Udp, |h| h.udp_count());
        let supervisor = Arc::clone(&self.supervisor);
        let process = self.spawn_task(Source::Process, move || {
            Ok(ProcessStatus::observe(&*supervisor))
        });

        let (cpu, uptime, memory, swap, disk, loads, network, tcp, udp, process) = tokio::join!(
            self.collect_or_default(Source::Cpu, cpu),
            self.collect_or_default(Source::Uptime, uptime),
            self.collect_or_default(Source::Memory, memory),
            self.collect_or_default(Source::Swap, swap),
            self.collect_or_default(Source::Disk, disk),
            self.collect_or_default(Source::Loads, loads),
            self.race(Source::Network, network),
            self.collect_or_default(Source::Tcp, tcp),
            self.collect_or_default(Source::Udp, udp),
            self.collect_or_default(Source::Process, process),
        );

        let mut snapshot = Snapshot::empty(captured_at);
        snapshot.cpu_percent = cpu;
        snapshot.uptime_seconds = uptime;
        snapshot.memory = memory;
        snapshot.swap = swap;
        snapshot.disk = disk;
        snapshot.load_averages = loads;
        snapshot.tcp_count = tcp;
        snapshot.udp_count = udp;
        snapshot.process = process;

        if let Some(totals) = network {
            snapshot.record_network(totals);
            if let Some(prev) = previous {
                snapshot.network_rate = snapshot.rate_since(prev);
            }
        }
        snapshot
    }

    fn deadline(&self, source: Source) -> Duration {
        match source {
            Source::Cpu => self.deadlines.cpu,
            _ => self.deadlines.metric,
        }
    }

    fn spawn<T, F>(&self, source: Source, read: F) -> Option<MetricTask<T>>
    where
        T: Send + 'static,
        F: FnOnce(&H) -> Result<T, MetricError> + Send + 'static,
    {
        let host = Arc::clone(&self.host);
        self.spawn_task(source, move || read(&*host))
    }

    /// `None` when the previous task for `source` is still running.
    fn spawn_task<T, F>(&self, source: Source, read: F) -> Option<MetricTask<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, MetricError> + Send + 'static,
    {
        let slot = InFlightSlot::claim(&self.in_flight, source)?;
        Some(tokio::task::spawn_blocking(move || {
            let _slot = slot;
            read()
        }))
    }

    async fn collect_or_default<T: Default>(
        &self,
        source: Source,
        task: Option<MetricTask<T>>,
    ) -> T {
        self.race(source, task).await.unwrap_or_default()
    }

    // A task that loses the race is detached, not cancelled: it finishes on
    // the blocking pool and its result is dropped.
    async fn race<T>(&self, source: Source, task: Option<MetricTask<T>>) -> Option<T> {
        let metric = source.metric();
        let Some(task) = task else {
            // Still stuck from an earlier collection.
            self.sink.warn(format!("get {metric} timeout"));
            return None;
        };
        match tokio::time::timeout(self.deadline(source), task).await {
            Ok(Ok(Ok(value))) => Some(value),
            Ok(Ok(Err(err))) => {
                self.sink.warn(format!("get {metric} failed: {err}"));
                None
            }
            Ok(Err(join_err)) => {
                self.sink.warn(format!("get {metric} failed: {join_err}"));
                None
            }
            Err(_) => {
                self.sink.warn(format!("get {metric} timeout"));
                None
            }
        }
    }
}
