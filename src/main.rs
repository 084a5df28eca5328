use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use hostpulse::config::{self, Config, load_config, load_config_from_path};
use hostpulse::diagnostics::DiagnosticSink;
use hostpulse::{logging, runtime};
use hostpulse::supervisor::{CommandSupervisor, Supervisor};
use hostpulse::system::collector::Collector;
use hostpulse::system::connections::ConnectionCounter;
use hostpulse::system::host::SysinfoHost;
use hostpulse::system::platform;
use hostpulse::system::snapshot::Snapshot;
use hostpulse::upgrade::Upgrader;
use hostpulse::upgrade::transport::HttpReleaseTransport;

#[derive(Parser)]
#[command(
    name = "hostpulse",
    about = "Host telemetry snapshots and upgrades of a supervised binary"
)]
struct Cli {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level for hostpulse targets (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print one snapshot as JSON.
    Status {
        /// Take a second sample one interval later so network rates are filled in.
        #[arg(long, default_value_t = false)]
        rate: bool,
    },
    /// Print a snapshot per interval as JSON lines until interrupted.
    Watch {
        /// Interval between snapshots in milliseconds
        #[arg(long)]
        interval: Option<u64>,

        /// Stop after this many snapshots.
        #[arg(long)]
        count: Option<usize>,

        /// Start the supervised binary and keep it running while watching.
        #[arg(long, default_value_t = false)]
        supervise: bool,

        /// Replace the supervised binary with this release once it is running.
        #[arg(long, value_name = "VERSION", requires = "supervise")]
        upgrade_to: Option<String>,
    },
    /// List published release versions.
    Versions,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = load_config_for_cli(&cli);
    logging::init(&config.log)?;

    runtime::block_on_bounded(run(cli.command, config), runtime::SHUTDOWN_GRACE)?
}

async fn run(command: Command, config: Config) -> Result<()> {
    let sink = DiagnosticSink::new(config.log.warn_cooldown());
    let supervisor = Arc::new(CommandSupervisor::from_config(&config.supervisor));

    match command {
        Command::Status { rate } => {
            let collector = build_collector(&config, Arc::clone(&supervisor), sink.clone());
            let mut snapshot = collector.collect(None).await;
            if rate {
                tokio::time::sleep(Duration::from_millis(config.general.interval_ms)).await;
                snapshot = collector.collect(Some(&snapshot)).await;
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Watch {
            interval,
            count,
            supervise,
            upgrade_to,
        } => {
            let interval = Duration::from_millis(interval.unwrap_or(config.general.interval_ms));
            if supervise && let Err(err) = supervisor.restart(false) {
                sink.error(format!("start supervised process failed: {err}"));
            }
            // The upgrade has to run here: only this process owns the child
            // it stops and restarts.
            if let Some(version) = upgrade_to {
                let upgrader = build_upgrader(&config, Arc::clone(&supervisor), sink.clone())?;
                match upgrader.upgrade(&version).await {
                    Ok(()) if supervisor.is_running() => sink.info(format!("now running {version}")),
                    Ok(()) => sink.error(format!(
                        "installed {version} but the supervised process is not running: {}",
                        supervisor.last_result_text()
                    )),
                    Err(err) => sink.error(format!("upgrade to {version} failed: {err}")),
                }
            }
            let collector = build_collector(&config, Arc::clone(&supervisor), sink.clone());
            watch(&collector, interval, count).await?;
            if supervise {
                supervisor.stop()?;
            }
        }
        Command::Versions => {
            let upgrader = build_upgrader(&config, supervisor, sink.clone())?;
            for version in upgrader.list_versions().await? {
                println!("{version}");
            }
        }
    }

    if sink.suppressed_warnings() > 0 {
        tracing::debug!(
            emitted = sink.emitted_warnings(),
            suppressed = sink.suppressed_warnings(),
            "warning summary"
        );
    }
    Ok(())
}

async fn watch(
    collector: &Collector<SysinfoHost, CommandSupervisor>,
    interval: Duration,
    count: Option<usize>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut previous: Option<Snapshot> = None;
    let mut taken = 0usize;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = collector.collect(previous.as_ref()).await;
                println!("{}", serde_json::to_string(&snapshot)?);
                previous = Some(snapshot);
                taken += 1;
                if count.is_some_and(|limit| taken >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn build_collector(
    config: &Config,
    supervisor: Arc<CommandSupervisor>,
    sink: DiagnosticSink,
) -> Collector<SysinfoHost, CommandSupervisor> {
    let table_root = config
        .collector
        .proc_root
        .clone()
        .or_else(platform::connection_table_root);
    let connections = ConnectionCounter::new(table_root, config.collector.connection_cache_ttl())
        .with_max_bytes(config.collector.max_table_bytes);
    let host = SysinfoHost::new(&config.collector.disk_mount, connections);

    Collector::new(Arc::new(host), supervisor, sink).with_deadlines(config.collector.deadlines())
}

fn build_upgrader(
    config: &Config,
    supervisor: Arc<CommandSupervisor>,
    sink: DiagnosticSink,
) -> Result<Upgrader<HttpReleaseTransport, CommandSupervisor>> {
    let transport = HttpReleaseTransport::new(
        &config.upgrade.releases_api_url,
        &config.upgrade.download_base_url,
        Duration::from_secs(config.upgrade.download_timeout_secs),
    )?;
    Ok(Upgrader::from_config(
        transport,
        supervisor,
        sink,
        &config.upgrade,
        &config.supervisor.binary_path,
    ))
}

fn load_config_for_cli(cli: &Cli) -> config::Config {
    let mut config = match &cli.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    };

    if let Some(ref level) = cli.log_level {
        config.log.level = level.clone();
    }
    if cli.log_json {
        config.log.json = true;
    }

    config
}
