use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::system::collector::Deadlines;
use crate::system::connections::MAX_TABLE_BYTES;
use crate::upgrade::transport::{DEFAULT_DOWNLOAD_BASE_URL, DEFAULT_RELEASES_API_URL};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub collector: CollectorConfig,
    pub log: LogConfig,
    pub supervisor: SupervisorConfig,
    pub upgrade: UpgradeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub interval_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig { interval_ms: 2000 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub cpu_deadline_ms: u64,
    pub metric_deadline_ms: u64,
    pub disk_mount: PathBuf,
    /// Overrides the platform's procfs root for connection tables.
    pub proc_root: Option<PathBuf>,
    pub connection_cache_ttl_ms: u64,
    pub max_table_bytes: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            cpu_deadline_ms: 3000,
            metric_deadline_ms: 2000,
            disk_mount: PathBuf::from("/"),
            proc_root: None,
            connection_cache_ttl_ms: 5000,
            max_table_bytes: MAX_TABLE_BYTES,
        }
    }
}

impl CollectorConfig {
    pub fn deadlines(&self) -> Deadlines {
        Deadlines {
            cpu: Duration::from_millis(self.cpu_deadline_ms),
            metric: Duration::from_millis(self.metric_deadline_ms),
        }
    }

    pub fn connection_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_cache_ttl_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    pub warn_cooldown_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
            warn_cooldown_secs: 30,
        }
    }
}

impl LogConfig {
    pub fn warn_cooldown(&self) -> Duration {
        Duration::from_secs(self.warn_cooldown_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub binary_path: PathBuf,
    pub args: Vec<String>,
    pub startup_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            binary_path: PathBuf::from("bin/xray-linux-amd64"),
            args: vec!["-c".to_string(), "bin/config.json".to_string()],
            startup_grace_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub releases_api_url: String,
    pub download_base_url: String,
    pub geosite_path: PathBuf,
    pub geoip_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub download_timeout_secs: u64,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        UpgradeConfig {
            releases_api_url: DEFAULT_RELEASES_API_URL.to_string(),
            download_base_url: DEFAULT_DOWNLOAD_BASE_URL.to_string(),
            geosite_path: PathBuf::from("bin/geosite.dat"),
            geoip_path: PathBuf::from("bin/geoip.dat"),
            scratch_dir: PathBuf::from("."),
            download_timeout_secs: 120,
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hostpulse").join("config.toml"))
}

pub fn load_config() -> Config {
    match config_path() {
        Some(path) if path.exists() => load_config_from_path(&path),
        _ => Config::default(),
    }
}

pub fn load_config_from_path(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
        Err(_) => Config::default(),
    }
}
