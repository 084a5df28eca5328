//! Replace the supervised binary with a published release.
//!
//! The archive is downloaded and validated before the running process is
//! touched. Once the process has been stopped, a restart is attempted on
//! every exit path, and its failure is logged rather than returned: the
//! caller learns whether the files were replaced and polls process state
//! for the rest.

pub mod transport;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::config::UpgradeConfig;
use crate::diagnostics::DiagnosticSink;
use crate::supervisor::Supervisor;
use crate::system::platform;
use transport::{ReleaseTransport, TransportError};

pub const BINARY_ENTRY: &str = "xray";
pub const GEOSITE_ENTRY: &str = "geosite.dat";
pub const GEOIP_ENTRY: &str = "geoip.dat";

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("no release archive is published for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("failed to download {file_name} for {version}: {source}")]
    Download {
        version: String,
        file_name: String,
        #[source]
        source: TransportError,
    },
    #[error("download of {file_name} timed out after {timeout:?}")]
    DownloadTimeout { file_name: String, timeout: Duration },
    #[error("failed to write {}: {source}", path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is not a readable archive: {source}", path.display())]
    InvalidArchive {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
    #[error("archive has no usable {entry} entry: {source}")]
    MissingEntry {
        entry: &'static str,
        #[source]
        source: ZipError,
    },
    #[error("failed to install {entry} to {}: {source}", dest.display())]
    Extract {
        entry: &'static str,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("install task aborted: {0}")]
    Aborted(#[source] tokio::task::JoinError),
}

impl UpgradeError {
    /// Failed after the supervised process was stopped.
    pub fn is_extraction_failure(&self) -> bool {
        matches!(
            self,
            UpgradeError::MissingEntry { .. } | UpgradeError::Extract { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallTargets {
    pub binary: PathBuf,
    pub geosite: PathBuf,
    pub geoip: PathBuf,
}

impl InstallTargets {
    fn entries(&self) -> [(&'static str, &Path); 3] {
        [
            (BINARY_ENTRY, &self.binary),
            (GEOSITE_ENTRY, &self.geosite),
            (GEOIP_ENTRY, &self.geoip),
        ]
    }
}

/// Stops the supervised process, copies the payload out of a validated
/// archive and restarts the process. Runs on a blocking thread.
pub struct Installer<S: ?Sized> {
    supervisor: Arc<S>,
    sink: DiagnosticSink,
    targets: InstallTargets,
}

impl<S: ?Sized> Clone for Installer<S> {
    fn clone(&self) -> Self {
        Installer {
            supervisor: Arc::clone(&self.supervisor),
            sink: self.sink.clone(),
            targets: self.targets.clone(),
        }
    }
}

impl<S: Supervisor + ?Sized> Installer<S> {
    pub fn new(supervisor: Arc<S>, sink: DiagnosticSink, targets: InstallTargets) -> Self {
        Installer {
            supervisor,
            sink,
            targets,
        }
    }

    pub fn install(&self, archive_path: &Path) -> Result<(), UpgradeError> {
        let file = File::open(archive_path).map_err(|source| UpgradeError::Scratch {
            path: archive_path.to_path_buf(),
            source,
        })?;
        let mut archive = ZipArchive::new(file).map_err(|source| UpgradeError::InvalidArchive {
            path: archive_path.to_path_buf(),
            source,
        })?;

        if let Err(err) = self.supervisor.stop() {
            self.sink.warn(format!("stop supervised process failed: {err}"));
        }
        let _restart = RestartOnDrop {
            supervisor: &*self.supervisor,
            sink: &self.sink,
        };

        for (entry, dest) in self.targets.entries() {
            copy_entry(&mut archive, entry, dest)?;
            self.sink.debug(format!("installed {entry} to {}", dest.display()));
        }
        Ok(())
    }
}

struct RestartOnDrop<'a, S: Supervisor + ?Sized> {
    supervisor: &'a S,
    sink: &'a DiagnosticSink,
}

impl<S: Supervisor + ?Sized> Drop for RestartOnDrop<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.supervisor.restart(true) {
            self.sink.error(format!("restart supervised process failed: {err}"));
        }
    }
}

/// Downloaded archive on disk, removed when dropped.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn create(path: PathBuf, bytes: &[u8]) -> Result<Self, UpgradeError> {
        remove_if_exists(&path).map_err(|source| UpgradeError::Scratch {
            path: path.clone(),
            source,
        })?;
        let scratch = ScratchFile { path };
        fs::write(&scratch.path, bytes).map_err(|source| UpgradeError::Scratch {
            path: scratch.path.clone(),
            source,
        })?;
        Ok(scratch)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct Upgrader<T, S: ?Sized> {
    transport: T,
    installer: Installer<S>,
    sink: DiagnosticSink,
    scratch_dir: PathBuf,
    download_timeout: Duration,
    os: String,
    arch: String,
}

impl<T, S> Upgrader<T, S>
where
    T: ReleaseTransport,
    S: Supervisor + ?Sized + 'static,
{
    pub fn new(
        transport: T,
        supervisor: Arc<S>,
        sink: DiagnosticSink,
        targets: InstallTargets,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Upgrader {
            transport,
            installer: Installer::new(supervisor, sink.clone(), targets),
            sink,
            scratch_dir: scratch_dir.into(),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    pub fn from_config(
        transport: T,
        supervisor: Arc<S>,
        sink: DiagnosticSink,
        config: &UpgradeConfig,
        binary_path: impl Into<PathBuf>,
    ) -> Self {
        let targets = InstallTargets {
            binary: binary_path.into(),
            geosite: config.geosite_path.clone(),
            geoip: config.geoip_path.clone(),
        };
        Self::new(transport, supervisor, sink, targets, &config.scratch_dir)
            .with_download_timeout(Duration::from_secs(config.download_timeout_secs))
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Resolve archives for a different OS/arch than the running host.
    pub fn with_platform(mut self, os: impl Into<String>, arch: impl Into<String>) -> Self {
        self.os = os.into();
        self.arch = arch.into();
        self
    }

    /// Tag names of every published release, newest first as served.
    pub async fn list_versions(&self) -> Result<Vec<String>, TransportError> {
        let releases = tokio::time::timeout(self.download_timeout, self.transport.list_releases())
            .await
            .map_err(|_| TransportError::Timeout(self.download_timeout))??;
        Ok(releases.into_iter().map(|r| r.tag_name).collect())
    }

    pub async fn upgrade(&self, version: &str) -> Result<(), UpgradeError> {
        let file_name = platform::release_asset_name(&self.os, &self.arch).ok_or_else(|| {
            UpgradeError::UnsupportedPlatform {
                os: self.os.clone(),
                arch: self.arch.clone(),
            }
        })?;

        self.sink.info(format!("downloading {file_name} for {version}"));
        let bytes = match tokio::time::timeout(
            self.download_timeout,
            self.transport.fetch_archive(version, &file_name),
        )
        .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(source)) => {
                return Err(UpgradeError::Download {
                    version: version.to_string(),
                    file_name,
                    source,
                });
            }
            Err(_) => {
                return Err(UpgradeError::DownloadTimeout {
                    file_name,
                    timeout: self.download_timeout,
                });
            }
        };

        let scratch = ScratchFile::create(self.scratch_dir.join(&file_name), &bytes)?;
        let installer = self.installer.clone();
        let archive_path = scratch.path.clone();
        tokio::task::spawn_blocking(move || installer.install(&archive_path))
            .await
            .map_err(UpgradeError::Aborted)??;

        self.sink.info(format!("installed {version}"));
        Ok(())
    }
}

fn copy_entry(
    archive: &mut ZipArchive<File>,
    entry: &'static str,
    dest: &Path,
) -> Result<(), UpgradeError> {
    let mut source = archive
        .by_name(entry)
        .map_err(|source| UpgradeError::MissingEntry { entry, source })?;
    let extract_err = |source: io::Error| UpgradeError::Extract {
        entry,
        dest: dest.to_path_buf(),
        source,
    };

    remove_if_exists(dest).map_err(extract_err)?;
    let mut file = create_executable(dest).map_err(extract_err)?;
    io::copy(&mut source, &mut file).map_err(extract_err)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn create_executable(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o777);
    }
    options.open(path)
}
