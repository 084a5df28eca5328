//! The supervised child process.
//!
//! [`Supervisor`] is the narrow surface the collector and the upgrade
//! pipeline need. [`CommandSupervisor`] implements it by running a binary
//! with captured output.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::SupervisorConfig;

const OUTPUT_LINES: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on one `<binary> -version` run.
pub const DEFAULT_VERSION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to stop process: {0}")]
    Stop(#[source] io::Error),
    #[error("process exited during startup: {0}")]
    ExitedEarly(String),
}

/// Implementations synchronize internally; callers hold no extra lock.
pub trait Supervisor: Send + Sync {
    fn is_running(&self) -> bool;
    fn last_error(&self) -> Option<String>;
    fn last_result_text(&self) -> String;
    fn version(&self) -> String;
    fn stop(&self) -> Result<(), SupervisorError>;
    fn restart(&self, force: bool) -> Result<(), SupervisorError>;
}

#[derive(Debug, Default)]
struct ChildState {
    child: Option<Child>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct CommandSupervisor {
    binary: PathBuf,
    args: Vec<String>,
    startup_grace: Duration,
    version_timeout: Duration,
    state: Mutex<ChildState>,
    output: Arc<Mutex<VecDeque<String>>>,
    version: Mutex<Option<String>>,
}

impl CommandSupervisor {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>, startup_grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            args,
            startup_grace,
            version_timeout: DEFAULT_VERSION_TIMEOUT,
            state: Mutex::new(ChildState::default()),
            output: Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_LINES))),
            version: Mutex::new(None),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            &config.binary_path,
            config.args.clone(),
            Duration::from_millis(config.startup_grace_ms),
        )
    }

    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    fn state(&self) -> MutexGuard<'_, ChildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self) -> Result<(), SupervisorError> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: self.binary.clone(),
                source,
            })?;

        lock(&self.output).clear();
        if let Some(stdout) = child.stdout.take() {
            capture_lines(stdout, Arc::clone(&self.output));
        }
        if let Some(stderr) = child.stderr.take() {
            capture_lines(stderr, Arc::clone(&self.output));
        }

        let mut state = self.state();
        state.child = Some(child);
        state.last_error = None;
        drop(state);
        *lock(&self.version) = None;

        self.await_startup()
    }

    // A child that dies inside the grace period counts as a failed start.
    fn await_startup(&self) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.startup_grace;
        while Instant::now() < deadline {
            if !self.is_running() {
                return Err(SupervisorError::ExitedEarly(self.last_result_text()));
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    // Killed once `version_timeout` passes so a wedged binary cannot stall
    // the caller.
    fn probe_version(&self) -> String {
        let Ok(mut child) = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        else {
            return String::new();
        };

        let deadline = Instant::now() + self.version_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => break,
                Ok(Some(_)) | Err(_) => return String::new(),
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return String::new();
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
            }
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            let _ = stdout.read_to_string(&mut output);
        }
        parse_version(&output)
    }
}

impl Supervisor for CommandSupervisor {
    fn is_running(&self) -> bool {
        let mut state = self.state();
        let Some(child) = state.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                state.child = None;
                if !status.success() {
                    state.last_error = Some(format!("process exited with {status}"));
                }
                false
            }
            Err(e) => {
                state.child = None;
                state.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    fn last_result_text(&self) -> String {
        lock(&self.output)
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    // Empty results are not cached so a later call can retry.
    fn version(&self) -> String {
        if let Some(version) = lock(&self.version).as_ref() {
            return version.clone();
        }
        let probed = self.probe_version();
        if probed.is_empty() {
            return probed;
        }
        lock(&self.version).get_or_insert(probed).clone()
    }

    fn stop(&self) -> Result<(), SupervisorError> {
        let Some(mut child) = self.state().child.take() else {
            return Ok(());
        };
        match child.kill() {
            Ok(()) => {}
            // Already exited.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(SupervisorError::Stop(e)),
        }
        child.wait().map_err(SupervisorError::Stop)?;
        Ok(())
    }

    fn restart(&self, force: bool) -> Result<(), SupervisorError> {
        if !force && self.is_running() {
            return Ok(());
        }
        self.stop()?;
        self.spawn()
    }
}

impl Drop for CommandSupervisor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn capture_lines<R: Read + Send + 'static>(stream: R, output: Arc<Mutex<VecDeque<String>>>) {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            let mut buf = lock(&output);
            if buf.len() == OUTPUT_LINES {
                buf.pop_front();
            }
            buf.push_back(line);
        }
    });
}

/// `Xray 1.8.4 (Xray, Penetrates Everything.) ...` -> `1.8.4`
fn parse_version(output: &str) -> String {
    output
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or_default()
        .to_string()
}
