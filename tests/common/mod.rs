#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use hostpulse::supervisor::{Supervisor, SupervisorError};

pub struct FakeSupervisor {
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
    result_text: String,
    version: String,
    version_delay: Duration,
    fail_restart: bool,
    stops: AtomicUsize,
    restarts: AtomicUsize,
}

impl FakeSupervisor {
    pub fn new(running: bool, last_error: Option<&str>, result_text: &str) -> Self {
        FakeSupervisor {
            running: AtomicBool::new(running),
            last_error: Mutex::new(last_error.map(str::to_string)),
            result_text: result_text.to_string(),
            version: "1.8.4".to_string(),
            version_delay: Duration::ZERO,
            fail_restart: false,
            stops: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn running() -> Self {
        Self::new(true, None, "")
    }

    pub fn failing_restart() -> Self {
        FakeSupervisor {
            fail_restart: true,
            ..Self::running()
        }
    }

    /// `version()` blocks this long, like a wedged `-version` probe.
    pub fn with_version_delay(mut self, delay: Duration) -> Self {
        self.version_delay = delay;
        self
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Supervisor for FakeSupervisor {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    fn last_result_text(&self) -> String {
        self.result_text.clone()
    }

    fn version(&self) -> String {
        thread::sleep(self.version_delay);
        self.version.clone()
    }

    fn stop(&self) -> Result<(), SupervisorError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn restart(&self, _force: bool) -> Result<(), SupervisorError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_restart {
            *self.last_error.lock().unwrap() = Some("exit status: 23".to_string());
            return Err(SupervisorError::ExitedEarly("failed to load config".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
}
