//! Rate-limited diagnostic sink.
//!
//! Metric collection fails in the same way over and over when a source is
//! broken, so warnings are deduplicated: an identical message is dropped
//! while it is still inside the cooldown window of its last emission.
//! Every other severity passes straight through to `tracing`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_WARN_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct LastWarning {
    message: String,
    emitted_at: Instant,
}

#[derive(Debug)]
struct Inner {
    cooldown: Duration,
    last: Mutex<Option<LastWarning>>,
    emitted: AtomicU64,
    suppressed: AtomicU64,
    errors: AtomicU64,
}

/// Cheap to clone; clones share the same suppression state.
#[derive(Debug, Clone)]
pub struct DiagnosticSink {
    inner: Arc<Inner>,
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_COOLDOWN)
    }
}

impl DiagnosticSink {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cooldown,
                last: Mutex::new(None),
                emitted: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        tracing::debug!("{}", message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        tracing::info!("{}", message.as_ref());
    }

    /// Emits at warning severity unless the same message went out less than
    /// `cooldown` ago. Returns whether the message was emitted.
    pub fn warn(&self, message: impl AsRef<str>) -> bool {
        self.warn_at(message.as_ref(), Instant::now())
    }

    /// Never suppressed.
    pub fn error(&self, message: impl AsRef<str>) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!("{}", message.as_ref());
    }

    pub fn emitted_warnings(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    pub fn suppressed_warnings(&self) -> u64 {
        self.inner.suppressed.load(Ordering::Relaxed)
    }

    pub fn errors_logged(&self) -> u64 {
        self.inner.errors.load(Ordering::Relaxed)
    }

    fn warn_at(&self, message: &str, now: Instant) -> bool {
        if !self.admit(message, now) {
            self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("{message}");
        true
    }

    // Check and update under one lock so racing callers cannot both pass.
    fn admit(&self, message: &str, now: Instant) -> bool {
        let mut last = self
            .inner
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(prev) = last.as_ref()
            && prev.message == message
            && now.saturating_duration_since(prev.emitted_at) < self.inner.cooldown
        {
            return false;
        }

        *last = Some(LastWarning {
            message: message.to_owned(),
            emitted_at: now,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn repeated_warning_within_cooldown_is_suppressed() {
        let sink = DiagnosticSink::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(sink.warn_at("get cpu percent timeout", t0));
        assert!(!sink.warn_at("get cpu percent timeout", t0 + Duration::from_secs(29)));
        assert_eq!(sink.emitted_warnings(), 1);
        assert_eq!(sink.suppressed_warnings(), 1);
    }

    #[test]
    fn repeated_warning_after_cooldown_is_emitted_again() {
        let sink = DiagnosticSink::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(sink.warn_at("get uptime timeout", t0));
        assert!(sink.warn_at("get uptime timeout", t0 + Duration::from_secs(30)));
        assert_eq!(sink.emitted_warnings(), 2);
    }

    #[test]
    fn distinct_messages_are_never_suppressed() {
        let sink = DiagnosticSink::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(sink.warn_at("get tcp connections timeout", t0));
        assert!(sink.warn_at("get udp connections timeout", t0));
        assert!(sink.warn_at("get tcp connections timeout", t0));
        assert_eq!(sink.suppressed_warnings(), 0);
    }

    #[test]
    fn suppressed_call_does_not_extend_window() {
        let sink = DiagnosticSink::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(sink.warn_at("disk", t0));
        assert!(!sink.warn_at("disk", t0 + Duration::from_secs(20)));
        // Window is still measured from t0, not from the dropped call.
        assert!(sink.warn_at("disk", t0 + Duration::from_secs(31)));
    }

    #[test]
    fn errors_pass_through_and_are_counted() {
        let sink = DiagnosticSink::new(Duration::from_secs(30));
        sink.error("start xray failed");
        sink.error("start xray failed");
        assert_eq!(sink.errors_logged(), 2);
        assert_eq!(sink.emitted_warnings(), 0);
    }

    #[test]
    fn racing_callers_emit_once() {
        let sink = DiagnosticSink::new(Duration::from_secs(60));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let sink = sink.clone();
                thread::spawn(move || sink.warn("get load avg timeout"))
            })
            .collect();
        let passed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|emitted| *emitted)
            .count();
        assert_eq!(passed, 1);
        assert_eq!(sink.suppressed_warnings(), 15);
    }
}
