use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Tables larger than this are skipped instead of scanned.
pub const MAX_TABLE_BYTES: u64 = 1024 * 1024;

const CHUNK_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn tables(self) -> (&'static str, &'static str) {
        match self {
            Protocol::Tcp => ("tcp", "tcp6"),
            Protocol::Udp => ("udp", "udp6"),
        }
    }
}

/// Counts `\n` bytes, reading in fixed-size chunks.
pub fn count_lines<R: Read>(mut reader: R) -> io::Result<u64> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut lines = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(lines),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }
}

/// Like [`count_lines`], but returns 0 without reading anything when the
/// source reports a length above `max_bytes`.
pub fn count_lines_limited<R: Read>(reader: R, len: u64, max_bytes: u64) -> io::Result<u64> {
    if len > max_bytes {
        return Ok(0);
    }
    count_lines(reader)
}

pub fn count_lines_in_file(path: &Path, max_bytes: u64) -> io::Result<u64> {
    let file = File::open(path)?;
    // procfs reports a zero length, so only real oversized files are skipped.
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    count_lines_limited(file, len, max_bytes)
}

#[derive(Clone, Copy, Debug)]
struct CachedCounter {
    value: u64,
    captured_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    tcp: Option<CachedCounter>,
    udp: Option<CachedCounter>,
}

/// Active TCP/UDP session counts read from the kernel connection tables,
/// cached for `ttl` so frequent snapshots don't rescan them.
#[derive(Debug)]
pub struct ConnectionCounter {
    root: Option<PathBuf>,
    ttl: Duration,
    max_bytes: u64,
    state: Mutex<CacheState>,
}

impl ConnectionCounter {
    /// `root` is the procfs mount holding `net/tcp` and friends. `None`
    /// means the host has no such tables and every count is 0.
    pub fn new(root: Option<PathBuf>, ttl: Duration) -> Self {
        Self {
            root,
            ttl,
            max_bytes: MAX_TABLE_BYTES,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn count_tcp(&self) -> u64 {
        self.count(Protocol::Tcp, Instant::now())
    }

    pub fn count_udp(&self) -> u64 {
        self.count(Protocol::Udp, Instant::now())
    }

    fn count(&self, protocol: Protocol, now: Instant) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match protocol {
            Protocol::Tcp => &mut state.tcp,
            Protocol::Udp => &mut state.udp,
        };

        if let Some(cached) = *slot
            && now.saturating_duration_since(cached.captured_at) < self.ttl
        {
            return cached.value;
        }

        let value = self.read_tables(protocol);
        *slot = Some(CachedCounter {
            value,
            captured_at: now,
        });
        value
    }

    fn read_tables(&self, protocol: Protocol) -> u64 {
        let Some(root) = &self.root else {
            return 0;
        };
        let (v4, v6) = protocol.tables();
        let net = root.join("net");

        let Ok(v4_count) = count_lines_in_file(&net.join(v4), self.max_bytes) else {
            return 0;
        };
        match count_lines_in_file(&net.join(v6), self.max_bytes) {
            Ok(v6_count) => v4_count + v6_count,
            Err(_) => v4_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use std::io::Cursor;

    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        bytes_read: usize,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.bytes_read += n;
            Ok(n)
        }
    }

    fn write_table(root: &Path, name: &str, lines: usize) {
        let net = root.join("net");
        fs::create_dir_all(&net).unwrap();
        let body: String = (0..lines).map(|i| format!("{i}: entry\n")).collect();
        fs::write(net.join(name), body).unwrap();
    }

    #[test]
    fn counts_lines_across_chunk_boundaries() {
        let data = "x\n".repeat(CHUNK_SIZE * 3);
        assert_eq!(count_lines(data.as_bytes()).unwrap(), (CHUNK_SIZE * 3) as u64);
    }

    #[test]
    fn trailing_line_without_newline_is_not_counted() {
        assert_eq!(count_lines(&b"a\nb\nc"[..]).unwrap(), 2);
        assert_eq!(count_lines(&b""[..]).unwrap(), 0);
    }

    #[test]
    fn oversized_source_is_skipped_without_reading() {
        let mut reader = CountingReader {
            inner: Cursor::new(vec![b'\n'; 2 * MAX_TABLE_BYTES as usize]),
            bytes_read: 0,
        };
        let len = 2 * MAX_TABLE_BYTES;
        let lines = count_lines_limited(&mut reader, len, MAX_TABLE_BYTES).unwrap();
        assert_eq!(lines, 0);
        assert_eq!(reader.bytes_read, 0);
    }

    #[test]
    fn oversized_file_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        fs::write(&path, vec![b'\n'; 4096]).unwrap();
        assert_eq!(count_lines_in_file(&path, 1024).unwrap(), 0);
        assert_eq!(count_lines_in_file(&path, 4096).unwrap(), 4096);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(count_lines_in_file(Path::new("/nonexistent/net/tcp"), MAX_TABLE_BYTES).is_err());
    }

    #[test]
    fn sums_v4_and_v6_tables() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), "tcp", 3);
        write_table(dir.path(), "tcp6", 2);
        write_table(dir.path(), "udp", 4);
        let counter = ConnectionCounter::new(Some(dir.path().to_path_buf()), DEFAULT_CACHE_TTL);
        assert_eq!(counter.count_tcp(), 5);
        assert_eq!(counter.count_udp(), 4);
    }

    #[test]
    fn missing_v4_table_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), "tcp6", 7);
        let counter = ConnectionCounter::new(Some(dir.path().to_path_buf()), DEFAULT_CACHE_TTL);
        assert_eq!(counter.count_tcp(), 0);
    }

    #[test]
    fn no_table_root_counts_zero() {
        let counter = ConnectionCounter::new(None, DEFAULT_CACHE_TTL);
        assert_eq!(counter.count_tcp(), 0);
        assert_eq!(counter.count_udp(), 0);
    }

    #[test]
    fn cached_value_is_served_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), "tcp", 3);
        let counter =
            ConnectionCounter::new(Some(dir.path().to_path_buf()), Duration::from_secs(5));

        let t0 = Instant::now();
        assert_eq!(counter.count(Protocol::Tcp, t0), 3);

        write_table(dir.path(), "tcp", 10);
        assert_eq!(counter.count(Protocol::Tcp, t0 + Duration::from_secs(4)), 3);
        assert_eq!(counter.count(Protocol::Tcp, t0 + Duration::from_secs(5)), 10);
    }

    #[test]
    fn counters_expire_independently() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), "tcp", 1);
        write_table(dir.path(), "udp", 1);
        let counter =
            ConnectionCounter::new(Some(dir.path().to_path_buf()), Duration::from_secs(5));

        let t0 = Instant::now();
        assert_eq!(counter.count(Protocol::Tcp, t0), 1);
        write_table(dir.path(), "udp", 6);
        // First UDP request fills its own slot even though TCP is fresh.
        assert_eq!(counter.count(Protocol::Udp, t0 + Duration::from_secs(1)), 6);
    }

    proptest! {
        #[test]
        fn line_count_matches_newline_count(data in proptest::collection::vec(any::<u8>(), 0..20_000)) {
            let expected = data.iter().filter(|&&b| b == b'\n').count() as u64;
            prop_assert_eq!(count_lines(data.as_slice()).unwrap(), expected);
        }
    }
}
