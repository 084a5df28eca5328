use std::future::Future;
use std::io;
use std::time::Duration;

/// How long exit waits for metric reads that missed their deadline.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Runs `future` on a fresh multi-threaded runtime. Blocking tasks that are
/// still running afterwards get `shutdown_grace` and are then abandoned, so
/// a hung source cannot keep the process alive.
pub fn block_on_bounded<F: Future>(future: F, shutdown_grace: Duration) -> io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(shutdown_grace);
    Ok(output)
}
