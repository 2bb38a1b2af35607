//! Periodic no-op heartbeat for hosts that suspend idle processes.
//!
//! The hook runs on a fixed interval for as long as the returned guard is
//! alive. It has no effect on the stream protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// Callback fired on every keepalive tick.
pub type KeepAliveHook = Arc<dyn Fn() + Send + Sync>;

/// Hook that only records a trace event.
pub fn trace_hook() -> KeepAliveHook {
    Arc::new(|| trace!(event = "keepalive_tick"))
}

/// Running heartbeat. Dropping the guard stops it.
#[derive(Debug)]
pub struct KeepAlive {
    task: JoinHandle<()>,
}

impl KeepAlive {
    /// Starts firing `hook` every `period`. The first tick happens one full
    /// period after start.
    pub fn start(period: Duration, hook: KeepAliveHook) -> Self {
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                hook();
            }
        });
        Self { task }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}
