//! Periodic background tasks (expiry sweeper, catalog flusher, collectors).
//!
//! Each task runs on its own tokio interval, off the request path, and stops
//! when either the process-wide shutdown flag or its own handle is signalled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Handle returned by [`spawn_periodic`] to control the task.
pub struct TaskHandle {
    name: String,
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl TaskHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the task to stop at its next tick.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Signal and wait.
    pub async fn stop(self) {
        self.signal_shutdown();
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Spawn `tick` every `period` until shutdown.
///
/// The first tick fires one full period after spawning. Missed ticks are
/// delayed rather than bursted.
///
/// Must be called from within a tokio runtime.
#[must_use]
pub fn spawn_periodic<F>(
    name: impl Into<String>,
    period: Duration,
    shutdown_flag: Arc<AtomicBool>,
    mut tick: F,
) -> TaskHandle
where
    F: FnMut() + Send + 'static,
{
    let name = name.into();
    let internal_shutdown = Arc::new(AtomicBool::new(false));
    let internal_flag = Arc::clone(&internal_shutdown);
    let task_name = name.clone();

    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = %task_name, period_ms = period.as_millis() as u64, "background task started");

        loop {
            interval.tick().await;

            if shutdown_flag.load(Ordering::SeqCst) || internal_flag.load(Ordering::SeqCst) {
                info!(task = %task_name, "background task: shutdown signal received");
                break;
            }

            tick();
        }
    });

    TaskHandle {
        name,
        task,
        shutdown: internal_shutdown,
    }
}
