//! Named recurring tasks with cooperative cancellation.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A periodic activity: runs its body every `interval` until cancelled.
///
/// The first run happens immediately. A body that overruns its interval
/// delays the next run rather than bursting to catch up.
#[derive(Debug, Clone)]
pub struct RecurringTask {
    name: String,
    interval: Duration,
    cancel: CancellationToken,
}

impl RecurringTask {
    pub fn new(name: impl Into<String>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            name: name.into(),
            interval,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the task loop.
    pub fn spawn<F, Fut>(self, mut body: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                task = %self.name,
                interval_ms = self.interval.as_millis() as u64,
                "Recurring task started"
            );

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(task = %self.name, "Recurring task run");
                        body().await;
                    }
                }
            }

            info!(task = %self.name, "Recurring task stopped");
        })
    }
}
