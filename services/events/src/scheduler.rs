//! Named background jobs for the event service.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs a fallible body every `interval` until its token is cancelled.
/// A failed run is logged and the next run happens on schedule.
#[derive(Debug, Clone)]
pub struct RecurringTask {
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
}

impl RecurringTask {
    pub fn new(name: &'static str, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            name,
            interval,
            cancel,
        }
    }

    pub fn spawn<F, Fut, E>(self, mut body: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(task = self.name, interval_secs = self.interval.as_secs_f64(), "Background task started");

            let mut failures = 0u64;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = body().await {
                            failures += 1;
                            warn!(task = self.name, failures, error = %e, "Background task run failed");
                        }
                    }
                }
            }

            info!(task = self.name, failures, "Background task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_task() {
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicU32::new(0));

        let handle = RecurringTask::new("flaky", Duration::from_secs(10), cancel.clone()).spawn({
            let runs = runs.clone();
            move || {
                let runs = runs.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                        Err("store unavailable")
                    } else {
                        Ok(())
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
