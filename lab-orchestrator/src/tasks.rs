//! Periodic background tasks bound to the lifetime of the process.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Handle to a task that runs `tick` on a fixed interval until shut down.
///
/// A failing tick is logged and retried on the next interval. Shutdown drops
/// an in-flight tick, so ticks must tolerate being cut off at any await.
pub struct BackgroundTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(task = name, period_secs = period.as_secs_f64(), "background task running");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tokio::select! {
                            result = tick() => {
                                if let Err(e) = result {
                                    error!(task = name, error = %format!("{:#}", e), "background task cycle failed");
                                }
                            }
                            _ = stopped.changed() => {
                                warn!(task = name, "in-flight cycle interrupted by shutdown");
                                break;
                            }
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }

            info!(task = name, "background task stopped");
        });

        Self { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!(task = self.name, error = %e, "background task ended abnormally");
        }
    }
}
