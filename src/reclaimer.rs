use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::backend::LocalBackend;

/// Background sweep that drops local buckets idle for longer than `idle_for`.
///
/// The sweep runs every `idle_for` as well. Stops on [`Reclaimer::shutdown`]
/// or when dropped.
pub struct Reclaimer {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    pub fn spawn(backend: Arc<LocalBackend>, idle_for: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(idle_for);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing can be idle yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = backend.evict_idle(idle_for);
                        if removed > 0 {
                            info!(
                                target: "pastegate::reclaimer",
                                removed,
                                remaining = backend.len(),
                                "evicted idle rate limit buckets"
                            );
                        } else {
                            debug!(target: "pastegate::reclaimer", tracked = backend.len(), "no idle buckets");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the sweep and wait for the task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::token_bucket::BucketLimit;

    #[tokio::test]
    async fn test_sweep_evicts_idle_buckets() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(LocalBackend::with_clock(clock.clone()));
        let limit = BucketLimit::new(1.0, 1);

        backend.check("idle", &limit);
        clock.advance(Duration::from_secs(120));
        backend.check("busy", &limit);
        assert_eq!(backend.len(), 2);

        let reclaimer = Reclaimer::spawn(backend.clone(), Duration::from_millis(20));

        let mut waited = 0;
        while backend.contains("idle") && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        reclaimer.shutdown().await;

        assert!(!backend.contains("idle"));
        assert!(backend.contains("busy"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let backend = Arc::new(LocalBackend::new());
        let reclaimer = Reclaimer::spawn(backend, Duration::from_secs(3600));

        tokio::time::timeout(Duration::from_secs(1), reclaimer.shutdown())
            .await
            .unwrap();
    }
}
