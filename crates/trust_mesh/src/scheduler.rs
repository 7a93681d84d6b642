//! Background recompute task.
//!
//! Recomputes on a fixed interval and whenever
//! [`TrustScorer::record_transaction`] reports the threshold was reached.
//! The iteration itself runs on the blocking pool.

use crate::trust::{RecomputeTrigger, TrustScorer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Handle to a running scheduler.
pub struct TrustScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TrustScheduler {
    /// Spawn on the current Tokio runtime.
    pub fn spawn(scorer: Arc<TrustScorer>) -> Self {
        let interval = Duration::from_secs(scorer.config().recompute_interval_secs.max(1));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "Trust scheduler started");

            loop {
                let trigger = tokio::select! {
                    _ = ticker.tick() => RecomputeTrigger::Scheduled,
                    _ = scorer.threshold_reached() => RecomputeTrigger::Threshold,
                    _ = shutdown_rx.changed() => break,
                };

                let worker = scorer.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || worker.recompute(trigger)).await {
                    error!(error = %e, "Trust recompute task failed");
                }
            }

            info!("Trust scheduler stopped");
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the loop and wait for an in-flight recompute to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

impl TrustScorer {
    /// Start periodic and threshold-triggered recomputation.
    pub fn spawn_scheduler(self: &Arc<Self>) -> TrustScheduler {
        TrustScheduler::spawn(self.clone())
    }
}
