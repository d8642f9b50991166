use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::db::repository::TrunchbullRepository;

use super::cancel::cancel_pair;
use super::SyncOrchestrator;

/// Periodically runs [`SyncOrchestrator::sync_all`] until shutdown.
pub struct SyncScheduler<R> {
    orchestrator: Arc<SyncOrchestrator<R>>,
    interval: Duration,
}

impl<R> SyncScheduler<R>
where
    R: TrunchbullRepository + Clone + 'static,
{
    pub fn new(orchestrator: Arc<SyncOrchestrator<R>>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Start the loop. The first pass runs immediately. Setting `shutdown` to
    /// `true` cancels the pass in flight and ends the task once it has wound
    /// down.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // A zero period would panic inside tokio.
            let period = self.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                let (handle, cancel) = cancel_pair();
                let pass = self.orchestrator.sync_all(&cancel);
                tokio::pin!(pass);

                let reports = tokio::select! {
                    reports = &mut pass => reports,
                    _ = shutdown.changed() => {
                        warn!("Shutdown requested during scheduled sync, cancelling");
                        handle.cancel();
                        pass.await;
                        break;
                    }
                };

                let failed: usize = reports.iter().map(|r| r.failed()).sum();
                info!(students = reports.len(), failed, "Scheduled sync pass complete");
            }

            info!("Sync scheduler stopped");
        })
    }
}
