//! Pool monitor
//!
//! Periodic tick that reports pool status and asks the manager to top up any
//! idle capacity. Runs as its own task against the manager's command channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, instrument, warn};

use crate::pool::health::HealthTracker;
use crate::pool::manager::PoolHandle;

/// Periodic status/top-up service
pub struct PoolMonitor {
    check_interval: Duration,
    pool: PoolHandle,
    health: Arc<HealthTracker>,
}

impl PoolMonitor {
    pub fn new(check_interval: Duration, pool: PoolHandle, health: Arc<HealthTracker>) -> Self {
        Self {
            check_interval,
            pool,
            health,
        }
    }

    /// Run the monitor (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting pool monitor with {}s interval",
            self.check_interval.as_secs()
        );

        let mut tick = interval(self.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.pool.status().await {
                        Some(status) => {
                            let (success, fail) = self.health.totals();
                            info!(
                                active = status.active,
                                capacity = status.capacity,
                                roster = status.roster,
                                success,
                                fail,
                                "pool status"
                            );
                        }
                        None => {
                            warn!("pool manager is gone, stopping monitor");
                            break;
                        }
                    }
                    self.pool.top_up().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
