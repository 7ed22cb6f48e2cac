//! Background expiry of abandoned reservations.

use std::sync::Arc;
use std::time::Duration;

use stock_ledger::StockLedger;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Result;
use crate::manager::ReservationManager;
use crate::store::ReservationStore;

/// Periodically expires reservations nobody committed or released.
///
/// This is the only thing that returns stock held by a crashed or abandoned
/// checkout, so the interval should be small relative to the reservation TTL.
pub struct ExpirySweeper<S, L>
where
    S: ReservationStore,
    L: StockLedger,
{
    manager: Arc<ReservationManager<S, L>>,
    interval: Duration,
}

impl<S, L> ExpirySweeper<S, L>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    /// Creates a sweeper using the manager's configured sweep interval.
    pub fn new(manager: Arc<ReservationManager<S, L>>) -> Self {
        let interval = manager.config().sweep_interval;
        Self { manager, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the sweep loop. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(0) => debug!("expiry sweep found nothing to expire"),
                    Ok(expired) => debug!(expired, "expiry sweep finished"),
                    Err(e) => warn!(error = %e, "expiry sweep failed"),
                }
            }
        })
    }

    /// Runs a single sweep. Returns the number of reservations expired.
    pub async fn run_once(&self) -> Result<usize> {
        self.manager.expire_stale().await
    }
}
