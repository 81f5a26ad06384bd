use pkg_types::context::RequestContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ledger::QuotaLedger;

/// Background controller that reclaims reservations whose expiry has passed,
/// so a caller crashing between reserve and settle cannot leak capacity.
pub struct ReservationExpiryController {
    ledger: Arc<QuotaLedger>,
    check_interval: Duration,
}

impl ReservationExpiryController {
    pub fn new(ledger: Arc<QuotaLedger>, check_interval: Duration) -> Self {
        Self {
            ledger,
            check_interval,
        }
    }

    /// Start the controller loop as a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "ReservationExpiryController started (interval={}s)",
                self.check_interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.reconcile().await {
                    warn!("ReservationExpiryController sweep error: {}", e);
                }
            }
        })
    }

    /// One pass: expire every stale reservation. Returns how many were reclaimed.
    pub async fn reconcile(&self) -> anyhow::Result<usize> {
        let ctx = RequestContext::admin();
        let reclaimed = self.ledger.reservation_expire(&ctx).await?;
        debug!(
            "Expiry sweep {} reclaimed {} reservations",
            ctx.request_id, reclaimed
        );
        Ok(reclaimed)
    }
}
