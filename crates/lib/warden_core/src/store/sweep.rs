//! Periodic removal of expired refresh-token records.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::CredentialStore;

/// Purge expired refresh records every `every` until `cancel` fires.
///
/// The first sweep runs immediately. A failed sweep is logged and retried
/// on the next tick.
pub async fn sweep_refresh_tokens(
    store: CredentialStore,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.purge_expired_refresh_tokens().await {
                    warn!(error = %e, "refresh record sweep failed");
                }
            }
        }
    }
    debug!("refresh record sweep stopped");
}
