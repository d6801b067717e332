//! Background reaper of superseded file versions. Readers holding old
//! versions block their deletion; once the last one releases, the next
//! sweep removes the row and the backing file.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::catalog::Catalog;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Runs until the shared token is cancelled, sweeping on a fixed cadence
/// and once more on the way out. Sweep errors are logged and the loop
/// keeps going; the sweeper never takes the process down.
pub async fn run(catalog: Catalog, ctx: CancellationToken) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                debug!("sweeping superseded versions");
                if let Err(e) = catalog.sweep_superseded().await {
                    error!(error = %e, "sweep failed");
                }
            }
        }
    }

    // leave nothing superseded behind on a clean shutdown
    if let Err(e) = catalog.sweep_superseded().await {
        error!(error = %e, "final sweep failed");
    }
}
