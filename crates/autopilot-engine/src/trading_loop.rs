//! Per-instance trading loop.
//!
//! Ticks at the configured interval and runs one cycle per tick until the
//! stop signal flips. A cycle in progress always completes; the caller bounds
//! how long it waits for that.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::instance::AutopilotInstance;

pub(crate) async fn run(instance: Arc<AutopilotInstance>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(instance.loop_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the first immediate tick
    ticker.tick().await;

    info!(
        instance = %instance.id(),
        interval_ms = instance.loop_interval().as_millis() as u64,
        "Trading loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = instance.run_cycle().await;
                if report.intents > 0 || report.hedges_opened > 0 || report.hedges_closed > 0 {
                    debug!(instance = %instance.id(), report = ?report, "Trading cycle complete");
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!(instance = %instance.id(), "Trading loop stopped");
}
