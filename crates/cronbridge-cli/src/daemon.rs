use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cronbridge_router::Bridge;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// External trigger for the poll scheduler. Runs the bridge every `tick`
/// until `shutdown` broadcasts `true`.
pub async fn run(bridge: Arc<Bridge>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(tick_secs = tick.as_secs(), "daemon started");

    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let bridge = bridge.clone();
                let now = Utc::now().timestamp();
                // Handlers and SQLite calls block.
                match tokio::task::spawn_blocking(move || bridge.run(now)).await {
                    Ok(Ok(report)) if report.due() > 0 => info!(
                        ran = report.ran,
                        failed = report.failed,
                        skipped = report.skipped,
                        "poll run complete"
                    ),
                    Ok(Ok(_)) => debug!("nothing due"),
                    Ok(Err(e)) => error!("poll run error: {e}"),
                    Err(e) => error!("poll run task panicked: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("daemon shutting down");
                    break;
                }
            }
        }
    }
}
