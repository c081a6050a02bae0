mod service;


pub use service::{TelemetryOverview, TelemetryService, Windows};

use crate::device::DeviceClient;
use crate::history::HistoryStore;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Drives the fixed-interval poll loop for one miner.
///
/// The first tick fires immediately, so the service polls once at startup.
/// Exactly one fetch is ever in flight: the fetch is awaited inline on the
/// loop's own task, and ticks that fire while it is outstanding are skipped.
/// A failed tick surfaces an error state and nothing else; the loop keeps the
/// same cadence indefinitely, with no backoff.
pub fn spawn_poll_loop(
    service: TelemetryService,
    client: DeviceClient,
    store: HistoryStore,
    poll_interval: Duration,
    persist_min_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let windows = Windows::for_interval(poll_interval);
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_persist: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = service.repoll_requested() => {}
            }

            poll_once(&service, &client, &windows).await;

            let due = last_persist.map_or(true, |at| at.elapsed() >= persist_min_interval);
            if due {
                service.persist(&store);
                last_persist = Some(Instant::now());
            }
        }

        // Unconditional save before the session is lost.
        service.persist(&store);
    })
}

async fn poll_once(service: &TelemetryService, client: &DeviceClient, windows: &Windows) {
    let since = service.last_sample_time();
    match client.fetch_status(since).await {
        Ok(status) => service.apply_status(status, windows),
        Err(err) => {
            tracing::warn!(error = %err, "miner status poll failed");
            service.record_error(format!("{err:#}"));
        }
    }
}
