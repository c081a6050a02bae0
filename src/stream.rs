use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

pub type SubscriberId = u64;

/// Events delivered to an attached subscriber. Frames are relayed verbatim in
/// upstream order; `Closed` is terminal and carries the reason the upstream
/// went away.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Frame(String),
    Closed { reason: String },
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("no miner host configured")]
    Unconfigured,
}

struct UpstreamHandle {
    epoch: u64,
    cancel: CancellationToken,
}

struct MuxState {
    next_id: SubscriberId,
    epoch: u64,
    subscribers: HashMap<SubscriberId, mpsc::Sender<StreamEvent>>,
    upstream: Option<UpstreamHandle>,
}

/// Parameters for one upstream connection attempt, produced under the
/// registry lock and executed outside it.
struct UpstreamLaunch {
    url: String,
    epoch: u64,
    cancel: CancellationToken,
}

/// Fans one live miner log connection out to every attached subscriber.
///
/// The registry and the upstream handle live under a single mutex and are
/// updated atomically together: the upstream connection exists iff the
/// registry is non-empty, and only the last detach closes it. Connection
/// attempts carry an epoch so a stale upstream task can never clobber the
/// state of a newer one.
pub struct StreamMultiplexer {
    ws_url: Option<String>,
    state: Mutex<MuxState>,
}

impl StreamMultiplexer {
    pub fn new(ws_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            ws_url,
            state: Mutex::new(MuxState {
                next_id: 1,
                epoch: 0,
                subscribers: HashMap::new(),
                upstream: None,
            }),
        })
    }

    pub fn configured(&self) -> bool {
        self.ws_url.is_some()
    }

    /// Adds a subscriber and starts the upstream connection when this is the
    /// first one. Rejected outright when no miner address is configured.
    pub fn attach(
        self: &Arc<Self>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<SubscriberId, AttachError> {
        let (id, launch) = self.register(tx)?;
        if let Some(launch) = launch {
            let mux = Arc::clone(self);
            tokio::spawn(async move {
                mux.run_upstream(launch.url, launch.epoch, launch.cancel)
                    .await;
            });
        }
        Ok(id)
    }

    fn register(
        &self,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(SubscriberId, Option<UpstreamLaunch>), AttachError> {
        let Some(url) = self.ws_url.clone() else {
            return Err(AttachError::Unconfigured);
        };

        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, tx);

        let launch = if state.upstream.is_none() {
            state.epoch += 1;
            let cancel = CancellationToken::new();
            state.upstream = Some(UpstreamHandle {
                epoch: state.epoch,
                cancel: cancel.clone(),
            });
            Some(UpstreamLaunch {
                url,
                epoch: state.epoch,
                cancel,
            })
        } else {
            None
        };
        Ok((id, launch))
    }

    /// Removes a subscriber. When the registry empties this closes the
    /// upstream connection, and nothing else ever does so proactively.
    pub fn detach(&self, id: SubscriberId) {
        let mut state = self.state.lock().unwrap();
        if state.subscribers.remove(&id).is_none() {
            return;
        }
        if state.subscribers.is_empty() {
            if let Some(handle) = state.upstream.take() {
                tracing::debug!("last subscriber detached; closing miner log stream");
                handle.cancel.cancel();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    pub fn upstream_active(&self) -> bool {
        self.state.lock().unwrap().upstream.is_some()
    }

    /// Replicates one upstream frame to a snapshot of the registry. A full or
    /// gone subscriber channel is logged and skipped; it never aborts delivery
    /// to the others and never touches the upstream.
    fn deliver_frame(&self, frame: &str) {
        let targets: Vec<(SubscriberId, mpsc::Sender<StreamEvent>)> = {
            let state = self.state.lock().unwrap();
            state
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        for (id, tx) in targets {
            if let Err(err) = tx.try_send(StreamEvent::Frame(frame.to_string())) {
                tracing::warn!(subscriber = id, error = %err, "dropping log frame for subscriber");
            }
        }
    }

    /// A connect attempt failed before the stream opened: back to the
    /// no-upstream state, subscribers untouched. The next attach retries.
    fn connect_failed(&self, epoch: u64) {
        let mut state = self.state.lock().unwrap();
        if state.upstream.as_ref().map(|h| h.epoch) == Some(epoch) {
            state.upstream = None;
        }
    }

    /// The open upstream closed or errored: clear the handle, notify every
    /// subscriber with the reason, and clear the registry. A fresh attach is
    /// the only way to get a new upstream after this.
    fn upstream_lost(&self, epoch: u64, reason: &str) {
        let drained: Vec<(SubscriberId, mpsc::Sender<StreamEvent>)> = {
            let mut state = self.state.lock().unwrap();
            if state.upstream.as_ref().map(|h| h.epoch) != Some(epoch) {
                return;
            }
            state.upstream = None;
            state.subscribers.drain().collect()
        };
        tracing::warn!(reason, subscribers = drained.len(), "miner log stream lost");
        for (id, tx) in drained {
            let event = StreamEvent::Closed {
                reason: reason.to_string(),
            };
            if let Err(err) = tx.try_send(event) {
                tracing::warn!(subscriber = id, error = %err, "dropping close notice for subscriber");
            }
        }
    }

    async fn run_upstream(self: Arc<Self>, url: String, epoch: u64, cancel: CancellationToken) {
        tracing::info!(%url, "connecting to miner log stream");
        let ws = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = connect_async(&url) => match connected {
                Ok((ws, _)) => ws,
                Err(err) => {
                    tracing::warn!(%url, error = %err, "miner log stream connect failed");
                    self.connect_failed(epoch);
                    return;
                }
            },
        };
        tracing::info!(%url, "miner log stream open");
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.deliver_frame(text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        self.deliver_frame(&String::from_utf8_lossy(&data));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        self.upstream_lost(epoch, &format!("miner log stream error: {err}"));
                        return;
                    }
                    None => {
                        self.upstream_lost(epoch, "miner log stream closed");
                        return;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> Arc<StreamMultiplexer> {
        StreamMultiplexer::new(Some("ws://127.0.0.1:1/api/ws".to_string()))
    }

    fn subscriber() -> (mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>) {
        mpsc::channel(16)
    }

    fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn attach_is_rejected_when_unconfigured() {
        let mux = StreamMultiplexer::new(None);
        let (tx, _rx) = subscriber();
        assert!(matches!(mux.register(tx), Err(AttachError::Unconfigured)));
        assert_eq!(mux.subscriber_count(), 0);
        assert!(!mux.upstream_active());
    }

    #[test]
    fn registry_cardinality_governs_the_upstream() {
        let mux = mux();
        let (tx_a, _rx_a) = subscriber();
        let (tx_b, _rx_b) = subscriber();

        // 0 -> 1 starts exactly one upstream attempt.
        let (a, launch_a) = mux.register(tx_a).unwrap();
        let launch_a = launch_a.expect("first attach launches the upstream");
        assert!(mux.upstream_active());

        // A second attach reuses it.
        let (b, launch_b) = mux.register(tx_b).unwrap();
        assert!(launch_b.is_none());

        // Dropping to one subscriber keeps the upstream open.
        mux.detach(a);
        assert!(mux.upstream_active());
        assert!(!launch_a.cancel.is_cancelled());

        // N -> 0 triggers exactly one close.
        mux.detach(b);
        assert!(!mux.upstream_active());
        assert!(launch_a.cancel.is_cancelled());

        // Detaching an unknown id again is a no-op.
        mux.detach(b);
        assert!(!mux.upstream_active());
    }

    #[test]
    fn frames_fan_out_in_order_without_backfill() {
        let mux = mux();
        let (tx_a, mut rx_a) = subscriber();
        let (_, _) = mux.register(tx_a).unwrap();

        mux.deliver_frame("frame 1");
        mux.deliver_frame("frame 2");
        mux.deliver_frame("frame 3");

        // B joins mid-stream and only sees what follows.
        let (tx_b, mut rx_b) = subscriber();
        let (_, launch_b) = mux.register(tx_b).unwrap();
        assert!(launch_b.is_none());

        mux.deliver_frame("frame 4");
        mux.deliver_frame("frame 5");

        let frames_a: Vec<StreamEvent> = drain(&mut rx_a);
        let expected: Vec<StreamEvent> = (1..=5)
            .map(|i| StreamEvent::Frame(format!("frame {i}")))
            .collect();
        assert_eq!(frames_a, expected);

        let frames_b = drain(&mut rx_b);
        assert_eq!(
            frames_b,
            vec![
                StreamEvent::Frame("frame 4".to_string()),
                StreamEvent::Frame("frame 5".to_string()),
            ]
        );
    }

    #[test]
    fn one_slow_subscriber_never_blocks_the_rest() {
        let mux = mux();
        // Capacity 1 and never drained: the second frame cannot be delivered.
        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = subscriber();
        mux.register(tx_slow).unwrap();
        mux.register(tx_ok).unwrap();

        mux.deliver_frame("frame 1");
        mux.deliver_frame("frame 2");

        assert_eq!(drain(&mut rx_ok).len(), 2);
        assert!(mux.upstream_active());
        assert_eq!(mux.subscriber_count(), 2);
    }

    #[test]
    fn upstream_loss_closes_everyone_and_requires_reattach() {
        let mux = mux();
        let (tx_a, mut rx_a) = subscriber();
        let (tx_b, mut rx_b) = subscriber();
        let (_, launch) = mux.register(tx_a).unwrap();
        let epoch = launch.unwrap().epoch;
        mux.register(tx_b).unwrap();

        mux.upstream_lost(epoch, "miner log stream error: reset by peer");

        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            assert_eq!(
                events,
                vec![StreamEvent::Closed {
                    reason: "miner log stream error: reset by peer".to_string()
                }]
            );
        }
        assert_eq!(mux.subscriber_count(), 0);
        assert!(!mux.upstream_active());

        // The next attach gets a brand-new attempt, not the dead handle.
        let (tx_c, _rx_c) = subscriber();
        let (_, launch) = mux.register(tx_c).unwrap();
        let relaunch = launch.expect("fresh attach relaunches the upstream");
        assert!(relaunch.epoch > epoch);
        assert!(!relaunch.cancel.is_cancelled());
    }

    #[test]
    fn full_queue_loses_the_close_notice_but_the_registry_still_clears() {
        let mux = mux();
        // Capacity 1 and never drained: the close notice has nowhere to go.
        let (tx_full, mut rx_full) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = subscriber();
        let (_, launch) = mux.register(tx_full).unwrap();
        let epoch = launch.unwrap().epoch;
        mux.register(tx_ok).unwrap();

        mux.deliver_frame("frame 1");
        mux.upstream_lost(epoch, "miner log stream closed");

        // The full subscriber keeps its backlog; the notice was dropped.
        assert_eq!(
            drain(&mut rx_full),
            vec![StreamEvent::Frame("frame 1".to_string())]
        );
        assert_eq!(
            drain(&mut rx_ok),
            vec![
                StreamEvent::Frame("frame 1".to_string()),
                StreamEvent::Closed {
                    reason: "miner log stream closed".to_string()
                },
            ]
        );
        assert_eq!(mux.subscriber_count(), 0);
        assert!(!mux.upstream_active());
    }

    #[test]
    fn stale_upstream_task_cannot_clobber_a_newer_connection() {
        let mux = mux();
        let (tx_a, _rx_a) = subscriber();
        let (_, launch) = mux.register(tx_a).unwrap();
        let old_epoch = launch.unwrap().epoch;

        mux.upstream_lost(old_epoch, "closed");
        let (tx_b, mut rx_b) = subscriber();
        let (_, launch) = mux.register(tx_b).unwrap();
        assert!(launch.is_some());

        // Reports from the dead task are ignored.
        mux.upstream_lost(old_epoch, "closed again");
        mux.connect_failed(old_epoch);
        assert!(mux.upstream_active());
        assert_eq!(mux.subscriber_count(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn connect_failure_leaves_subscribers_for_the_next_attempt() {
        let mux = mux();
        let (tx_a, mut rx_a) = subscriber();
        let (_, launch) = mux.register(tx_a).unwrap();
        let epoch = launch.unwrap().epoch;

        mux.connect_failed(epoch);
        assert!(!mux.upstream_active());
        assert_eq!(mux.subscriber_count(), 1);
        assert!(drain(&mut rx_a).is_empty());

        // A new attach retries while the earlier subscriber stays attached.
        let (tx_b, _rx_b) = subscriber();
        let (_, launch) = mux.register(tx_b).unwrap();
        assert!(launch.is_some());
        assert_eq!(mux.subscriber_count(), 2);
    }
}
