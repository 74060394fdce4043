//! Broadcast hub - fan-out of scan events to live observers
//!
//! ## Responsibilities
//!
//! - Observer registration, seeded with the current snapshot
//! - Event fan-out in publication order
//! - Eviction of observers that stop draining their queue
//!
//! The hub is a single task fed through a command channel. It never waits on
//! an observer: each one gets a forwarder task that moves events from an
//! unbounded inbox into the observer's bounded queue. A forwarder that cannot
//! deliver within `send_timeout` reports back and the observer is dropped.
//!
//! An observer registering while a cycle publishes may get the new snapshot
//! twice, once as `initial_state` and again in `scan_update`. It never misses
//! one.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::HubClosed;
use crate::models::Snapshot;

pub type ObserverId = Uuid;

/// Messages pushed to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    ScanStart {
        message: String,
    },
    ScanProgress {
        message: String,
    },
    ScanError {
        message: String,
    },
    /// First message every observer receives.
    InitialState {
        #[serde(flatten)]
        snapshot: Arc<Snapshot>,
    },
    /// Sent once per completed cycle.
    ScanUpdate {
        #[serde(flatten)]
        snapshot: Arc<Snapshot>,
        count: usize,
        new_count: usize,
        offline_count: usize,
    },
}

impl HubEvent {
    pub fn scan_start(message: impl Into<String>) -> Self {
        HubEvent::ScanStart {
            message: message.into(),
        }
    }

    pub fn scan_progress(message: impl Into<String>) -> Self {
        HubEvent::ScanProgress {
            message: message.into(),
        }
    }

    pub fn scan_error(message: impl Into<String>) -> Self {
        HubEvent::ScanError {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::ScanStart { .. } => "scan_start",
            HubEvent::ScanProgress { .. } => "scan_progress",
            HubEvent::ScanError { .. } => "scan_error",
            HubEvent::InitialState { .. } => "initial_state",
            HubEvent::ScanUpdate { .. } => "scan_update",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// How long one delivery may wait on a full observer queue.
    pub send_timeout: Duration,
    /// Events buffered per observer.
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(2),
            queue_capacity: 64,
        }
    }
}

/// Receiving end handed to a registered observer.
#[derive(Debug)]
pub struct Observer {
    pub id: ObserverId,
    pub events: mpsc::Receiver<Arc<HubEvent>>,
}

/// Why an observer left the registry.
type Eviction = (ObserverId, &'static str);

enum HubCommand {
    Register { reply: oneshot::Sender<Observer> },
    Deregister(ObserverId),
    Broadcast(HubEvent),
    Count { reply: oneshot::Sender<usize> },
}

/// Cloneable handle to the hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Register a new observer. Its queue already holds `initial_state`.
    pub async fn register(&self) -> Result<Observer, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Register { reply })
            .map_err(|_| HubClosed)?;
        rx.await.map_err(|_| HubClosed)
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn deregister(&self, id: ObserverId) {
        let _ = self.commands.send(HubCommand::Deregister(id));
    }

    /// Queue `event` for every registered observer.
    pub fn broadcast(&self, event: HubEvent) {
        if self.commands.send(HubCommand::Broadcast(event)).is_err() {
            tracing::debug!("Broadcast dropped, hub has shut down");
        }
    }

    pub async fn observer_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Count { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Hub-side end of one observer.
struct Link {
    inbox: mpsc::UnboundedSender<Arc<HubEvent>>,
    queue: mpsc::Sender<Arc<HubEvent>>,
    forwarder: JoinHandle<()>,
}

pub struct BroadcastHub {
    config: HubConfig,
    observers: HashMap<ObserverId, Link>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    evict_tx: mpsc::UnboundedSender<Eviction>,
    evictions: mpsc::UnboundedReceiver<Eviction>,
}

impl BroadcastHub {
    /// Start the hub task. It runs until every [`HubHandle`] is dropped.
    pub fn spawn(
        config: HubConfig,
        snapshot: watch::Receiver<Arc<Snapshot>>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (evict_tx, evictions) = mpsc::unbounded_channel();
        let hub = BroadcastHub {
            config: HubConfig {
                queue_capacity: config.queue_capacity.max(1),
                ..config
            },
            observers: HashMap::new(),
            snapshot,
            commands: rx,
            evict_tx,
            evictions,
        };
        let task = tokio::spawn(hub.run());
        (HubHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some((id, reason)) = self.evictions.recv() => self.deregister(id, reason),
                command = self.commands.recv() => match command {
                    Some(HubCommand::Register { reply }) => self.register(reply),
                    Some(HubCommand::Deregister(id)) => self.deregister(id, "requested"),
                    Some(HubCommand::Broadcast(event)) => self.broadcast(event),
                    Some(HubCommand::Count { reply }) => {
                        let _ = reply.send(self.observers.len());
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(observers = self.observers.len(), "Broadcast hub stopped");
    }

    fn register(&mut self, reply: oneshot::Sender<Observer>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        let snapshot = self.snapshot.borrow().clone();
        if tx
            .try_send(Arc::new(HubEvent::InitialState { snapshot }))
            .is_err()
        {
            return;
        }

        if reply.send(Observer { id, events: rx }).is_err() {
            return;
        }

        let (inbox, pending) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(
            id,
            pending,
            tx.clone(),
            self.config.send_timeout,
            self.evict_tx.clone(),
        ));
        self.observers.insert(
            id,
            Link {
                inbox,
                queue: tx,
                forwarder,
            },
        );
        tracing::info!(observer_id = %id, observers = self.observers.len(), "Observer registered");
    }

    fn deregister(&mut self, id: ObserverId, reason: &'static str) {
        if let Some(link) = self.observers.remove(&id) {
            link.forwarder.abort();
            tracing::info!(observer_id = %id, reason, observers = self.observers.len(), "Observer removed");
        }
    }

    fn broadcast(&mut self, event: HubEvent) {
        if self.observers.is_empty() {
            return;
        }

        let event = Arc::new(event);
        let gone: Vec<ObserverId> = self
            .observers
            .iter()
            .filter(|(_, link)| link.queue.is_closed() || link.inbox.send(Arc::clone(&event)).is_err())
            .map(|(id, _)| *id)
            .collect();

        for id in gone {
            self.deregister(id, "disconnected");
        }
    }
}

/// Move events from `pending` into the observer's queue, one at a time.
async fn forward(
    id: ObserverId,
    mut pending: mpsc::UnboundedReceiver<Arc<HubEvent>>,
    queue: mpsc::Sender<Arc<HubEvent>>,
    timeout: Duration,
    evictions: mpsc::UnboundedSender<Eviction>,
) {
    while let Some(event) = pending.recv().await {
        let reason = match queue.send_timeout(event, timeout).await {
            Ok(()) => continue,
            Err(SendTimeoutError::Timeout(event)) => {
                tracing::warn!(observer_id = %id, event = event.kind(), "Observer too slow, dropping it");
                "send timeout"
            }
            Err(SendTimeoutError::Closed(_)) => "disconnected",
        };
        let _ = evictions.send((id, reason));
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(config: HubConfig) -> (HubHandle, watch::Sender<Arc<Snapshot>>) {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::empty(30)));
        let (handle, _task) = BroadcastHub::spawn(config, rx);
        (handle, tx)
    }

    #[tokio::test]
    async fn test_initial_state_comes_first() {
        let (handle, snapshots) = hub(HubConfig::default());
        let mut next = Snapshot::empty(30);
        next.scanning = true;
        snapshots.send_replace(Arc::new(next));

        let mut observer = handle.register().await.unwrap();
        handle.broadcast(HubEvent::scan_start("Starting network scan..."));

        let first = observer.events.recv().await.unwrap();
        match first.as_ref() {
            HubEvent::InitialState { snapshot } => assert!(snapshot.scanning),
            other => panic!("unexpected first event {other:?}"),
        }
        let second = observer.events.recv().await.unwrap();
        assert_eq!(second.kind(), "scan_start");
    }

    #[tokio::test]
    async fn test_events_keep_publication_order() {
        let (handle, _snapshots) = hub(HubConfig::default());
        let mut observer = handle.register().await.unwrap();

        handle.broadcast(HubEvent::scan_start("a"));
        handle.broadcast(HubEvent::scan_progress("b"));
        handle.broadcast(HubEvent::scan_error("c"));

        let kinds: Vec<&str> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(observer.events.recv().await.unwrap().kind());
            }
            out
        };
        assert_eq!(kinds, ["initial_state", "scan_start", "scan_progress", "scan_error"]);
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let (handle, _snapshots) = hub(HubConfig::default());
        let observer = handle.register().await.unwrap();
        assert_eq!(handle.observer_count().await, 1);

        handle.deregister(observer.id);
        handle.deregister(observer.id);
        handle.deregister(Uuid::new_v4());
        assert_eq!(handle.observer_count().await, 0);
    }

    async fn wait_for_count(handle: &HubHandle, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.observer_count().await != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("observer count did not settle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_observer_is_evicted() {
        let (handle, _snapshots) = hub(HubConfig {
            send_timeout: Duration::from_millis(50),
            queue_capacity: 1,
        });

        let mut a = handle.register().await.unwrap();
        let mut b = handle.register().await.unwrap();
        let mut c = handle.register().await.unwrap();

        // A and C drain their initial state; B never reads.
        a.events.recv().await.unwrap();
        c.events.recv().await.unwrap();

        handle.broadcast(HubEvent::scan_start("scan"));
        assert_eq!(a.events.recv().await.unwrap().kind(), "scan_start");
        assert_eq!(c.events.recv().await.unwrap().kind(), "scan_start");

        wait_for_count(&handle, 2).await;

        handle.broadcast(HubEvent::scan_progress("done"));
        assert_eq!(a.events.recv().await.unwrap().kind(), "scan_progress");
        assert_eq!(c.events.recv().await.unwrap().kind(), "scan_progress");

        // B keeps what was queued before eviction, then sees the end.
        assert_eq!(b.events.recv().await.unwrap().kind(), "initial_state");
        assert!(b.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stuck_delivery_does_not_hold_up_hub() {
        let (handle, _snapshots) = hub(HubConfig {
            send_timeout: Duration::from_secs(5),
            queue_capacity: 1,
        });

        // Queue already full with its initial state, never drained.
        let stuck = handle.register().await.unwrap();
        handle.broadcast(HubEvent::scan_start("scan"));
        handle.broadcast(HubEvent::scan_progress("still scanning"));

        let started = std::time::Instant::now();
        let mut fresh = tokio::time::timeout(Duration::from_secs(1), handle.register())
            .await
            .expect("registration waited on a stuck observer")
            .unwrap();
        assert_eq!(handle.observer_count().await, 2);
        handle.deregister(stuck.id);
        assert_eq!(handle.observer_count().await, 1);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(fresh.events.recv().await.unwrap().kind(), "initial_state");
        handle.broadcast(HubEvent::scan_error("late"));
        assert_eq!(fresh.events.recv().await.unwrap().kind(), "scan_error");
        drop(stuck);
    }

    #[tokio::test]
    async fn test_dropped_observer_removed_on_next_broadcast() {
        let (handle, _snapshots) = hub(HubConfig::default());
        let observer = handle.register().await.unwrap();
        drop(observer);

        handle.broadcast(HubEvent::scan_start("scan"));
        assert_eq!(handle.observer_count().await, 0);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = HubEvent::ScanUpdate {
            snapshot: Arc::new(Snapshot::empty(30)),
            count: 2,
            new_count: 1,
            offline_count: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "scan_update");
        assert_eq!(json["scan_interval"], 30);
        assert_eq!(json["count"], 2);
        assert!(json["devices"].is_array());

        let json = serde_json::to_value(HubEvent::scan_error("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "scan_error", "message": "boom"}));
    }
}
