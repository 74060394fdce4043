//! Scan loop - the periodic discovery cycle and its control surface.
//!
//! One task owns the cycle: discover, reconcile against the presence store,
//! commit, publish the snapshot, notify the hub. Cycles never overlap. The
//! in-flight flag is claimed by whoever starts a cycle (the timer or an
//! on-demand trigger) and released after the snapshot is published.

use chrono::Utc;
use ipnetwork::Ipv4Network;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

use crate::categorize::DEFAULT_GRACE_LIMIT;
use crate::discovery::{Discovery, DiscoveryProvider};
use crate::error::{DiscoveryError, HubClosed, StoreError, StoreResult};
use crate::hub::{BroadcastHub, HubConfig, HubEvent, HubHandle, Observer, ObserverId};
use crate::models::{DeviceRecord, DeviceView, HistoryStats, ScanRecord, Snapshot};
use crate::reconcile::{reconcile, Reconciliation};
use crate::store::PresenceStore;

/// Extra time granted on top of the discovery timeout before a run is abandoned.
const DISCOVERY_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub subnet: Ipv4Network,
    pub interval: Duration,
    pub grace_limit: u32,
    pub discovery_timeout: Duration,
    pub retries: u32,
}

impl EngineConfig {
    pub fn new(subnet: Ipv4Network) -> Self {
        Self {
            subnet,
            interval: Duration::from_secs(30),
            grace_limit: DEFAULT_GRACE_LIMIT,
            discovery_timeout: Duration::from_secs(3),
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
    /// The scan loop has stopped.
    Unavailable,
}

impl TriggerOutcome {
    pub fn started(&self) -> bool {
        matches!(self, TriggerOutcome::Started)
    }
}

#[derive(Debug)]
enum EngineCommand {
    ScanNow,
    Shutdown,
}

/// Cloneable control handle for the running scan loop.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    in_flight: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
    store: PresenceStore,
    hub: HubHandle,
}

impl ScanHandle {
    /// Ask for a cycle now. At most one request is accepted per cycle.
    pub fn trigger_scan_now(&self) -> TriggerOutcome {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return TriggerOutcome::AlreadyRunning;
        }
        if self.commands.send(EngineCommand::ScanNow).is_err() {
            self.in_flight.store(false, Ordering::Release);
            return TriggerOutcome::Unavailable;
        }
        tracing::info!("On-demand scan requested");
        TriggerOutcome::Started
    }

    /// Latest published snapshot. Never waits on a running cycle.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    /// Watch channel that changes on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.clone()
    }

    /// Whether a cycle is running or has been requested.
    pub fn is_scanning(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Cycles completed since start.
    pub fn completed_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// Set the free-text note of a device, by hardware address or current IP.
    ///
    /// Takes effect in the store immediately and in the snapshot at the next
    /// publish.
    pub async fn set_note(&self, id: &str, text: &str) -> StoreResult<DeviceRecord> {
        self.store.set_note(id, text).await
    }

    pub async fn get_history_stats(&self) -> StoreResult<HistoryStats> {
        self.store.history_stats(Utc::now()).await
    }

    pub async fn recent_scans(&self, limit: u32) -> StoreResult<Vec<ScanRecord>> {
        self.store.recent_scans(limit).await
    }

    pub async fn register_observer(&self) -> Result<Observer, HubClosed> {
        self.hub.register().await
    }

    pub fn deregister_observer(&self, id: ObserverId) {
        self.hub.deregister(id);
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Stop the loop after the cycle in progress, if any.
    pub fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
    }
}

/// Running scan loop plus the hub it feeds.
pub struct Engine {
    handle: ScanHandle,
    scan_task: JoinHandle<()>,
    hub_task: JoinHandle<()>,
}

impl Engine {
    /// Load history from `store`, then start the hub and the scan loop.
    ///
    /// The first cycle starts immediately.
    pub async fn start(
        config: EngineConfig,
        hub_config: HubConfig,
        provider: Arc<dyn DiscoveryProvider>,
        store: PresenceStore,
    ) -> StoreResult<Self> {
        let known = store.load_devices().await?;
        let last_scan = store.recent_scans(1).await?.into_iter().next();

        let initial = Snapshot {
            devices: known
                .iter()
                .map(|record| DeviceView::from_record(record, config.grace_limit))
                .collect(),
            timestamp: last_scan.map(|scan| scan.scanned_at),
            next_scan: Some(Utc::now()),
            scan_interval: config.interval.as_secs(),
            scanning: false,
        };
        tracing::info!(
            devices = known.len(),
            subnet = %config.subnet,
            interval_secs = config.interval.as_secs(),
            grace_limit = config.grace_limit,
            "Scan loop starting"
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));
        let (hub, hub_task) = BroadcastHub::spawn(hub_config, snapshot_rx.clone());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicU64::new(0));

        let scan_loop = ScanLoop {
            config,
            provider,
            store: store.clone(),
            hub: hub.clone(),
            snapshot: snapshot_tx,
            in_flight: Arc::clone(&in_flight),
            cycles: Arc::clone(&cycles),
            commands: command_rx,
            cached: known,
        };
        let scan_task = tokio::spawn(scan_loop.run());

        Ok(Self {
            handle: ScanHandle {
                commands,
                in_flight,
                cycles,
                snapshot: snapshot_rx,
                store,
                hub,
            },
            scan_task,
            hub_task,
        })
    }

    pub fn handle(&self) -> ScanHandle {
        self.handle.clone()
    }

    /// Stop the scan loop and wait for it to finish its current cycle.
    pub async fn shutdown(self) {
        let Engine {
            handle,
            scan_task,
            hub_task,
        } = self;
        handle.shutdown();
        if let Err(e) = scan_task.await {
            tracing::error!(error = %e, "Scan loop task failed");
        }
        drop(handle);
        // Outstanding handles (HTTP state, sockets) keep the hub alive.
        hub_task.abort();
        tracing::info!("Scan loop stopped");
    }
}

struct ScanLoop {
    config: EngineConfig,
    provider: Arc<dyn DiscoveryProvider>,
    store: PresenceStore,
    hub: HubHandle,
    snapshot: watch::Sender<Arc<Snapshot>>,
    in_flight: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    /// Records from the last cycle, used when the store cannot be read.
    cached: Vec<DeviceRecord>,
}

impl ScanLoop {
    async fn run(mut self) {
        let mut next_fire = Instant::now();

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(EngineCommand::ScanNow) => {}
                    Some(EngineCommand::Shutdown) | None => break,
                },
                _ = sleep_until(next_fire) => {
                    if self.in_flight.swap(true, Ordering::AcqRel) {
                        // A trigger holds the flag and its command is on the way.
                        next_fire = Instant::now() + self.config.interval;
                        continue;
                    }
                }
            }

            // Any completed cycle, timed or on demand, restarts the countdown.
            next_fire = self.run_cycle().await;
            self.in_flight.store(false, Ordering::Release);
        }
    }

    async fn run_cycle(&mut self) -> Instant {
        let started = Instant::now();
        self.publish_scanning();
        self.hub.broadcast(HubEvent::scan_start("Starting network scan..."));

        let discovery = self.discover().await;
        let found = discovery.hosts.len();

        let mut persist_error: Option<StoreError> = None;
        let known = match self.store.load_devices().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load device history, using last cycle");
                persist_error = Some(e);
                self.cached.clone()
            }
        };

        let at = Utc::now();
        let Reconciliation { records, events } =
            reconcile(known, &discovery.hosts, at, self.config.grace_limit);

        if persist_error.is_none() {
            let scan = ScanRecord {
                scanned_at: at,
                devices_found: u32::try_from(found).unwrap_or(u32::MAX),
                method: discovery.method.as_str().to_string(),
            };
            if let Err(e) = self.store.commit_cycle(&records, &scan).await {
                tracing::error!(error = %e, "Failed to persist scan cycle");
                persist_error = Some(e);
            }
        }

        let next_fire = Instant::now() + self.config.interval;
        let next_scan = chrono::Duration::from_std(self.config.interval)
            .ok()
            .and_then(|interval| at.checked_add_signed(interval));

        let snapshot = Arc::new(Snapshot {
            devices: records
                .iter()
                .map(|record| DeviceView::from_record(record, self.config.grace_limit))
                .collect(),
            timestamp: Some(at),
            next_scan,
            scan_interval: self.config.interval.as_secs(),
            scanning: false,
        });
        self.snapshot.send_replace(Arc::clone(&snapshot));
        self.cached = records;
        self.cycles.fetch_add(1, Ordering::AcqRel);

        for mac in &events.new {
            tracing::info!(mac = %mac, "New device discovered");
        }
        for mac in &events.became_offline {
            tracing::info!(mac = %mac, "Device went offline");
        }
        for mac in &events.became_online {
            tracing::info!(mac = %mac, "Device back online");
        }
        tracing::info!(
            found,
            method = discovery.method.as_str(),
            online = events.online_count,
            new = events.new_count,
            offline = events.offline_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan cycle complete"
        );

        if let Some(e) = persist_error {
            self.hub.broadcast(HubEvent::scan_error(format!(
                "Scan history could not be saved: {e}"
            )));
        }
        self.hub.broadcast(HubEvent::scan_progress(format!(
            "Scan complete: {} online, {} new, {} offline",
            events.online_count, events.new_count, events.offline_count
        )));
        self.hub.broadcast(HubEvent::ScanUpdate {
            snapshot,
            count: events.online_count,
            new_count: events.new_count,
            offline_count: events.offline_count,
        });

        next_fire
    }

    /// Run the provider, treating any failure as a cycle where nothing answered.
    async fn discover(&self) -> Discovery {
        let budget = self.config.discovery_timeout + DISCOVERY_SLACK;
        let run = self.provider.discover(
            self.config.subnet,
            self.config.discovery_timeout,
            self.config.retries,
        );

        let error = match timeout(budget, run).await {
            Ok(Ok(discovery)) => return discovery,
            Ok(Err(e)) => e,
            Err(_) => DiscoveryError::Timeout(budget),
        };

        tracing::warn!(provider = self.provider.name(), error = %error, "Discovery failed");
        self.hub
            .broadcast(HubEvent::scan_error(format!("Scan error: {error}")));
        Discovery::empty()
    }

    fn publish_scanning(&self) {
        self.snapshot.send_modify(|current| {
            let mut next = (**current).clone();
            next.scanning = true;
            *current = Arc::new(next);
        });
    }
}
