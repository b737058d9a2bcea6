//! Actual state listener
//!
//! Ingests DEA heartbeats and advertisements from the bus, batches heartbeats
//! in memory and commits them to the store once per sync interval. After each
//! commit it decides whether the actual state can be certified fresh:
//! - bump when the write succeeded within one sync interval
//! - revoke when the write failed (the batch is dropped, never retried)
//! - no change when nothing was pending or the write was too slow

use crate::bus::{BusError, MessageBus, Subscription};
use crate::clock::TimeProvider;
use crate::config::ListenerConfig;
use crate::metrics::MetricsAccountant;
use crate::models::Heartbeat;
use crate::state::{AggregationSnapshot, AggregationState};
use crate::store::{Store, UsageTracker};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const HEARTBEAT_SYNC_TIMER: &str = "HeartbeatSyncTimer";
pub const STORE_USAGE_TIMER: &str = "StoreUsageTimer";

/// Result of one flush cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Idle,
    Saved { count: usize, bumped: bool },
    Failed { count: usize },
}

/// State carried from one flush cycle to the next.
#[derive(Debug, Default)]
pub struct SyncCycle {
    previous_received: Option<u64>,
}

impl SyncCycle {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy)]
enum MessageKind {
    Heartbeat,
    Advertise,
}

pub struct ActualStateListener {
    config: ListenerConfig,
    store: Arc<dyn Store>,
    usage_tracker: Option<Arc<dyn UsageTracker>>,
    metrics: Arc<dyn MetricsAccountant>,
    time_provider: Arc<dyn TimeProvider>,
    state: AggregationState,
}

impl ActualStateListener {
    pub fn new(
        config: ListenerConfig,
        store: Arc<dyn Store>,
        usage_tracker: Option<Arc<dyn UsageTracker>>,
        metrics: Arc<dyn MetricsAccountant>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            store,
            usage_tracker,
            metrics,
            time_provider,
            state: AggregationState::new(),
        }
    }

    pub fn snapshot(&self) -> AggregationSnapshot {
        self.state.snapshot()
    }

    /// Decodes and buffers one heartbeat. Returns the pending count, or None
    /// when the payload was dropped.
    pub fn handle_heartbeat(&self, payload: &[u8]) -> Option<usize> {
        debug!("got a heartbeat");
        let heartbeat = match Heartbeat::from_json(payload) {
            Ok(hb) => hb,
            Err(e) => {
                error!(
                    error = %e,
                    message_body = %String::from_utf8_lossy(payload),
                    "could not unmarshal heartbeat"
                );
                return None;
            }
        };

        let pending = self.state.record_heartbeat(heartbeat, self.time_provider.now());
        info!(heartbeats_pending_save = pending, "received a heartbeat");
        Some(pending)
    }

    /// Bumps freshness when no heartbeat arrived for at least the freshness
    /// TTL. Returns whether a bump was attempted.
    pub async fn handle_advertise(&self) -> bool {
        let last = self.state.last_liveness();
        let gap = self.time_provider.now() - last;
        let stale = gap >= self.config.actual_freshness_ttl();
        if stale {
            self.bump_freshness().await;
        }
        debug!(stale, "received dea.advertise");
        stale
    }

    /// One flush cycle: drain, commit, decide freshness, report metrics.
    pub async fn sync_heartbeats(&self, cycle: &mut SyncCycle) -> SyncOutcome {
        let drained = self.state.drain();
        let batch = drained.heartbeats;

        let outcome = if batch.is_empty() {
            SyncOutcome::Idle
        } else {
            self.commit(&batch).await
        };

        if cycle.previous_received != Some(drained.total_received) {
            debug!(total_received_heartbeats = drained.total_received, "tracking heartbeat metrics");
            self.metrics.track_received_heartbeats(drained.total_received);
            cycle.previous_received = Some(drained.total_received);
        }

        outcome
    }

    async fn commit(&self, batch: &[Heartbeat]) -> SyncOutcome {
        let count = batch.len();
        let interval = self.config.listener_heartbeat_sync_interval();
        info!(heartbeats_to_save = count, "saving heartbeats");

        let started = Instant::now();
        if let Err(e) = self.store.sync_heartbeats(batch).await {
            error!(error = %e, "could not put instance heartbeats in store");
            self.revoke_freshness().await;
            return SyncOutcome::Failed { count };
        }
        let elapsed = started.elapsed();

        let bumped = elapsed < interval;
        if bumped {
            self.bump_freshness().await;
        } else {
            warn!(?elapsed, ?interval, "save took too long, not bumping freshness");
        }
        info!(heartbeats_saved = count, duration = ?elapsed, "saved heartbeats");

        let total_saved = self.state.record_saved(count);
        self.metrics.track_saved_heartbeats(total_saved);

        SyncOutcome::Saved { count, bumped }
    }

    /// Samples the store usage once; failures are skipped.
    pub async fn measure_store_usage(&self, tracker: &dyn UsageTracker) {
        match tracker.measure_usage().await {
            Ok(fraction) => {
                self.metrics.track_actual_state_listener_store_usage_fraction(fraction);
            }
            Err(e) => debug!(error = %e, "store usage measurement failed"),
        }
    }

    async fn bump_freshness(&self) {
        match self.store.bump_actual_freshness(self.time_provider.now()).await {
            Ok(()) => info!("bumped freshness"),
            Err(e) => error!(error = %e, "could not update actual freshness"),
        }
    }

    async fn revoke_freshness(&self) {
        match self.store.revoke_actual_freshness().await {
            Ok(()) => info!("revoked freshness"),
            Err(e) => error!(error = %e, "could not revoke actual freshness"),
        }
    }

    /// Subscribes to both DEA topics and starts the sync loop, plus the
    /// usage loop when a tracker is configured.
    pub async fn start(self: &Arc<Self>, bus: &dyn MessageBus) -> Result<ListenerHandle, BusError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let advertise = bus.subscribe(&self.config.topics.advertise).await?;
        let heartbeat = bus.subscribe(&self.config.topics.heartbeat).await?;

        let mut tasks = vec![
            self.spawn_pump(advertise, MessageKind::Advertise, shutdown_rx.clone()),
            self.spawn_pump(heartbeat, MessageKind::Heartbeat, shutdown_rx.clone()),
            tokio::spawn(self.clone().run_sync_loop(shutdown_rx.clone())),
        ];

        let tracking_usage = match &self.usage_tracker {
            Some(tracker) => {
                tasks.push(tokio::spawn(self.clone().run_usage_loop(tracker.clone(), shutdown_rx)));
                true
            }
            None => false,
        };

        info!(
            sync_interval = ?self.config.listener_heartbeat_sync_interval(),
            tracking_usage,
            "actual state listener started"
        );
        Ok(ListenerHandle { shutdown: shutdown_tx, tasks, tracking_usage })
    }

    /// Each message gets its own task; delivery order is never assumed.
    fn spawn_pump(
        self: &Arc<Self>,
        mut subscription: Subscription,
        kind: MessageKind,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let listener = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = subscription.recv() => {
                        let Some(payload) = msg else {
                            warn!(topic = subscription.topic(), "subscription closed");
                            break;
                        };
                        let listener = listener.clone();
                        tokio::spawn(async move {
                            match kind {
                                MessageKind::Heartbeat => {
                                    listener.handle_heartbeat(&payload);
                                }
                                MessageKind::Advertise => {
                                    listener.handle_advertise().await;
                                }
                            }
                        });
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn run_sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = self
            .time_provider
            .new_ticker(HEARTBEAT_SYNC_TIMER, self.config.listener_heartbeat_sync_interval());
        let mut cycle = SyncCycle::new();

        loop {
            self.sync_heartbeats(&mut cycle).await;
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(ticker = ticker.name(), "sync loop stopped");
    }

    async fn run_usage_loop(self: Arc<Self>, tracker: Arc<dyn UsageTracker>, mut shutdown: watch::Receiver<bool>) {
        tracker.start_tracking_usage();
        let mut ticker = self
            .time_provider
            .new_ticker(STORE_USAGE_TIMER, self.config.store_usage_sample_interval());

        loop {
            self.measure_store_usage(tracker.as_ref()).await;
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(ticker = ticker.name(), "usage loop stopped");
    }
}

/// Handle on the listener's background tasks. Dropping it stops them too.
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    tracking_usage: bool,
}

impl ListenerHandle {
    pub fn is_tracking_usage(&self) -> bool {
        self.tracking_usage
    }

    /// Stops the loops at their next suspension point; in-flight work is abandoned.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("actual state listener stopped");
    }
}
