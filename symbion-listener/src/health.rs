use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use crate::bus::MessageBus;
use crate::clock::TimeProvider;
use crate::listener::ActualStateListener;
use crate::state::{new_state, Shared};
use crate::store::ActualStateReader;
use time::OffsetDateTime;
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

pub const HEALTH_TOPIC: &str = "symbion/listener/health@v1";

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ListenerHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub total_received_heartbeats: u64,
    pub total_saved_heartbeats: u64,
    pub heartbeats_pending_save: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
    pub actual_state_fresh: bool,
    pub deas_tracked: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: new_state("connecting".to_string()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub async fn get_health(
        &self,
        listener: &ActualStateListener,
        store: &dyn ActualStateReader,
        now: OffsetDateTime,
    ) -> ListenerHealth {
        let actual_state_fresh = store.is_actual_state_fresh(now).await;
        let deas_tracked = store.actual_state(now).await.len();
        let snap = listener.snapshot();
        let last_heartbeat = (snap.last_liveness != OffsetDateTime::UNIX_EPOCH).then_some(snap.last_liveness);
        let mqtt_status = self.mqtt_status.lock().clone();

        ListenerHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status,
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            total_received_heartbeats: snap.total_received,
            total_saved_heartbeats: snap.total_saved,
            heartbeats_pending_save: snap.pending,
            last_heartbeat,
            actual_state_fresh,
            deas_tracked,
        }
    }

    /// Publie le health du listener sur le bus à intervalle fixe
    pub fn spawn_health_publisher(
        &self,
        listener: Arc<ActualStateListener>,
        store: Arc<dyn ActualStateReader>,
        bus: Arc<dyn MessageBus>,
        time_provider: Arc<dyn TimeProvider>,
        every: Duration,
    ) -> JoinHandle<()> {
        let health_tracker = self.clone();

        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let health = health_tracker
                    .get_health(&listener, store.as_ref(), time_provider.now())
                    .await;
                let payload = match serde_json::to_vec(&health) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to encode listener health");
                        continue;
                    }
                };
                match bus.publish(HEALTH_TOPIC, payload).await {
                    Ok(()) => debug!(
                        uptime = health.uptime_seconds,
                        pending = health.heartbeats_pending_save,
                        "published listener health"
                    ),
                    Err(e) => warn!(error = %e, "failed to publish listener health"),
                }
            }
        })
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
