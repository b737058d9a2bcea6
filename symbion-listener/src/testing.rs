/*!
Fakes pour les tests du listener

- MockBus: bus en mémoire, enregistre publications et abonnements et permet
  de simuler la réception
- FakeStore / FakeUsageTracker: store scriptable (latence, pannes)
- FakeMetrics: enregistre chaque valeur émise
- FakeTimeProvider: horloge murale pilotée à la main
*/

use crate::bus::{BusError, MessageBus, Subscription};
use crate::clock::TimeProvider;
use crate::metrics::MetricsAccountant;
use crate::models::{Heartbeat, InstanceHeartbeat, InstanceState};
use crate::store::{ActualStateReader, DeaRecord, FreshnessRecord, Store, StoreError, UsageTracker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;

pub fn heartbeat(dea: &str) -> Heartbeat {
    Heartbeat {
        dea_guid: dea.to_string(),
        instance_heartbeats: vec![InstanceHeartbeat {
            cc_partition: "default".into(),
            app_guid: format!("app-{dea}"),
            app_version: "v1".into(),
            instance_guid: format!("instance-{dea}"),
            instance_index: 0,
            state: InstanceState::Running,
            state_timestamp: 1_700_000_000.5,
        }],
    }
}

pub fn heartbeat_json(dea: &str) -> Vec<u8> {
    heartbeat(dea).to_json().unwrap()
}

pub struct FakeTimeProvider {
    now: Mutex<OffsetDateTime>,
}

impl FakeTimeProvider {
    pub fn new(now: OffsetDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl TimeProvider for FakeTimeProvider {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Sync(usize),
    Bump(OffsetDateTime),
    Revoke,
}

/// Store scriptable: chaque appel est enregistré avant latence/panne
#[derive(Default)]
pub struct FakeStore {
    calls: Mutex<Vec<StoreCall>>,
    synced: Mutex<Vec<Vec<Heartbeat>>>,
    write_delay: Mutex<Duration>,
    fail_sync: AtomicBool,
    fail_freshness: AtomicBool,
    freshness: Mutex<Option<FreshnessRecord>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    pub fn fail_freshness(&self, fail: bool) {
        self.fail_freshness.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub fn synced(&self) -> Vec<Vec<Heartbeat>> {
        self.synced.lock().clone()
    }

    fn freshness_result(&self) -> Result<(), StoreError> {
        if self.fail_freshness.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("freshness unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn sync_heartbeats(&self, heartbeats: &[Heartbeat]) -> Result<(), StoreError> {
        self.calls.lock().push(StoreCall::Sync(heartbeats.len()));
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("store down")));
        }
        self.synced.lock().push(heartbeats.to_vec());
        Ok(())
    }

    async fn bump_actual_freshness(&self, at: OffsetDateTime) -> Result<(), StoreError> {
        self.calls.lock().push(StoreCall::Bump(at));
        self.freshness_result()?;
        *self.freshness.lock() = Some(FreshnessRecord {
            fresh_at: at,
            expires_at: at + Duration::from_secs(30),
        });
        Ok(())
    }

    async fn revoke_actual_freshness(&self) -> Result<(), StoreError> {
        self.calls.lock().push(StoreCall::Revoke);
        self.freshness_result()?;
        *self.freshness.lock() = None;
        Ok(())
    }
}

#[async_trait]
impl ActualStateReader for FakeStore {
    async fn freshness(&self) -> Option<FreshnessRecord> {
        *self.freshness.lock()
    }

    async fn actual_state(&self, now: OffsetDateTime) -> HashMap<String, DeaRecord> {
        self.synced
            .lock()
            .iter()
            .flatten()
            .map(|hb| {
                (
                    hb.dea_guid.clone(),
                    DeaRecord {
                        instance_heartbeats: hb.instance_heartbeats.clone(),
                        updated_at: now,
                    },
                )
            })
            .collect()
    }
}

/// Rejoue une liste de mesures; Err(()) simule une mesure en échec
pub struct FakeUsageTracker {
    results: Mutex<VecDeque<Result<f64, ()>>>,
    started: AtomicBool,
}

impl FakeUsageTracker {
    pub fn new(results: Vec<Result<f64, ()>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageTracker for FakeUsageTracker {
    fn start_tracking_usage(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn measure_usage(&self) -> Result<f64, StoreError> {
        match self.results.lock().pop_front() {
            Some(Ok(fraction)) => Ok(fraction),
            _ => Err(StoreError::UsageNotTracked),
        }
    }
}

#[derive(Default)]
pub struct FakeMetrics {
    received: Mutex<Vec<u64>>,
    saved: Mutex<Vec<u64>>,
    usage: Mutex<Vec<f64>>,
}

impl FakeMetrics {
    pub fn received(&self) -> Vec<u64> {
        self.received.lock().clone()
    }

    pub fn saved(&self) -> Vec<u64> {
        self.saved.lock().clone()
    }

    pub fn usage(&self) -> Vec<f64> {
        self.usage.lock().clone()
    }
}

impl MetricsAccountant for FakeMetrics {
    fn track_received_heartbeats(&self, total: u64) {
        self.received.lock().push(total);
    }

    fn track_saved_heartbeats(&self, total: u64) {
        self.saved.lock().push(total);
    }

    fn track_actual_state_listener_store_usage_fraction(&self, fraction: f64) {
        self.usage.lock().push(fraction);
    }
}

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Bus en mémoire qui remplace MqttBus dans les tests
#[derive(Default)]
pub struct MockBus {
    published: Mutex<Vec<MockMessage>>,
    subscriptions: Mutex<Vec<(String, mpsc::UnboundedSender<Vec<u8>>)>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Livre un payload à tous les abonnés du topic
    pub fn simulate_incoming(&self, topic: &str, payload: Vec<u8>) {
        for (t, tx) in self.subscriptions.lock().iter() {
            if t == topic {
                let _ = tx.send(payload.clone());
            }
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().push((topic.to_string(), tx));
        Ok(Subscription::new(topic, rx))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.published.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}
