/**
 * STORE - État réel partagé avec le moteur de réconciliation
 *
 * ROLE: contrat minimal dont le listener a besoin (sync en masse des heartbeats,
 * bump/revoke de la fraîcheur, mesure d'usage) + lecture côté consommateurs.
 *
 * FONCTIONNEMENT (JsonFileStore):
 * - document JSON unique: { deas: {dea_guid: {instance_heartbeats, updated_at}}, freshness }
 * - chaque heartbeat remplace l'ensemble des instances de son DEA
 * - un DEA non rafraîchi depuis heartbeat_ttl disparaît de l'état réel
 * - la fraîcheur expire d'elle-même après actual_freshness_ttl
 * - écriture atomique: fichier temporaire puis rename
 */

use crate::clock::TimeProvider;
use crate::models::{Heartbeat, InstanceHeartbeat};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("usage tracking not started")]
    UsageNotTracked,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn sync_heartbeats(&self, heartbeats: &[Heartbeat]) -> Result<(), StoreError>;

    async fn bump_actual_freshness(&self, at: OffsetDateTime) -> Result<(), StoreError>;

    async fn revoke_actual_freshness(&self) -> Result<(), StoreError>;
}

/// Mesure la charge du store: fraction du temps passé en écriture
#[async_trait]
pub trait UsageTracker: Send + Sync {
    fn start_tracking_usage(&self);

    async fn measure_usage(&self) -> Result<f64, StoreError>;
}

/// Vue lecture pour les consommateurs de l'état réel (réconciliation, API)
#[async_trait]
pub trait ActualStateReader: Send + Sync {
    async fn freshness(&self) -> Option<FreshnessRecord>;

    async fn is_actual_state_fresh(&self, now: OffsetDateTime) -> bool {
        self.freshness().await.map(|f| now < f.expires_at).unwrap_or(false)
    }

    async fn actual_state(&self, now: OffsetDateTime) -> HashMap<String, DeaRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub fresh_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeaRecord {
    pub instance_heartbeats: Vec<InstanceHeartbeat>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ActualStateDocument {
    deas: HashMap<String, DeaRecord>,
    freshness: Option<FreshnessRecord>,
}

#[derive(Debug, Default)]
struct UsageWindow {
    started: Option<Instant>,
    busy: Duration,
}

pub struct JsonFileStore {
    path: PathBuf,
    heartbeat_ttl: Duration,
    freshness_ttl: Duration,
    time_provider: Arc<dyn TimeProvider>,
    doc: RwLock<ActualStateDocument>,
    usage: Mutex<UsageWindow>,
}

impl JsonFileStore {
    /// Ouvre (ou crée) le document à `path`
    pub async fn open<P: Into<PathBuf>>(
        path: P,
        heartbeat_ttl: Duration,
        freshness_ttl: Duration,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let doc = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                ActualStateDocument::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            ActualStateDocument::default()
        };

        info!(path = %path.display(), deas = doc.deas.len(), "actual state store opened");
        Ok(Self {
            path,
            heartbeat_ttl,
            freshness_ttl,
            time_provider,
            doc: RwLock::new(doc),
            usage: Mutex::new(UsageWindow::default()),
        })
    }

    /// Écrit le document; le temps passé compte dans la fenêtre d'usage
    async fn persist(&self, doc: &ActualStateDocument) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = self.write_document(doc).await;
        let mut usage = self.usage.lock();
        if usage.started.is_some() {
            usage.busy += started.elapsed();
        }
        result
    }

    async fn write_document(&self, doc: &ActualStateDocument) -> Result<(), StoreError> {
        let content = serde_json::to_vec(doc)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// La mémoire ne prend `next` qu'une fois le disque à jour
    async fn commit(&self, doc: &mut ActualStateDocument, next: ActualStateDocument) -> Result<(), StoreError> {
        self.persist(&next).await?;
        *doc = next;
        Ok(())
    }

    fn is_alive(&self, record: &DeaRecord, now: OffsetDateTime) -> bool {
        now - record.updated_at < self.heartbeat_ttl
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn sync_heartbeats(&self, heartbeats: &[Heartbeat]) -> Result<(), StoreError> {
        let now = self.time_provider.now();
        let mut doc = self.doc.write().await;
        let mut next = doc.clone();

        for hb in heartbeats {
            next.deas.insert(
                hb.dea_guid.clone(),
                DeaRecord {
                    instance_heartbeats: hb.instance_heartbeats.clone(),
                    updated_at: now,
                },
            );
        }

        let before = next.deas.len();
        next.deas.retain(|_, record| self.is_alive(record, now));
        let expired = before - next.deas.len();
        if expired > 0 {
            debug!(expired, "expired DEA records");
        }

        self.commit(&mut doc, next).await
    }

    async fn bump_actual_freshness(&self, at: OffsetDateTime) -> Result<(), StoreError> {
        let mut doc = self.doc.write().await;
        let next = ActualStateDocument {
            freshness: Some(FreshnessRecord {
                fresh_at: at,
                expires_at: at + self.freshness_ttl,
            }),
            ..doc.clone()
        };
        self.commit(&mut doc, next).await
    }

    async fn revoke_actual_freshness(&self) -> Result<(), StoreError> {
        let mut doc = self.doc.write().await;
        let next = ActualStateDocument {
            freshness: None,
            ..doc.clone()
        };
        self.commit(&mut doc, next).await
    }
}

#[async_trait]
impl UsageTracker for JsonFileStore {
    fn start_tracking_usage(&self) {
        *self.usage.lock() = UsageWindow {
            started: Some(Instant::now()),
            busy: Duration::ZERO,
        };
    }

    async fn measure_usage(&self) -> Result<f64, StoreError> {
        let mut usage = self.usage.lock();
        let started = usage.started.ok_or(StoreError::UsageNotTracked)?;
        let window = started.elapsed();
        let fraction = if window.is_zero() {
            0.0
        } else {
            (usage.busy.as_secs_f64() / window.as_secs_f64()).clamp(0.0, 1.0)
        };
        usage.started = Some(Instant::now());
        usage.busy = Duration::ZERO;
        Ok(fraction)
    }
}

#[async_trait]
impl ActualStateReader for JsonFileStore {
    async fn freshness(&self) -> Option<FreshnessRecord> {
        self.doc.read().await.freshness
    }

    async fn actual_state(&self, now: OffsetDateTime) -> HashMap<String, DeaRecord> {
        self.doc
            .read()
            .await
            .deas
            .iter()
            .filter(|(_, record)| self.is_alive(record, now))
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }
}
