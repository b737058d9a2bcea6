use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "SYMBION_LISTENER_CONFIG";

/// Borne haute de toute durée de configuration
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ListenerConfig {
    pub heartbeat_period_secs: u64,
    /// Durée de vie d'un DEA dans le store, en périodes de heartbeat
    pub heartbeat_ttl_in_heartbeats: u64,
    pub actual_freshness_ttl_in_heartbeats: u64,
    pub listener_heartbeat_sync_interval_ms: u64,
    pub store_usage_sample_in_heartbeats: u64,
    pub track_store_usage: bool,
    pub store: StoreConf,
    pub mqtt: MqttConf,
    pub topics: TopicsConf,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TopicsConf {
    pub heartbeat: String,
    pub advertise: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { path: "./data/actual_state.json".into() }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: None,
            keep_alive_secs: 15,
        }
    }
}

impl Default for TopicsConf {
    fn default() -> Self {
        Self {
            heartbeat: "symbion/dea/heartbeat@v1".into(),
            advertise: "symbion/dea/advertise@v1".into(),
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_secs: 10,
            heartbeat_ttl_in_heartbeats: 3,
            actual_freshness_ttl_in_heartbeats: 3,
            listener_heartbeat_sync_interval_ms: 1000,
            store_usage_sample_in_heartbeats: 3,
            track_store_usage: true,
            store: StoreConf::default(),
            mqtt: MqttConf::default(),
            topics: TopicsConf::default(),
            http: HttpConf::default(),
        }
    }
}

impl ListenerConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.in_heartbeats(self.heartbeat_ttl_in_heartbeats).map_or(MAX_DURATION, |d| d.min(MAX_DURATION))
    }

    /// Seuil de fraîcheur: TTL côté store et seuil d'âge pour dea.advertise
    pub fn actual_freshness_ttl(&self) -> Duration {
        self.in_heartbeats(self.actual_freshness_ttl_in_heartbeats).map_or(MAX_DURATION, |d| d.min(MAX_DURATION))
    }

    pub fn listener_heartbeat_sync_interval(&self) -> Duration {
        Duration::from_millis(self.listener_heartbeat_sync_interval_ms)
    }

    pub fn store_usage_sample_interval(&self) -> Duration {
        self.in_heartbeats(self.store_usage_sample_in_heartbeats).map_or(MAX_DURATION, |d| d.min(MAX_DURATION))
    }

    /// `count` périodes de heartbeat; None en cas de débordement
    fn in_heartbeats(&self, count: u64) -> Option<Duration> {
        let count = u32::try_from(count).ok()?;
        self.heartbeat_period().checked_mul(count)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("heartbeat_period_secs", Some(self.heartbeat_period()))?;
        check_duration("listener_heartbeat_sync_interval_ms", Some(self.listener_heartbeat_sync_interval()))?;
        check_duration("heartbeat_ttl_in_heartbeats", self.in_heartbeats(self.heartbeat_ttl_in_heartbeats))?;
        check_duration("actual_freshness_ttl_in_heartbeats", self.in_heartbeats(self.actual_freshness_ttl_in_heartbeats))?;
        check_duration("store_usage_sample_in_heartbeats", self.in_heartbeats(self.store_usage_sample_in_heartbeats))?;
        if self.topics.heartbeat == self.topics.advertise {
            return Err(ConfigError::Invalid {
                field: "topics",
                reason: "heartbeat and advertise topics must differ",
            });
        }
        Ok(())
    }

    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn check_duration(field: &'static str, value: Option<Duration>) -> Result<(), ConfigError> {
    match value {
        None => Err(ConfigError::Invalid { field, reason: "duration overflows" }),
        Some(d) if d.is_zero() => Err(ConfigError::Invalid { field, reason: "must be greater than zero" }),
        Some(d) if d > MAX_DURATION => Err(ConfigError::Invalid { field, reason: "must not exceed one year" }),
        Some(_) => Ok(()),
    }
}

pub async fn load_config() -> Result<ListenerConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "listener.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from<P: AsRef<Path>>(path: P) -> Result<ListenerConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no listener config, using defaults");
        return Ok(ListenerConfig::default());
    }
    let txt = fs::read_to_string(path).await?;
    let cfg = ListenerConfig::from_yaml(&txt)?;
    info!(path = %path.display(), "loaded listener config");
    Ok(cfg)
}
