use serde::{Deserialize, Serialize};

/// Rapport complet d'un DEA (contrat dea.heartbeat@v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "dea")]
    pub dea_guid: String,
    #[serde(rename = "droplets", default)]
    pub instance_heartbeats: Vec<InstanceHeartbeat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub cc_partition: String,
    #[serde(rename = "droplet")]
    pub app_guid: String,
    #[serde(rename = "version")]
    pub app_version: String,
    #[serde(rename = "instance")]
    pub instance_guid: String,
    #[serde(rename = "index")]
    pub instance_index: u32,
    pub state: InstanceState,
    pub state_timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Crashed,
    Evacuating,
}

impl Heartbeat {
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
