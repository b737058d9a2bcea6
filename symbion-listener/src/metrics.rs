use prometheus::{Encoder, Gauge, IntGauge, Registry, TextEncoder};

/// Puits de métriques du listener; émission best-effort, pas de retour
pub trait MetricsAccountant: Send + Sync {
    fn track_received_heartbeats(&self, total: u64);

    fn track_saved_heartbeats(&self, total: u64);

    fn track_actual_state_listener_store_usage_fraction(&self, fraction: f64);
}

pub struct PrometheusAccountant {
    registry: Registry,
    received_heartbeats: IntGauge,
    saved_heartbeats: IntGauge,
    store_usage_fraction: Gauge,
}

impl PrometheusAccountant {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("symbion_listener".into()), None)?;

        let received_heartbeats = IntGauge::new(
            "received_heartbeats",
            "Total heartbeats decoded since start",
        )?;
        let saved_heartbeats = IntGauge::new(
            "saved_heartbeats",
            "Total heartbeats committed to the store",
        )?;
        let store_usage_fraction = Gauge::new(
            "actual_state_listener_store_usage_fraction",
            "Fraction of time the store spent writing over the last sample window",
        )?;

        registry.register(Box::new(received_heartbeats.clone()))?;
        registry.register(Box::new(saved_heartbeats.clone()))?;
        registry.register(Box::new(store_usage_fraction.clone()))?;

        Ok(Self {
            registry,
            received_heartbeats,
            saved_heartbeats,
            store_usage_fraction,
        })
    }

    /// Format texte Prometheus pour GET /metrics
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl MetricsAccountant for PrometheusAccountant {
    fn track_received_heartbeats(&self, total: u64) {
        self.received_heartbeats.set(total as i64);
    }

    fn track_saved_heartbeats(&self, total: u64) {
        self.saved_heartbeats.set(total as i64);
    }

    fn track_actual_state_listener_store_usage_fraction(&self, fraction: f64) {
        self.store_usage_fraction.set(fraction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_in_text_output() {
        let metrics = PrometheusAccountant::new().unwrap();
        metrics.track_received_heartbeats(42);
        metrics.track_saved_heartbeats(40);
        metrics.track_actual_state_listener_store_usage_fraction(0.25);

        let text = metrics.encode().unwrap();
        assert!(text.contains("symbion_listener_received_heartbeats 42"));
        assert!(text.contains("symbion_listener_saved_heartbeats 40"));
        assert!(text.contains("symbion_listener_actual_state_listener_store_usage_fraction 0.25"));
    }

    #[test]
    fn test_independent_registries() {
        let a = PrometheusAccountant::new().unwrap();
        let b = PrometheusAccountant::new().unwrap();
        a.track_received_heartbeats(1);
        assert!(b.encode().unwrap().contains("symbion_listener_received_heartbeats 0"));
    }
}
