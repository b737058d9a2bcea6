/**
 * SYMBION LISTENER - Point d'entrée du listener d'état réel
 *
 * ROLE: charge la config, ouvre le store, connecte le bus MQTT, démarre le
 * listener (ingestion heartbeats + flush + fraîcheur) et l'API HTTP.
 *
 * ARCHITECTURE: DEA -> MQTT -> ActualStateListener -> JsonFileStore -> réconciliation.
 */

mod bus;
mod clock;
mod config;
mod health;
mod http;
mod listener;
mod metrics;
mod models;
mod state;
mod store;
#[cfg(test)]
mod testing;

use crate::bus::{MessageBus, MqttBus};
use crate::clock::{SystemTimeProvider, TimeProvider};
use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::listener::ActualStateListener;
use crate::metrics::PrometheusAccountant;
use crate::store::{JsonFileStore, UsageTracker};

use anyhow::Context;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await.context("failed to load listener config")?;
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);

    let store = Arc::new(
        JsonFileStore::open(
            &cfg.store.path,
            cfg.heartbeat_ttl(),
            cfg.actual_freshness_ttl(),
            time_provider.clone(),
        )
        .await
        .context("failed to open actual state store")?,
    );

    let metrics = Arc::new(PrometheusAccountant::new().context("failed to register metrics")?);
    let health_tracker = HealthTracker::new();
    let bus: Arc<dyn MessageBus> = Arc::new(MqttBus::connect(&cfg.mqtt, health_tracker.clone()));

    let usage_tracker: Option<Arc<dyn UsageTracker>> = if cfg.track_store_usage {
        Some(store.clone())
    } else {
        None
    };

    let listener = Arc::new(ActualStateListener::new(
        cfg.clone(),
        store.clone(),
        usage_tracker,
        metrics.clone(),
        time_provider.clone(),
    ));
    let handle = listener
        .start(bus.as_ref())
        .await
        .context("failed to subscribe to DEA topics")?;

    health_tracker.spawn_health_publisher(
        listener.clone(),
        store.clone(),
        bus.clone(),
        time_provider.clone(),
        Duration::from_secs(30),
    );

    let app = http::build_router(AppState {
        listener,
        store,
        health_tracker,
        metrics,
        time_provider,
    });

    let addr = cfg.http.bind.clone();
    let tcp = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    tokio::select! {
        res = axum::serve(tcp, app).into_future() => res.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    handle.stop().await;
    Ok(())
}
