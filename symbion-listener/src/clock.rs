use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Source de temps injectée: heure murale + tickers nommés
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    fn new_ticker(&self, name: &'static str, period: Duration) -> Ticker {
        Ticker::new(name, period)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Ticker périodique; le premier tick tombe une période après la création.
pub struct Ticker {
    name: &'static str,
    interval: Interval,
}

impl Ticker {
    pub fn new(name: &'static str, period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        // un flush lent décale les suivants au lieu de les enchaîner
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { name, interval }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}
