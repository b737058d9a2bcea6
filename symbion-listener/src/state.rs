use crate::models::Heartbeat;
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Heartbeats pas encore persistés + compteurs, tous derrière un seul verrou.
/// Le verrou n'est jamais tenu pendant un appel au store.
pub struct AggregationState {
    inner: Mutex<Inner>,
}

struct Inner {
    buffer: Vec<Heartbeat>,
    total_received: u64,
    total_saved: u64,
    last_liveness: OffsetDateTime,
}

/// Contenu du buffer retiré à une frontière de flush
#[derive(Debug)]
pub struct Drained {
    pub heartbeats: Vec<Heartbeat>,
    pub total_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationSnapshot {
    pub pending: usize,
    pub total_received: u64,
    pub total_saved: u64,
    pub last_liveness: OffsetDateTime,
}

impl AggregationState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: Vec::new(),
                total_received: 0,
                total_saved: 0,
                last_liveness: OffsetDateTime::UNIX_EPOCH,
            }),
        }
    }

    /// Ajoute un heartbeat décodé; retourne la taille du buffer en attente
    pub fn record_heartbeat(&self, heartbeat: Heartbeat, now: OffsetDateTime) -> usize {
        let mut inner = self.inner.lock();
        inner.last_liveness = now;
        inner.total_received += 1;
        inner.buffer.push(heartbeat);
        inner.buffer.len()
    }

    /// Échange le buffer contre un buffer vide, en O(1)
    pub fn drain(&self) -> Drained {
        let mut inner = self.inner.lock();
        Drained {
            heartbeats: std::mem::take(&mut inner.buffer),
            total_received: inner.total_received,
        }
    }

    /// Retourne le nouveau total sauvegardé
    pub fn record_saved(&self, count: usize) -> u64 {
        let mut inner = self.inner.lock();
        inner.total_saved += count as u64;
        inner.total_saved
    }

    pub fn last_liveness(&self) -> OffsetDateTime {
        self.inner.lock().last_liveness
    }

    pub fn snapshot(&self) -> AggregationSnapshot {
        let inner = self.inner.lock();
        AggregationSnapshot {
            pending: inner.buffer.len(),
            total_received: inner.total_received,
            total_saved: inner.total_saved,
            last_liveness: inner.last_liveness,
        }
    }
}

impl Default for AggregationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::heartbeat;
    use time::macros::datetime;

    #[test]
    fn test_record_then_drain() {
        let state = AggregationState::new();
        let now = datetime!(2024-01-01 12:00 UTC);

        assert_eq!(state.record_heartbeat(heartbeat("dea-1"), now), 1);
        assert_eq!(state.record_heartbeat(heartbeat("dea-2"), now), 2);

        let drained = state.drain();
        assert_eq!(drained.heartbeats.len(), 2);
        assert_eq!(drained.total_received, 2);

        let snap = state.snapshot();
        assert_eq!(snap.pending, 0);
        assert_eq!(snap.total_received, 2);
        assert_eq!(snap.last_liveness, now);
    }

    #[test]
    fn test_drain_of_empty_buffer() {
        let state = AggregationState::new();
        let drained = state.drain();
        assert!(drained.heartbeats.is_empty());
        assert_eq!(drained.total_received, 0);
        assert_eq!(state.last_liveness(), OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_record_saved_accumulates() {
        let state = AggregationState::new();
        assert_eq!(state.record_saved(3), 3);
        assert_eq!(state.record_saved(2), 5);
        assert_eq!(state.snapshot().total_saved, 5);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let state = Arc::new(AggregationState::new());
        let now = datetime!(2024-01-01 12:00 UTC);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        state.record_heartbeat(heartbeat(&format!("dea-{t}-{i}")), now);
                    }
                })
            })
            .collect();

        let mut collected = Vec::new();
        for _ in 0..20 {
            collected.extend(state.drain().heartbeats);
        }
        for h in handles {
            h.join().unwrap();
        }
        collected.extend(state.drain().heartbeats);

        assert_eq!(collected.len(), 2000);
        assert_eq!(state.snapshot().total_received, 2000);

        let mut ids: Vec<_> = collected.into_iter().map(|h| h.dea_guid).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 2000);
    }
}
