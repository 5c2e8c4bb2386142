//! The thread-safe store where every collector deposits its
//! [`DeviceObservation`]s and where the publisher and the solver read them
//! back.

use crate::observation::{DeviceId, DeviceObservation, SignalKind};

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

type Key = (SignalKind, DeviceId);

/// Latest observation per `(kind, identity)`.
///
/// Every mutation happens under a single lock and readers get a copy, so a
/// snapshot never contains a half applied update.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    inner: Mutex<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    epoch: u64,
    by_key: HashMap<Key, DeviceObservation>,
}

/// Handed out at the start of a scan cycle. A batch carrying a ticket from
/// before the latest [`SignalRegistry::clear`] is thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTicket {
    epoch: u64,
}

impl Entries {
    fn apply(&mut self, obs: DeviceObservation) {
        let key = (obs.kind, obs.id.clone());
        match self.by_key.get(&key) {
            Some(current) if current.seen_at > obs.seen_at => {}
            _ => {
                self.by_key.insert(key, obs);
            }
        }
    }
}

impl SignalRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // The entries are plain values, a panic elsewhere cannot leave them
    // in a state worth refusing to read.
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or refresh one entry. An observation older than the one
    /// already stored for the same device is ignored.
    pub fn upsert(&self, obs: DeviceObservation) {
        self.lock().apply(obs);
    }

    /// Mark the start of a scan cycle.
    pub fn begin_cycle(&self) -> CycleTicket {
        CycleTicket {
            epoch: self.lock().epoch,
        }
    }

    /// Apply a whole scan cycle at once. Returns how many observations were
    /// applied, which is zero when the registry was cleared mid-cycle.
    pub fn upsert_batch(&self, ticket: CycleTicket, batch: Vec<DeviceObservation>) -> usize {
        let mut entries = self.lock();
        if ticket.epoch != entries.epoch {
            return 0;
        }
        let n = batch.len();
        for obs in batch {
            entries.apply(obs);
        }
        n
    }

    /// A point in time copy, ordered by kind then identity.
    pub fn snapshot(&self) -> Vec<DeviceObservation> {
        let mut snap: Vec<_> = self.lock().by_key.values().cloned().collect();
        snap.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));
        snap
    }

    /// Drop every entry. Cycles already in flight will not repopulate it.
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.by_key.clear();
        entries.epoch += 1;
    }

    /// Remove entries last seen more than `ttl` before `now`. Returns the
    /// number removed.
    pub fn expire(&self, now: Instant, ttl: Duration) -> usize {
        let mut entries = self.lock();
        let before = entries.by_key.len();
        entries
            .by_key
            .retain(|_, obs| now.saturating_duration_since(obs.seen_at) <= ttl);
        before - entries.by_key.len()
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.lock().by_key.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn obs(kind: SignalKind, id: &str, rssi: i32, at: Instant) -> DeviceObservation {
        DeviceObservation::new(kind, id, rssi).seen_at(at)
    }

    #[test]
    fn latest_observation_wins_regardless_of_order() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);
        let t2 = t0 + Duration::from_millis(20);

        let registry = SignalRegistry::new();
        registry.upsert(obs(SignalKind::Wifi, "aa", -70, t1));
        registry.upsert(obs(SignalKind::Wifi, "AA", -40, t2));
        registry.upsert(obs(SignalKind::Wifi, "aa", -90, t0));
        registry.upsert(obs(SignalKind::Bluetooth, "aa", -55, t0));

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].kind, SignalKind::Wifi);
        assert_eq!(snap[0].rssi, -40);
        assert_eq!(snap[1].kind, SignalKind::Bluetooth);
        assert_eq!(snap[1].rssi, -55);
    }

    #[test]
    fn refresh_keeps_identity_and_updates_name() {
        let registry = SignalRegistry::new();
        let t0 = Instant::now();
        registry.upsert(obs(SignalKind::Flipper, "tag", -80, t0));
        let later = t0 + Duration::from_secs(1);
        registry.upsert(obs(SignalKind::Flipper, "TAG", -60, later).with_name("Tile"));

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id.as_str(), "TAG");
        assert_eq!(snap[0].name.as_deref(), Some("Tile"));
    }

    #[test]
    fn clear_beats_a_cycle_already_in_flight() {
        let registry = SignalRegistry::new();
        registry.upsert(DeviceObservation::new(SignalKind::Wifi, "old", -50));

        let ticket = registry.begin_cycle();
        registry.clear();
        let applied = registry.upsert_batch(
            ticket,
            vec![DeviceObservation::new(SignalKind::Wifi, "late", -50)],
        );

        assert_eq!(applied, 0);
        assert!(registry.snapshot().is_empty());

        // The next cycle lands normally.
        let ticket = registry.begin_cycle();
        registry.upsert_batch(
            ticket,
            vec![DeviceObservation::new(SignalKind::Wifi, "new", -50)],
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clear_is_idempotent() {
        let registry = SignalRegistry::new();
        registry.clear();
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn expire_drops_stale_entries_only() {
        let now = Instant::now() + Duration::from_secs(100);
        let registry = SignalRegistry::new();
        registry.upsert(obs(SignalKind::Wifi, "stale", -50, now - Duration::from_secs(31)));
        registry.upsert(obs(SignalKind::Wifi, "fresh", -50, now - Duration::from_secs(5)));

        assert_eq!(registry.expire(now, Duration::from_secs(30)), 1);
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id.as_str(), "FRESH");
    }

    #[test]
    fn concurrent_writers_never_tear_a_snapshot() {
        let registry = Arc::new(SignalRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..200 {
                        let ticket = registry.begin_cycle();
                        let batch = (0..5)
                            .map(|d| {
                                let id = format!("{w}-{d}");
                                DeviceObservation::new(SignalKind::Bluetooth, &id, -i)
                            })
                            .collect();
                        registry.upsert_batch(ticket, batch);
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let snap = registry.snapshot();
            assert!(snap.len() <= 20);
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(registry.len(), 20);
    }
}
