use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::model::{BookingId, Requester, RoomId, Span};
use crate::policy::{namespace_of, GlobalPolicy, POLICY_NAMESPACE};

/// Concurrent map whose entries expire `ttl` after insertion.
///
/// Every invalidation bumps `generation` before removing anything. A loader
/// captures the generation before reading the source and hands it to
/// `insert_if_current`, so a value computed from state that was invalidated
/// mid-load is never cached.
pub struct TtlCache<K, V> {
    entries: DashMap<K, (Instant, V)>,
    ttl: Duration,
    generation: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let hit = self.entries.get(key).and_then(|entry| {
            let (inserted, value) = entry.value();
            (inserted.elapsed() < self.ttl).then(|| value.clone())
        });
        if hit.is_none() {
            self.entries.remove_if(key, |_, (inserted, _)| inserted.elapsed() >= self.ttl);
        }
        hit
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Insert only if no invalidation has happened since `generation` was read.
    ///
    /// The check runs under the entry's shard lock, so an invalidation that
    /// bumps after the check still has to wait for the lock and removes the
    /// entry afterwards.
    pub fn insert_if_current(&self, key: K, value: V, generation: u64) -> bool {
        let entry = self.entries.entry(key);
        if self.generation() != generation {
            return false;
        }
        entry.insert((Instant::now(), value));
        true
    }

    pub fn get_or_insert_with(&self, key: K, load: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get(&key) {
            return v;
        }
        let generation = self.generation();
        let value = load();
        self.insert_if_current(key, value.clone(), generation);
        value
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.bump();
        self.entries.remove(key).is_some()
    }

    /// Drop every entry whose key matches `pred`. Returns how many were dropped.
    pub fn invalidate_where(&self, pred: impl Fn(&K) -> bool) -> usize {
        self.bump();
        let before = self.entries.len();
        self.entries.retain(|k, _| !pred(k));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.bump();
        self.entries.clear();
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (inserted, _)| inserted.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read-through snapshot of the `reservations.*` settings.
pub struct PolicyCache {
    inner: TtlCache<&'static str, GlobalPolicy>,
}

impl PolicyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(ttl),
        }
    }

    pub fn get_or_load(&self, load: impl FnOnce() -> GlobalPolicy) -> GlobalPolicy {
        self.inner.get_or_insert_with(POLICY_NAMESPACE, load)
    }

    /// Invalidation hook for a write to `key`. Only the policy namespace matters.
    pub fn invalidate_for_key(&self, key: &str) -> bool {
        namespace_of(key) == POLICY_NAMESPACE && self.inner.invalidate(&POLICY_NAMESPACE)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }
}

/// Everything a per-room availability answer depends on besides the room's own state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AvailabilityKey {
    pub room_id: RoomId,
    /// Notice windows are measured from today, so answers roll over at midnight.
    pub today: NaiveDate,
    pub requester: Requester,
    pub date: NaiveDate,
    pub span: Span,
    pub party_size: u32,
    pub exclude_booking_id: Option<BookingId>,
}

/// Per-room availability answers, invalidated per room on every committed change.
pub struct AvailabilityCache<V> {
    inner: TtlCache<AvailabilityKey, V>,
}

impl<V: Clone> AvailabilityCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(ttl),
        }
    }

    pub fn get(&self, key: &AvailabilityKey) -> Option<V> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: AvailabilityKey, value: V) {
        self.inner.insert(key, value);
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    pub fn insert_if_current(&self, key: AvailabilityKey, value: V, generation: u64) -> bool {
        self.inner.insert_if_current(key, value, generation)
    }

    pub fn invalidate_room(&self, room_id: RoomId) -> usize {
        self.inner.invalidate_where(|k| k.room_id == room_id)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::KEY_SLOT_DURATION;
    use std::cell::Cell;
    use ulid::Ulid;

    fn key(room_id: RoomId) -> AvailabilityKey {
        AvailabilityKey {
            room_id,
            today: "2026-10-14".parse().unwrap(),
            requester: Requester { id: Ulid::nil(), is_admin: false },
            date: "2026-10-19".parse().unwrap(),
            span: Span::parse("09:00", "10:00").unwrap(),
            party_size: 1,
            exclude_booking_id: None,
        }
    }

    #[test]
    fn entries_expire() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.insert(1, "a");
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());

        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(1, "a");
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.purge_expired(), 0);
    }

    #[test]
    fn read_through_loads_once() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        let loads = Cell::new(0);
        let load = || {
            loads.set(loads.get() + 1);
            GlobalPolicy::default()
        };
        cache.get_or_load(load);
        cache.get_or_load(load);
        assert_eq!(loads.get(), 1);

        assert!(!cache.invalidate_for_key("notifications.email_enabled"));
        cache.get_or_load(load);
        assert_eq!(loads.get(), 1);

        assert!(cache.invalidate_for_key(KEY_SLOT_DURATION));
        let p = cache.get_or_load(|| GlobalPolicy {
            slot_duration_minutes: 15,
            ..Default::default()
        });
        assert_eq!(p.slot_duration_minutes, 15);
    }

    #[test]
    fn load_racing_an_invalidation_is_not_cached() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        // A write lands between the loader's snapshot and its insert.
        let stale = cache.get_or_load(|| {
            cache.invalidate_for_key(KEY_SLOT_DURATION);
            GlobalPolicy::default()
        });
        assert_eq!(stale.slot_duration_minutes, 30);
        assert_eq!(cache.len(), 0);

        let fresh = cache.get_or_load(|| GlobalPolicy {
            slot_duration_minutes: 60,
            ..Default::default()
        });
        assert_eq!(fresh.slot_duration_minutes, 60);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn availability_insert_skipped_after_room_change() {
        let cache = AvailabilityCache::new(Duration::from_secs(60));
        let room = Ulid::new();
        let generation = cache.generation();
        cache.invalidate_room(room);
        assert!(!cache.insert_if_current(key(room), true, generation));
        assert_eq!(cache.get(&key(room)), None);

        assert!(cache.insert_if_current(key(room), false, cache.generation()));
        assert_eq!(cache.get(&key(room)), Some(false));
    }

    #[test]
    fn availability_invalidation_is_per_room() {
        let cache = AvailabilityCache::new(Duration::from_secs(60));
        let (a, b) = (Ulid::new(), Ulid::new());
        cache.insert(key(a), true);
        cache.insert(key(b), false);
        assert_eq!(cache.invalidate_room(a), 1);
        assert_eq!(cache.get(&key(a)), None);
        assert_eq!(cache.get(&key(b)), Some(false));
        cache.clear();
        assert!(cache.is_empty());
    }
}
