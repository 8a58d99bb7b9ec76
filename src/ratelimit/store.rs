//! The shared counter store and its maintenance passes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::key::LimitKey;

/// One active counter.
///
/// An entry exists only while at least one attempt has been recorded in the
/// current window, so `count >= 1`. `window_reset_at` is fixed when the
/// entry is created and does not slide on later attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

impl CounterEntry {
    /// A fresh entry for a first attempt at `now`.
    pub fn new(now: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            count: 1,
            window_reset_at: now + window,
            last_attempt_at: now,
        }
    }

    /// An entry past its reset instant is treated as absent.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }
}

/// Outcome of recording an attempt against a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt was counted. `count` is the value after the update.
    Admitted {
        count: u32,
        reset_at: DateTime<Utc>,
    },
    /// The budget is exhausted; the counter was left untouched.
    Refused { reset_at: DateTime<Utc> },
}

/// Point-in-time view of one entry, for admin lookups.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub is_expired: bool,
}

/// The mapping from counter key to entry, shared by every request.
///
/// Backed by a sharded map: `attempt` holds the entry's shard guard for the
/// whole read-modify-write, which is what keeps check-then-increment atomic
/// per key under concurrent requests.
#[derive(Debug, Default)]
pub struct CounterStore {
    map: DashMap<LimitKey, CounterEntry>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt: create the entry, roll an expired window, count
    /// the attempt, or refuse once the budget is spent.
    ///
    /// Refusals neither increment the count nor touch `last_attempt_at`.
    pub fn attempt(
        &self,
        key: &LimitKey,
        max_attempts: u32,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        use dashmap::mapref::entry::Entry;

        match self.map.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CounterEntry::new(now, window);
                    AttemptOutcome::Admitted {
                        count: 1,
                        reset_at: entry.window_reset_at,
                    }
                } else if entry.count < max_attempts {
                    entry.count += 1;
                    entry.last_attempt_at = now;
                    AttemptOutcome::Admitted {
                        count: entry.count,
                        reset_at: entry.window_reset_at,
                    }
                } else {
                    AttemptOutcome::Refused {
                        reset_at: entry.window_reset_at,
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let entry = CounterEntry::new(now, window);
                let reset_at = entry.window_reset_at;
                vacant.insert(entry);
                AttemptOutcome::Admitted { count: 1, reset_at }
            }
        }
    }

    /// Copy of the entry for a key, if present.
    pub fn get(&self, key: &LimitKey) -> Option<CounterEntry> {
        self.map.get(key).map(|entry| *entry)
    }

    /// Remove the entry for a key. Returns whether one was present.
    pub fn remove(&self, key: &LimitKey) -> bool {
        self.map.remove(key).is_some()
    }

    /// Expiry pass: drop every entry whose window has elapsed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.map.len())
    }

    /// Capacity pass: evict oldest-by-`last_attempt_at` entries until the
    /// store holds at most `max_size`. Can discard live counters.
    pub fn trim_to(&self, max_size: usize) -> usize {
        let excess = self.map.len().saturating_sub(max_size);
        if excess == 0 {
            return 0;
        }

        let mut entries: Vec<(LimitKey, DateTime<Utc>)> = self
            .map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_attempt_at))
            .collect();
        entries.sort_by_key(|(_, last_attempt)| *last_attempt);

        let mut removed = 0;
        for (key, _) in entries.into_iter().take(excess) {
            if self.map.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every entry whose serialized key contains `needle`.
    pub fn remove_matching(&self, needle: &str) -> usize {
        let before = self.map.len();
        self.map.retain(|key, _| !key.to_string().contains(needle));
        before.saturating_sub(self.map.len())
    }

    /// Snapshot of all entries, for introspection off the hot path.
    pub fn snapshot(&self) -> Vec<(LimitKey, CounterEntry)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::{AuthAction, LimitLayer};

    fn key(identifier: &str) -> LimitKey {
        LimitKey::new(AuthAction::Login, LimitLayer::Ip, identifier)
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_first_attempt_creates_entry() {
        let store = CounterStore::new();
        let window = chrono::Duration::minutes(15);
        let t0 = now();

        let outcome = store.attempt(&key("1.2.3.4"), 5, window, t0);
        assert_eq!(
            outcome,
            AttemptOutcome::Admitted {
                count: 1,
                reset_at: t0 + window
            }
        );

        let entry = store.get(&key("1.2.3.4")).unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_reset_at, t0 + window);
        assert_eq!(entry.last_attempt_at, t0);
    }

    #[test]
    fn test_window_reset_is_fixed_at_creation() {
        let store = CounterStore::new();
        let window = chrono::Duration::minutes(15);
        let t0 = now();

        store.attempt(&key("1.2.3.4"), 5, window, t0);
        store.attempt(&key("1.2.3.4"), 5, window, t0 + chrono::Duration::minutes(5));

        // Later attempts do not slide the window
        let entry = store.get(&key("1.2.3.4")).unwrap();
        assert_eq!(entry.window_reset_at, t0 + window);
        assert_eq!(entry.count, 2);
        assert_eq!(entry.last_attempt_at, t0 + chrono::Duration::minutes(5));
    }

    #[test]
    fn test_refusal_leaves_entry_untouched() {
        let store = CounterStore::new();
        let window = chrono::Duration::minutes(15);
        let t0 = now();

        store.attempt(&key("1.2.3.4"), 2, window, t0);
        store.attempt(&key("1.2.3.4"), 2, window, t0);

        let t1 = t0 + chrono::Duration::minutes(1);
        let outcome = store.attempt(&key("1.2.3.4"), 2, window, t1);
        assert_eq!(
            outcome,
            AttemptOutcome::Refused {
                reset_at: t0 + window
            }
        );

        let entry = store.get(&key("1.2.3.4")).unwrap();
        assert_eq!(entry.count, 2);
        assert_eq!(entry.last_attempt_at, t0);
    }

    #[test]
    fn test_expired_entry_rolls_to_fresh_window() {
        let store = CounterStore::new();
        let window = chrono::Duration::minutes(15);
        let t0 = now();

        for _ in 0..2 {
            store.attempt(&key("1.2.3.4"), 2, window, t0);
        }

        let t1 = t0 + window;
        let outcome = store.attempt(&key("1.2.3.4"), 2, window, t1);
        assert_eq!(
            outcome,
            AttemptOutcome::Admitted {
                count: 1,
                reset_at: t1 + window
            }
        );
    }

    #[test]
    fn test_evict_expired_keeps_live_entries() {
        let store = CounterStore::new();
        let t0 = now();

        store.attempt(&key("old"), 5, chrono::Duration::minutes(1), t0);
        store.attempt(&key("live"), 5, chrono::Duration::hours(1), t0);

        let removed = store.evict_expired(t0 + chrono::Duration::minutes(5));
        assert_eq!(removed, 1);
        assert!(store.get(&key("old")).is_none());
        assert!(store.get(&key("live")).is_some());
    }

    #[test]
    fn test_trim_evicts_oldest_by_last_attempt() {
        let store = CounterStore::new();
        let window = chrono::Duration::hours(1);
        let t0 = now();

        for i in 0..5 {
            store.attempt(
                &key(&format!("ip-{}", i)),
                5,
                window,
                t0 + chrono::Duration::seconds(i),
            );
        }

        let removed = store.trim_to(3);
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 3);

        // The two oldest went first
        assert!(store.get(&key("ip-0")).is_none());
        assert!(store.get(&key("ip-1")).is_none());
        assert!(store.get(&key("ip-4")).is_some());
    }

    #[test]
    fn test_trim_noop_when_within_budget() {
        let store = CounterStore::new();
        store.attempt(&key("1.2.3.4"), 5, chrono::Duration::hours(1), now());

        assert_eq!(store.trim_to(10), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_matching_substring() {
        let store = CounterStore::new();
        let window = chrono::Duration::hours(1);
        let t0 = now();

        store.attempt(&key("1.2.3.4"), 5, window, t0);
        store.attempt(
            &LimitKey::new(AuthAction::Login, LimitLayer::Email, "a@b.com"),
            5,
            window,
            t0,
        );
        store.attempt(
            &LimitKey::new(AuthAction::Register, LimitLayer::Email, "a@b.com"),
            5,
            window,
            t0,
        );

        let removed = store.remove_matching("a@b.com");
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get(&key("1.2.3.4")).is_some());
    }
}
