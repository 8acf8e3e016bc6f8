//! Concurrent per-client state storage.
//!
//! Each client gets its own [`ClientSlot`] guarded by its own mutex, so
//! requests for different clients never contend. The map itself is a
//! [`DashMap`]; its shard lock is held only long enough to find or insert a
//! slot, never while a client is being evaluated.

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::rules::RuleSet;
use super::window::{ClientSnapshot, ClientState, WindowSnapshot};
use crate::error::ConfigError;

/// How the store bounds the number of tracked clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Keep every client for the life of the store.
    #[default]
    Unbounded,
    /// Evict the least recently seen clients (by request timestamp) when a new
    /// client would exceed `max_clients`.
    ///
    /// Each pass evicts a batch of up to `max_clients / 16` clients (at least
    /// one), so the map is scanned once per batch of new clients rather than
    /// once per new client.
    ///
    /// The cap is soft under concurrent creation of distinct new clients:
    /// racing inserts can briefly exceed it until the next eviction pass.
    Lru { max_clients: usize },
}

impl EvictionPolicy {
    /// LRU policy with a validated capacity.
    pub fn lru(max_clients: usize) -> Result<Self, ConfigError> {
        if max_clients == 0 {
            return Err(ConfigError::ZeroMaxClients);
        }
        Ok(EvictionPolicy::Lru { max_clients })
    }
}

/// Number of clients evicted per LRU pass for a given capacity.
fn eviction_batch(max_clients: usize) -> usize {
    (max_clients / 16).clamp(1, max_clients.max(1))
}

/// State for a single client plus its last-seen timestamp.
///
/// `last_seen` lives outside the mutex so eviction can rank clients without
/// locking them.
#[derive(Debug)]
pub struct ClientSlot {
    state: Mutex<ClientState>,
    last_seen: AtomicU64,
}

impl ClientSlot {
    fn new(rule_count: usize, timestamp: u64) -> Self {
        Self {
            state: Mutex::new(ClientState::new(rule_count)),
            last_seen: AtomicU64::new(timestamp),
        }
    }

    /// Take the client's lock. All evaluation for this client happens under it.
    pub fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock()
    }

    /// Newest request timestamp observed for this client.
    pub fn last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// Record a request timestamp. Never moves `last_seen` backwards.
    pub fn touch(&self, timestamp: u64) {
        self.last_seen.fetch_max(timestamp, Ordering::Relaxed);
    }
}

/// Map from client identifier to its state, created on demand.
#[derive(Debug)]
pub struct StateStore {
    clients: DashMap<String, Arc<ClientSlot>>,
    rule_count: usize,
    eviction: EvictionPolicy,
}

impl StateStore {
    /// Create a store for clients evaluated against `rule_count` rules.
    pub fn new(rule_count: usize, eviction: EvictionPolicy) -> Self {
        Self {
            clients: DashMap::new(),
            rule_count,
            eviction,
        }
    }

    /// Return the client's slot, creating a zero-state slot on first use.
    ///
    /// Concurrent resolution of the same new client yields a single slot.
    /// The second element is the number of clients evicted to make room.
    pub fn resolve(&self, client_id: &str, timestamp: u64) -> (Arc<ClientSlot>, usize) {
        if let Some(slot) = self.clients.get(client_id) {
            return (Arc::clone(slot.value()), 0);
        }

        let evicted = match self.eviction {
            EvictionPolicy::Unbounded => 0,
            EvictionPolicy::Lru { max_clients } => self.evict_lru(max_clients),
        };

        let rule_count = self.rule_count;
        let slot = self
            .clients
            .entry(client_id.to_owned())
            .or_insert_with(|| {
                debug!(client = %client_id, timestamp, "Creating client state");
                Arc::new(ClientSlot::new(rule_count, timestamp))
            })
            .value()
            .clone();

        (slot, evicted)
    }

    /// Make room for one new client once the store holds `max_clients`.
    ///
    /// Evicts the least recently seen clients down to
    /// `max_clients - eviction_batch(max_clients)`. Ties on `last_seen` are
    /// broken by client id so eviction is deterministic.
    fn evict_lru(&self, max_clients: usize) -> usize {
        let len = self.clients.len();
        if len < max_clients {
            return 0;
        }
        let excess = len - (max_clients - eviction_batch(max_clients));

        // Max-heap holding the `excess` oldest (last_seen, client) pairs.
        let mut oldest: BinaryHeap<(u64, String)> = BinaryHeap::with_capacity(excess + 1);
        for entry in self.clients.iter() {
            let last_seen = entry.value().last_seen();
            let newer_than_kept = match oldest.peek() {
                Some((top_seen, top_id)) if oldest.len() >= excess => {
                    (last_seen, entry.key()) >= (*top_seen, top_id)
                }
                _ => false,
            };
            if newer_than_kept {
                continue;
            }
            oldest.push((last_seen, entry.key().clone()));
            if oldest.len() > excess {
                oldest.pop();
            }
        }

        let mut evicted = 0;
        for (last_seen, client_id) in oldest.into_sorted_vec() {
            if self.remove_slot(&client_id) {
                debug!(client = %client_id, last_seen, "Evicted least recently seen client");
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove a client, retiring its state under the slot lock first so a
    /// request that already holds the slot resolves the client again.
    fn remove_slot(&self, client_id: &str) -> bool {
        self.clients
            .remove_if(client_id, |_, slot| {
                slot.lock().retire();
                true
            })
            .is_some()
    }

    /// Remove clients whose state can no longer influence a decision at or
    /// after `now`: every window drained and every cooldown expired.
    ///
    /// Clients whose lock is currently held are kept. Purged states are
    /// retired before they leave the map.
    pub fn purge_idle(&self, rules: &RuleSet, now: u64) -> usize {
        let mut purged = 0;
        self.clients.retain(|_, slot| {
            let Some(mut state) = slot.state.try_lock() else {
                return true;
            };
            let idle = rules
                .iter()
                .zip(state.windows())
                .all(|(rule, window)| window.is_idle(now, rule.window));
            if idle {
                state.retire();
                purged += 1;
            }
            !idle
        });
        purged
    }

    /// Copy of a client's state, or `None` if the client is unknown.
    pub fn snapshot(&self, rules: &RuleSet, client_id: &str) -> Option<ClientSnapshot> {
        let slot = self.clients.get(client_id).map(|s| Arc::clone(s.value()))?;
        let state = slot.lock();

        let windows = rules
            .iter()
            .zip(state.windows())
            .map(|(rule, window)| WindowSnapshot {
                window: rule.window,
                timestamps: window.timestamps().collect(),
                cooldown_until: window.cooldown_until(),
            })
            .collect();

        Some(ClientSnapshot {
            windows,
            last_admitted: state.last_admitted(),
            last_seen: slot.last_seen(),
        })
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop every client.
    pub fn clear(&self) {
        self.clients.retain(|_, slot| {
            slot.lock().retire();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::Rule;
    use std::thread;

    fn rules() -> RuleSet {
        RuleSet::new(vec![Rule::new(10, 2), Rule::new(100, 5).with_cooldown(20)]).unwrap()
    }

    #[test]
    fn test_resolve_creates_once() {
        let store = StateStore::new(2, EvictionPolicy::Unbounded);
        let (first, _) = store.resolve("a", 1);
        let (second, _) = store.resolve("a", 2);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
        assert_eq!(first.lock().windows().len(), 2);
    }

    #[test]
    fn test_concurrent_resolve_same_client() {
        let store = Arc::new(StateStore::new(1, EvictionPolicy::Unbounded));

        let slots: Vec<Arc<ClientSlot>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = Arc::clone(&store);
                    scope.spawn(move || store.resolve("shared", 0).0)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(store.len(), 1);
        assert!(slots.iter().all(|s| Arc::ptr_eq(s, &slots[0])));
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let store = StateStore::new(1, EvictionPolicy::Unbounded);
        let (slot, _) = store.resolve("a", 5);
        slot.touch(9);
        slot.touch(3);
        assert_eq!(slot.last_seen(), 9);
    }

    #[test]
    fn test_lru_evicts_least_recently_seen() {
        let store = StateStore::new(1, EvictionPolicy::lru(2).unwrap());

        let (a, _) = store.resolve("a", 1);
        store.resolve("b", 2);
        a.touch(3);

        let (_, evicted) = store.resolve("c", 4);
        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 2);
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
    }

    #[test]
    fn test_lru_ties_broken_by_client_id() {
        let store = StateStore::new(1, EvictionPolicy::lru(2).unwrap());
        store.resolve("zed", 1);
        store.resolve("amy", 1);

        store.resolve("new", 2);
        assert!(!store.contains("amy"));
        assert!(store.contains("zed"));
    }

    #[test]
    fn test_lru_evicts_in_batches() {
        let store = StateStore::new(1, EvictionPolicy::lru(32).unwrap());
        for i in 0..32u64 {
            store.resolve(&format!("client-{:02}", i), i);
        }

        let (_, evicted) = store.resolve("new-1", 100);
        assert_eq!(evicted, 2);
        assert_eq!(store.len(), 31);
        assert!(!store.contains("client-00"));
        assert!(!store.contains("client-01"));
        assert!(store.contains("client-02"));

        // Room was left by the previous pass.
        let (_, evicted) = store.resolve("new-2", 101);
        assert_eq!(evicted, 0);
        assert_eq!(store.len(), 32);
    }

    #[test]
    fn test_evicted_state_is_retired() {
        let store = StateStore::new(1, EvictionPolicy::lru(1).unwrap());
        let (old, _) = store.resolve("a", 1);
        store.resolve("b", 2);

        assert!(!store.contains("a"));
        assert!(old.lock().is_retired());
    }

    #[test]
    fn test_existing_client_never_triggers_eviction() {
        let store = StateStore::new(1, EvictionPolicy::lru(1).unwrap());
        store.resolve("a", 1);
        let (_, evicted) = store.resolve("a", 2);
        assert_eq!(evicted, 0);
        assert!(store.contains("a"));
    }

    #[test]
    fn test_lru_rejects_zero_capacity() {
        assert_eq!(EvictionPolicy::lru(0), Err(ConfigError::ZeroMaxClients));
    }

    #[test]
    fn test_purge_idle_keeps_live_state() {
        let rules = rules();
        let store = StateStore::new(rules.len(), EvictionPolicy::Unbounded);

        let (drained, _) = store.resolve("drained", 1);
        {
            let mut state = drained.lock();
            state.window_mut(0).push(1);
            state.window_mut(1).push(1);
        }

        let (cooling, _) = store.resolve("cooling", 1);
        cooling.lock().window_mut(1).arm_cooldown(500);

        let (recent, _) = store.resolve("recent", 150);
        {
            let mut state = recent.lock();
            state.window_mut(0).push(150);
            state.window_mut(1).push(150);
        }

        let purged = store.purge_idle(&rules, 200);
        assert_eq!(purged, 1);
        assert!(!store.contains("drained"));
        assert!(drained.lock().is_retired());
        assert!(!recent.lock().is_retired());
        assert!(store.contains("cooling"));
        assert!(store.contains("recent"));
    }

    #[test]
    fn test_purge_idle_skips_locked_client() {
        let rules = rules();
        let store = StateStore::new(rules.len(), EvictionPolicy::Unbounded);
        let (busy, _) = store.resolve("busy", 1);

        let guard = busy.lock();
        assert_eq!(store.purge_idle(&rules, 1000), 0);
        drop(guard);

        assert!(store.contains("busy"));
        assert_eq!(store.purge_idle(&rules, 1000), 1);
    }

    #[test]
    fn test_snapshot() {
        let rules = rules();
        let store = StateStore::new(rules.len(), EvictionPolicy::Unbounded);
        assert!(store.snapshot(&rules, "missing").is_none());

        let (slot, _) = store.resolve("a", 7);
        {
            let mut state = slot.lock();
            state.window_mut(0).push(7);
            state.window_mut(1).arm_cooldown(27);
            state.set_last_admitted(7);
        }

        let snapshot = store.snapshot(&rules, "a").unwrap();
        assert_eq!(snapshot.windows[0].window, 10);
        assert_eq!(snapshot.windows[0].timestamps, vec![7]);
        assert_eq!(snapshot.windows[1].cooldown_until, Some(27));
        assert_eq!(snapshot.last_admitted, Some(7));
        assert_eq!(snapshot.last_seen, 7);
    }

    #[test]
    fn test_clear() {
        let store = StateStore::new(1, EvictionPolicy::Unbounded);
        store.resolve("a", 1);
        let (b, _) = store.resolve("b", 1);
        store.clear();
        assert!(store.is_empty());
        assert!(b.lock().is_retired());
    }
}
