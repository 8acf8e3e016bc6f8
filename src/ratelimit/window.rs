//! Per-client sliding window state.

use serde::Serialize;
use std::collections::VecDeque;

/// Sliding window state for one (client, rule) pair.
///
/// Timestamps are admitted-request timestamps, oldest first. They are only
/// appended at the tail and pruned from the head, so the queue is always
/// sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowState {
    timestamps: VecDeque<u64>,
    cooldown_until: Option<u64>,
}

impl WindowState {
    /// Number of leading entries expired relative to `now`.
    ///
    /// An entry exactly `window` old is expired (half-open window).
    fn expired_prefix(&self, now: u64, window: u64) -> usize {
        self.timestamps
            .partition_point(|&t| now.saturating_sub(t) >= window)
    }

    /// Number of entries still inside the window ending at `now`.
    pub fn retained(&self, now: u64, window: u64) -> usize {
        self.timestamps.len() - self.expired_prefix(now, window)
    }

    /// Earliest time, at or after `now`, when fewer than `capacity` entries
    /// remain inside the window.
    pub fn available_at(&self, now: u64, window: u64, capacity: u64) -> u64 {
        let expired = self.expired_prefix(now, window);
        let retained = self.timestamps.len() - expired;
        let capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
        if retained < capacity {
            return now;
        }
        // Entry whose expiry drops the count below capacity.
        let index = expired + (retained - capacity);
        self.timestamps[index].saturating_add(window).max(now)
    }

    /// Drop every entry expired relative to `now`.
    pub fn prune(&mut self, now: u64, window: u64) {
        let expired = self.expired_prefix(now, window);
        self.timestamps.drain(..expired);
    }

    /// Record an admitted request.
    pub fn push(&mut self, timestamp: u64) {
        debug_assert!(
            self.timestamps.back().map_or(true, |&last| last <= timestamp),
            "timestamps must be appended in non-decreasing order"
        );
        self.timestamps.push_back(timestamp);
    }

    /// Whether a cooldown blocks a request at `now`.
    pub fn in_cooldown(&self, now: u64) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }

    /// The cooldown expiry, if one was ever armed.
    pub fn cooldown_until(&self) -> Option<u64> {
        self.cooldown_until
    }

    /// Arm a cooldown ending at `until`.
    pub fn arm_cooldown(&mut self, until: u64) {
        self.cooldown_until = Some(until);
    }

    /// True when the window holds nothing that could affect a request at `now`.
    pub fn is_idle(&self, now: u64, window: u64) -> bool {
        self.retained(now, window) == 0 && !self.in_cooldown(now)
    }

    /// Raw number of stored entries, including ones not yet pruned.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        self.timestamps.iter().copied()
    }
}

/// All state held for a single client: one [`WindowState`] per rule, in
/// rule order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    windows: Vec<WindowState>,
    last_admitted: Option<u64>,
    retired: bool,
}

impl ClientState {
    /// Fresh zero-state for a rule set of `rule_count` rules.
    pub fn new(rule_count: usize) -> Self {
        Self {
            windows: vec![WindowState::default(); rule_count],
            last_admitted: None,
            retired: false,
        }
    }

    pub fn window(&self, index: usize) -> &WindowState {
        &self.windows[index]
    }

    pub fn window_mut(&mut self, index: usize) -> &mut WindowState {
        &mut self.windows[index]
    }

    pub fn windows(&self) -> &[WindowState] {
        &self.windows
    }

    pub fn windows_mut(&mut self) -> &mut [WindowState] {
        &mut self.windows
    }

    /// Timestamp of the newest admitted request.
    pub fn last_admitted(&self) -> Option<u64> {
        self.last_admitted
    }

    pub fn set_last_admitted(&mut self, timestamp: u64) {
        self.last_admitted = Some(timestamp);
    }

    /// Whether this state has been removed from its store. A retired state
    /// must not be evaluated; the caller has to look the client up again.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Mark the state as removed. Only called with the slot lock held,
    /// immediately before the slot leaves the store.
    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }
}

/// Read-only copy of one window, for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub window: u64,
    pub timestamps: Vec<u64>,
    pub cooldown_until: Option<u64>,
}

/// Read-only copy of a client's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSnapshot {
    pub windows: Vec<WindowSnapshot>,
    pub last_admitted: Option<u64>,
    pub last_seen: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(timestamps: &[u64]) -> WindowState {
        let mut state = WindowState::default();
        for &t in timestamps {
            state.push(t);
        }
        state
    }

    #[test]
    fn test_retained_is_half_open() {
        let state = window_with(&[1, 2, 3]);

        // At t=4 with window 2, entries 1 and 2 are at least 2 old.
        assert_eq!(state.retained(4, 2), 1);
        // At t=3, entry 1 is exactly 2 old and is expired.
        assert_eq!(state.retained(3, 2), 2);
        assert_eq!(state.retained(3, 10), 3);
    }

    #[test]
    fn test_prune_removes_head() {
        let mut state = window_with(&[1, 1, 5, 9]);
        state.prune(10, 5);

        assert_eq!(state.timestamps().collect::<Vec<_>>(), vec![9]);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_available_at() {
        let state = window_with(&[2, 3, 5]);

        // Below capacity: available immediately.
        assert_eq!(state.available_at(5, 10, 4), 5);
        // At capacity: the oldest retained entry has to expire.
        assert_eq!(state.available_at(5, 10, 3), 12);
        // Entry 2 already expired at t=12, so 3 is the one to wait for.
        assert_eq!(state.available_at(12, 10, 2), 13);
    }

    #[test]
    fn test_cooldown_is_exclusive_at_expiry() {
        let mut state = WindowState::default();
        assert!(!state.in_cooldown(0));

        state.arm_cooldown(6);
        assert!(state.in_cooldown(5));
        assert!(!state.in_cooldown(6));
        assert_eq!(state.cooldown_until(), Some(6));
    }

    #[test]
    fn test_idle_requires_drained_queue_and_expired_cooldown() {
        let mut state = window_with(&[10]);
        assert!(!state.is_idle(12, 5));
        assert!(state.is_idle(15, 5));

        state.arm_cooldown(20);
        assert!(!state.is_idle(15, 5));
        assert!(state.is_idle(20, 5));
    }

    #[test]
    fn test_client_state_has_one_window_per_rule() {
        let mut client = ClientState::new(3);
        assert_eq!(client.windows().len(), 3);
        assert_eq!(client.last_admitted(), None);

        client.window_mut(1).push(4);
        client.set_last_admitted(4);
        assert_eq!(client.window(1).len(), 1);
        assert!(client.window(0).is_empty());
        assert_eq!(client.last_admitted(), Some(4));
        assert!(!client.is_retired());

        client.retire();
        assert!(client.is_retired());
    }
}
