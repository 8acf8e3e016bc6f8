//! Core admission engine.

use tracing::{debug, info, trace};

use super::decision::{Decision, RejectReason, Rejection};
use super::rules::{Rule, RuleSet};
use super::stats::Stats;
use super::store::{ClientSlot, EvictionPolicy, StateStore};
use super::window::{ClientSnapshot, ClientState};
use crate::config::LimiterConfig;
use crate::error::ConfigError;

/// The first rule that fails during the check phase.
enum Violation {
    Cooldown { index: usize, until: u64 },
    OverLimit { index: usize },
}

/// Multi-rule sliding-window rate limiter.
///
/// Every request is evaluated against all rules in declaration order. A
/// request is admitted only if every rule passes, and only then is it
/// recorded against every rule. A rejected request is recorded nowhere; the
/// only state a rejection may change is the failing rule's cooldown.
///
/// The limiter is driven entirely by the timestamps it is given, so the same
/// sequence of requests always produces the same decisions. It is thread-safe
/// and can be shared across threads behind an `Arc`; requests for the same
/// client are serialized, requests for different clients are not.
#[derive(Debug)]
pub struct RateLimiter {
    rules: RuleSet,
    store: StateStore,
    stats: Stats,
}

impl RateLimiter {
    /// Create a limiter that keeps every client for its whole lifetime.
    pub fn new(rules: RuleSet) -> Self {
        Self::with_eviction(rules, EvictionPolicy::Unbounded)
    }

    /// Create a limiter with an explicit client eviction policy.
    pub fn with_eviction(rules: RuleSet, eviction: EvictionPolicy) -> Self {
        let store = StateStore::new(rules.len(), eviction);
        Self {
            rules,
            store,
            stats: Stats::new(),
        }
    }

    /// Build a limiter from configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self, ConfigError> {
        let rules = RuleSet::from_configs(&config.rules)?;
        let eviction = config.eviction.policy()?;

        info!(
            rules = rules.len(),
            eviction = ?eviction,
            "Rate limiter initialized"
        );

        Ok(Self::with_eviction(rules, eviction))
    }

    /// Decide whether a request from `client_id` at `timestamp` is admitted.
    pub fn should_allow(&self, client_id: &str, timestamp: u64) -> bool {
        self.check(client_id, timestamp).is_allowed()
    }

    /// Evaluate a request and return the full decision.
    pub fn check(&self, client_id: &str, timestamp: u64) -> Decision {
        let decision = loop {
            let (slot, evicted) = self.store.resolve(client_id, timestamp);
            if evicted > 0 {
                self.stats.record_evictions(evicted);
            }

            if let Some(decision) = self.check_slot(&slot, timestamp) {
                break decision;
            }
            trace!(client = %client_id, timestamp, "Client state retired, resolving again");
        };

        match &decision {
            Decision::Allowed { remaining } => {
                trace!(client = %client_id, timestamp, remaining, "Request admitted");
            }
            Decision::Rejected(rejection) => {
                debug!(
                    client = %client_id,
                    timestamp,
                    rule = ?rejection.rule_index,
                    window = ?rejection.window,
                    reason = ?rejection.reason,
                    retry_at = rejection.retry_at,
                    "Request rejected"
                );
            }
        }

        self.stats.record(&decision);
        decision
    }

    /// Evaluate against a resolved slot. Returns `None` if the slot was
    /// removed from the store before its lock was taken.
    fn check_slot(&self, slot: &ClientSlot, timestamp: u64) -> Option<Decision> {
        let mut state = slot.lock();
        if state.is_retired() {
            return None;
        }
        slot.touch(timestamp);
        Some(self.evaluate(&mut state, timestamp))
    }

    /// Run the check and commit phases against one client's locked state.
    fn evaluate(&self, state: &mut ClientState, timestamp: u64) -> Decision {
        assert_eq!(
            state.windows().len(),
            self.rules.len(),
            "client state does not match the rule set"
        );

        if let Some(last_admitted) = state.last_admitted() {
            if timestamp < last_admitted {
                return Decision::Rejected(Rejection {
                    rule_index: None,
                    window: None,
                    reason: RejectReason::OutOfOrder { last_admitted },
                    retry_at: last_admitted,
                });
            }
        }

        match self.find_violation(state, timestamp) {
            None => Decision::Allowed {
                remaining: self.commit(state, timestamp),
            },
            Some(Violation::Cooldown { index, until }) => {
                let rule = self.rule(index);
                let drained_at =
                    state
                        .window(index)
                        .available_at(timestamp, rule.window, rule.burst_capacity);

                Decision::Rejected(Rejection {
                    rule_index: Some(index),
                    window: Some(rule.window),
                    reason: RejectReason::Cooldown { until },
                    retry_at: until.max(drained_at),
                })
            }
            Some(Violation::OverLimit { index }) => {
                let rule = self.rule(index);
                let window = state.window_mut(index);
                let drained_at = window.available_at(timestamp, rule.window, rule.burst_capacity);

                let cooldown_until = rule.cooldown.map(|cooldown| {
                    let until = timestamp.saturating_add(cooldown);
                    window.arm_cooldown(until);
                    debug!(rule = %rule.label(), timestamp, until, "Cooldown armed");
                    until
                });

                Decision::Rejected(Rejection {
                    rule_index: Some(index),
                    window: Some(rule.window),
                    reason: RejectReason::OverLimit { cooldown_until },
                    retry_at: cooldown_until.unwrap_or(0).max(drained_at),
                })
            }
        }
    }

    /// Check phase: evaluate rules in order without mutating anything and
    /// return the first one that fails.
    fn find_violation(&self, state: &ClientState, timestamp: u64) -> Option<Violation> {
        for (index, (rule, window)) in self.rules.iter().zip(state.windows()).enumerate() {
            if window.in_cooldown(timestamp) {
                // in_cooldown implies an expiry is set
                let until = window.cooldown_until().unwrap_or(timestamp);
                return Some(Violation::Cooldown { index, until });
            }

            let retained = window.retained(timestamp, rule.window) as u64;
            trace!(
                rule = %rule.label(),
                retained,
                capacity = rule.burst_capacity,
                "Evaluating rule"
            );

            if retained >= rule.burst_capacity {
                return Some(Violation::OverLimit { index });
            }
        }
        None
    }

    /// Commit phase: prune and record the request against every rule.
    ///
    /// Returns the smallest remaining capacity across rules.
    fn commit(&self, state: &mut ClientState, timestamp: u64) -> u64 {
        let mut remaining = u64::MAX;
        for (rule, window) in self.rules.iter().zip(state.windows_mut()) {
            window.prune(timestamp, rule.window);
            window.push(timestamp);

            let retained = window.len() as u64;
            debug_assert!(retained <= rule.burst_capacity);
            remaining = remaining.min(rule.burst_capacity.saturating_sub(retained));
        }
        state.set_last_admitted(timestamp);
        remaining
    }

    fn rule(&self, index: usize) -> &Rule {
        self.rules
            .get(index)
            .expect("violation index comes from iterating the rule set")
    }

    /// The rules this limiter enforces.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Copy of a client's state, or `None` if the client is unknown.
    pub fn snapshot(&self, client_id: &str) -> Option<ClientSnapshot> {
        self.store.snapshot(&self.rules, client_id)
    }

    /// Drop clients whose state can no longer affect a decision at or after
    /// `now`. Returns the number of clients removed.
    pub fn purge_idle(&self, now: u64) -> usize {
        let purged = self.store.purge_idle(&self.rules, now);
        if purged > 0 {
            debug!(purged, now, "Purged idle clients");
            self.stats.record_evictions(purged);
        }
        purged
    }

    /// Get the number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.store.len()
    }

    /// Clear all client state.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Decision counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}
