//! Rate limiting logic and state management.

mod decision;
mod limiter;
mod rules;
mod stats;
mod store;
mod window;

pub use decision::{Decision, RejectReason, Rejection};
pub use limiter::RateLimiter;
pub use rules::{Rule, RuleConfig, RuleSet, RulesFile, TimeUnit, WindowSpec};
pub use stats::{Stats, StatsSnapshot};
pub use store::{ClientSlot, EvictionPolicy, StateStore};
pub use window::{ClientSnapshot, ClientState, WindowSnapshot, WindowState};
