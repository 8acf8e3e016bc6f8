//! Turnstile - Multi-rule Sliding-Window Admission Control
//!
//! This crate decides, request by request, whether a client is admitted
//! under several simultaneous sliding-window rules, each with a burst
//! capacity and an optional cooldown armed on violation. State is in-memory
//! and per client; decisions are driven only by the timestamps supplied with
//! each request, so replaying a request sequence reproduces its decisions.
//!
//! ```
//! use turnstile::ratelimit::{RateLimiter, Rule, RuleSet};
//!
//! let rules = RuleSet::new(vec![
//!     Rule::new(1, 2).with_cooldown(5),
//!     Rule::new(60, 15).with_cooldown(10),
//! ])
//! .unwrap();
//! let limiter = RateLimiter::new(rules);
//!
//! assert!(limiter.should_allow("user1", 1));
//! assert!(limiter.should_allow("user1", 1));
//! assert!(!limiter.should_allow("user1", 1)); // cooldown until 6
//! assert!(!limiter.should_allow("user1", 2));
//! assert!(limiter.should_allow("user1", 7));
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replay;
