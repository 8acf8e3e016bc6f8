//! Admission decisions.

use serde::Serialize;

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The request was admitted and recorded against every rule.
    Allowed {
        /// Smallest number of further requests any rule would still admit
        /// at this timestamp
        remaining: u64,
    },
    /// The request was rejected; no queue recorded it.
    Rejected(Rejection),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// The rejection details, if rejected.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Rejected(rejection) => Some(rejection),
        }
    }
}

impl From<Decision> for bool {
    fn from(decision: Decision) -> Self {
        decision.is_allowed()
    }
}

/// Why a request was rejected and which rule rejected it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Position of the failing rule, `None` for ordering rejections
    pub rule_index: Option<usize>,
    /// Window size of the failing rule
    pub window: Option<u64>,
    pub reason: RejectReason,
    /// Earliest timestamp at which the failing rule could admit again
    pub retry_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// A cooldown armed by an earlier violation is still active.
    Cooldown { until: u64 },
    /// The window already retains `burst_capacity` requests.
    OverLimit { cooldown_until: Option<u64> },
    /// The timestamp is older than the newest request already admitted for
    /// this client.
    OutOfOrder { last_admitted: u64 },
}
