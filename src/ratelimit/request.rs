//! The request/result contract shared by every strategy.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A single admission check for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Identifies the rate-limited entity; equal keys share state.
    pub key: String,
    /// Maximum units permitted per window.
    pub limit: u64,
    /// Window length.
    pub duration: Duration,
}

impl Request {
    /// Create a new request.
    pub fn new(key: impl Into<String>, limit: u64, duration: Duration) -> Self {
        Self {
            key: key.into(),
            limit,
            duration,
        }
    }
}

/// The binary admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// The unit of work may proceed.
    Allow,
    /// The unit of work must be rejected.
    Deny,
}

impl Decision {
    /// Header-friendly name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "Allow",
            Decision::Deny => "Deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Allow or deny.
    pub decision: Decision,
    /// Units consumed (window strategies) or tokens remaining (token bucket).
    pub observed_count: u64,
    /// When capacity is expected to be available again.
    pub reset_at: DateTime<Utc>,
}

impl Outcome {
    /// An allowing outcome.
    pub fn allow(observed_count: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            decision: Decision::Allow,
            observed_count,
            reset_at,
        }
    }

    /// A denying outcome.
    pub fn deny(observed_count: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            decision: Decision::Deny,
            observed_count,
            reset_at,
        }
    }

    /// Whether the check admitted the request.
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_strings() {
        assert_eq!(Decision::Allow.to_string(), "Allow");
        assert_eq!(Decision::Deny.as_str(), "Deny");
    }

    #[test]
    fn test_outcome_constructors() {
        let now = Utc::now();
        assert!(Outcome::allow(1, now).is_allowed());
        assert!(!Outcome::deny(5, now).is_allowed());
        assert_eq!(Outcome::deny(5, now).observed_count, 5);
    }
}
