//! Tagged outcomes accumulated across execution and undo walks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recorded result from a walk: a value produced by a user action or
/// hook, or a failure raised by one.
///
/// A walk appends outcomes in the order work happened and never discards
/// them. A failing walk raises the full accumulated sequence, so a caller
/// can see everything that ran before the failure and destructure the tail
/// for the root cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// A value returned by a user action or hook.
    Value(Value),
    /// A failure message raised by a user action or hook.
    Failure(String),
}

impl Outcome {
    /// Returns true if this outcome records a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns the recorded value, if this outcome is one.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Failure(_) => None,
        }
    }

    /// Returns the failure message, if this outcome is one.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::Value(_) => None,
            Self::Failure(msg) => Some(msg),
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Renders a short human-readable summary of an outcome sequence.
#[must_use]
pub fn summarize(outcomes: &[Outcome]) -> String {
    let failures = outcomes.iter().filter(|o| o.is_failure()).count();
    match outcomes.iter().rev().find_map(Outcome::failure) {
        Some(last) => format!(
            "{} outcome(s), {} failure(s), last failure: {}",
            outcomes.len(),
            failures,
            last
        ),
        None => format!("{} outcome(s)", outcomes.len()),
    }
}
