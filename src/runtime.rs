//! Injected collaborators: the retry clock and the execution id source.
//!
//! Both are trait objects on the operation template so tests can substitute
//! a recording clock and deterministic ids (see [`crate::testing`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Opaque identifier for one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecId(String);

impl ExecId {
    /// Wraps an identifier string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ExecId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Suspending delay used between retry attempts.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Suspends the current task for the given duration.
    async fn delay(&self, duration: Duration);
}

/// Default clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn delay(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Source of unique execution identifiers.
pub trait IdSource: Send + Sync {
    /// Mints a fresh identifier.
    fn next_id(&self) -> ExecId;
}

/// Default id source minting v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdSource;

impl IdSource for UuidIdSource {
    fn next_id(&self) -> ExecId {
        ExecId::new(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_id_display() {
        let id = ExecId::from("op-1");
        assert_eq!(id.to_string(), "op-1");
        assert_eq!(id.as_str(), "op-1");
    }

    #[test]
    fn test_uuid_source_mints_unique_ids() {
        let source = UuidIdSource;
        let a = source.next_id();
        let b = source.next_id();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[tokio::test]
    async fn test_tokio_clock_delays() {
        let clock = TokioClock;
        let start = std::time::Instant::now();
        clock.delay(Duration::from_millis(10)).await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
