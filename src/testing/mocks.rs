//! Mock collaborators and instrumented operations for tests.

use crate::action::{action, ActionOutput};
use crate::operation::Operation;
use crate::runtime::{Clock, ExecId, IdSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A clock that records requested delays and returns immediately.
///
/// Clones share the recording, so a test can keep one clone and hand
/// another to the template builder.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl MockClock {
    /// Creates a new mock clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every delay requested so far.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    /// Returns the number of delays requested.
    #[must_use]
    pub fn delay_count(&self) -> usize {
        self.delays.lock().len()
    }
}

#[async_trait]
impl Clock for MockClock {
    async fn delay(&self, duration: Duration) {
        self.delays.lock().push(duration);
    }
}

/// Deterministic id source minting `prefix-1`, `prefix-2`, …
#[derive(Debug)]
pub struct SequenceIdSource {
    prefix: String,
    next: AtomicU64,
}

impl SequenceIdSource {
    /// Creates a source with the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdSource for SequenceIdSource {
    fn next_id(&self) -> ExecId {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        ExecId::new(format!("{}-{}", self.prefix, n))
    }
}

/// A shared integer cell standing in for external side-effected state.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    value: Arc<Mutex<i64>>,
}

impl Accumulator {
    /// Creates an accumulator at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        *self.value.lock()
    }

    /// Adds `n` and returns the new value.
    pub fn add(&self, n: i64) -> i64 {
        let mut value = self.value.lock();
        *value += n;
        *value
    }

    /// Subtracts `n` and returns the new value.
    pub fn sub(&self, n: i64) -> i64 {
        let mut value = self.value.lock();
        *value -= n;
        *value
    }
}

/// An ordered event recorder for asserting traversal and hook order.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    events: Arc<Mutex<Vec<String>>>,
}

impl Probe {
    /// Creates an empty probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event.
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    /// Returns every recorded event in order.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Returns the number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drops every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Builds an accumulator operation: exec adds the params amount, undo
/// subtracts it, and both report the resulting value as `{"newValue": v}`.
#[must_use]
pub fn adder(accumulator: &Accumulator) -> Operation {
    let exec_acc = accumulator.clone();
    let undo_acc = accumulator.clone();

    Operation::builder()
        .name("adder")
        .exec(action(move |args| {
            let n = args.params.as_i64().unwrap_or(0);
            let value = exec_acc.add(n);
            Ok(ActionOutput::value(serde_json::json!({ "newValue": value })))
        }))
        .undo(action(move |args| {
            let n = args.params.as_i64().unwrap_or(0);
            let value = undo_acc.sub(n);
            Ok(ActionOutput::value(serde_json::json!({ "newValue": value })))
        }))
        .build()
}
