//! User-supplied callables: actions and hooks.
//!
//! An action is invoked with [`ActionArgs`] (the params captured at
//! `create`, a read-only context snapshot, and the live handle) and
//! resolves to an [`ActionResult`]. The [`action`] and [`async_action`]
//! constructors wrap plain closures and async closures respectively.

use crate::context::ContextSnapshot;
use crate::handle::Handle;
use crate::outcome::Outcome;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Arguments handed to every user action and hook invocation.
#[derive(Debug, Clone)]
pub struct ActionArgs {
    /// The params captured when the context was created.
    pub params: Value,
    /// Read-only view of the owning context at invocation time.
    pub ctx: ContextSnapshot,
    /// Handle to the owning context. An action may call
    /// [`Handle::add_child`] on it to stage a graft while the walk runs.
    pub handle: Handle,
}

/// What a successful action produced.
#[derive(Debug, Clone)]
pub enum ActionOutput {
    /// Nothing to record.
    None,
    /// A single value, appended to the walk results.
    Value(Value),
    /// A pre-tagged outcome sequence, extended onto the walk results.
    ///
    /// Used by composite actions (such as the parallel fan-out) that gather
    /// results from several children and must surface each one.
    Many(Vec<Outcome>),
}

impl ActionOutput {
    /// Records a single value.
    #[must_use]
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }
}

impl From<Value> for ActionOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Why an action failed.
#[derive(Debug, Clone)]
pub enum ActionFailure {
    /// A plain failure message, recorded as one failure outcome.
    Message(String),
    /// A pre-tagged outcome sequence from a composite action; every entry
    /// is extended onto the walk results before the walk raises.
    Results(Vec<Outcome>),
}

impl ActionFailure {
    /// Builds a message failure.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<String> for ActionFailure {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for ActionFailure {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(message) => f.write_str(message),
            Self::Results(outcomes) => {
                write!(f, "{}", crate::outcome::summarize(outcomes))
            }
        }
    }
}

/// Result of one action or hook invocation.
pub type ActionResult = Result<ActionOutput, ActionFailure>;

/// A stored action, invokable any number of times.
pub type ActionFn =
    Arc<dyn Fn(ActionArgs) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// Wraps a synchronous closure as an action.
pub fn action<F>(f: F) -> ActionFn
where
    F: Fn(ActionArgs) -> ActionResult + Send + Sync + 'static,
{
    Arc::new(move |args| std::future::ready(f(args)).boxed())
}

/// Wraps an async closure as an action.
pub fn async_action<F, Fut>(f: F) -> ActionFn
where
    F: Fn(ActionArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}
