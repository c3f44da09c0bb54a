//! Operation templates and their execution registries.
//!
//! An [`Operation`] is the immutable definition shared by every execution of
//! a reversible unit of work: the user's exec and undo actions, the hook
//! table, the injected clock and id source, and a default retry policy.
//! Each `create` call allocates a fresh [`Context`] in the template's
//! registry and returns a [`Handle`] bound to it.

use crate::action::ActionFn;
use crate::context::{Context, ContextSnapshot};
use crate::errors::{EngineError, EngineResult};
use crate::handle::Handle;
use crate::hooks::{HookKind, HookPoint, Hooks};
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;
use crate::runtime::{Clock, ExecId, IdSource, TokioClock, UuidIdSource};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

pub(crate) struct OperationInner {
    name: String,
    exec: Option<ActionFn>,
    undo: Option<ActionFn>,
    hooks: Hooks,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    default_policy: RetryPolicy,
    registry: RwLock<HashMap<ExecId, Context>>,
}

/// An immutable operation template.
///
/// Cloning is cheap and shares the template, including its execution
/// registry. The registry retains every created context so `get` and
/// `get_context` work for the template's whole history; handles stored as
/// children of the template's own contexts keep the template alive, so call
/// [`Operation::clear_history`] when a long-lived template's retired
/// executions are no longer needed.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl Operation {
    /// Starts building a template.
    #[must_use]
    pub fn builder() -> OperationBuilder {
        OperationBuilder::new()
    }

    /// Allocates a fresh execution context holding `params` and returns a
    /// handle bound to it.
    pub fn create(&self, params: impl Into<Value>) -> Handle {
        let id = self.inner.ids.next_id();
        let ctx = Context::new(id.clone(), params.into(), self.inner.default_policy.clone());
        self.inner.registry.write().insert(id.clone(), ctx);
        debug!(op = %self.inner.name, exec_id = %id, "created execution context");
        Handle::new(self.clone(), id)
    }

    /// Returns a handle for an existing execution id.
    pub fn get(&self, id: &ExecId) -> EngineResult<Handle> {
        if self.inner.registry.read().contains_key(id) {
            Ok(Handle::new(self.clone(), id.clone()))
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }

    /// Returns a read-only view of an existing execution context.
    pub fn get_context(&self, id: &ExecId) -> EngineResult<ContextSnapshot> {
        self.with_ctx(id, Context::snapshot)
    }

    /// Template-level convenience: executes an existing context with the
    /// given policy.
    pub async fn exec(&self, id: &ExecId, policy: RetryPolicy) -> EngineResult<Vec<Outcome>> {
        self.get(id)?.exec_with(policy).await
    }

    /// Drops every retained context. Handles minted earlier stop resolving.
    pub fn clear_history(&self) {
        self.inner.registry.write().clear();
    }

    /// Number of retained execution contexts.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.inner.registry.read().len()
    }

    /// The template's diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The template's default retry policy.
    #[must_use]
    pub fn default_policy(&self) -> RetryPolicy {
        self.inner.default_policy.clone()
    }

    pub(crate) fn exec_fn(&self) -> Option<ActionFn> {
        self.inner.exec.clone()
    }

    pub(crate) fn undo_fn(&self) -> Option<ActionFn> {
        self.inner.undo.clone()
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    pub(crate) fn with_ctx<R>(
        &self,
        id: &ExecId,
        f: impl FnOnce(&Context) -> R,
    ) -> EngineResult<R> {
        let registry = self.inner.registry.read();
        let ctx = registry
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(f(ctx))
    }

    pub(crate) fn with_ctx_mut<R>(
        &self,
        id: &ExecId,
        f: impl FnOnce(&mut Context) -> R,
    ) -> EngineResult<R> {
        let mut registry = self.inner.registry.write();
        let ctx = registry
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(f(ctx))
    }

    pub(crate) fn downgrade(&self) -> Weak<OperationInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_weak(weak: &Weak<OperationInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.inner.name)
            .field("history_len", &self.history_len())
            .finish()
    }
}

/// Builder for [`Operation`] templates.
pub struct OperationBuilder {
    name: String,
    exec: Option<ActionFn>,
    undo: Option<ActionFn>,
    hooks: Hooks,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    default_policy: RetryPolicy,
}

impl OperationBuilder {
    fn new() -> Self {
        Self {
            name: "operation".to_string(),
            exec: None,
            undo: None,
            hooks: Hooks::new(),
            clock: Arc::new(TokioClock),
            ids: Arc::new(UuidIdSource),
            default_policy: RetryPolicy::default(),
        }
    }

    /// Sets the diagnostic name used in tracing output.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the user exec action.
    #[must_use]
    pub fn exec(mut self, action: ActionFn) -> Self {
        self.exec = Some(action);
        self
    }

    /// Sets the user undo action.
    #[must_use]
    pub fn undo(mut self, action: ActionFn) -> Self {
        self.undo = Some(action);
        self
    }

    /// Registers a shared hook, firing on both walks.
    #[must_use]
    pub fn hook(mut self, point: HookPoint, action: ActionFn) -> Self {
        self.hooks.insert(point, HookKind::Shared, action);
        self
    }

    /// Registers an exec-only hook.
    #[must_use]
    pub fn exec_hook(mut self, point: HookPoint, action: ActionFn) -> Self {
        self.hooks.insert(point, HookKind::ExecOnly, action);
        self
    }

    /// Registers an undo-only hook.
    #[must_use]
    pub fn undo_hook(mut self, point: HookPoint, action: ActionFn) -> Self {
        self.hooks.insert(point, HookKind::UndoOnly, action);
        self
    }

    /// Replaces the retry clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the execution id source.
    #[must_use]
    pub fn id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Sets the default retry policy used by `exec()`/`undo()`.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Finishes the template.
    #[must_use]
    pub fn build(self) -> Operation {
        Operation {
            inner: Arc::new(OperationInner {
                name: self.name,
                exec: self.exec,
                undo: self.undo,
                hooks: self.hooks,
                clock: self.clock,
                ids: self.ids,
                default_policy: self.default_policy,
                registry: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl Default for OperationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_registers_context() {
        let op = Operation::builder().name("noop").build();
        let handle = op.create(json!({"n": 1}));

        assert_eq!(op.history_len(), 1);
        let snapshot = op.get_context(handle.exec_id()).unwrap();
        assert_eq!(snapshot.params, json!({"n": 1}));
    }

    #[test]
    fn test_get_unknown_id_is_not_found() {
        let op = Operation::builder().build();
        let missing = ExecId::from("missing");

        assert!(matches!(op.get(&missing), Err(EngineError::NotFound(_))));
        assert!(matches!(
            op.get_context(&missing),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_get_returns_live_handle() {
        let op = Operation::builder().build();
        let created = op.create(json!(null));
        let fetched = op.get(created.exec_id()).unwrap();
        assert_eq!(created.exec_id(), fetched.exec_id());
    }

    #[test]
    fn test_clear_history() {
        let op = Operation::builder().build();
        let handle = op.create(json!(null));
        assert_eq!(op.history_len(), 1);

        op.clear_history();
        assert_eq!(op.history_len(), 0);
        assert!(handle.get_context().is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let op = Operation::builder().build();
        assert_eq!(op.name(), "operation");
        assert_eq!(op.default_policy(), RetryPolicy::default());
    }
}
