//! Live handles onto execution contexts: the tree-building surface.
//!
//! A [`Handle`] is a cheap `(template, execution id)` pair. Trees are built
//! by linking handles into each other's before and after slots; siblings
//! are expressed by chaining after-children, parallelism by wrapping a
//! group of handles in a parallel composite. Handles from different
//! templates mix freely in one tree.

use crate::context::ContextSnapshot;
use crate::errors::{EngineError, EngineResult};
use crate::operation::{Operation, OperationInner};
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;
use crate::runtime::ExecId;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::sync::Weak;
use tracing::debug;

/// A live view onto one execution context.
#[derive(Clone)]
pub struct Handle {
    op: Operation,
    id: ExecId,
}

/// A non-owning handle, used for parent back-references so a subtree is
/// owned only by the slot that currently lists it.
#[derive(Clone)]
pub struct WeakHandle {
    op: Weak<OperationInner>,
    id: ExecId,
}

impl WeakHandle {
    /// Upgrades to a live handle if the template is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Handle> {
        Operation::from_weak(&self.op).map(|op| Handle::new(op, self.id.clone()))
    }

    /// The referenced execution id.
    #[must_use]
    pub fn exec_id(&self) -> &ExecId {
        &self.id
    }
}

impl fmt::Debug for WeakHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHandle").field("exec_id", &self.id).finish()
    }
}

/// A child argument for [`Handle::add_child`]: one handle, a parallel
/// group, or a sequential chain.
#[derive(Debug, Clone)]
pub enum ChildSpec {
    /// A single handle, attached directly.
    Single(Handle),
    /// A group of handles, wrapped in a fresh parallel composite.
    Group(Vec<Handle>),
    /// A group of handles collapsed into a linear chain: the first element
    /// is attached and the rest become its after-descendants in order.
    Chain(Vec<Handle>),
}

impl ChildSpec {
    /// Builds a sequential chain spec.
    #[must_use]
    pub fn chain(children: Vec<Handle>) -> Self {
        Self::Chain(children)
    }
}

impl From<Handle> for ChildSpec {
    fn from(handle: Handle) -> Self {
        Self::Single(handle)
    }
}

impl From<Vec<Handle>> for ChildSpec {
    fn from(children: Vec<Handle>) -> Self {
        Self::Group(children)
    }
}

enum Route {
    Insert,
    Staged,
    Merge(Handle),
}

impl Handle {
    pub(crate) fn new(op: Operation, id: ExecId) -> Self {
        Self { op, id }
    }

    /// The execution id this handle is bound to.
    #[must_use]
    pub fn exec_id(&self) -> &ExecId {
        &self.id
    }

    /// The owning operation template.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Returns a read-only view of the bound context.
    pub fn get_context(&self) -> EngineResult<ContextSnapshot> {
        self.op.get_context(&self.id)
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            op: self.op.downgrade(),
            id: self.id.clone(),
        }
    }

    // --- walks -----------------------------------------------------------

    /// Executes the subtree rooted here with the template's default policy.
    ///
    /// Returns the context's accumulated `exec_results` on success; a
    /// failing walk raises those same results via
    /// [`EngineError::Execution`].
    pub fn exec(&self) -> BoxFuture<'static, EngineResult<Vec<Outcome>>> {
        self.exec_with(self.op.default_policy())
    }

    /// Executes the subtree rooted here with an explicit retry policy.
    pub fn exec_with(&self, policy: RetryPolicy) -> BoxFuture<'static, EngineResult<Vec<Outcome>>> {
        let handle = self.clone();
        async move { crate::executor::run_exec(handle, policy).await }.boxed()
    }

    /// Undoes the subtree rooted here with the template's default policy,
    /// in the mirror of the order in which exec-phase work succeeded.
    pub fn undo(&self) -> BoxFuture<'static, EngineResult<Vec<Outcome>>> {
        self.undo_with(self.op.default_policy())
    }

    /// Undoes the subtree rooted here with an explicit retry policy.
    pub fn undo_with(&self, policy: RetryPolicy) -> BoxFuture<'static, EngineResult<Vec<Outcome>>> {
        let handle = self.clone();
        async move { crate::undoer::run_undo(handle, policy).await }.boxed()
    }

    /// Executes the whole tree this handle belongs to, from its root.
    pub fn exec_all(&self) -> BoxFuture<'static, EngineResult<Vec<Outcome>>> {
        self.root().exec()
    }

    /// Executes the whole tree with an explicit retry policy.
    pub fn exec_all_with(&self, policy: RetryPolicy) -> BoxFuture<'static, EngineResult<Vec<Outcome>>> {
        self.root().exec_with(policy)
    }

    /// Undoes the whole tree this handle belongs to, from its root.
    pub fn undo_all(&self) -> BoxFuture<'static, EngineResult<Vec<Outcome>>> {
        self.root().undo()
    }

    /// Undoes the whole tree with an explicit retry policy.
    pub fn undo_all_with(&self, policy: RetryPolicy) -> BoxFuture<'static, EngineResult<Vec<Outcome>>> {
        self.root().undo_with(policy)
    }

    /// Climbs parent links to the root of the containing tree.
    ///
    /// Callers must not form parent cycles; the climb does not detect them.
    #[must_use]
    pub fn root(&self) -> Handle {
        let mut current = self.clone();
        loop {
            let parent = current
                .op
                .with_ctx(&current.id, |ctx| ctx.parent.clone())
                .ok()
                .flatten()
                .and_then(|weak| weak.upgrade());
            match parent {
                Some(next) => current = next,
                None => return current,
            }
        }
    }

    // --- tree building ---------------------------------------------------

    /// Adds a child to the after slot.
    ///
    /// If an after-child already exists the new child is appended at the
    /// tail of the after chain, so after-children execute in insertion
    /// order. While this context is executing, the child is staged as a
    /// pending graft instead and attached by the executor at its next
    /// checkpoint.
    pub fn add_child(&self, child: impl Into<ChildSpec>) -> EngineResult<&Self> {
        self.attach(child.into(), false)?;
        Ok(self)
    }

    /// Adds a child to the before slot.
    ///
    /// The newest before-child wraps closest to this node and executes
    /// first; an existing before subtree is re-attached as the new child's
    /// after-descendant, so before-children execute in reverse insertion
    /// order.
    pub fn add_child_before(&self, child: impl Into<ChildSpec>) -> EngineResult<&Self> {
        self.attach(child.into(), true)?;
        Ok(self)
    }

    /// Attaches this handle as the given parent's after-child.
    pub fn add_parent(&self, parent: &Handle) -> EngineResult<&Self> {
        parent.add_child(self.clone())?;
        Ok(self)
    }

    fn attach(&self, spec: ChildSpec, before: bool) -> EngineResult<()> {
        let child = Self::resolve_spec(spec)?;
        if child == *self {
            return Err(EngineError::BadInput(format!(
                "cannot add {} as its own child",
                self.id
            )));
        }

        let route = self.op.with_ctx_mut(&self.id, |ctx| {
            if ctx.executing {
                match &ctx.pending_during {
                    Some(pending) => Route::Merge(pending.clone()),
                    None => {
                        ctx.pending_during = Some(child.clone());
                        Route::Staged
                    }
                }
            } else {
                Route::Insert
            }
        })?;

        match route {
            Route::Insert => self.insert(child, before),
            Route::Staged => {
                debug!(exec_id = %self.id, child = %child.id, "staged pending graft");
                Ok(())
            }
            Route::Merge(pending) => {
                debug!(exec_id = %self.id, child = %child.id, "merged into pending graft");
                pending.attach(ChildSpec::Single(child), false)
            }
        }
    }

    fn resolve_spec(spec: ChildSpec) -> EngineResult<Handle> {
        match spec {
            ChildSpec::Single(handle) => Ok(handle),
            ChildSpec::Group(children) => crate::parallel::group(children),
            ChildSpec::Chain(children) => {
                let mut iter = children.into_iter();
                let head = iter
                    .next()
                    .ok_or_else(|| EngineError::BadInput("empty child chain".to_string()))?;
                for next in iter {
                    head.add_child(next)?;
                }
                Ok(head)
            }
        }
    }

    fn insert(&self, child: Handle, before: bool) -> EngineResult<()> {
        if before {
            let displaced = self
                .op
                .with_ctx_mut(&self.id, |ctx| ctx.before_child.replace(child.clone()))?;
            child.set_parent(self)?;
            if let Some(old) = displaced {
                // the newest before-child runs first; the displaced subtree
                // follows it
                child.add_child(old)?;
            }
            Ok(())
        } else {
            let existing = self.op.with_ctx(&self.id, |ctx| ctx.after_child.clone())?;
            match existing {
                Some(tail) => tail.add_child(child).map(|_| ()),
                None => {
                    self.op
                        .with_ctx_mut(&self.id, |ctx| ctx.after_child = Some(child.clone()))?;
                    child.set_parent(self)
                }
            }
        }
    }

    pub(crate) fn set_parent(&self, parent: &Handle) -> EngineResult<()> {
        self.op
            .with_ctx_mut(&self.id, |ctx| ctx.parent = Some(parent.downgrade()))
    }

    /// Attaches a drained graft to this (composite) handle, preserving
    /// mirror-order undo. After-position grafts append at the after tail;
    /// before-position grafts chain through before slots with the newest at
    /// the root, so the most recently executed graft is undone first.
    pub(crate) fn push_graft(&self, child: Handle, before_position: bool) -> EngineResult<()> {
        if before_position {
            let displaced = self
                .op
                .with_ctx_mut(&self.id, |ctx| ctx.before_child.replace(child.clone()))?;
            child.set_parent(self)?;
            if let Some(old) = displaced {
                child.attach_before_tail(old)?;
            }
            Ok(())
        } else {
            self.insert(child, false)
        }
    }

    fn attach_before_tail(&self, old: Handle) -> EngineResult<()> {
        let mut node = self.clone();
        loop {
            let next = node.op.with_ctx(&node.id, |ctx| ctx.before_child.clone())?;
            match next {
                Some(deeper) => node = deeper,
                None => break,
            }
        }
        node.op
            .with_ctx_mut(&node.id, |ctx| ctx.before_child = Some(old.clone()))?;
        old.set_parent(&node)
    }

    // --- reset -----------------------------------------------------------

    /// Clears phase flags and result buffers on this context, keeping
    /// params and the static child slots, then recursively resets the
    /// before and after children. Grafted and pending children are dropped.
    ///
    /// Refuses with `Conflict` while a walk holds the context.
    pub fn reset(&self) -> EngineResult<&Self> {
        let children = self.op.with_ctx_mut(&self.id, |ctx| {
            if ctx.executing || ctx.undoing {
                return Err(EngineError::Conflict(format!(
                    "cannot reset {} while a walk is running",
                    ctx.exec_id
                )));
            }
            ctx.clear_progress();
            Ok((ctx.before_child.clone(), ctx.after_child.clone()))
        })??;

        let (before, after) = children;
        if let Some(child) = before {
            child.reset()?;
        }
        if let Some(child) = after {
            child.reset()?;
        }
        Ok(self)
    }

    /// Resets the whole tree this handle belongs to, from its root.
    pub fn reset_all(&self) -> EngineResult<&Self> {
        self.root().reset()?;
        Ok(self)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.op.ptr_eq(&other.op) && self.id == other.id
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("op", &self.op.name())
            .field("exec_id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Operation {
        Operation::builder().name("noop").build()
    }

    #[test]
    fn test_after_children_append_at_tail() {
        let op = noop();
        let root = op.create(json!(null));
        let a = op.create(json!(null));
        let b = op.create(json!(null));

        root.add_child(a.clone()).unwrap().add_child(b.clone()).unwrap();

        let root_snapshot = root.get_context().unwrap();
        assert_eq!(root_snapshot.after_child.as_ref(), Some(a.exec_id()));

        let a_snapshot = a.get_context().unwrap();
        assert_eq!(a_snapshot.after_child.as_ref(), Some(b.exec_id()));
        assert_eq!(a_snapshot.parent.as_ref(), Some(root.exec_id()));

        let b_snapshot = b.get_context().unwrap();
        assert_eq!(b_snapshot.parent.as_ref(), Some(a.exec_id()));
    }

    #[test]
    fn test_before_rotation_newest_wraps_first() {
        let op = noop();
        let root = op.create(json!(null));
        let a = op.create(json!(null));
        let b = op.create(json!(null));

        root.add_child_before(a.clone()).unwrap();
        root.add_child_before(b.clone()).unwrap();

        // b takes the before slot; the displaced subtree follows it
        let root_snapshot = root.get_context().unwrap();
        assert_eq!(root_snapshot.before_child.as_ref(), Some(b.exec_id()));

        let b_snapshot = b.get_context().unwrap();
        assert_eq!(b_snapshot.after_child.as_ref(), Some(a.exec_id()));
        assert_eq!(b_snapshot.parent.as_ref(), Some(root.exec_id()));
    }

    #[test]
    fn test_chain_spec_collapses_to_after_descendants() {
        let op = noop();
        let root = op.create(json!(null));
        let a = op.create(json!(null));
        let b = op.create(json!(null));
        let c = op.create(json!(null));

        root.add_child(ChildSpec::chain(vec![a.clone(), b.clone(), c.clone()]))
            .unwrap();

        assert_eq!(
            root.get_context().unwrap().after_child.as_ref(),
            Some(a.exec_id())
        );
        assert_eq!(
            a.get_context().unwrap().after_child.as_ref(),
            Some(b.exec_id())
        );
        assert_eq!(
            b.get_context().unwrap().after_child.as_ref(),
            Some(c.exec_id())
        );
    }

    #[test]
    fn test_empty_chain_is_bad_input() {
        let op = noop();
        let root = op.create(json!(null));
        let result = root.add_child(ChildSpec::chain(Vec::new()));
        assert!(matches!(result, Err(EngineError::BadInput(_))));
    }

    #[test]
    fn test_self_child_is_bad_input() {
        let op = noop();
        let root = op.create(json!(null));
        let result = root.add_child(root.clone());
        assert!(matches!(result, Err(EngineError::BadInput(_))));
    }

    #[test]
    fn test_add_child_while_executing_stages_pending() {
        let op = noop();
        let root = op.create(json!(null));
        let child = op.create(json!(null));
        let second = op.create(json!(null));

        op.with_ctx_mut(root.exec_id(), |ctx| ctx.executing = true)
            .unwrap();

        root.add_child(child.clone()).unwrap();
        let pending = op
            .with_ctx(root.exec_id(), |ctx| ctx.pending_during.clone())
            .unwrap();
        assert_eq!(pending.as_ref(), Some(&child));

        // a further add merges into the staged child's after chain
        root.add_child(second.clone()).unwrap();
        assert_eq!(
            child.get_context().unwrap().after_child.as_ref(),
            Some(second.exec_id())
        );

        // the static slots were not touched
        let snapshot = root.get_context().unwrap();
        assert!(snapshot.after_child.is_none());
        assert!(snapshot.before_child.is_none());
    }

    #[test]
    fn test_add_parent_links_after_slot() {
        let op = noop();
        let parent = op.create(json!(null));
        let child = op.create(json!(null));

        child.add_parent(&parent).unwrap();

        assert_eq!(
            parent.get_context().unwrap().after_child.as_ref(),
            Some(child.exec_id())
        );
        assert_eq!(child.root(), parent);
    }

    #[test]
    fn test_root_climbs_parent_chain() {
        let op = noop();
        let root = op.create(json!(null));
        let mid = op.create(json!(null));
        let leaf = op.create(json!(null));

        root.add_child(mid.clone()).unwrap();
        mid.add_child_before(leaf.clone()).unwrap();

        assert_eq!(leaf.root(), root);
        assert_eq!(root.root(), root);
    }

    #[test]
    fn test_reset_refuses_while_executing() {
        let op = noop();
        let root = op.create(json!(null));
        op.with_ctx_mut(root.exec_id(), |ctx| ctx.executing = true)
            .unwrap();

        assert!(matches!(root.reset(), Err(EngineError::Conflict(_))));
    }
}
