//! Lifecycle hook points and the per-template hook table.
//!
//! Hooks attach to eight points around the three phase slots. Each point
//! accepts a shared hook (fires on both walks), an exec-only hook, and an
//! undo-only hook. Exec walks fire shared-then-exec-only at each point;
//! undo walks fire undo-only-then-shared, mirroring the exec order.

use crate::action::ActionFn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The eight lifecycle points a hook can attach to.
///
/// The `*DuringTry` points fire inside the retry loops, once per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    /// Before the before-child slot.
    PreBefore,
    /// After the before-child slot.
    PostBefore,
    /// Before the user action slot.
    PreDuring,
    /// Before each user action attempt.
    PreDuringTry,
    /// After each user action attempt, success included.
    PostDuringTry,
    /// After the user action slot.
    PostDuring,
    /// Before the after-child slot.
    PreAfter,
    /// After the after-child slot.
    PostAfter,
}

impl HookPoint {
    /// All points, in exec-walk order.
    pub const ALL: [HookPoint; 8] = [
        HookPoint::PreBefore,
        HookPoint::PostBefore,
        HookPoint::PreDuring,
        HookPoint::PreDuringTry,
        HookPoint::PostDuringTry,
        HookPoint::PostDuring,
        HookPoint::PreAfter,
        HookPoint::PostAfter,
    ];

    /// Stable label for logging.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            HookPoint::PreBefore => "pre_before",
            HookPoint::PostBefore => "post_before",
            HookPoint::PreDuring => "pre_during",
            HookPoint::PreDuringTry => "pre_during_try",
            HookPoint::PostDuringTry => "post_during_try",
            HookPoint::PostDuring => "post_during",
            HookPoint::PreAfter => "pre_after",
            HookPoint::PostAfter => "post_after",
        }
    }
}

/// Which walks a hook fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    /// Fires on both exec and undo walks.
    Shared,
    /// Fires on exec walks only.
    ExecOnly,
    /// Fires on undo walks only.
    UndoOnly,
}

/// The hook table attached to an operation template.
#[derive(Clone, Default)]
pub struct Hooks {
    table: HashMap<(HookPoint, HookKind), ActionFn>,
}

impl Hooks {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook, replacing any existing one at the same slot.
    pub fn insert(&mut self, point: HookPoint, kind: HookKind, hook: ActionFn) {
        self.table.insert((point, kind), hook);
    }

    /// Returns true if a hook is registered at the slot.
    #[must_use]
    pub fn contains(&self, point: HookPoint, kind: HookKind) -> bool {
        self.table.contains_key(&(point, kind))
    }

    /// Returns the number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Hooks to fire at `point` on an exec walk: shared first, then
    /// exec-only.
    #[must_use]
    pub fn for_exec(&self, point: HookPoint) -> Vec<ActionFn> {
        [HookKind::Shared, HookKind::ExecOnly]
            .into_iter()
            .filter_map(|kind| self.table.get(&(point, kind)).cloned())
            .collect()
    }

    /// Hooks to fire at `point` on an undo walk: undo-only first, then
    /// shared, mirroring the exec order.
    #[must_use]
    pub fn for_undo(&self, point: HookPoint) -> Vec<ActionFn> {
        [HookKind::UndoOnly, HookKind::Shared]
            .into_iter()
            .filter_map(|kind| self.table.get(&(point, kind)).cloned())
            .collect()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .table
            .keys()
            .map(|(point, kind)| format!("{}/{:?}", point.label(), kind))
            .collect();
        keys.sort();
        f.debug_struct("Hooks").field("registered", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{action, ActionOutput};
    use serde_json::json;

    fn tagged(tag: &str) -> ActionFn {
        let tag = tag.to_string();
        action(move |_| Ok(ActionOutput::value(json!(tag.clone()))))
    }

    #[test]
    fn test_empty_table() {
        let hooks = Hooks::new();
        assert!(hooks.is_empty());
        assert!(hooks.for_exec(HookPoint::PreBefore).is_empty());
        assert!(hooks.for_undo(HookPoint::PreBefore).is_empty());
    }

    #[test]
    fn test_exec_order_is_shared_then_exec_only() {
        let mut hooks = Hooks::new();
        hooks.insert(HookPoint::PreDuring, HookKind::ExecOnly, tagged("exec"));
        hooks.insert(HookPoint::PreDuring, HookKind::Shared, tagged("shared"));
        hooks.insert(HookPoint::PreDuring, HookKind::UndoOnly, tagged("undo"));

        assert_eq!(hooks.for_exec(HookPoint::PreDuring).len(), 2);
        assert_eq!(hooks.for_undo(HookPoint::PreDuring).len(), 2);
        assert_eq!(hooks.len(), 3);
    }

    #[test]
    fn test_kinds_do_not_leak_across_points() {
        let mut hooks = Hooks::new();
        hooks.insert(HookPoint::PostAfter, HookKind::Shared, tagged("x"));

        assert!(hooks.contains(HookPoint::PostAfter, HookKind::Shared));
        assert!(!hooks.contains(HookPoint::PreAfter, HookKind::Shared));
        assert!(hooks.for_exec(HookPoint::PreAfter).is_empty());
    }
}
