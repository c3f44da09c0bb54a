//! Mutable execution contexts and their read-only snapshots.
//!
//! One [`Context`] exists per `create` call, keyed by its execution id in
//! the owning template's registry. The context records the static tree slots
//! (`before_child`/`after_child`), everything grafted while a walk was
//! running, the phase flags the undo walk consults, and the accumulated
//! result sequences.

mod snapshot;

pub use snapshot::ContextSnapshot;

use crate::handle::{Handle, WeakHandle};
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;
use crate::runtime::ExecId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Progress flags for one execution context.
///
/// The exec walk sets `*_executed` when it enters a phase and `*_succeeded`
/// when the phase's work returns; the undo walk touches exactly the phases
/// whose `*_executed` flag is set, and invokes the user undo only when the
/// user exec actually succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFlags {
    /// The before child's exec was entered.
    pub before_child_executed: bool,
    /// The before child's exec returned successfully.
    pub before_child_succeeded: bool,
    /// The before phase, trailing hooks included, finished.
    pub completed_before_child: bool,
    /// At least one user exec attempt started.
    pub exec_function_executed: bool,
    /// A user exec attempt returned successfully.
    pub exec_function_succeeded: bool,
    /// The during phase, trailing hooks included, finished.
    pub completed_exec_function: bool,
    /// The after child's exec was entered.
    pub after_child_executed: bool,
    /// The after child's exec returned successfully.
    pub after_child_succeeded: bool,
    /// The after phase, trailing hooks included, finished.
    pub completed_after_child: bool,
    /// 0-indexed attempt counter for the user exec.
    pub exec_function_attempt: u32,
    /// 0-indexed attempt counter for the user undo.
    pub undo_function_attempt: u32,
    /// A user undo attempt returned successfully.
    pub undo_function_succeeded: bool,
}

impl PhaseFlags {
    /// Resets every flag and counter.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// True once an exec walk ran to the end of the after phase.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed_after_child
    }
}

/// The three positions a dynamically grafted child can land in, chosen by
/// which phase the owning context was in when the graft was staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DuringSlot {
    /// Grafted while the before phase was running.
    Before,
    /// Grafted while the user action phase was running.
    During,
    /// Grafted after the user action phase completed.
    After,
}

impl DuringSlot {
    /// Stable label for logging.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            DuringSlot::Before => "before",
            DuringSlot::During => "during",
            DuringSlot::After => "after",
        }
    }
}

/// Composite holders for children grafted while each phase was running.
///
/// Each slot lazily holds one hook-less composite operation; grafts attach
/// to its before or after position so the undo walk can unwind them in
/// mirror order around the phase's own work.
#[derive(Debug, Clone, Default)]
pub struct DuringChildren {
    /// Grafts captured during the before phase.
    pub before_slot: Option<Handle>,
    /// Grafts captured during the user action phase.
    pub during_slot: Option<Handle>,
    /// Grafts captured during the after phase.
    pub after_slot: Option<Handle>,
}

impl DuringChildren {
    /// Returns the composite for a slot, if one was created.
    #[must_use]
    pub fn get(&self, slot: DuringSlot) -> Option<&Handle> {
        match slot {
            DuringSlot::Before => self.before_slot.as_ref(),
            DuringSlot::During => self.during_slot.as_ref(),
            DuringSlot::After => self.after_slot.as_ref(),
        }
    }

    pub(crate) fn slot_mut(&mut self, slot: DuringSlot) -> &mut Option<Handle> {
        match slot {
            DuringSlot::Before => &mut self.before_slot,
            DuringSlot::During => &mut self.during_slot,
            DuringSlot::After => &mut self.after_slot,
        }
    }

    /// Drops all slot composites.
    pub fn clear(&mut self) {
        self.before_slot = None;
        self.during_slot = None;
        self.after_slot = None;
    }
}

/// The mutable record behind one execution id.
#[derive(Debug, Clone)]
pub struct Context {
    /// The execution id this record is keyed by.
    pub exec_id: ExecId,
    /// The params captured at `create`.
    pub params: Value,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// The static before-child slot.
    pub before_child: Option<Handle>,
    /// The static after-child slot.
    pub after_child: Option<Handle>,
    /// Weak back-reference to the parent handle; used only to climb to the
    /// root for `exec_all`/`undo_all`, never for ownership.
    pub parent: Option<WeakHandle>,
    /// Children grafted while a walk was running.
    pub during: DuringChildren,
    /// A staged graft waiting for the executor's next checkpoint.
    pub pending_during: Option<Handle>,
    /// Phase progress.
    pub phases: PhaseFlags,
    /// Append-only results of the exec walk rooted here.
    pub exec_results: Vec<Outcome>,
    /// Append-only results of the undo walk rooted here.
    pub undo_results: Vec<Outcome>,
    /// Attempt-local buffer for the user exec's retries.
    pub op_results: Vec<Outcome>,
    /// Attempt-local buffer for the user undo's retries.
    pub op_undo_results: Vec<Outcome>,
    /// An exec walk currently holds this context.
    pub executing: bool,
    /// An undo walk currently holds this context.
    pub undoing: bool,
    /// Effective retry policy for the most recent walk.
    pub policy: RetryPolicy,
}

impl Context {
    pub(crate) fn new(exec_id: ExecId, params: Value, policy: RetryPolicy) -> Self {
        Self {
            exec_id,
            params,
            created_at: Utc::now(),
            before_child: None,
            after_child: None,
            parent: None,
            during: DuringChildren::default(),
            pending_during: None,
            phases: PhaseFlags::default(),
            exec_results: Vec::new(),
            undo_results: Vec::new(),
            op_results: Vec::new(),
            op_undo_results: Vec::new(),
            executing: false,
            undoing: false,
            policy,
        }
    }

    /// Builds the read-only view handed to user actions and returned by
    /// `get_context`.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            exec_id: self.exec_id.clone(),
            params: self.params.clone(),
            created_at: self.created_at,
            phases: self.phases.clone(),
            policy: self.policy.clone(),
            executing: self.executing,
            undoing: self.undoing,
            exec_results: self.exec_results.clone(),
            undo_results: self.undo_results.clone(),
            before_child: self.before_child.as_ref().map(|h| h.exec_id().clone()),
            after_child: self.after_child.as_ref().map(|h| h.exec_id().clone()),
            parent: self.parent.as_ref().map(|p| p.exec_id().clone()),
        }
    }

    /// Clears progress on this record: flags, result buffers, grafted and
    /// pending children. Params and the static child slots are kept.
    pub(crate) fn clear_progress(&mut self) {
        self.phases.clear();
        self.exec_results.clear();
        self.undo_results.clear();
        self.op_results.clear();
        self.op_undo_results.clear();
        self.during.clear();
        self.pending_during = None;
    }
}
