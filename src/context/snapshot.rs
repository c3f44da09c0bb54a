//! Read-only context views.

use crate::context::PhaseFlags;
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;
use crate::runtime::ExecId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable view of one execution context.
///
/// Handed to user actions and hooks on every invocation and returned by
/// `get_context`. Tree links are reduced to execution ids; resolve them
/// through the owning template if needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// The execution id.
    pub exec_id: ExecId,
    /// The params captured at `create`.
    pub params: Value,
    /// When the context was created.
    pub created_at: DateTime<Utc>,
    /// Phase progress at snapshot time.
    pub phases: PhaseFlags,
    /// Effective retry policy for the current walk.
    pub policy: RetryPolicy,
    /// An exec walk holds the context.
    pub executing: bool,
    /// An undo walk holds the context.
    pub undoing: bool,
    /// Accumulated exec results at snapshot time.
    pub exec_results: Vec<Outcome>,
    /// Accumulated undo results at snapshot time.
    pub undo_results: Vec<Outcome>,
    /// The before child's execution id, if linked.
    pub before_child: Option<ExecId>,
    /// The after child's execution id, if linked.
    pub after_child: Option<ExecId>,
    /// The parent's execution id, if linked and still alive.
    pub parent: Option<ExecId>,
}

impl ContextSnapshot {
    /// The current 0-indexed user exec attempt.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.phases.exec_function_attempt
    }

    /// True once an exec walk ran to completion.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.phases.is_completed()
    }
}
