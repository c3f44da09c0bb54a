//! The parallel composite: a built-in template that fans a group of
//! children out concurrently.
//!
//! The composite presents as one ordinary child of the user-visible tree.
//! Its exec-only pre-during hook executes every child concurrently and
//! never short-circuits: each child runs to its own conclusion, every
//! child's outcomes are gathered in child order, and the hook raises the
//! whole gathered sequence when any child failed. The undo-only hook
//! mirrors this for the undo walk.

use crate::action::{async_action, ActionFailure, ActionOutput, ActionResult};
use crate::errors::{EngineError, EngineResult};
use crate::handle::Handle;
use crate::hooks::HookPoint;
use crate::operation::Operation;
use crate::outcome::Outcome;
use futures::future::join_all;
use serde_json::Value;
use tracing::debug;

/// Wraps a group of handles in a fresh parallel composite and returns the
/// composite's handle.
///
/// Children run under the composite context's effective retry policy; their
/// ordering relative to each other is unspecified, but each child's own
/// subtree stays internally serialized.
pub fn group(children: Vec<Handle>) -> EngineResult<Handle> {
    if children.is_empty() {
        return Err(EngineError::BadInput(
            "parallel group needs at least one child".to_string(),
        ));
    }

    let exec_children = children.clone();
    let undo_children = children.clone();

    let op = Operation::builder()
        .name("parallel")
        .exec_hook(
            HookPoint::PreDuring,
            async_action(move |args| {
                let children = exec_children.clone();
                let policy = args.ctx.policy.clone();
                async move {
                    debug!(fanout = children.len(), "parallel exec fanout");
                    let walks = children
                        .iter()
                        .map(|child| child.exec_with(policy.clone()))
                        .collect::<Vec<_>>();
                    gather(join_all(walks).await)
                }
            }),
        )
        .undo_hook(
            HookPoint::PreDuring,
            async_action(move |args| {
                let children = undo_children.clone();
                let policy = args.ctx.policy.clone();
                async move {
                    debug!(fanout = children.len(), "parallel undo fanout");
                    let walks = children
                        .iter()
                        .map(|child| child.undo_with(policy.clone()))
                        .collect::<Vec<_>>();
                    gather(join_all(walks).await)
                }
            }),
        )
        .build();

    let handle = op.create(Value::Null);
    for child in &children {
        child.set_parent(&handle)?;
    }
    Ok(handle)
}

/// Concatenates every child's outcomes in child order; raises the whole
/// concatenation if any child failed.
fn gather(settled: Vec<EngineResult<Vec<Outcome>>>) -> ActionResult {
    let mut outcomes = Vec::new();
    let mut failed = false;

    for result in settled {
        match result {
            Ok(results) => outcomes.extend(results),
            Err(err) => {
                failed = true;
                match err {
                    EngineError::Execution(results) | EngineError::Undo(results) => {
                        outcomes.extend(results);
                    }
                    other => outcomes.push(Outcome::Failure(other.to_string())),
                }
            }
        }
    }

    if failed {
        Err(ActionFailure::Results(outcomes))
    } else {
        Ok(ActionOutput::Many(outcomes))
    }
}
