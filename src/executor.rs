//! The exec walk: phase sequencing, hook dispatch, the retry loop, and
//! graft drains.
//!
//! The walk over one context is strictly serialized: pre-before hooks, the
//! before child, post-before hooks, pre-during hooks, the retried user
//! action, post-during hooks, pre-after hooks, the after child, post-after
//! hooks. After every hook and between phases the executor drains the
//! context's staged graft, attaching it to the during-composite for the
//! current phase and executing it immediately.
//!
//! Every failure is appended to the context's `exec_results` before the
//! walk raises, so the raised [`EngineError::Execution`] always carries the
//! full history.

use crate::action::{ActionArgs, ActionFailure, ActionOutput};
use crate::context::{Context, DuringSlot};
use crate::errors::{EngineError, EngineResult};
use crate::handle::Handle;
use crate::hooks::HookPoint;
use crate::operation::Operation;
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;
use serde_json::Value;
use tracing::{debug, warn};

/// Sentinel for a halted walk: everything relevant has already been
/// appended to the context's result sequence.
pub(crate) struct Halt;

pub(crate) type StepResult = Result<(), Halt>;

/// Which result sequence a step appends to.
#[derive(Clone, Copy)]
pub(crate) enum Walk {
    Exec,
    Undo,
}

impl Walk {
    pub(crate) fn results_mut(self, ctx: &mut Context) -> &mut Vec<Outcome> {
        match self {
            Walk::Exec => &mut ctx.exec_results,
            Walk::Undo => &mut ctx.undo_results,
        }
    }
}

pub(crate) async fn run_exec(handle: Handle, policy: RetryPolicy) -> EngineResult<Vec<Outcome>> {
    let op = handle.operation().clone();
    let id = handle.exec_id().clone();

    let needs_reset = op.with_ctx(&id, |ctx| {
        if ctx.undoing {
            return Err(EngineError::Conflict(format!("{} is undoing", ctx.exec_id)));
        }
        if ctx.executing {
            return Err(EngineError::Conflict(format!(
                "{} is already executing; use add_child to graft onto a running walk",
                ctx.exec_id
            )));
        }
        Ok(ctx.phases.is_completed())
    })??;

    if needs_reset {
        debug!(op = %op.name(), exec_id = %id, "completed context; resetting before re-exec");
        handle.reset()?;
    }

    op.with_ctx_mut(&id, |ctx| {
        ctx.executing = true;
        ctx.policy = policy.clone();
    })?;
    debug!(op = %op.name(), exec_id = %id, "exec walk started");

    match exec_phases(&handle, &policy).await {
        Ok(()) => {
            let results = op.with_ctx_mut(&id, |ctx| {
                ctx.executing = false;
                ctx.exec_results.clone()
            })?;
            debug!(op = %op.name(), exec_id = %id, outcomes = results.len(), "exec walk completed");
            Ok(results)
        }
        Err(Halt) => {
            let results = op.with_ctx_mut(&id, |ctx| {
                ctx.executing = false;
                ctx.pending_during = None;
                ctx.exec_results.clone()
            })?;
            warn!(op = %op.name(), exec_id = %id, outcomes = results.len(), "exec walk failed");
            Err(EngineError::Execution(results))
        }
    }
}

async fn exec_phases(handle: &Handle, policy: &RetryPolicy) -> StepResult {
    fire_exec_hooks(handle, policy, HookPoint::PreBefore).await?;
    run_child_exec(handle, policy, true).await?;
    fire_exec_hooks(handle, policy, HookPoint::PostBefore).await?;
    mark(handle, |ctx| ctx.phases.completed_before_child = true)?;
    drain_pending(handle, policy).await?;

    fire_exec_hooks(handle, policy, HookPoint::PreDuring).await?;
    run_attempt_loop(handle, policy).await?;
    fire_exec_hooks(handle, policy, HookPoint::PostDuring).await?;
    mark(handle, |ctx| ctx.phases.completed_exec_function = true)?;
    drain_pending(handle, policy).await?;

    fire_exec_hooks(handle, policy, HookPoint::PreAfter).await?;
    run_child_exec(handle, policy, false).await?;
    fire_exec_hooks(handle, policy, HookPoint::PostAfter).await?;
    mark(handle, |ctx| ctx.phases.completed_after_child = true)?;
    drain_pending(handle, policy).await?;

    Ok(())
}

async fn run_child_exec(handle: &Handle, policy: &RetryPolicy, before: bool) -> StepResult {
    let child = read_ctx(handle, |ctx| {
        if before {
            ctx.before_child.clone()
        } else {
            ctx.after_child.clone()
        }
    })?;
    let Some(child) = child else { return Ok(()) };

    write_ctx(handle, |ctx| {
        if before {
            ctx.phases.before_child_executed = true;
        } else {
            ctx.phases.after_child_executed = true;
        }
    })?;
    debug!(
        exec_id = %handle.exec_id(),
        child = %child.exec_id(),
        slot = if before { "before" } else { "after" },
        "executing child subtree"
    );

    match child.exec_with(policy.clone()).await {
        Ok(results) => write_ctx(handle, |ctx| {
            if before {
                ctx.phases.before_child_succeeded = true;
            } else {
                ctx.phases.after_child_succeeded = true;
            }
            ctx.exec_results.extend(results);
        })?,
        Err(err) => {
            absorb_engine_err(handle, Walk::Exec, err)?;
            return Err(Halt);
        }
    }

    drain_pending(handle, policy).await
}

async fn run_attempt_loop(handle: &Handle, policy: &RetryPolicy) -> StepResult {
    let Some(exec_fn) = handle.operation().exec_fn() else {
        return Ok(());
    };
    let clock = handle.operation().clock();
    let tries = policy.num_tries.max(1);
    let mut succeeded = false;

    for attempt in 0..tries {
        write_ctx(handle, |ctx| {
            ctx.phases.exec_function_attempt = attempt;
            ctx.phases.exec_function_executed = true;
        })?;
        fire_exec_hooks(handle, policy, HookPoint::PreDuringTry).await?;

        let args = build_args(handle)?;
        match exec_fn(args).await {
            Ok(output) => {
                write_ctx(handle, |ctx| {
                    push_output(&mut ctx.op_results, output);
                    ctx.phases.exec_function_succeeded = true;
                })?;
                succeeded = true;
            }
            Err(failure) => {
                warn!(exec_id = %handle.exec_id(), attempt, %failure, "user exec attempt failed");
                write_ctx(handle, |ctx| push_failure(&mut ctx.op_results, failure))?;
                if attempt + 1 < tries {
                    clock.delay(policy.delay_for_attempt(attempt)).await;
                }
            }
        }

        // trailing try hooks fire on every attempt, success included
        fire_exec_hooks(handle, policy, HookPoint::PostDuringTry).await?;
        if succeeded {
            break;
        }
    }

    write_ctx(handle, |ctx| {
        let buffered = std::mem::take(&mut ctx.op_results);
        ctx.exec_results.extend(buffered);
    })?;

    if succeeded {
        Ok(())
    } else {
        Err(Halt)
    }
}

pub(crate) async fn fire_exec_hooks(
    handle: &Handle,
    policy: &RetryPolicy,
    point: HookPoint,
) -> StepResult {
    for hook in handle.operation().hooks().for_exec(point) {
        debug!(exec_id = %handle.exec_id(), point = point.label(), "firing exec hook");
        let args = build_args(handle)?;
        match hook(args).await {
            Ok(output) => write_ctx(handle, |ctx| {
                push_output(Walk::Exec.results_mut(ctx), output);
            })?,
            Err(failure) => {
                warn!(exec_id = %handle.exec_id(), point = point.label(), %failure, "exec hook failed");
                write_ctx(handle, |ctx| {
                    push_failure(Walk::Exec.results_mut(ctx), failure);
                })?;
                return Err(Halt);
            }
        }
        drain_pending(handle, policy).await?;
    }
    Ok(())
}

/// Takes the staged graft, attaches it to the during-composite for the
/// current phase, and executes it. Loops because the grafted subtree's own
/// hooks may stage another graft on this context.
async fn drain_pending(handle: &Handle, policy: &RetryPolicy) -> StepResult {
    loop {
        // cleared unconditionally before the child runs, so a failed graft
        // cannot re-run on a repeated exec
        let pending = write_ctx(handle, |ctx| ctx.pending_during.take())?;
        let Some(child) = pending else { return Ok(()) };

        let (slot, before_position) = read_ctx(handle, |ctx| {
            let phases = &ctx.phases;
            if phases.completed_exec_function {
                (DuringSlot::After, !phases.after_child_succeeded)
            } else if phases.completed_before_child {
                (DuringSlot::During, !phases.exec_function_succeeded)
            } else {
                (DuringSlot::Before, !phases.before_child_succeeded)
            }
        })?;

        let composite = slot_composite(handle, slot)?;
        if composite.push_graft(child.clone(), before_position).is_err() {
            write_ctx(handle, |ctx| {
                ctx.exec_results
                    .push(Outcome::Failure("failed to attach graft".to_string()));
            })?;
            return Err(Halt);
        }
        debug!(
            exec_id = %handle.exec_id(),
            child = %child.exec_id(),
            slot = slot.label(),
            before_position,
            "grafting during child"
        );

        match child.exec_with(policy.clone()).await {
            Ok(results) => write_ctx(handle, |ctx| ctx.exec_results.extend(results))?,
            Err(err) => {
                absorb_engine_err(handle, Walk::Exec, err)?;
                return Err(Halt);
            }
        }
    }
}

fn slot_composite(handle: &Handle, slot: DuringSlot) -> Result<Handle, Halt> {
    if let Some(existing) = read_ctx(handle, |ctx| ctx.during.get(slot).cloned())? {
        return Ok(existing);
    }
    let composite = Operation::builder()
        .name(format!("during-{}", slot.label()))
        .build()
        .create(Value::Null);
    write_ctx(handle, |ctx| {
        *ctx.during.slot_mut(slot) = Some(composite.clone());
    })?;
    Ok(composite)
}

fn mark(handle: &Handle, f: impl FnOnce(&mut Context)) -> StepResult {
    write_ctx(handle, f)
}

// --- shared plumbing (used by the undoer as well) -------------------------

pub(crate) fn read_ctx<R>(handle: &Handle, f: impl FnOnce(&Context) -> R) -> Result<R, Halt> {
    handle.operation().with_ctx(handle.exec_id(), f).map_err(|err| {
        warn!(exec_id = %handle.exec_id(), %err, "context vanished mid-walk");
        Halt
    })
}

pub(crate) fn write_ctx<R>(handle: &Handle, f: impl FnOnce(&mut Context) -> R) -> Result<R, Halt> {
    handle
        .operation()
        .with_ctx_mut(handle.exec_id(), f)
        .map_err(|err| {
            warn!(exec_id = %handle.exec_id(), %err, "context vanished mid-walk");
            Halt
        })
}

pub(crate) fn build_args(handle: &Handle) -> Result<ActionArgs, Halt> {
    let (params, snapshot) = read_ctx(handle, |ctx| (ctx.params.clone(), ctx.snapshot()))?;
    Ok(ActionArgs {
        params,
        ctx: snapshot,
        handle: handle.clone(),
    })
}

pub(crate) fn push_output(results: &mut Vec<Outcome>, output: ActionOutput) {
    match output {
        ActionOutput::None => {}
        ActionOutput::Value(value) => results.push(Outcome::Value(value)),
        ActionOutput::Many(outcomes) => results.extend(outcomes),
    }
}

pub(crate) fn push_failure(results: &mut Vec<Outcome>, failure: ActionFailure) {
    match failure {
        ActionFailure::Message(message) => results.push(Outcome::Failure(message)),
        ActionFailure::Results(outcomes) => results.extend(outcomes),
    }
}

/// Folds a child walk's error into this context's result sequence. Child
/// failures arrive with their own accumulated history, which is
/// concatenated; structural errors are recorded as one failure entry.
pub(crate) fn absorb_engine_err(handle: &Handle, walk: Walk, err: EngineError) -> StepResult {
    write_ctx(handle, |ctx| {
        let results = walk.results_mut(ctx);
        match err {
            EngineError::Execution(outcomes) | EngineError::Undo(outcomes) => {
                results.extend(outcomes);
            }
            other => results.push(Outcome::Failure(other.to_string())),
        }
    })
}
