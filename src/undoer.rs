//! The undo walk: the exact mirror of the order in which exec-phase work
//! succeeded.
//!
//! The walk consults the context's phase flags and touches only the phases
//! that actually ran: the after child undoes before the user action, the
//! user action before the before child, and the grafted during-composites
//! unwind around each phase in the positions they were captured in. Hooks
//! fire at every point regardless of flags, undo-only before shared,
//! mirroring the exec walk's hook order.

use crate::errors::{EngineError, EngineResult};
use crate::executor::{
    absorb_engine_err, build_args, push_failure, push_output, read_ctx, write_ctx, Halt,
    StepResult, Walk,
};
use crate::context::DuringSlot;
use crate::handle::Handle;
use crate::hooks::HookPoint;
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;
use tracing::{debug, warn};

pub(crate) async fn run_undo(handle: Handle, policy: RetryPolicy) -> EngineResult<Vec<Outcome>> {
    let op = handle.operation().clone();
    let id = handle.exec_id().clone();

    op.with_ctx(&id, |ctx| {
        if ctx.undoing {
            return Err(EngineError::Conflict(format!(
                "{} is already undoing",
                ctx.exec_id
            )));
        }
        if ctx.executing {
            return Err(EngineError::Conflict(format!("{} is executing", ctx.exec_id)));
        }
        Ok(())
    })??;

    op.with_ctx_mut(&id, |ctx| {
        ctx.undoing = true;
        ctx.policy = policy.clone();
    })?;
    debug!(op = %op.name(), exec_id = %id, "undo walk started");

    let walk = undo_phases(&handle, &policy).await;

    let results = op.with_ctx_mut(&id, |ctx| {
        ctx.undoing = false;
        ctx.undo_results.clone()
    })?;

    match walk {
        Ok(()) => {
            debug!(op = %op.name(), exec_id = %id, outcomes = results.len(), "undo walk completed");
            Ok(results)
        }
        Err(Halt) => {
            warn!(op = %op.name(), exec_id = %id, outcomes = results.len(), "undo walk failed");
            Err(EngineError::Undo(results))
        }
    }
}

async fn undo_phases(handle: &Handle, policy: &RetryPolicy) -> StepResult {
    fire_undo_hooks(handle, HookPoint::PostAfter).await?;
    undo_graft(handle, policy, DuringSlot::After, false).await?;
    undo_child(handle, policy, false).await?;
    undo_graft(handle, policy, DuringSlot::After, true).await?;

    fire_undo_hooks(handle, HookPoint::PreAfter).await?;
    fire_undo_hooks(handle, HookPoint::PostDuring).await?;
    undo_graft(handle, policy, DuringSlot::During, false).await?;
    run_undo_attempt_loop(handle, policy).await?;
    undo_graft(handle, policy, DuringSlot::During, true).await?;

    fire_undo_hooks(handle, HookPoint::PreDuring).await?;
    fire_undo_hooks(handle, HookPoint::PostBefore).await?;
    undo_graft(handle, policy, DuringSlot::Before, false).await?;
    undo_child(handle, policy, true).await?;
    undo_graft(handle, policy, DuringSlot::Before, true).await?;

    fire_undo_hooks(handle, HookPoint::PreBefore).await?;
    Ok(())
}

/// Undoes the child recorded at one position of a during-composite.
/// `before_position` selects the composite's before slot (grafts captured
/// while the phase's own work was still unfinished).
async fn undo_graft(
    handle: &Handle,
    policy: &RetryPolicy,
    slot: DuringSlot,
    before_position: bool,
) -> StepResult {
    let composite = read_ctx(handle, |ctx| ctx.during.get(slot).cloned())?;
    let Some(composite) = composite else { return Ok(()) };

    let child = read_ctx(&composite, |ctx| {
        if before_position {
            ctx.before_child.clone()
        } else {
            ctx.after_child.clone()
        }
    })?;
    let Some(child) = child else { return Ok(()) };

    debug!(
        exec_id = %handle.exec_id(),
        child = %child.exec_id(),
        slot = slot.label(),
        before_position,
        "undoing grafted child"
    );
    match child.undo_with(policy.clone()).await {
        Ok(results) => write_ctx(handle, |ctx| ctx.undo_results.extend(results)),
        Err(err) => {
            absorb_engine_err(handle, Walk::Undo, err)?;
            Err(Halt)
        }
    }
}

async fn undo_child(handle: &Handle, policy: &RetryPolicy, before: bool) -> StepResult {
    let child = read_ctx(handle, |ctx| {
        let executed = if before {
            ctx.phases.before_child_executed
        } else {
            ctx.phases.after_child_executed
        };
        if executed {
            if before {
                ctx.before_child.clone()
            } else {
                ctx.after_child.clone()
            }
        } else {
            None
        }
    })?;
    let Some(child) = child else { return Ok(()) };

    debug!(
        exec_id = %handle.exec_id(),
        child = %child.exec_id(),
        slot = if before { "before" } else { "after" },
        "undoing child subtree"
    );
    match child.undo_with(policy.clone()).await {
        Ok(results) => write_ctx(handle, |ctx| ctx.undo_results.extend(results)),
        Err(err) => {
            absorb_engine_err(handle, Walk::Undo, err)?;
            Err(Halt)
        }
    }
}

async fn run_undo_attempt_loop(handle: &Handle, policy: &RetryPolicy) -> StepResult {
    let ran = read_ctx(handle, |ctx| {
        ctx.phases.exec_function_executed && ctx.phases.exec_function_succeeded
    })?;
    let Some(undo_fn) = handle.operation().undo_fn() else {
        return Ok(());
    };
    if !ran {
        // no undo for work that never happened
        return Ok(());
    }

    let clock = handle.operation().clock();
    let tries = policy.num_tries.max(1);
    let mut succeeded = false;

    for attempt in 0..tries {
        write_ctx(handle, |ctx| ctx.phases.undo_function_attempt = attempt)?;
        fire_undo_hooks(handle, HookPoint::PreDuringTry).await?;

        let args = build_args(handle)?;
        match undo_fn(args).await {
            Ok(output) => {
                write_ctx(handle, |ctx| {
                    push_output(&mut ctx.op_undo_results, output);
                    ctx.phases.undo_function_succeeded = true;
                })?;
                succeeded = true;
            }
            Err(failure) => {
                warn!(exec_id = %handle.exec_id(), attempt, %failure, "user undo attempt failed");
                write_ctx(handle, |ctx| push_failure(&mut ctx.op_undo_results, failure))?;
                if attempt + 1 < tries {
                    clock.delay(policy.delay_for_attempt(attempt)).await;
                }
            }
        }

        fire_undo_hooks(handle, HookPoint::PostDuringTry).await?;
        if succeeded {
            break;
        }
    }

    write_ctx(handle, |ctx| {
        let buffered = std::mem::take(&mut ctx.op_undo_results);
        ctx.undo_results.extend(buffered);
    })?;

    if succeeded {
        Ok(())
    } else {
        Err(Halt)
    }
}

async fn fire_undo_hooks(handle: &Handle, point: HookPoint) -> StepResult {
    for hook in handle.operation().hooks().for_undo(point) {
        debug!(exec_id = %handle.exec_id(), point = point.label(), "firing undo hook");
        let args = build_args(handle)?;
        match hook(args).await {
            Ok(output) => write_ctx(handle, |ctx| {
                push_output(Walk::Undo.results_mut(ctx), output);
            })?,
            Err(failure) => {
                warn!(exec_id = %handle.exec_id(), point = point.label(), %failure, "undo hook failed");
                write_ctx(handle, |ctx| {
                    push_failure(Walk::Undo.results_mut(ctx), failure);
                })?;
                return Err(Halt);
            }
        }
    }
    Ok(())
}
