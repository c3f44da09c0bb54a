//! End-to-end scenarios for the traversal engine: sequential chains,
//! before-slot rotation, retries, dynamic grafts, parallel fanout, and undo
//! after partial failure.

use crate::action::{action, async_action, ActionFailure, ActionOutput};
use crate::errors::EngineError;
use crate::handle::ChildSpec;
use crate::hooks::HookPoint;
use crate::operation::Operation;
use crate::outcome::Outcome;
use crate::parallel::group;
use crate::retry::RetryPolicy;
use crate::testing::{adder, Accumulator, MockClock, Probe, SequenceIdSource};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An operation that records its params on exec and `undo-<params>` on
/// undo, for asserting traversal order.
fn recorder(probe: &Probe) -> Operation {
    let exec_probe = probe.clone();
    let undo_probe = probe.clone();
    Operation::builder()
        .name("recorder")
        .exec(action(move |args| {
            exec_probe.record(args.params.as_str().unwrap_or("?").to_string());
            Ok(ActionOutput::None)
        }))
        .undo(action(move |args| {
            undo_probe.record(format!("undo-{}", args.params.as_str().unwrap_or("?")));
            Ok(ActionOutput::None)
        }))
        .build()
}

#[tokio::test]
async fn sequential_chain_accumulates_in_order() {
    let acc = Accumulator::new();
    let op = adder(&acc);

    let root = op.create(json!(1));
    root.add_child(op.create(json!(1))).unwrap();
    root.add_child(op.create(json!(1))).unwrap();

    let results = root.exec().await.unwrap();

    assert_eq!(acc.get(), 3);
    assert_eq!(
        results,
        vec![
            Outcome::Value(json!({"newValue": 1})),
            Outcome::Value(json!({"newValue": 2})),
            Outcome::Value(json!({"newValue": 3})),
        ]
    );
}

#[tokio::test]
async fn before_children_execute_newest_first() {
    let probe = Probe::new();
    let op = recorder(&probe);

    let root = op.create(json!("root"));
    root.add_child_before(op.create(json!("A"))).unwrap();
    root.add_child_before(op.create(json!("B"))).unwrap();

    root.exec().await.unwrap();

    assert_eq!(probe.events(), vec!["B", "A", "root"]);
}

#[tokio::test]
async fn retry_succeeds_on_second_attempt() {
    let acc = Accumulator::new();
    let clock = MockClock::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let exec_acc = acc.clone();
    let exec_calls = calls.clone();
    let undo_acc = acc.clone();
    let op = Operation::builder()
        .name("flaky-adder")
        .clock(Arc::new(clock.clone()))
        .exec(action(move |args| {
            let n = args.params.as_i64().unwrap_or(0);
            if exec_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ActionFailure::message("transient"))
            } else {
                Ok(ActionOutput::value(json!({"newValue": exec_acc.add(n)})))
            }
        }))
        .undo(action(move |args| {
            let n = args.params.as_i64().unwrap_or(0);
            Ok(ActionOutput::value(json!({"newValue": undo_acc.sub(n)})))
        }))
        .build();

    let handle = op.create(json!(5));
    let results = handle
        .exec_with(RetryPolicy::new(2, Duration::from_millis(10)))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(clock.delays(), vec![Duration::from_millis(10)]);
    assert_eq!(acc.get(), 5);
    assert_eq!(
        results,
        vec![
            Outcome::Failure("transient".to_string()),
            Outcome::Value(json!({"newValue": 5})),
        ]
    );

    let snapshot = handle.get_context().unwrap();
    assert_eq!(snapshot.phases.exec_function_attempt, 1);
    assert!(snapshot.phases.exec_function_succeeded);
}

#[tokio::test]
async fn graft_runs_before_user_action_and_unwinds_between_it_and_before_child() {
    let probe = Probe::new();
    let op = recorder(&probe);

    let graft = op.create(json!("G"));
    let staged = Arc::new(AtomicBool::new(false));

    let hook_graft = graft.clone();
    let hook_probe = probe.clone();
    let undo_probe = probe.clone();
    let root_op = Operation::builder()
        .name("graft-root")
        .exec(action({
            let probe = probe.clone();
            move |_| {
                probe.record("root");
                Ok(ActionOutput::None)
            }
        }))
        .undo(action(move |_| {
            undo_probe.record("undo-root");
            Ok(ActionOutput::None)
        }))
        .exec_hook(
            HookPoint::PreDuring,
            action(move |args| {
                if !staged.swap(true, Ordering::SeqCst) {
                    args.handle
                        .add_child(hook_graft.clone())
                        .map_err(|err| ActionFailure::message(err.to_string()))?;
                    hook_probe.record("staged");
                }
                Ok(ActionOutput::None)
            }),
        )
        .build();

    let root = root_op.create(json!(null));
    root.add_child_before(op.create(json!("BC"))).unwrap();

    root.exec().await.unwrap();
    assert_eq!(probe.events(), vec!["BC", "staged", "G", "root"]);

    probe.clear();
    root.undo().await.unwrap();
    assert_eq!(probe.events(), vec!["undo-root", "undo-G", "undo-BC"]);
}

#[tokio::test]
async fn parallel_fanout_runs_every_child() {
    let acc = Accumulator::new();
    let op = adder(&acc);

    let composite = group(vec![
        op.create(json!(1)),
        op.create(json!(2)),
        op.create(json!(3)),
    ])
    .unwrap();

    let results = composite.exec().await.unwrap();

    assert_eq!(acc.get(), 6);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|outcome| !outcome.is_failure()));
}

#[tokio::test]
async fn parallel_failure_still_runs_and_reports_every_child() {
    let acc = Accumulator::new();
    let op = adder(&acc);
    let failing_calls = Arc::new(AtomicUsize::new(0));

    let calls = failing_calls.clone();
    let failing = Operation::builder()
        .name("failing")
        .exec(action(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ActionFailure::message("child failed"))
        }))
        .build();

    let composite = group(vec![
        op.create(json!(1)),
        failing.create(json!(null)),
        op.create(json!(3)),
    ])
    .unwrap();

    let err = composite.exec().await.unwrap_err();
    let outcomes = err.into_outcomes().unwrap();

    // every child ran exactly once and every child's outcome is present
    assert_eq!(acc.get(), 4);
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes.iter().filter(|o| o.is_failure()).count(), 1);

    // undoing the composite rolls back the children that did run
    composite.undo().await.unwrap();
    assert_eq!(acc.get(), 0);
}

#[tokio::test]
async fn undo_after_partial_failure_restores_initial_state() {
    let acc = Accumulator::new();

    let exec_acc = acc.clone();
    let undo_acc = acc.clone();
    let capped = Operation::builder()
        .name("capped-adder")
        .exec(action(move |args| {
            let n = args.params.as_i64().unwrap_or(0);
            if exec_acc.get() + n >= 3 {
                return Err(ActionFailure::message("limit reached"));
            }
            Ok(ActionOutput::value(json!({"newValue": exec_acc.add(n)})))
        }))
        .undo(action(move |args| {
            let n = args.params.as_i64().unwrap_or(0);
            Ok(ActionOutput::value(json!({"newValue": undo_acc.sub(n)})))
        }))
        .build();

    let root = capped.create(json!(1));
    root.add_child(capped.create(json!(1))).unwrap();
    root.add_child(capped.create(json!(1))).unwrap();
    root.add_child(capped.create(json!(1))).unwrap();

    let err = root.exec().await.unwrap_err();
    let outcomes = err.into_outcomes().unwrap();
    assert_eq!(
        outcomes,
        vec![
            Outcome::Value(json!({"newValue": 1})),
            Outcome::Value(json!({"newValue": 2})),
            Outcome::Failure("limit reached".to_string()),
        ]
    );
    assert_eq!(acc.get(), 2);

    // only the two that succeeded are undone, in reverse
    let undo_results = root.undo().await.unwrap();
    assert_eq!(acc.get(), 0);
    assert_eq!(
        undo_results,
        vec![
            Outcome::Value(json!({"newValue": 1})),
            Outcome::Value(json!({"newValue": 0})),
        ]
    );
}

#[tokio::test]
async fn exec_invoked_exactly_k_times_and_undo_at_most_once() {
    let exec_calls = Arc::new(AtomicUsize::new(0));
    let undo_calls = Arc::new(AtomicUsize::new(0));
    let clock = MockClock::new();

    let e = exec_calls.clone();
    let u = undo_calls.clone();
    let op = Operation::builder()
        .clock(Arc::new(clock.clone()))
        .exec(action(move |_| {
            if e.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ActionFailure::message("not yet"))
            } else {
                Ok(ActionOutput::value(json!("done")))
            }
        }))
        .undo(action(move |_| {
            u.fetch_add(1, Ordering::SeqCst);
            Ok(ActionOutput::None)
        }))
        .build();

    let handle = op.create(json!(null));
    handle
        .exec_with(RetryPolicy::new(5, Duration::from_millis(1)))
        .await
        .unwrap();

    assert_eq!(exec_calls.load(Ordering::SeqCst), 3);
    assert_eq!(clock.delay_count(), 2);

    handle.undo().await.unwrap();
    assert_eq!(undo_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undo_retries_with_delay_between_attempts() {
    let clock = MockClock::new();
    let undo_calls = Arc::new(AtomicUsize::new(0));

    let u = undo_calls.clone();
    let op = Operation::builder()
        .clock(Arc::new(clock.clone()))
        .exec(action(|_| Ok(ActionOutput::value(json!("did it")))))
        .undo(action(move |_| {
            if u.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ActionFailure::message("undo hiccup"))
            } else {
                Ok(ActionOutput::value(json!("undone")))
            }
        }))
        .build();

    let handle = op.create(json!(null));
    handle.exec().await.unwrap();

    let undo_results = handle
        .undo_with(RetryPolicy::new(2, Duration::from_millis(7)))
        .await
        .unwrap();

    assert_eq!(undo_calls.load(Ordering::SeqCst), 2);
    assert_eq!(clock.delays(), vec![Duration::from_millis(7)]);
    assert_eq!(
        undo_results,
        vec![
            Outcome::Failure("undo hiccup".to_string()),
            Outcome::Value(json!("undone")),
        ]
    );

    let snapshot = handle.get_context().unwrap();
    assert_eq!(snapshot.phases.undo_function_attempt, 1);
    assert!(snapshot.phases.undo_function_succeeded);
}

#[tokio::test]
async fn reset_keeps_structure_and_params() {
    let acc = Accumulator::new();
    let op = adder(&acc);

    let root = op.create(json!(2));
    let child = op.create(json!(3));
    root.add_child(child.clone()).unwrap();

    root.exec().await.unwrap();
    assert_eq!(acc.get(), 5);

    root.reset().unwrap();

    let snapshot = root.get_context().unwrap();
    assert_eq!(snapshot.params, json!(2));
    assert_eq!(snapshot.after_child.as_ref(), Some(child.exec_id()));
    assert!(snapshot.exec_results.is_empty());
    assert!(!snapshot.phases.is_completed());

    let child_snapshot = child.get_context().unwrap();
    assert!(child_snapshot.exec_results.is_empty());
    assert!(!child_snapshot.phases.exec_function_executed);
}

#[tokio::test]
async fn undo_order_is_strict_reverse_of_exec_order() {
    let probe = Probe::new();
    let op = recorder(&probe);

    let root = op.create(json!("root"));
    root.add_child(op.create(json!("A"))).unwrap();
    root.add_child(op.create(json!("B"))).unwrap();
    root.add_child_before(op.create(json!("pre"))).unwrap();

    root.exec().await.unwrap();
    assert_eq!(probe.events(), vec!["pre", "root", "A", "B"]);

    probe.clear();
    root.undo().await.unwrap();
    assert_eq!(probe.events(), vec!["undo-B", "undo-A", "undo-root", "undo-pre"]);
}

#[tokio::test]
async fn trailing_try_hook_fires_on_successful_attempt() {
    let probe = Probe::new();

    let hook_probe = probe.clone();
    let op = Operation::builder()
        .exec(action(|_| Ok(ActionOutput::value(json!(1)))))
        .exec_hook(
            HookPoint::PostDuringTry,
            action(move |_| {
                hook_probe.record("post-try");
                Ok(ActionOutput::None)
            }),
        )
        .build();

    op.create(json!(null)).exec().await.unwrap();
    assert_eq!(probe.events(), vec!["post-try"]);
}

#[tokio::test]
async fn trailing_try_hook_fires_on_every_attempt() {
    let probe = Probe::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let clock = MockClock::new();

    let hook_probe = probe.clone();
    let c = calls.clone();
    let op = Operation::builder()
        .clock(Arc::new(clock))
        .exec(action(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ActionFailure::message("again"))
            } else {
                Ok(ActionOutput::value(json!(1)))
            }
        }))
        .exec_hook(
            HookPoint::PostDuringTry,
            action(move |_| {
                hook_probe.record("post-try");
                Ok(ActionOutput::None)
            }),
        )
        .build();

    op.create(json!(null))
        .exec_with(RetryPolicy::new(2, Duration::from_millis(1)))
        .await
        .unwrap();
    assert_eq!(probe.events(), vec!["post-try", "post-try"]);
}

#[tokio::test]
async fn failed_graft_does_not_rerun_on_repeated_exec() {
    let graft_calls = Arc::new(AtomicUsize::new(0));

    let g = graft_calls.clone();
    let failing_graft_op = Operation::builder()
        .name("failing-graft")
        .exec(action(move |_| {
            g.fetch_add(1, Ordering::SeqCst);
            Err(ActionFailure::message("graft failed"))
        }))
        .build();
    let graft = failing_graft_op.create(json!(null));

    let staged = Arc::new(AtomicBool::new(false));
    let hook_graft = graft.clone();
    let op = Operation::builder()
        .exec(action(|_| Ok(ActionOutput::value(json!("root ran")))))
        .exec_hook(
            HookPoint::PreDuring,
            action(move |args| {
                if !staged.swap(true, Ordering::SeqCst) {
                    args.handle
                        .add_child(hook_graft.clone())
                        .map_err(|err| ActionFailure::message(err.to_string()))?;
                }
                Ok(ActionOutput::None)
            }),
        )
        .build();

    let root = op.create(json!(null));

    assert!(root.exec().await.is_err());
    assert_eq!(graft_calls.load(Ordering::SeqCst), 1);

    // the staging slot was cleared before the raise, so the graft cannot
    // run a second time
    root.exec().await.unwrap();
    assert_eq!(graft_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn child_collections_wrap_in_a_parallel_composite() {
    let acc = Accumulator::new();
    let op = adder(&acc);

    let root = op.create(json!(1));
    root.add_child(vec![op.create(json!(2)), op.create(json!(3))])
        .unwrap();

    let snapshot = root.get_context().unwrap();
    assert!(snapshot.after_child.is_some());

    root.exec().await.unwrap();
    assert_eq!(acc.get(), 6);
}

#[tokio::test]
async fn chain_spec_runs_sequentially() {
    let probe = Probe::new();
    let op = recorder(&probe);

    let root = op.create(json!("root"));
    root.add_child(ChildSpec::chain(vec![
        op.create(json!("c1")),
        op.create(json!("c2")),
        op.create(json!("c3")),
    ]))
    .unwrap();

    root.exec().await.unwrap();
    assert_eq!(probe.events(), vec!["root", "c1", "c2", "c3"]);
}

#[tokio::test]
async fn reentrant_exec_is_a_conflict() {
    let op = Operation::builder()
        .exec(action(|_| Ok(ActionOutput::None)))
        .exec_hook(
            HookPoint::PreDuring,
            async_action(|args| async move {
                match args.handle.exec().await {
                    Err(EngineError::Conflict(_)) => Ok(ActionOutput::None),
                    _ => Err(ActionFailure::message("expected a conflict")),
                }
            }),
        )
        .build();

    op.create(json!(null)).exec().await.unwrap();
}

#[tokio::test]
async fn reentrant_undo_is_a_conflict() {
    let op = Operation::builder()
        .exec(action(|_| Ok(ActionOutput::None)))
        .undo(action(|_| Ok(ActionOutput::None)))
        .undo_hook(
            HookPoint::PostAfter,
            async_action(|args| async move {
                match args.handle.undo().await {
                    Err(EngineError::Conflict(_)) => Ok(ActionOutput::None),
                    _ => Err(ActionFailure::message("expected a conflict")),
                }
            }),
        )
        .build();

    let handle = op.create(json!(null));
    handle.exec().await.unwrap();
    handle.undo().await.unwrap();
}

#[tokio::test]
async fn completed_context_resets_implicitly_on_reexec() {
    let acc = Accumulator::new();
    let op = adder(&acc);

    let root = op.create(json!(2));
    root.add_child(op.create(json!(2))).unwrap();

    let first = root.exec().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(acc.get(), 4);

    let second = root.exec().await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(acc.get(), 8);
}

#[tokio::test]
async fn exec_all_runs_from_the_root() {
    let probe = Probe::new();
    let op = recorder(&probe);

    let root = op.create(json!("root"));
    let leaf = op.create(json!("leaf"));
    root.add_child(leaf.clone()).unwrap();

    leaf.exec_all().await.unwrap();
    assert_eq!(probe.events(), vec!["root", "leaf"]);

    probe.clear();
    leaf.undo_all().await.unwrap();
    assert_eq!(probe.events(), vec!["undo-leaf", "undo-root"]);
}

#[tokio::test]
async fn hook_return_values_are_appended_to_results() {
    let op = Operation::builder()
        .exec(action(|_| Ok(ActionOutput::value(json!("work")))))
        .undo(action(|_| Ok(ActionOutput::None)))
        .hook(
            HookPoint::PreBefore,
            action(|_| Ok(ActionOutput::value(json!("observed")))),
        )
        .build();

    let handle = op.create(json!(null));
    let results = handle.exec().await.unwrap();
    assert_eq!(
        results,
        vec![
            Outcome::Value(json!("observed")),
            Outcome::Value(json!("work")),
        ]
    );

    // the shared hook fires on the undo walk as well
    let undo_results = handle.undo().await.unwrap();
    assert_eq!(undo_results, vec![Outcome::Value(json!("observed"))]);
}

#[tokio::test]
async fn template_registry_resolves_history() {
    let op = Operation::builder()
        .id_source(Arc::new(SequenceIdSource::new("op")))
        .exec(action(|_| Ok(ActionOutput::value(json!(1)))))
        .build();

    let handle = op.create(json!(null));
    assert_eq!(handle.exec_id().as_str(), "op-1");

    op.exec(handle.exec_id(), RetryPolicy::default())
        .await
        .unwrap();

    let snapshot = op.get_context(handle.exec_id()).unwrap();
    assert!(snapshot.phases.is_completed());
    assert!(matches!(
        op.get(&"op-99".into()),
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn failure_raises_the_full_result_history() {
    let op = Operation::builder()
        .exec(action(|_| Err(ActionFailure::message("root failed"))))
        .build();
    let before = Operation::builder()
        .exec(action(|_| Ok(ActionOutput::value(json!("before ran")))))
        .build();

    let root = op.create(json!(null));
    root.add_child_before(before.create(json!(null))).unwrap();

    let err = root.exec().await.unwrap_err();
    let outcomes = err.into_outcomes().unwrap();
    assert_eq!(
        outcomes,
        vec![
            Outcome::Value(json!("before ran")),
            Outcome::Failure("root failed".to_string()),
        ]
    );
}
