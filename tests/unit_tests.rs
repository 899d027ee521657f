use payroll_dtf::providers::HistoryStore;
use payroll_dtf::providers::fs::FsHistoryStore;
use payroll_dtf::providers::in_memory::InMemoryHistoryStore;
use payroll_dtf::runtime::{self, ActivityRegistry, IdReusePolicy, OrchestrationStatus, StartError};
use payroll_dtf::{Action, Event, Executor, OrchestrationContext, OrchestrationRegistry, join_all, pending_actions, run_turn};
use std::sync::Arc;
use std::time::Duration;

// Single-turn emission: one action per scheduled future, with its schedule event recorded.
#[test]
fn first_turn_emits_one_activity_action() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        unreachable!()
    };

    let (hist_after, actions, out) = run_turn(Vec::new(), orchestrator).unwrap();
    assert!(out.is_none(), "must not complete in first turn");
    assert_eq!(actions.len(), 1, "exactly one action expected");
    match &actions[0] {
        Action::CallActivity { name, input, .. } => {
            assert_eq!(name, "A");
            assert_eq!(input, "1");
        }
        _ => panic!("unexpected action kind"),
    }
    assert!(matches!(hist_after[0], Event::ActivityScheduled { .. }));
}

// A recorded completion resolves the future without new actions.
#[test]
fn recorded_completion_resolves_without_actions() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "1".into(),
            timeout_ms: None,
        },
        Event::ActivityCompleted {
            id: 1,
            result: "ok".into(),
        },
    ];
    let orchestrator = |ctx: OrchestrationContext| async move { ctx.schedule_activity("A", "1").into_activity().await };
    let (_, actions, out) = run_turn(history, orchestrator).unwrap();
    assert!(actions.is_empty());
    assert_eq!(out.unwrap(), Ok("ok".to_string()));
}

// Code that schedules something other than what history recorded is rejected.
#[test]
fn schedule_mismatch_is_nondeterministic() {
    let history = vec![Event::ActivityScheduled {
        id: 1,
        name: "A".into(),
        input: "1".into(),
        timeout_ms: None,
    }];
    let orchestrator = |ctx: OrchestrationContext| async move { ctx.schedule_activity("B", "1").into_activity().await };
    let err = run_turn(history, orchestrator).unwrap_err();
    assert!(err.contains("nondeterministic"), "unexpected error: {err}");
}

// A recorded schedule the code no longer makes is reported once the turn stalls.
#[test]
fn dropped_schedule_is_nondeterministic() {
    let scheduled = |id: u64, name: &str| Event::ActivityScheduled {
        id,
        name: name.into(),
        input: "1".into(),
        timeout_ms: None,
    };
    let history = vec![scheduled(1, "A"), scheduled(2, "B")];
    let orchestrator = |ctx: OrchestrationContext| async move { ctx.schedule_activity("A", "1").into_activity().await };
    let err = run_turn(history, orchestrator).unwrap_err();
    assert!(err.contains("never scheduled"), "unexpected error: {err}");
}

// Timer delays are not part of the replay match.
#[test]
fn timer_delay_change_still_replays() {
    let history = vec![
        Event::TimerCreated { id: 1, delay_ms: 5 },
        Event::TimerFired { id: 1 },
    ];
    let orchestrator = |ctx: OrchestrationContext| async move {
        ctx.schedule_timer(Duration::from_millis(50)).into_timer().await;
        "done"
    };
    let (_, actions, out) = run_turn(history, orchestrator).unwrap();
    assert!(actions.is_empty());
    assert_eq!(out, Some("done"));
}

// Completions are handed out in history order, even across joined branches.
#[test]
fn completions_are_consumed_in_history_order() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let order = std::sync::Mutex::new(Vec::new());
        let branch = |name: &'static str| {
            let ctx = ctx.clone();
            let order = &order;
            async move {
                ctx.schedule_activity(name, "").into_activity().await.unwrap();
                order.lock().unwrap().push(name);
            }
        };
        join_all(vec![branch("A"), branch("B")]).await;
        order.into_inner().unwrap()
    };
    // B finished first in the live run
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "".into(),
            timeout_ms: None,
        },
        Event::ActivityScheduled {
            id: 2,
            name: "B".into(),
            input: "".into(),
            timeout_ms: None,
        },
        Event::ActivityCompleted {
            id: 2,
            result: "b".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "a".into(),
        },
    ];
    let (_, actions, out) = run_turn(history, orchestrator).unwrap();
    assert!(actions.is_empty());
    assert_eq!(out.unwrap(), vec!["B", "A"]);
}

// A result is held back until every branch has reclaimed the schedules
// recorded before it, so a fast branch cannot schedule ahead of a sibling.
#[test]
fn branch_waits_for_sibling_to_reclaim_earlier_schedule() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let branch = |name: &'static str| {
            let ctx = ctx.clone();
            async move {
                ctx.schedule_activity("Schedule", name).into_activity().await.unwrap();
                ctx.schedule_activity("Check", name).into_activity().await.unwrap()
            }
        };
        join_all(vec![branch("A"), branch("B"), branch("C")]).await
    };
    let scheduled = |id: u64, name: &str, input: &str| Event::ActivityScheduled {
        id,
        name: name.into(),
        input: input.into(),
        timeout_ms: None,
    };
    let completed = |id: u64, result: &str| Event::ActivityCompleted {
        id,
        result: result.into(),
    };
    // Live run: the three results arrived in separate turns, each followed
    // by the next step of the branch that took it
    let history = vec![
        scheduled(1, "Schedule", "A"),
        scheduled(2, "Schedule", "B"),
        scheduled(3, "Schedule", "C"),
        completed(2, "ok"),
        scheduled(4, "Check", "B"),
        completed(1, "ok"),
        scheduled(5, "Check", "A"),
        completed(4, "b"),
        completed(3, "ok"),
        scheduled(6, "Check", "C"),
        completed(6, "c"),
        completed(5, "a"),
    ];
    let (replayed, actions, out) = run_turn(history.clone(), orchestrator).unwrap();
    assert!(actions.is_empty());
    assert_eq!(replayed, history);
    assert_eq!(out.unwrap(), vec!["a", "b", "c"]);
}

// Logging follows whether the result that led to the code is new this turn.
#[test]
fn results_new_this_turn_are_logged_for_every_branch() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "".into(),
            timeout_ms: None,
        },
        Event::ActivityScheduled {
            id: 2,
            name: "B".into(),
            input: "".into(),
            timeout_ms: None,
        },
        Event::ActivityCompleted {
            id: 1,
            result: "a".into(),
        },
        Event::ActivityCompleted {
            id: 2,
            result: "b".into(),
        },
    ];
    let logging_after_each = |seen_len: usize| {
        let orchestrator = |ctx: OrchestrationContext| async move {
            let before = ctx.is_logging_enabled();
            let branch = |name: &'static str| {
                let ctx = ctx.clone();
                async move {
                    ctx.schedule_activity(name, "").into_activity().await.unwrap();
                    ctx.is_logging_enabled()
                }
            };
            let mut seen = vec![before];
            seen.extend(join_all(vec![branch("A"), branch("B")]).await);
            seen
        };
        let (_, _, out) = payroll_dtf::run_turn_with("i", history.clone(), seen_len, 1, orchestrator).unwrap();
        out.unwrap()
    };
    // Both results arrived since the last turn
    assert_eq!(logging_after_each(2), vec![false, true, true]);
    // Only B's result is new
    assert_eq!(logging_after_each(3), vec![false, false, true]);
    // Everything was already acted on
    assert_eq!(logging_after_each(4), vec![false, false, false]);
    // A first turn is live from the start
    assert_eq!(logging_after_each(0), vec![true, true, true]);
}

// A child orchestration is started as soon as it is scheduled.
#[test]
fn sub_orchestration_is_claimed_at_creation() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let _child = ctx.schedule_sub_orchestration("Child", "x");
        ctx.schedule_activity("A", "1").into_activity().await
    };
    let (history, actions, out) = payroll_dtf::run_turn_with("parent", Vec::new(), 0, 0, orchestrator).unwrap();
    assert!(out.is_none());
    assert_eq!(actions.len(), 2);
    match &actions[0] {
        Action::StartSubOrchestration { id, name, instance, .. } => {
            assert_eq!(*id, 1);
            assert_eq!(name, "Child");
            assert_eq!(instance, "parent::Child");
        }
        other => panic!("expected child start first, got {other:?}"),
    }
    assert!(matches!(history[0], Event::SubOrchestrationScheduled { .. }));
}

// Child ids come from the parent id and the child's name, not from
// correlation ids, so a re-run that retried more often addresses the same child.
#[test]
fn child_ids_do_not_depend_on_correlation_ids() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        while ctx.schedule_activity("Check", "").into_activity().await.is_err() {}
        let _first = ctx.schedule_sub_orchestration("Child", "1");
        let _second = ctx.schedule_sub_orchestration("Child", "2");
        ctx.schedule_timer(Duration::from_secs(1)).into_timer().await;
    };
    let child_ids = |history: Vec<Event>| {
        let (_, actions, _) = payroll_dtf::run_turn_with("parent", history, 0, 0, orchestrator).unwrap();
        actions
            .into_iter()
            .filter_map(|a| match a {
                Action::StartSubOrchestration { instance, .. } => Some(instance),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    let check = |id: u64| Event::ActivityScheduled {
        id,
        name: "Check".into(),
        input: "".into(),
        timeout_ms: None,
    };
    let first_try = vec![check(1), Event::ActivityCompleted { id: 1, result: "".into() }];
    let after_retry = vec![
        check(1),
        Event::ActivityFailed { id: 1, error: "busy".into() },
        check(2),
        Event::ActivityCompleted { id: 2, result: "".into() },
    ];
    assert_eq!(child_ids(first_try), vec!["parent::Child", "parent::Child::2"]);
    assert_eq!(child_ids(after_retry), vec!["parent::Child", "parent::Child::2"]);
}

// Only scheduled work without a completion is re-derived.
#[test]
fn pending_actions_skip_completed_and_terminal() {
    let mut history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "1".into(),
            timeout_ms: Some(100),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "ok".into(),
        },
        Event::TimerCreated { id: 2, delay_ms: 10 },
    ];
    let pending = pending_actions(&history);
    assert_eq!(pending, vec![Action::CreateTimer { id: 2, delay_ms: 10 }]);

    history.push(Event::OrchestrationFailed { error: "x".into() });
    assert!(pending_actions(&history).is_empty());
}

// The executor reports a stall when the host has nothing to add.
#[test]
fn executor_reports_stall() {
    let (history, out) = Executor::drive_to_completion(
        Vec::new(),
        |ctx: OrchestrationContext| async move { ctx.schedule_activity("A", "1").into_activity().await },
        |_actions, _history| {},
    )
    .unwrap();
    assert!(out.is_none());
    assert_eq!(history.len(), 1);
}

// Deterministic replay of a runtime-driven run.
#[tokio::test]
async fn runtime_replays_an_activity_chain() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "2").into_activity().await.unwrap();
        format!("a={a}")
    };

    let activity_registry = ActivityRegistry::builder()
        .register("A", |input: String| async move {
            Ok(input.parse::<i32>().unwrap_or(0).saturating_add(1).to_string())
        })
        .build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("TestOrchestration", move |ctx, _input| async move { Ok(orchestrator(ctx).await) })
        .build();

    let rt = runtime::Runtime::start(Arc::new(activity_registry), orchestration_registry).await;
    rt.start_orchestration("inst-unit-1", "TestOrchestration", "").await.unwrap();
    let status = rt.wait_for_orchestration("inst-unit-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "a=3".into() });

    let final_history = rt.get_execution_history("inst-unit-1").await;
    let (_, acts, out) = run_turn(final_history, orchestrator).unwrap();
    assert!(acts.is_empty());
    assert_eq!(out.unwrap(), "a=3");
    rt.shutdown().await;
}

async fn store_round_trip(store: &dyn HistoryStore) {
    let eid = store.create_new_execution("i1", "Orch", "in", None).await.unwrap();
    assert_eq!(eid, 1);
    store
        .append(
            "i1",
            vec![
                Event::TimerCreated { id: 1, delay_ms: 10 },
                Event::TimerFired { id: 1 },
            ],
        )
        .await
        .unwrap();
    // A redelivered completion is absorbed
    store.append("i1", vec![Event::TimerFired { id: 1 }]).await.unwrap();
    assert_eq!(store.read("i1").await.len(), 3);

    let second = store.create_new_execution("i1", "Orch", "again", None).await.unwrap();
    assert_eq!(second, 2);
    assert_eq!(store.list_executions("i1").await, vec![1, 2]);
    assert_eq!(store.read("i1").await.len(), 1);
    assert_eq!(store.read_with_execution("i1", 1).await.len(), 3);

    assert!(store.append("missing", vec![]).await.is_err());
    assert!(store.list_instances().await.contains(&"i1".to_string()));
    assert!(store.dump_all_pretty().await.contains("instance=i1"));
    store.remove_instance("i1").await.unwrap();
    assert!(store.remove_instance("i1").await.is_err());
    assert!(store.read("i1").await.is_empty());
}

// Both stores honour the same contract.
#[tokio::test]
async fn history_stores_round_trip() {
    store_round_trip(&InMemoryHistoryStore::default()).await;
    let tmp = tempfile::tempdir().unwrap();
    store_round_trip(&FsHistoryStore::new(tmp.path(), true)).await;
}

#[tokio::test]
async fn fs_store_enforces_history_cap() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new_with_cap(tmp.path(), true, 3);
    store.create_new_execution("capped", "Orch", "", None).await.unwrap();
    store
        .append("capped", vec![Event::TimerCreated { id: 1, delay_ms: 1 }])
        .await
        .unwrap();
    let err = store
        .append(
            "capped",
            vec![Event::TimerFired { id: 1 }, Event::TimerCreated { id: 2, delay_ms: 1 }],
        )
        .await
        .unwrap_err();
    assert!(err.contains("history cap exceeded"), "unexpected error: {err}");
}

#[tokio::test]
async fn status_tracks_running_completed_and_failed() {
    let activity_registry = ActivityRegistry::builder().build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("ShortTimer", |ctx, _| async move {
            ctx.schedule_timer(Duration::from_millis(10)).into_timer().await;
            Ok("ok".to_string())
        })
        .register("AlwaysFails", |_ctx, _| async move { Err("boom".to_string()) })
        .build();
    let rt = runtime::Runtime::start(Arc::new(activity_registry), orchestration_registry).await;

    assert_eq!(rt.get_orchestration_status("nope").await, OrchestrationStatus::NotFound);

    rt.start_orchestration("inst-ok", "ShortTimer", "").await.unwrap();
    assert_eq!(rt.get_orchestration_status("inst-ok").await, OrchestrationStatus::Running);
    let done = rt.wait_for_orchestration("inst-ok", Duration::from_secs(5)).await.unwrap();
    assert_eq!(done, OrchestrationStatus::Completed { output: "ok".into() });

    rt.start_orchestration("inst-fail", "AlwaysFails", "").await.unwrap();
    let failed = rt.wait_for_orchestration("inst-fail", Duration::from_secs(5)).await.unwrap();
    assert_eq!(failed, OrchestrationStatus::Failed { error: "boom".into() });

    assert!(matches!(
        rt.start_orchestration("inst-x", "Unknown", "").await,
        Err(StartError::Unregistered(_))
    ));
    rt.shutdown().await;
}

#[tokio::test]
async fn id_reuse_policies() {
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("Echo", |_ctx, input: String| async move {
            if input == "fail" { Err("asked to fail".to_string()) } else { Ok(input) }
        })
        .register("Slow", |ctx, _| async move {
            ctx.schedule_timer(Duration::from_secs(60)).into_timer().await;
            Ok("late".to_string())
        })
        .build();
    let rt = runtime::Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestration_registry).await;

    // Default: a failed run may be retried, a completed one may not
    rt.start_orchestration("echo", "Echo", "fail").await.unwrap();
    rt.wait_for_orchestration("echo", Duration::from_secs(5)).await.unwrap();
    assert_eq!(rt.start_orchestration("echo", "Echo", "ok").await.unwrap(), 2);
    rt.wait_for_orchestration("echo", Duration::from_secs(5)).await.unwrap();
    assert!(matches!(
        rt.start_orchestration("echo", "Echo", "again").await,
        Err(StartError::AlreadyCompleted(_))
    ));
    assert!(matches!(
        rt.start_orchestration_with_policy("echo", "Echo", "x", IdReusePolicy::RejectDuplicate).await,
        Err(StartError::Exists(_))
    ));
    assert_eq!(rt.list_executions("echo").await, vec![1, 2]);

    // Running: rejected by default, replaced under TerminateIfRunning
    rt.start_orchestration("slow", "Slow", "").await.unwrap();
    assert!(matches!(
        rt.start_orchestration("slow", "Slow", "").await,
        Err(StartError::AlreadyRunning(_))
    ));
    let second = rt
        .start_orchestration_with_policy("slow", "Slow", "", IdReusePolicy::TerminateIfRunning)
        .await
        .unwrap();
    assert_eq!(second, 2);
    match rt.get_orchestration_status_with_execution("slow", 1).await {
        OrchestrationStatus::Failed { error } => assert!(error.starts_with("canceled: "), "{error}"),
        other => panic!("first execution should be canceled, got {other:?}"),
    }
    assert_eq!(rt.get_orchestration_status("slow").await, OrchestrationStatus::Running);
    rt.shutdown().await;
}
