use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use substep::config::SigMode;
use substep::context::{ExecutionContext, Vars};
use substep::error::StepError;
use substep::execute::{DispatchMode, StepExecutor, SubstepOutcome};
use substep::executor::{BodyError, BodyOutput, ShellExecutor};
use substep::signature::MemorySignatureStore;
use substep::step::{Arg, Directive, DirectiveKind, StepSpec};
use substep::target::{Target, TargetSet};
use substep::task::{LocalTaskQueue, MemoryTaskStore, TaskStore};
use substep::trace::{MemoryEventLog, Trace};

mod helpers;
use helpers::{config_in, file_names, private_slots, touch, workspace, RecordingExecutor};

struct Harness {
    engine: StepExecutor,
    exec: Arc<RecordingExecutor>,
    store: MemorySignatureStore,
    events: MemoryEventLog,
    tasks: MemoryTaskStore,
}

fn harness(dir: &Path, exec: RecordingExecutor) -> Harness {
    let exec = Arc::new(exec);
    let store = MemorySignatureStore::new();
    let events = MemoryEventLog::new();
    let tasks = MemoryTaskStore::new();
    let task_store: Arc<dyn TaskStore> = Arc::new(tasks.clone());
    let queue = Arc::new(LocalTaskQueue::new(Arc::clone(&task_store), exec.clone()));
    let engine = StepExecutor::new(config_in(dir), exec.clone())
        .with_signature_store(Arc::new(store.clone()))
        .with_event_log(Arc::new(events.clone()))
        .with_task_backend(task_store, queue)
        .with_slots(private_slots());
    Harness {
        engine,
        exec,
        store,
        events,
        tasks,
    }
}

fn single_input(concurrent: bool) -> Directive {
    let d = Directive::new(DirectiveKind::Input).option("group_by", Arg::literal("single"));
    if concurrent {
        d.option("concurrent", Arg::literal(true))
    } else {
        d
    }
}

fn out_per_input() -> Directive {
    Directive::new(DirectiveKind::Output).arg(Arg::format("{_input}.out"))
}

fn ctx_for(step: &StepSpec, inputs: &[PathBuf]) -> ExecutionContext {
    ExecutionContext::new("wf-test", &step.name).with_step_input(TargetSet::from_paths(inputs.to_vec()))
}

#[test]
fn stopped_substep_is_attempted_but_produces_nothing() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["a.txt", "b.txt", "c.txt"]);
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_behavior(|req| {
            if req.index == 1 {
                Err(BodyError::StopInputGroup(Some("skip this one".into())))
            } else {
                Ok(BodyOutput::default())
            }
        }),
    );
    let step = StepSpec::new("convert")
        .directive(single_input(false))
        .directive(out_per_input())
        .code("convert");

    let result = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .expect("stopping a substep is not an error");

    assert_eq!(result.mode, DispatchMode::Inline);
    assert_eq!(
        result.outcomes,
        vec![
            SubstepOutcome::Completed,
            SubstepOutcome::StoppedEarly(Some("skip this one".into())),
            SubstepOutcome::Completed,
        ]
    );
    assert!(result.outputs[1].is_empty());
    assert_eq!(result.substep_completed, 3);
    assert_eq!(result.substep_skipped, 0);
    assert_eq!(file_names(&result.step_output), vec!["a.txt.out", "c.txt.out"]);
    assert_eq!(h.store.write_count(), 2);
}

#[test]
fn overlapping_outputs_fail_before_the_second_body() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["a.txt", "b.txt"]);
    let shared_out = dir.path().join("merged.txt");
    let h = harness(dir.path(), RecordingExecutor::new());
    let step = StepSpec::new("merge")
        .directive(single_input(false))
        .directive(
            Directive::new(DirectiveKind::Output)
                .arg(Arg::literal(shared_out.to_string_lossy().into_owned())),
        )
        .code("merge");

    let err = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap_err();
    assert!(err.to_string().contains("already produced"), "{err}");
    assert_eq!(h.exec.call_count(), 1);
}

#[test]
fn output_naming_its_own_input_is_rejected() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["a.txt"]);
    let h = harness(dir.path(), RecordingExecutor::new());
    let step = StepSpec::new("inplace")
        .directive(Directive::new(DirectiveKind::Output).arg(Arg::var("_input")))
        .code("sed -i");

    let err = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap_err();
    assert!(err.to_string().contains("self-referential"), "{err}");
    assert_eq!(h.exec.call_count(), 0);
}

#[test]
fn concurrent_substeps_overlap_and_report_in_order() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt", "3.txt", "4.txt"]);
    let slots = private_slots();
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_delay(Duration::from_millis(100)),
    );
    let engine = h.engine.with_slots(slots.clone());
    let step = StepSpec::new("count")
        .directive(single_input(true))
        .directive(out_per_input())
        .code("wc -l {_input}");

    let result = engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap();

    assert_eq!(result.mode, DispatchMode::Concurrent);
    assert_eq!(
        file_names(&result.step_output),
        vec!["1.txt.out", "2.txt.out", "3.txt.out", "4.txt.out"]
    );
    let mut calls = h.exec.calls();
    assert_eq!(calls.len(), 4);
    calls.sort_by_key(|c| c.started);
    let overlapped = calls.windows(2).any(|w| w[1].started < w[0].finished);
    assert!(overlapped, "expected overlapping execution windows");
    assert_eq!(slots.in_use(), 0);
    assert_eq!(h.store.write_count(), 4);
}

#[test]
fn concurrent_failure_surfaces_after_all_workers_finish() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt", "3.txt"]);
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_behavior(|req| {
            if req.index == 2 {
                Err(BodyError::Failed {
                    message: "exit 3".into(),
                    line: Some(1),
                    stdout: String::new(),
                    stderr: "disk full\n".into(),
                })
            } else {
                Ok(BodyOutput::default())
            }
        }),
    );
    let step = StepSpec::new("count")
        .directive(single_input(true))
        .code("wc -l {_input}");

    let err = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, StepError::Execution(_)), "{msg}");
    assert!(msg.contains("Failed to process statement"), "{msg}");
    assert!(msg.contains("disk full"), "{msg}");
    assert_eq!(h.exec.call_count(), 3);
}

#[test]
fn task_steps_run_sequentially_even_when_concurrency_is_requested() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt", "3.txt"]);
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_delay(Duration::from_millis(30)),
    );
    let step = StepSpec::new("align")
        .directive(single_input(true))
        .directive(out_per_input())
        .directive(Directive::new(DirectiveKind::Task).option("queue", Arg::literal("local")))
        .code("align {_input}");

    let result = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap();

    assert_eq!(result.mode, DispatchMode::Deferred);
    assert_eq!(result.outcomes, vec![SubstepOutcome::Completed; 3]);
    let calls = h.exec.calls();
    assert_eq!(calls.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    for w in calls.windows(2) {
        assert!(w[0].finished <= w[1].started, "task windows overlap");
    }

    assert_eq!(h.tasks.ids().len(), 3);
    let task_records = h.events.of_kind("task");
    assert_eq!(task_records.len(), 3);
    assert!(task_records.iter().all(|r| r.payload["queue"] == json!("local")));
    assert_eq!(h.events.of_kind("step").len(), 1);
    assert_eq!(h.store.write_count(), 3);
}

#[test]
fn trunks_bundle_tasks_into_fewer_submissions() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt", "3.txt"]);
    let h = harness(dir.path(), RecordingExecutor::new());
    let step = StepSpec::new("align")
        .directive(single_input(false))
        .directive(out_per_input())
        .directive(
            Directive::new(DirectiveKind::Task)
                .option("trunk_size", Arg::literal(2))
                .option("trunk_workers", Arg::literal(2)),
        )
        .code("align {_input}");

    let result = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap();

    let ids = h.tasks.ids();
    assert_eq!(ids.len(), 2, "{ids:?}");
    assert!(ids.iter().any(|id| id.starts_with("m2_")), "{ids:?}");
    assert_eq!(h.exec.call_count(), 3);
    assert_eq!(result.step_output.len(), 3);
    assert_eq!(h.events.of_kind("task").len(), 3);
}

#[test]
fn failed_tasks_fail_the_step() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt"]);
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_behavior(|req| {
            if req.index == 0 {
                Err(BodyError::failed("segfault"))
            } else {
                Ok(BodyOutput::default())
            }
        }),
    );
    let step = StepSpec::new("align")
        .directive(single_input(false))
        .directive(Directive::new(DirectiveKind::Task))
        .code("align {_input}");

    let err = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap_err();
    match err {
        StepError::TaskFailed { count, details } => {
            assert_eq!(count, 1);
            assert!(details.contains("substep 0"), "{details}");
            assert!(details.contains("segfault"), "{details}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.exec.call_count(), 2);
}

#[test]
fn tasks_may_stop_their_substep() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt"]);
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_behavior(|req| {
            if req.index == 1 {
                Err(BodyError::StopInputGroup(Some("empty".into())))
            } else {
                Ok(BodyOutput::default())
            }
        }),
    );
    let step = StepSpec::new("align")
        .directive(single_input(false))
        .directive(out_per_input())
        .directive(Directive::new(DirectiveKind::Task))
        .code("align {_input}");

    let result = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap();
    assert_eq!(
        result.outcomes,
        vec![
            SubstepOutcome::Completed,
            SubstepOutcome::StoppedEarly(Some("empty".into()))
        ]
    );
    assert_eq!(file_names(&result.step_output), vec!["1.txt.out"]);
    assert_eq!(h.store.write_count(), 1);
}

#[test]
fn terminate_stops_the_whole_step() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt", "3.txt"]);
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_behavior(|req| {
            if req.index == 1 {
                Err(BodyError::Terminate("quota exceeded".into()))
            } else {
                Ok(BodyOutput::default())
            }
        }),
    );
    let step = StepSpec::new("s").directive(single_input(false)).code("run");

    let err = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap_err();
    assert!(matches!(err, StepError::Terminated(ref m) if m == "quota exceeded"), "{err}");
    assert_eq!(h.exec.call_count(), 2);
}

#[test]
fn shared_variables_are_collected_per_substep() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt"]);
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_behavior(|req| {
            let mut vars = Vars::new();
            vars.insert("count".into(), json!(req.index * 10));
            vars.insert("scratch".into(), json!("not shared"));
            Ok(BodyOutput {
                vars,
                ..BodyOutput::default()
            })
        }),
    );
    let mut step = StepSpec::new("count").directive(single_input(false)).code("count");
    step.shared = vec!["count".to_string()];

    let mut ctx = ctx_for(&step, &inputs);
    let result = h.engine.run_step(&step, &mut ctx, &mut Trace::new("wf")).unwrap();

    assert_eq!(result.shared_vars.len(), 2);
    assert_eq!(result.shared_vars[0].get("count"), Some(&json!(0)));
    assert_eq!(result.shared_vars[1].get("count"), Some(&json!(10)));
    assert!(result.shared_vars.iter().all(|v| !v.contains_key("scratch")));
    assert_eq!(ctx.vars.get("count"), Some(&json!(10)));
}

#[test]
fn dynamic_outputs_are_fixed_after_execution() {
    let dir = workspace();
    let root = dir.path().to_path_buf();
    let pattern = root.join("chunk_*.csv").to_string_lossy().into_owned();
    let h = harness(
        dir.path(),
        RecordingExecutor::new().with_behavior(move |_| {
            for n in ["chunk_b.csv", "chunk_a.csv"] {
                fs::write(root.join(n), "x").map_err(|e| BodyError::failed(e.to_string()))?;
            }
            Ok(BodyOutput::default())
        }),
    );
    let step = StepSpec::new("split")
        .directive(
            Directive::new(DirectiveKind::Output).arg(Arg::target(Target::Dynamic(pattern))),
        )
        .code("split");

    let result = h
        .engine
        .run_step(
            &step,
            &mut ExecutionContext::new("wf", "split"),
            &mut Trace::new("wf"),
        )
        .unwrap();
    assert!(result.step_output.is_valid());
    assert_eq!(file_names(&result.step_output), vec!["chunk_a.csv", "chunk_b.csv"]);
    assert_eq!(h.store.write_count(), 1);
}

#[test]
fn depends_are_recorded_and_must_exist() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt"]);
    let reference = touch(dir.path(), &["ref.fa"]);
    let h = harness(dir.path(), RecordingExecutor::new());
    let step = StepSpec::new("align")
        .directive(single_input(false))
        .directive(
            Directive::new(DirectiveKind::Depends)
                .arg(Arg::literal(reference[0].to_string_lossy().into_owned())),
        )
        .code("align");

    let result = h
        .engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap();
    assert_eq!(file_names(&result.step_depends), vec!["ref.fa"]);

    let missing = StepSpec::new("align")
        .directive(
            Directive::new(DirectiveKind::Depends)
                .arg(Arg::literal(dir.path().join("gone.fa").to_string_lossy().into_owned())),
        )
        .code("align");
    let err = h
        .engine
        .run_step(&missing, &mut ctx_for(&missing, &inputs), &mut Trace::new("wf"))
        .unwrap_err();
    assert!(matches!(err, StepError::UnknownTarget(_)), "{err}");
}

#[test]
fn step_events_summarize_the_run() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["1.txt", "2.txt"]);
    let h = harness(dir.path(), RecordingExecutor::new());
    let step = StepSpec::new("convert")
        .directive(single_input(false))
        .directive(out_per_input())
        .code("convert");

    h.engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap();
    let records = h.events.of_kind("step");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].workflow_id, "wf-test");
    assert_eq!(records[0].payload["completed"], json!(2));
    assert_eq!(records[0].payload["mode"], json!("inline"));
    assert_eq!(
        records[0].payload["step_output"].as_array().map(Vec::len),
        Some(2)
    );
}

#[test]
fn shell_bodies_produce_outputs_and_share_variables() {
    let dir = workspace();
    let inputs = touch(dir.path(), &["a.txt", "b.txt"]);
    let mut cfg = config_in(dir.path());
    cfg.sig_mode = SigMode::Default;
    let engine = StepExecutor::new(cfg.clone(), Arc::new(ShellExecutor::new()))
        .with_slots(private_slots());
    let mut step = StepSpec::new("shout")
        .directive(single_input(false))
        .directive(out_per_input())
        .code("tr a-z A-Z < {_input} > {_output}\necho \"lines=$SUBSTEP_INDEX\" >> \"$SUBSTEP_SHARED\"");
    step.shared = vec!["lines".to_string()];

    let first = engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap();
    assert_eq!(first.outcomes, vec![SubstepOutcome::Completed; 2]);
    let produced = fs::read_to_string(dir.path().join("b.txt.out")).unwrap();
    assert_eq!(produced.trim(), "B.TXT");
    assert_eq!(first.shared_vars[1].get("lines"), Some(&Value::from(1)));

    let second = engine
        .run_step(&step, &mut ctx_for(&step, &inputs), &mut Trace::new("wf"))
        .unwrap();
    assert_eq!(second.outcomes, vec![SubstepOutcome::Skipped; 2]);
    assert_eq!(second.shared_vars[1].get("lines"), Some(&Value::from(1)));
    assert!(cfg.state_dir().join("events.log").exists());
    assert!(cfg.state_dir().join("signatures").is_dir());
}

#[test]
fn failing_shell_body_points_at_the_line() {
    let dir = workspace();
    let engine = StepExecutor::new(config_in(dir.path()), Arc::new(ShellExecutor::new()))
        .with_slots(private_slots());
    let step = StepSpec::new("broken").code("true\nno_such_command_here_42");

    let err = engine
        .run_step(
            &step,
            &mut ExecutionContext::new("wf", "broken"),
            &mut Trace::new("wf"),
        )
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("Failed to process statement"), "{msg}");
    assert!(msg.contains("no_such_command_here_42"), "{msg}");
}
