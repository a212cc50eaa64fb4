use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::bounded_executor::{run_pool, BoxedJob, CancelToken};
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, Vars};
use crate::directive::{append_step_output, process_input, DirectiveProcessor, RuntimeOptions};
use crate::error::{Result, StepError};
use crate::executor::{format_body_error, BodyError, BodyOutput, BodyRequest, StatementExecutor};
use crate::grouping::SubstepGroup;
use crate::signature::{FileSignatureStore, SigState, SignatureEngine, SignatureStore};
use crate::slots::{global_slots, SlotManager};
use crate::step::{Statement, StepSpec};
use crate::target::{ExistMode, TargetSet};
use crate::task::{
    FileTaskStore, LocalTaskQueue, TaskDescriptor, TaskManager, TaskResult, TaskResults,
    TaskStore, TaskSubmitter,
};
use crate::trace::{EventLog, FileEventLog, Trace};

const RESULT_POLL: Duration = Duration::from_millis(50);

/// How the bodies of one step invocation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Inline,
    Concurrent,
    Deferred,
}

impl DispatchMode {
    /// Chosen once per step. A task directive always defers; the pool needs
    /// the `concurrent` input option, several substeps, a real run, a single
    /// code statement and no nested workflow call.
    pub fn select(step: &StepSpec, substeps: usize, config: &EngineConfig) -> Self {
        if step.has_task() {
            return DispatchMode::Deferred;
        }
        let concurrent = step.concurrent_requested()
            && substeps > 1
            && !config.is_dry_run()
            && step.code_statement_count() <= 1
            && !step.invokes_nested_workflow();
        if concurrent {
            DispatchMode::Concurrent
        } else {
            DispatchMode::Inline
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DispatchMode::Inline => "inline",
            DispatchMode::Concurrent => "concurrent",
            DispatchMode::Deferred => "deferred",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubstepOutcome {
    Completed,
    /// Signature matched; recorded results restored.
    Skipped,
    StoppedEarly(Option<String>),
    /// Handed to the task queue; result not yet known.
    Deferred(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubstepRecord {
    pub outcome: SubstepOutcome,
    pub output: TargetSet,
    pub shared: Vars,
}

/// Step-level aggregates handed to whatever consumes the step next.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,
    pub mode: DispatchMode,
    pub step_input: TargetSet,
    pub step_output: TargetSet,
    pub step_depends: TargetSet,
    /// Output of each substep, in group order.
    pub outputs: Vec<TargetSet>,
    /// Shared variables of each substep, in group order.
    pub shared_vars: Vec<Vars>,
    pub outcomes: Vec<SubstepOutcome>,
    /// Substeps attempted, i.e. all minus skipped.
    pub substep_completed: usize,
    pub substep_skipped: usize,
}

/// Queue collaborators for deferred tasks.
#[derive(Clone)]
pub struct TaskBackend {
    pub store: Arc<dyn TaskStore>,
    pub submitter: Arc<dyn TaskSubmitter>,
}

struct Prepared {
    sig: SigState,
    runtime: Option<RuntimeOptions>,
    body: Option<String>,
    declared_output: TargetSet,
}

enum Prep {
    Ready(Prepared),
    /// A statement before the body already ended the substep.
    Done(SubstepOutcome, TargetSet),
}

/// Runs steps: resolves input, groups it, processes directives per substep,
/// consults signatures, and dispatches bodies.
pub struct StepExecutor {
    config: EngineConfig,
    executor: Arc<dyn StatementExecutor>,
    signatures: Arc<dyn SignatureStore>,
    tasks: Option<TaskBackend>,
    events: Arc<dyn EventLog>,
    slots: Arc<dyn SlotManager>,
    cancel: CancelToken,
}

impl StepExecutor {
    /// File-backed signatures and event log under the config's state dir,
    /// the process-wide slot manager, and a local task queue on demand.
    pub fn new(config: EngineConfig, executor: Arc<dyn StatementExecutor>) -> Self {
        let state = config.state_dir();
        Self {
            signatures: Arc::new(FileSignatureStore::under(&state)),
            events: Arc::new(FileEventLog::under(&state)),
            tasks: None,
            slots: global_slots(),
            cancel: CancelToken::new(),
            config,
            executor,
        }
    }

    pub fn with_signature_store(mut self, store: Arc<dyn SignatureStore>) -> Self {
        self.signatures = store;
        self
    }

    pub fn with_task_backend(
        mut self,
        store: Arc<dyn TaskStore>,
        submitter: Arc<dyn TaskSubmitter>,
    ) -> Self {
        self.tasks = Some(TaskBackend { store, submitter });
        self
    }

    pub fn with_event_log(mut self, events: Arc<dyn EventLog>) -> Self {
        self.events = events;
        self
    }

    pub fn with_slots(mut self, slots: Arc<dyn SlotManager>) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn run_step(
        &self,
        step: &StepSpec,
        ctx: &mut ExecutionContext,
        trace: &mut Trace,
    ) -> Result<StepResult> {
        match self.run_step_inner(step, ctx, trace) {
            Ok(result) => {
                trace.step_finished(&step.name, true);
                Ok(result)
            }
            Err(err) => {
                trace.step_failed(&step.name, &err.to_string());
                trace.step_finished(&step.name, false);
                Err(err)
            }
        }
    }

    fn run_step_inner(
        &self,
        step: &StepSpec,
        ctx: &mut ExecutionContext,
        trace: &mut Trace,
    ) -> Result<StepResult> {
        step.validate()?;
        let step_hash = step.content_hash()?;
        for (k, v) in &step.vars {
            ctx.vars.entry(k.clone()).or_insert_with(|| v.clone());
        }
        ctx.step_output = TargetSet::unspecified();
        ctx.step_depends = TargetSet::new();

        let groups = process_input(step, ctx)?;
        let mode = DispatchMode::select(step, groups.len(), &self.config);
        trace.step_started(&step.name, groups.len(), mode.name());
        info!(step = %step.name, substeps = groups.len(), mode = %mode, "running step");

        let engine = SignatureEngine::new(
            self.config.sig_mode,
            self.config.is_dry_run(),
            self.signatures.as_ref(),
        );
        let records = match mode {
            DispatchMode::Inline => self.run_inline_mode(step, &step_hash, ctx, &groups, &engine)?,
            DispatchMode::Concurrent => {
                self.run_concurrent_mode(step, &step_hash, ctx, &groups, &engine)?
            }
            DispatchMode::Deferred => {
                self.run_deferred_mode(step, &step_hash, ctx, &groups, &engine, trace)?
            }
        };

        let result = self.aggregate(step, mode, ctx, records, trace);
        self.events.write(
            "step",
            &ctx.workflow_id,
            &json!({
                "step": step.name,
                "mode": mode.name(),
                "substeps": result.outcomes.len(),
                "completed": result.substep_completed,
                "skipped": result.substep_skipped,
                "step_output": result.step_output.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            }),
        )?;
        Ok(result)
    }

    fn aggregate(
        &self,
        step: &StepSpec,
        mode: DispatchMode,
        ctx: &mut ExecutionContext,
        records: Vec<SubstepRecord>,
        trace: &mut Trace,
    ) -> StepResult {
        let mut step_output = TargetSet::unspecified();
        let mut outputs = Vec::with_capacity(records.len());
        let mut shared_vars = Vec::with_capacity(records.len());
        let mut outcomes = Vec::with_capacity(records.len());
        let mut skipped = 0;

        for (index, rec) in records.into_iter().enumerate() {
            match &rec.outcome {
                SubstepOutcome::Skipped => {
                    skipped += 1;
                    trace.substep_skipped(&step.name, index);
                }
                SubstepOutcome::StoppedEarly(reason) => trace.substep_stopped(
                    &step.name,
                    index,
                    reason.as_deref().unwrap_or(""),
                ),
                _ => trace.substep_completed(&step.name, index),
            }
            step_output.extend(&rec.output);
            for (k, v) in &rec.shared {
                ctx.vars.insert(k.clone(), v.clone());
            }
            outputs.push(rec.output);
            shared_vars.push(rec.shared);
            outcomes.push(rec.outcome);
        }

        ctx.step_output = step_output.clone();
        let total = outcomes.len();
        StepResult {
            step_name: step.name.clone(),
            mode,
            step_input: ctx.step_input.clone(),
            step_output,
            step_depends: ctx.step_depends.clone(),
            outputs,
            shared_vars,
            outcomes,
            substep_completed: total - skipped,
            substep_skipped: skipped,
        }
    }

    fn request(&self, ctx: &ExecutionContext, code: &str) -> BodyRequest {
        let mut req = BodyRequest::from_context(ctx, code);
        req.dry_run = self.config.is_dry_run();
        req.cancel = self.cancel.clone();
        req
    }

    /// Run a statement in the calling thread, folding reported variables into the context.
    fn run_statement(&self, code: &str, ctx: &mut ExecutionContext) -> Result<SubstepOutcome> {
        let req = self.request(ctx, code);
        match self.executor.execute(&req) {
            Ok(out) => {
                ctx.vars.extend(out.vars);
                Ok(SubstepOutcome::Completed)
            }
            Err(err) => outcome_from_error(err, code),
        }
    }

    /// Enter the substep, run its directives and pre-body statements, and
    /// decide its signature state.
    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        step: &StepSpec,
        step_hash: &str,
        ctx: &mut ExecutionContext,
        processor: &mut DirectiveProcessor,
        engine: &SignatureEngine<'_>,
        index: usize,
        group: &SubstepGroup,
    ) -> Result<Prep> {
        ctx.enter_substep(index, group.input.clone(), &group.vars);
        let body_pos = step.body_position();
        let mut runtime = None;

        for (pos, st) in step.statements.iter().enumerate() {
            if Some(pos) == body_pos {
                continue;
            }
            match st {
                Statement::Directive(d) => {
                    if let Some(rt) = processor.process(d, ctx)? {
                        runtime = Some(rt);
                    }
                }
                Statement::Code(code) => match self.run_statement(code, ctx)? {
                    SubstepOutcome::Completed => {}
                    SubstepOutcome::Failed(msg) => return Err(StepError::Execution(msg)),
                    other => return Ok(Prep::Done(other, stopped_output(&ctx.output))),
                },
            }
        }

        let sig = engine.decide(step, step_hash, ctx)?;
        Ok(Prep::Ready(Prepared {
            sig,
            runtime,
            body: step.body().map(str::to_string),
            declared_output: ctx.output.clone(),
        }))
    }

    /// Last-moment check that input and depends still exist.
    fn verify_targets(&self, ctx: &ExecutionContext) -> Result<()> {
        if self.config.is_dry_run() {
            return Ok(());
        }
        for t in ctx.input.iter().chain(ctx.depends.iter()) {
            if !t.exists(ExistMode::Any) {
                return Err(StepError::RemovedTarget(t.to_string()));
            }
        }
        Ok(())
    }

    /// Record for a substep whose signature matched, if it did.
    fn skipped(
        &self,
        step: &StepSpec,
        ctx: &mut ExecutionContext,
        prepared: &Prepared,
    ) -> Result<Option<SubstepRecord>> {
        let rec = match &prepared.sig {
            SigState::MatchedSkip(rec) | SigState::MatchedRebuild(rec) => rec,
            _ => return Ok(None),
        };
        if prepared.declared_output.is_undetermined() {
            append_step_output(&mut ctx.step_output, &rec.restored_output, &step.name)?;
        }
        info!(step = %step.name, index = ctx.index, "signature matched; skipping substep");
        Ok(Some(SubstepRecord {
            outcome: SubstepOutcome::Skipped,
            output: rec.restored_output.clone(),
            shared: rec.shared.clone(),
        }))
    }

    /// Fix the output of an executed substep, collect shared variables and
    /// write its pending signature.
    fn settle(
        &self,
        step: &StepSpec,
        ctx: &mut ExecutionContext,
        engine: &SignatureEngine<'_>,
        prepared: Prepared,
        outcome: SubstepOutcome,
        vars: &Vars,
    ) -> Result<SubstepRecord> {
        let shared = pick_shared(&step.shared, vars);
        match outcome {
            SubstepOutcome::Completed => {
                let output = if prepared.declared_output.is_undetermined() {
                    let resolved = prepared.declared_output.resolve_dynamic()?;
                    append_step_output(&mut ctx.step_output, &resolved, &step.name)?;
                    resolved
                } else {
                    prepared.declared_output
                };
                engine.finalize(prepared.sig, &output, shared.clone())?;
                Ok(SubstepRecord {
                    outcome: SubstepOutcome::Completed,
                    output,
                    shared,
                })
            }
            SubstepOutcome::StoppedEarly(reason) => Ok(SubstepRecord {
                output: stopped_output(&prepared.declared_output),
                outcome: SubstepOutcome::StoppedEarly(reason),
                shared,
            }),
            SubstepOutcome::Failed(msg) => Err(StepError::Execution(msg)),
            other => Err(StepError::Invariant(format!(
                "cannot settle substep with outcome {other:?}"
            ))),
        }
    }

    fn run_inline_mode(
        &self,
        step: &StepSpec,
        step_hash: &str,
        ctx: &mut ExecutionContext,
        groups: &[SubstepGroup],
        engine: &SignatureEngine<'_>,
    ) -> Result<Vec<SubstepRecord>> {
        let mut processor = DirectiveProcessor::new(groups.len());
        let mut records = Vec::with_capacity(groups.len());

        for (index, group) in groups.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(StepError::Interrupted);
            }
            let prepared =
                match self.prepare(step, step_hash, ctx, &mut processor, engine, index, group)? {
                    Prep::Ready(p) => p,
                    Prep::Done(outcome, output) => {
                        log_stop(step, index, &outcome);
                        records.push(SubstepRecord {
                            outcome,
                            output,
                            shared: pick_shared(&step.shared, &ctx.vars),
                        });
                        continue;
                    }
                };
            if let Some(rec) = self.skipped(step, ctx, &prepared)? {
                ctx.vars.extend(rec.shared.clone());
                records.push(rec);
                continue;
            }

            self.verify_targets(ctx)?;
            let _lock = match prepared.sig.pending() {
                Some(sig) => Some(engine.store().lock(&sig.id)?),
                None => None,
            };
            let outcome = match &prepared.body {
                Some(code) => self.run_statement(code, ctx)?,
                None => SubstepOutcome::Completed,
            };
            log_stop(step, index, &outcome);
            let vars = ctx.vars.clone();
            records.push(self.settle(step, ctx, engine, prepared, outcome, &vars)?);
        }
        Ok(records)
    }

    fn run_concurrent_mode(
        &self,
        step: &StepSpec,
        step_hash: &str,
        ctx: &mut ExecutionContext,
        groups: &[SubstepGroup],
        engine: &SignatureEngine<'_>,
    ) -> Result<Vec<SubstepRecord>> {
        let mut processor = DirectiveProcessor::new(groups.len());
        let mut prepared: Vec<(Prep, Option<BodyRequest>)> = Vec::with_capacity(groups.len());

        for (index, group) in groups.iter().enumerate() {
            let prep = self.prepare(step, step_hash, ctx, &mut processor, engine, index, group)?;
            let req = match &prep {
                Prep::Ready(p) if !p.sig.skips_body() => {
                    self.verify_targets(ctx)?;
                    p.body.as_deref().map(|code| {
                        let mut req = self.request(ctx, code);
                        req.capture = true;
                        req
                    })
                }
                _ => None,
            };
            prepared.push((prep, req));
        }

        let mut positions = Vec::new();
        let mut jobs: Vec<BoxedJob<std::result::Result<BodyOutput, BodyError>>> = Vec::new();
        for (index, (_, req)) in prepared.iter().enumerate() {
            if let Some(req) = req {
                let req = req.clone();
                let executor = Arc::clone(&self.executor);
                positions.push(index);
                jobs.push(Box::new(move || executor.execute(&req)));
            }
        }
        debug!(step = %step.name, jobs = jobs.len(), "dispatching substeps to pool");
        let results = run_pool(
            jobs,
            self.slots.as_ref(),
            self.config.max_procs,
            &self.cancel,
            self.config.terminate_grace,
        )?;
        let mut by_index: BTreeMap<usize, _> = positions.into_iter().zip(results).collect();

        // Captured output goes out in substep order before any error is raised.
        for result in by_index.values() {
            forward_output(result);
        }

        let mut records = Vec::with_capacity(prepared.len());
        for (index, (prep, req)) in prepared.into_iter().enumerate() {
            let p = match prep {
                Prep::Ready(p) => p,
                Prep::Done(outcome, output) => {
                    log_stop(step, index, &outcome);
                    records.push(SubstepRecord {
                        outcome,
                        output,
                        shared: Vars::new(),
                    });
                    continue;
                }
            };
            if let Some(rec) = self.skipped(step, ctx, &p)? {
                records.push(rec);
                continue;
            }
            let (outcome, vars) = match (by_index.remove(&index), req) {
                (Some(Ok(out)), Some(req)) => {
                    let mut vars = req.vars;
                    vars.extend(out.vars);
                    (SubstepOutcome::Completed, vars)
                }
                (Some(Err(err)), Some(req)) => (outcome_from_error(err, &req.code)?, req.vars),
                _ => (SubstepOutcome::Completed, ctx.vars.clone()),
            };
            log_stop(step, index, &outcome);
            records.push(self.settle(step, ctx, engine, p, outcome, &vars)?);
        }
        Ok(records)
    }

    fn task_backend(&self) -> TaskBackend {
        match &self.tasks {
            Some(backend) => backend.clone(),
            None => {
                let store: Arc<dyn TaskStore> =
                    Arc::new(FileTaskStore::under(&self.config.state_dir()));
                let submitter = Arc::new(LocalTaskQueue::with_cancel(
                    Arc::clone(&store),
                    Arc::clone(&self.executor),
                    self.cancel.clone(),
                ));
                TaskBackend { store, submitter }
            }
        }
    }

    fn run_deferred_mode(
        &self,
        step: &StepSpec,
        step_hash: &str,
        ctx: &mut ExecutionContext,
        groups: &[SubstepGroup],
        engine: &SignatureEngine<'_>,
        trace: &mut Trace,
    ) -> Result<Vec<SubstepRecord>> {
        let backend = self.task_backend();
        let mut processor = DirectiveProcessor::new(groups.len());
        let mut manager: Option<TaskManager> = None;
        let mut records: Vec<SubstepRecord> = Vec::with_capacity(groups.len());
        let mut waiting: BTreeMap<usize, Prepared> = BTreeMap::new();
        let mut member_of: BTreeMap<String, usize> = BTreeMap::new();
        let mut submitted: Vec<Submission> = Vec::new();

        for (index, group) in groups.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(StepError::Interrupted);
            }
            let prepared =
                match self.prepare(step, step_hash, ctx, &mut processor, engine, index, group)? {
                    Prep::Ready(p) => p,
                    Prep::Done(outcome, output) => {
                        log_stop(step, index, &outcome);
                        records.push(SubstepRecord {
                            outcome,
                            output,
                            shared: pick_shared(&step.shared, &ctx.vars),
                        });
                        continue;
                    }
                };
            if let Some(rec) = self.skipped(step, ctx, &prepared)? {
                records.push(rec);
                continue;
            }
            self.verify_targets(ctx)?;
            let code = prepared.body.clone().unwrap_or_default();

            if self.config.is_dry_run() {
                let outcome = self.run_statement(&code, ctx)?;
                let vars = ctx.vars.clone();
                records.push(self.settle(step, ctx, engine, prepared, outcome, &vars)?);
                continue;
            }

            let runtime = prepared.runtime.clone().unwrap_or_default();
            let task = TaskDescriptor::new(step_hash, ctx, &code, runtime, &step.shared)?;
            let mgr = manager.get_or_insert_with(|| TaskManager::new(task.runtime.trunk_size));
            member_of.insert(task.task_id.clone(), index);
            records.push(SubstepRecord {
                outcome: SubstepOutcome::Deferred(task.task_id.clone()),
                output: prepared.declared_output.clone(),
                shared: Vars::new(),
            });
            waiting.insert(index, prepared);
            if let Some(unit) = mgr.push(task)? {
                submitted.push(self.submit(&backend, unit, trace)?);
            }
        }
        if let Some(unit) = manager.as_mut().map(TaskManager::flush_all).transpose()?.flatten() {
            submitted.push(self.submit(&backend, unit, trace)?);
        }

        let mut failures = Vec::new();
        for submission in submitted {
            let results = self.await_results(&submission)?;
            for (task_id, result) in unit_results(&submission, results) {
                trace.task_completed(&step.name, &task_id, result.ret_code);
                self.events.write(
                    "task",
                    &ctx.workflow_id,
                    &json!({
                        "task_id": task_id,
                        "step": step.name,
                        "queue": submission.queue,
                        "tags": submission.tags,
                        "ret_code": result.ret_code,
                        "result": result.summary(),
                    }),
                )?;

                let Some(&index) = member_of.get(&task_id) else {
                    continue;
                };
                if result.ret_code != 0 {
                    failures.push(format!(
                        "{task_id} (substep {index}): {}",
                        result.exception.as_deref().unwrap_or("no details")
                    ));
                    continue;
                }
                let Some(mut prepared) = waiting.remove(&index) else {
                    continue;
                };
                let (outcome, vars) = match result.stopped {
                    Some(reason) => (SubstepOutcome::StoppedEarly(Some(reason)), result.shared),
                    None => {
                        if let Some(output) = result.output {
                            if prepared.declared_output.is_undetermined() {
                                prepared.declared_output = output;
                                append_step_output(
                                    &mut ctx.step_output,
                                    &prepared.declared_output,
                                    &step.name,
                                )?;
                            }
                        }
                        (SubstepOutcome::Completed, result.shared)
                    }
                };
                log_stop(step, index, &outcome);
                let pos = position_of(&records, &task_id)?;
                records[pos] = self.settle(step, ctx, engine, prepared, outcome, &vars)?;
            }
        }

        if !failures.is_empty() {
            return Err(StepError::TaskFailed {
                count: failures.len(),
                details: failures.join("; "),
            });
        }
        Ok(records)
    }

    fn submit(
        &self,
        backend: &TaskBackend,
        unit: TaskDescriptor,
        trace: &mut Trace,
    ) -> Result<Submission> {
        backend.store.persist(&unit)?;
        let queue = unit.queue_or(&self.config.default_queue).to_string();
        let rx = backend
            .submitter
            .submit(&queue, std::slice::from_ref(&unit.task_id))?;
        trace.task_submitted(&unit.step_name, &unit.task_id, &queue);
        info!(step = %unit.step_name, task = %unit.task_id, queue = %queue, "task submitted");
        Ok(Submission {
            tags: unit.runtime.tags.clone(),
            members: unit.subtasks.iter().map(|t| t.task_id.clone()).collect(),
            unit_id: unit.task_id,
            queue,
            rx,
        })
    }

    fn await_results(&self, submission: &Submission) -> Result<TaskResults> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(StepError::Interrupted);
            }
            match submission.rx.recv_timeout(RESULT_POLL) {
                Ok(results) => return Ok(results),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StepError::Execution(format!(
                        "task queue '{}' closed before reporting task {}",
                        submission.queue, submission.unit_id
                    )))
                }
            }
        }
    }
}

struct Submission {
    unit_id: String,
    queue: String,
    tags: Vec<String>,
    /// Trunk members; empty for a single task.
    members: Vec<String>,
    rx: Receiver<TaskResults>,
}

/// Per-task results of one submission, trunks unpacked into their members.
fn unit_results(submission: &Submission, mut results: TaskResults) -> Vec<(String, TaskResult)> {
    let unit = results
        .remove(&submission.unit_id)
        .unwrap_or_else(|| TaskResult::failed("no result reported"));
    if submission.members.is_empty() {
        return vec![(submission.unit_id.clone(), unit)];
    }
    let mut subtasks = unit.subtasks;
    submission
        .members
        .iter()
        .map(|id| {
            let r = subtasks.remove(id).unwrap_or_else(|| {
                TaskResult::failed(
                    unit.exception
                        .clone()
                        .unwrap_or_else(|| "trunk reported no result".to_string()),
                )
            });
            (id.clone(), r)
        })
        .collect()
}

fn position_of(records: &[SubstepRecord], task_id: &str) -> Result<usize> {
    records
        .iter()
        .position(|r| matches!(&r.outcome, SubstepOutcome::Deferred(id) if id == task_id))
        .ok_or_else(|| StepError::Invariant(format!("no pending substep for task {task_id}")))
}

fn outcome_from_error(err: BodyError, code: &str) -> Result<SubstepOutcome> {
    match err {
        BodyError::StopInputGroup(reason) => Ok(SubstepOutcome::StoppedEarly(reason)),
        BodyError::Failed {
            message,
            line,
            stderr,
            ..
        } => {
            let detail = if stderr.trim().is_empty() {
                message
            } else {
                format!("{message}\n{}", stderr.trim_end())
            };
            Ok(SubstepOutcome::Failed(format_body_error(code, line, &detail)))
        }
        BodyError::Terminate(msg) => Err(StepError::Terminated(msg)),
        BodyError::UnknownTarget(t) => Err(StepError::UnknownTarget(t)),
        BodyError::RemovedTarget(t) => Err(StepError::RemovedTarget(t)),
        BodyError::Interrupted => Err(StepError::Interrupted),
    }
}

fn forward_output(result: &std::result::Result<BodyOutput, BodyError>) {
    let (stdout, stderr) = match result {
        Ok(out) => (out.stdout.as_str(), out.stderr.as_str()),
        Err(BodyError::Failed { stdout, stderr, .. }) => (stdout.as_str(), stderr.as_str()),
        Err(_) => return,
    };
    if !stdout.is_empty() {
        print!("{stdout}");
    }
    if !stderr.is_empty() {
        eprint!("{stderr}");
    }
}

fn log_stop(step: &StepSpec, index: usize, outcome: &SubstepOutcome) {
    if let SubstepOutcome::StoppedEarly(reason) = outcome {
        match reason {
            Some(reason) => warn!(step = %step.name, index, "substep stopped: {reason}"),
            None => info!(step = %step.name, index, "substep stopped"),
        }
    }
}

/// A stopped substep produces nothing; an undeclared output stays undeclared.
fn stopped_output(declared: &TargetSet) -> TargetSet {
    if declared.is_unspecified() {
        TargetSet::unspecified()
    } else {
        TargetSet::new()
    }
}

pub fn pick_shared(names: &[String], vars: &Vars) -> Vars {
    names
        .iter()
        .filter_map(|n| vars.get(n).map(|v| (n.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{Arg, Directive, DirectiveKind};

    fn concurrent_step() -> StepSpec {
        StepSpec::new("s")
            .directive(
                Directive::new(DirectiveKind::Input)
                    .option("concurrent", Arg::literal(true))
                    .option("group_by", Arg::literal("single")),
            )
            .code("echo {_input}")
    }

    #[test]
    fn mode_selection_honors_disqualifiers() {
        let cfg = EngineConfig::default();
        assert_eq!(DispatchMode::select(&concurrent_step(), 3, &cfg), DispatchMode::Concurrent);
        assert_eq!(DispatchMode::select(&concurrent_step(), 1, &cfg), DispatchMode::Inline);

        let two_statements = concurrent_step().code("echo again");
        assert_eq!(DispatchMode::select(&two_statements, 3, &cfg), DispatchMode::Inline);

        let nested = StepSpec::new("s")
            .directive(Directive::new(DirectiveKind::Input).option("concurrent", Arg::literal(true)))
            .code("run_workflow('sub')");
        assert_eq!(DispatchMode::select(&nested, 3, &cfg), DispatchMode::Inline);

        let dry = EngineConfig {
            run_mode: crate::config::RunMode::DryRun,
            ..EngineConfig::default()
        };
        assert_eq!(DispatchMode::select(&concurrent_step(), 3, &dry), DispatchMode::Inline);

        let with_task = StepSpec::new("s")
            .directive(Directive::new(DirectiveKind::Input).option("concurrent", Arg::literal(true)))
            .directive(Directive::new(DirectiveKind::Task))
            .code("echo");
        assert_eq!(DispatchMode::select(&with_task, 3, &cfg), DispatchMode::Deferred);
    }

    #[test]
    fn failed_bodies_carry_a_snippet() {
        let err = BodyError::Failed {
            message: "exit 2".into(),
            line: Some(2),
            stdout: String::new(),
            stderr: "sh: 2: nope: not found\n".into(),
        };
        match outcome_from_error(err, "echo ok\nnope\necho later").unwrap() {
            SubstepOutcome::Failed(msg) => {
                assert!(msg.contains("---->   2 nope"), "{msg}");
                assert!(msg.contains("not found"), "{msg}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            outcome_from_error(BodyError::Terminate("halt".into()), ""),
            Err(StepError::Terminated(_))
        ));
    }

    #[test]
    fn pick_shared_ignores_missing_names() {
        let mut vars = Vars::new();
        vars.insert("a".into(), json!(1));
        let picked = pick_shared(&["a".to_string(), "b".to_string()], &vars);
        assert_eq!(picked.len(), 1);
    }
}
