use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::bounded_executor::{run_bounded, BoxedJob, CancelToken};
use crate::context::{ExecutionContext, Vars};
use crate::directive::RuntimeOptions;
use crate::error::{Result, StepError};
use crate::executor::{format_body_error, BodyError, BodyRequest, StatementExecutor};
use crate::step::sort_value;
use crate::target::{hash_bytes, TargetSet};

/// A substep body packaged for out-of-process execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub step_name: String,
    pub index: usize,
    pub code: String,
    pub vars: Vars,
    pub input: TargetSet,
    pub output: TargetSet,
    pub depends: TargetSet,
    pub runtime: RuntimeOptions,
    #[serde(default)]
    pub shared: Vec<String>,
    /// Members of a trunk; empty for a plain task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<TaskDescriptor>,
}

impl TaskDescriptor {
    /// The id is derived from everything that determines the result; tags
    /// are labels only and do not take part.
    pub fn new(
        step_hash: &str,
        ctx: &ExecutionContext,
        code: &str,
        runtime: RuntimeOptions,
        shared: &[String],
    ) -> Result<Self> {
        let mut vars = ctx.vars.clone();
        vars.remove("_runtime");
        let mut runtime_key =
            serde_json::to_value(&runtime).context("failed to serialize runtime options")?;
        if let Some(obj) = runtime_key.as_object_mut() {
            obj.remove("tags");
        }
        let mut canonical = serde_json::json!({
            "step": step_hash,
            "code": code,
            "vars": vars,
            "input": ctx.input.targets(),
            "output": ctx.output.targets(),
            "depends": ctx.depends.targets(),
            "runtime": runtime_key,
        });
        sort_value(&mut canonical);
        let bytes = serde_json::to_vec(&canonical).context("failed to serialize task")?;
        let digest = hash_bytes(&bytes);

        Ok(Self {
            task_id: format!("t{}", &digest[..16]),
            step_name: ctx.step_name.clone(),
            index: ctx.index,
            code: code.to_string(),
            vars,
            input: ctx.input.clone(),
            output: ctx.output.clone(),
            depends: ctx.depends.clone(),
            runtime,
            shared: shared.to_vec(),
            subtasks: Vec::new(),
        })
    }

    /// Bundle several tasks into one submission unit.
    pub fn trunk(members: Vec<TaskDescriptor>) -> Result<Self> {
        let first = members
            .first()
            .ok_or_else(|| StepError::Invariant("empty task trunk".to_string()))?;
        let joined: Vec<&str> = members.iter().map(|m| m.task_id.as_str()).collect();
        let digest = hash_bytes(joined.join(",").as_bytes());

        let mut input = TargetSet::new();
        let mut output = TargetSet::new();
        let mut depends = TargetSet::new();
        for m in &members {
            input.extend(&m.input);
            output.extend(&m.output);
            depends.extend(&m.depends);
        }

        Ok(Self {
            task_id: format!("m{}_{}", members.len(), &digest[..16]),
            step_name: first.step_name.clone(),
            index: first.index,
            code: String::new(),
            vars: Vars::new(),
            input,
            output,
            depends,
            runtime: first.runtime.clone(),
            shared: first.shared.clone(),
            subtasks: members,
        })
    }

    pub fn is_trunk(&self) -> bool {
        !self.subtasks.is_empty()
    }

    pub fn queue_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.runtime.queue.as_deref().unwrap_or(default)
    }

    fn request(&self, cancel: &CancelToken) -> BodyRequest {
        let mut vars = self.vars.clone();
        vars.insert("_index".into(), Value::from(self.index as u64));
        vars.insert("step_name".into(), Value::String(self.step_name.clone()));
        BodyRequest {
            step_name: self.step_name.clone(),
            index: self.index,
            code: self.code.clone(),
            vars,
            step_input: TargetSet::new(),
            input: self.input.clone(),
            output: self.output.clone(),
            depends: self.depends.clone(),
            dry_run: false,
            capture: true,
            workdir: self.runtime.workdir.clone(),
            cancel: cancel.clone(),
        }
    }
}

/// Outcome of one task as reported by the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub ret_code: i32,
    /// Concrete output, with dynamic members resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TargetSet>,
    #[serde(default)]
    pub shared: Vars,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subtasks: BTreeMap<String, TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// Set when the body abandoned its substep; the output is then empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<String>,
}

impl TaskResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ret_code: 1,
            exception: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn summary(&self) -> String {
        match (&self.exception, &self.stopped) {
            (Some(e), _) => format!("failed (ret_code={}): {e}", self.ret_code),
            (None, Some(r)) => format!("stopped: {r}"),
            (None, None) if self.ret_code == 0 => "completed".to_string(),
            (None, None) => format!("failed (ret_code={})", self.ret_code),
        }
    }
}

pub type TaskResults = BTreeMap<String, TaskResult>;

/// Where descriptors wait between submission and execution.
pub trait TaskStore: Send + Sync {
    fn persist(&self, task: &TaskDescriptor) -> Result<()>;
    fn load(&self, task_id: &str) -> Result<TaskDescriptor>;
}

/// Hands persisted task ids to a queue; results arrive on the returned channel.
pub trait TaskSubmitter: Send + Sync {
    fn submit(&self, queue: &str, task_ids: &[String]) -> Result<Receiver<TaskResults>>;
}

/// One JSON file per task.
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `<state_dir>/tasks`.
    pub fn under(state_dir: &Path) -> Self {
        Self::new(state_dir.join("tasks"))
    }

    fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.task"))
    }
}

impl TaskStore for FileTaskStore {
    fn persist(&self, task: &TaskDescriptor) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create task dir '{}'", self.dir.display()))?;
        let path = self.path(&task.task_id);
        let body = serde_json::to_string_pretty(task).context("failed to serialize task")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write task file '{}'", path.display()))?;
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<TaskDescriptor> {
        let path = self.path(task_id);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read task file '{}'", path.display()))?;
        let task = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse task file '{}'", path.display()))?;
        Ok(task)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    tasks: Arc<Mutex<BTreeMap<String, TaskDescriptor>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.tasks
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn persist(&self, task: &TaskDescriptor) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))?;
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<TaskDescriptor> {
        let tasks = self
            .tasks
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))?;
        tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StepError::Other(anyhow!("task '{task_id}' was never persisted")))
    }
}

/// Batches the tasks of one step invocation into trunks.
#[derive(Debug)]
pub struct TaskManager {
    trunk_size: usize,
    pending: Vec<TaskDescriptor>,
    ids: HashSet<String>,
    outputs: TargetSet,
}

impl TaskManager {
    pub fn new(trunk_size: usize) -> Self {
        Self {
            trunk_size: trunk_size.max(1),
            pending: Vec::new(),
            ids: HashSet::new(),
            outputs: TargetSet::new(),
        }
    }

    /// Queue `task`; returns a submission unit once a trunk is full.
    pub fn push(&mut self, task: TaskDescriptor) -> Result<Option<TaskDescriptor>> {
        if !self.ids.insert(task.task_id.clone()) {
            return Err(StepError::validation(format!(
                "duplicate task id {} (substep {} of step '{}' repeats an identical task)",
                task.task_id, task.index, task.step_name
            )));
        }
        if let Some(t) = self.outputs.overlap(&task.output) {
            return Err(StepError::validation(format!(
                "task {} of step '{}' declares output {t} already produced by another task",
                task.task_id, task.step_name
            )));
        }
        self.outputs.extend(&task.output);
        self.pending.push(task);

        if self.pending.len() >= self.trunk_size {
            return self.take_unit().map(Some);
        }
        Ok(None)
    }

    /// Whatever is left, as one final unit.
    pub fn flush_all(&mut self) -> Result<Option<TaskDescriptor>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        self.take_unit().map(Some)
    }

    fn take_unit(&mut self) -> Result<TaskDescriptor> {
        let mut members = std::mem::take(&mut self.pending);
        if members.len() == 1 {
            if let Some(single) = members.pop() {
                return Ok(single);
            }
        }
        TaskDescriptor::trunk(members)
    }
}

struct Batch {
    task_ids: Vec<String>,
    reply: Sender<TaskResults>,
}

/// In-process queue: one background thread runs submitted batches in order.
pub struct LocalTaskQueue {
    sender: Mutex<Sender<Batch>>,
    cancel: CancelToken,
}

impl LocalTaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, executor: Arc<dyn StatementExecutor>) -> Self {
        Self::with_cancel(store, executor, CancelToken::new())
    }

    pub fn with_cancel(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn StatementExecutor>,
        cancel: CancelToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Batch>();
        let worker_cancel = cancel.clone();
        thread::spawn(move || {
            for batch in rx {
                let mut results = TaskResults::new();
                for id in &batch.task_ids {
                    let result = match store.load(id) {
                        Ok(task) => run_task(&task, &executor, &worker_cancel),
                        Err(err) => TaskResult::failed(err.to_string()),
                    };
                    results.insert(id.clone(), result);
                }
                let _ = batch.reply.send(results);
            }
        });
        Self {
            sender: Mutex::new(tx),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl TaskSubmitter for LocalTaskQueue {
    fn submit(&self, queue: &str, task_ids: &[String]) -> Result<Receiver<TaskResults>> {
        let (reply, rx) = mpsc::channel();
        let sender = self
            .sender
            .lock()
            .map_err(|_| anyhow!("task queue lock poisoned"))?;
        sender
            .send(Batch {
                task_ids: task_ids.to_vec(),
                reply,
            })
            .map_err(|_| anyhow!("task queue worker is gone"))?;
        info!(queue, tasks = task_ids.len(), "submitted tasks");
        Ok(rx)
    }
}

fn run_task(
    task: &TaskDescriptor,
    executor: &Arc<dyn StatementExecutor>,
    cancel: &CancelToken,
) -> TaskResult {
    if !task.is_trunk() {
        return run_single(task, executor.as_ref(), cancel);
    }

    let jobs: Vec<BoxedJob<(String, TaskResult)>> = task
        .subtasks
        .iter()
        .map(|sub| {
            let sub = sub.clone();
            let executor = Arc::clone(executor);
            let cancel = cancel.clone();
            Box::new(move || {
                let result = run_single(&sub, executor.as_ref(), &cancel);
                (sub.task_id.clone(), result)
            }) as BoxedJob<(String, TaskResult)>
        })
        .collect();

    debug!(
        trunk = %task.task_id,
        members = task.subtasks.len(),
        workers = task.runtime.trunk_workers,
        "running trunk"
    );
    match run_bounded(task.runtime.trunk_workers.max(1), jobs) {
        Ok(results) => {
            let mut output = TargetSet::new();
            let mut ret_code = 0;
            for (_, r) in &results {
                if let Some(o) = &r.output {
                    output.extend(o);
                }
                if r.ret_code != 0 {
                    ret_code = r.ret_code;
                }
            }
            TaskResult {
                ret_code,
                output: Some(output),
                subtasks: results.into_iter().collect(),
                ..TaskResult::default()
            }
        }
        Err(err) => TaskResult::failed(format!("{err:#}")),
    }
}

fn run_single(task: &TaskDescriptor, executor: &dyn StatementExecutor, cancel: &CancelToken) -> TaskResult {
    let req = task.request(cancel);
    match executor.execute(&req) {
        Ok(out) => match task.output.resolve_dynamic() {
            Ok(output) => TaskResult {
                ret_code: 0,
                output: Some(output),
                shared: out
                    .vars
                    .into_iter()
                    .filter(|(k, _)| task.shared.contains(k))
                    .collect(),
                ..TaskResult::default()
            },
            Err(err) => TaskResult::failed(err.to_string()),
        },
        Err(BodyError::StopInputGroup(reason)) => TaskResult {
            ret_code: 0,
            output: Some(TargetSet::new()),
            stopped: Some(reason.unwrap_or_else(|| "no reason given".to_string())),
            ..TaskResult::default()
        },
        Err(BodyError::Failed {
            message,
            line,
            stderr,
            ..
        }) => {
            let detail = if stderr.trim().is_empty() {
                message
            } else {
                format!("{message}\n{}", stderr.trim_end())
            };
            TaskResult::failed(format_body_error(&task.code, line, &detail))
        }
        Err(err) => TaskResult::failed(err.to_string()),
    }
}
