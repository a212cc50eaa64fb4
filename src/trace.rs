use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Trace {
    pub workflow_id: String,
    pub events: Vec<TraceEvent>,
    step_started_ms: HashMap<String, u128>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    StepStarted {
        ts_ms: u128,
        step: String,
        substeps: usize,
        mode: String,
    },
    SubstepSkipped {
        ts_ms: u128,
        step: String,
        index: usize,
    },
    SubstepStopped {
        ts_ms: u128,
        step: String,
        index: usize,
        reason: String,
    },
    SubstepCompleted {
        ts_ms: u128,
        step: String,
        index: usize,
    },
    TaskSubmitted {
        ts_ms: u128,
        step: String,
        task_id: String,
        queue: String,
    },
    TaskCompleted {
        ts_ms: u128,
        step: String,
        task_id: String,
        ret_code: i32,
    },
    StepFailed {
        ts_ms: u128,
        step: String,
        message: String,
    },
    StepFinished {
        ts_ms: u128,
        step: String,
        success: bool,
        elapsed_ms: u128,
    },
}

impl TraceEvent {
    pub fn summarize(&self, enhanced: bool) -> String {
        let (ts_ms, body) = match self {
            TraceEvent::StepStarted {
                ts_ms,
                step,
                substeps,
                mode,
            } => (
                *ts_ms,
                format!("StepStarted step={step} substeps={substeps} mode={mode}"),
            ),
            TraceEvent::SubstepSkipped { ts_ms, step, index } => {
                (*ts_ms, format!("SubstepSkipped step={step} index={index}"))
            }
            TraceEvent::SubstepStopped {
                ts_ms,
                step,
                index,
                reason,
            } => (
                *ts_ms,
                format!("SubstepStopped step={step} index={index} reason={reason}"),
            ),
            TraceEvent::SubstepCompleted { ts_ms, step, index } => {
                (*ts_ms, format!("SubstepCompleted step={step} index={index}"))
            }
            TraceEvent::TaskSubmitted {
                ts_ms,
                step,
                task_id,
                queue,
            } => (
                *ts_ms,
                format!("TaskSubmitted step={step} task={task_id} queue={queue}"),
            ),
            TraceEvent::TaskCompleted {
                ts_ms,
                step,
                task_id,
                ret_code,
            } => (
                *ts_ms,
                format!("TaskCompleted step={step} task={task_id} ret_code={ret_code}"),
            ),
            TraceEvent::StepFailed {
                ts_ms,
                step,
                message,
            } => (*ts_ms, format!("StepFailed step={step} message={message}")),
            TraceEvent::StepFinished {
                ts_ms,
                step,
                success,
                elapsed_ms,
            } => {
                let mut body = format!("StepFinished step={step} success={success}");
                if enhanced {
                    body.push_str(&format!(
                        " elapsed_ms={elapsed_ms} elapsed={}",
                        format_elapsed_ms(*elapsed_ms)
                    ));
                }
                (*ts_ms, body)
            }
        };
        if enhanced {
            format!("{ts_ms} ts={} {body}", format_ts_ms(ts_ms))
        } else {
            format!("{ts_ms} {body}")
        }
    }
}

impl Trace {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            events: Vec::new(),
            step_started_ms: HashMap::new(),
        }
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    pub fn step_started(&mut self, step: &str, substeps: usize, mode: &str) {
        let ts_ms = Self::now_ms();
        self.events.push(TraceEvent::StepStarted {
            ts_ms,
            step: step.to_string(),
            substeps,
            mode: mode.to_string(),
        });
        self.step_started_ms.insert(step.to_string(), ts_ms);
    }

    pub fn substep_skipped(&mut self, step: &str, index: usize) {
        self.events.push(TraceEvent::SubstepSkipped {
            ts_ms: Self::now_ms(),
            step: step.to_string(),
            index,
        });
    }

    pub fn substep_stopped(&mut self, step: &str, index: usize, reason: &str) {
        self.events.push(TraceEvent::SubstepStopped {
            ts_ms: Self::now_ms(),
            step: step.to_string(),
            index,
            reason: reason.to_string(),
        });
    }

    pub fn substep_completed(&mut self, step: &str, index: usize) {
        self.events.push(TraceEvent::SubstepCompleted {
            ts_ms: Self::now_ms(),
            step: step.to_string(),
            index,
        });
    }

    pub fn task_submitted(&mut self, step: &str, task_id: &str, queue: &str) {
        self.events.push(TraceEvent::TaskSubmitted {
            ts_ms: Self::now_ms(),
            step: step.to_string(),
            task_id: task_id.to_string(),
            queue: queue.to_string(),
        });
    }

    pub fn task_completed(&mut self, step: &str, task_id: &str, ret_code: i32) {
        self.events.push(TraceEvent::TaskCompleted {
            ts_ms: Self::now_ms(),
            step: step.to_string(),
            task_id: task_id.to_string(),
            ret_code,
        });
    }

    pub fn step_failed(&mut self, step: &str, message: &str) {
        self.events.push(TraceEvent::StepFailed {
            ts_ms: Self::now_ms(),
            step: step.to_string(),
            message: message.to_string(),
        });
    }

    pub fn step_finished(&mut self, step: &str, success: bool) {
        let ts_ms = Self::now_ms();
        let elapsed_ms = self
            .step_started_ms
            .remove(step)
            .map(|started| ts_ms.saturating_sub(started))
            .unwrap_or(0);
        self.events.push(TraceEvent::StepFinished {
            ts_ms,
            step: step.to_string(),
            success,
            elapsed_ms,
        });
    }
}

/// Print a human-readable trace to stdout.
pub fn print_trace(tr: &Trace, enhanced: bool) {
    println!("TRACE workflow_id={}", tr.workflow_id);
    for ev in &tr.events {
        println!("{}", ev.summarize(enhanced));
    }
}

fn format_ts_ms(ts_ms: u128) -> String {
    let secs = ts_ms / 1000;
    let millis = ts_ms % 1000;
    format!("{secs}.{millis:03}Z")
}

fn format_elapsed_ms(elapsed_ms: u128) -> String {
    let secs = elapsed_ms as f64 / 1000.0;
    format!("{secs:.2}s")
}

/// Append-only sink for `task` and `step` completion records.
pub trait EventLog: Send + Sync {
    fn write(&self, kind: &str, workflow_id: &str, payload: &Value) -> Result<()>;
}

/// One tab-separated line per record: kind, workflow id, JSON payload.
#[derive(Debug, Clone)]
pub struct FileEventLog {
    path: PathBuf,
}

impl FileEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log at `<state_dir>/events.log`.
    pub fn under(state_dir: &Path) -> Self {
        Self::new(state_dir.join("events.log"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventLog for FileEventLog {
    fn write(&self, kind: &str, workflow_id: &str, payload: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create event log dir '{}'", parent.display())
                })?;
            }
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open event log '{}'", self.path.display()))?;
        writeln!(f, "{kind}\t{workflow_id}\t{payload}")
            .with_context(|| format!("failed to append to '{}'", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub kind: String,
    pub workflow_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<EventRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }
}

impl EventLog for MemoryEventLog {
    fn write(&self, kind: &str, workflow_id: &str, payload: &Value) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        records.push(EventRecord {
            kind: kind.to_string(),
            workflow_id: workflow_id.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
