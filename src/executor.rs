use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::bounded_executor::CancelToken;
use crate::context::{interpolate, Binding, ExecutionContext, Namespace, Vars};
use crate::target::TargetSet;

/// Conditions a body can end with besides success.
#[derive(Debug, Error)]
pub enum BodyError {
    /// Abandon only the current substep.
    #[error("substep stopped: {}", .0.as_deref().unwrap_or("no reason given"))]
    StopInputGroup(Option<String>),

    /// Stop the whole step.
    #[error("{0}")]
    Terminate(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("target removed: {0}")]
    RemovedTarget(String),

    #[error("interrupted")]
    Interrupted,

    #[error("{message}")]
    Failed {
        message: String,
        /// 1-based line of the body the failure points at, when known.
        line: Option<usize>,
        stdout: String,
        stderr: String,
    },
}

impl BodyError {
    pub fn failed(message: impl Into<String>) -> Self {
        BodyError::Failed {
            message: message.into(),
            line: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Everything a body sees: a snapshot of the substep, detached from the context.
#[derive(Debug, Clone)]
pub struct BodyRequest {
    pub step_name: String,
    pub index: usize,
    pub code: String,
    pub vars: Vars,
    pub step_input: TargetSet,
    pub input: TargetSet,
    pub output: TargetSet,
    pub depends: TargetSet,
    pub dry_run: bool,
    /// Capture stdout/stderr instead of inheriting them.
    pub capture: bool,
    pub workdir: Option<PathBuf>,
    pub cancel: CancelToken,
}

impl BodyRequest {
    pub fn from_context(ctx: &ExecutionContext, code: &str) -> Self {
        let mut vars = ctx.vars.clone();
        vars.insert("_index".into(), Value::from(ctx.index as u64));
        vars.insert("step_name".into(), Value::String(ctx.step_name.clone()));
        Self {
            step_name: ctx.step_name.clone(),
            index: ctx.index,
            code: code.to_string(),
            vars,
            step_input: ctx.step_input.clone(),
            input: ctx.input.clone(),
            output: ctx.output.clone(),
            depends: ctx.depends.clone(),
            dry_run: false,
            capture: false,
            workdir: None,
            cancel: CancelToken::new(),
        }
    }
}

impl Namespace for BodyRequest {
    fn lookup(&self, name: &str) -> Option<Binding<'_>> {
        match name {
            "_input" => Some(Binding::Targets(&self.input)),
            "_output" => Some(Binding::Targets(&self.output)),
            "_depends" => Some(Binding::Targets(&self.depends)),
            "step_input" => Some(Binding::Targets(&self.step_input)),
            _ => self.vars.get(name).map(Binding::Value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodyOutput {
    /// Variables the body reported back.
    pub vars: Vars,
    pub stdout: String,
    pub stderr: String,
}

pub trait StatementExecutor: Send + Sync {
    fn execute(&self, req: &BodyRequest) -> Result<BodyOutput, BodyError>;
}

/// Body given as a closure, for embedding and tests.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&BodyRequest) -> Result<BodyOutput, BodyError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> StatementExecutor for FnExecutor<F>
where
    F: Fn(&BodyRequest) -> Result<BodyOutput, BodyError> + Send + Sync,
{
    fn execute(&self, req: &BodyRequest) -> Result<BodyOutput, BodyError> {
        (self.f)(req)
    }
}

/// Runs interpolated bodies through `sh -c`.
///
/// The script sees `SUBSTEP_STEP`, `SUBSTEP_INDEX`, `SUBSTEP_INPUT`,
/// `SUBSTEP_OUTPUT` and `SUBSTEP_DEPENDS`. It reports shared variables by
/// appending `name=value` lines to the file named by `SUBSTEP_SHARED`
/// (values parse as JSON, else as strings), and ends its substep early by
/// writing `stop [reason]` or `terminate [reason]` to `SUBSTEP_CONTROL`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("sh"),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl StatementExecutor for ShellExecutor {
    fn execute(&self, req: &BodyRequest) -> Result<BodyOutput, BodyError> {
        let script = interpolate(&req.code, req).map_err(|e| BodyError::failed(e.to_string()))?;

        if req.dry_run {
            info!(step = %req.step_name, index = req.index, "dry run, script:\n{script}");
            return Ok(BodyOutput::default());
        }

        let scratch = tempfile::tempdir()
            .map_err(|e| BodyError::failed(format!("failed to create scratch dir: {e}")))?;
        let shared_path = scratch.path().join("shared");
        let control_path = scratch.path().join("control");

        let (out_mode, err_mode) = if req.capture {
            (Stdio::piped(), Stdio::piped())
        } else {
            (Stdio::inherit(), Stdio::inherit())
        };
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&script)
            .env("SUBSTEP_STEP", &req.step_name)
            .env("SUBSTEP_INDEX", req.index.to_string())
            .env("SUBSTEP_INPUT", req.input.joined())
            .env("SUBSTEP_OUTPUT", req.output.joined())
            .env("SUBSTEP_DEPENDS", req.depends.joined())
            .env("SUBSTEP_SHARED", &shared_path)
            .env("SUBSTEP_CONTROL", &control_path)
            .stdin(Stdio::null())
            .stdout(out_mode)
            .stderr(err_mode);
        if let Some(dir) = &req.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BodyError::failed(format!("failed to spawn '{}': {e}", self.shell.display()))
        })?;

        let out_handle = child.stdout.take().map(drain);
        let err_handle = child.stderr.take().map(drain);

        let status = wait_cancellable(&mut child, &req.cancel)?;

        let stdout = out_handle.map(join_drain).unwrap_or_default();
        let stderr = err_handle.map(join_drain).unwrap_or_default();

        if let Some(signal) = read_control(&control_path) {
            return Err(signal);
        }

        if !status.success() {
            return Err(BodyError::Failed {
                message: format!(
                    "script exited with status {}",
                    status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string())
                ),
                line: error_line(&stderr),
                stdout,
                stderr,
            });
        }

        Ok(BodyOutput {
            vars: read_shared(&shared_path),
            stdout,
            stderr,
        })
    }
}

fn drain<R: Read + Send + 'static>(mut r: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_drain(h: thread::JoinHandle<String>) -> String {
    h.join().unwrap_or_default()
}

/// Wait for the child, relaying cancellation: terminate first, kill once escalated.
///
/// Terminate sends `SIGTERM` through `kill -TERM <pid>`; when that command
/// cannot be run or reports failure, the child is killed outright instead.
fn wait_cancellable(
    child: &mut Child,
    cancel: &CancelToken,
) -> Result<std::process::ExitStatus, BodyError> {
    let mut terminated = false;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if cancel.is_cancelled() {
                    return Err(BodyError::Interrupted);
                }
                return Ok(status);
            }
            Ok(None) => {}
            Err(e) => return Err(BodyError::failed(format!("failed waiting for script: {e}"))),
        }

        if cancel.should_kill() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BodyError::Interrupted);
        }
        if cancel.is_cancelled() && !terminated {
            terminated = true;
            let sent = Command::new("kill")
                .arg("-TERM")
                .arg(child.id().to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if !sent {
                let _ = child.kill();
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn read_control(path: &Path) -> Option<BodyError> {
    let raw = fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    let (word, rest) = raw.split_once(char::is_whitespace).unwrap_or((raw, ""));
    let reason = rest.trim();
    match word {
        "stop" => Some(BodyError::StopInputGroup(
            (!reason.is_empty()).then(|| reason.to_string()),
        )),
        "terminate" => Some(BodyError::Terminate(if reason.is_empty() {
            "terminated by body".to_string()
        } else {
            reason.to_string()
        })),
        other => {
            warn!(command = other, "ignoring unknown substep control command");
            None
        }
    }
}

fn read_shared(path: &Path) -> Vars {
    let mut vars = Vars::new();
    let Ok(raw) = fs::read_to_string(path) else {
        return vars;
    };
    for line in raw.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = value.trim();
        let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        vars.insert(name.to_string(), parsed);
    }
    vars
}

static SHELL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[^:\n]+: (?:line )?(\d+): ").expect("shell line regex must compile")
});

/// Line number from a shell diagnostic such as `sh: 3: foo: not found`.
fn error_line(stderr: &str) -> Option<usize> {
    SHELL_LINE
        .captures(stderr)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Failure message with the body lines around `line` (or the start of the body).
pub fn format_body_error(code: &str, line: Option<usize>, message: &str) -> String {
    let lines: Vec<&str> = code.lines().collect();
    let mut out = String::from("Failed to process statement:\n");
    match line {
        Some(n) if n >= 1 && n <= lines.len() => {
            let lo = n.saturating_sub(3);
            let hi = (n + 2).min(lines.len());
            for (i, text) in lines.iter().enumerate().take(hi).skip(lo) {
                let marker = if i + 1 == n { "---->" } else { "     " };
                out.push_str(&format!("{marker} {:>3} {text}\n", i + 1));
            }
        }
        _ => {
            for text in lines.iter().take(5) {
                out.push_str(&format!("      {text}\n"));
            }
            if lines.len() > 5 {
                out.push_str("      ...\n");
            }
        }
    }
    out.push_str(message.trim_end());
    out
}
