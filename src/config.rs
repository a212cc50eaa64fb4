use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepError};

/// How run signatures are consulted and written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigMode {
    /// Skip substeps whose signature matches; otherwise execute and write.
    #[default]
    Default,
    /// Never build signatures.
    Ignore,
    /// A mismatch is fatal.
    Assert,
    /// Adopt existing outputs by writing signatures without executing.
    Build,
    /// Always execute and write.
    Force,
}

impl FromStr for SigMode {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(SigMode::Default),
            "ignore" => Ok(SigMode::Ignore),
            "assert" => Ok(SigMode::Assert),
            "build" => Ok(SigMode::Build),
            "force" => Ok(SigMode::Force),
            other => Err(StepError::validation(format!(
                "unsupported sig_mode '{other}' (supported: default, ignore, assert, build, force)"
            ))),
        }
    }
}

impl fmt::Display for SigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SigMode::Default => "default",
            SigMode::Ignore => "ignore",
            SigMode::Assert => "assert",
            SigMode::Build => "build",
            SigMode::Force => "force",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Run,
    /// Bodies are handed to the executor flagged as dry runs; no signatures are written.
    DryRun,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sig_mode: SigMode,
    pub run_mode: RunMode,
    /// Process-wide budget of concurrent substep workers.
    pub max_procs: usize,
    /// Base directory for relative targets and engine state.
    pub workdir: PathBuf,
    /// Queue used for tasks that do not name one.
    pub default_queue: String,
    /// Time given to pool workers to exit after an interrupt before escalation.
    pub terminate_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sig_mode: SigMode::Default,
            run_mode: RunMode::Run,
            max_procs: default_max_procs(),
            workdir: PathBuf::from("."),
            default_queue: "localhost".to_string(),
            terminate_grace: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from defaults overridden by `SUBSTEP_*` environment variables.
    ///
    /// Recognized:
    /// - `SUBSTEP_SIG_MODE` (default|ignore|assert|build|force)
    /// - `SUBSTEP_MAX_PROCS` (positive integer)
    /// - `SUBSTEP_WORKDIR`
    /// - `SUBSTEP_DRY_RUN` (1/true/yes)
    /// - `SUBSTEP_QUEUE`
    /// - `SUBSTEP_TERMINATE_GRACE_MS` (positive integer)
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = env_str("SUBSTEP_SIG_MODE") {
            cfg.sig_mode = v.parse()?;
        }
        if let Some(v) = env_str("SUBSTEP_MAX_PROCS") {
            cfg.max_procs = parse_positive("SUBSTEP_MAX_PROCS", &v)? as usize;
        }
        if let Some(v) = env_str("SUBSTEP_WORKDIR") {
            cfg.workdir = PathBuf::from(v);
        }
        if let Some(v) = env_str("SUBSTEP_DRY_RUN") {
            if matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                cfg.run_mode = RunMode::DryRun;
            }
        }
        if let Some(v) = env_str("SUBSTEP_QUEUE") {
            cfg.default_queue = v;
        }
        if let Some(v) = env_str("SUBSTEP_TERMINATE_GRACE_MS") {
            let ms = parse_positive("SUBSTEP_TERMINATE_GRACE_MS", &v)?;
            cfg.terminate_grace = Duration::from_millis(ms);
        }

        Ok(cfg)
    }

    pub fn is_dry_run(&self) -> bool {
        self.run_mode == RunMode::DryRun
    }

    /// Directory holding signatures, task files, and the event log.
    pub fn state_dir(&self) -> PathBuf {
        self.workdir.join(".substep")
    }
}

fn default_max_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_str(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    let parsed: u64 = raw.parse().map_err(|_| {
        StepError::validation(format!(
            "invalid {key}: '{raw}' (must be a positive integer)"
        ))
    })?;
    if parsed == 0 {
        return Err(StepError::validation(format!(
            "invalid {key}: '{raw}' (must be a positive integer)"
        )));
    }
    Ok(parsed)
}
