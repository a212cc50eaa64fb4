use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use substep::config::EngineConfig;
use substep::context::ExecutionContext;
use substep::executor::{BodyError, BodyOutput, BodyRequest, StatementExecutor};
use substep::slots::LocalSlots;
use substep::target::TargetSet;
use tempfile::TempDir;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // A test that panicked while holding the lock must not wedge the rest.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for test-only env var mutation, serialized with a global lock.
#[must_use]
#[allow(dead_code)]
pub struct EnvVarGuard {
    entries: Vec<(String, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

#[allow(dead_code)]
impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        let key: String = key.into();
        Self::set_many(&[(key.as_str(), value.as_ref())])
    }

    pub fn set_many(pairs: &[(&str, &OsStr)]) -> Self {
        let lock = env_lock();
        let mut entries = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            unsafe {
                env::set_var(key, value);
            }
            entries.push((key.to_string(), old));
        }
        Self {
            entries,
            _lock: lock,
        }
    }

    pub fn unset<K: Into<String>>(key: K) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);
        unsafe {
            env::remove_var(&key);
        }
        Self {
            entries: vec![(key, old)],
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        for (key, old) in &self.entries {
            unsafe {
                match old {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

pub fn workspace() -> TempDir {
    tempfile::tempdir().expect("create temp workspace")
}

/// Create `names` under `dir`, each holding its own name, and return their paths.
#[allow(dead_code)]
pub fn touch(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|n| {
            let p = dir.join(n);
            if let Some(parent) = p.parent() {
                fs::create_dir_all(parent).expect("create parent dir");
            }
            fs::write(&p, n).expect("write fixture file");
            p
        })
        .collect()
}

#[allow(dead_code)]
pub fn file_names(set: &TargetSet) -> Vec<String> {
    set.paths()
        .iter()
        .map(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .collect()
}

#[allow(dead_code)]
pub fn config_in(dir: &Path) -> EngineConfig {
    EngineConfig {
        workdir: dir.to_path_buf(),
        max_procs: 4,
        terminate_grace: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

#[allow(dead_code)]
pub fn context_with_input(step: &str, input: &[PathBuf]) -> ExecutionContext {
    ExecutionContext::new("wf-test", step).with_step_input(TargetSet::from_paths(input.to_vec()))
}

#[allow(dead_code)]
pub fn private_slots() -> Arc<LocalSlots> {
    Arc::new(LocalSlots::new())
}

/// One body invocation as seen by [`RecordingExecutor`].
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Call {
    pub index: usize,
    pub input: Vec<String>,
    pub started: Instant,
    pub finished: Instant,
    pub dry_run: bool,
}

type Behavior = dyn Fn(&BodyRequest) -> Result<BodyOutput, BodyError> + Send + Sync;

/// Executor that records every call, writes each declared output file, then
/// defers to an optional behavior.
#[allow(dead_code)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    behavior: Option<Box<Behavior>>,
}

#[allow(dead_code)]
impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            behavior: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_behavior<F>(mut self, f: F) -> Self
    where
        F: Fn(&BodyRequest) -> Result<BodyOutput, BodyError> + Send + Sync + 'static,
    {
        self.behavior = Some(Box::new(f));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

impl StatementExecutor for RecordingExecutor {
    fn execute(&self, req: &BodyRequest) -> Result<BodyOutput, BodyError> {
        let started = Instant::now();
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = match &self.behavior {
            Some(f) => f(req),
            None => Ok(BodyOutput::default()),
        };
        if result.is_ok() && !req.dry_run {
            for p in req.output.paths() {
                fs::write(p, format!("produced by substep {}", req.index))
                    .expect("write declared output");
            }
        }
        self.calls.lock().expect("calls lock").push(Call {
            index: req.index,
            input: req.input.iter().map(|t| t.to_string()).collect(),
            started,
            finished: Instant::now(),
            dry_run: req.dry_run,
        });
        result
    }
}
