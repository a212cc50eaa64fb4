use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SigMode;
use crate::context::{ExecutionContext, Vars};
use crate::error::{Result, StepError};
use crate::step::{sort_value, StepSpec};
use crate::target::{hash_bytes, ExistMode, Target, TargetSet};

/// Identity of one substep run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSignature {
    pub id: String,
    pub step_name: String,
    pub index: usize,
    pub step_hash: String,
    pub input: TargetSet,
    /// Output as declared; may still hold dynamic members.
    pub output: TargetSet,
    pub depends: TargetSet,
    pub vars: Vars,
}

impl RuntimeSignature {
    /// The id covers step content, target declarations and the accessed
    /// variable values, but not the substep index: identical substeps are
    /// interchangeable.
    pub fn new(
        step_hash: &str,
        ctx: &ExecutionContext,
        signature_vars: &BTreeSet<String>,
    ) -> Result<Self> {
        let vars = ctx.closure(signature_vars);
        let mut canonical = serde_json::json!({
            "step": step_hash,
            "input": ctx.input.targets(),
            "output": ctx.output.targets(),
            "depends": ctx.depends.targets(),
            "vars": vars,
        });
        sort_value(&mut canonical);
        let bytes = serde_json::to_vec(&canonical).context("failed to serialize signature")?;

        Ok(Self {
            id: hash_bytes(&bytes),
            step_name: ctx.step_name.clone(),
            index: ctx.index,
            step_hash: step_hash.to_string(),
            input: ctx.input.clone(),
            output: ctx.output.clone(),
            depends: ctx.depends.clone(),
            vars,
        })
    }

    /// Persistable record, fingerprinting every target as it exists now.
    pub fn record(&self, output: &TargetSet, shared: Vars) -> Result<SignatureRecord> {
        Ok(SignatureRecord {
            id: self.id.clone(),
            step_name: self.step_name.clone(),
            input: fingerprints(&self.input)?,
            depends: fingerprints(&self.depends)?,
            output: fingerprints(output)?,
            restored_output: output.clone(),
            shared,
        })
    }
}

fn fingerprints(set: &TargetSet) -> Result<Vec<Fingerprint>> {
    set.iter()
        .map(|t| {
            Ok(Fingerprint {
                target: t.clone(),
                digest: t.fingerprint()?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub target: Target,
    pub digest: String,
}

impl Fingerprint {
    fn is_current(&self) -> bool {
        self.target
            .fingerprint()
            .map(|d| d == self.digest)
            .unwrap_or(false)
    }
}

/// Persisted result of a completed substep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub id: String,
    pub step_name: String,
    pub input: Vec<Fingerprint>,
    pub depends: Vec<Fingerprint>,
    pub output: Vec<Fingerprint>,
    /// Concrete output the run produced; restored on skip.
    pub restored_output: TargetSet,
    #[serde(default)]
    pub shared: Vars,
}

impl SignatureRecord {
    /// Whether every recorded target still has its recorded fingerprint.
    pub fn matches(&self) -> bool {
        self.input
            .iter()
            .chain(&self.depends)
            .chain(&self.output)
            .all(Fingerprint::is_current)
    }
}

/// Per-substep signature state.
#[derive(Debug, Clone, PartialEq)]
pub enum SigState {
    NoSignature,
    /// Execute, then write.
    Pending(RuntimeSignature),
    /// Skip; restore recorded output and shared variables.
    MatchedSkip(SignatureRecord),
    /// Existing outputs adopted without executing.
    MatchedRebuild(SignatureRecord),
    /// Written after execution.
    Released,
}

impl SigState {
    pub fn skips_body(&self) -> bool {
        matches!(self, SigState::MatchedSkip(_) | SigState::MatchedRebuild(_))
    }

    pub fn pending(&self) -> Option<&RuntimeSignature> {
        match self {
            SigState::Pending(sig) => Some(sig),
            _ => None,
        }
    }
}

/// Held while a body runs under a signature; released on drop.
pub struct SignatureLock {
    id: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl SignatureLock {
    pub fn new(id: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: id.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SignatureLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for SignatureLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureLock").field("id", &self.id).finish()
    }
}

pub trait SignatureStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<SignatureRecord>>;

    fn write(&self, record: &SignatureRecord) -> Result<bool>;

    /// Advisory lock; `UnavailableLock` when another actor holds it.
    fn lock(&self, id: &str) -> Result<SignatureLock>;

    /// Stored record for `sig` if it still matches the targets on disk.
    fn validate(&self, sig: &RuntimeSignature) -> Result<Option<SignatureRecord>> {
        Ok(self.load(&sig.id)?.filter(SignatureRecord::matches))
    }
}

/// JSON records and lock files in one directory.
#[derive(Debug, Clone)]
pub struct FileSignatureStore {
    dir: PathBuf,
}

impl FileSignatureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `<state_dir>/signatures`.
    pub fn under(state_dir: &Path) -> Self {
        Self::new(state_dir.join("signatures"))
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }
}

impl SignatureStore for FileSignatureStore {
    fn load(&self, id: &str) -> Result<Option<SignatureRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read signature '{}'", path.display()))?;
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse signature '{}'", path.display()))?;
        Ok(Some(record))
    }

    fn write(&self, record: &SignatureRecord) -> Result<bool> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create signature dir '{}'", self.dir.display())
        })?;
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let body =
            serde_json::to_string_pretty(record).context("failed to serialize signature")?;
        fs::write(&tmp, body)
            .with_context(|| format!("failed to write signature '{}'", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to commit signature '{}'", path.display()))?;
        Ok(true)
    }

    fn lock(&self, id: &str) -> Result<SignatureLock> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create signature dir '{}'", self.dir.display())
        })?;
        let path = self.lock_path(id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StepError::UnavailableLock(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        Ok(SignatureLock::new(id, move || {
            let _ = fs::remove_file(&path);
        }))
    }
}

/// In-memory store that counts writes.
#[derive(Debug, Default, Clone)]
pub struct MemorySignatureStore {
    records: Arc<Mutex<BTreeMap<String, SignatureRecord>>>,
    locks: Arc<Mutex<HashSet<String>>>,
    writes: Arc<AtomicUsize>,
}

impl MemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SignatureStore for MemorySignatureStore {
    fn load(&self, id: &str) -> Result<Option<SignatureRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow!("signature store lock poisoned"))?;
        Ok(records.get(id).cloned())
    }

    fn write(&self, record: &SignatureRecord) -> Result<bool> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("signature store lock poisoned"))?;
        records.insert(record.id.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn lock(&self, id: &str) -> Result<SignatureLock> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("signature store lock poisoned"))?;
        if !locks.insert(id.to_string()) {
            return Err(StepError::UnavailableLock(id.to_string()));
        }
        let held = Arc::clone(&self.locks);
        let key = id.to_string();
        Ok(SignatureLock::new(id, move || {
            if let Ok(mut locks) = held.lock() {
                locks.remove(&key);
            }
        }))
    }
}

/// Decides execute-versus-skip for each substep and writes signatures.
pub struct SignatureEngine<'a> {
    mode: SigMode,
    dry_run: bool,
    store: &'a dyn SignatureStore,
}

impl<'a> SignatureEngine<'a> {
    pub fn new(mode: SigMode, dry_run: bool, store: &'a dyn SignatureStore) -> Self {
        Self {
            mode,
            dry_run,
            store,
        }
    }

    pub fn store(&self) -> &'a dyn SignatureStore {
        self.store
    }

    pub fn decide(&self, step: &StepSpec, step_hash: &str, ctx: &ExecutionContext) -> Result<SigState> {
        if self.mode == SigMode::Ignore || ctx.output.is_unspecified() || self.dry_run {
            return Ok(SigState::NoSignature);
        }

        let sig = RuntimeSignature::new(step_hash, ctx, &step.signature_vars)?;
        if self.mode == SigMode::Force {
            return Ok(SigState::Pending(sig));
        }
        if step.invokes_nested_workflow() {
            debug!(step = %step.name, index = ctx.index, "nested workflow call disables signature checks");
            return Ok(SigState::NoSignature);
        }

        let state = match self.mode {
            SigMode::Default => match self.store.validate(&sig)? {
                Some(rec) => SigState::MatchedSkip(rec),
                None => SigState::Pending(sig),
            },
            SigMode::Assert => match self.store.validate(&sig)? {
                Some(rec) => SigState::MatchedSkip(rec),
                None => {
                    return Err(StepError::SignatureMismatch {
                        step: step.name.clone(),
                        index: ctx.index,
                    })
                }
            },
            SigMode::Build => self.rebuild(sig, ctx)?,
            SigMode::Ignore | SigMode::Force => SigState::NoSignature,
        };
        debug!(
            step = %step.name,
            index = ctx.index,
            mode = %self.mode,
            state = state_name(&state),
            "signature decision"
        );
        Ok(state)
    }

    fn rebuild(&self, sig: RuntimeSignature, ctx: &ExecutionContext) -> Result<SigState> {
        let adoptable = ctx.output.is_valid()
            && !ctx.output.is_empty()
            && ctx.output.iter().all(|t| t.exists(ExistMode::Target));
        if !adoptable {
            return Ok(SigState::Pending(sig));
        }
        let record = sig.record(&ctx.output, Vars::new())?;
        self.store.write(&record)?;
        Ok(SigState::MatchedRebuild(record))
    }

    /// Write a pending signature against the finalized output.
    pub fn finalize(&self, state: SigState, output: &TargetSet, shared: Vars) -> Result<SigState> {
        match state {
            SigState::Pending(sig) => {
                let record = sig.record(output, shared)?;
                self.store.write(&record)?;
                Ok(SigState::Released)
            }
            other => Ok(other),
        }
    }
}

pub fn state_name(state: &SigState) -> &'static str {
    match state {
        SigState::NoSignature => "no-signature",
        SigState::Pending(_) => "pending",
        SigState::MatchedSkip(_) => "matched-skip",
        SigState::MatchedRebuild(_) => "matched-rebuild",
        SigState::Released => "released",
    }
}
