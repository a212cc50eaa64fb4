use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StepError};

/// Suffix of the marker left behind when a file's content was removed but its
/// signature kept.
pub const ZAPPED_SUFFIX: &str = ".zapped";

/// Something a step depends on or produces.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    File(PathBuf),
    /// A program that must be found on `PATH`.
    Executable(String),
    /// An environment variable that must be set.
    EnvVar(String),
    /// Completion of another step. Ordering is the workflow scheduler's job, so
    /// by the time a step runs its step targets exist.
    Step(String),
    /// A glob whose matches are only known after the body runs.
    Dynamic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistMode {
    /// The target is materialized right now.
    Target,
    /// The target is materialized or was zapped.
    Any,
}

impl Target {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Target::File(path.into())
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Target::File(_))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Target::Dynamic(_))
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Target::File(p) => Some(p.as_path()),
            _ => None,
        }
    }

    pub fn exists(&self, mode: ExistMode) -> bool {
        match self {
            Target::File(p) => {
                p.exists() || (mode == ExistMode::Any && zapped_path(p).exists())
            }
            Target::Executable(name) => which::which(name).is_ok(),
            Target::EnvVar(name) => std::env::var_os(name).is_some(),
            Target::Step(_) => true,
            Target::Dynamic(_) => false,
        }
    }

    /// Content identity used by run signatures.
    pub fn fingerprint(&self) -> Result<String> {
        match self {
            Target::File(p) => {
                if !p.exists() && zapped_path(p).exists() {
                    // A zapped file keeps the fingerprint of its removed content.
                    let raw = fs::read_to_string(zapped_path(p)).with_context(|| {
                        format!("failed to read zapped marker for '{}'", p.display())
                    })?;
                    return Ok(raw.trim().to_string());
                }
                if p.is_dir() {
                    return dir_fingerprint(p);
                }
                let bytes = fs::read(p)
                    .with_context(|| format!("failed to fingerprint '{}'", p.display()))?;
                Ok(hash_bytes(&bytes))
            }
            Target::Executable(name) => {
                let path = which::which(name)
                    .map_err(|_| StepError::UnknownTarget(self.to_string()))?;
                Ok(hash_bytes(path.to_string_lossy().as_bytes()))
            }
            Target::EnvVar(name) => {
                let value = std::env::var(name)
                    .map_err(|_| StepError::UnknownTarget(self.to_string()))?;
                Ok(hash_bytes(value.as_bytes()))
            }
            Target::Step(name) => Ok(hash_bytes(name.as_bytes())),
            Target::Dynamic(_) => Err(StepError::Invariant(format!(
                "cannot fingerprint undetermined target {self}"
            ))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File(p) => write!(f, "{}", p.display()),
            Target::Executable(n) => write!(f, "executable({n})"),
            Target::EnvVar(n) => write!(f, "env_var({n})"),
            Target::Step(n) => write!(f, "step({n})"),
            Target::Dynamic(p) => write!(f, "dynamic({p})"),
        }
    }
}

pub fn zapped_path(p: &Path) -> PathBuf {
    let mut s = p.as_os_str().to_os_string();
    s.push(ZAPPED_SUFFIX);
    PathBuf::from(s)
}

/// Digest over the sorted relative paths and contents of everything under `root`.
fn dir_fingerprint(root: &Path) -> Result<String> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();

    let mut h = Sha256::new();
    for path in &files {
        let rel = path.strip_prefix(root).unwrap_or(path);
        h.update(rel.to_string_lossy().as_bytes());
        h.update([0u8]);
        if path.is_file() {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to fingerprint '{}'", path.display()))?;
            h.update(hash_bytes(&bytes).as_bytes());
        }
        h.update([b'\n']);
    }
    Ok(format!("{:x}", h.finalize()))
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list directory '{}'", dir.display()))?;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to list directory '{}'", dir.display()))?;
        // Symlinked directories are hashed by name only, never followed.
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let path = entry.path();
        out.push(path.clone());
        if is_dir {
            collect_files(&path, out)?;
        }
    }
    Ok(())
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    format!("{:x}", h.finalize())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SetState {
    #[default]
    Valid,
    /// Holds dynamic members not yet resolved.
    Undetermined,
    /// Never declared (e.g. a step without an output directive).
    Unspecified,
}

/// Ordered, deduplicated collection of targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TargetSet {
    targets: Vec<Target>,
    #[serde(default)]
    state: SetState,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unspecified() -> Self {
        Self {
            targets: Vec::new(),
            state: SetState::Unspecified,
        }
    }

    pub fn from_targets<I: IntoIterator<Item = Target>>(targets: I) -> Self {
        let mut set = Self::new();
        for t in targets {
            set.push(t);
        }
        set
    }

    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::from_targets(paths.into_iter().map(|p| Target::File(p.into())))
    }

    pub fn state(&self) -> SetState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == SetState::Valid
    }

    pub fn is_undetermined(&self) -> bool {
        self.state == SetState::Undetermined
    }

    pub fn is_unspecified(&self) -> bool {
        self.state == SetState::Unspecified
    }

    /// Append unless already present. Adding a dynamic member makes the set undetermined.
    pub fn push(&mut self, target: Target) {
        if target.is_dynamic() {
            self.state = SetState::Undetermined;
        } else if self.state == SetState::Unspecified {
            self.state = SetState::Valid;
        }
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
    }

    pub fn extend(&mut self, other: &TargetSet) {
        if other.is_unspecified() {
            return;
        }
        if self.is_unspecified() {
            self.state = SetState::Valid;
        }
        for t in &other.targets {
            self.push(t.clone());
        }
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.targets.contains(target)
    }

    /// First member of `other` also present here.
    pub fn overlap<'a>(&self, other: &'a TargetSet) -> Option<&'a Target> {
        other.targets.iter().find(|t| self.contains(t))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Target> {
        self.targets.iter()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn get(&self, idx: usize) -> Option<&Target> {
        self.targets.get(idx)
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.targets.iter().filter_map(Target::as_path).collect()
    }

    /// Space-separated rendering used for interpolation and environment export.
    pub fn joined(&self) -> String {
        self.targets
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Replace dynamic members with their current glob matches, fixing the set.
    pub fn resolve_dynamic(&self) -> Result<TargetSet> {
        if !self.is_undetermined() {
            return Ok(self.clone());
        }
        let mut out = TargetSet::new();
        for t in &self.targets {
            match t {
                Target::Dynamic(pattern) => {
                    for path in glob_paths(pattern)? {
                        out.push(Target::File(path));
                    }
                }
                other => out.push(other.clone()),
            }
        }
        Ok(out)
    }
}

impl<'a> IntoIterator for &'a TargetSet {
    type Item = &'a Target;
    type IntoIter = std::slice::Iter<'a, Target>;

    fn into_iter(self) -> Self::IntoIter {
        self.targets.iter()
    }
}

impl fmt::Display for TargetSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

/// Sorted glob matches of `pattern`.
pub fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let entries = glob::glob(pattern).map_err(|err| {
        StepError::validation(format!("invalid glob pattern '{pattern}': {err}"))
    })?;
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.with_context(|| format!("failed to read glob match for '{pattern}'"))?;
        out.push(path);
    }
    out.sort();
    Ok(out)
}

pub fn has_wildcard(s: &str) -> bool {
    s.contains(|c| matches!(c, '*' | '?' | '['))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_deduplicates_and_keeps_order() {
        let mut set = TargetSet::new();
        set.push(Target::file("b.txt"));
        set.push(Target::file("a.txt"));
        set.push(Target::file("b.txt"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.joined(), "b.txt a.txt");
    }

    #[test]
    fn dynamic_member_makes_set_undetermined() {
        let mut set = TargetSet::new();
        set.push(Target::file("a.txt"));
        assert!(set.is_valid());
        set.push(Target::Dynamic("*.out".into()));
        assert!(set.is_undetermined());
    }

    #[test]
    fn extend_from_unspecified_is_noop() {
        let mut set = TargetSet::from_paths(["a"]);
        set.extend(&TargetSet::unspecified());
        assert!(set.is_valid());
        assert_eq!(set.len(), 1);

        let mut empty = TargetSet::unspecified();
        empty.extend(&TargetSet::from_paths(["x"]));
        assert!(empty.is_valid());
    }

    #[test]
    fn overlap_finds_shared_member() {
        let a = TargetSet::from_paths(["x", "y"]);
        let b = TargetSet::from_paths(["z", "y"]);
        assert_eq!(a.overlap(&b), Some(&Target::file("y")));
        assert_eq!(a.overlap(&TargetSet::from_paths(["q"])), None);
    }

    #[test]
    fn zapped_file_exists_only_in_any_mode() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("gone.txt");
        fs::write(zapped_path(&p), "abc123").unwrap();
        let t = Target::File(p);
        assert!(!t.exists(ExistMode::Target));
        assert!(t.exists(ExistMode::Any));
        assert_eq!(t.fingerprint().unwrap(), "abc123");
    }

    #[test]
    fn fingerprint_tracks_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.txt");
        fs::write(&p, "one").unwrap();
        let t = Target::File(p.clone());
        let first = t.fingerprint().unwrap();
        fs::write(&p, "two").unwrap();
        assert_ne!(first, t.fingerprint().unwrap());
    }

    #[test]
    fn directory_fingerprint_covers_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(data.join("sub")).unwrap();
        fs::write(data.join("a.txt"), "a").unwrap();
        fs::write(data.join("sub/b.txt"), "b").unwrap();
        let t = Target::File(data.clone());

        let first = t.fingerprint().unwrap();
        assert_eq!(first, t.fingerprint().unwrap());
        fs::write(data.join("sub/b.txt"), "changed").unwrap();
        let second = t.fingerprint().unwrap();
        assert_ne!(first, second);
        fs::write(data.join("c.txt"), "c").unwrap();
        assert_ne!(second, t.fingerprint().unwrap());
    }

    #[test]
    fn resolve_dynamic_globs_matches() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1.out"), "").unwrap();
        fs::write(dir.path().join("2.out"), "").unwrap();
        let pattern = format!("{}/*.out", dir.path().display());
        let set = TargetSet::from_targets([Target::Dynamic(pattern)]);
        let fixed = set.resolve_dynamic().unwrap();
        assert!(fixed.is_valid());
        assert_eq!(fixed.len(), 2);
    }

    #[test]
    fn step_targets_always_exist() {
        assert!(Target::Step("prepare".into()).exists(ExistMode::Target));
        assert!(!Target::Dynamic("*.x".into()).exists(ExistMode::Any));
    }
}
