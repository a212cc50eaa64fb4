use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, StepError};
use crate::target::{glob_paths, has_wildcard, ExistMode, Target, TargetSet};

/// A directive argument after evaluation against the context.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Value(Value),
    Target(Target),
    Targets(TargetSet),
}

enum Item {
    Raw(String),
    Target(Target),
}

/// Expand raw directive values into one concrete target set.
///
/// Strings are paths (with `~` expansion) and fall back to glob patterns when
/// the literal path does not exist. With `ignore_unknown` (prospective
/// outputs) nothing needs to exist, and a list without wildcards is returned
/// as declared.
pub fn expand_input_files(items: &[ArgValue], ignore_unknown: bool) -> Result<TargetSet> {
    let mut flat = Vec::new();
    for item in items {
        flatten(item, &mut flat)?;
    }

    let no_wildcards = flat.iter().all(|i| match i {
        Item::Raw(s) => !has_wildcard(s),
        Item::Target(_) => true,
    });
    if ignore_unknown && no_wildcards {
        return Ok(TargetSet::from_targets(flat.into_iter().map(|i| match i {
            Item::Raw(s) => Target::File(expand_home(&s)),
            Item::Target(t) => t,
        })));
    }

    let mut out = TargetSet::new();
    for item in flat {
        match item {
            Item::Raw(s) => resolve_path(&s, ignore_unknown, &mut out)?,
            Item::Target(Target::File(p)) => {
                resolve_path(&p.to_string_lossy(), ignore_unknown, &mut out)?
            }
            Item::Target(Target::Dynamic(pattern)) => {
                if ignore_unknown {
                    out.push(Target::Dynamic(pattern));
                } else {
                    let matches = glob_paths(&pattern)?;
                    if matches.is_empty() {
                        return Err(StepError::UnknownTarget(pattern));
                    }
                    for m in matches {
                        out.push(Target::File(m));
                    }
                }
            }
            Item::Target(t) => {
                if !ignore_unknown && !t.exists(ExistMode::Target) {
                    return Err(StepError::UnknownTarget(t.to_string()));
                }
                out.push(t);
            }
        }
    }
    Ok(out)
}

fn flatten(item: &ArgValue, out: &mut Vec<Item>) -> Result<()> {
    match item {
        ArgValue::Target(t) => out.push(Item::Target(t.clone())),
        ArgValue::Targets(set) => out.extend(set.iter().cloned().map(Item::Target)),
        ArgValue::Value(v) => flatten_value(v, out)?,
    }
    Ok(())
}

fn flatten_value(v: &Value, out: &mut Vec<Item>) -> Result<()> {
    match v {
        Value::String(s) => out.push(Item::Raw(s.clone())),
        Value::Array(items) => {
            for item in items {
                flatten_value(item, out)?;
            }
        }
        other => {
            return Err(StepError::Resolution {
                value: other.to_string(),
                kind: value_kind(other).to_string(),
            })
        }
    }
    Ok(())
}

fn resolve_path(raw: &str, ignore_unknown: bool, out: &mut TargetSet) -> Result<()> {
    let path = expand_home(raw);
    let target = Target::File(path.clone());

    if target.exists(ExistMode::Target) {
        out.push(target);
        return Ok(());
    }
    if target.exists(ExistMode::Any) {
        debug!(path = %target, "accepting zapped target");
        out.push(target);
        return Ok(());
    }

    let pattern = path.to_string_lossy();
    if has_wildcard(&pattern) {
        let matches = glob_paths(&pattern)?;
        if matches.is_empty() {
            if !ignore_unknown {
                return Err(StepError::UnknownTarget(pattern.into_owned()));
            }
            out.push(target);
        }
        for m in matches {
            out.push(Target::File(m));
        }
        return Ok(());
    }

    if ignore_unknown {
        out.push(target);
        Ok(())
    } else {
        Err(StepError::UnknownTarget(pattern.into_owned()))
    }
}

pub fn expand_home(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

pub fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
