use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::context::{is_reserved, Vars};
use crate::error::{Result, StepError};
use crate::resolve::value_kind;
use crate::target::{Target, TargetSet};

/// How resolved input targets are partitioned into substeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupBy {
    #[default]
    All,
    Single,
    /// First half zipped with second half.
    Pairs,
    /// Sliding window of two.
    Pairwise,
    /// Every unordered pair.
    Combinations,
    Chunk(usize),
}

impl GroupBy {
    pub fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::String(s) => match s.trim() {
                "all" => Ok(GroupBy::All),
                "single" => Ok(GroupBy::Single),
                "pairs" => Ok(GroupBy::Pairs),
                "pairwise" => Ok(GroupBy::Pairwise),
                "combinations" => Ok(GroupBy::Combinations),
                other => match other.parse::<i64>() {
                    Ok(n) => Self::chunk(n),
                    Err(_) => Err(StepError::validation(format!(
                        "unsupported group_by '{other}' (supported: all, single, pairs, pairwise, combinations, or a positive integer)"
                    ))),
                },
            },
            Value::Number(n) => match n.as_i64() {
                Some(n) => Self::chunk(n),
                None => Err(StepError::validation(format!(
                    "group_by must be a positive integer, got {n}"
                ))),
            },
            other => Err(StepError::validation(format!(
                "unsupported group_by value {other} of type {}",
                value_kind(other)
            ))),
        }
    }

    fn chunk(n: i64) -> Result<Self> {
        if n <= 0 {
            return Err(StepError::validation(format!(
                "group_by must be a positive integer, got {n}"
            )));
        }
        Ok(GroupBy::Chunk(n as usize))
    }

    /// Positions (into the original sequence) of each group.
    pub fn partition(self, n: usize) -> Result<Vec<Vec<usize>>> {
        let groups = match self {
            GroupBy::All => vec![(0..n).collect()],
            GroupBy::Single => (0..n).map(|i| vec![i]).collect(),
            GroupBy::Pairs => {
                if n % 2 != 0 {
                    return Err(StepError::validation(format!(
                        "group_by='pairs' requires an even number of input targets, got {n}"
                    )));
                }
                let half = n / 2;
                (0..half).map(|i| vec![i, i + half]).collect()
            }
            GroupBy::Pairwise => (0..n.saturating_sub(1)).map(|i| vec![i, i + 1]).collect(),
            GroupBy::Combinations => {
                let mut out = Vec::new();
                for i in 0..n {
                    for j in i + 1..n {
                        out.push(vec![i, j]);
                    }
                }
                out
            }
            GroupBy::Chunk(size) => {
                if n % size != 0 {
                    warn!(
                        targets = n,
                        group_size = size,
                        "number of input targets is not a multiple of group_by; last group is short"
                    );
                }
                (0..n)
                    .collect::<Vec<_>>()
                    .chunks(size)
                    .map(|c| c.to_vec())
                    .collect()
            }
        };
        Ok(groups)
    }
}

/// One substep's input plus the variables it was expanded with.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstepGroup {
    pub input: TargetSet,
    pub vars: Vars,
    positions: Vec<usize>,
}

impl SubstepGroup {
    /// Positions of this group's targets in the step input.
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }
}

/// Partition `targets` and apply the auxiliary expansions in their fixed
/// order: `paired_with`, `pattern`, `group_with`, `for_each`.
///
/// Pattern captures also become step-level variables, hence `vars` is mutable.
pub fn build_groups(
    targets: &TargetSet,
    options: &BTreeMap<String, Value>,
    vars: &mut Vars,
) -> Result<Vec<SubstepGroup>> {
    let group_by = match options.get("group_by") {
        Some(v) => GroupBy::from_value(v)?,
        None => GroupBy::All,
    };

    let mut groups: Vec<SubstepGroup> = group_by
        .partition(targets.len())?
        .into_iter()
        .map(|positions| SubstepGroup {
            input: TargetSet::from_targets(
                positions.iter().filter_map(|&p| targets.get(p).cloned()),
            ),
            vars: Vars::new(),
            positions,
        })
        .collect();

    if let Some(opt) = options.get("paired_with") {
        for (key, values) in named_sources(opt, vars, "paired_with")? {
            apply_paired(&mut groups, &key, &values, targets.len(), "paired_with")?;
        }
    }

    if let Some(opt) = options.get("pattern") {
        for (name, values) in extract_patterns(opt, targets)? {
            vars.insert(name.clone(), Value::Array(values.clone()));
            apply_paired(
                &mut groups,
                &format!("_{name}"),
                &values,
                targets.len(),
                "pattern",
            )?;
        }
    }

    if let Some(opt) = options.get("group_with") {
        for (key, values) in named_sources(opt, vars, "group_with")? {
            if values.len() != groups.len() {
                return Err(StepError::validation(format!(
                    "group_with '{key}' has {} values but the input produced {} groups",
                    values.len(),
                    groups.len()
                )));
            }
            for (group, value) in groups.iter_mut().zip(values) {
                group.vars.insert(key.clone(), value);
            }
        }
    }

    if let Some(opt) = options.get("for_each") {
        for entry in for_each_entries(opt, vars)? {
            groups = expand_for_each(groups, &entry);
        }
    }

    Ok(groups)
}

fn apply_paired(
    groups: &mut [SubstepGroup],
    key: &str,
    values: &[Value],
    input_len: usize,
    option: &str,
) -> Result<()> {
    if values.len() != input_len {
        return Err(StepError::validation(format!(
            "{option} '{key}' has {} values but there are {input_len} input targets",
            values.len()
        )));
    }
    for group in groups.iter_mut() {
        let picked = group
            .positions
            .iter()
            .map(|&p| values[p].clone())
            .collect();
        group.vars.insert(key.to_string(), Value::Array(picked));
    }
    Ok(())
}

/// Resolve a `paired_with`/`group_with` option into (group variable, values).
///
/// Names (a string, comma-separated names, or a list of names) are looked up
/// in `vars` and exposed as `_name`; a mapping supplies values directly under
/// its own keys.
fn named_sources(opt: &Value, vars: &Vars, option: &str) -> Result<Vec<(String, Vec<Value>)>> {
    let mut out = Vec::new();
    match opt {
        Value::String(s) => {
            for name in split_names(s) {
                out.push((format!("_{name}"), lookup_sequence(&name, vars, option)?));
            }
        }
        Value::Array(items) => {
            for item in items {
                let Value::String(s) = item else {
                    return Err(unsupported(option, item));
                };
                for name in split_names(s) {
                    out.push((format!("_{name}"), lookup_sequence(&name, vars, option)?));
                }
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                if is_reserved(k) {
                    return Err(StepError::validation(format!(
                        "{option} cannot assign reserved variable '{k}'"
                    )));
                }
                out.push((k.clone(), sequence(v, option, k)?));
            }
        }
        other => return Err(unsupported(option, other)),
    }
    Ok(out)
}

fn split_names(s: &str) -> Vec<String> {
    s.split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

fn lookup_sequence(name: &str, vars: &Vars, option: &str) -> Result<Vec<Value>> {
    let v = vars.get(name).ok_or_else(|| {
        StepError::validation(format!("{option} references undefined variable '{name}'"))
    })?;
    sequence(v, option, name)
}

/// Items of an iterable value: arrays yield their items, objects their keys.
fn sequence(v: &Value, option: &str, name: &str) -> Result<Vec<Value>> {
    match v {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map.keys().cloned().map(Value::String).collect()),
        other => Err(StepError::validation(format!(
            "{option} variable '{name}' must be a sequence, got {} {other}",
            value_kind(other)
        ))),
    }
}

fn unsupported(option: &str, v: &Value) -> StepError {
    StepError::validation(format!(
        "unsupported {option} value {v} of type {}",
        value_kind(v)
    ))
}

/// Per-name captured values (one per input target, null when a name did not match).
fn extract_patterns(opt: &Value, targets: &TargetSet) -> Result<Vec<(String, Vec<Value>)>> {
    let patterns: Vec<&str> = match opt {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .map(|i| i.as_str().ok_or_else(|| unsupported("pattern", i)))
            .collect::<Result<_>>()?,
        other => return Err(unsupported("pattern", other)),
    };

    let mut out = Vec::new();
    for pattern in patterns {
        let (re, names) = compile_pattern(pattern)?;
        for name in &names {
            if is_reserved(name) {
                return Err(StepError::validation(format!(
                    "pattern '{pattern}' captures reserved variable '{name}'"
                )));
            }
        }
        let mut values: Vec<Vec<Value>> = vec![Vec::with_capacity(targets.len()); names.len()];
        for target in targets {
            let caps = match target {
                Target::File(p) => re.captures(&p.to_string_lossy()).map(|c| {
                    names
                        .iter()
                        .map(|n| c.name(n).map(|m| m.as_str().to_string()))
                        .collect::<Vec<_>>()
                }),
                _ => None,
            };
            for (i, slot) in values.iter_mut().enumerate() {
                let v = caps
                    .as_ref()
                    .and_then(|c| c[i].clone())
                    .map(Value::String)
                    .unwrap_or(Value::Null);
                slot.push(v);
            }
        }
        out.extend(names.into_iter().zip(values));
    }
    Ok(out)
}

/// Translate `{name}` wildcards into an anchored regex.
pub fn compile_pattern(pattern: &str) -> Result<(Regex, Vec<String>)> {
    let mut re = String::from("^");
    let mut names: Vec<String> = Vec::new();
    let mut rest = pattern;

    while let Some(start) = rest.find('{') {
        re.push_str(&regex::escape(&rest[..start]));
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            StepError::validation(format!("unterminated '{{' in pattern '{pattern}'"))
        })?;
        let name = after[..end].trim();
        let valid = name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(StepError::validation(format!(
                "invalid wildcard name '{name}' in pattern '{pattern}'"
            )));
        }
        if names.iter().any(|n| n == name) {
            return Err(StepError::validation(format!(
                "wildcard '{name}' appears twice in pattern '{pattern}'"
            )));
        }
        re.push_str(&format!("(?P<{name}>.+?)"));
        names.push(name.to_string());
        rest = &after[end + 1..];
    }
    re.push_str(&regex::escape(rest));
    re.push('$');

    let compiled = Regex::new(&re).map_err(|err| {
        StepError::validation(format!("invalid pattern '{pattern}': {err}"))
    })?;
    Ok((compiled, names))
}

/// Co-iterated loop variables of one `for_each` entry.
type LoopEntry = Vec<(String, Vec<Value>)>;

fn for_each_entries(opt: &Value, vars: &Vars) -> Result<Vec<LoopEntry>> {
    let mut out = Vec::new();
    match opt {
        Value::String(s) => out.push(named_loop(s, vars)?),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => out.push(named_loop(s, vars)?),
                    Value::Object(_) => out.extend(for_each_entries(item, vars)?),
                    other => return Err(unsupported("for_each", other)),
                }
            }
        }
        Value::Object(map) => {
            for (key, v) in map {
                out.push(literal_loop(key, v)?);
            }
        }
        other => return Err(unsupported("for_each", other)),
    }
    Ok(out)
}

fn named_loop(spec: &str, vars: &Vars) -> Result<LoopEntry> {
    let names = split_names(spec);
    if names.is_empty() {
        return Err(StepError::validation("for_each requires at least one name"));
    }
    let mut entry = Vec::with_capacity(names.len());
    for name in names {
        let values = lookup_sequence(&name, vars, "for_each")?;
        entry.push((format!("_{name}"), values));
    }
    check_loop_lengths(spec, &entry)?;
    Ok(entry)
}

fn literal_loop(key: &str, v: &Value) -> Result<LoopEntry> {
    let names = split_names(key);
    for name in &names {
        if is_reserved(name) {
            return Err(StepError::validation(format!(
                "for_each cannot assign reserved variable '{name}'"
            )));
        }
    }
    let items = sequence(v, "for_each", key)?;
    if names.len() == 1 {
        return Ok(vec![(names[0].clone(), items)]);
    }

    let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(items.len()); names.len()];
    for item in &items {
        match item {
            Value::Array(parts) if parts.len() == names.len() => {
                for (col, part) in columns.iter_mut().zip(parts) {
                    col.push(part.clone());
                }
            }
            other => {
                return Err(StepError::validation(format!(
                    "for_each '{key}' expects items of {} values, got {other}",
                    names.len()
                )))
            }
        }
    }
    Ok(names.into_iter().zip(columns).collect())
}

fn check_loop_lengths(spec: &str, entry: &LoopEntry) -> Result<()> {
    let Some((_, first)) = entry.first() else {
        return Ok(());
    };
    for (name, values) in entry {
        if values.len() != first.len() {
            return Err(StepError::validation(format!(
                "for_each '{spec}': '{}' has {} values, expected {}",
                name.trim_start_matches('_'),
                values.len(),
                first.len()
            )));
        }
    }
    Ok(())
}

/// Replicate every group once per loop value, value-major.
fn expand_for_each(groups: Vec<SubstepGroup>, entry: &LoopEntry) -> Vec<SubstepGroup> {
    let loop_size = entry.first().map(|(_, v)| v.len()).unwrap_or(0);
    let mut out = Vec::with_capacity(groups.len() * loop_size);
    for i in 0..loop_size {
        for group in &groups {
            let mut g = group.clone();
            for (name, values) in entry {
                g.vars.insert(name.clone(), values[i].clone());
            }
            out.push(g);
        }
    }
    out
}
