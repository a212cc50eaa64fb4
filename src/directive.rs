use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::{interpolate, Binding, ExecutionContext, Namespace};
use crate::error::{Result, StepError};
use crate::grouping::{build_groups, GroupBy, SubstepGroup};
use crate::resolve::{expand_input_files, value_kind, ArgValue};
use crate::step::{Arg, Directive, DirectiveKind, StepSpec};
use crate::target::{Target, TargetSet};

/// Evaluate a pre-parsed argument against the context.
pub fn eval_arg(arg: &Arg, ctx: &ExecutionContext) -> Result<ArgValue> {
    match arg {
        Arg::Literal(v) => Ok(ArgValue::Value(v.clone())),
        Arg::Var { var } => match ctx.lookup(var) {
            Some(Binding::Targets(set)) => Ok(ArgValue::Targets(set.clone())),
            Some(Binding::Value(v)) => Ok(ArgValue::Value(v.clone())),
            None => Err(StepError::validation(format!(
                "undefined variable '{var}' in step '{}'",
                ctx.step_name
            ))),
        },
        Arg::Format { format } => Ok(ArgValue::Value(Value::String(interpolate(format, ctx)?))),
        Arg::Target { target } => Ok(ArgValue::Target(target.clone())),
    }
}

pub fn eval_args(d: &Directive, ctx: &ExecutionContext) -> Result<Vec<ArgValue>> {
    d.args.iter().map(|a| eval_arg(a, ctx)).collect()
}

/// Keyword options as plain values; targets render as their display strings.
pub fn eval_options(d: &Directive, ctx: &ExecutionContext) -> Result<BTreeMap<String, Value>> {
    d.check_options()?;
    let mut out = BTreeMap::new();
    for (k, a) in &d.options {
        out.insert(k.clone(), into_value(eval_arg(a, ctx)?));
    }
    Ok(out)
}

fn into_value(v: ArgValue) -> Value {
    match v {
        ArgValue::Value(v) => v,
        ArgValue::Target(t) => Value::String(t.to_string()),
        ArgValue::Targets(set) => {
            Value::Array(set.iter().map(|t| Value::String(t.to_string())).collect())
        }
    }
}

/// Resolve the step input and partition it into substep groups.
///
/// Without an input directive (or with one that has no arguments) the step
/// consumes `step_input` as handed over by the previous step.
pub fn process_input(step: &StepSpec, ctx: &mut ExecutionContext) -> Result<Vec<SubstepGroup>> {
    let inherited = if ctx.step_input.is_unspecified() {
        TargetSet::new()
    } else {
        ctx.step_input.clone()
    };

    let (input, options) = match step.input_directive() {
        Some(d) => {
            let options = eval_options(d, ctx)?;
            let input = if d.args.is_empty() {
                inherited
            } else {
                expand_input_files(&eval_args(d, ctx)?, false)?
            };
            (input, options)
        }
        None => (inherited, BTreeMap::new()),
    };

    let groups = build_groups(&input, &options, &mut ctx.vars)?;
    debug!(
        step = %ctx.step_name,
        targets = input.len(),
        groups = groups.len(),
        "resolved step input"
    );
    ctx.step_input = input;
    Ok(groups)
}

/// Per-substep directive state that spans substeps of one invocation.
#[derive(Debug)]
pub struct DirectiveProcessor {
    num_substeps: usize,
    output_groups: Option<Vec<TargetSet>>,
}

impl DirectiveProcessor {
    pub fn new(num_substeps: usize) -> Self {
        Self {
            num_substeps,
            output_groups: None,
        }
    }

    /// Apply one directive of the current substep. Only `task:` yields runtime options.
    pub fn process(
        &mut self,
        d: &Directive,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<RuntimeOptions>> {
        match d.kind {
            // Handled once per step by `process_input`.
            DirectiveKind::Input => Ok(None),
            DirectiveKind::Output => {
                self.process_output(d, ctx)?;
                Ok(None)
            }
            DirectiveKind::Depends => {
                self.process_depends(d, ctx)?;
                Ok(None)
            }
            DirectiveKind::Task => self.process_task(d, ctx).map(Some),
        }
    }

    pub fn process_output(&mut self, d: &Directive, ctx: &mut ExecutionContext) -> Result<()> {
        let options = eval_options(d, ctx)?;

        let output = match options.get("group_by") {
            Some(group_by) => self.grouped_output(d, group_by, ctx)?,
            None => expand_input_files(&eval_args(d, ctx)?, true)?,
        };

        if !ctx.step_output.is_undetermined() {
            if let Some(t) = output.overlap(&ctx.input) {
                return Err(StepError::validation(format!(
                    "step '{}' declares its input {t} as output (self-referential output)",
                    ctx.step_name
                )));
            }
        }

        for path in output.paths() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create output directory '{}'", parent.display())
                    })?;
                }
            }
        }

        if !output.is_undetermined() {
            append_step_output(&mut ctx.step_output, &output, &ctx.step_name)?;
        }
        debug!(step = %ctx.step_name, index = ctx.index, output = %output, "declared output");
        ctx.output = output;
        Ok(())
    }

    fn grouped_output(
        &mut self,
        d: &Directive,
        group_by: &Value,
        ctx: &ExecutionContext,
    ) -> Result<TargetSet> {
        if self.output_groups.is_none() {
            let all = expand_input_files(&eval_args(d, ctx)?, true)?;
            let parts = GroupBy::from_value(group_by)?.partition(all.len())?;
            if parts.len() != self.num_substeps {
                return Err(StepError::validation(format!(
                    "output group_by produced {} groups but step '{}' has {} substeps",
                    parts.len(),
                    ctx.step_name,
                    self.num_substeps
                )));
            }
            self.output_groups = Some(
                parts
                    .iter()
                    .map(|p| TargetSet::from_targets(p.iter().filter_map(|&i| all.get(i).cloned())))
                    .collect(),
            );
        }
        self.output_groups
            .as_ref()
            .and_then(|groups| groups.get(ctx.index))
            .cloned()
            .ok_or_else(|| {
                StepError::Invariant(format!("no output group for substep {}", ctx.index))
            })
    }

    pub fn process_depends(&self, d: &Directive, ctx: &mut ExecutionContext) -> Result<()> {
        d.check_options()?;
        let args = eval_args(d, ctx)?;
        if let Some(t) = args.iter().find_map(dynamic_member) {
            return Err(StepError::Invariant(format!(
                "depends of step '{}' contains undetermined target {t}",
                ctx.step_name
            )));
        }

        let depends = expand_input_files(&args, false)?;
        if ctx.step_depends.targets() != depends.targets() {
            ctx.step_depends.extend(&depends);
        }
        ctx.depends = depends;
        Ok(())
    }

    pub fn process_task(&self, d: &Directive, ctx: &mut ExecutionContext) -> Result<RuntimeOptions> {
        let options = eval_options(d, ctx)?;
        let runtime = RuntimeOptions::from_options(&options)?;
        let value = serde_json::to_value(&runtime).context("failed to serialize runtime options")?;
        ctx.set_var("_runtime", value);
        Ok(runtime)
    }
}

fn dynamic_member(v: &ArgValue) -> Option<&Target> {
    match v {
        ArgValue::Target(t) if t.is_dynamic() => Some(t),
        ArgValue::Targets(set) => set.iter().find(|t| t.is_dynamic()),
        _ => None,
    }
}

/// Claim `output` for the current substep, rejecting targets an earlier substep produces.
pub fn append_step_output(step_output: &mut TargetSet, output: &TargetSet, step: &str) -> Result<()> {
    if let Some(t) = step_output.overlap(output) {
        return Err(StepError::validation(format!(
            "output {t} of step '{step}' is already produced by a previous substep"
        )));
    }
    step_output.extend(output);
    Ok(())
}

/// Resource options of a `task:` directive, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// `HH:MM:SS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,
    /// Bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u64>,
    pub trunk_size: usize,
    pub trunk_workers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            walltime: None,
            mem: None,
            cores: None,
            nodes: None,
            trunk_size: 1,
            trunk_workers: 1,
            queue: None,
            tags: Vec::new(),
            workdir: None,
        }
    }
}

impl RuntimeOptions {
    pub fn from_options(options: &BTreeMap<String, Value>) -> Result<Self> {
        let mut rt = RuntimeOptions::default();
        for (key, v) in options {
            match key.as_str() {
                "walltime" => rt.walltime = Some(normalize_walltime(v)?),
                "mem" => rt.mem = Some(normalize_mem(v)?),
                "cores" => rt.cores = Some(positive(key, v)?),
                "nodes" => rt.nodes = Some(positive(key, v)?),
                "trunk_size" => rt.trunk_size = positive(key, v)? as usize,
                "trunk_workers" => rt.trunk_workers = positive(key, v)? as usize,
                "queue" => rt.queue = Some(string_option(key, v)?),
                "workdir" => rt.workdir = Some(PathBuf::from(string_option(key, v)?)),
                "tags" => {
                    rt.tags = match v {
                        Value::Array(items) => items
                            .iter()
                            .map(|i| string_option(key, i))
                            .collect::<Result<_>>()?,
                        other => vec![string_option(key, other)?],
                    }
                }
                other => {
                    return Err(StepError::validation(format!(
                        "unrecognized option '{other}' for task directive (allowed: {})",
                        DirectiveKind::Task.allowed_options().join(", ")
                    )))
                }
            }
        }
        Ok(rt)
    }
}

fn positive(key: &str, v: &Value) -> Result<u64> {
    let n = match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    match n {
        Some(n) if n > 0 => Ok(n),
        _ => Err(StepError::validation(format!(
            "task option '{key}' must be a positive integer, got {v}"
        ))),
    }
}

fn string_option(key: &str, v: &Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(StepError::validation(format!(
            "task option '{key}' must be a string, got {} {other}",
            value_kind(other)
        ))),
    }
}

/// Seconds, `HH:MM:SS`, or unit strings such as `1h30m`, `2d`, `90s`.
pub fn normalize_walltime(v: &Value) -> Result<String> {
    let bad = || {
        StepError::validation(format!(
            "invalid walltime {v} (expected seconds, HH:MM:SS, or a string like 1h30m)"
        ))
    };
    let secs: u64 = match v {
        Value::Number(n) => n.as_u64().ok_or_else(bad)?,
        Value::String(s) => {
            let s = s.trim();
            if s.contains(':') {
                let parts: Vec<&str> = s.split(':').collect();
                if parts.len() != 3 {
                    return Err(bad());
                }
                let mut total = 0u64;
                for (part, scale) in parts.iter().zip([3600u64, 60, 1]) {
                    let n: u64 = part.trim().parse().map_err(|_| bad())?;
                    if scale != 3600 && n >= 60 {
                        return Err(bad());
                    }
                    total = n
                        .checked_mul(scale)
                        .and_then(|v| total.checked_add(v))
                        .ok_or_else(bad)?;
                }
                total
            } else if let Ok(n) = s.parse::<u64>() {
                n
            } else {
                let mut total = 0u64;
                let mut digits = String::new();
                for c in s.chars().filter(|c| !c.is_whitespace()) {
                    if c.is_ascii_digit() {
                        digits.push(c);
                        continue;
                    }
                    let scale = match c.to_ascii_lowercase() {
                        'd' => 86_400,
                        'h' => 3_600,
                        'm' => 60,
                        's' => 1,
                        _ => return Err(bad()),
                    };
                    let n: u64 = digits.parse().map_err(|_| bad())?;
                    total = n
                        .checked_mul(scale)
                        .and_then(|v| total.checked_add(v))
                        .ok_or_else(bad)?;
                    digits.clear();
                }
                if !digits.is_empty() {
                    return Err(bad());
                }
                total
            }
        }
        _ => return Err(bad()),
    };
    Ok(format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    ))
}

/// Byte count from an integer or strings like `500M`, `1.5GB`, `4GiB`.
///
/// Decimal units (`K`, `KB`, ...) are powers of 1000, binary units (`KiB`, ...) of 1024.
pub fn normalize_mem(v: &Value) -> Result<u64> {
    let bad = || {
        StepError::validation(format!(
            "invalid mem {v} (expected bytes or a size like 500M, 2G, 4GiB)"
        ))
    };
    match v {
        Value::Number(n) => n.as_u64().ok_or_else(bad),
        Value::String(s) => {
            let s = s.trim();
            let split = s
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(s.len());
            let (num, unit) = s.split_at(split);
            let num: f64 = num.parse().map_err(|_| bad())?;
            let scale: f64 = match unit.trim().to_ascii_lowercase().as_str() {
                "" | "b" => 1.0,
                "k" | "kb" => 1e3,
                "m" | "mb" => 1e6,
                "g" | "gb" => 1e9,
                "t" | "tb" => 1e12,
                "kib" => 1024.0,
                "mib" => 1024f64.powi(2),
                "gib" => 1024f64.powi(3),
                "tib" => 1024f64.powi(4),
                _ => return Err(bad()),
            };
            let bytes = (num * scale).round();
            // u64::MAX is not representable; 2^64 is the first rejected value.
            if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
                return Err(bad());
            }
            Ok(bytes as u64)
        }
        _ => Err(bad()),
    }
}
