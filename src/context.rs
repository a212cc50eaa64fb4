use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{Result, StepError};
use crate::target::{Target, TargetSet};

pub type Vars = BTreeMap<String, Value>;

/// Names owned by the engine; user variables and pattern captures may not reuse them.
pub const RESERVED_NAMES: &[&str] = &[
    "step_name",
    "step_input",
    "step_output",
    "step_depends",
    "_input",
    "_output",
    "_depends",
    "_index",
    "_runtime",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// A name looked up in a namespace.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a> {
    Value(&'a Value),
    Targets(&'a TargetSet),
}

pub trait Namespace {
    fn lookup(&self, name: &str) -> Option<Binding<'_>>;
}

impl Namespace for Vars {
    fn lookup(&self, name: &str) -> Option<Binding<'_>> {
        self.get(name).map(Binding::Value)
    }
}

/// Everything one step invocation reads and writes, passed explicitly to each component.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub step_name: String,
    pub vars: Vars,
    pub step_input: TargetSet,
    pub step_output: TargetSet,
    pub step_depends: TargetSet,
    /// Current substep.
    pub index: usize,
    pub input: TargetSet,
    pub output: TargetSet,
    pub depends: TargetSet,
    index_value: Value,
    step_name_value: Value,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        let step_name = step_name.into();
        Self {
            workflow_id: workflow_id.into(),
            step_name_value: Value::String(step_name.clone()),
            step_name,
            vars: Vars::new(),
            step_input: TargetSet::unspecified(),
            step_output: TargetSet::unspecified(),
            step_depends: TargetSet::new(),
            index: 0,
            input: TargetSet::new(),
            output: TargetSet::unspecified(),
            depends: TargetSet::new(),
            index_value: Value::from(0),
        }
    }

    /// Output of the previous step, used when the step declares no input.
    pub fn with_step_input(mut self, input: TargetSet) -> Self {
        self.step_input = input;
        self
    }

    pub fn with_vars(mut self, vars: Vars) -> Self {
        self.vars.extend(vars);
        self
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Reset substep-scoped state and install the group's variables.
    pub fn enter_substep(&mut self, index: usize, input: TargetSet, group_vars: &Vars) {
        self.index = index;
        self.index_value = Value::from(index as u64);
        self.input = input;
        self.output = TargetSet::unspecified();
        self.depends = TargetSet::new();
        for (k, v) in group_vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// Values of `names` plus the substep's target variables, as sent to a worker or task.
    pub fn closure<'a, I>(&self, names: I) -> Vars
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut out = Vars::new();
        for name in names {
            if let Some(Binding::Value(v)) = self.lookup(name) {
                out.insert(name.clone(), v.clone());
            }
        }
        out
    }
}

impl Namespace for ExecutionContext {
    fn lookup(&self, name: &str) -> Option<Binding<'_>> {
        match name {
            "_input" => Some(Binding::Targets(&self.input)),
            "_output" => Some(Binding::Targets(&self.output)),
            "_depends" => Some(Binding::Targets(&self.depends)),
            "step_input" => Some(Binding::Targets(&self.step_input)),
            "step_output" => Some(Binding::Targets(&self.step_output)),
            "step_depends" => Some(Binding::Targets(&self.step_depends)),
            "_index" => Some(Binding::Value(&self.index_value)),
            "step_name" => Some(Binding::Value(&self.step_name_value)),
            _ => self.vars.get(name).map(Binding::Value),
        }
    }
}

/// Expand `{name}` and `{name:spec}` references against `ns`.
///
/// `{{` and `}}` produce literal braces. Specs apply to every path-like item:
/// `n` drops the extension, `b` keeps the file name, `d` keeps the directory,
/// `bn` keeps the file stem. Lists and target sets render space-separated.
pub fn interpolate(template: &str, ns: &dyn Namespace) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    field.push(c);
                }
                if !closed {
                    return Err(StepError::validation(format!(
                        "unterminated '{{' in template '{template}'"
                    )));
                }
                let (name, spec) = match field.split_once(':') {
                    Some((n, s)) => (n.trim(), Some(s.trim())),
                    None => (field.trim(), None),
                };
                let binding = ns.lookup(name).ok_or_else(|| {
                    StepError::validation(format!(
                        "undefined variable '{name}' in template '{template}'"
                    ))
                })?;
                out.push_str(&render(binding, spec)?);
            }
            '}' => {
                return Err(StepError::validation(format!(
                    "single '}}' in template '{template}'"
                )));
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

fn render(binding: Binding<'_>, spec: Option<&str>) -> Result<String> {
    let items: Vec<String> = match binding {
        Binding::Targets(set) => set.iter().map(Target::to_string).collect(),
        Binding::Value(Value::Array(items)) => items.iter().map(scalar_text).collect(),
        Binding::Value(v) => vec![scalar_text(v)],
    };
    let items = match spec {
        None | Some("") => items,
        Some(spec) => items
            .iter()
            .map(|s| apply_spec(s, spec))
            .collect::<Result<Vec<_>>>()?,
    };
    Ok(items.join(" "))
}

pub fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn apply_spec(s: &str, spec: &str) -> Result<String> {
    let p = Path::new(s);
    let out = match spec {
        "n" => p.with_extension("").to_string_lossy().into_owned(),
        "b" => p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        "d" => p
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default(),
        "bn" => p
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        other => {
            return Err(StepError::validation(format!(
                "unsupported format spec ':{other}' (supported: n, b, d, bn)"
            )))
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("wf", "align");
        ctx.set_var("sample", json!("s1"));
        ctx.set_var("reps", json!([1, 2]));
        ctx.enter_substep(
            3,
            TargetSet::from_paths(["data/a.fastq", "data/b.fastq"]),
            &Vars::new(),
        );
        ctx
    }

    #[test]
    fn interpolates_vars_and_targets() {
        let c = ctx();
        assert_eq!(interpolate("{sample}.bam", &c).unwrap(), "s1.bam");
        assert_eq!(interpolate("{reps}", &c).unwrap(), "1 2");
        assert_eq!(
            interpolate("cat {_input} # {_index}", &c).unwrap(),
            "cat data/a.fastq data/b.fastq # 3"
        );
        assert_eq!(interpolate("{step_name}", &c).unwrap(), "align");
    }

    #[test]
    fn format_specs_apply_per_item() {
        let c = ctx();
        assert_eq!(interpolate("{_input:bn}", &c).unwrap(), "a b");
        assert_eq!(interpolate("{_input:n}", &c).unwrap(), "data/a data/b");
        assert_eq!(
            interpolate("{_input:b}", &c).unwrap(),
            "a.fastq b.fastq"
        );
        assert_eq!(interpolate("{_input:d}", &c).unwrap(), "data data");
        assert!(interpolate("{_input:zz}", &c).is_err());
    }

    #[test]
    fn braces_escape_and_errors() {
        let c = ctx();
        assert_eq!(interpolate("{{x}}", &c).unwrap(), "{x}");
        let err = interpolate("{missing}", &c).unwrap_err();
        assert!(err.to_string().contains("undefined variable 'missing'"));
        assert!(interpolate("{sample", &c).is_err());
        assert!(interpolate("a}b", &c).is_err());
    }

    #[test]
    fn closure_picks_named_values_only() {
        let c = ctx();
        let names = vec!["sample".to_string(), "nope".to_string()];
        let vars = c.closure(&names);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["sample"], json!("s1"));
    }
}
