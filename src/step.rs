use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::context::Vars;
use crate::error::{Result, StepError};
use crate::schema;
use crate::target::Target;

/// Textual marker of a nested workflow invocation inside a body.
pub const NESTED_WORKFLOW_CALL: &str = "run_workflow(";

/// A pre-parsed directive argument, evaluated against an execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Arg {
    /// Reference to a variable (or to `_input`, `step_output`, ...).
    Var { var: String },
    /// String with `{name}` interpolation.
    Format { format: String },
    Target { target: Target },
    Literal(Value),
}

impl Arg {
    pub fn literal(v: impl Into<Value>) -> Self {
        Arg::Literal(v.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Arg::Var { var: name.into() }
    }

    pub fn format(template: impl Into<String>) -> Self {
        Arg::Format {
            format: template.into(),
        }
    }

    pub fn target(t: Target) -> Self {
        Arg::Target { target: t }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveKind {
    Input,
    Output,
    Depends,
    Task,
}

impl DirectiveKind {
    pub fn name(self) -> &'static str {
        match self {
            DirectiveKind::Input => "input",
            DirectiveKind::Output => "output",
            DirectiveKind::Depends => "depends",
            DirectiveKind::Task => "task",
        }
    }

    /// Keyword options accepted by the directive.
    pub fn allowed_options(self) -> &'static [&'static str] {
        match self {
            DirectiveKind::Input => &[
                "group_by",
                "paired_with",
                "pattern",
                "group_with",
                "for_each",
                "concurrent",
            ],
            DirectiveKind::Output => &["group_by"],
            DirectiveKind::Depends => &[],
            DirectiveKind::Task => &[
                "walltime",
                "mem",
                "cores",
                "nodes",
                "trunk_size",
                "trunk_workers",
                "queue",
                "tags",
                "workdir",
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Directive {
    pub kind: DirectiveKind,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub options: BTreeMap<String, Arg>,
}

impl Directive {
    pub fn new(kind: DirectiveKind) -> Self {
        Self {
            kind,
            args: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: Arg) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Reject keyword options the directive does not know.
    pub fn check_options(&self) -> Result<()> {
        let allowed = self.kind.allowed_options();
        for key in self.options.keys() {
            if !allowed.contains(&key.as_str()) {
                let list = if allowed.is_empty() {
                    "none".to_string()
                } else {
                    allowed.join(", ")
                };
                return Err(StepError::validation(format!(
                    "unrecognized option '{key}' for {} directive (allowed: {list})",
                    self.kind.name()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Statement {
    Directive(Directive),
    Code(String),
}

/// A parsed step: directives and code statements in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub name: String,

    #[serde(default)]
    pub statements: Vec<Statement>,

    /// Variables the body reads; their values enter the run signature.
    #[serde(default)]
    pub signature_vars: BTreeSet<String>,

    /// Variables a substep exposes beyond the step.
    #[serde(default)]
    pub shared: Vec<String>,

    /// Initial variables, as handed down by the workflow.
    #[serde(default)]
    pub vars: Vars,
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statements: Vec::new(),
            signature_vars: BTreeSet::new(),
            shared: Vec::new(),
            vars: Vars::new(),
        }
    }

    pub fn directive(mut self, d: Directive) -> Self {
        self.statements.push(Statement::Directive(d));
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.statements.push(Statement::Code(code.into()));
        self
    }

    /// Load a step document from YAML, validating it against the schema first.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read step file '{}'", path.display()))?;
        schema::validate_step_yaml(&text)
            .with_context(|| format!("invalid step file '{}'", path.display()))?;
        let step: StepSpec = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse step file '{}'", path.display()))?;
        step.validate()?;
        Ok(step)
    }

    /// Structural checks that do not need a context.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StepError::validation("step name must not be empty"));
        }

        let mut seen_directive = false;
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for st in &self.statements {
            if let Statement::Directive(d) = st {
                d.check_options()?;
                if d.kind == DirectiveKind::Input && seen_directive {
                    return Err(StepError::validation(format!(
                        "step '{}': input directive must precede other directives",
                        self.name
                    )));
                }
                seen_directive = true;
                *counts.entry(d.kind.name()).or_default() += 1;
            }
        }
        for (kind, n) in counts {
            if n > 1 {
                return Err(StepError::validation(format!(
                    "step '{}' declares {n} {kind} directives (at most one allowed)",
                    self.name
                )));
            }
        }

        if let Some(pos) = self.task_position() {
            let rest = &self.statements[pos + 1..];
            if rest.len() != 1 || !matches!(rest[0], Statement::Code(_)) {
                return Err(StepError::validation(format!(
                    "step '{}': task directive must be followed by exactly one code statement",
                    self.name
                )));
            }
        }

        for name in &self.shared {
            if crate::context::is_reserved(name) {
                return Err(StepError::validation(format!(
                    "step '{}' cannot share reserved variable '{name}'",
                    self.name
                )));
            }
        }

        Ok(())
    }

    pub fn input_directive(&self) -> Option<&Directive> {
        self.directives().find(|d| d.kind == DirectiveKind::Input)
    }

    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Directive(d) => Some(d),
            Statement::Code(_) => None,
        })
    }

    fn task_position(&self) -> Option<usize> {
        self.statements.iter().position(
            |s| matches!(s, Statement::Directive(d) if d.kind == DirectiveKind::Task),
        )
    }

    pub fn has_task(&self) -> bool {
        self.task_position().is_some()
    }

    pub fn code_statement_count(&self) -> usize {
        self.statements
            .iter()
            .filter(|s| matches!(s, Statement::Code(_)))
            .count()
    }

    /// Index of the statement that forms the substep body: the last code
    /// statement, provided no directive follows it.
    pub fn body_position(&self) -> Option<usize> {
        match self.statements.last() {
            Some(Statement::Code(_)) => Some(self.statements.len() - 1),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        self.body_position().and_then(|i| match &self.statements[i] {
            Statement::Code(c) => Some(c.as_str()),
            Statement::Directive(_) => None,
        })
    }

    pub fn invokes_nested_workflow(&self) -> bool {
        self.statements
            .iter()
            .any(|s| matches!(s, Statement::Code(c) if c.contains(NESTED_WORKFLOW_CALL)))
    }

    pub fn concurrent_requested(&self) -> bool {
        self.input_directive()
            .and_then(|d| d.options.get("concurrent"))
            .map(|a| matches!(a, Arg::Literal(Value::Bool(true))))
            .unwrap_or(false)
    }

    /// Stable hash of the step's content; initial variable values are excluded
    /// because they enter signatures through `signature_vars`.
    pub fn content_hash(&self) -> Result<String> {
        let mut value = serde_json::json!({
            "name": self.name,
            "statements": self.statements,
            "signature_vars": self.signature_vars,
            "shared": self.shared,
        });
        sort_value(&mut value);
        let bytes = serde_json::to_vec(&value).context("failed to serialize step content")?;
        let mut h = Sha256::new();
        h.update(&bytes);
        Ok(format!("{:x}", h.finalize()))
    }
}

/// Recursively sort object keys so serialization is deterministic.
pub fn sort_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (k, mut v) in std::mem::take(map) {
                sort_value(&mut v);
                sorted.insert(k, v);
            }
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            *map = out;
        }
        Value::Array(items) => {
            for item in items {
                sort_value(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StepSpec {
        StepSpec::new("count")
            .directive(
                Directive::new(DirectiveKind::Input)
                    .arg(Arg::literal("a.txt"))
                    .option("group_by", Arg::literal("single"))
                    .option("concurrent", Arg::literal(true)),
            )
            .directive(Directive::new(DirectiveKind::Output).arg(Arg::format("{_input}.n")))
            .code("wc -l {_input} > {_output}")
    }

    #[test]
    fn body_is_trailing_code() {
        let step = sample();
        step.validate().unwrap();
        assert_eq!(step.body(), Some("wc -l {_input} > {_output}"));
        assert!(step.concurrent_requested());
        assert!(!step.has_task());
        assert_eq!(step.code_statement_count(), 1);
    }

    #[test]
    fn unknown_option_lists_allowed_set() {
        let step = StepSpec::new("s").directive(
            Directive::new(DirectiveKind::Depends).option("group_by", Arg::literal(1)),
        );
        let err = step.validate().unwrap_err().to_string();
        assert!(err.contains("unrecognized option 'group_by'"), "{err}");
        assert!(err.contains("allowed: none"), "{err}");

        let step = StepSpec::new("s")
            .directive(Directive::new(DirectiveKind::Task).option("colour", Arg::literal("red")));
        let err = step.validate().unwrap_err().to_string();
        assert!(err.contains("walltime"), "{err}");
    }

    #[test]
    fn task_must_end_with_single_code_statement() {
        let step = StepSpec::new("s").directive(Directive::new(DirectiveKind::Task));
        assert!(step.validate().is_err());

        let step = StepSpec::new("s")
            .directive(Directive::new(DirectiveKind::Task))
            .code("echo hi");
        step.validate().unwrap();
        assert!(step.has_task());
    }

    #[test]
    fn input_after_output_is_rejected() {
        let step = StepSpec::new("s")
            .directive(Directive::new(DirectiveKind::Output).arg(Arg::literal("x")))
            .directive(Directive::new(DirectiveKind::Input));
        let err = step.validate().unwrap_err().to_string();
        assert!(err.contains("must precede"), "{err}");
    }

    #[test]
    fn content_hash_ignores_initial_values() {
        let a = sample();
        let mut b = sample();
        b.vars.insert("x".into(), serde_json::json!(1));
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());

        let c = sample().code("echo more");
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn nested_workflow_marker_is_detected() {
        let step = StepSpec::new("s").code("run_workflow('sub')");
        assert!(step.invokes_nested_workflow());
    }

    #[test]
    fn args_deserialize_from_yaml_shapes() {
        let yaml = r#"
- "plain.txt"
- var: samples
- format: "{_input:bn}.out"
- target:
    executable: sh
- 3
"#;
        let args: Vec<Arg> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(args[0], Arg::literal("plain.txt"));
        assert_eq!(args[1], Arg::var("samples"));
        assert_eq!(args[2], Arg::format("{_input:bn}.out"));
        assert_eq!(args[3], Arg::target(Target::Executable("sh".into())));
        assert_eq!(args[4], Arg::literal(3));
    }
}
