use anyhow::{anyhow, Context, Result};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use schemars::schema_for;
use serde_json::Value as JsonValue;

/// Schema generated directly from the Rust step structs, so documents and
/// types cannot drift apart.
static STEP_SCHEMA_GENERATED: Lazy<JsonValue> = Lazy::new(|| {
    let schema = schema_for!(crate::step::StepSpec);
    serde_json::to_value(&schema).expect("schemars schema must serialize to JSON")
});

/// Generated schema with `name` required and unknown top-level keys rejected.
static STEP_SCHEMA_STRICT: Lazy<JSONSchema> = Lazy::new(|| {
    let mut schema_json = STEP_SCHEMA_GENERATED.clone();

    if let Some(obj) = schema_json.as_object_mut() {
        obj.insert("additionalProperties".to_string(), JsonValue::Bool(false));
        obj.insert(
            "required".to_string(),
            JsonValue::Array(vec![JsonValue::String("name".to_string())]),
        );
    }

    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_json)
        .expect("failed to compile strict step JSON schema")
});

/// Validate a step YAML document before deserializing it.
pub fn validate_step_yaml(yaml_text: &str) -> Result<()> {
    let yaml_value: serde_yaml::Value =
        serde_yaml::from_str(yaml_text).context("parse yaml into Value")?;
    let json_value: JsonValue =
        serde_json::to_value(&yaml_value).context("convert yaml value to json value")?;

    let compiled = &*STEP_SCHEMA_STRICT;

    // `validate()` borrows `json_value`; collect messages before it is dropped.
    let result: Result<()> = match compiled.validate(&json_value) {
        Ok(()) => Ok(()),
        Err(err_iter) => {
            let mut msgs: Vec<String> = Vec::new();
            for (i, e) in err_iter.enumerate() {
                if i >= 10 {
                    msgs.push("... (more schema errors omitted)".to_string());
                    break;
                }
                let instance_path = e.instance_path.to_string();
                let path = if instance_path.is_empty() {
                    "/".to_string()
                } else {
                    instance_path
                };
                msgs.push(format!("at {path}: {e}"));
            }
            Err(anyhow!("step schema validation failed:\n{}", msgs.join("\n")))
        }
    };

    result
}

/// Generated schema, for `--print-schema` style output.
pub fn step_schema_json() -> &'static JsonValue {
    &STEP_SCHEMA_GENERATED
}
